//! The [`Observer`]: a cancellable, timeout-bounded task attached to a live
//! text connection.
//!
//! An observer owns nothing about I/O. The connection feeds it raw chunks,
//! the line buffer turns those into lines, and a [`LineHandler`] (the command
//! or event specific part) decides when the observer is finished. Completion
//! is exactly-once: the first `set_result`/`set_error`/`cancel` wins and
//! later writers are silent no-ops.

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::linebuffer::LineBuffer;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// The structured result an observer produces: an ordered string→value map.
pub type ObserverResult = Map<String, Value>;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// What a handler did with a delivered line. Never escapes the observer
/// boundary; it only short-circuits the handler-internal matching chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineOutcome {
    Handled,
    Unhandled,
}

/// Time budgets for one observer run.
#[derive(Debug, Clone, Copy)]
pub struct ObserverOptions {
    /// Nominal budget. Default 20s.
    pub timeout: Duration,
    /// Fires `on_inactivity` when no data arrives for this long. Zero
    /// disables the watchdog.
    pub inactivity_timeout: Duration,
    /// Extra grace window granted after the nominal timeout, giving the
    /// handler a last chance to recover. Zero means fail immediately.
    pub terminating_timeout: Duration,
}

impl Default for ObserverOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            inactivity_timeout: Duration::ZERO,
            terminating_timeout: Duration::ZERO,
        }
    }
}

/// Timing fields of a running observer, readable for diagnostics.
#[derive(Debug, Clone, Copy, Default)]
pub struct LifeStatus {
    pub start_time: Option<Instant>,
    pub last_feed_time: Option<Instant>,
    pub in_terminating: bool,
    pub terminating_since: Option<Instant>,
    pub was_on_timeout_called: bool,
}

/// The command/event specific half of an observer.
///
/// All callbacks run serialized under the observer's feed lock, so
/// implementations can keep plain mutable state. `on_line` receives both
/// complete lines (`is_full = true`) and the growing partial tail.
pub trait LineHandler: Send {
    /// Called once from `start()`, before any data is delivered. Commands
    /// send their command string here. Errors propagate to the caller of
    /// `start` (this is the controlling context, not the I/O path).
    fn on_start(&mut self, _obs: &Observer) -> Result<()> {
        Ok(())
    }

    fn on_line(&mut self, obs: &Observer, line: &str, is_full: bool) -> Result<LineOutcome>;

    /// Nominal timeout elapsed and a terminating grace window is open (or
    /// about to close). A handler may e.g. send a newline to coax out a
    /// prompt. Called at most once.
    fn on_timeout(&mut self, _obs: &Observer) {}

    /// No data arrived for `inactivity_timeout`. Re-armed after each call.
    fn on_inactivity(&mut self, _obs: &Observer) {}

    fn on_connection_lost(&mut self, obs: &Observer) {
        obs.set_error(Error::ConnectionGone);
    }
}

enum Outcome {
    Pending,
    Done(ObserverResult),
    Failed(Error),
}

struct LifeState {
    outcome: Outcome,
    cancelled: bool,
    options: ObserverOptions,
    status: LifeStatus,
}

struct FeedState {
    buffer: LineBuffer,
    handler: Box<dyn LineHandler>,
}

/// See the module docs. Always handled as `Arc<Observer>`; the connection
/// holds one clone per registration, the runner another.
pub struct Observer {
    id: u64,
    name: String,
    conn: Weak<Connection>,
    // Lifecycle fields shared between the I/O path and the runner. This is
    // the only lock both sides take.
    life: Mutex<LifeState>,
    // Serializes line delivery and handler callbacks.
    feed_state: Mutex<FeedState>,
    started: AtomicBool,
}

impl Observer {
    pub fn new(
        name: impl Into<String>,
        conn: &Arc<Connection>,
        handler: Box<dyn LineHandler>,
        options: ObserverOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            conn: Arc::downgrade(conn),
            life: Mutex::new(LifeState {
                outcome: Outcome::Pending,
                cancelled: false,
                options,
                status: LifeStatus::default(),
            }),
            feed_state: Mutex::new(FeedState {
                buffer: LineBuffer::new(conn.line_ending()),
                handler,
            }),
            started: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// NEW → RUNNING: records the start time, registers with the connection
    /// and runs the handler's `on_start` hook. Refuses a second call and
    /// refuses an observer that was already cancelled.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled(self.name.clone()));
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted(self.name.clone()));
        }
        let conn = self.conn.upgrade().ok_or(Error::ConnectionGone)?;
        {
            let mut life = self.life.lock().unwrap();
            let now = Instant::now();
            life.status.start_time = Some(now);
            life.status.last_feed_time = Some(now);
        }
        conn.register(self.clone());
        debug!(observer = %self.name, id = self.id, "started");
        let res = self.feed_state.lock().unwrap().handler.on_start(self);
        if res.is_err() {
            // Misuse from the controlling context propagates to the caller,
            // but the observer must not stay half-registered.
            self.cancel();
        }
        res
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Deliver one raw chunk from the connection. Never blocks for long: the
    /// handler chain is synchronous line matching.
    ///
    /// Handler faults are captured as this observer's error instead of
    /// propagating out of the data-delivery path.
    pub fn feed(&self, chunk: &[u8], received_at: Instant) {
        if self.outcome().is_some() {
            return;
        }
        let mut feed = self.feed_state.lock().unwrap();
        self.life.lock().unwrap().status.last_feed_time = Some(received_at);
        for line in feed.buffer.feed(chunk) {
            if self.outcome().is_some() {
                break;
            }
            trace!(observer = %self.name, line = %line.text, full = line.is_full, "line");
            match feed.handler.on_line(self, &line.text, line.is_full) {
                Ok(LineOutcome::Handled) | Ok(LineOutcome::Unhandled) => {}
                Err(err) => {
                    debug!(observer = %self.name, %err, "handler fault captured");
                    self.set_error(err);
                }
            }
        }
    }

    /// Record the result. First writer wins; no-op once done or cancelled.
    pub fn set_result(&self, result: ObserverResult) {
        let mut life = self.life.lock().unwrap();
        if life.cancelled || !matches!(life.outcome, Outcome::Pending) {
            trace!(observer = %self.name, "late result dropped");
            return;
        }
        life.outcome = Outcome::Done(result);
        drop(life);
        debug!(observer = %self.name, "done");
        self.detach();
    }

    /// Record the error. Same first-writer-wins rules as [`set_result`](Self::set_result).
    pub fn set_error(&self, err: Error) {
        let mut life = self.life.lock().unwrap();
        if life.cancelled || !matches!(life.outcome, Outcome::Pending) {
            trace!(observer = %self.name, "late error dropped");
            return;
        }
        life.outcome = Outcome::Failed(err);
        drop(life);
        self.detach();
    }

    /// Cooperative cancellation: sticky, and never overwritten by an
    /// in-flight feed that completes afterwards.
    pub fn cancel(&self) {
        {
            let mut life = self.life.lock().unwrap();
            if !matches!(life.outcome, Outcome::Pending) || life.cancelled {
                return;
            }
            life.cancelled = true;
        }
        debug!(observer = %self.name, "cancelled");
        self.detach();
    }

    pub fn is_done(&self) -> bool {
        matches!(
            self.life.lock().unwrap().outcome,
            Outcome::Done(_) | Outcome::Failed(_)
        )
    }

    pub fn is_cancelled(&self) -> bool {
        self.life.lock().unwrap().cancelled
    }

    pub fn result(&self) -> Option<ObserverResult> {
        match &self.life.lock().unwrap().outcome {
            Outcome::Done(r) => Some(r.clone()),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<Error> {
        match &self.life.lock().unwrap().outcome {
            Outcome::Failed(e) => Some(e.clone()),
            _ => None,
        }
    }

    /// `None` while still pending; otherwise the final result or error, with
    /// cancellation surfaced as [`Error::Cancelled`].
    pub fn outcome(&self) -> Option<Result<ObserverResult>> {
        let life = self.life.lock().unwrap();
        match &life.outcome {
            Outcome::Done(r) => Some(Ok(r.clone())),
            Outcome::Failed(e) => Some(Err(e.clone())),
            Outcome::Pending if life.cancelled => {
                Some(Err(Error::Cancelled(self.name.clone())))
            }
            Outcome::Pending => None,
        }
    }

    pub fn life_status(&self) -> LifeStatus {
        self.life.lock().unwrap().status
    }

    pub fn options(&self) -> ObserverOptions {
        self.life.lock().unwrap().options
    }

    /// Override the nominal budget. Effective before `start()`; the device
    /// state machine uses this to apply per-hop budgets.
    pub fn set_timeout(&self, timeout: Duration) {
        self.life.lock().unwrap().options.timeout = timeout;
    }

    /// Send raw bytes out through the owning connection.
    pub fn send(&self, data: &[u8]) -> Result<()> {
        self.conn.upgrade().ok_or(Error::ConnectionGone)?.send(data)
    }

    /// Send a line, appending the connection's line terminator.
    pub fn send_line(&self, line: &str) -> Result<()> {
        self.conn
            .upgrade()
            .ok_or(Error::ConnectionGone)?
            .send_line(line)
    }

    /// Timeout/inactivity bookkeeping, driven by the runner's polling loop
    /// (never by the I/O thread). Lock order: the life lock is released
    /// before any handler hook runs.
    pub(crate) fn check_timers(&self, now: Instant) {
        let mut fire_timeout_hook = false;
        let mut fire_inactivity = false;
        let mut timed_out: Option<Duration> = None;
        {
            let mut life = self.life.lock().unwrap();
            if life.cancelled || !matches!(life.outcome, Outcome::Pending) {
                return;
            }
            let Some(start) = life.status.start_time else {
                return;
            };
            let nominal = life.options.timeout;
            let grace = life.options.terminating_timeout;
            if life.status.in_terminating {
                let since = life.status.terminating_since.unwrap_or(start);
                if now.duration_since(since) >= grace {
                    timed_out = Some(nominal + grace);
                }
            } else if now.duration_since(start) >= nominal {
                if grace > Duration::ZERO {
                    life.status.in_terminating = true;
                    life.status.terminating_since = Some(now);
                    if !life.status.was_on_timeout_called {
                        life.status.was_on_timeout_called = true;
                        fire_timeout_hook = true;
                    }
                } else {
                    life.status.was_on_timeout_called = true;
                    timed_out = Some(nominal);
                }
            }
            if timed_out.is_none()
                && life.options.inactivity_timeout > Duration::ZERO
                && !life.status.in_terminating
            {
                if let Some(last) = life.status.last_feed_time {
                    if now.duration_since(last) >= life.options.inactivity_timeout {
                        life.status.last_feed_time = Some(now);
                        fire_inactivity = true;
                    }
                }
            }
        }
        if let Some(after) = timed_out {
            debug!(observer = %self.name, ?after, "timed out");
            self.set_error(Error::Timeout {
                name: self.name.clone(),
                after,
            });
            return;
        }
        if fire_timeout_hook {
            debug!(observer = %self.name, "entering terminating grace window");
            self.feed_state.lock().unwrap().handler.on_timeout(self);
        }
        if fire_inactivity {
            self.feed_state.lock().unwrap().handler.on_inactivity(self);
        }
    }

    /// Forwarded by the connection when the stream drops.
    pub(crate) fn connection_lost(&self) {
        if self.outcome().is_some() {
            return;
        }
        let mut feed = self.feed_state.lock().unwrap();
        feed.handler.on_connection_lost(self);
    }

    fn detach(&self) {
        if let Some(conn) = self.conn.upgrade() {
            conn.unregister(self.id);
        }
    }
}

impl std::fmt::Debug for Observer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observer")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("done", &self.is_done())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::linebuffer::LineEnding;
    use serde_json::json;

    struct Collect {
        lines: Vec<(String, bool)>,
        finish_on: Option<String>,
    }

    impl LineHandler for Collect {
        fn on_line(&mut self, obs: &Observer, line: &str, is_full: bool) -> Result<LineOutcome> {
            self.lines.push((line.to_string(), is_full));
            if let Some(marker) = &self.finish_on {
                if is_full && line == marker {
                    let mut ret = ObserverResult::new();
                    ret.insert("marker".into(), json!(line));
                    obs.set_result(ret);
                    return Ok(LineOutcome::Handled);
                }
            }
            Ok(LineOutcome::Unhandled)
        }
    }

    fn collector(finish_on: Option<&str>) -> (Arc<Observer>, Arc<Connection>) {
        let (conn, _sent) = Connection::loopback(LineEnding::Lf);
        let obs = Observer::new(
            "collect",
            &conn,
            Box::new(Collect {
                lines: Vec::new(),
                finish_on: finish_on.map(String::from),
            }),
            ObserverOptions::default(),
        );
        (obs, conn)
    }

    #[test]
    fn test_start_twice_fails() {
        let (obs, _conn) = collector(None);
        obs.start().unwrap();
        assert!(matches!(obs.start(), Err(Error::AlreadyStarted(_))));
    }

    #[test]
    fn test_cancel_before_start_refuses_start() {
        let (obs, _conn) = collector(None);
        obs.cancel();
        assert!(matches!(obs.start(), Err(Error::Cancelled(_))));
        assert!(!obs.is_started());
    }

    #[test]
    fn test_result_is_exactly_once() {
        let (obs, _conn) = collector(None);
        let mut first = ObserverResult::new();
        first.insert("n".into(), json!(1));
        obs.set_result(first);
        let mut second = ObserverResult::new();
        second.insert("n".into(), json!(2));
        obs.set_result(second);
        assert_eq!(obs.result().unwrap()["n"], json!(1));
    }

    #[test]
    fn test_result_and_error_exclusive() {
        let (obs, _conn) = collector(None);
        obs.set_error(Error::CommandFailure("boom".into()));
        obs.set_result(ObserverResult::new());
        assert!(obs.result().is_none());
        assert!(matches!(obs.error(), Some(Error::CommandFailure(_))));
    }

    #[test]
    fn test_cancellation_wins_over_late_result() {
        let (obs, _conn) = collector(None);
        obs.cancel();
        obs.set_result(ObserverResult::new());
        assert!(obs.is_cancelled());
        assert!(!obs.is_done());
        assert!(obs.result().is_none());
        assert!(matches!(obs.outcome(), Some(Err(Error::Cancelled(_)))));
    }

    #[test]
    fn test_feed_after_done_is_ignored() {
        let (obs, _conn) = collector(Some("end"));
        obs.feed(b"noise\nend\nmore\n", Instant::now());
        assert!(obs.is_done());
        assert_eq!(obs.result().unwrap()["marker"], json!("end"));
    }

    #[test]
    fn test_timer_fires_timeout() {
        let (obs, _conn) = collector(None);
        obs.set_timeout(Duration::from_millis(10));
        {
            let mut life = obs.life.lock().unwrap();
            life.status.start_time = Some(Instant::now() - Duration::from_millis(50));
        }
        obs.check_timers(Instant::now());
        assert!(matches!(obs.error(), Some(Error::Timeout { .. })));
    }

    #[test]
    fn test_inactivity_watchdog_rearms() {
        use std::sync::atomic::AtomicU32;

        struct Nudge {
            count: Arc<AtomicU32>,
        }

        impl LineHandler for Nudge {
            fn on_line(&mut self, _: &Observer, _: &str, _: bool) -> Result<LineOutcome> {
                Ok(LineOutcome::Unhandled)
            }

            fn on_inactivity(&mut self, _obs: &Observer) {
                self.count.fetch_add(1, Ordering::SeqCst);
            }
        }

        let (conn, _sent) = Connection::loopback(LineEnding::Lf);
        let count = Arc::new(AtomicU32::new(0));
        let obs = Observer::new(
            "nudge",
            &conn,
            Box::new(Nudge {
                count: count.clone(),
            }),
            ObserverOptions {
                timeout: Duration::from_secs(60),
                inactivity_timeout: Duration::from_millis(10),
                ..Default::default()
            },
        );
        {
            let mut life = obs.life.lock().unwrap();
            let past = Instant::now() - Duration::from_millis(50);
            life.status.start_time = Some(past);
            life.status.last_feed_time = Some(past);
        }
        obs.check_timers(Instant::now());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        // Re-armed, not repeating: quiet for another interval first.
        obs.check_timers(Instant::now());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        obs.check_timers(Instant::now() + Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_terminating_window_defers_timeout() {
        let (obs, _conn) = collector(Some("late"));
        {
            let mut life = obs.life.lock().unwrap();
            life.options.timeout = Duration::from_millis(10);
            life.options.terminating_timeout = Duration::from_millis(500);
            life.status.start_time = Some(Instant::now() - Duration::from_millis(50));
        }
        obs.check_timers(Instant::now());
        assert!(!obs.is_done());
        assert!(obs.life_status().in_terminating);
        assert!(obs.life_status().was_on_timeout_called);
        // A completion landing inside the grace window still wins.
        obs.feed(b"late\n", Instant::now());
        assert!(obs.result().is_some());
    }
}
