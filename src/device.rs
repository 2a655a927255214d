//! The device state machine: a named-state graph where every edge is a list
//! of commands to run, with pathfinding, per-hop time budgets and retry.
//!
//! A [`Device`] represents "which shell/prompt context this session is
//! currently in". Transitions are computed as the shortest path by edge
//! count; ties break by edge-declaration order, which the `IndexMap`-backed
//! graph makes deterministic.

use crate::connection::Connection;
use crate::error::{DeviceFailure, Error, Result};
use crate::observer::{Observer, ObserverResult};
use crate::runner::Runner;
use indexmap::IndexMap;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Builds the command(s) labelling one state-graph edge.
pub type EdgeFactory = Arc<dyn Fn(&Device) -> Arc<Observer> + Send + Sync>;

/// Named parameters passed to registered command/event factories.
pub type Params = Map<String, Value>;

/// Builds a registered, named command or event from call-site parameters.
pub type NamedFactory = Arc<dyn Fn(&Device, &Params) -> Result<Arc<Observer>> + Send + Sync>;

/// Hops whose fair share of the remaining budget falls below this floor get
/// the floor instead, so earlier overruns cannot starve later hops.
pub const MIN_HOP_BUDGET: Duration = Duration::from_millis(200);

/// Knobs for [`Device::goto_state`].
#[derive(Clone)]
pub struct GotoOptions {
    /// Shared budget for the whole transition, divided across hops.
    pub timeout: Duration,
    /// Additional complete path attempts after the first one fails.
    pub rerun: u32,
    /// Send a bare line after each hop to refresh the prompt.
    pub send_enter_after_change: bool,
    /// Remember the target and steer back to it when external drift is
    /// reported later.
    pub keep_state: bool,
}

impl Default for GotoOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            rerun: 0,
            send_enter_after_change: false,
            keep_state: false,
        }
    }
}

struct NamedEntry {
    factory: NamedFactory,
}

/// See the module docs. Long-lived for the session; handled as `Arc<Device>`.
pub struct Device {
    // Internal name may be rewritten to dodge log collisions; the public
    // alias never changes once set.
    name: Mutex<String>,
    public_name: String,
    initial_state: String,
    conn: Arc<Connection>,
    runner: Arc<Runner>,
    graph: IndexMap<String, IndexMap<String, Vec<EdgeFactory>>>,
    commands: HashMap<String, NamedEntry>,
    events: HashMap<String, NamedEntry>,
    prompt: regex::Regex,
    current_state: Mutex<String>,
    desired_state: Mutex<Option<String>>,
    neighbours: Mutex<Vec<Weak<Device>>>,
    removal_hooks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    outstanding: Mutex<Vec<Weak<Observer>>>,
    removed: AtomicBool,
}

/// Declarative device construction: states, transitions, named factories.
pub struct DeviceBuilder {
    name: String,
    public_name: Option<String>,
    initial_state: String,
    graph: IndexMap<String, IndexMap<String, Vec<EdgeFactory>>>,
    commands: HashMap<String, NamedEntry>,
    events: HashMap<String, NamedEntry>,
    prompt: regex::Regex,
}

impl DeviceBuilder {
    pub fn new(name: impl Into<String>, initial_state: impl Into<String>) -> Self {
        let name = name.into();
        let initial_state = initial_state.into();
        let mut graph = IndexMap::new();
        graph.insert(initial_state.clone(), IndexMap::new());
        Self {
            name,
            public_name: None,
            initial_state,
            graph,
            commands: HashMap::new(),
            events: HashMap::new(),
            prompt: regex::Regex::new(r"[$#>] ?$").unwrap(),
        }
    }

    /// Stable external alias. Defaults to the internal name.
    pub fn public_name(mut self, public_name: impl Into<String>) -> Self {
        self.public_name = Some(public_name.into());
        self
    }

    /// The shell prompt of this device, used by registered command factories.
    pub fn prompt(mut self, prompt: regex::Regex) -> Self {
        self.prompt = prompt;
        self
    }

    /// Add a vertex without edges.
    pub fn state(mut self, name: impl Into<String>) -> Self {
        self.graph.entry(name.into()).or_default();
        self
    }

    /// Add a directed edge `from -> to` labelled with the commands to run,
    /// in order, to traverse it. Declaration order is the tie-break order
    /// for equal-length paths.
    pub fn transition(
        mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        factories: Vec<EdgeFactory>,
    ) -> Self {
        let to = to.into();
        self.graph.entry(to.clone()).or_default();
        self.graph
            .entry(from.into())
            .or_default()
            .insert(to, factories);
        self
    }

    pub fn command(mut self, name: impl Into<String>, factory: NamedFactory) -> Self {
        self.commands.insert(name.into(), NamedEntry { factory });
        self
    }

    pub fn event(mut self, name: impl Into<String>, factory: NamedFactory) -> Self {
        self.events.insert(name.into(), NamedEntry { factory });
        self
    }

    pub fn build(self, conn: Arc<Connection>, runner: Arc<Runner>) -> Arc<Device> {
        let public_name = self.public_name.unwrap_or_else(|| self.name.clone());
        let device = Arc::new(Device {
            name: Mutex::new(self.name),
            public_name,
            initial_state: self.initial_state.clone(),
            conn: conn.clone(),
            runner,
            graph: self.graph,
            commands: self.commands,
            events: self.events,
            prompt: self.prompt,
            current_state: Mutex::new(self.initial_state),
            desired_state: Mutex::new(None),
            neighbours: Mutex::new(Vec::new()),
            removal_hooks: Mutex::new(Vec::new()),
            outstanding: Mutex::new(Vec::new()),
            removed: AtomicBool::new(false),
        });
        // External disconnect is state drift: the session is back at its
        // entry context, and a kept target is re-approached on reconnect.
        let drift = Arc::downgrade(&device);
        conn.on_connection_lost(move || {
            if let Some(dev) = drift.upgrade() {
                dev.on_external_disconnect();
            }
        });
        let reconcile = Arc::downgrade(&device);
        conn.on_connection_made(move || {
            if let Some(dev) = reconcile.upgrade() {
                dev.reconcile_kept_state();
            }
        });
        device
    }
}

impl Device {
    pub fn name(&self) -> String {
        self.name.lock().unwrap().clone()
    }

    /// Rewrite the internal name (e.g. to de-collide log streams). The
    /// public name is untouched.
    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.lock().unwrap() = name.into();
    }

    pub fn public_name(&self) -> &str {
        &self.public_name
    }

    pub fn current_state(&self) -> String {
        self.current_state.lock().unwrap().clone()
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn runner(&self) -> &Arc<Runner> {
        &self.runner
    }

    pub fn prompt(&self) -> &regex::Regex {
        &self.prompt
    }

    fn is_known_state(&self, state: &str) -> bool {
        self.graph.contains_key(state)
    }

    /// Shortest path by edge count from `from` to `to`; `None` when
    /// unreachable. BFS over the insertion-ordered graph, so equal-length
    /// paths resolve to the earliest-declared edges.
    fn find_path(&self, from: &str, to: &str) -> Option<Vec<(String, String)>> {
        let mut prev: HashMap<&str, &str> = HashMap::new();
        let mut seen: HashSet<&str> = HashSet::from([from]);
        let mut queue: VecDeque<&str> = VecDeque::from([from]);
        while let Some(state) = queue.pop_front() {
            if state == to {
                let mut edges = Vec::new();
                let mut at = to;
                while at != from {
                    let p = prev[at];
                    edges.push((p.to_string(), at.to_string()));
                    at = p;
                }
                edges.reverse();
                return Some(edges);
            }
            let Some(targets) = self.graph.get(state) else {
                continue;
            };
            for target in targets.keys() {
                if seen.insert(target.as_str()) {
                    prev.insert(target.as_str(), state);
                    queue.push_back(target.as_str());
                }
            }
        }
        None
    }

    /// Drive the session to `target`. See the module docs for the path and
    /// budget policy; `opts.rerun` extra complete attempts are made, each
    /// recomputed from the revalidated current state.
    pub async fn goto_state(self: &Arc<Self>, target: &str, opts: GotoOptions) -> Result<()> {
        if !self.is_known_state(target) {
            return Err(DeviceFailure::UnknownState(target.to_string()).into());
        }
        // The most recent explicit request always wins: a plain goto clears
        // any previously kept target.
        *self.desired_state.lock().unwrap() = opts.keep_state.then(|| target.to_string());
        let origin = self.current_state();
        if origin == target {
            debug!(device = %self.public_name, state = %target, "already in target state");
            return Ok(());
        }
        let deadline = Instant::now() + opts.timeout;
        let attempts = opts.rerun + 1;
        let mut last_failure = String::new();
        for attempt in 1..=attempts {
            let from = self.current_state();
            if from == target {
                return Ok(());
            }
            let Some(path) = self.find_path(&from, target) else {
                return Err(DeviceFailure::NoPathFound {
                    from,
                    to: target.to_string(),
                }
                .into());
            };
            debug!(
                device = %self.public_name,
                %from, to = %target, attempt, hops = path.len(), "walking transition path"
            );
            match self
                .walk_path(&path, deadline, opts.send_enter_after_change)
                .await
            {
                Ok(()) => {
                    info!(device = %self.public_name, state = %target, "state reached");
                    return Ok(());
                }
                Err(err) => {
                    warn!(device = %self.public_name, attempt, %err, "transition attempt failed");
                    // A mid-path failure may have dumped the session
                    // anywhere; fall back to the last externally verified
                    // state and let the next attempt recompute from there.
                    *self.current_state.lock().unwrap() = from.clone();
                    last_failure = err.to_string();
                    // Rerunning only helps for failures another attempt
                    // might outwait; anything else fails now.
                    if !err.is_transient() {
                        return Err(DeviceFailure::TransitionFailed {
                            from: origin.clone(),
                            to: target.to_string(),
                            attempts: attempt,
                            cause: last_failure,
                        }
                        .into());
                    }
                }
            }
        }
        Err(DeviceFailure::TransitionFailed {
            from: origin,
            to: target.to_string(),
            attempts,
            cause: last_failure,
        }
        .into())
    }

    async fn walk_path(
        self: &Arc<Self>,
        path: &[(String, String)],
        deadline: Instant,
        send_enter: bool,
    ) -> Result<()> {
        let total = path.len();
        for (i, (from, to)) in path.iter().enumerate() {
            let hops_left = (total - i) as u32;
            let remaining = deadline.saturating_duration_since(Instant::now());
            let budget = std::cmp::max(remaining / hops_left, MIN_HOP_BUDGET);
            let factories = &self.graph[from][to];
            for factory in factories {
                let cmd = factory(self);
                cmd.set_timeout(budget);
                self.track(&cmd);
                self.runner.submit(&cmd)?;
                self.runner.wait(&cmd).await?;
            }
            *self.current_state.lock().unwrap() = to.clone();
            debug!(device = %self.public_name, state = %to, "hop complete");
            if send_enter {
                self.conn.send_line("")?;
            }
        }
        Ok(())
    }

    /// Report state drift observed outside `goto_state` (an event fired, a
    /// log line showed an unexpected prompt, ...). If a kept target exists
    /// and the drift moved away from it, an implicit `goto_state` back is
    /// scheduled on the current runtime.
    pub fn note_external_state(self: &Arc<Self>, state: &str) -> Result<()> {
        if !self.is_known_state(state) {
            return Err(DeviceFailure::UnknownState(state.to_string()).into());
        }
        {
            let mut current = self.current_state.lock().unwrap();
            if *current == state {
                return Ok(());
            }
            warn!(device = %self.public_name, from = %*current, to = %state, "external state drift");
            *current = state.to_string();
        }
        self.reconcile_kept_state();
        Ok(())
    }

    fn on_external_disconnect(self: &Arc<Self>) {
        let mut current = self.current_state.lock().unwrap();
        if *current != self.initial_state {
            warn!(
                device = %self.public_name,
                from = %*current, to = %self.initial_state, "disconnected, state reset"
            );
            *current = self.initial_state.clone();
        }
    }

    fn reconcile_kept_state(self: &Arc<Self>) {
        let desired = self.desired_state.lock().unwrap().clone();
        let Some(target) = desired else { return };
        if target == self.current_state() || self.removed.load(Ordering::SeqCst) {
            return;
        }
        // Scheduling needs a runtime; outside one (e.g. the reader thread
        // during teardown) the next explicit call reconciles instead.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        info!(device = %self.public_name, state = %target, "scheduling implicit goto back to kept state");
        let device = self.clone();
        handle.spawn(async move {
            let opts = GotoOptions {
                keep_state: true,
                ..Default::default()
            };
            if let Err(err) = device.goto_state(&target, opts).await {
                warn!(device = %device.public_name, %err, "kept-state reconciliation failed");
            }
        });
    }

    /// Instantiate a registered command. With `check_state`, fails unless
    /// the device is currently in `for_state`.
    pub fn get_command(
        &self,
        name: &str,
        params: &Params,
        check_state: bool,
        for_state: Option<&str>,
    ) -> Result<Arc<Observer>> {
        self.check_for_state(check_state, for_state)?;
        let entry = self
            .commands
            .get(name)
            .ok_or_else(|| Error::UnknownName(name.to_string()))?;
        let obs = (entry.factory)(self, params)?;
        self.track(&obs);
        Ok(obs)
    }

    /// Instantiate a registered event. Same state check as [`get_command`](Self::get_command).
    pub fn get_event(
        &self,
        name: &str,
        params: &Params,
        check_state: bool,
        for_state: Option<&str>,
    ) -> Result<Arc<Observer>> {
        self.check_for_state(check_state, for_state)?;
        let entry = self
            .events
            .get(name)
            .ok_or_else(|| Error::UnknownName(name.to_string()))?;
        let obs = (entry.factory)(self, params)?;
        self.track(&obs);
        Ok(obs)
    }

    /// Blocking convenience wrapper: instantiate, submit and wait.
    pub async fn run(&self, name: &str, params: &Params) -> Result<ObserverResult> {
        let obs = self.get_command(name, params, false, None)?;
        self.runner.submit(&obs)?;
        self.runner.wait(&obs).await
    }

    /// Instantiate and submit, returning the running observer handle.
    pub fn start(&self, name: &str, params: &Params) -> Result<Arc<Observer>> {
        let obs = self.get_command(name, params, false, None)?;
        self.runner.submit(&obs)?;
        Ok(obs)
    }

    fn check_for_state(&self, check_state: bool, for_state: Option<&str>) -> Result<()> {
        if !check_state {
            return Ok(());
        }
        let Some(required) = for_state else {
            return Ok(());
        };
        let current = self.current_state();
        if current != required {
            return Err(DeviceFailure::WrongState {
                required: required.to_string(),
                current,
            }
            .into());
        }
        Ok(())
    }

    /// Record a directed entry in the neighbour graph (distinct from the
    /// state graph); with `bidirectional`, the inverse edge is registered on
    /// the other device too.
    pub fn add_neighbour_device(self: &Arc<Self>, other: &Arc<Device>, bidirectional: bool) {
        self.neighbours.lock().unwrap().push(Arc::downgrade(other));
        if bidirectional {
            other.neighbours.lock().unwrap().push(Arc::downgrade(self));
        }
    }

    pub fn neighbour_devices(&self) -> Vec<Arc<Device>> {
        self.neighbours
            .lock()
            .unwrap()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Run once when the device is removed from the session.
    pub fn on_removal(&self, hook: impl FnOnce() + Send + 'static) {
        self.removal_hooks.lock().unwrap().push(Box::new(hook));
    }

    /// Tear the device down: every removal callback runs exactly once, then
    /// outstanding observers are cancelled (not awaited).
    pub fn remove(&self) {
        if self.removed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(device = %self.public_name, "removing");
        let hooks: Vec<_> = self.removal_hooks.lock().unwrap().drain(..).collect();
        for hook in hooks {
            hook();
        }
        let outstanding: Vec<_> = self.outstanding.lock().unwrap().drain(..).collect();
        for weak in outstanding {
            if let Some(obs) = weak.upgrade() {
                if obs.outcome().is_none() {
                    obs.cancel();
                }
            }
        }
    }

    fn track(&self, obs: &Arc<Observer>) {
        let mut outstanding = self.outstanding.lock().unwrap();
        outstanding.retain(|w| w.strong_count() > 0);
        outstanding.push(Arc::downgrade(obs));
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name())
            .field("public_name", &self.public_name)
            .field("current_state", &self.current_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linebuffer::LineEnding;

    fn device_with_graph() -> Arc<Device> {
        let (conn, _sent) = Connection::loopback(LineEnding::Lf);
        let runner = Arc::new(Runner::new());
        // Two routes A->D: A->B->D (declared first) and A->C->D.
        DeviceBuilder::new("dev", "A")
            .transition("A", "B", vec![])
            .transition("A", "C", vec![])
            .transition("B", "D", vec![])
            .transition("C", "D", vec![])
            .state("LONELY")
            .build(conn, runner)
    }

    #[test]
    fn test_shortest_path_tie_breaks_by_declaration_order() {
        let dev = device_with_graph();
        let path = dev.find_path("A", "D").unwrap();
        assert_eq!(
            path,
            vec![
                ("A".to_string(), "B".to_string()),
                ("B".to_string(), "D".to_string())
            ]
        );
    }

    #[test]
    fn test_no_path_to_isolated_state() {
        let dev = device_with_graph();
        assert!(dev.find_path("A", "LONELY").is_none());
        assert!(dev.find_path("D", "A").is_none());
    }

    #[tokio::test]
    async fn test_goto_unknown_state_fails_fast() {
        let dev = device_with_graph();
        let err = dev
            .goto_state("NOWHERE", GotoOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Device(DeviceFailure::UnknownState(_))
        ));
    }

    #[tokio::test]
    async fn test_goto_current_state_is_idempotent() {
        let dev = device_with_graph();
        dev.goto_state("A", GotoOptions::default()).await.unwrap();
        assert_eq!(dev.current_state(), "A");
    }

    #[tokio::test]
    async fn test_goto_walks_empty_edges() {
        // Edges without commands still move the state pointer.
        let dev = device_with_graph();
        dev.goto_state("D", GotoOptions::default()).await.unwrap();
        assert_eq!(dev.current_state(), "D");
    }

    #[tokio::test]
    async fn test_goto_unreachable_reports_no_path() {
        let dev = device_with_graph();
        let err = dev
            .goto_state("LONELY", GotoOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Device(DeviceFailure::NoPathFound { .. })
        ));
    }

    #[test]
    fn test_neighbours_bidirectional() {
        let a = device_with_graph();
        let b = device_with_graph();
        a.add_neighbour_device(&b, true);
        assert_eq!(a.neighbour_devices().len(), 1);
        assert_eq!(b.neighbour_devices().len(), 1);
    }

    #[test]
    fn test_removal_hooks_run_exactly_once() {
        let dev = device_with_graph();
        let count = Arc::new(Mutex::new(0));
        let c = count.clone();
        dev.on_removal(move || *c.lock().unwrap() += 1);
        dev.remove();
        dev.remove();
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn test_public_name_survives_rename() {
        let dev = device_with_graph();
        assert_eq!(dev.public_name(), "dev");
        dev.set_name("dev#2");
        assert_eq!(dev.name(), "dev#2");
        assert_eq!(dev.public_name(), "dev");
    }
}
