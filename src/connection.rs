//! The connection boundary: fans inbound chunks out to every registered
//! observer and carries outbound writes to the transport.
//!
//! The engine treats all traffic as a text stream; the only transport
//! knowledge here is a [`Transport`] trait plus two implementations: a
//! PTY-backed subprocess (with the reader thread pattern) and an in-memory
//! loopback used by tests and by users unit-testing their own parsers.

use crate::error::{Error, Result};
use crate::linebuffer::LineEnding;
use crate::observer::Observer;
use anyhow::Context as _;
use portable_pty::{Child, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Outbound half of a text session.
pub trait Transport: Send {
    fn send(&mut self, data: &[u8]) -> std::io::Result<()>;
}

type Hook = Box<dyn Fn() + Send>;

/// A live text session. Delivers every inbound chunk, with its receipt
/// timestamp, to all currently-registered observers.
pub struct Connection {
    observers: Mutex<HashMap<u64, Arc<Observer>>>,
    transport: Mutex<Box<dyn Transport>>,
    ending: LineEnding,
    made_hooks: Mutex<Vec<Hook>>,
    lost_hooks: Mutex<Vec<Hook>>,
}

impl Connection {
    pub fn new(transport: Box<dyn Transport>, ending: LineEnding) -> Arc<Self> {
        Arc::new(Self {
            observers: Mutex::new(HashMap::new()),
            transport: Mutex::new(transport),
            ending,
            made_hooks: Mutex::new(Vec::new()),
            lost_hooks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn `command args...` inside a PTY and pump its output into this
    /// connection from a background reader thread.
    pub fn spawn_subprocess(
        command: &str,
        args: &[String],
        ending: LineEnding,
    ) -> anyhow::Result<Arc<Self>> {
        let pty_system = portable_pty::native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("Failed to open PTY")?;

        let mut cmd = CommandBuilder::new(command);
        for arg in args {
            cmd.arg(arg);
        }
        let child = pair
            .slave
            .spawn_command(cmd)
            .context("Failed to spawn command")?;
        let writer = pair
            .master
            .take_writer()
            .context("Failed to get PTY writer")?;
        let reader = pair
            .master
            .try_clone_reader()
            .context("Failed to get PTY reader")?;

        let conn = Connection::new(
            Box::new(PtyTransport {
                _master: pair.master,
                _child: child,
                writer,
            }),
            ending,
        );
        spawn_reader(reader, Arc::downgrade(&conn));
        conn.connection_made();
        Ok(conn)
    }

    /// An in-memory connection: everything sent is captured into the returned
    /// buffer, and tests inject inbound data with [`data_received`](Self::data_received).
    pub fn loopback(ending: LineEnding) -> (Arc<Self>, Arc<Mutex<Vec<u8>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let conn = Connection::new(
            Box::new(LoopbackTransport { sent: sent.clone() }),
            ending,
        );
        conn.connection_made();
        (conn, sent)
    }

    pub fn line_ending(&self) -> LineEnding {
        self.ending
    }

    pub(crate) fn register(&self, observer: Arc<Observer>) {
        trace!(observer = %observer.name(), "registered");
        self.observers.lock().unwrap().insert(observer.id(), observer);
    }

    pub(crate) fn unregister(&self, id: u64) {
        self.observers.lock().unwrap().remove(&id);
    }

    pub fn send(&self, data: &[u8]) -> Result<()> {
        self.transport
            .lock()
            .unwrap()
            .send(data)
            .map_err(|e| Error::Send(e.to_string()))
    }

    /// Send text followed by this connection's line terminator.
    pub fn send_line(&self, line: &str) -> Result<()> {
        let mut data = line.as_bytes().to_vec();
        data.extend_from_slice(self.ending.as_str().as_bytes());
        self.send(&data)
    }

    /// Inbound delivery path. Snapshots the registry first, so a handler
    /// completing (and unregistering) mid-delivery cannot deadlock it.
    pub fn data_received(&self, chunk: &[u8], received_at: Instant) {
        let observers: Vec<Arc<Observer>> =
            self.observers.lock().unwrap().values().cloned().collect();
        for obs in observers {
            obs.feed(chunk, received_at);
        }
    }

    pub fn on_connection_made(&self, hook: impl Fn() + Send + 'static) {
        self.made_hooks.lock().unwrap().push(Box::new(hook));
    }

    pub fn on_connection_lost(&self, hook: impl Fn() + Send + 'static) {
        self.lost_hooks.lock().unwrap().push(Box::new(hook));
    }

    pub fn connection_made(&self) {
        debug!("connection made");
        for hook in self.made_hooks.lock().unwrap().iter() {
            hook();
        }
    }

    /// The stream dropped: notify devices first, then outstanding observers.
    pub fn connection_lost(&self) {
        warn!("connection lost");
        for hook in self.lost_hooks.lock().unwrap().iter() {
            hook();
        }
        let observers: Vec<Arc<Observer>> =
            self.observers.lock().unwrap().values().cloned().collect();
        for obs in observers {
            obs.connection_lost();
        }
    }
}

struct PtyTransport {
    _master: Box<dyn MasterPty + Send>,
    _child: Box<dyn Child + Send + Sync>,
    writer: Box<dyn Write + Send>,
}

impl Transport for PtyTransport {
    fn send(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(data)?;
        self.writer.flush()
    }
}

struct LoopbackTransport {
    sent: Arc<Mutex<Vec<u8>>>,
}

impl Transport for LoopbackTransport {
    fn send(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.sent.lock().unwrap().extend_from_slice(data);
        Ok(())
    }
}

/// Background reader thread: pumps PTY output into the connection until EOF.
/// Holds only a weak reference so dropping the connection ends the pump.
fn spawn_reader<R: Read + Send + 'static>(mut reader: R, conn: Weak<Connection>) {
    thread::spawn(move || {
        let mut buffer = [0u8; 4096];
        loop {
            match reader.read(&mut buffer) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let Some(conn) = conn.upgrade() else { break };
                    conn.data_received(&buffer[..n], Instant::now());
                }
            }
        }
        if let Some(conn) = conn.upgrade() {
            conn.connection_lost();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linebuffer::LineEnding;

    #[test]
    fn test_loopback_captures_sends() {
        let (conn, sent) = Connection::loopback(LineEnding::CrLf);
        conn.send_line("ping").unwrap();
        assert_eq!(&*sent.lock().unwrap(), b"ping\r\n");
    }

    #[test]
    fn test_lost_hooks_run() {
        let (conn, _sent) = Connection::loopback(LineEnding::Lf);
        let flag = Arc::new(Mutex::new(false));
        let f = flag.clone();
        conn.on_connection_lost(move || *f.lock().unwrap() = true);
        conn.connection_lost();
        assert!(*flag.lock().unwrap());
    }
}
