//! `ssh`: open a session to another host, answering the interactive
//! handshake on the way.
//!
//! This is the exemplar for the sub-prompt policy: host-identity
//! confirmation and the credential are each answered at most once, an
//! authentication rejection re-arms the credential (but not the attempt
//! counter), and a changed host key is cleared and the command re-issued
//! exactly once. An unbounded retry loop is a bug, so the attempt counter
//! caps everything.

use crate::command::{build_command, CmdCtx, CommandParser, CommandSpec, ParseAction, SubPrompt};
use crate::device::{Device, Params};
use crate::error::{Error, Result};
use crate::observer::{Observer, ObserverOptions};
use regex::Regex;
use serde_json::json;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{debug, warn};

static RE_PASSWORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)password:").unwrap());
static RE_DENIED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)permission denied").unwrap());
static RE_KEY_CHANGED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)remote host identification has changed|offending \S* ?key").unwrap()
});

/// Credential prompts answered per connection before giving up.
const MAX_AUTH_ATTEMPTS: u32 = 3;

pub struct Ssh {
    host: String,
    login: String,
    password: String,
    host_identity: SubPrompt,
    password_sent: bool,
    auth_attempts: u32,
    key_cleared: bool,
}

impl Ssh {
    pub const NAME: &'static str = "ssh";

    pub fn new(
        host: impl Into<String>,
        login: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            login: login.into(),
            password: password.into(),
            host_identity: SubPrompt::new(
                Regex::new(r"(?i)are you sure you want to continue connecting").unwrap(),
                "yes",
            ),
            password_sent: false,
            auth_attempts: 0,
            key_cleared: false,
        }
    }

    fn scan(&mut self, ctx: &mut CmdCtx<'_>, line: &str) -> Result<ParseAction> {
        if self.host_identity.try_answer(ctx, line)? {
            debug!(host = %self.host, "confirmed host identity");
            return Ok(ParseAction::Handled);
        }
        if RE_PASSWORD.is_match(line) {
            if self.password_sent {
                // Partial-then-full re-delivery of the same prompt line.
                return Ok(ParseAction::Handled);
            }
            if self.auth_attempts >= MAX_AUTH_ATTEMPTS {
                return Ok(ParseAction::Fail(format!(
                    "authentication to '{}' failed after {} attempts",
                    self.host, self.auth_attempts
                )));
            }
            self.auth_attempts += 1;
            self.password_sent = true;
            ctx.send_line(&self.password)?;
            return Ok(ParseAction::Handled);
        }
        if RE_DENIED.is_match(line) {
            // A rejection re-arms the credential prompt, never the counter.
            warn!(host = %self.host, attempt = self.auth_attempts, "authentication rejected");
            self.password_sent = false;
            if self.auth_attempts >= MAX_AUTH_ATTEMPTS {
                return Ok(ParseAction::Fail(format!(
                    "authentication to '{}' failed after {} attempts",
                    self.host, self.auth_attempts
                )));
            }
            return Ok(ParseAction::Handled);
        }
        if RE_KEY_CHANGED.is_match(line) {
            if self.key_cleared {
                return Ok(ParseAction::Fail(format!(
                    "host key for '{}' still rejected after clearing it",
                    self.host
                )));
            }
            warn!(host = %self.host, "stale host key, clearing and retrying once");
            self.key_cleared = true;
            ctx.send_line(&format!("ssh-keygen -R {}", self.host))?;
            ctx.send_line(&self.build_command_string())?;
            return Ok(ParseAction::Handled);
        }
        Ok(ParseAction::Unhandled)
    }
}

impl CommandParser for Ssh {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn build_command_string(&self) -> String {
        format!("TERM=xterm-mono ssh -l {} {}", self.login, self.host)
    }

    fn on_bootstrap_line(
        &mut self,
        ctx: &mut CmdCtx<'_>,
        line: &str,
        _is_full: bool,
    ) -> Result<ParseAction> {
        self.scan(ctx, line)
    }

    fn on_line(&mut self, ctx: &mut CmdCtx<'_>, line: &str, _is_full: bool) -> Result<ParseAction> {
        self.scan(ctx, line)
    }
}

/// Params: `host`, `login`, `password` (required), `prompt` (optional regex
/// for the remote shell prompt; defaults to the device's own).
pub fn factory(device: &Device, params: &Params) -> Result<Arc<Observer>> {
    let get = |key: &str| -> Result<&str> {
        params
            .get(key)
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::InvalidParams(format!("ssh requires string param '{key}'")))
    };
    let parser = Ssh::new(get("host")?, get("login")?, get("password")?);
    let prompt = match params.get("prompt").and_then(|v| v.as_str()) {
        Some(raw) => Regex::new(raw)
            .map_err(|e| Error::InvalidParams(format!("bad prompt pattern: {e}")))?,
        None => device.prompt().clone(),
    };
    let spec = CommandSpec::new(prompt)
        .failure_pattern(Regex::new(r"(?i)connection refused").unwrap())
        .failure_pattern(Regex::new(r"(?i)could not resolve hostname").unwrap())
        .failure_pattern(Regex::new(r"(?i)connection timed out").unwrap())
        .options(ObserverOptions {
            timeout: Duration::from_secs(60),
            ..Default::default()
        });
    Ok(build_command(device.connection(), spec, Box::new(parser)))
}

/// Params used by a `run("ssh", ...)` call site, for convenience.
pub fn params(host: &str, login: &str, password: &str, prompt: &str) -> Params {
    let mut p = Params::new();
    p.insert("host".into(), json!(host));
    p.insert("login".into(), json!(login));
    p.insert("password".into(), json!(password));
    p.insert("prompt".into(), json!(prompt));
    p
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::linebuffer::LineEnding;
    use std::time::Instant;

    fn start_ssh(conn: &Arc<Connection>) -> Arc<Observer> {
        let spec = CommandSpec::new(Regex::new(r"remote# $").unwrap())
            .failure_pattern(Regex::new(r"(?i)connection refused").unwrap());
        let cmd = build_command(conn, spec, Box::new(Ssh::new("farend", "ute", "hunter2")));
        cmd.start().unwrap();
        // The echoed command line.
        conn.data_received(b"host $ TERM=xterm-mono ssh -l ute farend\n", Instant::now());
        cmd
    }

    fn sent_text(sent: &Arc<std::sync::Mutex<Vec<u8>>>) -> String {
        String::from_utf8_lossy(&sent.lock().unwrap()).into_owned()
    }

    #[test]
    fn test_password_then_prompt() {
        let (conn, sent) = Connection::loopback(LineEnding::Lf);
        let cmd = start_ssh(&conn);
        let now = Instant::now();
        conn.data_received(b"ute@farend's password: ", now);
        assert!(sent_text(&sent).contains("hunter2\n"));
        conn.data_received(b"\nremote# ", now);
        assert!(cmd.is_done());
        assert!(cmd.result().is_some());
    }

    #[test]
    fn test_password_answered_once_per_prompt() {
        let (conn, sent) = Connection::loopback(LineEnding::Lf);
        let _cmd = start_ssh(&conn);
        let now = Instant::now();
        conn.data_received(b"password: ", now);
        conn.data_received(b"\n", now); // completes the same prompt line
        assert_eq!(sent_text(&sent).matches("hunter2\n").count(), 1);
    }

    #[test]
    fn test_rejection_rearms_credential() {
        let (conn, sent) = Connection::loopback(LineEnding::Lf);
        let cmd = start_ssh(&conn);
        let now = Instant::now();
        conn.data_received(b"password: \n", now);
        conn.data_received(b"Permission denied, please try again.\n", now);
        conn.data_received(b"password: \n", now);
        assert_eq!(sent_text(&sent).matches("hunter2\n").count(), 2);
        conn.data_received(b"remote# ", now);
        assert!(cmd.result().is_some());
    }

    #[test]
    fn test_attempt_counter_caps_retries() {
        let (conn, _sent) = Connection::loopback(LineEnding::Lf);
        let cmd = start_ssh(&conn);
        let now = Instant::now();
        for _ in 0..MAX_AUTH_ATTEMPTS {
            conn.data_received(b"password: \n", now);
            conn.data_received(b"Permission denied, please try again.\n", now);
        }
        assert!(matches!(cmd.error(), Some(Error::CommandFailure(_))));
    }

    #[test]
    fn test_changed_host_key_cleared_once() {
        let (conn, sent) = Connection::loopback(LineEnding::Lf);
        let cmd = start_ssh(&conn);
        let now = Instant::now();
        conn.data_received(b"REMOTE HOST IDENTIFICATION HAS CHANGED!\n", now);
        let text = sent_text(&sent);
        assert!(text.contains("ssh-keygen -R farend\n"));
        assert_eq!(text.matches("ssh -l ute farend").count(), 2);
        // Second occurrence is a hard failure.
        conn.data_received(b"REMOTE HOST IDENTIFICATION HAS CHANGED!\n", now);
        assert!(matches!(cmd.error(), Some(Error::CommandFailure(_))));
    }

    #[test]
    fn test_factory_builds_from_params() {
        use crate::device::DeviceBuilder;
        use crate::runner::Runner;

        let (conn, _sent) = Connection::loopback(LineEnding::Lf);
        let runner = Arc::new(Runner::new());
        let device = DeviceBuilder::new("jump", "shell").build(conn, runner);
        let obs = factory(&device, &params("farend", "ute", "hunter2", r"remote# $")).unwrap();
        assert_eq!(obs.name(), Ssh::NAME);
        let err = factory(&device, &Params::new()).unwrap_err();
        assert!(matches!(err, Error::InvalidParams(_)));
    }

    #[test]
    fn test_connection_refused_is_failure() {
        let (conn, _sent) = Connection::loopback(LineEnding::Lf);
        let cmd = start_ssh(&conn);
        conn.data_received(b"ssh: connect to host farend port 22: Connection refused\n", Instant::now());
        assert!(matches!(cmd.error(), Some(Error::CommandFailure(_))));
    }
}
