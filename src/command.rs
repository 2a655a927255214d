//! Commands: observers that send one command string and parse its structured
//! output.
//!
//! A command is composed, not inherited: the generic [`CommandEngine`]
//! (echo matching, failure patterns, prompt detection, result bookkeeping)
//! wraps a per-command [`CommandParser`] that only knows how to build its
//! command string and pick fields out of lines. Parsers report what they did
//! with each line through [`ParseAction`]; there is no control-flow-by-error
//! anywhere in the chain.
//!
//! Per invocation the engine moves through three phases:
//!
//! 1. **wait-echo**: consume lines until the command's own echoed text shows
//!    up (case-insensitive). Everything before that is ignored by the result
//!    parser but still offered to the parser's bootstrap hook, so session
//!    handshakes (host-identity prompts, credentials) can be answered early.
//! 2. **parsing**: each line goes through failure patterns, then the
//!    parser, then prompt detection.
//! 3. **done/error**: terminal; a failed command never leaks the partial
//!    result it accumulated.

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::observer::{LineHandler, LineOutcome, Observer, ObserverOptions, ObserverResult};
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// What a parser did with one line.
#[derive(Debug)]
pub enum ParseAction {
    /// Line consumed; stop further matching for this line.
    Handled,
    /// Not mine; let the engine try failure patterns / the prompt.
    Unhandled,
    /// The result is complete; finish successfully now (without waiting for
    /// the prompt).
    Done,
    /// A failure pattern specific to this parser matched.
    Fail(String),
}

/// The per-command half: build the command string, pick fields out of lines.
///
/// `on_line` runs only after the echo matched; `on_bootstrap_line` runs for
/// every line before that (sub-prompt handshakes live there).
pub trait CommandParser: Send + 'static {
    /// The command name, used for the observer name and registry lookup.
    fn name(&self) -> &'static str;

    /// The exact string sent to the session (without line terminator).
    fn build_command_string(&self) -> String;

    fn on_line(&mut self, ctx: &mut CmdCtx<'_>, line: &str, is_full: bool) -> Result<ParseAction>;

    fn on_bootstrap_line(
        &mut self,
        _ctx: &mut CmdCtx<'_>,
        _line: &str,
        _is_full: bool,
    ) -> Result<ParseAction> {
        Ok(ParseAction::Unhandled)
    }
}

/// Everything except the parser: prompt, failure patterns, budgets.
#[derive(Clone)]
pub struct CommandSpec {
    /// Pattern recognizing the expected prompt after the output.
    pub prompt: Regex,
    /// When `true`, reaching the prompt with nothing parsed is a failure;
    /// when `false` the command is fire-and-forget and an empty result is
    /// fine.
    pub ret_required: bool,
    /// Generic failure patterns checked against every full output line.
    pub failure_patterns: Vec<Regex>,
    pub options: ObserverOptions,
}

impl CommandSpec {
    pub fn new(prompt: Regex) -> Self {
        Self {
            prompt,
            ret_required: false,
            failure_patterns: Vec::new(),
            options: ObserverOptions::default(),
        }
    }

    pub fn ret_required(mut self, required: bool) -> Self {
        self.ret_required = required;
        self
    }

    pub fn failure_pattern(mut self, pattern: Regex) -> Self {
        self.failure_patterns.push(pattern);
        self
    }

    pub fn options(mut self, options: ObserverOptions) -> Self {
        self.options = options;
        self
    }
}

/// What a parser sees while handling a line: the accumulating result plus
/// the observer for sending handshake replies.
pub struct CmdCtx<'a> {
    obs: &'a Observer,
    result: &'a mut ObserverResult,
}

impl CmdCtx<'_> {
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.result.insert(key.into(), value);
    }

    /// The nested object under `group`, created on first use. Lets parsers
    /// build results like `DATE.FULL` without juggling ownership.
    pub fn group(&mut self, group: &str) -> &mut serde_json::Map<String, Value> {
        self.result
            .entry(group.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()))
            .as_object_mut()
            .unwrap()
    }

    pub fn result(&self) -> &ObserverResult {
        self.result
    }

    pub fn send(&self, data: &[u8]) -> Result<()> {
        self.obs.send(data)
    }

    pub fn send_line(&self, line: &str) -> Result<()> {
        self.obs.send_line(line)
    }
}

/// One interactive sub-prompt in a session handshake: a pattern plus the
/// reply to send, answered at most once until explicitly re-armed.
pub struct SubPrompt {
    pattern: Regex,
    reply: String,
    sent: bool,
}

impl SubPrompt {
    pub fn new(pattern: Regex, reply: impl Into<String>) -> Self {
        Self {
            pattern,
            reply: reply.into(),
            sent: false,
        }
    }

    /// If the line matches and no reply has been sent yet, send it.
    /// Returns `true` when a reply went out.
    pub fn try_answer(&mut self, ctx: &CmdCtx<'_>, line: &str) -> Result<bool> {
        if self.sent || !self.pattern.is_match(line) {
            return Ok(false);
        }
        self.sent = true;
        ctx.send_line(&self.reply)?;
        Ok(true)
    }

    /// Re-arm the prompt so a second, distinct occurrence can be answered
    /// (e.g. after an authentication rejection).
    pub fn reset(&mut self) {
        self.sent = false;
    }
}

/// Build a command observer over `conn`. The returned observer is not yet
/// started; submit it through a [`Runner`](crate::runner::Runner).
pub fn build_command(
    conn: &Arc<Connection>,
    spec: CommandSpec,
    parser: Box<dyn CommandParser>,
) -> Arc<Observer> {
    let name = parser.name();
    let command_string = parser.build_command_string();
    let options = spec.options;
    let engine = CommandEngine {
        spec,
        parser,
        command_string,
        cmd_matched: false,
        result: ObserverResult::new(),
    };
    Observer::new(name, conn, Box::new(engine), options)
}

struct CommandEngine {
    spec: CommandSpec,
    parser: Box<dyn CommandParser>,
    command_string: String,
    cmd_matched: bool,
    result: ObserverResult,
}

impl CommandEngine {
    fn finish(&mut self, obs: &Observer) {
        if self.spec.ret_required && self.result.is_empty() {
            obs.set_error(Error::CommandFailure(format!(
                "'{}' reached its prompt with no result parsed",
                self.command_string
            )));
            return;
        }
        obs.set_result(std::mem::take(&mut self.result));
    }

    fn fail(&mut self, obs: &Observer, reason: String) {
        // Partial results accumulated before a failure are discarded.
        self.result.clear();
        obs.set_error(Error::CommandFailure(reason));
    }

    fn apply(&mut self, obs: &Observer, action: ParseAction) -> Option<LineOutcome> {
        match action {
            ParseAction::Handled => Some(LineOutcome::Handled),
            ParseAction::Unhandled => None,
            ParseAction::Done => {
                self.finish(obs);
                Some(LineOutcome::Handled)
            }
            ParseAction::Fail(reason) => {
                self.fail(obs, reason);
                Some(LineOutcome::Handled)
            }
        }
    }
}

impl LineHandler for CommandEngine {
    fn on_start(&mut self, obs: &Observer) -> Result<()> {
        debug!(command = %self.command_string, "sending");
        obs.send_line(&self.command_string)
    }

    fn on_line(&mut self, obs: &Observer, line: &str, is_full: bool) -> Result<LineOutcome> {
        if !self.cmd_matched {
            let action = {
                let mut ctx = CmdCtx {
                    obs,
                    result: &mut self.result,
                };
                self.parser.on_bootstrap_line(&mut ctx, line, is_full)?
            };
            if let Some(outcome) = self.apply(obs, action) {
                return Ok(outcome);
            }
            // The echo arrives as a complete line (prompt + command + the
            // terminator our own send produced); matching only full lines
            // keeps the partial-then-full re-delivery from double-counting.
            if is_full
                && line
                    .to_lowercase()
                    .contains(&self.command_string.to_lowercase())
            {
                self.cmd_matched = true;
                debug!(command = %self.command_string, "echo matched");
            }
            return Ok(LineOutcome::Handled);
        }

        if is_full {
            if let Some(pat) = self
                .spec
                .failure_patterns
                .iter()
                .find(|p| p.is_match(line))
            {
                debug!(pattern = %pat.as_str(), %line, "failure pattern matched");
                self.fail(obs, line.to_string());
                return Ok(LineOutcome::Handled);
            }
        }

        let action = {
            let mut ctx = CmdCtx {
                obs,
                result: &mut self.result,
            };
            self.parser.on_line(&mut ctx, line, is_full)?
        };
        if let Some(outcome) = self.apply(obs, action) {
            return Ok(outcome);
        }

        // Prompts are rarely newline-terminated, so partials count here.
        if self.spec.prompt.is_match(line) {
            debug!(command = %self.command_string, "prompt reached");
            self.finish(obs);
            return Ok(LineOutcome::Handled);
        }
        Ok(LineOutcome::Unhandled)
    }

    fn on_timeout(&mut self, obs: &Observer) {
        // A bare newline often flushes a prompt the session swallowed.
        let _ = obs.send_line("");
    }
}
