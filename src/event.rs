//! Events: observers that wait for a pattern in the stream without sending
//! anything.
//!
//! An event is the passive counterpart of a command: the thing you race
//! with `Runner::wait_any` when several expectations compete and only one
//! should occur.

use crate::connection::Connection;
use crate::error::Result;
use crate::observer::{LineHandler, LineOutcome, Observer, ObserverOptions, ObserverResult};
use regex::Regex;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

/// Build an event observer that completes when `pattern` matches a line
/// (full or partial). The result records the matching line and any capture
/// groups, in order.
pub fn build_event(
    conn: &Arc<Connection>,
    name: impl Into<String>,
    pattern: Regex,
    options: ObserverOptions,
) -> Arc<Observer> {
    Observer::new(name, conn, Box::new(EventMatch { pattern }), options)
}

struct EventMatch {
    pattern: Regex,
}

impl LineHandler for EventMatch {
    fn on_line(&mut self, obs: &Observer, line: &str, is_full: bool) -> Result<LineOutcome> {
        let Some(caps) = self.pattern.captures(line) else {
            return Ok(LineOutcome::Unhandled);
        };
        debug!(event = %obs.name(), %line, "pattern matched");
        let mut ret = ObserverResult::new();
        ret.insert("line".into(), json!(line));
        ret.insert("is_full".into(), json!(is_full));
        let groups: Vec<_> = caps
            .iter()
            .skip(1)
            .map(|g| json!(g.map(|m| m.as_str())))
            .collect();
        if !groups.is_empty() {
            ret.insert("groups".into(), json!(groups));
        }
        obs.set_result(ret);
        Ok(LineOutcome::Handled)
    }
}
