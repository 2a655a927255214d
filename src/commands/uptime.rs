//! `uptime`: how long the session host has been up and how many users are
//! on it.
//!
//! The uptime field has several spellings (`3 days, 2:14`, `2:14`,
//! `58 min`); all of them are normalized into a seconds count next to the
//! verbatim string.

use crate::command::{build_command, CmdCtx, CommandParser, CommandSpec, ParseAction};
use crate::device::{Device, Params};
use crate::error::Result;
use crate::observer::Observer;
use regex::Regex;
use serde_json::json;
use std::sync::{Arc, LazyLock};

static RE_UPTIME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)up\s+(.+?),\s+(\d+)\s+users?,").unwrap());

pub struct Uptime;

impl Uptime {
    pub const NAME: &'static str = "uptime";
}

impl CommandParser for Uptime {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn build_command_string(&self) -> String {
        "uptime".into()
    }

    fn on_line(&mut self, ctx: &mut CmdCtx<'_>, line: &str, is_full: bool) -> Result<ParseAction> {
        if !is_full {
            return Ok(ParseAction::Unhandled);
        }
        let Some(caps) = RE_UPTIME.captures(line) else {
            return Ok(ParseAction::Unhandled);
        };
        let spelled = caps[1].trim().to_string();
        let Some(seconds) = uptime_seconds(&spelled) else {
            return Ok(ParseAction::Fail(format!(
                "unrecognized uptime spelling: '{spelled}'"
            )));
        };
        let users: i64 = caps[2].parse().unwrap_or(0);
        ctx.insert("UPTIME", json!(spelled));
        ctx.insert("UPTIME_SECONDS", json!(seconds));
        ctx.insert("USERS", json!(users));
        Ok(ParseAction::Handled)
    }
}

/// `3 days, 2:14` / `2:14` / `58 min` / `3 days, 58 min` → seconds.
fn uptime_seconds(spelled: &str) -> Option<i64> {
    let mut total: i64 = 0;
    let mut rest = spelled.trim();
    if let Some((days_part, tail)) = rest.split_once(',') {
        let days_part = days_part.trim();
        if let Some(days) = days_part
            .strip_suffix("days")
            .or_else(|| days_part.strip_suffix("day"))
        {
            total += days.trim().parse::<i64>().ok()? * 86_400;
            rest = tail.trim();
        }
    } else if let Some(days) = rest
        .strip_suffix("days")
        .or_else(|| rest.strip_suffix("day"))
    {
        return Some(days.trim().parse::<i64>().ok()? * 86_400);
    }
    if rest.is_empty() {
        return Some(total);
    }
    if let Some(mins) = rest.strip_suffix("min") {
        return Some(total + mins.trim().parse::<i64>().ok()? * 60);
    }
    let (hours, minutes) = rest.split_once(':')?;
    Some(total + hours.trim().parse::<i64>().ok()? * 3600 + minutes.trim().parse::<i64>().ok()? * 60)
}

pub fn factory(device: &Device, _params: &Params) -> Result<Arc<Observer>> {
    let spec = CommandSpec::new(device.prompt().clone()).ret_required(true);
    Ok(build_command(device.connection(), spec, Box::new(Uptime)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::linebuffer::LineEnding;
    use std::time::Instant;

    #[test]
    fn test_uptime_seconds_spellings() {
        assert_eq!(uptime_seconds("3 days, 2:14"), Some(3 * 86_400 + 2 * 3600 + 14 * 60));
        assert_eq!(uptime_seconds("2:14"), Some(2 * 3600 + 14 * 60));
        assert_eq!(uptime_seconds("58 min"), Some(58 * 60));
        assert_eq!(uptime_seconds("1 day, 58 min"), Some(86_400 + 58 * 60));
        assert_eq!(uptime_seconds("weird"), None);
    }

    #[test]
    fn test_uptime_round_trip() {
        let (conn, _sent) = Connection::loopback(LineEnding::Lf);
        let spec = CommandSpec::new(Regex::new(r"\$ $").unwrap()).ret_required(true);
        let cmd = build_command(&conn, spec, Box::new(Uptime));
        cmd.start().unwrap();
        let now = Instant::now();
        conn.data_received(b"host $ uptime\n", now);
        conn.data_received(
            b" 14:38:18 up 3 days, 2:14, 29 users, load average: 0.92, 0.82, 0.74\n",
            now,
        );
        conn.data_received(b"host $ ", now);
        let ret = cmd.result().unwrap();
        assert_eq!(ret["UPTIME"], json!("3 days, 2:14"));
        assert_eq!(ret["UPTIME_SECONDS"], json!(3 * 86_400 + 2 * 3600 + 14 * 60));
        assert_eq!(ret["USERS"], json!(29));
    }
}
