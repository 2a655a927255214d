//! `date`: remote date/time in a fixed, locale-independent layout.
//!
//! Sends `date` with an explicit format string so the output is three
//! self-describing lines, then collects them into nested `DATE`/`TIME`
//! groups plus an integer `EPOCH`.

use crate::command::{build_command, CmdCtx, CommandParser, CommandSpec, ParseAction};
use crate::device::{Device, Params};
use crate::error::{Error, Result};
use crate::observer::Observer;
use regex::Regex;
use serde_json::json;
use std::sync::{Arc, LazyLock};

static RE_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^DATE:\s+(\d{1,2})-(\d{1,2})-(\d{4})\s*$").unwrap());
static RE_TIME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^TIME:\s+(\d{1,2}):(\d{2}):(\d{2})\s*$").unwrap());
static RE_EPOCH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^EPOCH:\s+(\d+)\s*$").unwrap());

pub struct Date;

impl Date {
    pub const NAME: &'static str = "date";
}

impl CommandParser for Date {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn build_command_string(&self) -> String {
        "date '+DATE:%t%t%d-%m-%Y%nTIME:%t%t%H:%M:%S%nEPOCH:%t%t%s'".into()
    }

    fn on_line(&mut self, ctx: &mut CmdCtx<'_>, line: &str, is_full: bool) -> Result<ParseAction> {
        if !is_full {
            return Ok(ParseAction::Unhandled);
        }
        if let Some(caps) = RE_DATE.captures(line) {
            let group = ctx.group("DATE");
            group.insert("FULL".into(), json!(format!("{}-{}-{}", &caps[1], &caps[2], &caps[3])));
            group.insert("DAY".into(), json!(int(&caps[1])?));
            group.insert("MONTH".into(), json!(int(&caps[2])?));
            group.insert("YEAR".into(), json!(int(&caps[3])?));
            return Ok(ParseAction::Handled);
        }
        if let Some(caps) = RE_TIME.captures(line) {
            let group = ctx.group("TIME");
            group.insert("FULL".into(), json!(format!("{}:{}:{}", &caps[1], &caps[2], &caps[3])));
            group.insert("HOUR".into(), json!(int(&caps[1])?));
            group.insert("MINUTE".into(), json!(int(&caps[2])?));
            group.insert("SECOND".into(), json!(int(&caps[3])?));
            return Ok(ParseAction::Handled);
        }
        if let Some(caps) = RE_EPOCH.captures(line) {
            ctx.insert("EPOCH", json!(int(&caps[1])?));
            return Ok(ParseAction::Handled);
        }
        Ok(ParseAction::Unhandled)
    }
}

// Captures are raw substrings; conversion is always base-10.
fn int(raw: &str) -> Result<i64> {
    raw.parse::<i64>()
        .map_err(|_| Error::CommandFailure(format!("not a base-10 integer: '{raw}'")))
}

pub fn factory(device: &Device, _params: &Params) -> Result<Arc<Observer>> {
    let spec = CommandSpec::new(device.prompt().clone()).ret_required(true);
    Ok(build_command(device.connection(), spec, Box::new(Date)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::linebuffer::LineEnding;
    use std::time::Instant;

    #[test]
    fn test_date_scenario() {
        let (conn, _sent) = Connection::loopback(LineEnding::Lf);
        let spec = CommandSpec::new(Regex::new(r"\$ $").unwrap()).ret_required(true);
        let cmd = build_command(&conn, spec, Box::new(Date));
        cmd.start().unwrap();
        let now = Instant::now();
        conn.data_received(
            b"host $ date '+DATE:%t%t%d-%m-%Y%nTIME:%t%t%H:%M:%S%nEPOCH:%t%t%s'\n",
            now,
        );
        conn.data_received(b"DATE:\t\t14-03-2018\n", now);
        conn.data_received(b"TIME:\t\t14:38:18\n", now);
        conn.data_received(b"EPOCH:\t\t1521034698\n", now);
        conn.data_received(b"host $ ", now);

        let ret = cmd.result().unwrap();
        assert_eq!(ret["DATE"]["FULL"], json!("14-03-2018"));
        assert_eq!(ret["TIME"]["FULL"], json!("14:38:18"));
        assert_eq!(ret["EPOCH"], json!(1521034698i64));
        assert!(cmd.is_done());
    }

    #[test]
    fn test_date_groups_are_integers() {
        let (conn, _sent) = Connection::loopback(LineEnding::Lf);
        let spec = CommandSpec::new(Regex::new(r"\$ $").unwrap()).ret_required(true);
        let cmd = build_command(&conn, spec, Box::new(Date));
        cmd.start().unwrap();
        let now = Instant::now();
        conn.data_received(b"$ date '+DATE:%t%t%d-%m-%Y%nTIME:%t%t%H:%M:%S%nEPOCH:%t%t%s'\n", now);
        conn.data_received(b"DATE:\t\t01-12-2025\nTIME:\t\t09:05:59\nEPOCH:\t\t1764579959\n$ ", now);
        let ret = cmd.result().unwrap();
        assert_eq!(ret["DATE"]["DAY"], json!(1));
        assert_eq!(ret["DATE"]["MONTH"], json!(12));
        assert_eq!(ret["TIME"]["SECOND"], json!(59));
    }
}
