//! Built-in command parsers.
//!
//! These are exemplars, not a catalog: each one is a thin line-matching
//! table over the generic engine in [`crate::command`]. To add a command,
//! implement [`CommandParser`](crate::command::CommandParser), expose a
//! `factory` function, and add one entry to [`register_defaults`] (or call
//! `DeviceBuilder::command` yourself).

pub mod date;
pub mod ssh;
pub mod uptime;

pub use date::Date;
pub use ssh::Ssh;
pub use uptime::Uptime;

use crate::device::{Device, DeviceBuilder, Params};
use crate::error::{Error, Result};
use crate::event::build_event;
use crate::observer::{Observer, ObserverOptions};
use regex::Regex;
use std::sync::Arc;

/// Register the built-in commands (and the generic `line` event) on a
/// device builder.
pub fn register_defaults(builder: DeviceBuilder) -> DeviceBuilder {
    builder
        .command(Date::NAME, Arc::new(date::factory))
        .command(Uptime::NAME, Arc::new(uptime::factory))
        .command(Ssh::NAME, Arc::new(ssh::factory))
        .event("line", Arc::new(line_event))
}

/// Generic event: wait for a line matching the `pattern` param.
fn line_event(device: &Device, params: &Params) -> Result<Arc<Observer>> {
    let raw = params
        .get("pattern")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::InvalidParams("event 'line' requires string param 'pattern'".into()))?;
    let pattern =
        Regex::new(raw).map_err(|e| Error::InvalidParams(format!("bad pattern: {e}")))?;
    Ok(build_event(
        device.connection(),
        format!("line:{raw}"),
        pattern,
        ObserverOptions::default(),
    ))
}
