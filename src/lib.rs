//! # Promptwire
//!
//! An engine for driving interactive text sessions (shells reached over
//! SSH, telnet, serial or a local subprocess) and turning their raw,
//! arbitrarily-chunked output into structured results.
//!
//! The building blocks, bottom up:
//!
//! | Piece | Role |
//! |-------|------|
//! | [`Connection`] | delivers raw chunks to every registered observer |
//! | [`LineBuffer`](linebuffer::LineBuffer) | assembles chunks into full/partial lines |
//! | [`Observer`] | a cancellable, timeout-bounded task fed by a connection |
//! | [`Runner`] | supervises observers: timeouts, wait, wait-any, cancel-all |
//! | [`CommandParser`]/[`build_command`] | send one command, parse its output |
//! | [`build_event`] | wait passively for a pattern |
//! | [`Device`] | a named-state graph navigated with per-hop time budgets |
//!
//! ## Quick start
//!
//! ```no_run
//! use promptwire::{commands, Connection, DeviceBuilder, LineEnding, Params, Runner};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let conn = Connection::spawn_subprocess("bash", &[], LineEnding::Lf)?;
//!     let runner = Arc::new(Runner::new());
//!     let device = commands::register_defaults(DeviceBuilder::new("local", "shell"))
//!         .prompt(regex::Regex::new(r"[$#] $")?)
//!         .build(conn, runner);
//!
//!     let result = device.run("uptime", &Params::new()).await?;
//!     println!("up for {} seconds", result["UPTIME_SECONDS"]);
//!     Ok(())
//! }
//! ```
//!
//! ## Writing a command parser
//!
//! A command is composed from the generic engine plus a small parser that
//! knows its command string and its line patterns:
//!
//! ```
//! use promptwire::command::{CmdCtx, CommandParser, ParseAction};
//! use promptwire::Result;
//! use serde_json::json;
//!
//! pub struct Hostname;
//!
//! impl CommandParser for Hostname {
//!     fn name(&self) -> &'static str { "hostname" }
//!     fn build_command_string(&self) -> String { "hostname".into() }
//!
//!     fn on_line(&mut self, ctx: &mut CmdCtx<'_>, line: &str, is_full: bool)
//!         -> Result<ParseAction>
//!     {
//!         if is_full && !line.contains("hostname") && !line.trim().is_empty() {
//!             ctx.insert("HOSTNAME", json!(line.trim()));
//!             return Ok(ParseAction::Handled);
//!         }
//!         Ok(ParseAction::Unhandled)
//!     }
//! }
//! ```
//!
//! ## Testing parsers without a live session
//!
//! [`Connection::loopback`] captures everything sent and lets tests inject
//! inbound bytes with [`Connection::data_received`]:
//!
//! ```
//! use promptwire::{build_event, Connection, LineEnding, ObserverOptions};
//! use std::time::Instant;
//!
//! let (conn, sent) = Connection::loopback(LineEnding::Lf);
//! let evt = build_event(&conn, "ready", regex::Regex::new("ready").unwrap(),
//!                       ObserverOptions::default());
//! evt.start().unwrap();
//! conn.data_received(b"system ready\n", Instant::now());
//! assert!(evt.is_done());
//! # let _ = sent;
//! ```

pub mod command;
pub mod commands;
pub mod connection;
pub mod device;
pub mod error;
pub mod event;
pub mod linebuffer;
pub mod observer;
pub mod runner;

pub use command::{build_command, CmdCtx, CommandParser, CommandSpec, ParseAction, SubPrompt};
pub use connection::{Connection, Transport};
pub use device::{Device, DeviceBuilder, GotoOptions, Params};
pub use error::{DeviceFailure, Error, Result};
pub use event::build_event;
pub use linebuffer::{LineBuffer, LineEnding};
pub use observer::{LineHandler, LineOutcome, Observer, ObserverOptions, ObserverResult};
pub use runner::Runner;
