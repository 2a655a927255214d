use anyhow::{Context, Result};
use clap::Parser;
use promptwire::{commands, Connection, DeviceBuilder, LineEnding, Params, Runner};
use serde_json::json;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "promptwire",
    about = "Run a structured command against an interactive shell session",
    version
)]
struct Args {
    /// Shell to spawn in the PTY
    #[arg(short, long, default_value = "sh")]
    shell: String,

    /// Pattern recognizing the shell prompt
    #[arg(short, long, default_value = r"[$#] $")]
    prompt: String,

    /// Verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Name of the registered command to run (e.g. date, uptime, ssh)
    command: String,

    /// Command parameters as key=value pairs
    #[arg(trailing_var_arg = true)]
    params: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let prompt = regex::Regex::new(&args.prompt)
        .with_context(|| format!("Bad prompt pattern: {}", args.prompt))?;
    let params = parse_params(&args.params)?;

    let conn = Connection::spawn_subprocess(&args.shell, &[], LineEnding::Lf)
        .context("Failed to spawn shell")?;
    let runner = Arc::new(Runner::new());
    let device = commands::register_defaults(DeviceBuilder::new("local", "shell"))
        .prompt(prompt)
        .build(conn, runner);

    // Give the shell time to print its first prompt before sending.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let result = device
        .run(&args.command, &params)
        .await
        .with_context(|| format!("Command '{}' failed", args.command))?;
    println!("{}", serde_json::to_string_pretty(&result)?);

    device.remove();
    Ok(())
}

fn init_tracing(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();
}

fn parse_params(pairs: &[String]) -> Result<Params> {
    let mut params = Params::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("Expected key=value, got: {pair}"))?;
        params.insert(key.to_string(), json!(value));
    }
    Ok(params)
}
