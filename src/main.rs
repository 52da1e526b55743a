//! slink - scriptlink command-line client
//!
//! Drives the bridge exactly the way a script host does: start a task, then
//! poll it once per "frame" until it settles.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use scriptlink::{logging, Bridge, BridgeConfig, Reply, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

/// Host frame interval used between polls
const FRAME: Duration = Duration::from_millis(10);

#[derive(Parser)]
#[command(name = "slink")]
#[command(version)]
#[command(about = "Drive the scriptlink bridge from the command line", long_about = None)]
struct Cli {
    /// Path to scriptlink.toml (default: nearest one up from the working directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one request and print the result table as JSON
    Http {
        /// Request URL
        url: String,

        /// Request method
        #[arg(short = 'X', long, default_value = "GET")]
        method: String,

        /// Header as "Name: value" (repeatable)
        #[arg(short = 'H', long = "header", value_name = "NAME:VALUE")]
        headers: Vec<String>,

        /// Request body
        #[arg(short = 'd', long)]
        data: Option<String>,
    },

    /// Open a stream, send frames and print what comes back
    Stream {
        /// Stream URL (ws, wss, http or https)
        url: String,

        /// Origin header
        #[arg(long)]
        origin: Option<String>,

        /// Frame to send once connected (repeatable)
        #[arg(long = "send", value_name = "FRAME")]
        frames: Vec<String>,

        /// How long to keep reading after the frames were queued
        #[arg(long, default_value = "2000")]
        wait_ms: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => BridgeConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => {
            let cwd = std::env::current_dir().context("Failed to read working directory")?;
            BridgeConfig::find_and_load(&cwd).context("Failed to load scriptlink.toml")?
        }
    };
    logging::init(&config.logging);
    let bridge = Bridge::new(&config);

    match cli.command {
        Commands::Http {
            url,
            method,
            headers,
            data,
        } => cmd_http(&bridge, url, method, &headers, data),
        Commands::Stream {
            url,
            origin,
            frames,
            wait_ms,
        } => cmd_stream(&bridge, url, origin, frames, Duration::from_millis(wait_ms)),
    }
}

fn reply_value(reply: Reply) -> Result<Value> {
    match reply.error {
        Some(err) => Err(anyhow!(err)),
        None => Ok(reply.value),
    }
}

/// Poll `task` once per frame until it settles
fn settle(bridge: &Bridge, task: &Value) -> Result<Value> {
    loop {
        let reply = bridge.poll(task);
        if !reply.is_pending() {
            return reply_value(reply);
        }
        thread::sleep(FRAME);
    }
}

fn parse_header(raw: &str) -> Result<(String, Value)> {
    let (name, value) = raw
        .split_once(':')
        .with_context(|| format!("Header '{}' is not NAME:VALUE", raw))?;
    Ok((name.trim().to_string(), Value::from(value.trim())))
}

fn cmd_http(
    bridge: &Bridge,
    url: String,
    method: String,
    headers: &[String],
    data: Option<String>,
) -> Result<()> {
    let header = headers
        .iter()
        .map(|h| parse_header(h))
        .collect::<Result<BTreeMap<_, _>>>()?;
    let mut request = BTreeMap::new();
    request.insert("url".to_string(), Value::from(url));
    request.insert("method".to_string(), Value::from(method));
    request.insert("header".to_string(), Value::Map(header));
    if let Some(body) = data {
        request.insert("body".to_string(), Value::from(body));
    }

    let task = reply_value(bridge.http_request(&Value::Map(request)))?;
    let result = settle(bridge, &task);
    bridge.release(&task);
    let result = result.context("Request failed")?;

    let json = serde_json::to_string_pretty(&result).context("Failed to render result")?;
    println!("{}", json);
    Ok(())
}

fn cmd_stream(
    bridge: &Bridge,
    url: String,
    origin: Option<String>,
    frames: Vec<String>,
    wait: Duration,
) -> Result<()> {
    let mut config = BTreeMap::new();
    config.insert("url".to_string(), Value::from(url));
    if let Some(origin) = origin {
        config.insert("origin".to_string(), Value::from(origin));
    }

    let task = reply_value(bridge.open_stream(&Value::Map(config)))?;
    let conn = settle(bridge, &task);
    bridge.release(&task);
    let conn = conn.context("Failed to open stream")?;
    let outcome = exchange(bridge, &conn, frames, wait);
    bridge.release(&conn);
    outcome
}

fn exchange(bridge: &Bridge, conn: &Value, frames: Vec<String>, wait: Duration) -> Result<()> {
    let frames: Vec<Value> = frames.into_iter().map(Value::from).collect();
    if let Some(err) = bridge.write(conn, &frames) {
        bail!("Write failed: {}", err);
    }

    let deadline = Instant::now() + wait;
    while Instant::now() < deadline {
        let batch = reply_value(bridge.read(conn)).context("Stream failed")?;
        for frame in batch.as_list().unwrap_or_default() {
            let text = frame.as_bytes().map(String::from_utf8_lossy).unwrap_or_default();
            println!("{}", text);
        }
        thread::sleep(FRAME);
    }
    Ok(())
}
