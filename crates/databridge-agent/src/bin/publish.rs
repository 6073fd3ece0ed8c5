//! # Event Publisher CLI
//!
//! Reads events as JSON lines from stdin and publishes them.
//!
//! ## Usage
//! ```bash
//! # One receiver, default agent config
//! cat events.jsonl | cargo run -p databridge-agent --bin databridge-publish -- \
//!     --receivers tcp://localhost:7611 --username admin --password admin
//!
//! # Two tiers, explicit config, give up on a full queue after 100ms
//! cargo run -p databridge-agent --bin databridge-publish -- \
//!     --config ./agent.toml \
//!     --receivers "{tcp://a:7611|tcp://b:7611},{tcp://c:7611}" \
//!     --wait-ms 100 < events.jsonl
//! ```
//!
//! ## Input Format
//! ```json
//! {"stream_id":"org.example.Stats:1.0.0","meta_data":["10.0.0.1"],"payload_data":["ok",42]}
//! ```
//!
//! The password may also come from `DATABRIDGE_PASSWORD`.

use std::env;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use databridge_agent::{
    Agent, AgentConfig, EventPublisher, PublishMode, PublishOutcome, TCP_PROTOCOL,
};
use databridge_core::Event;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

struct Options {
    config: Option<PathBuf>,
    protocol: String,
    receivers: String,
    auth: Option<String>,
    username: String,
    password: String,
    wait: Option<Duration>,
}

fn print_help() {
    println!("Databridge Event Publisher");
    println!();
    println!("Usage: databridge-publish --receivers <URLS> [OPTIONS] < events.jsonl");
    println!();
    println!("Options:");
    println!("  -c, --config <PATH>      Agent config file (default: platform config dir)");
    println!("  -p, --protocol <NAME>    Transport protocol (default: tcp)");
    println!("  -r, --receivers <URLS>   Receiver topology, e.g. {{tcp://a:7611|tcp://b:7611}}");
    println!("  -a, --auth <URLS>        Auth topology (default: derived from receivers)");
    println!("  -u, --username <NAME>    Username");
    println!("  -w, --password <PASS>    Password (or DATABRIDGE_PASSWORD)");
    println!("      --wait-ms <MS>       Max wait for queue capacity (default: block)");
    println!("  -h, --help               Show this help message");
}

/// Parses command line arguments. Returns `None` when help was requested.
fn parse_args() -> anyhow::Result<Option<Options>> {
    let args: Vec<String> = env::args().collect();

    let mut options = Options {
        config: None,
        protocol: TCP_PROTOCOL.to_string(),
        receivers: String::new(),
        auth: None,
        username: String::new(),
        password: env::var("DATABRIDGE_PASSWORD").unwrap_or_default(),
        wait: None,
    };

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        if flag == "--help" || flag == "-h" {
            print_help();
            return Ok(None);
        }

        let value = args
            .get(i + 1)
            .cloned()
            .with_context(|| format!("missing value for {}", flag))?;
        match flag {
            "--config" | "-c" => options.config = Some(PathBuf::from(value)),
            "--protocol" | "-p" => options.protocol = value,
            "--receivers" | "-r" => options.receivers = value,
            "--auth" | "-a" => options.auth = Some(value),
            "--username" | "-u" => options.username = value,
            "--password" | "-w" => options.password = value,
            "--wait-ms" => {
                let ms: u64 = value
                    .parse()
                    .with_context(|| format!("invalid --wait-ms: {}", value))?;
                options.wait = Some(Duration::from_millis(ms));
            }
            other => bail!("unknown option: {}", other),
        }
        i += 2;
    }

    if options.receivers.is_empty() {
        bail!("--receivers is required (see --help)");
    }
    Ok(Some(options))
}

/// Initializes the tracing subscriber.
///
/// `RUST_LOG` overrides the default `info` level.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,databridge_agent=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let Some(options) = parse_args()? else {
        return Ok(());
    };
    init_tracing();

    let config = AgentConfig::load(options.config.clone()).context("loading agent config")?;
    let agent = Agent::new(config)?;

    let mut builder = EventPublisher::builder(&options.protocol, &options.receivers)
        .credentials(&options.username, &options.password);
    if let Some(auth) = &options.auth {
        builder = builder.auth_urls(auth);
    }
    let publisher = builder.connect(&agent)?;

    let mode = match options.wait {
        Some(wait) => PublishMode::Timeout(wait),
        None => PublishMode::Blocking,
    };

    let started = Instant::now();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_no = 0usize;
    let mut invalid = 0usize;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let event: Event = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(e) => {
                warn!(line = line_no, error = %e, "Skipping invalid event");
                invalid += 1;
                continue;
            }
        };
        if let PublishOutcome::Dropped(reason) = publisher.publish_with(event, mode).await {
            warn!(line = line_no, ?reason, "Event not accepted");
        }
    }

    publisher.flush().await;
    let stats = publisher.stats();
    publisher.shutdown_with_agent().await;

    info!(
        lines = line_no,
        invalid,
        delivered = stats.delivered,
        dropped = stats.dropped,
        rejected = stats.rejected,
        elapsed = ?started.elapsed(),
        "Publishing complete"
    );

    if stats.dropped > 0 || stats.rejected > 0 {
        bail!(
            "{} events dropped, {} rejected",
            stats.dropped,
            stats.rejected
        );
    }
    Ok(())
}
