//! fabric CLI: run a worker process or drive channels by hand.

use channel_fabric::config::Config;
use channel_fabric::config::secrets::ExposeSecret;
use channel_fabric::db::Db;
use channel_fabric::fabric::{Fabric, Supervisor};
use channel_fabric::model::JobOptions;
use channel_fabric::queue::{CommandHandler, handler_fn};
use channel_fabric::telemetry::{TelemetryConfig, init_telemetry};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

#[derive(Parser)]
#[command(name = "fabric", about = "Distributed job channels over a shared registry")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a worker process: reconcile against the registry and process items
    Serve {
        /// Executable run once per item (item JSON on stdin, result JSON on stdout)
        #[arg(long)]
        handler: PathBuf,
        /// Print every event as a JSON line on stdout
        #[arg(long)]
        events: bool,
    },
    /// Declare a channel and enqueue one item per JSON line read from stdin
    Submit {
        channel: String,
        /// Close the channel's input once stdin is exhausted
        #[arg(long = "final")]
        finalize: bool,
        /// Attempts per item (overrides FABRIC_JOB_ATTEMPTS)
        #[arg(long)]
        attempts: Option<u32>,
        /// Per-attempt timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Close a channel's input
    Final { channel: String },
    /// Registry inspection
    Channels {
        #[command(subcommand)]
        action: ChannelsAction,
    },
}

#[derive(Subcommand)]
enum ChannelsAction {
    /// List every channel in the registry
    List,
    /// Show one channel's entry and counters
    Show { channel: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { handler, events } => cmd_serve(handler, events).await,
        Command::Submit {
            channel,
            finalize,
            attempts,
            timeout_ms,
        } => {
            let fabric = client_fabric().await?;
            cmd_submit(&fabric, &channel, finalize, attempts, timeout_ms).await
        }
        Command::Final { channel } => {
            let fabric = client_fabric().await?;
            fabric.finalize(&channel).await?;
            println!("Closed: {channel}");
            Ok(())
        }
        Command::Channels { action } => {
            let fabric = client_fabric().await?;
            match action {
                ChannelsAction::List => cmd_channels_list(&fabric).await,
                ChannelsAction::Show { channel } => cmd_channels_show(&fabric, &channel).await,
            }
        }
    }
}

/// A fabric for commands that only produce or inspect: no local workers.
async fn client_fabric() -> anyhow::Result<Fabric> {
    let config = Config::from_env()?;
    let db = Arc::new(Db::connect(config.database_url.expose_secret()).await?);
    db.migrate().await?;

    let mut settings = config.fabric;
    settings.concurrency = 0;
    let idle = handler_fn(|_, _| async { Ok(serde_json::Value::Null) });
    Ok(Fabric::new(settings, db.clone(), db, idle)?)
}

async fn cmd_serve(handler: PathBuf, print_events: bool) -> anyhow::Result<()> {
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "channel-fabric".to_string(),
        instance_id: std::process::id().to_string(),
        log_level: config.log_level.clone(),
    })?;

    let db = Arc::new(Db::connect(config.database_url.expose_secret()).await?);
    db.migrate().await?;

    let handler = Arc::new(CommandHandler::new(&handler)?);
    info!(handler = %handler.command().display(), "starting");

    let fabric = Fabric::new(config.fabric.clone(), db.clone(), db, handler)?;
    let supervisor = Supervisor::new(&fabric, config.fabric.fatal_policy)?;

    if print_events {
        let mut events = fabric.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(line) => println!("{line}"),
                        Err(e) => eprintln!("unprintable event: {e}"),
                    },
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        eprintln!("skipped {n} events");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    fabric.start();
    tokio::select! {
        result = supervisor.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            fabric.shutdown().await;
        }
    }
    Ok(())
}

async fn cmd_submit(
    fabric: &Fabric,
    channel: &str,
    finalize: bool,
    attempts: Option<u32>,
    timeout_ms: Option<u64>,
) -> anyhow::Result<()> {
    fabric.ready(channel).await?;

    let mut options = JobOptions::new();
    if let Some(n) = attempts {
        options = options.attempts(n);
    }
    if let Some(ms) = timeout_ms {
        options = options.timeout(Duration::from_millis(ms));
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut added = 0usize;
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let item: serde_json::Value = serde_json::from_str(line)
            .map_err(|e| anyhow::anyhow!("line {}: {e}", added + 1))?;
        fabric.add(channel, item, options).await?;
        added += 1;
    }
    println!("Added {added} item(s) to {channel}");

    if finalize {
        fabric.finalize(channel).await?;
        println!("Closed: {channel}");
    }
    fabric.shutdown().await;
    Ok(())
}

async fn cmd_channels_list(fabric: &Fabric) -> anyhow::Result<()> {
    let registry = fabric.registry();
    let entries = registry.get_all().await?;
    if entries.is_empty() {
        println!("No channels in {}.", registry.namespace());
        return Ok(());
    }

    println!(
        "{:<40}  {:<7}  {:>7}  {:>7}  {:>7}  STARTED",
        "CHANNEL", "STATUS", "TOTAL", "SUCCESS", "FAILED"
    );
    println!("{}", "-".repeat(100));
    for (name, entry) in &entries {
        let counters = registry.get_counters(name).await?;
        let (status, started) = match entry {
            Some(entry) => (
                entry.status.to_string(),
                entry
                    .started_at
                    .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "-".to_string()),
            ),
            None => ("corrupt".to_string(), "-".to_string()),
        };
        println!(
            "{:<40}  {:<7}  {:>7}  {:>7}  {:>7}  {}",
            name, status, counters.total, counters.success, counters.failed, started
        );
    }
    println!("\n{} channel(s)", entries.len());
    Ok(())
}

async fn cmd_channels_show(fabric: &Fabric, channel: &str) -> anyhow::Result<()> {
    let registry = fabric.registry();
    let Some(entry) = registry.get(channel).await? else {
        anyhow::bail!("no channel '{channel}' in {}", registry.namespace());
    };
    let counters = registry.get_counters(channel).await?;

    println!("Channel:    {channel}");
    println!("Status:     {}", entry.status);
    println!(
        "Started:    {}",
        entry
            .started_at
            .map(|at| at.to_string())
            .unwrap_or_else(|| "-".to_string())
    );
    println!("Total:      {}", counters.total);
    println!("Success:    {}", counters.success);
    println!("Failed:     {}", counters.failed);
    Ok(())
}
