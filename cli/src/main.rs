// peermesh — run a mesh coordinator from the command line
//
// `run` reads JSON command envelopes from stdin, one per line, and writes
// replies and notifications to stdout as JSON lines. Logs go to stderr, and
// optionally to a daily rolling file.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use peermesh_core::command::Reply;
use peermesh_core::{Coordinator, Notification, NotificationListener, SledStorage};
use serde_json::json;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "peermesh")]
#[command(about = "PeerMesh — node-local P2P mesh coordinator", long_about = None)]
#[command(version)]
struct Cli {
    /// Also write logs to daily rolling files in this directory
    #[arg(long, global = true)]
    log_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordinator, reading JSON commands from stdin
    Run,
    /// Apply a single JSON command against the local store and exit
    Send { command: String },
    /// Show coordinator status from the local store
    Status,
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
    /// Print the config file location
    Path,
}

fn init_logging(log_dir: Option<&str>) -> Option<WorkerGuard> {
    let filter =
        || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    match log_dir {
        Some(dir) => {
            use tracing_subscriber::layer::SubscriberExt;
            use tracing_subscriber::util::SubscriberInitExt;

            let appender = tracing_appender::rolling::daily(dir, "peermesh.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter())
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_writer(std::io::stderr)
                .init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::Config::load()?;

    let log_dir = cli.log_dir.clone().or_else(|| config.log_dir.clone());
    let _guard = init_logging(log_dir.as_deref());

    match cli.command {
        Commands::Run => cmd_run(config).await,
        Commands::Send { command } => cmd_send(config, command).await,
        Commands::Status => cmd_status(config).await,
        Commands::Config { action } => cmd_config(config, action),
    }
}

/// Prints each notification as one JSON line on stdout.
struct StdoutListener;

impl NotificationListener for StdoutListener {
    fn on_notification(&self, notification: &Notification) -> Result<(), String> {
        let line = serde_json::to_string(&json!({ "notification": notification }))
            .map_err(|e| e.to_string())?;
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{}", line).map_err(|e| e.to_string())
    }
}

fn open_coordinator(config: &config::Config) -> Result<Coordinator> {
    let storage_dir = config.storage_dir()?;
    let storage_path = storage_dir
        .to_str()
        .context("Storage path is not valid UTF-8")?;
    let backend = SledStorage::open(storage_path)
        .with_context(|| format!("Failed to open store at {}", storage_dir.display()))?;
    Ok(Coordinator::new(config.coordinator.clone(), Arc::new(backend)))
}

fn print_outcome(result: std::result::Result<Option<Reply>, peermesh_core::CoordinatorError>) -> Result<()> {
    let line = match result {
        Ok(Some(reply)) => json!({ "reply": reply }),
        Ok(None) => json!({ "ok": true }),
        Err(e) => json!({ "error": e.to_string() }),
    };
    println!("{}", serde_json::to_string(&line)?);
    Ok(())
}

async fn cmd_run(config: config::Config) -> Result<()> {
    let mut coordinator = open_coordinator(&config)?;
    coordinator.subscribe(Arc::new(StdoutListener));

    let (handle, task) = coordinator.spawn();
    tracing::info!("Reading commands from stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                print_outcome(handle.request_json(line).await)?;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
        }
    }

    handle.shutdown().await.ok();
    task.await.context("Coordinator task panicked")?;
    Ok(())
}

async fn cmd_send(config: config::Config, command: String) -> Result<()> {
    let mut coordinator = open_coordinator(&config)?;
    coordinator.subscribe(Arc::new(StdoutListener));

    let result = coordinator.dispatch_json(&command).await;
    coordinator
        .store()
        .flush()
        .await
        .context("Failed to flush store")?;
    print_outcome(result)
}

async fn cmd_status(config: config::Config) -> Result<()> {
    let mut coordinator = open_coordinator(&config)?;
    let status = coordinator.status().await;

    println!("{}", "PeerMesh Status".bold());
    println!();
    println!("  Store:             {}", config.storage_dir()?.display().to_string().bright_cyan());
    println!(
        "  Store ready:       {}",
        if status.store_ready { "yes".green() } else { "no".red() }
    );
    println!("  Pending signals:   {}", status.pending_signals);
    println!("  Pending messages:  {}", status.pending_messages);
    println!();
    println!(
        "  {}",
        "Peers and connections are rebuilt lazily; use `peermesh run` for live counts.".dimmed()
    );
    Ok(())
}

fn cmd_config(mut config: config::Config, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();
            for (key, value) in config.list() {
                println!("  {:<24} {}", key.bright_cyan(), value);
            }
        }

        ConfigAction::Path => {
            println!("{}", config::Config::config_file()?.display());
        }
    }

    Ok(())
}
