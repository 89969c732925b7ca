use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use cronbridge_core::config::{BridgeConfig, CacheMode};
use cronbridge_core::types::{CallContext, Recurrence, ScheduledTask};
use cronbridge_hooks::{PollApi, QueueApi};
use cronbridge_router::Bridge;
use cronbridge_scheduler::catalog::by_interval;
use serde::Serialize;
use serde_json::Value;
use tracing::info;

mod daemon;

/// cronbridge — bridge between a request-triggered poll scheduler and a queue scheduler.
#[derive(Parser)]
#[command(name = "cronbridge", about, version, propagate_version = true)]
struct Cli {
    /// Config file (default: ~/.cronbridge/cronbridge.toml)
    #[arg(long, global = true, env = "CRONBRIDGE_CONFIG")]
    config: Option<String>,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show routing direction, cache state and queue depth
    Status,
    /// Enable the manifest cache, upgrading its table and migrating the legacy option
    Migrate,
    /// Copy the cached manifest back to the legacy option and drop the cache
    Revert,
    /// List the schedule catalog, shortest interval first
    Catalog,
    /// Find or create a catalog entry for an interval in seconds
    Reconcile { interval_secs: u64 },
    /// Run due poll events once, then purge finished queue actions
    Run {
        /// Unix timestamp to treat as now
        #[arg(long)]
        at: Option<i64>,
    },
    /// Schedule an event on the poll scheduler
    Schedule {
        hook: String,
        /// Catalog schedule name; omit for a one-shot event
        #[arg(long)]
        every: Option<String>,
        /// Unix timestamp of the first run (default: now)
        #[arg(long)]
        at: Option<i64>,
        /// JSON array of handler arguments
        #[arg(long)]
        args: Option<String>,
    },
    /// Add an action to the queue scheduler
    Enqueue {
        hook: String,
        /// Repeat every N seconds
        #[arg(long)]
        every_secs: Option<u64>,
        /// Unix timestamp of the first run; omit for an async action
        #[arg(long)]
        at: Option<i64>,
        /// JSON array of handler arguments
        #[arg(long)]
        args: Option<String>,
        #[arg(long, default_value = "")]
        group: String,
    },
    /// Drive the poll scheduler from a timer until interrupted
    Daemon {
        /// Seconds between runs
        #[arg(long, default_value_t = 60)]
        tick: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cronbridge=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = BridgeConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        BridgeConfig::default()
    });

    match cli.command {
        Commands::Migrate => config.cache.mode = CacheMode::Enabled,
        Commands::Revert => config.cache.mode = CacheMode::Revert,
        _ => {}
    }

    info!(path = %config.database.path, "opening SQLite database");
    let bridge = Bridge::open(config)?;
    let ctx = CallContext::new();

    match cli.command {
        Commands::Status | Commands::Migrate | Commands::Revert => {
            let status = bridge.status()?;
            print(cli.json, &status, || {
                format!(
                    "direction:      {:?}\ncache:          {:?} ({} table)\nflush pending:  {}\nmanifest:       {} events\nqueue:          {} pending\ncatalog:        {} entries ({} reconciled)",
                    status.direction,
                    status.cache_mode,
                    status.cache_schema,
                    status.flush_pending,
                    status.manifest_events,
                    status.pending_actions,
                    status.catalog_entries,
                    status.reconciled_entries,
                )
            })?;
        }
        Commands::Catalog => {
            let catalog = bridge.poll.schedules();
            let entries = by_interval(&catalog);
            print(cli.json, &entries, || {
                entries
                    .iter()
                    .map(|e| format!("{:<28} {:>9}s  {}", e.name, e.interval_secs, e.display))
                    .collect::<Vec<_>>()
                    .join("\n")
            })?;
        }
        Commands::Reconcile { interval_secs } => {
            if interval_secs == 0 {
                bail!("interval must be positive");
            }
            let name = bridge.reconciler.find_or_create(interval_secs)?;
            print(cli.json, &name, || name.clone())?;
        }
        Commands::Run { at } => {
            let now = at.unwrap_or_else(|| Utc::now().timestamp());
            let report = bridge.run(now)?;
            print(cli.json, &report, || {
                format!(
                    "ran {} / failed {} / skipped {}",
                    report.ran, report.failed, report.skipped
                )
            })?;
        }
        Commands::Schedule {
            hook,
            every,
            at,
            args,
        } => {
            let args = parse_args(args.as_deref())?;
            let timestamp = at.unwrap_or_else(|| Utc::now().timestamp());
            let task = match every {
                Some(name) => {
                    let entry = bridge
                        .poll
                        .schedules()
                        .remove(&name)
                        .with_context(|| format!("unknown schedule '{name}'"))?;
                    ScheduledTask::recurring(
                        &hook,
                        args,
                        timestamp,
                        Recurrence::named(&entry.name, entry.interval_secs),
                    )
                }
                None => ScheduledTask::once(&hook, args, timestamp),
            };
            let placement = bridge.request(|b| b.poll.schedule_task(&ctx, task))?;
            print(cli.json, &placement, || format!("{placement:?}"))?;
        }
        Commands::Enqueue {
            hook,
            every_secs,
            at,
            args,
            group,
        } => {
            let args = parse_args(args.as_deref())?;
            let placement = bridge.request(|b| match (every_secs, at) {
                (Some(interval), at) => b.queue.schedule_recurring(
                    &ctx,
                    at.unwrap_or_else(|| Utc::now().timestamp()),
                    interval,
                    &hook,
                    &args,
                    &group,
                ),
                (None, Some(at)) => b.queue.schedule_single(&ctx, at, &hook, &args, &group),
                (None, None) => b.queue.enqueue_async(&ctx, &hook, &args, &group),
            })?;
            print(cli.json, &placement, || format!("{placement:?}"))?;
        }
        Commands::Daemon { tick } => {
            if tick == 0 {
                bail!("tick must be positive");
            }
            let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
            let handle = tokio::spawn(daemon::run(
                Arc::new(bridge),
                Duration::from_secs(tick),
                shutdown_rx,
            ));
            tokio::signal::ctrl_c().await?;
            info!("interrupt received, stopping");
            let _ = shutdown_tx.send(true);
            handle.await?;
        }
    }

    Ok(())
}

fn parse_args(raw: Option<&str>) -> anyhow::Result<Vec<Value>> {
    match raw {
        None => Ok(Vec::new()),
        Some(raw) => serde_json::from_str(raw).context("--args must be a JSON array"),
    }
}

fn print<T: Serialize>(json: bool, value: &T, human: impl FnOnce() -> String) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{}", human());
    }
    Ok(())
}
