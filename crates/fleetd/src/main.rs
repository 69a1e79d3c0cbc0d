//! `fleetd`: the Fleet router daemon.
//!
//! Builds a fleet of simulated workers from config, routes tasks over the
//! consistent hash ring and reports per-worker statistics.
//!
//! # Usage
//!
//! ```text
//! fleetd demo                          # default 4-worker fleet, fault-injection run
//! fleetd demo -c fleet.toml            # fleet and router tuning from a config file
//! fleetd demo --workers 8 --tasks 100  # larger run
//! fleetd route task-01 task-02         # print the owner of each task ID
//! ```

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fleet_router::{Dispatcher, RouterError, SimulatedWorker, Stats, Worker};
use fleet_types::Task;
use tracing::{info, warn};

use config::{CliConfig, default_workers};

/// Upper bound on waiting for the fleet to go quiet between demo phases.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(30);

// -----------------------------------------------------------------------
// CLI definition
// -----------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "fleetd", version, about = "Fleet consistent-hash task router")]
struct Cli {
    /// Path to TOML config file.
    #[arg(short, long, global = true, env = "FLEET_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the demo: submit tasks, fail a worker, remove it, bring it back.
    Demo {
        /// Replace the configured fleet with N default workers.
        #[arg(short, long)]
        workers: Option<usize>,

        /// Tasks in the first batch. Later batches submit half as many.
        #[arg(short, long, default_value = "20")]
        tasks: usize,

        /// Delay between submissions, in milliseconds.
        #[arg(short, long, default_value = "50")]
        interval_ms: u64,
    },

    /// Print the worker owning each task ID without dispatching anything.
    Route {
        /// Task IDs to look up.
        #[arg(required = true)]
        task_ids: Vec<String>,
    },
}

// -----------------------------------------------------------------------
// Entrypoint
// -----------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = CliConfig::load(cli.config.as_deref()).context("failed to load config")?;

    setup_tracing(&config.log.level);

    match cli.command {
        Commands::Demo {
            workers,
            tasks,
            interval_ms,
        } => {
            // CLI args override config file values.
            if let Some(n) = workers {
                config.workers = default_workers(n);
            }
            let stats = cmd_demo(&config, tasks, Duration::from_millis(interval_ms)).await?;
            print_stats(&stats);
            Ok(())
        }
        Commands::Route { task_ids } => {
            for (task_id, owner) in cmd_route(&config, &task_ids).await {
                println!("{task_id:<20} -> {}", owner.as_deref().unwrap_or("<none>"));
            }
            Ok(())
        }
    }
}

/// Initialize the `tracing` subscriber with the given level filter.
///
/// Respects `RUST_LOG` env var if set, otherwise uses the config value.
fn setup_tracing(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Build a dispatcher with every configured worker registered.
async fn build_fleet(config: &CliConfig) -> (Dispatcher, Vec<Arc<SimulatedWorker>>) {
    let dispatcher = Dispatcher::new(config.router.clone());
    let mut workers = Vec::with_capacity(config.workers.len());
    for section in &config.workers {
        let worker = SimulatedWorker::new(section.id.as_str(), section.processing_time());
        dispatcher.add_worker(worker.clone()).await;
        workers.push(worker);
    }
    (dispatcher, workers)
}

// -----------------------------------------------------------------------
// fleetd demo
// -----------------------------------------------------------------------

async fn cmd_demo(config: &CliConfig, tasks: usize, interval: Duration) -> Result<Stats> {
    let (dispatcher, workers) = build_fleet(config).await;
    info!(
        workers = workers.len(),
        replicas = config.router.replicas,
        queue_capacity = config.router.queue_capacity,
        "fleet ready"
    );
    dispatcher.start().context("failed to start dispatcher")?;

    let mut next_id = 1;
    info!(tasks, "submitting initial batch");
    submit_batch(&dispatcher, &mut next_id, tasks, interval).await;
    settle(&dispatcher).await;

    if let Some(victim) = workers.get(1) {
        let batch = tasks.div_ceil(2);

        info!(worker_id = %victim.id(), "injecting worker failure");
        victim.set_healthy(false);
        submit_batch(&dispatcher, &mut next_id, batch, interval).await;
        settle(&dispatcher).await;

        info!(worker_id = %victim.id(), "removing failed worker");
        dispatcher.remove_worker(victim.id().as_str()).await;

        info!(worker_id = %victim.id(), "restoring worker");
        victim.set_healthy(true);
        dispatcher.add_worker(victim.clone()).await;

        submit_batch(&dispatcher, &mut next_id, batch, interval).await;
        settle(&dispatcher).await;
    } else {
        warn!("fewer than two workers configured, skipping failure injection");
    }

    let stats = dispatcher.stats().await;
    dispatcher.stop().await;
    Ok(stats)
}

async fn submit_batch(
    dispatcher: &Dispatcher,
    next_id: &mut usize,
    count: usize,
    interval: Duration,
) {
    for _ in 0..count {
        let task = Task::new(
            format!("task-{:02}", *next_id),
            format!("payload {}", *next_id),
        );
        *next_id += 1;

        match dispatcher.submit(task) {
            Ok(()) => {}
            Err(e @ RouterError::QueueFull { .. }) => warn!(error = %e, "task rejected"),
            Err(e) => warn!(error = %e, "task not submitted"),
        }

        if !interval.is_zero() {
            tokio::time::sleep(interval).await;
        }
    }
}

/// Wait until the queue is empty and every dispatched task has finished.
async fn settle(dispatcher: &Dispatcher) {
    let quiet = async {
        loop {
            let d = dispatcher.stats().await.dispatch;
            if dispatcher.queue_len() == 0
                && d.resolved() == d.submitted
                && d.completed + d.failed == d.dispatched
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };

    if tokio::time::timeout(SETTLE_TIMEOUT, quiet).await.is_err() {
        warn!(timeout = ?SETTLE_TIMEOUT, "fleet did not settle, continuing");
    }
}

fn print_stats(stats: &Stats) {
    println!();
    println!(
        "{:<16} {:>10} {:>8} {:>8} {:>10}",
        "WORKER", "PROCESSED", "HEALTHY", "LOAD", "IN_FLIGHT"
    );
    for w in &stats.workers {
        println!(
            "{:<16} {:>10} {:>8} {:>8.3} {:>10}",
            w.id.as_str(),
            w.processed,
            w.healthy,
            w.load,
            w.in_flight
        );
    }

    let t = &stats.totals;
    let d = &stats.dispatch;
    println!();
    println!(
        "workers: {} ({} healthy)  processed: {}",
        t.worker_count, t.healthy_count, t.total_processed
    );
    println!(
        "submitted: {}  rejected: {}  dispatched: {}  completed: {}  failed: {}",
        d.submitted, d.rejected, d.dispatched, d.completed, d.failed
    );
    println!(
        "dropped: {} (no workers: {}, unhealthy: {}, saturated: {}, abandoned: {})",
        d.dropped(),
        d.dropped_no_workers,
        d.dropped_unhealthy,
        d.dropped_saturated,
        d.abandoned
    );
}

// -----------------------------------------------------------------------
// fleetd route
// -----------------------------------------------------------------------

async fn cmd_route(config: &CliConfig, task_ids: &[String]) -> Vec<(String, Option<String>)> {
    let (dispatcher, _workers) = build_fleet(config).await;
    let mut owners = Vec::with_capacity(task_ids.len());
    for task_id in task_ids {
        let owner = dispatcher
            .ring()
            .lookup(task_id)
            .await
            .ok()
            .map(|handle| handle.id().to_string());
        owners.push((task_id.clone(), owner));
    }
    owners
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
