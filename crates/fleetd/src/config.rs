//! TOML configuration for the Fleet daemon.
//!
//! Every section is optional. Without a config file the daemon runs the
//! default four-worker fleet.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, bail};
use fleet_types::RouterConfig;
use serde::Deserialize;

/// Processing times of the default fleet, cycled when more workers are asked for.
const DEFAULT_PROCESSING_TIMES_MS: [u64; 4] = [100, 200, 150, 300];

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Ring and dispatcher tuning.
    pub router: RouterConfig,
    /// Simulated workers to register.
    pub workers: Vec<WorkerSection>,
    /// Logging configuration.
    pub log: LogSection,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            router: RouterConfig::default(),
            workers: default_workers(DEFAULT_PROCESSING_TIMES_MS.len()),
            log: LogSection::default(),
        }
    }
}

/// One `[[workers]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WorkerSection {
    /// Worker ID, unique within the fleet.
    pub id: String,
    /// Simulated time per task.
    #[serde(default = "default_processing_time_ms")]
    pub processing_time_ms: u64,
}

impl WorkerSection {
    pub fn processing_time(&self) -> Duration {
        Duration::from_millis(self.processing_time_ms)
    }
}

fn default_processing_time_ms() -> u64 {
    DEFAULT_PROCESSING_TIMES_MS[0]
}

/// `[log]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log level filter (e.g. `"info"`, `"debug"`).
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// `worker-1` .. `worker-n`, cycling through the default processing times.
pub fn default_workers(n: usize) -> Vec<WorkerSection> {
    (0..n)
        .map(|i| WorkerSection {
            id: format!("worker-{}", i + 1),
            processing_time_ms: DEFAULT_PROCESSING_TIMES_MS[i % DEFAULT_PROCESSING_TIMES_MS.len()],
        })
        .collect()
}

impl CliConfig {
    /// Load config from a TOML file, or return defaults if no path given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let config = match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)
                    .with_context(|| format!("failed to read {}", p.display()))?;
                Self::from_toml(&content)?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse config from a TOML string.
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Reject configs the router cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.router.replicas == 0 {
            bail!("router.replicas must be at least 1");
        }
        if self.router.queue_capacity == 0 {
            bail!("router.queue_capacity must be at least 1");
        }
        if self.router.worker_queue_capacity == 0 {
            bail!("router.worker_queue_capacity must be at least 1");
        }

        let mut seen = HashSet::new();
        for worker in &self.workers {
            if worker.id.is_empty() {
                bail!("worker id must not be empty");
            }
            if !seen.insert(worker.id.as_str()) {
                bail!("duplicate worker id {:?}", worker.id);
            }
        }
        Ok(())
    }
}
