use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Identifier used to compute per-app configuration directories.
#[derive(Clone, Copy)]
pub struct AppId {
    /// Reverse-DNS style qualifier, e.g. `"com"`.
    pub qualifier: &'static str,
    /// Organization or vendor name, e.g. `"local"`.
    pub organization: &'static str,
    /// Application name, e.g. `"jobsd"`.
    pub application: &'static str,
}

/// Config and data location shared by the daemon and the CLI.
pub const JOBSD: AppId = AppId {
    qualifier: "com",
    organization: "local",
    application: "jobsd",
};

/// Application configuration persisted to `config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Tracing level to use if `RUST_LOG` is not set (e.g. `"info"`).
    pub log_level: String,
    /// Job store directory. Defaults to `<data dir>/jobs` when unset.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Sweep and retry tuning.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

/// When a run that followed a disconnection clears the retry counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryReset {
    /// Any successful run resets `retries` to zero.
    #[default]
    AfterSuccess,
    /// A successful retry keeps the count; the next regular run resets it.
    AfterNextScheduledRun,
}

/// Tuning knobs for the sweep, keep-alive and retry machinery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Interval between keep-alive pings for an in-flight job (ms).
    pub keep_alive_interval_ms: u64,
    /// A keep-alive older than `stale_multiplier * keep_alive_interval_ms` is stale.
    pub stale_multiplier: u32,
    /// Disconnection retries allowed before a run is recorded as failed.
    pub max_retries: u32,
    /// Floor for one-shot slack (ms). Also the sweep cadence.
    pub min_slack_ms: u64,
    /// Maximum characters of a failure message written into a job record.
    pub error_message_limit: usize,
    /// Retry counter reset policy.
    pub retry_reset: RetryReset,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval_ms: 60_000,
            stale_multiplier: 3,
            max_retries: 5,
            min_slack_ms: 60_000,
            error_message_limit: 200,
            retry_reset: RetryReset::AfterSuccess,
        }
    }
}

impl SchedulerConfig {
    /// Keep-alive ping interval.
    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms.max(1))
    }

    /// Reject values that would stall pinging or make every run look stale.
    pub fn validate(&self) -> Result<()> {
        if self.keep_alive_interval_ms == 0 {
            bail!("scheduler.keep_alive_interval_ms must be positive");
        }
        if self.stale_multiplier == 0 {
            bail!("scheduler.stale_multiplier must be positive");
        }
        if self.min_slack_ms == 0 {
            bail!("scheduler.min_slack_ms must be positive");
        }
        Ok(())
    }

    /// Age after which a recorded keep-alive no longer proves the run is alive (ms).
    pub fn stale_threshold_ms(&self) -> u64 {
        self.keep_alive_interval_ms
            .saturating_mul(u64::from(self.stale_multiplier))
    }

    /// How often the daemon sweeps for due jobs.
    pub fn sweep_interval(&self) -> Duration {
        // One sweep per minimum slack so no admissible one-shot window is skipped.
        Duration::from_millis(self.min_slack_ms.max(1))
    }
}

impl Config {
    /// Resolve the job store directory, preferring an explicit `data_dir`.
    pub fn store_dir(&self, app: &AppId) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(data_dir(app)?.join("jobs")),
        }
    }
}

fn project_dirs(app: &AppId) -> Result<ProjectDirs> {
    ProjectDirs::from(app.qualifier, app.organization, app.application)
        .ok_or_else(|| anyhow::anyhow!("failed to resolve ProjectDirs"))
}

/// Return the configuration directory for this app, creating it if needed.
pub fn config_dir(app: &AppId) -> Result<PathBuf> {
    let dir = project_dirs(app)?.config_dir().to_path_buf();
    fs::create_dir_all(&dir).with_context(|| format!("create config dir {}", dir.display()))?;
    Ok(dir)
}

/// Return the data directory for this app, creating it if needed.
pub fn data_dir(app: &AppId) -> Result<PathBuf> {
    let dir = project_dirs(app)?.data_dir().to_path_buf();
    fs::create_dir_all(&dir).with_context(|| format!("create data dir {}", dir.display()))?;
    Ok(dir)
}

/// Load `config.toml` from the app config dir or create a default one.
pub fn load_or_init(app: &AppId) -> Result<Config> {
    let path = config_dir(app)?.join("config.toml");
    load_or_init_at(&path)
}

/// Load the config at `path`, writing defaults there first if it does not exist.
pub fn load_or_init_at(path: &Path) -> Result<Config> {
    if path.exists() {
        let txt = fs::read_to_string(path)
            .with_context(|| format!("read {}", path.display()))?;
        let cfg: Config = toml::from_str(&txt)
            .with_context(|| format!("parse {}", path.display()))?;
        cfg.scheduler
            .validate()
            .with_context(|| format!("invalid {}", path.display()))?;
        Ok(cfg)
    } else {
        let cfg = Config {
            log_level: "info".to_string(),
            data_dir: None,
            scheduler: SchedulerConfig::default(),
        };
        save_config(path, &cfg)?;
        Ok(cfg)
    }
}

fn save_config(path: &Path, cfg: &Config) -> Result<()> {
    let s = toml::to_string_pretty(cfg)?;
    fs::write(path, s).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
