use anyhow::Result;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::jobs::OrchestratorSettings;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    pub jobs: JobConfig,
    pub status: StatusConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    pub api_key: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobConfig {
    pub grace_period_secs: u64,
    pub poll_interval_secs: u64,
    pub survival_window_secs: u64,
    pub restore_settle_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusConfig {
    pub rotation_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

impl JobConfig {
    pub fn settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            grace_period: Duration::from_secs(self.grace_period_secs),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            survival_window: Duration::from_secs(self.survival_window_secs),
            restore_settle: Duration::from_millis(self.restore_settle_ms),
        }
    }
}

impl StatusConfig {
    pub fn rotation_interval(&self) -> Duration {
        Duration::from_millis(self.rotation_interval_ms)
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            api: ApiConfig {
                base_url: env::var("DEEPRESEARCH_API_URL")
                    .unwrap_or_else(|_| "https://api.vertesia.io/api/v1".to_string())
                    .trim_end_matches('/')
                    .to_string(),
                api_key: env::var("DEEPRESEARCH_API_KEY").unwrap_or_default(),
                request_timeout_secs: env::var("DEEPRESEARCH_REQUEST_TIMEOUT")
                    .unwrap_or_else(|_| "60".to_string())
                    .parse()?,
            },
            jobs: JobConfig {
                grace_period_secs: env::var("JOB_GRACE_PERIOD_SECS")
                    .unwrap_or_else(|_| "300".to_string())
                    .parse()?,
                poll_interval_secs: env::var("JOB_POLL_INTERVAL_SECS")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()?,
                survival_window_secs: env::var("JOB_SURVIVAL_WINDOW_SECS")
                    .unwrap_or_else(|_| "1800".to_string())
                    .parse()?,
                restore_settle_ms: env::var("JOB_RESTORE_SETTLE_MS")
                    .unwrap_or_else(|_| "100".to_string())
                    .parse()?,
            },
            status: StatusConfig {
                rotation_interval_ms: env::var("STATUS_ROTATION_MS")
                    .unwrap_or_else(|_| "2000".to_string())
                    .parse()?,
            },
            storage: StorageConfig {
                data_dir: env::var("DEEPRESEARCH_DATA_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| default_data_dir()),
            },
        })
    }
}

/// XDG data directory, falling back to the working directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("deepresearch")
}
