//! Job snapshot persistence
//!
//! Only the parameters and start time of each queued job are written; timer
//! handles are rebuilt on restore. All failures here are logged and degrade to
//! "nothing persisted" rather than reaching the user.

use crate::models::ResearchParameters;
use crate::storage::KeyValueStore;
use crate::types::ClientResult;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info, warn};

pub const STORAGE_KEY: &str = "deepresearch_active_jobs";

/// Serializable form of one queued job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedJob {
    pub parameters: ResearchParameters,
    /// Epoch milliseconds
    pub start_time: i64,
}

impl PersistedJob {
    /// Time since the job started, clamped at zero for clocks that moved backwards
    pub fn elapsed(&self, now_ms: i64) -> Duration {
        Duration::from_millis(now_ms.saturating_sub(self.start_time).max(0) as u64)
    }
}

/// Write the snapshot, logging instead of failing.
pub fn save(store: &dyn KeyValueStore, jobs: &[PersistedJob]) {
    let result: ClientResult<()> = serde_json::to_string(jobs)
        .map_err(Into::into)
        .and_then(|json| store.set(STORAGE_KEY, &json));

    if let Err(e) = result {
        error!("Failed to save jobs state: {}", e);
    }
}

/// Read the snapshot and drop entries older than `survival_window`.
///
/// An unreadable or unparsable snapshot is wiped so the next start is clean.
pub fn load(store: &dyn KeyValueStore, now_ms: i64, survival_window: Duration) -> Vec<PersistedJob> {
    let parsed = store.get(STORAGE_KEY).and_then(|saved| match saved {
        Some(json) => serde_json::from_str::<Vec<PersistedJob>>(&json)
            .map(Some)
            .map_err(Into::into),
        None => Ok(None),
    });

    let jobs = match parsed {
        Ok(Some(jobs)) => jobs,
        Ok(None) => return Vec::new(),
        Err(e) => {
            error!("Failed to load jobs state: {}", e);
            clear(store);
            return Vec::new();
        }
    };

    let total = jobs.len();
    let valid: Vec<PersistedJob> = jobs
        .into_iter()
        .filter(|job| job.elapsed(now_ms) <= survival_window)
        .collect();

    if valid.len() < total {
        info!(discarded = total - valid.len(), "Discarded expired job snapshots");
    }
    valid
}

pub fn clear(store: &dyn KeyValueStore) {
    if let Err(e) = store.remove(STORAGE_KEY) {
        warn!("Failed to clear jobs state: {}", e);
    }
}
