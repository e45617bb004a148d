//! Research history log
//!
//! Every successfully submitted research request is appended to a JSON array
//! so the user can download what they asked for later.

use crate::models::{ResearchModifiers, ResearchParameters};
use crate::storage::KeyValueStore;
use crate::types::{ClientError, ClientResult};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

pub const HISTORY_KEY: &str = "research_history";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub capability: String,
    pub framework: String,
    pub context: String,
    pub modifiers: ResearchModifiers,
}

impl HistoryEntry {
    fn from_parameters(params: &ResearchParameters, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            capability: params.capability.clone(),
            framework: params.framework.clone(),
            context: params.context.clone(),
            modifiers: params.modifiers.clone(),
        }
    }
}

/// Where submitted research requests are recorded.
pub trait ResearchHistory: Send + Sync {
    /// Best effort; implementations log their own failures.
    fn record(&self, params: &ResearchParameters);
    fn entries(&self) -> ClientResult<Vec<HistoryEntry>>;
}

/// History kept as one JSON array in a [`KeyValueStore`].
pub struct StoreHistory {
    store: Arc<dyn KeyValueStore>,
}

impl StoreHistory {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }
}

impl ResearchHistory for StoreHistory {
    fn record(&self, params: &ResearchParameters) {
        let entry = HistoryEntry::from_parameters(params, Utc::now());

        let result = self.entries().and_then(|mut history| {
            history.push(entry);
            let json = serde_json::to_string(&history)?;
            self.store.set(HISTORY_KEY, &json)?;
            Ok(history.len())
        });

        match result {
            Ok(total) => info!(total, "Research logged to history"),
            Err(e) => error!("Failed to log research history: {}", e),
        }
    }

    fn entries(&self) -> ClientResult<Vec<HistoryEntry>> {
        match self.store.get(HISTORY_KEY)? {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(Vec::new()),
        }
    }
}

/// Pretty-printed JSON export of the whole history
pub fn export_json(history: &dyn ResearchHistory) -> ClientResult<String> {
    let entries = history.entries()?;
    if entries.is_empty() {
        return Err(ClientError::InvalidRequest(
            "No research history to download. Submit a research request first.".to_string(),
        ));
    }
    Ok(serde_json::to_string_pretty(&entries)?)
}

pub fn export_file_name(date: NaiveDate) -> String {
    format!("research-history-{}.json", date.format("%Y-%m-%d"))
}
