//! In-memory error statistics fed by the error manager's subscriber callbacks.

use anyhow::{anyhow, Result};
use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::error::ErrorRecord;
use crate::manager::{CallbackId, ErrorManager};

const HOUR_FORMAT: &str = "%Y-%m-%d %H:00";
const DAY_FORMAT: &str = "%Y-%m-%d";
const HOURLY_RETENTION_DAYS: i64 = 7;
const DEFAULT_TOP_ERRORS: usize = 10;

#[derive(Debug, Default)]
struct ReportState {
    total_errors: u64,
    by_severity: BTreeMap<String, u64>,
    by_category: BTreeMap<String, u64>,
    by_hour: BTreeMap<String, u64>,
    by_day: BTreeMap<String, u64>,
    signatures: HashMap<String, u64>,
    recovery_attempted: u64,
    recovery_successful: u64,
}

/// Serialisable view of the aggregated statistics
#[derive(Debug, Clone, Serialize)]
pub struct ReportSnapshot {
    pub total_errors: u64,
    pub errors_by_severity: BTreeMap<String, u64>,
    pub errors_by_category: BTreeMap<String, u64>,
    /// Hourly buckets of the last seven days
    pub errors_by_hour: BTreeMap<String, u64>,
    pub errors_by_day: BTreeMap<String, u64>,
    /// `category:message` signatures, most frequent first
    pub most_common_errors: Vec<(String, u64)>,
    pub recovery_attempted: u64,
    pub recovery_successful: u64,
    pub recovery_success_rate: f64,
}

/// Aggregates finalized error records; writes nothing to disk
#[derive(Clone)]
pub struct ErrorReporter {
    state: Arc<Mutex<ReportState>>,
    top_errors: usize,
}

impl Default for ErrorReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorReporter {
    pub fn new() -> Self {
        Self::with_top_errors(DEFAULT_TOP_ERRORS)
    }

    /// Keep `top_errors` entries in [`ReportSnapshot::most_common_errors`]
    pub fn with_top_errors(top_errors: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(ReportState::default())),
            top_errors,
        }
    }

    /// Subscribe to every record the manager finalizes
    pub async fn attach(&self, manager: &ErrorManager) -> CallbackId {
        let reporter = self.clone();
        manager
            .add_callback(move |record| reporter.record(record))
            .await
    }

    /// Fold one record into the statistics
    pub fn record(&self, record: &ErrorRecord) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow!("error reporter state is poisoned"))?;

        state.total_errors += 1;
        *state
            .by_severity
            .entry(record.severity().to_string())
            .or_insert(0) += 1;
        *state
            .by_category
            .entry(record.category().to_string())
            .or_insert(0) += 1;

        let timestamp = record.timestamp();
        *state
            .by_hour
            .entry(timestamp.format(HOUR_FORMAT).to_string())
            .or_insert(0) += 1;
        *state
            .by_day
            .entry(timestamp.format(DAY_FORMAT).to_string())
            .or_insert(0) += 1;

        let signature = format!("{}:{}", record.category().as_str(), record.message());
        *state.signatures.entry(signature).or_insert(0) += 1;

        if record.recovery_attempted() {
            state.recovery_attempted += 1;
        }
        if record.recovery_successful() {
            state.recovery_successful += 1;
        }

        // Hour keys sort chronologically as strings
        let cutoff = (Utc::now() - ChronoDuration::days(HOURLY_RETENTION_DAYS))
            .format(HOUR_FORMAT)
            .to_string();
        state.by_hour.retain(|hour, _| *hour >= cutoff);

        debug!(error_id = record.id(), "Recorded error in report");
        Ok(())
    }

    pub fn snapshot(&self) -> Result<ReportSnapshot> {
        let state = self
            .state
            .lock()
            .map_err(|_| anyhow!("error reporter state is poisoned"))?;

        let mut most_common: Vec<(String, u64)> = state
            .signatures
            .iter()
            .map(|(signature, count)| (signature.clone(), *count))
            .collect();
        most_common.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        most_common.truncate(self.top_errors);

        Ok(ReportSnapshot {
            total_errors: state.total_errors,
            errors_by_severity: state.by_severity.clone(),
            errors_by_category: state.by_category.clone(),
            errors_by_hour: state.by_hour.clone(),
            errors_by_day: state.by_day.clone(),
            most_common_errors: most_common,
            recovery_attempted: state.recovery_attempted,
            recovery_successful: state.recovery_successful,
            recovery_success_rate: if state.recovery_attempted > 0 {
                state.recovery_successful as f64 / state.recovery_attempted as f64
            } else {
                0.0
            },
        })
    }

    pub fn reset(&self) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow!("error reporter state is poisoned"))?;
        *state = ReportState::default();
        Ok(())
    }
}
