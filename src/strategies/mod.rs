//! Domain recovery handlers registered with the [`ErrorManager`](crate::manager::ErrorManager).
//!
//! Each strategy resolves one category of failure by composing the retry
//! engine, the shared fallback engine and its own in-memory state.

mod configuration;
mod network;
mod pac;
mod proxy;

pub use configuration::{default_configuration, ConfigurationRecoveryStrategy};
pub use network::NetworkRecoveryStrategy;
pub use pac::{attempt_pac_fix, validate_pac, CachedPac, PacRecoveryStrategy};
pub use proxy::ProxyRecoveryStrategy;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::fallback::FallbackDirective;

/// What a strategy did (or recommended) for the last record it handled
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RecoveryAction {
    /// The caller should retry the failed operation itself
    RetryRecommended { target: String, failures: u32 },
    /// A fallback strategy produced a directive
    Fallback { directive: FallbackDirective },
    /// The PAC file was downloaded again and verified
    PacDownloaded { source: String, content: String },
    /// Broken PAC content was repaired and now validates
    PacRepaired { content: String },
    /// Last working PAC content is reused
    CachedPac {
        source: Option<String>,
        content: String,
    },
    /// An explicitly backed-up configuration is restored
    BackupConfiguration {
        config_type: String,
        configuration: serde_json::Value,
    },
    /// A built-in default configuration is applied
    DefaultConfiguration {
        config_type: String,
        configuration: serde_json::Value,
    },
}

impl RecoveryAction {
    /// Fallback directive carried by the action, if any
    pub fn directive(&self) -> Option<&FallbackDirective> {
        match self {
            RecoveryAction::Fallback { directive } => Some(directive),
            _ => None,
        }
    }
}

/// Most recent action of a strategy
#[derive(Debug, Default)]
pub(crate) struct ActionLog(RwLock<Option<RecoveryAction>>);

impl ActionLog {
    pub(crate) async fn set(&self, action: RecoveryAction) {
        *self.0.write().await = Some(action);
    }

    pub(crate) async fn get(&self) -> Option<RecoveryAction> {
        self.0.read().await.clone()
    }
}

/// Per-target failure counters; they only ever grow
#[derive(Debug, Default)]
pub(crate) struct FailureCounter(DashMap<String, u32>);

impl FailureCounter {
    /// Count one more failure for `target` and return the new total
    pub(crate) fn record(&self, target: &str) -> u32 {
        let mut count = self.0.entry(target.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub(crate) fn get(&self, target: &str) -> u32 {
        self.0.get(target).map_or(0, |count| *count)
    }
}
