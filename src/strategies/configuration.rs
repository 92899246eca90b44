use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{ActionLog, RecoveryAction};
use crate::error::{ErrorCategory, ErrorRecord};
use crate::fallback::{FallbackContext, FallbackManager, OperationType};
use crate::manager::ErrorHandler;

/// Built-in defaults for well-known configuration types
pub fn default_configuration(config_type: &str) -> Option<serde_json::Value> {
    match config_type {
        "proxy" => Some(json!({
            "listen_address": "127.0.0.1",
            "port": 3128,
            "mode": "manual"
        })),
        "pac" => Some(json!({
            "content": "function FindProxyForURL(url, host) { return \"DIRECT\"; }",
            "source": "default"
        })),
        "no_proxy" => Some(json!({
            "hosts": ["localhost", "127.0.0.1"],
            "enabled": true
        })),
        _ => None,
    }
}

/// Recovers CONFIGURATION failures by restoring a known-good configuration.
///
/// Tries an explicit backup first, then the fallback engine's cached
/// configuration, then the built-in defaults.
pub struct ConfigurationRecoveryStrategy {
    fallback: Arc<FallbackManager>,
    backups: DashMap<String, serde_json::Value>,
    last_action: ActionLog,
}

impl ConfigurationRecoveryStrategy {
    pub fn new(fallback: Arc<FallbackManager>) -> Self {
        Self {
            fallback,
            backups: DashMap::new(),
            last_action: ActionLog::default(),
        }
    }

    /// Keep a working configuration to restore on the next failure of this type
    pub fn backup_configuration(&self, config_type: impl Into<String>, configuration: serde_json::Value) {
        let config_type = config_type.into();
        debug!(config_type = %config_type, "Backed up configuration");
        self.backups.insert(config_type, configuration);
    }

    pub fn backup(&self, config_type: &str) -> Option<serde_json::Value> {
        self.backups.get(config_type).map(|entry| entry.value().clone())
    }

    pub async fn last_action(&self) -> Option<RecoveryAction> {
        self.last_action.get().await
    }
}

#[async_trait]
impl ErrorHandler for ConfigurationRecoveryStrategy {
    fn name(&self) -> &str {
        "configuration_recovery"
    }

    fn can_handle(&self, record: &ErrorRecord) -> bool {
        record.category() == ErrorCategory::Configuration
    }

    async fn handle(&self, record: &ErrorRecord) -> bool {
        info!(error_id = record.id(), "Attempting configuration recovery: {}", record.message());

        let config_type = record
            .context_value("config_type")
            .unwrap_or_else(|| "unknown".to_string());

        if let Some(configuration) = self.backup(&config_type) {
            info!(config_type = %config_type, "Using backup configuration");
            self.last_action
                .set(RecoveryAction::BackupConfiguration {
                    config_type,
                    configuration,
                })
                .await;
            return true;
        }

        let context = FallbackContext::new(OperationType::Configuration)
            .with("config_type", config_type.clone())
            .with("error_type", "configuration");

        match self.fallback.execute_fallback(&context).await {
            Ok(directive) => {
                info!(config_type = %config_type, "Configuration fallback successful");
                self.last_action
                    .set(RecoveryAction::Fallback { directive })
                    .await;
                return true;
            }
            Err(err) => {
                warn!(config_type = %config_type, error = %err, "Configuration fallback failed");
            }
        }

        if let Some(configuration) = default_configuration(&config_type) {
            info!(config_type = %config_type, "Using default configuration");
            self.last_action
                .set(RecoveryAction::DefaultConfiguration {
                    config_type,
                    configuration,
                })
                .await;
            return true;
        }

        warn!(config_type = %config_type, "No configuration available to recover");
        false
    }
}
