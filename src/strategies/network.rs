use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use super::{ActionLog, FailureCounter, RecoveryAction};
use crate::config::StrategyConfig;
use crate::error::{ErrorCategory, ErrorRecord};
use crate::fallback::{FallbackContext, FallbackManager, OperationType};
use crate::manager::ErrorHandler;

/// Recovers NETWORK failures.
///
/// Recommends a retry while a host (or URL) has failed fewer than
/// `retry_threshold` times, then asks the fallback engine for a
/// `network_request` fallback.
pub struct NetworkRecoveryStrategy {
    fallback: Arc<FallbackManager>,
    failures: FailureCounter,
    retry_threshold: u32,
    last_action: ActionLog,
}

impl NetworkRecoveryStrategy {
    pub fn new(fallback: Arc<FallbackManager>) -> Self {
        Self::from_config(fallback, &StrategyConfig::default())
    }

    pub fn from_config(fallback: Arc<FallbackManager>, config: &StrategyConfig) -> Self {
        Self {
            fallback,
            failures: FailureCounter::default(),
            retry_threshold: config.network_retry_threshold,
            last_action: ActionLog::default(),
        }
    }

    /// Failures recorded so far for a host or URL
    pub fn failure_count(&self, target: &str) -> u32 {
        self.failures.get(target)
    }

    pub async fn last_action(&self) -> Option<RecoveryAction> {
        self.last_action.get().await
    }
}

#[async_trait]
impl ErrorHandler for NetworkRecoveryStrategy {
    fn name(&self) -> &str {
        "network_recovery"
    }

    fn can_handle(&self, record: &ErrorRecord) -> bool {
        record.category() == ErrorCategory::Network
    }

    async fn handle(&self, record: &ErrorRecord) -> bool {
        info!(error_id = record.id(), "Attempting network recovery: {}", record.message());

        let url = record.context_value("url").unwrap_or_default();
        let host = record.context_value("host").unwrap_or_default();
        let target = if host.is_empty() { url.clone() } else { host.clone() };

        // Without a target there is nothing to count, go straight to fallback
        if !target.is_empty() {
            let failures = self.failures.record(&target);
            if failures < self.retry_threshold {
                info!(endpoint = %target, failures, "Retry recommended for network connection");
                self.last_action
                    .set(RecoveryAction::RetryRecommended { target, failures })
                    .await;
                return true;
            }
        }

        let context = FallbackContext::new(OperationType::NetworkRequest)
            .with("url", url)
            .with("host", host)
            .with("error_type", "network");

        match self.fallback.execute_fallback(&context).await {
            Ok(directive) => {
                info!(endpoint = %target, "Network fallback successful");
                self.last_action
                    .set(RecoveryAction::Fallback { directive })
                    .await;
                true
            }
            Err(err) => {
                warn!(endpoint = %target, error = %err, "Network fallback failed");
                false
            }
        }
    }
}
