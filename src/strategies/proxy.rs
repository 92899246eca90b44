use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use super::{ActionLog, FailureCounter, RecoveryAction};
use crate::config::StrategyConfig;
use crate::error::{ErrorCategory, ErrorRecord};
use crate::fallback::{FallbackContext, FallbackManager, OperationType};
use crate::manager::ErrorHandler;

/// Recovers PROXY failures, keyed by upstream `host:port`
pub struct ProxyRecoveryStrategy {
    fallback: Arc<FallbackManager>,
    failures: FailureCounter,
    retry_threshold: u32,
    last_action: ActionLog,
}

impl ProxyRecoveryStrategy {
    pub fn new(fallback: Arc<FallbackManager>) -> Self {
        Self::from_config(fallback, &StrategyConfig::default())
    }

    pub fn from_config(fallback: Arc<FallbackManager>, config: &StrategyConfig) -> Self {
        Self {
            fallback,
            failures: FailureCounter::default(),
            retry_threshold: config.proxy_retry_threshold,
            last_action: ActionLog::default(),
        }
    }

    /// Failures recorded so far for an upstream key (`host:port` or `unknown`)
    pub fn failure_count(&self, proxy_key: &str) -> u32 {
        self.failures.get(proxy_key)
    }

    pub async fn last_action(&self) -> Option<RecoveryAction> {
        self.last_action.get().await
    }
}

fn proxy_key(host: &str, port: &str) -> String {
    if host.is_empty() || port.is_empty() {
        "unknown".to_string()
    } else {
        format!("{}:{}", host, port)
    }
}

#[async_trait]
impl ErrorHandler for ProxyRecoveryStrategy {
    fn name(&self) -> &str {
        "proxy_recovery"
    }

    fn can_handle(&self, record: &ErrorRecord) -> bool {
        record.category() == ErrorCategory::Proxy
    }

    async fn handle(&self, record: &ErrorRecord) -> bool {
        info!(error_id = record.id(), "Attempting proxy recovery: {}", record.message());

        let proxy_host = record.context_value("proxy_host").unwrap_or_default();
        let proxy_port = record.context_value("proxy_port").unwrap_or_default();
        let key = proxy_key(&proxy_host, &proxy_port);

        let failures = self.failures.record(&key);
        if failures < self.retry_threshold {
            info!(proxy = %key, failures, "Retry recommended for proxy connection");
            self.last_action
                .set(RecoveryAction::RetryRecommended {
                    target: key,
                    failures,
                })
                .await;
            return true;
        }

        let context = FallbackContext::new(OperationType::ProxyConnection)
            .with("proxy_host", proxy_host)
            .with("proxy_port", proxy_port)
            .with("error_type", "proxy");

        match self.fallback.execute_fallback(&context).await {
            Ok(directive) => {
                info!(proxy = %key, "Proxy fallback successful");
                self.last_action
                    .set(RecoveryAction::Fallback { directive })
                    .await;
                true
            }
            Err(err) => {
                warn!(proxy = %key, error = %err, "Proxy fallback failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_key() {
        assert_eq!(proxy_key("10.0.0.1", "8080"), "10.0.0.1:8080");
        assert_eq!(proxy_key("10.0.0.1", ""), "unknown");
        assert_eq!(proxy_key("", "8080"), "unknown");
    }
}
