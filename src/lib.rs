//! Error-recovery core of the proxy-monitoring client.
//!
//! Failures enter through [`ErrorManager::handle_error`], are deduplicated and
//! recorded, then dispatched to the recovery strategies, which compose the
//! [`RetryManager`] and the [`FallbackManager`] to resolve them.

use std::sync::Arc;

pub mod backoff;
pub mod cancel;
pub mod config;
pub mod error;
pub mod fallback;
pub mod fetch;
pub mod manager;
pub mod reporter;
pub mod retry;
pub mod strategies;

pub use backoff::BackoffStrategy;
pub use cancel::CancellationToken;
pub use config::RecoveryConfig;
pub use error::{
    Classify, ErrorCategory, ErrorContext, ErrorRecord, ErrorRecordBuilder, ErrorSeverity,
    FailureKind, RecoveryError, RecoveryResult, RetryError,
};
pub use fallback::{
    FallbackAttempt, FallbackContext, FallbackDirective, FallbackManager, FallbackOutcome,
    FallbackStrategy, OperationType,
};
pub use fetch::{HttpClient, PacFetcher, ReqwestHttpClient};
pub use manager::{CallbackId, ErrorHandler, ErrorManager, ErrorStats, HandlerId};
pub use reporter::{ErrorReporter, ReportSnapshot};
pub use retry::{RetryAttempt, RetryId, RetryManager, RetryOutcome, RetryPolicy};
pub use strategies::{
    ConfigurationRecoveryStrategy, NetworkRecoveryStrategy, PacRecoveryStrategy,
    ProxyRecoveryStrategy, RecoveryAction,
};

/// One error manager wired to the four recovery strategies.
///
/// The strategies share a single fallback engine, so a configuration cached
/// through [`FallbackManager::cache_configuration`] is visible to all of them.
pub struct RecoveryCore {
    pub manager: Arc<ErrorManager>,
    pub retry: RetryManager,
    pub fallback: Arc<FallbackManager>,
    pub pac: Arc<PacRecoveryStrategy>,
    pub network: Arc<NetworkRecoveryStrategy>,
    pub proxy: Arc<ProxyRecoveryStrategy>,
    pub configuration: Arc<ConfigurationRecoveryStrategy>,
}

impl RecoveryCore {
    /// Build the core with a reqwest-backed PAC fetcher
    pub async fn new(config: &RecoveryConfig) -> RecoveryResult<Self> {
        let fetcher = PacFetcher::from_config(&config.strategies)?;
        Ok(Self::with_fetcher(config, fetcher).await)
    }

    /// Build the core with a caller-supplied PAC fetcher
    pub async fn with_fetcher(config: &RecoveryConfig, fetcher: PacFetcher) -> Self {
        let manager = Arc::new(ErrorManager::from_config(&config.manager));
        let retry = RetryManager::from_config(&config.retry);
        let fallback = Arc::new(FallbackManager::from_config(&config.fallback));

        let pac = Arc::new(PacRecoveryStrategy::new(
            retry.clone(),
            fallback.clone(),
            fetcher,
            config.strategies.pac_download.policy(),
        ));
        let network = Arc::new(NetworkRecoveryStrategy::from_config(
            fallback.clone(),
            &config.strategies,
        ));
        let proxy = Arc::new(ProxyRecoveryStrategy::from_config(
            fallback.clone(),
            &config.strategies,
        ));
        let configuration = Arc::new(ConfigurationRecoveryStrategy::new(fallback.clone()));

        manager.add_handler(pac.clone()).await;
        manager.add_handler(network.clone()).await;
        manager.add_handler(proxy.clone()).await;
        manager.add_handler(configuration.clone()).await;

        Self {
            manager,
            retry,
            fallback,
            pac,
            network,
            proxy,
            configuration,
        }
    }
}

#[cfg(test)]
mod tests;
