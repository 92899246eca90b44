//! Shared setup for the recovery core integration tests

use serde_json::Value;

use px_recovery::{ErrorContext, RecoveryConfig, RecoveryCore};

pub const GOOD_PAC: &str =
    "function FindProxyForURL(url, host) {\n  return \"PROXY proxy.corp.local:8080\";\n}";

/// Defaults with PAC download backoff shrunk to milliseconds
pub fn fast_config() -> RecoveryConfig {
    let mut config = RecoveryConfig::default();
    config.strategies.pac_download.base_delay_secs = 0.01;
    config.strategies.pac_download.max_delay_secs = 0.05;
    config.strategies.pac_fetch_timeout_secs = 5;
    config
}

/// Core wired with the reqwest fetcher
pub async fn test_core() -> RecoveryCore {
    RecoveryCore::new(&fast_config())
        .await
        .expect("recovery core should build")
}

/// Build an error context from key/value pairs
pub fn context(pairs: &[(&str, Value)]) -> ErrorContext {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}
