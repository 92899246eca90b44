use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info};

use crate::backoff::BackoffStrategy;
use crate::retry::RetryPolicy;

// Default configuration values
const DEFAULT_MAX_HISTORY: usize = 1000;
const DEFAULT_SUPPRESSION_SECS: u64 = 300;
const DEFAULT_UNHANDLED_CAPACITY: usize = 64;
const DEFAULT_FALLBACK_HISTORY: usize = 500;
const DEFAULT_RETRY_STATS_CAPACITY: usize = 1000;
const DEFAULT_NETWORK_RETRY_THRESHOLD: u32 = 3;
const DEFAULT_PROXY_RETRY_THRESHOLD: u32 = 2;
const DEFAULT_PAC_FETCH_TIMEOUT_SECS: u64 = 10;
const DEFAULT_USER_AGENT: &str = "px-ui-client/1.0";

/// Top-level configuration for the recovery core
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Error intake settings
    #[serde(default)]
    pub manager: ManagerConfig,
    /// Default retry policy settings
    #[serde(default)]
    pub retry: RetryConfig,
    /// Fallback engine settings
    #[serde(default)]
    pub fallback: FallbackConfig,
    /// Recovery strategy settings
    #[serde(default)]
    pub strategies: StrategyConfig,
}

/// Error manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Maximum number of records kept in history
    #[serde(default = "default_max_history")]
    pub max_history_size: usize,
    /// Window during which a repeated (category, message) pair is dropped
    #[serde(default = "default_suppression_secs")]
    pub suppression_window_secs: u64,
    /// Buffer size of the unhandled-error broadcast channel
    #[serde(default = "default_unhandled_capacity")]
    pub unhandled_channel_capacity: usize,
}

/// Default retry policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: f64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: f64,
    #[serde(default = "default_true")]
    pub jitter: bool,
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
    /// Number of finished invocations whose attempt history is kept
    #[serde(default = "default_retry_stats_capacity")]
    pub stats_capacity: usize,
}

/// Fallback engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Maximum number of fallback attempts kept in history
    #[serde(default = "default_fallback_history")]
    pub max_history_size: usize,
}

/// Recovery strategy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Consecutive failures per host/URL before network recovery stops recommending retry
    #[serde(default = "default_network_threshold")]
    pub network_retry_threshold: u32,
    /// Consecutive failures per upstream proxy before proxy recovery stops recommending retry
    #[serde(default = "default_proxy_threshold")]
    pub proxy_retry_threshold: u32,
    /// Policy used to re-download a PAC file
    #[serde(default)]
    pub pac_download: PacDownloadConfig,
    /// Per-request timeout for PAC downloads
    #[serde(default = "default_pac_fetch_timeout")]
    pub pac_fetch_timeout_secs: u64,
    /// User-Agent header sent with PAC downloads
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

/// PAC re-download retry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacDownloadConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: f64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_pac_max_delay_secs")]
    pub max_delay_secs: f64,
}

// Default functions
fn default_max_history() -> usize {
    std::env::var("PX_RECOVERY_MAX_HISTORY")
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(DEFAULT_MAX_HISTORY)
}

fn default_suppression_secs() -> u64 {
    std::env::var("PX_RECOVERY_SUPPRESSION_SECS")
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(DEFAULT_SUPPRESSION_SECS)
}

fn default_unhandled_capacity() -> usize {
    DEFAULT_UNHANDLED_CAPACITY
}

fn default_fallback_history() -> usize {
    std::env::var("PX_RECOVERY_FALLBACK_HISTORY")
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(DEFAULT_FALLBACK_HISTORY)
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_secs() -> f64 {
    1.0
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_secs() -> f64 {
    60.0
}

fn default_pac_max_delay_secs() -> f64 {
    10.0
}

fn default_true() -> bool {
    true
}

fn default_jitter_factor() -> f64 {
    0.1
}

fn default_retry_stats_capacity() -> usize {
    DEFAULT_RETRY_STATS_CAPACITY
}

fn default_network_threshold() -> u32 {
    DEFAULT_NETWORK_RETRY_THRESHOLD
}

fn default_proxy_threshold() -> u32 {
    DEFAULT_PROXY_RETRY_THRESHOLD
}

fn default_pac_fetch_timeout() -> u64 {
    DEFAULT_PAC_FETCH_TIMEOUT_SECS
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::ZERO)
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_history_size: default_max_history(),
            suppression_window_secs: default_suppression_secs(),
            unhandled_channel_capacity: default_unhandled_capacity(),
        }
    }
}

impl ManagerConfig {
    pub fn suppression_window(&self) -> Duration {
        Duration::from_secs(self.suppression_window_secs)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay_secs(),
            multiplier: default_multiplier(),
            max_delay_secs: default_max_delay_secs(),
            jitter: true,
            jitter_factor: default_jitter_factor(),
            stats_capacity: default_retry_stats_capacity(),
        }
    }
}

impl RetryConfig {
    /// Build the default retry policy described by this section
    pub fn policy(&self) -> RetryPolicy {
        let backoff = BackoffStrategy::Exponential {
            multiplier: self.multiplier,
            max_delay: secs(self.max_delay_secs),
            jitter: self.jitter,
            jitter_factor: self.jitter_factor.clamp(0.0, 1.0),
        };

        RetryPolicy::default()
            .with_max_attempts(self.max_attempts)
            .with_base_delay(secs(self.base_delay_secs))
            .with_backoff(backoff)
    }
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            max_history_size: default_fallback_history(),
        }
    }
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            network_retry_threshold: default_network_threshold(),
            proxy_retry_threshold: default_proxy_threshold(),
            pac_download: PacDownloadConfig::default(),
            pac_fetch_timeout_secs: default_pac_fetch_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

impl StrategyConfig {
    pub fn pac_fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.pac_fetch_timeout_secs)
    }
}

impl Default for PacDownloadConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay_secs(),
            multiplier: default_multiplier(),
            max_delay_secs: default_pac_max_delay_secs(),
        }
    }
}

impl PacDownloadConfig {
    /// Policy for PAC re-downloads: exponential backoff, retried only on transport failures
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::network()
            .with_max_attempts(self.max_attempts)
            .with_base_delay(secs(self.base_delay_secs))
            .with_backoff(BackoffStrategy::exponential(
                self.multiplier,
                secs(self.max_delay_secs),
            ))
    }
}

impl RecoveryConfig {
    /// Load configuration from a JSON file, falling back to defaults when it does not exist
    pub async fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("No configuration at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let config_str = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: RecoveryConfig = serde_json::from_str(&config_str)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        debug!("Loaded configuration from {}", path.display());

        Ok(config)
    }

    /// Save configuration to a JSON file
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let config_str = serde_json::to_string_pretty(self)?;
        fs::write(path, config_str).await?;
        debug!("Saved configuration to {}", path.display());

        Ok(())
    }
}
