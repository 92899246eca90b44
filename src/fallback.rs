use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::FallbackConfig;
use crate::error::{context_str, ErrorContext, RecoveryError, RecoveryResult};

/// Minimal PAC script that sends every request direct
pub const MINIMAL_PAC: &str = r#"function FindProxyForURL(url, host) {
    // Fallback PAC: direct connection for all requests
    return "DIRECT";
}
"#;

/// Kind of operation a fallback is requested for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    ProxyConnection,
    NetworkRequest,
    PacLoading,
    Configuration,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationType::ProxyConnection => write!(f, "proxy_connection"),
            OperationType::NetworkRequest => write!(f, "network_request"),
            OperationType::PacLoading => write!(f, "pac_loading"),
            OperationType::Configuration => write!(f, "configuration"),
        }
    }
}

/// Input to fallback selection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FallbackContext {
    pub operation_type: Option<OperationType>,
    #[serde(default)]
    pub values: ErrorContext,
}

impl FallbackContext {
    pub fn new(operation_type: OperationType) -> Self {
        Self {
            operation_type: Some(operation_type),
            values: ErrorContext::new(),
        }
    }

    /// Add a context value, skipping empty strings
    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        let value = value.into();
        if value.as_str().map_or(true, |s| !s.is_empty()) {
            self.values.insert(key.into(), value);
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<String> {
        context_str(&self.values, key)
    }

    fn is(&self, operation_type: OperationType) -> bool {
        self.operation_type == Some(operation_type)
    }

    fn operation_label(&self) -> String {
        self.operation_type
            .map(|op| op.to_string())
            .unwrap_or_else(|| "unspecified".to_string())
    }
}

/// What a successful fallback tells the caller to do
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FallbackDirective {
    /// Bypass the proxy entirely
    DirectConnection { reason: String },
    /// Route the listed hosts direct from now on
    NoProxy { hosts: Vec<String>, reason: String },
    /// Replace the PAC script with the given body
    DefaultPac {
        content: String,
        source: String,
        reason: String,
    },
    /// Re-apply a previously cached configuration
    CachedConfiguration {
        config_type: String,
        configuration: serde_json::Value,
        reason: String,
    },
    /// Result of a caller-supplied strategy
    Custom {
        strategy: String,
        payload: serde_json::Value,
    },
}

impl FallbackDirective {
    /// Proxy decision implied by the directive, if any
    pub fn proxy_decision(&self) -> Option<&'static str> {
        match self {
            FallbackDirective::DirectConnection { .. } | FallbackDirective::NoProxy { .. } => {
                Some("DIRECT")
            }
            _ => None,
        }
    }

    /// PAC body carried by the directive, if any
    pub fn pac_content(&self) -> Option<&str> {
        match self {
            FallbackDirective::DefaultPac { content, .. } => Some(content),
            _ => None,
        }
    }
}

/// A named, prioritised, conditionally applicable compensating action
pub trait FallbackStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Lower values are tried first
    fn priority(&self) -> u32 {
        100
    }

    fn can_fallback(&self, context: &FallbackContext) -> bool;

    fn execute_fallback(&self, context: &FallbackContext) -> RecoveryResult<FallbackDirective>;
}

/// Falls back to a direct connection when the upstream proxy fails
#[derive(Debug, Default)]
pub struct DirectConnectionFallback;

impl FallbackStrategy for DirectConnectionFallback {
    fn name(&self) -> &str {
        "direct_connection"
    }

    fn priority(&self) -> u32 {
        10
    }

    fn can_fallback(&self, context: &FallbackContext) -> bool {
        context.is(OperationType::ProxyConnection)
    }

    fn execute_fallback(&self, _context: &FallbackContext) -> RecoveryResult<FallbackDirective> {
        Ok(FallbackDirective::DirectConnection {
            reason: "Proxy connection failed, falling back to direct connection".to_string(),
        })
    }
}

/// Adds the failing host to the no-proxy set
#[derive(Debug, Default)]
pub struct NoProxyFallback;

impl FallbackStrategy for NoProxyFallback {
    fn name(&self) -> &str {
        "no_proxy"
    }

    fn priority(&self) -> u32 {
        15
    }

    fn can_fallback(&self, context: &FallbackContext) -> bool {
        context.is(OperationType::ProxyConnection) || context.is(OperationType::NetworkRequest)
    }

    fn execute_fallback(&self, context: &FallbackContext) -> RecoveryResult<FallbackDirective> {
        let host = context.get("host");
        let target = host
            .clone()
            .or_else(|| context.get("url"))
            .unwrap_or_default();

        Ok(FallbackDirective::NoProxy {
            hosts: host.into_iter().collect(),
            reason: format!(
                "Adding {} to no-proxy list due to connection failure",
                target
            ),
        })
    }
}

/// Substitutes a built-in PAC script when loading fails
#[derive(Debug)]
pub struct DefaultPacFallback {
    content: String,
}

impl Default for DefaultPacFallback {
    fn default() -> Self {
        Self {
            content: MINIMAL_PAC.to_string(),
        }
    }
}

impl DefaultPacFallback {
    /// Use custom PAC content instead of the minimal always-DIRECT script
    pub fn with_content(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }
}

impl FallbackStrategy for DefaultPacFallback {
    fn name(&self) -> &str {
        "default_pac"
    }

    fn priority(&self) -> u32 {
        20
    }

    fn can_fallback(&self, context: &FallbackContext) -> bool {
        context.is(OperationType::PacLoading)
    }

    fn execute_fallback(&self, _context: &FallbackContext) -> RecoveryResult<FallbackDirective> {
        Ok(FallbackDirective::DefaultPac {
            content: self.content.clone(),
            source: "fallback_default".to_string(),
            reason: "PAC loading failed, using default configuration".to_string(),
        })
    }
}

/// Re-applies a known-good configuration cached earlier
#[derive(Debug, Default)]
pub struct CachedConfigurationFallback {
    cached: DashMap<String, serde_json::Value>,
}

impl CachedConfigurationFallback {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember a working configuration for later fallback
    pub fn cache_configuration(&self, config_type: impl Into<String>, configuration: serde_json::Value) {
        let config_type = config_type.into();
        debug!(config_type = %config_type, "Cached configuration for fallback");
        self.cached.insert(config_type, configuration);
    }

    pub fn has_cached(&self, config_type: &str) -> bool {
        self.cached.contains_key(config_type)
    }

    pub fn cached(&self, config_type: &str) -> Option<serde_json::Value> {
        self.cached.get(config_type).map(|entry| entry.value().clone())
    }
}

impl FallbackStrategy for CachedConfigurationFallback {
    fn name(&self) -> &str {
        "cached_configuration"
    }

    fn priority(&self) -> u32 {
        30
    }

    fn can_fallback(&self, context: &FallbackContext) -> bool {
        context
            .get("config_type")
            .map_or(false, |config_type| self.has_cached(&config_type))
    }

    fn execute_fallback(&self, context: &FallbackContext) -> RecoveryResult<FallbackDirective> {
        let config_type = context.get("config_type").unwrap_or_default();
        let configuration = self.cached(&config_type).ok_or_else(|| {
            RecoveryError::MissingCachedConfiguration {
                config_type: config_type.clone(),
            }
        })?;

        Ok(FallbackDirective::CachedConfiguration {
            reason: format!("Using cached {} configuration", config_type),
            config_type,
            configuration,
        })
    }
}

/// Outcome of one fallback attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackOutcome {
    Success,
    Failed,
    NotApplicable,
}

/// Information about a fallback attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackAttempt {
    pub strategy_name: String,
    pub timestamp: DateTime<Utc>,
    pub outcome: FallbackOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-strategy counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyStats {
    pub total: usize,
    pub successful: usize,
}

/// Fallback statistics for reporting
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FallbackStats {
    pub total_fallbacks: usize,
    pub successful_fallbacks: usize,
    pub fallbacks_by_strategy: HashMap<String, StrategyStats>,
}

#[derive(Debug, Default)]
struct FallbackBook {
    history: VecDeque<FallbackAttempt>,
    stats: FallbackStats,
}

/// Runs fallback strategies in ascending priority order
pub struct FallbackManager {
    /// Sorted by priority; ties keep registration order
    strategies: RwLock<Vec<Arc<dyn FallbackStrategy>>>,
    cached_configuration: Arc<CachedConfigurationFallback>,
    book: Mutex<FallbackBook>,
    max_history_size: usize,
}

impl Default for FallbackManager {
    fn default() -> Self {
        Self::new()
    }
}

impl FallbackManager {
    /// Create a fallback manager with the built-in strategies registered
    pub fn new() -> Self {
        Self::from_config(&FallbackConfig::default())
    }

    /// Create a fallback manager with the built-in strategies and the given settings
    pub fn from_config(config: &FallbackConfig) -> Self {
        let cached_configuration = Arc::new(CachedConfigurationFallback::new());
        let mut strategies: Vec<Arc<dyn FallbackStrategy>> = vec![
            Arc::new(DirectConnectionFallback),
            Arc::new(DefaultPacFallback::default()),
            cached_configuration.clone(),
            Arc::new(NoProxyFallback),
        ];
        strategies.sort_by_key(|strategy| strategy.priority());

        Self {
            strategies: RwLock::new(strategies),
            cached_configuration,
            book: Mutex::new(FallbackBook::default()),
            max_history_size: config.max_history_size.max(1),
        }
    }

    /// Create a fallback manager with no strategies registered
    pub fn empty(max_history_size: usize) -> Self {
        Self {
            strategies: RwLock::new(Vec::new()),
            cached_configuration: Arc::new(CachedConfigurationFallback::new()),
            book: Mutex::new(FallbackBook::default()),
            max_history_size: max_history_size.max(1),
        }
    }

    /// Add a strategy, keeping the list ordered by priority
    pub async fn add_strategy(&self, strategy: Arc<dyn FallbackStrategy>) {
        let mut strategies = self.strategies.write().await;
        info!(strategy = strategy.name(), priority = strategy.priority(), "Added fallback strategy");
        strategies.push(strategy);
        // Stable sort keeps registration order among equal priorities
        strategies.sort_by_key(|strategy| strategy.priority());
    }

    /// Remove every strategy with the given name
    pub async fn remove_strategy(&self, name: &str) -> bool {
        let mut strategies = self.strategies.write().await;
        let before = strategies.len();
        strategies.retain(|strategy| strategy.name() != name);
        let removed = strategies.len() != before;
        if removed {
            info!(strategy = name, "Removed fallback strategy");
        }
        removed
    }

    /// Registered strategy names in the order they would be tried
    pub async fn strategy_names(&self) -> Vec<String> {
        self.strategies
            .read()
            .await
            .iter()
            .map(|strategy| strategy.name().to_string())
            .collect()
    }

    /// Cache a known-good configuration for the built-in cached-configuration strategy
    pub fn cache_configuration(&self, config_type: impl Into<String>, configuration: serde_json::Value) {
        self.cached_configuration
            .cache_configuration(config_type, configuration);
    }

    /// The built-in cached-configuration strategy
    pub fn cached_configuration(&self) -> Arc<CachedConfigurationFallback> {
        self.cached_configuration.clone()
    }

    /// Execute the first applicable strategy that succeeds
    pub async fn execute_fallback(&self, context: &FallbackContext) -> RecoveryResult<FallbackDirective> {
        let applicable = self.applicable(context).await;

        if applicable.is_empty() {
            warn!(operation = %context.operation_label(), "No applicable fallback strategies");
            self.push(FallbackAttempt {
                strategy_name: "none".to_string(),
                timestamp: Utc::now(),
                outcome: FallbackOutcome::NotApplicable,
                details: Some(format!("operation {}", context.operation_label())),
                error: None,
            })
            .await;
            return Err(RecoveryError::NoApplicableStrategy {
                operation: context.operation_label(),
            });
        }

        info!(
            operation = %context.operation_label(),
            candidates = applicable.len(),
            "Attempting fallback"
        );

        let mut attempted = Vec::with_capacity(applicable.len());
        for strategy in applicable {
            let name = strategy.name().to_string();
            debug!(strategy = %name, "Trying fallback strategy");

            match strategy.execute_fallback(context) {
                Ok(directive) => {
                    self.push(FallbackAttempt {
                        strategy_name: name.clone(),
                        timestamp: Utc::now(),
                        outcome: FallbackOutcome::Success,
                        details: Some(format!("Fallback successful with strategy {}", name)),
                        error: None,
                    })
                    .await;
                    info!(strategy = %name, "Fallback successful");
                    return Ok(directive);
                }
                Err(err) => {
                    warn!(strategy = %name, error = %err, "Fallback strategy failed");
                    self.push(FallbackAttempt {
                        strategy_name: name.clone(),
                        timestamp: Utc::now(),
                        outcome: FallbackOutcome::Failed,
                        details: Some(format!("Fallback failed: {}", err)),
                        error: Some(err.to_string()),
                    })
                    .await;
                    attempted.push(name);
                }
            }
        }

        error!(attempted = ?attempted, "All fallback strategies failed");
        Err(RecoveryError::AllStrategiesFailed { attempted })
    }

    /// Like [`FallbackManager::execute_fallback`] but returns `None` instead of failing
    pub async fn try_fallback(&self, context: &FallbackContext) -> Option<FallbackDirective> {
        self.execute_fallback(context).await.ok()
    }

    /// Names of the strategies applicable to `context`, in priority order
    pub async fn get_applicable_strategies(&self, context: &FallbackContext) -> Vec<String> {
        self.applicable(context)
            .await
            .iter()
            .map(|strategy| strategy.name().to_string())
            .collect()
    }

    /// Fallback history, optionally filtered by strategy name
    pub async fn get_fallback_history(&self, strategy_name: Option<&str>) -> Vec<FallbackAttempt> {
        let book = self.book.lock().await;
        book.history
            .iter()
            .filter(|attempt| strategy_name.map_or(true, |name| attempt.strategy_name == name))
            .cloned()
            .collect()
    }

    pub async fn get_stats(&self) -> FallbackStats {
        self.book.lock().await.stats.clone()
    }

    pub async fn clear_history(&self) {
        self.book.lock().await.history.clear();
        info!("Fallback history cleared");
    }

    async fn applicable(&self, context: &FallbackContext) -> Vec<Arc<dyn FallbackStrategy>> {
        self.strategies
            .read()
            .await
            .iter()
            .filter(|strategy| strategy.can_fallback(context))
            .cloned()
            .collect()
    }

    async fn push(&self, attempt: FallbackAttempt) {
        let mut book = self.book.lock().await;

        if attempt.outcome != FallbackOutcome::NotApplicable {
            book.stats.total_fallbacks += 1;
            let entry = book
                .stats
                .fallbacks_by_strategy
                .entry(attempt.strategy_name.clone())
                .or_default();
            entry.total += 1;
            if attempt.outcome == FallbackOutcome::Success {
                entry.successful += 1;
                book.stats.successful_fallbacks += 1;
            }
        }

        book.history.push_back(attempt);
        while book.history.len() > self.max_history_size {
            book.history.pop_front();
        }
    }
}
