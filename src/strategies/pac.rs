use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::{ActionLog, RecoveryAction};
use crate::config::StrategyConfig;
use crate::error::{ErrorCategory, ErrorRecord, RecoveryError, RecoveryResult, RetryError};
use crate::fallback::{FallbackContext, FallbackManager, OperationType};
use crate::fetch::{is_remote_source, PacFetcher};
use crate::manager::ErrorHandler;
use crate::retry::{RetryManager, RetryPolicy};

const PAC_FUNCTION: &str = "FindProxyForURL";
const PAC_WRAPPER_OPEN: &str = "function FindProxyForURL(url, host) {\n";

static RETURN_WITHOUT_SEMICOLON: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)return\s+"([^"]+)"[ \t]*$"#).expect("return regex must compile")
});
static PAC_DECLARATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"function\s+FindProxyForURL").expect("declaration regex must compile"));
static UPPER_URL: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bURL\b").expect("URL regex must compile"));
static UPPER_HOST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bHOST\b").expect("HOST regex must compile"));

/// Structural check of a PAC script
pub fn validate_pac(content: &str) -> RecoveryResult<()> {
    let invalid = |reason: &str| {
        Err(RecoveryError::InvalidPac {
            reason: reason.to_string(),
        })
    };

    if content.trim().is_empty() {
        return invalid("content is empty");
    }
    if !content.contains(PAC_FUNCTION) {
        return invalid("missing FindProxyForURL function");
    }
    if content.matches('(').count() != content.matches(')').count() {
        return invalid("unbalanced parentheses");
    }
    if content.matches('{').count() != content.matches('}').count() {
        return invalid("unbalanced braces");
    }
    Ok(())
}

/// Close parentheses left open on a line, ahead of a trailing `{` or `;`
fn close_parens(line: &str) -> String {
    let open = line.matches('(').count();
    let close = line.matches(')').count();
    if open <= close {
        return line.to_string();
    }

    let missing = ")".repeat(open - close);
    let trimmed = line.trim_end();
    let trailing_ws = &line[trimmed.len()..];

    for tail in [" {", "{", ";"] {
        if let Some(head) = trimmed.strip_suffix(tail) {
            return format!("{}{}{}{}", head.trim_end(), missing, tail, trailing_ws);
        }
    }
    format!("{}{}{}", trimmed, missing, trailing_ws)
}

/// Heuristically repair common PAC mistakes.
///
/// Returns `None` when no change was made.
pub fn attempt_pac_fix(content: &str) -> Option<String> {
    if content.trim().is_empty() {
        return None;
    }

    let mut fixed = UPPER_URL.replace_all(content, "url").into_owned();
    fixed = UPPER_HOST.replace_all(&fixed, "host").into_owned();
    fixed = RETURN_WITHOUT_SEMICOLON
        .replace_all(&fixed, r#"return "${1}";"#)
        .into_owned();

    fixed = fixed
        .split('\n')
        .map(close_parens)
        .collect::<Vec<_>>()
        .join("\n");

    if !PAC_DECLARATION.is_match(&fixed) {
        fixed = format!("{}{}\n}}", PAC_WRAPPER_OPEN, fixed.trim_end());
    }

    let open = fixed.matches('{').count();
    let close = fixed.matches('}').count();
    if open > close {
        fixed = fixed.trim_end().to_string();
        for _ in close..open {
            fixed.push_str("\n}");
        }
    }

    if fixed == content {
        None
    } else {
        Some(fixed)
    }
}

/// Last PAC content known to work, with the source it came from
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CachedPac {
    pub content: Option<String>,
    pub source: Option<String>,
}

/// Recovers PAC_LOADING and PAC_VALIDATION failures
pub struct PacRecoveryStrategy {
    retry: RetryManager,
    fallback: Arc<FallbackManager>,
    fetcher: PacFetcher,
    download_policy: RetryPolicy,
    cache: RwLock<CachedPac>,
    last_action: ActionLog,
}

impl PacRecoveryStrategy {
    pub fn new(
        retry: RetryManager,
        fallback: Arc<FallbackManager>,
        fetcher: PacFetcher,
        download_policy: RetryPolicy,
    ) -> Self {
        Self {
            retry,
            fallback,
            fetcher,
            download_policy,
            cache: RwLock::new(CachedPac::default()),
            last_action: ActionLog::default(),
        }
    }

    /// Strategy downloading through reqwest with the configured policy
    pub fn from_config(
        retry: RetryManager,
        fallback: Arc<FallbackManager>,
        config: &StrategyConfig,
    ) -> RecoveryResult<Self> {
        let fetcher = PacFetcher::from_config(config)?;
        Ok(Self::new(retry, fallback, fetcher, config.pac_download.policy()))
    }

    pub async fn cached_pac(&self) -> CachedPac {
        self.cache.read().await.clone()
    }

    /// Remember PAC content that was verified to work
    pub async fn cache_working_pac(&self, content: impl Into<String>, source: impl Into<String>) {
        let source = source.into();
        let mut cache = self.cache.write().await;
        cache.content = Some(content.into());
        debug!(source = %source, "Cached working PAC");
        cache.source = Some(source);
    }

    /// Forget the cached content but keep its source as the last known good one
    pub async fn invalidate_cached_content(&self) {
        self.cache.write().await.content = None;
    }

    pub async fn last_action(&self) -> Option<RecoveryAction> {
        self.last_action.get().await
    }

    /// Download and verify a PAC script under the download policy
    async fn download(&self, url: &str) -> Result<String, RetryError<RecoveryError>> {
        let fetcher = &self.fetcher;
        self.retry
            .retry("pac_download", Some(&self.download_policy), || async move {
                let content = fetcher.fetch(url).await?;
                validate_pac(&content)?;
                Ok::<_, RecoveryError>(content)
            })
            .await
    }

    async fn use_cached(&self, reason: &str) -> bool {
        let cache = self.cached_pac().await;
        match cache.content {
            Some(content) => {
                info!(source = ?cache.source, "Using cached PAC content: {}", reason);
                self.last_action
                    .set(RecoveryAction::CachedPac {
                        source: cache.source,
                        content,
                    })
                    .await;
                true
            }
            None => false,
        }
    }

    async fn use_fallback(&self, context: FallbackContext) -> bool {
        match self.fallback.execute_fallback(&context).await {
            Ok(directive) => {
                info!("Using PAC fallback");
                self.last_action
                    .set(RecoveryAction::Fallback { directive })
                    .await;
                true
            }
            Err(err) => {
                error!(error = %err, "PAC fallback failed");
                false
            }
        }
    }

    async fn handle_loading_error(&self, record: &ErrorRecord) -> bool {
        let source = record.context_value("pac_source").unwrap_or_default();

        if is_remote_source(&source) {
            info!(source = %source, "Retrying PAC download");
            match self.download(&source).await {
                Ok(content) => {
                    self.cache_working_pac(content.clone(), source.clone()).await;
                    self.last_action
                        .set(RecoveryAction::PacDownloaded { source, content })
                        .await;
                    return true;
                }
                Err(err) => warn!(source = %source, error = %err, "PAC download retry failed"),
            }
        }

        if self.use_cached("PAC loading failed").await {
            return true;
        }

        let last_source = self.cache.read().await.source.clone();
        if let Some(last_source) = last_source.filter(|last| *last != source && is_remote_source(last)) {
            info!(source = %last_source, "Trying last working PAC source");
            match self.download(&last_source).await {
                Ok(content) => {
                    self.cache_working_pac(content.clone(), last_source.clone())
                        .await;
                    self.last_action
                        .set(RecoveryAction::PacDownloaded {
                            source: last_source,
                            content,
                        })
                        .await;
                    return true;
                }
                Err(err) => {
                    warn!(source = %last_source, error = %err, "Last working PAC source failed")
                }
            }
        }

        self.use_fallback(
            FallbackContext::new(OperationType::PacLoading).with("original_source", source),
        )
        .await
    }

    async fn handle_validation_error(&self, record: &ErrorRecord) -> bool {
        let content = record.context_value("pac_content").unwrap_or_default();

        if let Some(fixed) = attempt_pac_fix(&content) {
            match validate_pac(&fixed) {
                Ok(()) => {
                    info!("Repaired PAC syntax errors");
                    self.last_action
                        .set(RecoveryAction::PacRepaired { content: fixed })
                        .await;
                    return true;
                }
                Err(err) => debug!(error = %err, "Repaired PAC still invalid"),
            }
        }

        if self.use_cached("PAC validation failed").await {
            return true;
        }

        self.use_fallback(
            FallbackContext::new(OperationType::PacLoading)
                .with("validation_error", record.message()),
        )
        .await
    }
}

#[async_trait]
impl ErrorHandler for PacRecoveryStrategy {
    fn name(&self) -> &str {
        "pac_recovery"
    }

    fn can_handle(&self, record: &ErrorRecord) -> bool {
        matches!(
            record.category(),
            ErrorCategory::PacLoading | ErrorCategory::PacValidation
        )
    }

    async fn handle(&self, record: &ErrorRecord) -> bool {
        info!(error_id = record.id(), "Attempting PAC recovery: {}", record.message());

        match record.category() {
            ErrorCategory::PacLoading => self.handle_loading_error(record).await,
            ErrorCategory::PacValidation => self.handle_validation_error(record).await,
            _ => false,
        }
    }
}
