use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Free-form key/value context attached to an error record.
///
/// Recognised keys are a convention only: `pac_source`, `pac_content`, `url`,
/// `host`, `proxy_host`, `proxy_port`, `config_type`.
pub type ErrorContext = HashMap<String, serde_json::Value>;

/// Read a context value as a string, stringifying scalars.
pub fn context_str(context: &ErrorContext, key: &str) -> Option<String> {
    match context.get(key)? {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Subsystem an error originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    PacValidation,
    PacLoading,
    Network,
    Proxy,
    Configuration,
    Authentication,
    System,
    Ui,
}

impl ErrorCategory {
    /// Every category, in declaration order
    pub const ALL: [ErrorCategory; 8] = [
        ErrorCategory::PacValidation,
        ErrorCategory::PacLoading,
        ErrorCategory::Network,
        ErrorCategory::Proxy,
        ErrorCategory::Configuration,
        ErrorCategory::Authentication,
        ErrorCategory::System,
        ErrorCategory::Ui,
    ];

    /// Lower-case key used in suppression signatures and reports
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::PacValidation => "pac_validation",
            ErrorCategory::PacLoading => "pac_loading",
            ErrorCategory::Network => "network",
            ErrorCategory::Proxy => "proxy",
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::System => "system",
            ErrorCategory::Ui => "ui",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::PacValidation => write!(f, "PAC_VALIDATION"),
            ErrorCategory::PacLoading => write!(f, "PAC_LOADING"),
            ErrorCategory::Network => write!(f, "NETWORK"),
            ErrorCategory::Proxy => write!(f, "PROXY"),
            ErrorCategory::Configuration => write!(f, "CONFIGURATION"),
            ErrorCategory::Authentication => write!(f, "AUTHENTICATION"),
            ErrorCategory::System => write!(f, "SYSTEM"),
            ErrorCategory::Ui => write!(f, "UI"),
        }
    }
}

/// Severity levels for errors, ordered `Low < Medium < High < Critical`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    /// Cosmetic or informational failures
    Low,
    /// Degraded functionality with an obvious workaround
    Medium,
    /// Functionality lost until recovery succeeds
    High,
    /// The client cannot proxy traffic at all
    Critical,
}

impl ErrorSeverity {
    /// High and critical failures raise the unhandled-error signal when no handler recovers them
    pub fn is_serious(&self) -> bool {
        *self >= ErrorSeverity::High
    }
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Low => write!(f, "LOW"),
            ErrorSeverity::Medium => write!(f, "MEDIUM"),
            ErrorSeverity::High => write!(f, "HIGH"),
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// One reported failure.
///
/// Category, severity, message and context are fixed once the record is built.
/// The recovery bookkeeping fields are only written by the error manager while
/// dispatching the record to its handlers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    id: String,
    category: ErrorCategory,
    severity: ErrorSeverity,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    context: ErrorContext,
    #[serde(serialize_with = "serialize_cause", skip_deserializing, default)]
    cause: Option<Arc<anyhow::Error>>,
    recovery_attempted: bool,
    recovery_successful: bool,
    retry_count: u32,
}

fn serialize_cause<S>(cause: &Option<Arc<anyhow::Error>>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match cause {
        Some(err) => serializer.serialize_some(&format!("{:#}", err)),
        None => serializer.serialize_none(),
    }
}

impl ErrorRecord {
    /// Start building a record for the given category and severity
    pub fn new(category: ErrorCategory, severity: ErrorSeverity) -> ErrorRecordBuilder {
        ErrorRecordBuilder {
            category,
            severity,
            message: String::new(),
            details: None,
            context: ErrorContext::new(),
            cause: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    pub fn severity(&self) -> ErrorSeverity {
        self.severity
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> Option<&str> {
        self.details.as_deref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn context(&self) -> &ErrorContext {
        &self.context
    }

    /// Context value for `key` as a string, if present and not null
    pub fn context_value(&self, key: &str) -> Option<String> {
        context_str(&self.context, key)
    }

    /// The failure that originally triggered this report
    pub fn cause(&self) -> Option<&anyhow::Error> {
        self.cause.as_deref()
    }

    pub fn recovery_attempted(&self) -> bool {
        self.recovery_attempted
    }

    pub fn recovery_successful(&self) -> bool {
        self.recovery_successful
    }

    /// Number of handler invocations that reported failure for this record
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Suppression signature: category plus message, context is ignored
    pub(crate) fn signature(&self) -> (ErrorCategory, String) {
        (self.category, self.message.clone())
    }

    pub(crate) fn mark_recovered(&mut self) {
        self.recovery_attempted = true;
        self.recovery_successful = true;
    }

    pub(crate) fn mark_recovery_failed(&mut self) {
        self.recovery_attempted = true;
        self.retry_count += 1;
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(details) = &self.details {
            write!(f, "[{}] {} - {}", self.category, self.message, details)
        } else {
            write!(f, "[{}] {}", self.category, self.message)
        }
    }
}

/// Builder for creating ErrorRecord instances
pub struct ErrorRecordBuilder {
    category: ErrorCategory,
    severity: ErrorSeverity,
    message: String,
    details: Option<String>,
    context: ErrorContext,
    cause: Option<anyhow::Error>,
}

impl ErrorRecordBuilder {
    /// Set the error message
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Set additional details
    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Add one context entry
    pub fn context(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Merge a whole context map
    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context.extend(context);
        self
    }

    /// Attach the originating failure
    pub fn cause(mut self, cause: impl Into<anyhow::Error>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    /// Build the final record with a fresh id and the current time
    pub fn build(self) -> ErrorRecord {
        ErrorRecord {
            id: Uuid::new_v4().to_string(),
            category: self.category,
            severity: self.severity,
            message: self.message,
            details: self.details,
            timestamp: Utc::now(),
            context: self.context,
            cause: self.cause.map(Arc::new),
            recovery_attempted: false,
            recovery_successful: false,
            retry_count: 0,
        }
    }
}

/// Kinds of failure that retry policies match against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Wildcard, only meaningful inside a policy's allow/deny lists
    Any,
    Connection,
    Timeout,
    Dns,
    Http,
    Io,
    Validation,
    Configuration,
    Authentication,
    Cancelled,
    Other,
}

impl FailureKind {
    /// Whether this list entry matches a classified failure
    pub fn matches(&self, kind: FailureKind) -> bool {
        *self == FailureKind::Any || *self == kind
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::Any => "any",
            FailureKind::Connection => "connection",
            FailureKind::Timeout => "timeout",
            FailureKind::Dns => "dns",
            FailureKind::Http => "http",
            FailureKind::Io => "io",
            FailureKind::Validation => "validation",
            FailureKind::Configuration => "configuration",
            FailureKind::Authentication => "authentication",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Other => "other",
        };
        f.write_str(name)
    }
}

/// Maps a failure onto a [`FailureKind`] for retry allow/deny decisions
pub trait Classify {
    fn failure_kind(&self) -> FailureKind;
}

/// Errors raised by the fallback engine and the recovery strategies
#[derive(Error, Debug, Clone)]
pub enum RecoveryError {
    #[error("No applicable fallback strategy for operation '{operation}'")]
    NoApplicableStrategy { operation: String },

    #[error("All fallback strategies failed: {}", attempted.join(", "))]
    AllStrategiesFailed { attempted: Vec<String> },

    #[error("Fallback strategy '{strategy}' failed: {reason}")]
    StrategyFailed { strategy: String, reason: String },

    #[error("No cached configuration available for '{config_type}'")]
    MissingCachedConfiguration { config_type: String },

    #[error("Failed to fetch {url} ({kind}): {reason}")]
    Fetch {
        url: String,
        kind: FailureKind,
        reason: String,
    },

    #[error("Invalid PAC script: {reason}")]
    InvalidPac { reason: String },

    #[error("Invalid configuration: {reason}")]
    Config { reason: String },

    #[error("IO error: {0}")]
    Io(String),
}

impl RecoveryError {
    /// Create a fetch error
    pub fn fetch(url: impl Into<String>, kind: FailureKind, reason: impl fmt::Display) -> Self {
        RecoveryError::Fetch {
            url: url.into(),
            kind,
            reason: reason.to_string(),
        }
    }

    /// Create a strategy failure
    pub fn strategy_failed(strategy: impl Into<String>, reason: impl fmt::Display) -> Self {
        RecoveryError::StrategyFailed {
            strategy: strategy.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<std::io::Error> for RecoveryError {
    fn from(err: std::io::Error) -> Self {
        RecoveryError::Io(err.to_string())
    }
}

impl Classify for RecoveryError {
    fn failure_kind(&self) -> FailureKind {
        match self {
            RecoveryError::Fetch { kind, .. } => *kind,
            RecoveryError::InvalidPac { .. } => FailureKind::Validation,
            RecoveryError::Config { .. } => FailureKind::Configuration,
            RecoveryError::Io(_) => FailureKind::Io,
            RecoveryError::NoApplicableStrategy { .. }
            | RecoveryError::AllStrategiesFailed { .. }
            | RecoveryError::StrategyFailed { .. }
            | RecoveryError::MissingCachedConfiguration { .. } => FailureKind::Other,
        }
    }
}

// Resolver failures surface as connect or generic io errors, only their text tells them apart
const RESOLVER_MARKERS: [&str; 3] = [
    "dns error",
    "failed to lookup address",
    "name or service not known",
];

/// Whether any error in the source chain reports a failed name resolution
pub(crate) fn is_resolver_failure(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(err) = current {
        let text = err.to_string().to_ascii_lowercase();
        if RESOLVER_MARKERS.iter().any(|marker| text.contains(marker)) {
            return true;
        }
        current = err.source();
    }
    false
}

impl Classify for std::io::Error {
    fn failure_kind(&self) -> FailureKind {
        use std::io::ErrorKind;
        match self.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => FailureKind::Timeout,
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::AddrNotAvailable
            | ErrorKind::BrokenPipe => FailureKind::Connection,
            ErrorKind::InvalidData | ErrorKind::InvalidInput => FailureKind::Validation,
            _ if is_resolver_failure(self) => FailureKind::Dns,
            _ => FailureKind::Io,
        }
    }
}

impl Classify for reqwest::Error {
    fn failure_kind(&self) -> FailureKind {
        if self.is_timeout() {
            FailureKind::Timeout
        } else if self.is_connect() {
            if is_resolver_failure(self) {
                FailureKind::Dns
            } else {
                FailureKind::Connection
            }
        } else if self.is_status() {
            FailureKind::Http
        } else if self.is_body() || self.is_decode() {
            FailureKind::Io
        } else {
            FailureKind::Other
        }
    }
}

impl Classify for anyhow::Error {
    fn failure_kind(&self) -> FailureKind {
        for cause in self.chain() {
            if let Some(err) = cause.downcast_ref::<RecoveryError>() {
                return err.failure_kind();
            }
            if let Some(err) = cause.downcast_ref::<std::io::Error>() {
                return err.failure_kind();
            }
            if let Some(err) = cause.downcast_ref::<reqwest::Error>() {
                return err.failure_kind();
            }
        }
        FailureKind::Other
    }
}

impl Classify for String {
    fn failure_kind(&self) -> FailureKind {
        FailureKind::Other
    }
}

/// Final failure of a retried unit of work
#[derive(Error, Debug)]
pub enum RetryError<E> {
    /// The work itself failed and was not retried further
    #[error("{error}")]
    Operation { error: E, attempts: u32 },

    /// Cancellation was requested before or between attempts
    #[error("Retry operation '{operation}' was cancelled after {attempts} attempts")]
    Cancelled { operation: String, attempts: u32 },

    /// The policy timeout elapsed before the next attempt
    #[error("Retry operation '{operation}' timed out after {elapsed:?}")]
    TimedOut { operation: String, elapsed: Duration },
}

impl<E> RetryError<E> {
    /// The underlying failure, if the work itself failed
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Operation { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RetryError::TimedOut { .. })
    }
}

impl<E: Classify> Classify for RetryError<E> {
    fn failure_kind(&self) -> FailureKind {
        match self {
            RetryError::Operation { error, .. } => error.failure_kind(),
            RetryError::Cancelled { .. } => FailureKind::Cancelled,
            RetryError::TimedOut { .. } => FailureKind::Timeout,
        }
    }
}

/// Result type for recovery operations
pub type RecoveryResult<T> = Result<T, RecoveryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(ErrorSeverity::Low < ErrorSeverity::Medium);
        assert!(ErrorSeverity::Medium < ErrorSeverity::High);
        assert!(ErrorSeverity::High < ErrorSeverity::Critical);
        assert!(ErrorSeverity::High.is_serious());
        assert!(!ErrorSeverity::Medium.is_serious());
    }

    #[test]
    fn test_builder_assigns_unique_ids() {
        let first = ErrorRecord::new(ErrorCategory::Network, ErrorSeverity::High)
            .message("connect failed")
            .context("host", "example.com")
            .context("proxy_port", 3128)
            .build();
        let second = ErrorRecord::new(ErrorCategory::Network, ErrorSeverity::High)
            .message("connect failed")
            .build();

        assert_ne!(first.id(), second.id());
        assert_eq!(first.context_value("host").as_deref(), Some("example.com"));
        assert_eq!(first.context_value("proxy_port").as_deref(), Some("3128"));
        assert!(!first.recovery_attempted());
        assert_eq!(first.retry_count(), 0);
    }

    #[test]
    fn test_record_serializes_cause_as_text() {
        let record = ErrorRecord::new(ErrorCategory::System, ErrorSeverity::Low)
            .message("disk")
            .cause(std::io::Error::new(std::io::ErrorKind::Other, "full"))
            .build();

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["category"], "system");
        assert_eq!(json["severity"], "low");
        assert_eq!(json["cause"], "full");
    }

    #[test]
    fn test_classify_io_and_anyhow() {
        let timeout = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert_eq!(timeout.failure_kind(), FailureKind::Timeout);

        let wrapped = anyhow::Error::new(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ))
        .context("while downloading");
        assert_eq!(wrapped.failure_kind(), FailureKind::Connection);

        let pac = anyhow::Error::new(RecoveryError::InvalidPac {
            reason: "empty".into(),
        });
        assert_eq!(pac.failure_kind(), FailureKind::Validation);
    }

    #[derive(Debug, Error)]
    #[error("client error (Connect)")]
    struct ConnectFailure(#[source] std::io::Error);

    #[test]
    fn test_classify_resolver_failures_as_dns() {
        let lookup = std::io::Error::new(
            std::io::ErrorKind::Other,
            "failed to lookup address information: Name or service not known",
        );
        assert_eq!(lookup.failure_kind(), FailureKind::Dns);

        // Marker found below the top of the chain
        let nested = ConnectFailure(std::io::Error::new(
            std::io::ErrorKind::Other,
            "dns error: no record found",
        ));
        assert!(is_resolver_failure(&nested));
        assert_eq!(
            anyhow::Error::new(nested).context("sending request").failure_kind(),
            FailureKind::Dns
        );

        let refused = ConnectFailure(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "connection refused",
        ));
        assert!(!is_resolver_failure(&refused));
        assert_eq!(
            std::io::Error::new(std::io::ErrorKind::Other, "disk full").failure_kind(),
            FailureKind::Io
        );
    }

    #[test]
    fn test_any_matches_everything() {
        assert!(FailureKind::Any.matches(FailureKind::Dns));
        assert!(FailureKind::Timeout.matches(FailureKind::Timeout));
        assert!(!FailureKind::Timeout.matches(FailureKind::Connection));
    }
}
