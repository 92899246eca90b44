use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ManagerConfig;
use crate::error::{ErrorCategory, ErrorContext, ErrorRecord, ErrorRecordBuilder, ErrorSeverity};

/// Identifier of a registered handler
pub type HandlerId = Uuid;

/// Identifier of a registered subscriber callback
pub type CallbackId = Uuid;

/// Subscriber notified with every finalized record
pub type ErrorCallback = Arc<dyn Fn(&ErrorRecord) -> anyhow::Result<()> + Send + Sync>;

/// A recovery handler registered with the [`ErrorManager`].
///
/// Handlers must not call back into [`ErrorManager::handle_error`] from
/// `handle`; the record being dispatched is not finalized yet.
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this handler wants to see `record`
    fn can_handle(&self, record: &ErrorRecord) -> bool;

    /// Try to recover from `record`, returning true on success
    async fn handle(&self, record: &ErrorRecord) -> bool;
}

/// Aggregate counters over accepted records
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorStats {
    pub total_errors: u64,
    pub errors_by_category: HashMap<ErrorCategory, u64>,
    pub errors_by_severity: HashMap<ErrorSeverity, u64>,
    /// Handler invocations that reported failure
    pub recovery_attempts: u64,
    pub successful_recoveries: u64,
    /// Repeats dropped inside the suppression window
    pub suppressed_errors: u64,
    pub history_size: usize,
}

/// Bookkeeping guarded by the manager's single lock
#[derive(Default)]
struct ManagerState {
    history: VecDeque<ErrorRecord>,
    last_seen: HashMap<(ErrorCategory, String), Instant>,
    stats: ErrorStats,
}

impl ManagerState {
    /// True when the signature was seen within `window`, in which case its timestamp slides forward
    fn check_suppressed(&mut self, signature: &(ErrorCategory, String), now: Instant, window: Duration) -> bool {
        match self.last_seen.get_mut(signature) {
            Some(last) if now.duration_since(*last) < window => {
                *last = now;
                true
            }
            _ => false,
        }
    }

    fn prune_suppression(&mut self, now: Instant, window: Duration) {
        self.last_seen
            .retain(|_, last| now.duration_since(*last) < window);
    }

    fn accept(&mut self, record: &ErrorRecord, max_history_size: usize) {
        self.history.push_back(record.clone());
        while self.history.len() > max_history_size {
            self.history.pop_front();
        }

        self.stats.total_errors += 1;
        *self
            .stats
            .errors_by_category
            .entry(record.category())
            .or_insert(0) += 1;
        *self
            .stats
            .errors_by_severity
            .entry(record.severity())
            .or_insert(0) += 1;
        self.stats.history_size = self.history.len();
    }

    /// Write the dispatch outcome back into the stored copy, if it is still in history
    fn finalize(&mut self, record: &ErrorRecord, failed_attempts: u64, recovered: bool) {
        self.stats.recovery_attempts += failed_attempts;
        if recovered {
            self.stats.successful_recoveries += 1;
        }

        if let Some(stored) = self
            .history
            .iter_mut()
            .rev()
            .find(|stored| stored.id() == record.id())
        {
            *stored = record.clone();
        }
    }
}

/// Single ingress point for failures.
///
/// Records are suppressed, stored, dispatched to handlers in registration
/// order and finally delivered to subscriber callbacks.
pub struct ErrorManager {
    state: Arc<Mutex<ManagerState>>,
    handlers: Arc<RwLock<Vec<(HandlerId, Arc<dyn ErrorHandler>)>>>,
    callbacks: Arc<RwLock<Vec<(CallbackId, ErrorCallback)>>>,
    unhandled: broadcast::Sender<ErrorRecord>,
    max_history_size: usize,
    suppression_window: Duration,
}

/// Everything an accepted record needs after intake, owned so it can run on its own task
#[derive(Clone)]
struct Dispatcher {
    state: Arc<Mutex<ManagerState>>,
    handlers: Arc<RwLock<Vec<(HandlerId, Arc<dyn ErrorHandler>)>>>,
    callbacks: Arc<RwLock<Vec<(CallbackId, ErrorCallback)>>>,
    unhandled: broadcast::Sender<ErrorRecord>,
}

impl Default for ErrorManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorManager {
    /// Create an error manager with default settings
    pub fn new() -> Self {
        Self::from_config(&ManagerConfig::default())
    }

    pub fn from_config(config: &ManagerConfig) -> Self {
        let (unhandled, _) = broadcast::channel(config.unhandled_channel_capacity.max(1));
        Self {
            state: Arc::new(Mutex::new(ManagerState::default())),
            handlers: Arc::new(RwLock::new(Vec::new())),
            callbacks: Arc::new(RwLock::new(Vec::new())),
            unhandled,
            max_history_size: config.max_history_size.max(1),
            suppression_window: config.suppression_window(),
        }
    }

    pub fn suppression_window(&self) -> Duration {
        self.suppression_window
    }

    /// Register a handler; handlers are consulted in registration order
    pub async fn add_handler(&self, handler: Arc<dyn ErrorHandler>) -> HandlerId {
        let id = Uuid::new_v4();
        info!(handler = handler.name(), "Registered error handler");
        self.handlers.write().await.push((id, handler));
        id
    }

    pub async fn remove_handler(&self, id: &HandlerId) -> bool {
        let mut handlers = self.handlers.write().await;
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| handler_id != id);
        handlers.len() != before
    }

    /// Names of registered handlers in dispatch order
    pub async fn handler_names(&self) -> Vec<String> {
        self.handlers
            .read()
            .await
            .iter()
            .map(|(_, handler)| handler.name().to_string())
            .collect()
    }

    /// Register a subscriber callback invoked with every finalized record
    pub async fn add_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&ErrorRecord) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        self.callbacks.write().await.push((id, Arc::new(callback)));
        debug!(callback_id = %id, "Registered error callback");
        id
    }

    pub async fn remove_callback(&self, id: &CallbackId) -> bool {
        let mut callbacks = self.callbacks.write().await;
        let before = callbacks.len();
        callbacks.retain(|(callback_id, _)| callback_id != id);
        callbacks.len() != before
    }

    /// Receive HIGH and CRITICAL records that no handler recovered
    pub fn subscribe_unhandled(&self) -> broadcast::Receiver<ErrorRecord> {
        self.unhandled.subscribe()
    }

    /// Take in a failure and run it through suppression, history, handlers and callbacks.
    ///
    /// Never fails; the returned record carries the recovery outcome. Once a
    /// record is accepted, dispatch runs on its own task, so dropping this
    /// future (for example on a caller-side timeout) still finalizes the
    /// stored record and notifies subscribers.
    pub async fn handle_error(&self, builder: ErrorRecordBuilder) -> ErrorRecord {
        let record = builder.build();
        let signature = record.signature();

        {
            let mut state = self.state.lock().await;
            let now = Instant::now();

            if state.check_suppressed(&signature, now, self.suppression_window) {
                state.stats.suppressed_errors += 1;
                debug!(
                    category = %record.category(),
                    error_message = record.message(),
                    "Suppressing duplicate error"
                );
                return record;
            }

            state.prune_suppression(now, self.suppression_window);
            state.last_seen.insert(signature, now);
            state.accept(&record, self.max_history_size);
        }

        log_record(&record);

        let accepted = record.clone();
        let dispatcher = self.dispatcher();
        match tokio::spawn(async move { dispatcher.run(record).await }).await {
            Ok(record) => record,
            Err(err) => {
                error!(error_id = accepted.id(), error = %err, "Error dispatch task failed");
                accepted
            }
        }
    }

    fn dispatcher(&self) -> Dispatcher {
        Dispatcher {
            state: self.state.clone(),
            handlers: self.handlers.clone(),
            callbacks: self.callbacks.clone(),
            unhandled: self.unhandled.clone(),
        }
    }

    /// PAC validation failure, MEDIUM severity
    pub async fn handle_pac_error(
        &self,
        message: impl Into<String>,
        details: Option<&str>,
        context: ErrorContext,
    ) -> ErrorRecord {
        self.intake(ErrorCategory::PacValidation, ErrorSeverity::Medium, message, details, context)
            .await
    }

    /// Network failure, HIGH severity
    pub async fn handle_network_error(
        &self,
        message: impl Into<String>,
        details: Option<&str>,
        context: ErrorContext,
    ) -> ErrorRecord {
        self.intake(ErrorCategory::Network, ErrorSeverity::High, message, details, context)
            .await
    }

    /// Upstream proxy failure, HIGH severity
    pub async fn handle_proxy_error(
        &self,
        message: impl Into<String>,
        details: Option<&str>,
        context: ErrorContext,
    ) -> ErrorRecord {
        self.intake(ErrorCategory::Proxy, ErrorSeverity::High, message, details, context)
            .await
    }

    /// Configuration failure, MEDIUM severity
    pub async fn handle_configuration_error(
        &self,
        message: impl Into<String>,
        details: Option<&str>,
        context: ErrorContext,
    ) -> ErrorRecord {
        self.intake(ErrorCategory::Configuration, ErrorSeverity::Medium, message, details, context)
            .await
    }

    async fn intake(
        &self,
        category: ErrorCategory,
        severity: ErrorSeverity,
        message: impl Into<String>,
        details: Option<&str>,
        context: ErrorContext,
    ) -> ErrorRecord {
        let mut builder = ErrorRecord::new(category, severity)
            .message(message)
            .with_context(context);
        if let Some(details) = details {
            builder = builder.details(details);
        }
        self.handle_error(builder).await
    }

    /// Stored records in insertion order, filtered by the given criteria
    pub async fn get_error_history(
        &self,
        category: Option<ErrorCategory>,
        severity: Option<ErrorSeverity>,
        since: Option<DateTime<Utc>>,
    ) -> Vec<ErrorRecord> {
        let state = self.state.lock().await;
        state
            .history
            .iter()
            .filter(|record| category.map_or(true, |c| record.category() == c))
            .filter(|record| severity.map_or(true, |s| record.severity() == s))
            .filter(|record| since.map_or(true, |t| record.timestamp() >= t))
            .cloned()
            .collect()
    }

    /// Records accepted within the last `window`
    pub async fn get_recent_errors(&self, window: Duration) -> Vec<ErrorRecord> {
        let since = chrono::Duration::from_std(window)
            .ok()
            .and_then(|window| Utc::now().checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.get_error_history(None, None, Some(since)).await
    }

    pub async fn get_stats(&self) -> ErrorStats {
        let state = self.state.lock().await;
        let mut stats = state.stats.clone();
        stats.history_size = state.history.len();
        stats
    }

    /// Drop stored records and the suppression table; counters are kept
    pub async fn clear_history(&self) {
        let mut state = self.state.lock().await;
        state.history.clear();
        state.last_seen.clear();
        state.stats.history_size = 0;
        info!("Error history cleared");
    }
}

impl Dispatcher {
    /// Dispatch an accepted record, write the outcome back and notify subscribers
    async fn run(self, mut record: ErrorRecord) -> ErrorRecord {
        let (recovered, failed_attempts) = self.dispatch(&mut record).await;

        self.state
            .lock()
            .await
            .finalize(&record, failed_attempts, recovered);

        if !recovered && record.severity().is_serious() {
            warn!(
                error_id = record.id(),
                category = %record.category(),
                severity = %record.severity(),
                "Unhandled serious error: {}",
                record
            );
            // No receivers is fine
            let _ = self.unhandled.send(record.clone());
        }

        self.notify(&record).await;
        record
    }

    /// Offer the record to each applicable handler until one succeeds
    async fn dispatch(&self, record: &mut ErrorRecord) -> (bool, u64) {
        let handlers: Vec<Arc<dyn ErrorHandler>> = self
            .handlers
            .read()
            .await
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();

        let mut failed_attempts = 0;
        for handler in handlers {
            let applicable = std::panic::catch_unwind(AssertUnwindSafe(|| handler.can_handle(record)))
                .unwrap_or_else(|_| {
                    error!(handler = handler.name(), "Error handler panicked in can_handle");
                    false
                });
            if !applicable {
                continue;
            }

            let handled = AssertUnwindSafe(handler.handle(record))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    error!(handler = handler.name(), "Error handler panicked");
                    false
                });

            if handled {
                record.mark_recovered();
                info!(
                    handler = handler.name(),
                    error_id = record.id(),
                    "Error recovered"
                );
                return (true, failed_attempts);
            }

            record.mark_recovery_failed();
            failed_attempts += 1;
            debug!(
                handler = handler.name(),
                error_id = record.id(),
                "Handler did not recover error, trying next"
            );
        }

        (false, failed_attempts)
    }

    async fn notify(&self, record: &ErrorRecord) {
        let callbacks: Vec<(CallbackId, ErrorCallback)> = self.callbacks.read().await.clone();

        for (id, callback) in callbacks {
            match std::panic::catch_unwind(AssertUnwindSafe(|| callback(record))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(callback_id = %id, error = %err, "Error callback failed");
                }
                Err(_) => {
                    error!(callback_id = %id, "Error callback panicked");
                }
            }
        }
    }
}

fn log_record(record: &ErrorRecord) {
    let category = record.category();
    match record.severity() {
        ErrorSeverity::Critical => error!(
            error_id = record.id(),
            category = %category,
            critical = true,
            "{}",
            record
        ),
        ErrorSeverity::High => error!(error_id = record.id(), category = %category, "{}", record),
        ErrorSeverity::Medium => warn!(error_id = record.id(), category = %category, "{}", record),
        ErrorSeverity::Low => info!(error_id = record.id(), category = %category, "{}", record),
    }
}
