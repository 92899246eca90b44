use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{RecoveryError, RecoveryResult};
use crate::fallback::{
    DefaultPacFallback, FallbackContext, FallbackDirective, FallbackManager, FallbackOutcome,
    FallbackStrategy, OperationType, MINIMAL_PAC,
};

/// Strategy with a configurable priority and outcome, counting its executions
struct ScriptedStrategy {
    name: String,
    priority: u32,
    succeed: bool,
    calls: AtomicUsize,
}

impl ScriptedStrategy {
    fn new(name: &str, priority: u32, succeed: bool) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            priority,
            succeed,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl FallbackStrategy for ScriptedStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    fn can_fallback(&self, context: &FallbackContext) -> bool {
        context.operation_type == Some(OperationType::NetworkRequest)
    }

    fn execute_fallback(&self, _context: &FallbackContext) -> RecoveryResult<FallbackDirective> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.succeed {
            Ok(FallbackDirective::Custom {
                strategy: self.name.clone(),
                payload: json!({ "ok": true }),
            })
        } else {
            Err(RecoveryError::strategy_failed(&self.name, "scripted failure"))
        }
    }
}

fn network_context() -> FallbackContext {
    FallbackContext::new(OperationType::NetworkRequest).with("host", "intranet.local")
}

#[tokio::test]
async fn test_builtin_order_for_proxy_connection() {
    let manager = FallbackManager::new();
    let context = FallbackContext::new(OperationType::ProxyConnection).with("host", "example.com");

    assert_eq!(
        manager.get_applicable_strategies(&context).await,
        vec!["direct_connection", "no_proxy"]
    );

    let directive = manager.execute_fallback(&context).await.unwrap();
    assert_eq!(directive.proxy_decision(), Some("DIRECT"));
    assert!(matches!(directive, FallbackDirective::DirectConnection { .. }));

    let history = manager.get_fallback_history(None).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].strategy_name, "direct_connection");
    assert_eq!(history[0].outcome, FallbackOutcome::Success);
}

#[tokio::test]
async fn test_removing_strategy_moves_to_next_priority() {
    let manager = FallbackManager::new();
    let context = FallbackContext::new(OperationType::ProxyConnection).with("host", "example.com");

    assert!(manager.remove_strategy("direct_connection").await);
    assert!(!manager.remove_strategy("direct_connection").await);

    match manager.execute_fallback(&context).await.unwrap() {
        FallbackDirective::NoProxy { hosts, .. } => assert_eq!(hosts, vec!["example.com"]),
        other => panic!("unexpected directive: {:?}", other),
    }
}

#[tokio::test]
async fn test_pac_loading_returns_minimal_pac() {
    let manager = FallbackManager::new();
    let directive = manager
        .execute_fallback(&FallbackContext::new(OperationType::PacLoading))
        .await
        .unwrap();

    assert_eq!(directive.pac_content(), Some(MINIMAL_PAC));
    assert!(MINIMAL_PAC.contains("return \"DIRECT\";"));
    match directive {
        FallbackDirective::DefaultPac { source, .. } => assert_eq!(source, "fallback_default"),
        other => panic!("unexpected directive: {:?}", other),
    }
}

#[tokio::test]
async fn test_custom_default_pac_content() {
    let manager = FallbackManager::empty(10);
    let custom = "function FindProxyForURL(url, host) { return \"PROXY backup:3128\"; }";
    manager
        .add_strategy(Arc::new(DefaultPacFallback::with_content(custom)))
        .await;

    let directive = manager
        .execute_fallback(&FallbackContext::new(OperationType::PacLoading))
        .await
        .unwrap();
    assert_eq!(directive.pac_content(), Some(custom));
}

#[tokio::test]
async fn test_no_applicable_strategy() {
    let manager = FallbackManager::new();
    let context = FallbackContext::new(OperationType::Configuration).with("config_type", "proxy");

    let err = manager.execute_fallback(&context).await.unwrap_err();
    assert!(matches!(err, RecoveryError::NoApplicableStrategy { .. }));
    assert!(manager.try_fallback(&context).await.is_none());

    let history = manager.get_fallback_history(None).await;
    assert_eq!(history.len(), 2);
    assert!(history
        .iter()
        .all(|attempt| attempt.outcome == FallbackOutcome::NotApplicable));
    assert_eq!(manager.get_stats().await.total_fallbacks, 0);
}

#[tokio::test]
async fn test_cached_configuration_becomes_applicable() {
    let manager = FallbackManager::new();
    let context = FallbackContext::new(OperationType::Configuration).with("config_type", "proxy");
    let proxy_config = json!({ "listen_address": "127.0.0.1", "port": 3128 });

    manager.cache_configuration("proxy", proxy_config.clone());

    match manager.execute_fallback(&context).await.unwrap() {
        FallbackDirective::CachedConfiguration {
            config_type,
            configuration,
            ..
        } => {
            assert_eq!(config_type, "proxy");
            assert_eq!(configuration, proxy_config);
        }
        other => panic!("unexpected directive: {:?}", other),
    }
}

#[tokio::test]
async fn test_first_success_short_circuits() {
    let manager = FallbackManager::empty(10);
    let failing = ScriptedStrategy::new("failing", 1, false);
    let winner = ScriptedStrategy::new("winner", 5, true);
    let never = ScriptedStrategy::new("never", 9, true);

    // Registration order differs from priority order
    manager.add_strategy(never.clone()).await;
    manager.add_strategy(winner.clone()).await;
    manager.add_strategy(failing.clone()).await;

    let directive = manager.execute_fallback(&network_context()).await.unwrap();
    assert!(matches!(directive, FallbackDirective::Custom { ref strategy, .. } if strategy == "winner"));

    assert_eq!(failing.calls(), 1);
    assert_eq!(winner.calls(), 1);
    assert_eq!(never.calls(), 0);

    let outcomes: Vec<FallbackOutcome> = manager
        .get_fallback_history(None)
        .await
        .iter()
        .map(|attempt| attempt.outcome)
        .collect();
    assert_eq!(outcomes, vec![FallbackOutcome::Failed, FallbackOutcome::Success]);

    let failed = manager.get_fallback_history(Some("failing")).await;
    assert_eq!(failed.len(), 1);
    assert!(failed[0].error.as_deref().unwrap_or_default().contains("scripted failure"));
}

#[tokio::test]
async fn test_equal_priorities_keep_registration_order() {
    let manager = FallbackManager::empty(10);
    manager.add_strategy(ScriptedStrategy::new("first", 5, true)).await;
    manager.add_strategy(ScriptedStrategy::new("second", 5, true)).await;
    manager.add_strategy(ScriptedStrategy::new("urgent", 1, false)).await;

    assert_eq!(
        manager.strategy_names().await,
        vec!["urgent", "first", "second"]
    );
}

#[tokio::test]
async fn test_all_strategies_failed() {
    let manager = FallbackManager::empty(10);
    manager.add_strategy(ScriptedStrategy::new("a", 1, false)).await;
    manager.add_strategy(ScriptedStrategy::new("b", 2, false)).await;

    match manager.execute_fallback(&network_context()).await {
        Err(RecoveryError::AllStrategiesFailed { attempted }) => {
            assert_eq!(attempted, vec!["a", "b"]);
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert!(manager.try_fallback(&network_context()).await.is_none());

    let stats = manager.get_stats().await;
    assert_eq!(stats.total_fallbacks, 4);
    assert_eq!(stats.successful_fallbacks, 0);
    assert_eq!(stats.fallbacks_by_strategy["a"].total, 2);
}

#[tokio::test]
async fn test_history_is_bounded() {
    let manager = FallbackManager::empty(3);
    manager.add_strategy(ScriptedStrategy::new("ok", 1, true)).await;

    for _ in 0..5 {
        manager.execute_fallback(&network_context()).await.unwrap();
    }

    assert_eq!(manager.get_fallback_history(None).await.len(), 3);
    assert_eq!(manager.get_stats().await.successful_fallbacks, 5);

    manager.clear_history().await;
    assert!(manager.get_fallback_history(None).await.is_empty());
}
