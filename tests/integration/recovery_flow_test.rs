//! End-to-end flows from error intake to recovery action
use serde_json::json;

use px_recovery::{
    ErrorCategory, ErrorRecord, ErrorSeverity, FallbackDirective, RecoveryAction,
};

use crate::test_harness::{context, test_core};

#[tokio::test]
async fn test_proxy_failures_escalate_to_direct_connection() {
    let core = test_core().await;
    let upstream = context(&[("proxy_host", json!("10.0.0.8")), ("proxy_port", json!(8080))]);

    let first = core
        .manager
        .handle_proxy_error("proxy refused connection", None, upstream.clone())
        .await;
    assert!(first.recovery_successful());
    assert!(matches!(
        core.proxy.last_action().await,
        Some(RecoveryAction::RetryRecommended { failures: 1, .. })
    ));

    // A distinct message so the second failure is not suppressed
    let second = core
        .manager
        .handle_proxy_error("proxy reset connection", Some("ECONNRESET"), upstream)
        .await;
    assert!(second.recovery_successful());
    assert!(matches!(
        core.proxy.last_action().await,
        Some(RecoveryAction::Fallback {
            directive: FallbackDirective::DirectConnection { .. }
        })
    ));

    let stats = core.manager.get_stats().await;
    assert_eq!(stats.total_errors, 2);
    assert_eq!(stats.successful_recoveries, 2);
    assert_eq!(core.fallback.get_stats().await.successful_fallbacks, 1);
}

#[tokio::test]
async fn test_duplicate_errors_are_suppressed() {
    let core = test_core().await;
    let ctx = context(&[("host", json!("intranet.corp.local"))]);

    core.manager
        .handle_network_error("connection timed out", None, ctx.clone())
        .await;
    let duplicate = core
        .manager
        .handle_network_error("connection timed out", None, ctx)
        .await;

    assert!(!duplicate.recovery_attempted());
    assert_eq!(core.network.failure_count("intranet.corp.local"), 1);

    let stats = core.manager.get_stats().await;
    assert_eq!(stats.total_errors, 1);
    assert_eq!(stats.suppressed_errors, 1);
}

#[tokio::test]
async fn test_shared_fallback_cache_feeds_configuration_recovery() {
    let core = test_core().await;
    let pac_config = json!({ "content": "function FindProxyForURL(url, host) { return \"DIRECT\"; }", "source": "http://wpad/wpad.dat" });

    core.fallback.cache_configuration("pac", pac_config.clone());

    let record = core
        .manager
        .handle_configuration_error(
            "PAC configuration unreadable",
            None,
            context(&[("config_type", json!("pac"))]),
        )
        .await;

    assert!(record.recovery_successful());
    match core.configuration.last_action().await {
        Some(RecoveryAction::Fallback {
            directive: FallbackDirective::CachedConfiguration { configuration, .. },
        }) => assert_eq!(configuration, pac_config),
        other => panic!("unexpected action: {:?}", other),
    }
}

#[tokio::test]
async fn test_unrecoverable_serious_error_is_broadcast() {
    let core = test_core().await;
    let mut unhandled = core.manager.subscribe_unhandled();

    let record = core
        .manager
        .handle_error(
            ErrorRecord::new(ErrorCategory::Configuration, ErrorSeverity::Critical)
                .message("theme configuration corrupt")
                .context("config_type", "theme"),
        )
        .await;

    assert!(record.recovery_attempted());
    assert!(!record.recovery_successful());

    let broadcast = unhandled.recv().await.unwrap();
    assert_eq!(broadcast.id(), record.id());
    assert_eq!(
        core.manager
            .get_error_history(Some(ErrorCategory::Configuration), None, None)
            .await
            .len(),
        1
    );
}

#[tokio::test]
async fn test_category_without_handler_is_recorded_only() {
    let core = test_core().await;

    let record = core
        .manager
        .handle_error(
            ErrorRecord::new(ErrorCategory::Ui, ErrorSeverity::Low).message("tray icon missing"),
        )
        .await;

    assert!(!record.recovery_attempted());
    let stats = core.manager.get_stats().await;
    assert_eq!(stats.total_errors, 1);
    assert_eq!(stats.recovery_attempts, 0);
}
