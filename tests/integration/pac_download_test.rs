//! PAC re-download through the reqwest fetcher against a local HTTP server
use serde_json::json;

use px_recovery::fallback::MINIMAL_PAC;
use px_recovery::{ErrorCategory, ErrorRecord, ErrorSeverity, RecoveryAction};

use crate::test_harness::{test_core, GOOD_PAC};

fn loading_error(source: &str) -> px_recovery::ErrorRecordBuilder {
    ErrorRecord::new(ErrorCategory::PacLoading, ErrorSeverity::High)
        .message("PAC download failed")
        .context("pac_source", source)
}

#[tokio::test]
async fn test_pac_redownload_caches_working_script() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/wpad.dat")
        .match_header("user-agent", "px-ui-client/1.0")
        .with_status(200)
        .with_header("content-type", "application/x-ns-proxy-autoconfig")
        .with_body(GOOD_PAC)
        .expect(1)
        .create_async()
        .await;

    let core = test_core().await;
    let source = format!("{}/wpad.dat", server.url());

    let record = core.manager.handle_error(loading_error(&source)).await;

    mock.assert_async().await;
    assert!(record.recovery_successful());

    let cached = core.pac.cached_pac().await;
    assert_eq!(cached.content.as_deref(), Some(GOOD_PAC));
    assert_eq!(cached.source.as_deref(), Some(source.as_str()));
    assert!(matches!(
        core.pac.last_action().await,
        Some(RecoveryAction::PacDownloaded { .. })
    ));

    let retries = core.retry.get_operation_stats("pac_download").await;
    assert_eq!(retries.len(), 1);
    assert!(retries[0].success);
}

#[tokio::test]
async fn test_pac_server_error_falls_back_to_minimal_pac() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/wpad.dat")
        .with_status(500)
        .with_body("internal error")
        .expect(3)
        .create_async()
        .await;

    let core = test_core().await;
    let record = core
        .manager
        .handle_error(loading_error(&format!("{}/wpad.dat", server.url())))
        .await;

    mock.assert_async().await;
    assert!(record.recovery_successful());

    let action = core.pac.last_action().await.unwrap();
    assert_eq!(
        action.directive().and_then(|directive| directive.pac_content()),
        Some(MINIMAL_PAC)
    );
    assert!(core.pac.cached_pac().await.content.is_none());
    assert_eq!(
        core.fallback
            .get_fallback_history(Some("default_pac"))
            .await
            .len(),
        1
    );
}

#[tokio::test]
async fn test_pac_validation_error_is_repaired() {
    let core = test_core().await;

    let record = core
        .manager
        .handle_pac_error(
            "PAC script failed validation",
            Some("unexpected end of input"),
            [(
                "pac_content".to_string(),
                json!("function FindProxyForURL(url, host) {\n  return \"DIRECT\"\n"),
            )]
            .into_iter()
            .collect(),
        )
        .await;

    assert!(record.recovery_successful());
    match core.pac.last_action().await {
        Some(RecoveryAction::PacRepaired { content }) => {
            assert!(content.contains("return \"DIRECT\";"));
            assert!(content.trim_end().ends_with('}'));
        }
        other => panic!("unexpected action: {:?}", other),
    }
}
