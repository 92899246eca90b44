//! Reporter aggregation and concurrent intake against a full core
use serde_json::json;
use std::sync::Arc;

use px_recovery::ErrorReporter;

use crate::test_harness::{context, test_core};

#[tokio::test]
async fn test_reporter_aggregates_finalized_records() {
    let core = test_core().await;
    let reporter = ErrorReporter::new();
    reporter.attach(&core.manager).await;

    for (index, host) in ["a.corp.local", "b.corp.local"].iter().enumerate() {
        core.manager
            .handle_network_error(
                format!("connection refused #{}", index),
                None,
                context(&[("host", json!(host))]),
            )
            .await;
    }
    core.manager
        .handle_configuration_error(
            "unknown section",
            None,
            context(&[("config_type", json!("theme"))]),
        )
        .await;

    let snapshot = reporter.snapshot().unwrap();
    assert_eq!(snapshot.total_errors, 3);
    assert_eq!(snapshot.errors_by_category["NETWORK"], 2);
    assert_eq!(snapshot.errors_by_category["CONFIGURATION"], 1);
    assert_eq!(snapshot.errors_by_severity["HIGH"], 2);
    assert_eq!(snapshot.recovery_attempted, 3);
    assert_eq!(snapshot.recovery_successful, 2);
    assert_eq!(snapshot.errors_by_day.values().sum::<u64>(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_intake_keeps_counters_consistent() {
    let core = Arc::new(test_core().await);

    let tasks: Vec<_> = (0..32)
        .map(|index| {
            let core = core.clone();
            tokio::spawn(async move {
                core.manager
                    .handle_network_error(
                        format!("socket closed #{}", index),
                        None,
                        context(&[("host", json!(format!("host-{}.corp.local", index % 4)))]),
                    )
                    .await
            })
        })
        .collect();

    for task in tasks {
        assert!(task.await.unwrap().recovery_successful());
    }

    let stats = core.manager.get_stats().await;
    assert_eq!(stats.total_errors, 32);
    assert_eq!(stats.successful_recoveries, 32);
    assert_eq!(stats.history_size, 32);

    let per_host: u32 = (0..4)
        .map(|index| core.network.failure_count(&format!("host-{}.corp.local", index)))
        .sum();
    assert_eq!(per_host, 32);
}
