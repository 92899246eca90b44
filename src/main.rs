use anyhow::Result;
use px_recovery::{ErrorReporter, RecoveryConfig, RecoveryCore};
use serde_json::json;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env before anything reads the environment
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("px_recovery=info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("px-recovery.json"));
    let config = RecoveryConfig::load(&config_path).await?;

    let core = RecoveryCore::new(&config).await?;
    let reporter = ErrorReporter::new();
    reporter.attach(&core.manager).await;

    let mut unhandled = core.manager.subscribe_unhandled();
    tokio::spawn(async move {
        while let Ok(record) = unhandled.recv().await {
            warn!(error_id = record.id(), "Unhandled: {}", record);
        }
    });

    info!(handlers = ?core.manager.handler_names().await, "Recovery core ready");

    core.configuration
        .backup_configuration("proxy", json!({ "listen_address": "127.0.0.1", "port": 3128 }));

    let upstream = [("proxy_host", json!("10.0.0.8")), ("proxy_port", json!(8080))];
    for attempt in 1..=2 {
        let record = core
            .manager
            .handle_proxy_error(
                format!("Upstream proxy refused connection (attempt {})", attempt),
                Some("connection refused"),
                upstream
                    .iter()
                    .map(|(key, value)| (key.to_string(), value.clone()))
                    .collect(),
            )
            .await;
        info!(
            recovered = record.recovery_successful(),
            action = ?core.proxy.last_action().await,
            "Proxy failure processed"
        );
    }

    core.manager
        .handle_pac_error(
            "PAC script failed validation",
            None,
            [(
                "pac_content".to_string(),
                json!("function FindProxyForURL(url, host) {\n  return \"DIRECT\"\n"),
            )]
            .into_iter()
            .collect(),
        )
        .await;

    core.manager
        .handle_configuration_error(
            "Proxy configuration rejected",
            None,
            [("config_type".to_string(), json!("proxy"))]
                .into_iter()
                .collect(),
        )
        .await;

    let report = json!({
        "manager": core.manager.get_stats().await,
        "fallback": core.fallback.get_stats().await,
        "retry": core.retry.summary().await,
        "report": reporter.snapshot()?,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
