//! MQTT Stream Bridge Binary
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin mqtt-stream-bridge
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `MQTT_BROKER_URL`: Broker URL, e.g. `mqtt://localhost:1883`
//! - `MQTT_CLIENT_ID`: MQTT client identifier
//!
//! ## Optional
//! - `MQTT_USERNAME`, `MQTT_PASSWORD`: Broker credentials
//! - `MQTT_QOS`: Subscription QoS 0, 1 or 2 (default: 0)
//! - `MQTT_AUTO_RECONNECT`: Reconnect after a dropped connection (default: true)
//! - `BRIDGE_HTTP_PORT`: HTTP port (default: 8085)
//! - `BRIDGE_DATASOURCE_UID`: UID in channel addresses (default: mqtt)
//! - `BRIDGE_SESSION_QUEUE_CAPACITY`: Per-session queue size (default: 1024)
//! - `OTEL_ENABLED`: Export traces over OTLP (default: false)
//! - `RUST_LOG`: Log filter (default: info)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use mqtt_stream_bridge::infrastructure::http::HttpServer;
use mqtt_stream_bridge::infrastructure::telemetry;
use mqtt_stream_bridge::{
    BridgeConfig, BrokerClient, Datasource, MqttBroker, TelemetryConfig, init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Time allowed for tasks to finish after shutdown starts.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();

    let _telemetry_guard =
        telemetry::init(&TelemetryConfig::from_env()).context("initializing telemetry")?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting MQTT stream bridge");

    if let Err(e) = init_metrics() {
        tracing::warn!(error = %e, "Prometheus metrics unavailable");
    }

    let config = BridgeConfig::from_env().context("loading configuration")?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let (broker, broker_task) = MqttBroker::start(
        &config.datasource,
        config.reconnect.clone(),
        config.stream.disconnect_grace,
        shutdown_token.clone(),
    )
    .context("creating broker client")?;
    let broker: Arc<dyn BrokerClient> = Arc::new(broker);

    let datasource = Arc::new(Datasource::new(
        config.stream.datasource_uid.clone(),
        Arc::clone(&broker),
        config.datasource.qos,
        config.stream.session_queue_capacity,
    ));

    // Sessions reconnect lazily if this fails.
    if let Err(e) = broker.connect().await {
        tracing::warn!(error = %e, "Broker not reachable at startup");
    }

    let http_server = HttpServer::new(
        config.server.http_port,
        Arc::clone(&datasource),
        shutdown_token.clone(),
    );
    let mut http_task = tokio::spawn(http_server.run());

    let http_finished = tokio::select! {
        () = await_shutdown() => false,
        result = &mut http_task => {
            match result {
                Ok(Ok(())) => tracing::warn!("HTTP server exited"),
                Ok(Err(e)) => tracing::error!(error = %e, "HTTP server failed"),
                Err(e) => tracing::error!(error = %e, "HTTP server task panicked"),
            }
            true
        }
    };

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );

    datasource.dispose().await;
    shutdown_token.cancel();

    let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        if !http_finished {
            let _ = http_task.await;
        }
        let _ = broker_task.await;
    })
    .await;
    if drained.is_err() {
        tracing::warn!("Shutdown timed out");
    }

    tracing::info!("MQTT stream bridge stopped");
    Ok(())
}

/// Log the parsed configuration.
fn log_config(config: &BridgeConfig) {
    tracing::info!(
        broker_url = %config.datasource.broker_url,
        client_id = %config.datasource.client_id,
        qos = %config.datasource.qos,
        http_port = config.server.http_port,
        datasource_uid = %config.stream.datasource_uid,
        "Configuration loaded"
    );
    tracing::debug!(
        auto_reconnect = config.reconnect.enabled,
        queue_capacity = config.stream.session_queue_capacity,
        "Stream settings"
    );
}

/// Load `.env` from the current directory or the nearest ancestor that has one.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    let Ok(cwd) = std::env::current_dir() else {
        return;
    };
    for dir in cwd.ancestors().skip(1) {
        let env_path = dir.join(".env");
        if env_path.exists() {
            let _ = dotenvy::from_path(&env_path);
            return;
        }
    }
}

/// Wait for SIGINT or SIGTERM.
async fn await_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C, initiating shutdown"),
        () = terminate => tracing::info!("Received SIGTERM, initiating shutdown"),
    }
}
