use anyhow::Context;
use clap::Parser;
use devicehub_core::gateway;
use devicehub_core::ipc::{interfaces, IpcClient, IpcServer};
use devicehub_core::{
    initialize_logging, GatewayState, HubConfig, HubMqttClient, IdentityStore, LogFormat,
    LoggingConfig, MqttClientTrait,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "application-gateway", about = "Device Hub application gateway")]
struct Args {
    /// Emit JSON logs
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    initialize_logging(LoggingConfig {
        format: if args.json_logs {
            LogFormat::Json
        } else {
            LogFormat::Compact
        },
        ..Default::default()
    })?;

    let config = HubConfig::from_env();

    let store = IdentityStore::open(&config.store.db_path).context("Opening identity store")?;

    let mut mqtt = HubMqttClient::new(config.mqtt.clone(), "devicehub-gateway");
    mqtt.connect().await.context("Connecting to broker")?;
    let mqtt: Arc<dyn MqttClientTrait> = Arc::new(mqtt);

    let state = GatewayState::new(
        store,
        Arc::clone(&mqtt),
        IpcClient::new(config.ipc_socket("twin")),
        config.gateway.method_timeout,
    );
    state.start_ingest().await.context("Starting broker ingest")?;

    let mut ipc = IpcServer::new();
    interfaces::register_application(&mut ipc, mqtt);
    let ipc = Arc::new(ipc);
    let socket = config.ipc_socket("application");
    tokio::spawn(async move {
        if let Err(e) = ipc.serve(&socket).await {
            tracing::error!("IPC server failed: {}", e);
        }
    });

    let app = gateway::router(Arc::clone(&state));
    let addr = format!("0.0.0.0:{}", config.gateway.application_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Binding {}", addr))?;
    info!("Application gateway listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown())
        .await
        .context("HTTP server failed")?;

    // Drain in-flight method calls before closing the broker connection so
    // responses already on the wire still reach their callers.
    info!("Draining pending method calls");
    let deadline = tokio::time::Instant::now() + config.gateway.method_timeout;
    while !state.pending.is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    info!("Shutting down application gateway");
    Ok(())
}

async fn wait_for_shutdown() {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
