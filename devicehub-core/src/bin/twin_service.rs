use anyhow::Context;
use clap::Parser;
use devicehub_core::ipc::{interfaces, IpcServer};
use devicehub_core::{
    initialize_logging, HubConfig, HubMqttClient, IdentityStore, LogFormat, LoggingConfig,
    MqttClientTrait, TwinService,
};
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "twin-service", about = "Device Hub twin engine")]
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

    let mut mqtt = HubMqttClient::new(config.mqtt.clone(), "devicehub-twin");
    mqtt.connect().await.context("Connecting to broker")?;
    let mqtt: Arc<dyn MqttClientTrait> = Arc::new(mqtt);

    let service = TwinService::new(mqtt, store.clone());
    service.start().await.context("Starting twin engine")?;

    let mut ipc = IpcServer::new();
    interfaces::register_twin(&mut ipc, Arc::clone(&service), store);
    let ipc = Arc::new(ipc);
    let socket = config.ipc_socket("twin");
    tokio::spawn(async move {
        if let Err(e) = ipc.serve(&socket).await {
            tracing::error!("IPC server failed: {}", e);
        }
    });

    wait_for_shutdown().await;
    info!("Shutting down twin service");
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
