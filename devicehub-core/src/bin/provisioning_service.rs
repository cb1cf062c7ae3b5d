use anyhow::Context;
use clap::Parser;
use devicehub_core::ca::CertificateAuthority;
use devicehub_core::ipc::{interfaces, IpcServer};
use devicehub_core::{
    initialize_logging, HubConfig, HubMqttClient, IdentityStore, LogFormat, LoggingConfig,
    MqttClientTrait, ProvisioningService,
};
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "provisioning-service", about = "Device Hub provisioning broker")]
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

    let ca = Arc::new(CertificateAuthority::new(config.ca.clone()));
    ca.ensure_root_ca(None, None, None)
        .await
        .context("Preparing root CA")?;
    ca.ensure_provisioning_cert("provisioning")
        .await
        .context("Preparing provisioning identity")?;

    let mut mqtt = HubMqttClient::new(config.mqtt.clone(), "devicehub-provisioning");
    mqtt.connect().await.context("Connecting to broker")?;
    let mqtt: Arc<dyn MqttClientTrait> = Arc::new(mqtt);

    let service = ProvisioningService::new(
        Arc::clone(&mqtt),
        store.clone(),
        Arc::clone(&ca),
        config.enforce_whitelist,
        Some(config.ca.cert_days),
    );
    service.start().await.context("Starting provisioning broker")?;

    let mut ipc = IpcServer::new();
    interfaces::register_devices(&mut ipc, store.clone());
    interfaces::register_certificate(&mut ipc, ca);
    interfaces::register_whitelist(&mut ipc, store);
    let ipc = Arc::new(ipc);
    let socket = config.ipc_socket("core");
    tokio::spawn(async move {
        if let Err(e) = ipc.serve(&socket).await {
            tracing::error!("IPC server failed: {}", e);
        }
    });

    wait_for_shutdown().await;
    info!("Shutting down provisioning service");
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
