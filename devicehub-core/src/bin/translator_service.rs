use anyhow::Context;
use clap::Parser;
use devicehub_core::{
    initialize_logging, HubConfig, HubMqttClient, IdentityStore, LogFormat, LoggingConfig,
    MqttClientTrait, NameTranslator,
};
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "translator-service", about = "Device Hub name translator")]
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

    let mut mqtt = HubMqttClient::new(config.mqtt.clone(), "devicehub-translator");
    mqtt.connect().await.context("Connecting to broker")?;
    let mqtt: Arc<dyn MqttClientTrait> = Arc::new(mqtt);

    let translator = NameTranslator::new(mqtt, store, config.translator.cache_ttl);
    translator.start().await.context("Starting name translator")?;

    wait_for_shutdown().await;
    info!("Shutting down translator service");
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
