use crate::config::MqttSettings;
use crate::{ConnectionStatus, MqttError, MqttMessage, MqttResult};

use async_trait::async_trait;
use chrono::Utc;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, TlsConfiguration, Transport};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use url::Url;

/// Callback invoked for every message received from the broker
pub type MessageCallback = Arc<dyn Fn(MqttMessage) -> Result<(), MqttError> + Send + Sync>;

/// Broker client trait for testability
#[async_trait]
pub trait MqttClientTrait: Send + Sync {
    async fn connect(&mut self) -> MqttResult<()>;
    async fn disconnect(&mut self) -> MqttResult<()>;
    async fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> MqttResult<()>;
    async fn subscribe(&self, topic: &str, qos: QoS) -> MqttResult<()>;
    async fn unsubscribe(&self, topic: &str) -> MqttResult<()>;
    fn get_connection_status(&self) -> ConnectionStatus;
    fn set_message_callback(&self, callback: MessageCallback);
}

/// Broker client used by every hub service.
///
/// Each service opens its own client with a distinct identity certificate;
/// the event loop reconnects on a fixed cadence and replays subscriptions
/// after every reconnect.
pub struct HubMqttClient {
    settings: MqttSettings,
    client_id: String,
    mqtt_client: Option<AsyncClient>,
    connection_status: Arc<RwLock<ConnectionStatus>>,
    subscriptions: Arc<RwLock<HashMap<String, QoS>>>,
    message_callback: Arc<RwLock<Option<MessageCallback>>>,
}

impl HubMqttClient {
    pub fn new(settings: MqttSettings, client_id: impl Into<String>) -> Self {
        Self {
            settings,
            client_id: client_id.into(),
            mqtt_client: None,
            connection_status: Arc::new(RwLock::new(ConnectionStatus::Disconnected)),
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            message_callback: Arc::new(RwLock::new(None)),
        }
    }

    /// Build MQTT options from the configured broker URL and TLS material
    fn create_mqtt_options(&self) -> MqttResult<MqttOptions> {
        let endpoint_url = if self.settings.url.contains("://") {
            Url::parse(&self.settings.url)
                .map_err(|e| MqttError::Configuration(format!("Invalid broker URL: {}", e)))?
        } else {
            Url::parse(&format!("mqtts://{}", self.settings.url))
                .map_err(|e| MqttError::Configuration(format!("Invalid broker endpoint: {}", e)))?
        };

        let host = endpoint_url
            .host_str()
            .ok_or_else(|| MqttError::Configuration("No host in broker URL".to_string()))?;
        let use_tls = endpoint_url.scheme() != "mqtt";
        let port = endpoint_url
            .port()
            .unwrap_or(if use_tls { 8883 } else { 1883 });

        let mut mqtt_options = MqttOptions::new(&self.client_id, host, port);
        mqtt_options.set_keep_alive(self.settings.keep_alive);
        mqtt_options.set_clean_session(true);

        if let (Some(username), Some(password)) =
            (&self.settings.username, &self.settings.password)
        {
            mqtt_options.set_credentials(username.clone(), password.clone());
        }

        if use_tls {
            let tls_config = self.create_tls_config()?;
            mqtt_options.set_transport(Transport::Tls(tls_config));
        }

        Ok(mqtt_options)
    }

    /// Build the rustls client configuration: hub root CA as the trust
    /// anchor plus the service identity certificate for mTLS.
    fn create_tls_config(&self) -> MqttResult<TlsConfiguration> {
        let mut root_cert_store = rustls::RootCertStore::empty();
        if let Some(ca_path) = &self.settings.tls_ca {
            let ca_file = std::fs::read(ca_path)
                .map_err(|e| MqttError::Configuration(format!("Failed to read CA certificate: {}", e)))?;
            let ca_certs = rustls_pemfile::certs(&mut ca_file.as_slice())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| MqttError::Configuration(format!("Failed to parse CA certificate: {}", e)))?;
            for cert in ca_certs {
                root_cert_store
                    .add(cert)
                    .map_err(|e| MqttError::Configuration(format!("Failed to add CA certificate: {}", e)))?;
            }
        }

        let builder = rustls::ClientConfig::builder().with_root_certificates(root_cert_store);

        let client_config = if let (Some(cert_path), Some(key_path)) =
            (&self.settings.tls_cert, &self.settings.tls_key)
        {
            let cert_file = std::fs::read(cert_path)
                .map_err(|e| MqttError::Configuration(format!("Failed to read certificate: {}", e)))?;
            let cert_chain = rustls_pemfile::certs(&mut cert_file.as_slice())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| MqttError::Configuration(format!("Failed to parse certificate: {}", e)))?;

            let key_file = std::fs::read(key_path)
                .map_err(|e| MqttError::Configuration(format!("Failed to read private key: {}", e)))?;
            let private_key = rustls_pemfile::private_key(&mut key_file.as_slice())
                .map_err(|e| MqttError::Configuration(format!("Failed to parse private key: {}", e)))?
                .ok_or_else(|| MqttError::Configuration("No private key found".to_string()))?;

            builder
                .with_client_auth_cert(cert_chain, private_key)
                .map_err(|e| MqttError::Configuration(format!("Failed to create TLS config: {}", e)))?
        } else {
            builder.with_no_client_auth()
        };

        let mut client_config = client_config;
        if !self.settings.tls_reject_unauthorized {
            warn!("TLS server verification disabled");
            client_config
                .dangerous()
                .set_certificate_verifier(Arc::new(NoServerVerification));
        }

        Ok(TlsConfiguration::Rustls(Arc::new(client_config)))
    }

    /// Drive the rumqttc event loop: track connection state, replay
    /// subscriptions after reconnect, dispatch publishes to the callback.
    fn start_event_loop(
        mut event_loop: EventLoop,
        client: AsyncClient,
        connection_status: Arc<RwLock<ConnectionStatus>>,
        subscriptions: Arc<RwLock<HashMap<String, QoS>>>,
        message_callback: Arc<RwLock<Option<MessageCallback>>>,
        reconnect_delay: Duration,
    ) {
        tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Connected to broker");
                        *connection_status.write().await = ConnectionStatus::Connected;

                        let subs = subscriptions.read().await.clone();
                        for (topic, qos) in subs {
                            if let Err(e) = client.subscribe(&topic, qos).await {
                                error!("Resubscribe to {} failed: {}", topic, e);
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        debug!("Received message on topic: {}", publish.topic);

                        let message = MqttMessage {
                            topic: publish.topic,
                            payload: publish.payload.to_vec(),
                            qos: publish.qos as u8,
                            retain: publish.retain,
                            timestamp: Utc::now(),
                        };

                        if let Some(callback) = message_callback.read().await.as_ref() {
                            if let Err(e) = callback(message) {
                                error!("Message callback error: {}", e);
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        warn!("Disconnected from broker");
                        *connection_status.write().await = ConnectionStatus::Disconnected;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let previous = *connection_status.read().await;
                        if previous == ConnectionStatus::Connected {
                            warn!("Broker connection lost: {}", e);
                        } else {
                            debug!("Broker connection attempt failed: {}", e);
                        }
                        *connection_status.write().await = ConnectionStatus::Reconnecting;
                        sleep(reconnect_delay).await;
                    }
                }
            }
        });
    }

    fn validate_topic(&self, topic: &str) -> MqttResult<()> {
        if topic.is_empty() {
            return Err(MqttError::TopicValidation("Topic cannot be empty".to_string()));
        }
        if topic.len() > 256 {
            return Err(MqttError::TopicValidation(
                "Topic too long (max 256 characters)".to_string(),
            ));
        }
        if topic.contains('\0') || topic.contains('\n') || topic.contains('\r') {
            return Err(MqttError::TopicValidation(
                "Topic contains invalid characters".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl MqttClientTrait for HubMqttClient {
    async fn connect(&mut self) -> MqttResult<()> {
        info!("Connecting to broker: {}", self.settings.url);

        *self.connection_status.write().await = ConnectionStatus::Connecting;

        let mqtt_options = self.create_mqtt_options()?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, 64);

        self.mqtt_client = Some(client.clone());

        Self::start_event_loop(
            event_loop,
            client,
            Arc::clone(&self.connection_status),
            Arc::clone(&self.subscriptions),
            Arc::clone(&self.message_callback),
            self.settings.reconnect_delay,
        );

        // Wait briefly for the first ConnAck. A broker that is still coming
        // up is not fatal: the event loop keeps reconnecting on its cadence
        // and publishes/subscriptions queue in the meantime.
        let connection_timeout = Duration::from_secs(10);
        let start_time = std::time::Instant::now();
        while start_time.elapsed() < connection_timeout {
            if *self.connection_status.read().await == ConnectionStatus::Connected {
                return Ok(());
            }
            sleep(Duration::from_millis(100)).await;
        }

        warn!("Broker not reachable yet, continuing with background reconnect");
        Ok(())
    }

    async fn disconnect(&mut self) -> MqttResult<()> {
        info!("Disconnecting from broker");

        if let Some(client) = &self.mqtt_client {
            client
                .disconnect()
                .await
                .map_err(|e| MqttError::Connection(format!("Disconnect failed: {}", e)))?;
        }

        *self.connection_status.write().await = ConnectionStatus::Disconnected;
        self.mqtt_client = None;

        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> MqttResult<()> {
        self.validate_topic(topic)?;

        let client = self.mqtt_client.as_ref().ok_or(MqttError::NotConnected)?;

        debug!("Publishing to topic: {} ({} bytes)", topic, payload.len());

        client
            .publish(topic, qos, false, payload)
            .await
            .map_err(|e| MqttError::Publish(format!("Publish to {} failed: {}", topic, e)))
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> MqttResult<()> {
        self.validate_topic(topic)?;

        let client = self.mqtt_client.as_ref().ok_or(MqttError::NotConnected)?;

        self.subscriptions
            .write()
            .await
            .insert(topic.to_string(), qos);

        client
            .subscribe(topic, qos)
            .await
            .map_err(|e| MqttError::Subscribe(format!("Subscribe to {} failed: {}", topic, e)))?;

        info!("Subscribed to topic: {}", topic);
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> MqttResult<()> {
        let client = self.mqtt_client.as_ref().ok_or(MqttError::NotConnected)?;

        self.subscriptions.write().await.remove(topic);

        client
            .unsubscribe(topic)
            .await
            .map_err(|e| MqttError::Subscribe(format!("Unsubscribe from {} failed: {}", topic, e)))
    }

    fn get_connection_status(&self) -> ConnectionStatus {
        self.connection_status
            .try_read()
            .map(|status| *status)
            .unwrap_or(ConnectionStatus::Disconnected)
    }

    fn set_message_callback(&self, callback: MessageCallback) {
        if let Ok(mut cb) = self.message_callback.try_write() {
            *cb = Some(callback);
        }
    }
}

/// Server certificate verifier that accepts anything. Only installed when
/// `MQTT_TLS_REJECT_UNAUTHORIZED=false`.
#[derive(Debug)]
struct NoServerVerification;

impl rustls::client::danger::ServerCertVerifier for NoServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Mock broker client for tests: records publishes and subscriptions and
/// lets tests inject incoming messages through the registered callback.
pub struct MockMqttClient {
    connected: Arc<RwLock<bool>>,
    published: Arc<Mutex<Vec<(String, Vec<u8>, QoS)>>>,
    subscriptions: Arc<RwLock<HashMap<String, QoS>>>,
    message_callback: Arc<RwLock<Option<MessageCallback>>>,
}

impl MockMqttClient {
    pub fn new() -> Self {
        Self {
            connected: Arc::new(RwLock::new(false)),
            published: Arc::new(Mutex::new(Vec::new())),
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            message_callback: Arc::new(RwLock::new(None)),
        }
    }

    /// All messages published through this client, in order
    pub async fn published_messages(&self) -> Vec<(String, Vec<u8>, QoS)> {
        self.published.lock().await.clone()
    }

    /// Published messages on one topic
    pub async fn published_on(&self, topic: &str) -> Vec<Vec<u8>> {
        self.published
            .lock()
            .await
            .iter()
            .filter(|(t, _, _)| t == topic)
            .map(|(_, p, _)| p.clone())
            .collect()
    }

    pub async fn subscription_topics(&self) -> Vec<String> {
        self.subscriptions.read().await.keys().cloned().collect()
    }

    pub async fn clear_published(&self) {
        self.published.lock().await.clear();
    }

    /// Deliver a message to the registered callback as if it arrived from
    /// the broker.
    pub async fn inject_message(&self, topic: &str, payload: &[u8]) -> MqttResult<()> {
        let message = MqttMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos: 1,
            retain: false,
            timestamp: Utc::now(),
        };
        let callback = self.message_callback.read().await.clone();
        match callback {
            Some(cb) => cb(message),
            None => Err(MqttError::Configuration(
                "No message callback registered".to_string(),
            )),
        }
    }
}

impl Default for MockMqttClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MqttClientTrait for MockMqttClient {
    async fn connect(&mut self) -> MqttResult<()> {
        *self.connected.write().await = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> MqttResult<()> {
        *self.connected.write().await = false;
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> MqttResult<()> {
        self.published
            .lock()
            .await
            .push((topic.to_string(), payload.to_vec(), qos));
        Ok(())
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> MqttResult<()> {
        self.subscriptions
            .write()
            .await
            .insert(topic.to_string(), qos);
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> MqttResult<()> {
        self.subscriptions.write().await.remove(topic);
        Ok(())
    }

    fn get_connection_status(&self) -> ConnectionStatus {
        match self.connected.try_read() {
            Ok(connected) if *connected => ConnectionStatus::Connected,
            _ => ConnectionStatus::Disconnected,
        }
    }

    fn set_message_callback(&self, callback: MessageCallback) {
        if let Ok(mut cb) = self.message_callback.try_write() {
            *cb = Some(callback);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_client_records_publishes() {
        let mut client = MockMqttClient::new();
        client.connect().await.unwrap();

        client
            .publish("$devicehub/devices/u-1/telemetry", b"{}", QoS::AtLeastOnce)
            .await
            .unwrap();

        let published = client.published_messages().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "$devicehub/devices/u-1/telemetry");
    }

    #[tokio::test]
    async fn test_mock_client_injects_into_callback() {
        let client = MockMqttClient::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        client.set_message_callback(Arc::new(move |msg| {
            tx.send(msg).map_err(|e| MqttError::Publish(e.to_string()))
        }));

        client
            .inject_message("$devicehub/devices/u-1/status", b"{\"status\":\"online\"}")
            .await
            .unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.topic, "$devicehub/devices/u-1/status");
    }

    #[test]
    fn test_topic_validation() {
        let client = HubMqttClient::new(MqttSettings::default(), "test");
        assert!(client.validate_topic("a/b/c").is_ok());
        assert!(client.validate_topic("").is_err());
        assert!(client.validate_topic("bad\ntopic").is_err());
        let long = "x".repeat(300);
        assert!(client.validate_topic(&long).is_err());
    }
}
