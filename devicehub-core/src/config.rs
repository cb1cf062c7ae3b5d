use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Broker client settings shared by every hub service
#[derive(Debug, Clone)]
pub struct MqttSettings {
    /// Broker URL, e.g. `mqtts://localhost:8883`
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls_ca: Option<PathBuf>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub tls_reject_unauthorized: bool,
    pub keep_alive: Duration,
    pub reconnect_delay: Duration,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            url: "mqtts://127.0.0.1:8883".to_string(),
            username: None,
            password: None,
            tls_ca: None,
            tls_cert: None,
            tls_key: None,
            tls_reject_unauthorized: true,
            keep_alive: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(2),
        }
    }
}

/// Certificate authority paths and issuance defaults
#[derive(Debug, Clone)]
pub struct CaSettings {
    pub crt_path: PathBuf,
    pub key_path: PathBuf,
    /// Default validity for issued device certificates, in days
    pub cert_days: u32,
}

impl Default for CaSettings {
    fn default() -> Self {
        Self {
            crt_path: PathBuf::from("/var/lib/devicehub/certs/root/ca.crt"),
            key_path: PathBuf::from("/var/lib/devicehub/certs/root/ca.key"),
            cert_days: 825,
        }
    }
}

/// Identity store location
#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub db_path: PathBuf,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("/var/lib/devicehub/devicehub.db"),
        }
    }
}

/// Application gateway listen settings
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub port: u16,
    pub application_port: u16,
    pub method_timeout: Duration,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            port: 8080,
            application_port: 8090,
            method_timeout: Duration::from_secs(30),
        }
    }
}

/// Name translator cache tuning
#[derive(Debug, Clone)]
pub struct TranslatorSettings {
    pub cache_ttl: Duration,
}

impl Default for TranslatorSettings {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(60),
        }
    }
}

/// Local IPC socket directory
#[derive(Debug, Clone)]
pub struct IpcSettings {
    pub socket_dir: PathBuf,
}

impl Default for IpcSettings {
    fn default() -> Self {
        Self {
            socket_dir: PathBuf::from("/run/devicehub"),
        }
    }
}

/// Complete hub configuration assembled from the environment
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub mqtt: MqttSettings,
    pub ca: CaSettings,
    pub store: StoreSettings,
    pub gateway: GatewaySettings,
    pub translator: TranslatorSettings,
    pub ipc: IpcSettings,
    /// When false, any UUID may provision without an allow-list entry
    pub enforce_whitelist: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            mqtt: MqttSettings::default(),
            ca: CaSettings::default(),
            store: StoreSettings::default(),
            gateway: GatewaySettings::default(),
            translator: TranslatorSettings::default(),
            ipc: IpcSettings::default(),
            enforce_whitelist: true,
        }
    }
}

impl HubConfig {
    /// Read configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Self {
        let mut config = Self {
            enforce_whitelist: env_bool("ENFORCE_WHITELIST", true),
            ..Self::default()
        };

        if let Ok(url) = env::var("MQTT_URL") {
            config.mqtt.url = url;
        }
        config.mqtt.username = env::var("MQTT_USERNAME").ok();
        config.mqtt.password = env::var("MQTT_PASSWORD").ok();
        config.mqtt.tls_ca = env_path("MQTT_TLS_CA");
        config.mqtt.tls_cert = env_path("MQTT_TLS_CERT");
        config.mqtt.tls_key = env_path("MQTT_TLS_KEY");
        config.mqtt.tls_reject_unauthorized = env_bool("MQTT_TLS_REJECT_UNAUTHORIZED", true);

        if let Some(path) = env_path("CA_CRT_PATH") {
            config.ca.crt_path = path;
        }
        if let Some(path) = env_path("CA_KEY_PATH") {
            config.ca.key_path = path;
        }
        if let Some(days) = env_parse::<u32>("CERT_DAYS") {
            config.ca.cert_days = days;
        }

        if let Some(path) = env_path("DEVICEHUB_DB") {
            config.store.db_path = path;
        }

        if let Some(port) = env_parse::<u16>("PORT") {
            config.gateway.port = port;
        }
        if let Some(port) = env_parse::<u16>("APPLICATION_PORT") {
            config.gateway.application_port = port;
        }

        if let Some(secs) = env_parse::<u64>("NAME_CACHE_TTL_SECS") {
            // Clamp to the supported window: 30 seconds to 10 minutes
            config.translator.cache_ttl = Duration::from_secs(secs.clamp(30, 600));
        }

        if let Some(dir) = env_path("DEVICEHUB_IPC_DIR") {
            config.ipc.socket_dir = dir;
        }

        config
    }

    /// Socket path for a named IPC interface provider
    pub fn ipc_socket(&self, service: &str) -> PathBuf {
        self.ipc.socket_dir.join(format!("{}.sock", service))
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(value) => !matches!(value.to_ascii_lowercase().as_str(), "0" | "false" | "no"),
        Err(_) => default,
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var(key).ok().filter(|v| !v.is_empty()).map(PathBuf::from)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HubConfig::default();
        assert_eq!(config.ca.cert_days, 825);
        assert_eq!(config.gateway.method_timeout, Duration::from_secs(30));
        assert_eq!(config.mqtt.reconnect_delay, Duration::from_secs(2));
        assert!(config.mqtt.tls_reject_unauthorized);
    }

    #[test]
    fn test_ipc_socket_path() {
        let config = HubConfig::default();
        assert_eq!(
            config.ipc_socket("twin"),
            PathBuf::from("/run/devicehub/twin.sock")
        );
    }
}
