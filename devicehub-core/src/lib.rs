pub mod ca;
pub mod config;
pub mod error;
pub mod gateway;
pub mod ipc;
pub mod logging;
pub mod mqtt_client;
pub mod provisioning;
pub mod store;
pub mod topics;
pub mod translator;
pub mod twin;
pub mod types;

pub use ca::{CertificateAuthority, CertificateInfo, IssuedCertificate};
pub use config::HubConfig;
pub use error::*;
pub use gateway::{GatewayState, PendingMethodCalls};
pub use ipc::{IpcClient, IpcServer};
pub use logging::{
    initialize_default_logging, initialize_logging, LogFormat, LogLevel, LoggingConfig,
};
pub use mqtt_client::{HubMqttClient, MessageCallback, MockMqttClient, MqttClientTrait};
pub use provisioning::ProvisioningService;
pub use store::IdentityStore;
pub use translator::NameTranslator;
pub use twin::{TwinService, TwinUpdateError};
pub use types::*;
