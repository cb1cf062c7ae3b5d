//! Shared fixtures for the integration suite.

use devicehub_core::ca::CertificateAuthority;
use devicehub_core::config::CaSettings;
use devicehub_core::{
    IdentityStore, MockMqttClient, ProvisioningService, TwinService,
};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use std::sync::Arc;
use tempfile::TempDir;

/// Build a PEM CSR with the given subject CN, the way a device SDK would.
pub fn make_csr(cn: &str) -> String {
    let key_pair = KeyPair::generate().unwrap();
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, cn);
    params.distinguished_name = dn;
    params.serialize_request(&key_pair).unwrap().pem().unwrap()
}

/// A hub wired onto a mock broker: provisioning broker and twin engine share
/// one store and CA, the way the real services share the database file.
pub struct HubFixture {
    pub mqtt: Arc<MockMqttClient>,
    pub store: IdentityStore,
    pub ca: Arc<CertificateAuthority>,
    pub provisioning: Arc<ProvisioningService>,
    pub twin: Arc<TwinService>,
    _dir: TempDir,
}

impl HubFixture {
    pub async fn new(enforce_whitelist: bool) -> Self {
        let dir = TempDir::new().unwrap();
        let ca = Arc::new(CertificateAuthority::new(CaSettings {
            crt_path: dir.path().join("certs/root/ca.crt"),
            key_path: dir.path().join("certs/root/ca.key"),
            cert_days: 825,
        }));
        // 2048-bit root keeps the suite fast; policy is identical
        ca.ensure_root_ca(None, None, Some(2048)).await.unwrap();

        let mqtt = Arc::new(MockMqttClient::new());
        let store = IdentityStore::open_in_memory().unwrap();
        let provisioning = ProvisioningService::new(
            mqtt.clone(),
            store.clone(),
            Arc::clone(&ca),
            enforce_whitelist,
            None,
        );
        let twin = TwinService::new(mqtt.clone(), store.clone());

        Self {
            mqtt,
            store,
            ca,
            provisioning,
            twin,
            _dir: dir,
        }
    }
}
