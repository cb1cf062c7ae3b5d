//! Certificate authority subsystem.
//!
//! Owns the root CA keypair and issues per-device client certificates from
//! device-supplied CSRs. The subject CN of every issued certificate equals
//! the device UUID; the broker maps CN to username for its topic ACLs, so
//! the CN policy check here is what prevents impersonation.

use crate::config::CaSettings;
use crate::{CaError, CaResult};

use chrono::{DateTime, Utc};
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SerialNumber,
};
use rand::Rng;
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::prelude::FromDer;

/// Default root CA subject CN
pub const DEFAULT_ROOT_CN: &str = "Edgeberry Device Hub Root CA";
/// Default root CA validity in days
pub const DEFAULT_ROOT_DAYS: u32 = 3650;
/// Default root CA RSA modulus size in bits
pub const DEFAULT_ROOT_BITS: usize = 4096;
/// Default device certificate validity in days
pub const DEFAULT_CERT_DAYS: u32 = 825;
/// Subject CN of the shared bootstrap identity
pub const PROVISIONING_CN: &str = "provisioning";

/// Metadata of a certificate on disk or just issued
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateInfo {
    pub subject: String,
    pub issuer: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub fingerprint: String,
}

/// Result of issuing a client certificate
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub cert_pem: String,
    pub chain_pem: String,
    pub info: CertificateInfo,
}

/// The hub's certificate authority
pub struct CertificateAuthority {
    settings: CaSettings,
    provisioning_dir: PathBuf,
}

impl CertificateAuthority {
    pub fn new(settings: CaSettings) -> Self {
        let provisioning_dir = settings
            .crt_path
            .parent()
            .and_then(Path::parent)
            .map(|certs| certs.join("provisioning"))
            .unwrap_or_else(|| PathBuf::from("provisioning"));
        Self {
            settings,
            provisioning_dir,
        }
    }

    pub fn provisioning_dir(&self) -> &Path {
        &self.provisioning_dir
    }

    /// Generate the root CA keypair and self-signed certificate if the files
    /// are absent. Returns the root certificate metadata either way.
    pub async fn ensure_root_ca(
        &self,
        cn: Option<&str>,
        days: Option<u32>,
        bits: Option<usize>,
    ) -> CaResult<CertificateInfo> {
        let key_exists = self.settings.key_path.exists();
        let crt_exists = self.settings.crt_path.exists();

        if key_exists && crt_exists {
            let cert_pem = std::fs::read_to_string(&self.settings.crt_path)
                .map_err(|e| CaError::NoRootCa(format!("Cannot read root certificate: {}", e)))?;
            return inspect_certificate(&cert_pem);
        }
        if key_exists != crt_exists {
            return Err(CaError::NoRootCa(
                "Root CA key/certificate pair is incomplete".to_string(),
            ));
        }

        let cn = cn.unwrap_or(DEFAULT_ROOT_CN).to_string();
        let days = days.unwrap_or(DEFAULT_ROOT_DAYS);
        let bits = bits.unwrap_or(DEFAULT_ROOT_BITS);

        info!("Generating root CA '{}' ({} bits, {} days)", cn, bits, days);

        // RSA keygen is CPU-bound; keep it off the async threads.
        let key_pem = tokio::task::spawn_blocking(move || generate_rsa_key_pem(bits))
            .await
            .map_err(|e| CaError::KeyGeneration(format!("Keygen worker failed: {}", e)))??;

        let key_pair = KeyPair::from_pem(&key_pem)
            .map_err(|e| CaError::KeyGeneration(format!("Root key unusable: {}", e)))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, cn);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.not_before = OffsetDateTime::now_utc();
        params.not_after = OffsetDateTime::now_utc() + Duration::days(days as i64);
        params.serial_number = Some(random_serial());

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| CaError::SigningFailed(format!("Root self-sign failed: {}", e)))?;
        let cert_pem = cert.pem();

        write_key(&self.settings.key_path, &key_pem)?;
        write_cert(&self.settings.crt_path, &cert_pem)?;

        info!("Root CA written to {}", self.settings.crt_path.display());
        inspect_certificate(&cert_pem)
    }

    /// Issue a client certificate from a device CSR.
    ///
    /// Policy: the CSR must be well-formed PEM with a verifiable signature
    /// and its subject CN must equal `device_uuid` exactly. Requested
    /// extensions are discarded; the issued certificate always carries
    /// CA:FALSE, digitalSignature+keyEncipherment, clientAuth, SKI and AKI.
    pub async fn issue_client_cert(
        &self,
        device_uuid: &str,
        csr_pem: &str,
        days: Option<u32>,
    ) -> CaResult<IssuedCertificate> {
        let (root_key, root_cert_pem) = self.load_root()?;

        let csr_cn = extract_csr_cn(csr_pem)?;
        if csr_cn != device_uuid {
            return Err(CaError::CsrCnMismatch(format!(
                "CSR CN '{}' does not match device UUID '{}'",
                csr_cn, device_uuid
            )));
        }

        let mut csr_params = CertificateSigningRequestParams::from_pem(csr_pem)
            .map_err(|e| CaError::InvalidCsr(format!("CSR rejected: {}", e)))?;

        let days = days.unwrap_or(self.settings.cert_days).max(1);
        let now = OffsetDateTime::now_utc();
        let requested_end = now + Duration::days(days as i64);
        let root_end = certificate_not_after(&root_cert_pem)?;
        let not_after = if requested_end > root_end {
            debug!("Capping device cert validity at root CA expiry");
            root_end
        } else {
            requested_end
        };

        csr_params.params.is_ca = IsCa::ExplicitNoCa;
        csr_params.params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        csr_params.params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        csr_params.params.use_authority_key_identifier_extension = true;
        csr_params.params.not_before = now;
        csr_params.params.not_after = not_after;
        csr_params.params.serial_number = Some(random_serial());

        let issuer = Issuer::from_ca_cert_pem(&root_cert_pem, root_key)
            .map_err(|e| CaError::NoRootCa(format!("Root CA unusable: {}", e)))?;

        let cert = csr_params
            .signed_by(&issuer)
            .map_err(|e| CaError::SigningFailed(format!("Client cert signing failed: {}", e)))?;
        let cert_pem = cert.pem();
        let info = inspect_certificate(&cert_pem)?;

        info!(
            "Issued client certificate CN={} fingerprint={}",
            device_uuid, info.fingerprint
        );

        Ok(IssuedCertificate {
            cert_pem,
            chain_pem: root_cert_pem,
            info,
        })
    }

    /// Issue the shared bootstrap identity (CN=`provisioning`) used by
    /// devices for the provisioning handshake, unless it already exists.
    /// Returns the certificate and key paths.
    pub async fn ensure_provisioning_cert(&self, name: &str) -> CaResult<(PathBuf, PathBuf)> {
        let crt_path = self.provisioning_dir.join(format!("{}.crt", name));
        let key_path = self.provisioning_dir.join(format!("{}.key", name));
        if crt_path.exists() && key_path.exists() {
            return Ok((crt_path, key_path));
        }

        let (root_key, root_cert_pem) = self.load_root()?;

        let key_pem = tokio::task::spawn_blocking(|| generate_rsa_key_pem(2048))
            .await
            .map_err(|e| CaError::KeyGeneration(format!("Keygen worker failed: {}", e)))??;
        let key_pair = KeyPair::from_pem(&key_pem)
            .map_err(|e| CaError::KeyGeneration(format!("Provisioning key unusable: {}", e)))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, PROVISIONING_CN);
        params.distinguished_name = dn;
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        params.use_authority_key_identifier_extension = true;
        params.not_before = OffsetDateTime::now_utc();
        params.not_after = certificate_not_after(&root_cert_pem)?;
        params.serial_number = Some(random_serial());

        let issuer = Issuer::from_ca_cert_pem(&root_cert_pem, root_key)
            .map_err(|e| CaError::NoRootCa(format!("Root CA unusable: {}", e)))?;
        let cert = params
            .signed_by(&key_pair, &issuer)
            .map_err(|e| CaError::SigningFailed(format!("Provisioning cert signing failed: {}", e)))?;

        write_key(&key_path, &key_pem)?;
        write_cert(&crt_path, &cert.pem())?;

        info!("Provisioning identity written to {}", crt_path.display());
        Ok((crt_path, key_path))
    }

    fn load_root(&self) -> CaResult<(KeyPair, String)> {
        let key_pem = std::fs::read_to_string(&self.settings.key_path)
            .map_err(|e| CaError::NoRootCa(format!("Cannot read root key: {}", e)))?;
        let cert_pem = std::fs::read_to_string(&self.settings.crt_path)
            .map_err(|e| CaError::NoRootCa(format!("Cannot read root certificate: {}", e)))?;
        let key_pair = KeyPair::from_pem(&key_pem)
            .map_err(|e| CaError::NoRootCa(format!("Root key unusable: {}", e)))?;
        Ok((key_pair, cert_pem))
    }
}

/// Generate an RSA private key, PKCS#8 PEM encoded.
fn generate_rsa_key_pem(bits: usize) -> CaResult<String> {
    let key = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), bits)
        .map_err(|e| CaError::KeyGeneration(format!("RSA generation failed: {}", e)))?;
    let pem = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| CaError::KeyGeneration(format!("RSA encoding failed: {}", e)))?;
    Ok(pem.to_string())
}

fn random_serial() -> SerialNumber {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    SerialNumber::from_slice(&bytes)
}

/// Extract and verify the subject CN of a PEM-encoded CSR.
fn extract_csr_cn(csr_pem: &str) -> CaResult<String> {
    let block = pem::parse(csr_pem)
        .map_err(|e| CaError::InvalidCsr(format!("Not valid PEM: {}", e)))?;
    if block.tag() != "CERTIFICATE REQUEST" && block.tag() != "NEW CERTIFICATE REQUEST" {
        return Err(CaError::InvalidCsr(format!(
            "Unexpected PEM block '{}'",
            block.tag()
        )));
    }
    let (_, csr) = X509CertificationRequest::from_der(block.contents())
        .map_err(|e| CaError::InvalidCsr(format!("CSR parse failed: {}", e)))?;
    csr.verify_signature()
        .map_err(|e| CaError::InvalidCsr(format!("CSR signature invalid: {}", e)))?;

    let cn = csr
        .certification_request_info
        .subject
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .ok_or_else(|| CaError::InvalidCsr("CSR subject has no CN".to_string()))?;
    Ok(cn.to_string())
}

/// Read certificate metadata from a PEM blob.
pub fn inspect_certificate(cert_pem: &str) -> CaResult<CertificateInfo> {
    let (_, parsed_pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
        .map_err(|e| CaError::InvalidCsr(format!("Not valid PEM: {}", e)))?;
    let cert = parsed_pem
        .parse_x509()
        .map_err(|e| CaError::InvalidCsr(format!("Certificate parse failed: {}", e)))?;

    let fingerprint = hex::encode(Sha256::digest(&parsed_pem.contents));

    Ok(CertificateInfo {
        subject: cert.subject().to_string(),
        issuer: cert.issuer().to_string(),
        not_before: timestamp_to_utc(cert.validity().not_before.timestamp())?,
        not_after: timestamp_to_utc(cert.validity().not_after.timestamp())?,
        fingerprint,
    })
}

fn certificate_not_after(cert_pem: &str) -> CaResult<OffsetDateTime> {
    let info = inspect_certificate(cert_pem)?;
    OffsetDateTime::from_unix_timestamp(info.not_after.timestamp())
        .map_err(|e| CaError::SigningFailed(format!("Root validity out of range: {}", e)))
}

fn timestamp_to_utc(ts: i64) -> CaResult<DateTime<Utc>> {
    DateTime::from_timestamp(ts, 0)
        .ok_or_else(|| CaError::InvalidCsr(format!("Timestamp out of range: {}", ts)))
}

fn write_key(path: &Path, pem: &str) -> CaResult<()> {
    write_with_mode(path, pem, 0o600)
}

fn write_cert(path: &Path, pem: &str) -> CaResult<()> {
    write_with_mode(path, pem, 0o640)
}

fn write_with_mode(path: &Path, content: &str, mode: u32) -> CaResult<()> {
    use std::os::unix::fs::PermissionsExt;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| CaError::Storage(format!("Cannot create {}: {}", parent.display(), e)))?;
    }
    std::fs::write(path, content)
        .map_err(|e| CaError::Storage(format!("Cannot write {}: {}", path.display(), e)))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|e| CaError::Storage(format!("Cannot chmod {}: {}", path.display(), e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CaSettings;
    use tempfile::TempDir;

    fn test_ca(dir: &TempDir) -> CertificateAuthority {
        CertificateAuthority::new(CaSettings {
            crt_path: dir.path().join("certs/root/ca.crt"),
            key_path: dir.path().join("certs/root/ca.key"),
            cert_days: 825,
        })
    }

    fn make_csr(cn: &str) -> String {
        let key_pair = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, cn);
        params.distinguished_name = dn;
        params.serialize_request(&key_pair).unwrap().pem().unwrap()
    }

    #[tokio::test]
    async fn test_root_ca_generation_and_reload() {
        let dir = TempDir::new().unwrap();
        let ca = test_ca(&dir);

        let info = ca.ensure_root_ca(None, None, Some(2048)).await.unwrap();
        assert!(info.subject.contains(DEFAULT_ROOT_CN));

        // Second call loads the existing pair instead of regenerating
        let again = ca.ensure_root_ca(None, None, Some(2048)).await.unwrap();
        assert_eq!(info.fingerprint, again.fingerprint);
    }

    #[tokio::test]
    async fn test_root_key_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let ca = test_ca(&dir);
        ca.ensure_root_ca(None, None, Some(2048)).await.unwrap();

        let key_mode = std::fs::metadata(dir.path().join("certs/root/ca.key"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(key_mode & 0o777, 0o600);

        let crt_mode = std::fs::metadata(dir.path().join("certs/root/ca.crt"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(crt_mode & 0o777, 0o640);
    }

    #[tokio::test]
    async fn test_issue_client_cert_binds_cn() {
        let dir = TempDir::new().unwrap();
        let ca = test_ca(&dir);
        ca.ensure_root_ca(None, None, Some(2048)).await.unwrap();

        let uuid = "9205255a-7a56-43b1-8b51-3b2a83fca4a1";
        let issued = ca
            .issue_client_cert(uuid, &make_csr(uuid), None)
            .await
            .unwrap();

        assert!(issued.info.subject.contains(uuid));
        assert!(issued.info.issuer.contains(DEFAULT_ROOT_CN));
        assert!(issued.chain_pem.contains("BEGIN CERTIFICATE"));
    }

    #[tokio::test]
    async fn test_cn_mismatch_rejected() {
        let dir = TempDir::new().unwrap();
        let ca = test_ca(&dir);
        ca.ensure_root_ca(None, None, Some(2048)).await.unwrap();

        let result = ca
            .issue_client_cert("expected-uuid", &make_csr("attacker"), None)
            .await;
        match result {
            Err(CaError::CsrCnMismatch(_)) => {}
            other => panic!("expected CN mismatch, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_garbage_csr_rejected() {
        let dir = TempDir::new().unwrap();
        let ca = test_ca(&dir);
        ca.ensure_root_ca(None, None, Some(2048)).await.unwrap();

        match ca.issue_client_cert("u-1", "not a csr", None).await {
            Err(CaError::InvalidCsr(_)) => {}
            other => panic!("expected invalid CSR, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_no_root_ca() {
        let dir = TempDir::new().unwrap();
        let ca = test_ca(&dir);

        match ca.issue_client_cert("u-1", &make_csr("u-1"), None).await {
            Err(CaError::NoRootCa(_)) => {}
            other => panic!("expected no root CA, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_validity_capped_at_root_expiry() {
        let dir = TempDir::new().unwrap();
        let ca = test_ca(&dir);
        // Root valid for 10 days; request 825
        ca.ensure_root_ca(None, Some(10), Some(2048)).await.unwrap();

        let uuid = "u-1234";
        let issued = ca
            .issue_client_cert(uuid, &make_csr(uuid), Some(825))
            .await
            .unwrap();

        let root_info = inspect_certificate(&issued.chain_pem).unwrap();
        assert!(issued.info.not_after <= root_info.not_after);
    }

    #[tokio::test]
    async fn test_provisioning_cert() {
        let dir = TempDir::new().unwrap();
        let ca = test_ca(&dir);
        ca.ensure_root_ca(None, None, Some(2048)).await.unwrap();

        let (crt, key) = ca.ensure_provisioning_cert("provisioning").await.unwrap();
        assert!(crt.exists());
        assert!(key.exists());

        let info = inspect_certificate(&std::fs::read_to_string(&crt).unwrap()).unwrap();
        assert!(info.subject.contains(PROVISIONING_CN));

        // Idempotent
        let (crt2, _) = ca.ensure_provisioning_cert("provisioning").await.unwrap();
        assert_eq!(crt, crt2);
    }
}
