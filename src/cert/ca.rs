//! Root CA lifecycle: generate-or-load, persist, fingerprint.

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context};
use rand::rngs::OsRng;
use rand::RngCore;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SerialNumber,
};
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use rustls::pki_types::CertificateDer;
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime};
use x509_parser::prelude::{FromDer, PublicKey, X509Certificate};

use crate::error::ProxyError;

/// Key family the CA (and, transitively, every leaf it signs) uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    Rsa2048,
    EcdsaP256,
}

impl FromStr for KeyAlgorithm {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rsa" => Ok(KeyAlgorithm::Rsa2048),
            "ecdsa" => Ok(KeyAlgorithm::EcdsaP256),
            _ => Err(()),
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyAlgorithm::Rsa2048 => write!(f, "rsa"),
            KeyAlgorithm::EcdsaP256 => write!(f, "ecdsa"),
        }
    }
}

/// A self-signed root CA: its keypair, its own certificate, and the PEM
/// encodings of both. Read-only after construction and shareable across
/// tasks without synchronization.
pub struct RootCa {
    pub algorithm: KeyAlgorithm,
    pub(crate) key_pair: KeyPair,
    pub(crate) cert: Certificate,
    pub cert_pem: String,
    key_pem: String,
}

impl RootCa {
    /// Generates a fresh CA keypair and self-signed certificate.
    pub fn generate(algorithm: KeyAlgorithm) -> anyhow::Result<Self> {
        let key_pair = generate_key_pair(algorithm)?;
        let params = root_ca_params()?;
        let cert = params
            .self_signed(&key_pair)
            .context("failed to self-sign CA certificate")?;

        let cert_pem = cert.pem();
        let key_pem = key_pair.serialize_pem();

        Ok(Self {
            algorithm,
            key_pair,
            cert,
            cert_pem,
            key_pem,
        })
    }

    /// Loads a previously generated CA from its PEM files, validating that
    /// its key still meets the minimum strength requirement.
    pub fn load(cert_path: &Path, key_path: &Path) -> anyhow::Result<Self> {
        let cert_pem = fs::read_to_string(cert_path)
            .map_err(|e| ProxyError::CaIo(format!("reading CA cert {}: {e}", cert_path.display())))?;
        let key_pem = fs::read_to_string(key_path)
            .map_err(|e| ProxyError::CaIo(format!("reading CA key {}: {e}", key_path.display())))?;

        let key_pair =
            KeyPair::from_pem(&key_pem).map_err(|e| ProxyError::CaIo(format!("parsing CA key: {e}")))?;
        let params = CertificateParams::from_ca_cert_pem(&cert_pem)
            .map_err(|e| ProxyError::CaIo(format!("parsing CA certificate: {e}")))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| ProxyError::CaIo(format!("reconstructing CA certificate: {e}")))?;

        let algorithm = detect_algorithm(cert.der())?;
        validate_key_strength(cert.der(), algorithm)?;

        Ok(Self {
            algorithm,
            key_pair,
            cert,
            cert_pem,
            key_pem,
        })
    }

    /// Loads the CA at the given paths if both files exist, otherwise
    /// generates and persists a new one.
    pub fn load_or_generate(
        cert_path: &Path,
        key_path: &Path,
        algorithm: KeyAlgorithm,
    ) -> anyhow::Result<Self> {
        if cert_path.exists() && key_path.exists() {
            return Self::load(cert_path, key_path);
        }
        let ca = Self::generate(algorithm)?;
        ca.save(cert_path, key_path)?;
        Ok(ca)
    }

    /// Persists the cert (world-readable) and key (owner-only) PEM files,
    /// creating the parent directory if it doesn't exist yet.
    pub fn save(&self, cert_path: &Path, key_path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = cert_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| ProxyError::CaIo(format!("creating {}: {e}", parent.display())))?;
        }

        fs::write(cert_path, &self.cert_pem)
            .map_err(|e| ProxyError::CaIo(format!("writing {}: {e}", cert_path.display())))?;
        set_mode(cert_path, 0o644)?;

        fs::write(key_path, &self.key_pem)
            .map_err(|e| ProxyError::CaIo(format!("writing {}: {e}", key_path.display())))?;
        set_mode(key_path, 0o600)?;

        Ok(())
    }

    pub fn der(&self) -> &CertificateDer<'static> {
        self.cert.der()
    }

    pub fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }

    pub fn cert(&self) -> &Certificate {
        &self.cert
    }

    /// SHA-256 over the DER-encoded certificate, hex-encoded.
    pub fn fingerprint(&self) -> String {
        fingerprint_der(self.cert.der())
    }
}

pub fn fingerprint_der(der: &[u8]) -> String {
    let digest = Sha256::digest(der);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

pub(crate) fn generate_key_pair(algorithm: KeyAlgorithm) -> anyhow::Result<KeyPair> {
    match algorithm {
        KeyAlgorithm::EcdsaP256 => KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .context("failed to generate ECDSA P-256 key pair"),
        KeyAlgorithm::Rsa2048 => {
            // rcgen can't mint RSA keys on its own (its built-in keygen only
            // covers the curves it can sign with directly); generate with
            // the `rsa` crate off the OS CSPRNG and hand the PKCS#8 DER to
            // rcgen so it knows to sign with PKCS_RSA_SHA256.
            let private_key =
                RsaPrivateKey::new(&mut OsRng, 2048).context("failed to generate RSA key pair")?;
            let der = private_key
                .to_pkcs8_der()
                .context("failed to encode RSA key as PKCS#8")?;
            KeyPair::from_der(der.as_bytes())
                .context("failed to build rcgen key pair from RSA DER")
        }
    }
}

fn root_ca_params() -> anyhow::Result<CertificateParams> {
    let hostname = gethostname::gethostname().to_string_lossy().to_string();
    let now = OffsetDateTime::now_utc();
    let common_name = format!("GoSniffer CA ({hostname})");

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, "GoSniffer");

    let mut params = CertificateParams::default();
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.serial_number = Some(random_serial());
    params.not_before = now.checked_sub(Duration::hours(1)).unwrap_or(now);
    params.not_after = now
        .checked_add(Duration::days(365 * 10))
        .ok_or_else(|| anyhow!("CA validity period overflowed"))?;

    Ok(params)
}

/// A cryptographically random 128-bit serial number.
pub fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    SerialNumber::from_slice(&bytes)
}

fn detect_algorithm(der: &CertificateDer<'static>) -> anyhow::Result<KeyAlgorithm> {
    let (_, cert) =
        X509Certificate::from_der(der).map_err(|e| ProxyError::CaIo(format!("invalid CA DER: {e}")))?;
    match cert.public_key().parsed() {
        Ok(PublicKey::RSA(_)) => Ok(KeyAlgorithm::Rsa2048),
        Ok(PublicKey::EC(_)) => Ok(KeyAlgorithm::EcdsaP256),
        _ => Err(ProxyError::KeyStrength("unsupported CA key algorithm".into()).into()),
    }
}

/// Validates that the certificate's public key meets the minimum strength:
/// RSA >=2048 bits, or ECDSA on the P-256 curve.
pub fn validate_key_strength(der: &CertificateDer<'static>, algorithm: KeyAlgorithm) -> anyhow::Result<()> {
    let (_, cert) =
        X509Certificate::from_der(der).map_err(|e| ProxyError::CaIo(format!("invalid CA DER: {e}")))?;
    let spki = cert.public_key();

    match (algorithm, spki.parsed()) {
        (KeyAlgorithm::Rsa2048, Ok(PublicKey::RSA(rsa_key))) => {
            let bits = rsa_modulus_bits(rsa_key.modulus);
            if bits < 2048 {
                return Err(
                    ProxyError::KeyStrength(format!("RSA modulus is only {bits} bits, need >=2048")).into(),
                );
            }
            Ok(())
        }
        (KeyAlgorithm::EcdsaP256, Ok(PublicKey::EC(_))) => {
            let oid = spki
                .algorithm
                .parameters
                .as_ref()
                .and_then(|p| p.as_oid().ok())
                .map(|oid| oid.to_id_string());
            match oid.as_deref() {
                Some(NIST_P256_OID) => Ok(()),
                _ => Err(ProxyError::KeyStrength("ECDSA curve is not P-256".into()).into()),
            }
        }
        _ => Err(ProxyError::KeyStrength("certificate key does not match expected algorithm".into()).into()),
    }
}

const NIST_P256_OID: &str = "1.2.840.10045.3.1.7";

fn rsa_modulus_bits(modulus: &[u8]) -> usize {
    let trimmed = modulus.iter().skip_while(|&&b| b == 0).collect::<Vec<_>>();
    if trimmed.is_empty() {
        return 0;
    }
    let leading = trimmed[0].leading_zeros() as usize;
    trimmed.len() * 8 - leading
}

fn set_mode(path: &Path, mode: u32) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .map_err(|e| ProxyError::CaIo(format!("setting mode on {}: {e}", path.display())))?;
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn generates_ecdsa_ca_with_expected_properties() {
        let ca = RootCa::generate(KeyAlgorithm::EcdsaP256).unwrap();
        assert_eq!(ca.algorithm, KeyAlgorithm::EcdsaP256);
        assert!(!ca.cert_pem.is_empty());
        validate_key_strength(ca.der(), KeyAlgorithm::EcdsaP256).unwrap();
    }

    #[test]
    fn generates_rsa_ca_with_expected_properties() {
        let ca = RootCa::generate(KeyAlgorithm::Rsa2048).unwrap();
        assert_eq!(ca.algorithm, KeyAlgorithm::Rsa2048);
        validate_key_strength(ca.der(), KeyAlgorithm::Rsa2048).unwrap();
    }

    #[test]
    fn round_trip_through_pem_preserves_fingerprint() {
        let dir = tempdir().unwrap();
        let cert_path = dir.path().join("ca-cert.pem");
        let key_path = dir.path().join("ca-key.pem");

        let original = RootCa::generate(KeyAlgorithm::EcdsaP256).unwrap();
        original.save(&cert_path, &key_path).unwrap();
        let original_fingerprint = original.fingerprint();

        let loaded = RootCa::load(&cert_path, &key_path).unwrap();
        assert_eq!(loaded.fingerprint(), original_fingerprint);
    }

    #[test]
    fn load_or_generate_reuses_existing_files() {
        let dir = tempdir().unwrap();
        let cert_path = dir.path().join("ca-cert.pem");
        let key_path = dir.path().join("ca-key.pem");

        let first = RootCa::load_or_generate(&cert_path, &key_path, KeyAlgorithm::Rsa2048).unwrap();
        let second = RootCa::load_or_generate(&cert_path, &key_path, KeyAlgorithm::Rsa2048).unwrap();
        assert_eq!(first.fingerprint(), second.fingerprint());
    }

    #[cfg(unix)]
    #[test]
    fn save_sets_expected_file_modes() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let cert_path = dir.path().join("ca-cert.pem");
        let key_path = dir.path().join("ca-key.pem");
        let ca = RootCa::generate(KeyAlgorithm::EcdsaP256).unwrap();
        ca.save(&cert_path, &key_path).unwrap();

        let cert_mode = fs::metadata(&cert_path).unwrap().permissions().mode() & 0o777;
        let key_mode = fs::metadata(&key_path).unwrap().permissions().mode() & 0o777;
        assert_eq!(cert_mode, 0o644);
        assert_eq!(key_mode, 0o600);
    }
}
