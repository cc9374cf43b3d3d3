//! Leaf (end-entity) certificate minting for MITM interception.

use std::net::IpAddr;

use anyhow::Context;
use rcgen::{
    Certificate, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use time::{Duration, OffsetDateTime};

use crate::cert::ca::{fingerprint_der, generate_key_pair, random_serial, RootCa};
use crate::error::ProxyError;
use crate::logger;

/// A freshly minted leaf certificate and its matching private key, ready to
/// hand to `rustls` for the client-facing handshake.
pub struct LeafBundle {
    pub cert_der: CertificateDer<'static>,
    pub key_der: PrivateKeyDer<'static>,
    pub chain: Vec<CertificateDer<'static>>,
}

/// Mints a leaf certificate for `hostname`, signed by `root_ca`.
///
/// Validity is 90 days; the subject alternative name is a
/// DNS name unless `hostname` parses as a literal IP address, in which case
/// it's carried as an IP SAN instead. Every mint is logged with the new
/// certificate's fingerprint.
pub fn mint(root_ca: &RootCa, hostname: &str) -> anyhow::Result<LeafBundle> {
    // Same algorithm family as the CA key.
    let key_pair = generate_key_pair(root_ca.algorithm)
        .context("failed to generate leaf key pair")?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, hostname);

    let mut params = CertificateParams::new(vec![hostname.to_string()])
        .map_err(|e| ProxyError::CertGeneration {
            host: hostname.to_string(),
            source: anyhow::anyhow!(e),
        })?;
    params.distinguished_name = dn;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.serial_number = Some(random_serial());

    let now = OffsetDateTime::now_utc();
    params.not_before = now.checked_sub(Duration::hours(1)).unwrap_or(now);
    params.not_after = now
        .checked_add(Duration::days(90))
        .ok_or_else(|| ProxyError::CertGeneration {
            host: hostname.to_string(),
            source: anyhow::anyhow!("leaf validity period overflowed"),
        })?;

    if let Ok(ip) = hostname.parse::<IpAddr>() {
        params.subject_alt_names = vec![SanType::IpAddress(ip)];
    }

    let cert: Certificate = params
        .signed_by(&key_pair, root_ca.cert(), root_ca.key_pair())
        .map_err(|e| ProxyError::CertGeneration {
            host: hostname.to_string(),
            source: anyhow::anyhow!(e),
        })?;

    let cert_der = cert.der().clone();
    let fingerprint = fingerprint_der(&cert_der);
    logger::cert(hostname, &fingerprint);

    let key_der = PrivateKeyDer::Pkcs8(key_pair.serialize_der().into());

    Ok(LeafBundle {
        cert_der: cert_der.clone(),
        key_der,
        chain: vec![cert_der, root_ca.der().clone()],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::ca::{validate_key_strength, KeyAlgorithm};

    #[test]
    fn mints_leaf_for_dns_hostname() {
        let ca = RootCa::generate(KeyAlgorithm::EcdsaP256).unwrap();
        let bundle = mint(&ca, "example.com").unwrap();
        assert_eq!(bundle.chain.len(), 2);
        validate_key_strength(&bundle.chain[1], KeyAlgorithm::EcdsaP256).unwrap();
    }

    #[test]
    fn mints_leaf_for_ip_literal() {
        let ca = RootCa::generate(KeyAlgorithm::EcdsaP256).unwrap();
        let bundle = mint(&ca, "127.0.0.1").unwrap();
        assert_eq!(bundle.chain.len(), 2);
    }

    #[test]
    fn each_mint_gets_a_distinct_serial() {
        let ca = RootCa::generate(KeyAlgorithm::EcdsaP256).unwrap();
        let a = mint(&ca, "example.com").unwrap();
        let b = mint(&ca, "example.com").unwrap();
        assert_ne!(a.cert_der, b.cert_der);
    }

    #[test]
    fn leaf_key_matches_rsa_ca_algorithm_family() {
        let ca = RootCa::generate(KeyAlgorithm::Rsa2048).unwrap();
        let bundle = mint(&ca, "example.com").unwrap();
        validate_key_strength(&bundle.cert_der, KeyAlgorithm::Rsa2048).unwrap();
    }
}
