//! kieop pki: self-signed certificates packed into password-protected Java
//! keystores, the format the application images expect at `keystore.jks`.
//!
//! The keystore holds a single private-key entry: the PKCS#8 key protected
//! with the JKS key protector and a one-certificate chain. The file ends with
//! the keyed SHA-1 integrity digest Java tooling checks on load.

#![forbid(unsafe_code)]

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use sha1::{Digest, Sha1};
use thiserror::Error;
use tracing::debug;

mod jks;

pub use jks::{inspect, KeystoreEntry, KeystoreSummary};

#[derive(Debug, Error)]
pub enum PkiError {
    #[error("certificate generation failed: {0}")]
    Certificate(String),
    #[error("key generation failed: {0}")]
    Key(String),
    #[error("{0} too long for keystore encoding")]
    TooLong(&'static str),
    #[error("malformed keystore: {0}")]
    Malformed(String),
    #[error("keystore integrity check failed")]
    Integrity,
}

pub type Result<T> = std::result::Result<T, PkiError>;

/// A generated key pair and its self-signed certificate, both DER encoded.
pub struct SelfSigned {
    pub key_pkcs8: Vec<u8>,
    pub cert_der: Vec<u8>,
}

pub fn self_signed(common_name: &str) -> Result<SelfSigned> {
    let mut params = CertificateParams::new(vec![common_name.to_string()])
        .map_err(|e| PkiError::Certificate(format!("invalid name {}: {}", common_name, e)))?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;

    let key_pair = KeyPair::generate().map_err(|e| PkiError::Key(e.to_string()))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| PkiError::Certificate(format!("self-signing {}: {}", common_name, e)))?;
    Ok(SelfSigned { key_pkcs8: key_pair.serialize_der(), cert_der: cert.der().to_vec() })
}

/// Keystore bytes with one entry under `alias` for a fresh certificate
/// issued to `common_name`, protected by `password`.
pub fn generate_keystore(common_name: &str, alias: &str, password: &str) -> Result<Vec<u8>> {
    let material = self_signed(common_name)?;
    let now_ms = chrono::Utc::now().timestamp_millis().max(0) as u64;
    let entry = KeystoreEntry {
        alias: alias.to_string(),
        created_ms: now_ms,
        key_pkcs8: material.key_pkcs8,
        chain: vec![material.cert_der],
    };
    let bytes = jks::encode(&[entry], password, &rand::random())?;
    debug!(cn = %common_name, %alias, len = bytes.len(), "keystore generated");
    Ok(bytes)
}

/// Java `char[]` password as the big-endian UTF-16 bytes the JKS digests use.
fn password_bytes(password: &str) -> Vec<u8> {
    password.encode_utf16().flat_map(|u| u.to_be_bytes()).collect()
}

fn sha1(parts: &[&[u8]]) -> [u8; 20] {
    let mut h = Sha1::new();
    for p in parts {
        h.update(p);
    }
    h.finalize().into()
}
