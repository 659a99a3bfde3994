//! Host identity and pairing crypto: the x509 pair that backs both the
//! HTTPS listener and client pairing, SHA-256 helpers, and the AES-GCM
//! wrapping used for pairing handshake payloads.

use std::path::Path;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{AppError, Result};
use crate::utils::atomic_replace;

/// The server certificate/key pair. The certificate doubles as the pairing
/// identity handed to Moonlight clients.
#[derive(Clone)]
pub struct HostIdentity {
    cert_pem: String,
    key_pem: String,
    cert_der: Vec<u8>,
}

impl HostIdentity {
    /// Load the PEM pair from disk, generating a self-signed pair on first
    /// run. Generated files are persisted so the identity is stable across
    /// restarts (clients pin it).
    pub async fn load_or_generate(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let (cert_pem, key_pem) = if cert_path.exists() && key_path.exists() {
            (
                tokio::fs::read_to_string(cert_path).await?,
                tokio::fs::read_to_string(key_path).await?,
            )
        } else {
            tracing::info!("Generating new host certificate at {}", cert_path.display());
            let mut params = rcgen::CertificateParams::new(vec!["localhost".to_string()])
                .map_err(|e| AppError::Internal(format!("certificate params: {e}")))?;
            params
                .distinguished_name
                .push(rcgen::DnType::CommonName, "Vibeshine Gamestream Host");
            let key = rcgen::KeyPair::generate()
                .map_err(|e| AppError::Internal(format!("key generation: {e}")))?;
            let cert = params
                .self_signed(&key)
                .map_err(|e| AppError::Internal(format!("certificate generation: {e}")))?;

            let cert_pem = cert.pem();
            let key_pem = key.serialize_pem();
            atomic_replace(cert_path, cert_pem.as_bytes()).await?;
            atomic_replace(key_path, key_pem.as_bytes()).await?;
            (cert_pem, key_pem)
        };

        let cert_der = pem_to_der(&cert_pem)?;
        Ok(Self {
            cert_pem,
            key_pem,
            cert_der,
        })
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    /// SHA-256 over the certificate DER, uppercase colon-separated hex.
    /// This is what WebRTC session creation hands to clients.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(&self.cert_der);
        digest
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(":")
    }
}

/// Extract the first certificate DER from a PEM string.
pub fn pem_to_der(pem: &str) -> Result<Vec<u8>> {
    let mut reader = std::io::BufReader::new(pem.as_bytes());
    for item in rustls_pemfile::certs(&mut reader) {
        let cert = item.map_err(|e| AppError::Parse(format!("invalid PEM: {e}")))?;
        return Ok(cert.to_vec());
    }
    Err(AppError::Parse("no certificate in PEM input".to_string()))
}

/// Hex-encoded SHA-256.
pub fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Derive the AES-128 pairing key: `sha256(salt || pin)` truncated.
pub fn pairing_key(salt: &[u8], pin: &str) -> [u8; 16] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(pin.as_bytes());
    let digest = hasher.finalize();
    let mut key = [0u8; 16];
    key.copy_from_slice(&digest[..16]);
    key
}

/// AES-128-GCM encrypt: output is `nonce(12) || ciphertext+tag`.
pub fn encrypt_payload(key: &[u8; 16], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes128Gcm::new(key.into());
    let mut nonce = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| AppError::Pairing("payload encryption failed".to_string()))?;

    let mut out = Vec::with_capacity(12 + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Inverse of [`encrypt_payload`]. Authentication failure is a pairing
/// error (wrong PIN), not an internal one.
pub fn decrypt_payload(key: &[u8; 16], data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < 12 {
        return Err(AppError::Pairing("payload too short".to_string()));
    }
    let (nonce, ciphertext) = data.split_at(12);
    let cipher = Aes128Gcm::new(key.into());
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| AppError::Pairing("payload authentication failed".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn identity_is_stable_across_loads() {
        let dir = tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("pkey.pem");

        let first = HostIdentity::load_or_generate(&cert, &key).await.unwrap();
        let second = HostIdentity::load_or_generate(&cert, &key).await.unwrap();
        assert_eq!(first.fingerprint(), second.fingerprint());
        assert_eq!(first.cert_pem(), second.cert_pem());
    }

    #[tokio::test]
    async fn fingerprint_format() {
        let dir = tempdir().unwrap();
        let identity = HostIdentity::load_or_generate(
            &dir.path().join("cert.pem"),
            &dir.path().join("pkey.pem"),
        )
        .await
        .unwrap();

        let fp = identity.fingerprint();
        // 32 bytes -> 32 hex pairs joined by colons
        assert_eq!(fp.len(), 32 * 2 + 31);
        assert!(fp
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase() || c == ':'));
    }

    #[test]
    fn payload_round_trip_and_wrong_pin() {
        let salt = [7u8; 16];
        let key = pairing_key(&salt, "1234");
        let sealed = encrypt_payload(&key, b"client hello").unwrap();
        assert_eq!(&decrypt_payload(&key, &sealed).unwrap(), b"client hello");

        let wrong = pairing_key(&salt, "4321");
        assert!(decrypt_payload(&wrong, &sealed).is_err());
    }

    #[test]
    fn pairing_key_is_deterministic() {
        let salt = b"0123456789abcdef";
        assert_eq!(pairing_key(salt, "0000"), pairing_key(salt, "0000"));
        assert_ne!(pairing_key(salt, "0000"), pairing_key(salt, "0001"));
    }
}
