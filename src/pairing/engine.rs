use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::Mutex;

use super::{NamedCertStore, PairedClient};
use crate::crypto;
use crate::error::{AppError, Result};

/// One-time-password validity window.
const OTP_TTL: Duration = Duration::from_secs(4 * 60);

/// A pairing attempt parked between the wire handshake and the user
/// entering the PIN in the web UI.
#[derive(Debug, Clone)]
pub struct PendingPair {
    pub client_cert_pem: String,
    pub salt: [u8; 16],
    /// Challenge sealed with the PIN-derived key; the transport side
    /// produced it, `submit_pin` proves the PIN by opening it.
    pub sealed_challenge: Vec<u8>,
    pub started_at: Instant,
}

struct IssuedOtp {
    hash: String,
    device_name: String,
    issued_at: Instant,
}

/// PIN/OTP pairing engine. The Moonlight handshake itself is driven by the
/// wire transport; this owns the host-side state between "client knocked"
/// and "user confirmed".
pub struct PairingEngine {
    store: NamedCertStore,
    pending: Mutex<Option<PendingPair>>,
    otp: Mutex<Option<IssuedOtp>>,
}

impl PairingEngine {
    pub fn new(store: NamedCertStore) -> Self {
        Self {
            store,
            pending: Mutex::new(None),
            otp: Mutex::new(None),
        }
    }

    /// Park a pairing attempt started by the wire transport. A new attempt
    /// replaces any stale one.
    pub async fn register_pending(&self, pending: PendingPair) {
        let mut slot = self.pending.lock().await;
        *slot = Some(pending);
    }

    pub async fn has_pending(&self) -> bool {
        self.pending.lock().await.is_some()
    }

    /// Complete pairing with the PIN the user typed. Proves the PIN by
    /// opening the transport's sealed challenge, then persists the client.
    pub async fn submit_pin(&self, pin: &str, device_name: &str) -> Result<PairedClient> {
        let pending = {
            let mut slot = self.pending.lock().await;
            slot.take()
                .ok_or_else(|| AppError::Pairing("no pairing in progress".to_string()))?
        };

        let key = crypto::pairing_key(&pending.salt, pin);
        if crypto::decrypt_payload(&key, &pending.sealed_challenge).is_err() {
            // Put the attempt back so a typo does not abort the handshake
            let mut slot = self.pending.lock().await;
            *slot = Some(pending);
            return Err(AppError::Pairing("incorrect PIN".to_string()));
        }

        let client = PairedClient {
            name: device_name.to_string(),
            cert_pem: pending.client_cert_pem,
            ..Default::default()
        };
        self.store.add(client).await
    }

    /// Issue a one-time pairing code: 4-minute window, single use, stored
    /// hashed.
    pub async fn issue_otp(&self, device_name: &str) -> (String, u64) {
        let code: u32 = rand::thread_rng().gen_range(0..10_000);
        let otp = format!("{:04}", code);

        let mut slot = self.otp.lock().await;
        *slot = Some(IssuedOtp {
            hash: crypto::sha256_hex(otp.as_bytes()),
            device_name: device_name.to_string(),
            issued_at: Instant::now(),
        });

        (otp, OTP_TTL.as_secs())
    }

    /// Redeem an OTP in place of a PIN. Consumes the code on success and on
    /// expiry; a wrong code leaves it pending.
    pub async fn redeem_otp(&self, code: &str, client_cert_pem: &str) -> Result<PairedClient> {
        let mut slot = self.otp.lock().await;
        let (hash, name, issued_at) = match slot.as_ref() {
            Some(issued) => (
                issued.hash.clone(),
                issued.device_name.clone(),
                issued.issued_at,
            ),
            None => return Err(AppError::Pairing("no one-time code issued".to_string())),
        };

        if issued_at.elapsed() > OTP_TTL {
            *slot = None;
            return Err(AppError::Pairing("one-time code expired".to_string()));
        }
        if hash != crypto::sha256_hex(code.as_bytes()) {
            return Err(AppError::Pairing("incorrect one-time code".to_string()));
        }

        *slot = None;
        drop(slot);

        self.store
            .add(PairedClient {
                name,
                cert_pem: client_cert_pem.to_string(),
                ..Default::default()
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn engine() -> (PairingEngine, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = NamedCertStore::load(&dir.path().join("nc.json"))
            .await
            .unwrap();
        (PairingEngine::new(store), dir)
    }

    fn pending_with_pin(pin: &str) -> PendingPair {
        let salt = [3u8; 16];
        let key = crypto::pairing_key(&salt, pin);
        PendingPair {
            client_cert_pem: "CERT-PEM".to_string(),
            salt,
            sealed_challenge: crypto::encrypt_payload(&key, b"challenge").unwrap(),
            started_at: Instant::now(),
        }
    }

    #[tokio::test]
    async fn correct_pin_pairs_client() {
        let (engine, _dir) = engine().await;
        engine.register_pending(pending_with_pin("4711")).await;

        let client = engine.submit_pin("4711", "couch-pc").await.unwrap();
        assert_eq!(client.name, "couch-pc");
        assert_eq!(client.cert_pem, "CERT-PEM");
        assert!(!engine.has_pending().await);
    }

    #[tokio::test]
    async fn wrong_pin_keeps_attempt_pending() {
        let (engine, _dir) = engine().await;
        engine.register_pending(pending_with_pin("4711")).await;

        assert!(engine.submit_pin("0000", "couch-pc").await.is_err());
        assert!(engine.has_pending().await);
        assert!(engine.submit_pin("4711", "couch-pc").await.is_ok());
    }

    #[tokio::test]
    async fn otp_single_use() {
        let (engine, _dir) = engine().await;
        let (code, ttl) = engine.issue_otp("phone").await;
        assert_eq!(ttl, 240);

        let client = engine.redeem_otp(&code, "CERT-OTP").await.unwrap();
        assert_eq!(client.name, "phone");

        // Consumed on success
        assert!(engine.redeem_otp(&code, "CERT-OTP").await.is_err());
    }
}
