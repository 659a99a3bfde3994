//! Client pairing: the persisted named-cert store with per-client
//! permissions, and the PIN/OTP engine that admits new clients.

pub mod engine;
pub mod store;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

pub use engine::{PairingEngine, PendingPair};
pub use store::NamedCertStore;

bitflags! {
    /// Per-client permission bitfield. The stored value is the raw bits so
    /// existing pairing files keep parsing.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Perm: u32 {
        const INPUT                  = 1 << 0;
        const CLIPBOARD              = 1 << 1;
        const FILE_TRANSFER          = 1 << 2;
        const VIEW_APPS              = 1 << 3;
        const LAUNCH                 = 1 << 4;
        const SERVER_CMD             = 1 << 5;
        const VIEW_CLIENT_LIST       = 1 << 6;
        const CHANGE_CLIENT_SETTINGS = 1 << 7;
        const ALL                    = 0xff;
    }
}

impl Default for Perm {
    fn default() -> Self {
        Perm::ALL
    }
}

// Persisted as the raw bits for compatibility with existing pairing files
impl Serialize for Perm {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.bits())
    }
}

impl<'de> Deserialize<'de> for Perm {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bits = u32::deserialize(deserializer)?;
        Ok(Perm::from_bits_truncate(bits))
    }
}

impl Perm {
    /// Human-readable permission names for the clients API.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.contains(Perm::INPUT) {
            names.push("input");
        }
        if self.contains(Perm::CLIPBOARD) {
            names.push("clipboard");
        }
        if self.contains(Perm::FILE_TRANSFER) {
            names.push("file_transfer");
        }
        if self.contains(Perm::VIEW_APPS) {
            names.push("view_apps");
        }
        if self.contains(Perm::LAUNCH) {
            names.push("launch");
        }
        if self.contains(Perm::SERVER_CMD) {
            names.push("server_cmd");
        }
        if self.contains(Perm::VIEW_CLIENT_LIST) {
            names.push("view_client_list");
        }
        if self.contains(Perm::CHANGE_CLIENT_SETTINGS) {
            names.push("change_client_settings");
        }
        names
    }
}

/// One paired client. The certificate PEM is the identity; everything else
/// is per-client session shaping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PairedClient {
    pub uuid: String,
    pub name: String,
    pub cert_pem: String,
    pub perm: Perm,
    pub display_mode: String,
    pub output_name_override: String,
    pub always_use_virtual_display: bool,
    pub virtual_display_mode: String,
    pub virtual_display_layout: String,
    pub prefer_10bit_sdr: bool,
    pub enable_legacy_ordering: bool,
    pub allow_client_commands: bool,
    /// HDR color-profile filename applied while this client streams
    pub hdr_profile: String,
    pub config_overrides: std::collections::BTreeMap<String, String>,
    pub do_cmds: Vec<String>,
    pub undo_cmds: Vec<String>,
}

impl Default for PairedClient {
    fn default() -> Self {
        Self {
            uuid: String::new(),
            name: String::new(),
            cert_pem: String::new(),
            perm: Perm::ALL,
            display_mode: String::new(),
            output_name_override: String::new(),
            always_use_virtual_display: false,
            virtual_display_mode: String::new(),
            virtual_display_layout: String::new(),
            prefer_10bit_sdr: false,
            enable_legacy_ordering: false,
            allow_client_commands: false,
            hdr_profile: String::new(),
            config_overrides: Default::default(),
            do_cmds: Vec::new(),
            undo_cmds: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perm_all_covers_every_flag() {
        assert!(Perm::ALL.contains(Perm::INPUT | Perm::CHANGE_CLIENT_SETTINGS));
        assert_eq!(Perm::ALL.names().len(), 8);
    }

    #[test]
    fn perm_serializes_as_raw_bits() {
        let json = serde_json::to_string(&(Perm::INPUT | Perm::LAUNCH)).unwrap();
        assert_eq!(json, "17");
        let back: Perm = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Perm::INPUT | Perm::LAUNCH);
    }

    #[test]
    fn paired_client_tolerates_missing_fields() {
        let client: PairedClient =
            serde_json::from_str(r#"{"uuid":"u","name":"pc","cert_pem":"x"}"#).unwrap();
        assert_eq!(client.perm, Perm::ALL);
        assert!(client.config_overrides.is_empty());
    }
}
