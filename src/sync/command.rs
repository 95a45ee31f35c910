//! Synchronizer commands, results and the key transfer bundle

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::KeyType;
use crate::types::secret::base64_bytes;
use crate::types::SecretBytes;

/// Background job; processed strictly in submission order
#[derive(Debug, Clone)]
pub enum SyncCommand {
    /// Log the synchronizer in to every device as the wheel user
    Initialize { pin: SecretBytes },
    /// Rebuild the cache from devices `from..to`
    BuildCache { from: usize, to: usize },
    /// Copy keys missing on `dest` from `src`; `max_keys` 0 means no limit
    OneWayCopy {
        src: usize,
        dest: usize,
        max_keys: usize,
    },
    /// Two one-way copies, `a` to `b` first
    TwoWayCopy { a: usize, b: usize, max_keys: usize },
    /// Find or create a KEKEK on `dest` for a remote export
    RemoteSetup { dest: usize },
    /// Export every exportable key on `src` wrapped under `kekek`
    RemoteExport { src: usize, kekek: KekekInfo },
    /// Import a bundle produced by a remote export
    RemoteImport { dest: usize, bundle: ExportBundle },
}

impl SyncCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Initialize { .. } => "initialize",
            Self::BuildCache { .. } => "build-cache",
            Self::OneWayCopy { .. } => "one-way-copy",
            Self::TwoWayCopy { .. } => "two-way-copy",
            Self::RemoteSetup { .. } => "remote-setup",
            Self::RemoteExport { .. } => "remote-export",
            Self::RemoteImport { .. } => "remote-import",
        }
    }
}

/// Public half of a key-encryption-key-encryption-key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KekekInfo {
    pub comment: String,
    /// Device-local identity on the importing device
    pub kekek_uuid: Uuid,
    /// SubjectPublicKeyInfo DER
    #[serde(with = "base64_bytes")]
    pub kekek_pubkey: Vec<u8>,
}

/// One key inside an [`ExportBundle`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedKey {
    pub comment: String,
    /// Device-local identity on the exporting device
    pub uuid: Uuid,
    /// Logical identity on the exporting appliance
    pub master_id: Uuid,
    pub key_type: KeyType,
    pub flags: u32,
    /// Wrapped private key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pkcs8: Option<SecretBytes>,
    /// Key-encryption key, wrapped to the KEKEK
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kek: Option<SecretBytes>,
    /// Public key DER
    #[serde(default, skip_serializing_if = "Option::is_none", with = "optional_base64")]
    pub spki: Option<Vec<u8>>,
}

/// Keys exported from one device, ready for import elsewhere
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportBundle {
    pub comment: String,
    pub kekek: KekekInfo,
    pub keys: Vec<ExportedKey>,
    pub exported_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum SyncResult {
    Message(String),
    Kekek(KekekInfo),
    Exported(ExportBundle),
    Failed(String),
}

impl SyncResult {
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }
}

/// Completion notice for one command
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub command: SyncCommand,
    pub result: SyncResult,
    pub finished_at: DateTime<Utc>,
}

mod optional_base64 {
    use base64::{engine::general_purpose, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_str(&general_purpose::STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(text) => general_purpose::STANDARD
                .decode(text.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundle_json_omits_absent_fields() {
        let bundle = ExportBundle {
            comment: "test".into(),
            kekek: KekekInfo {
                comment: "KEKEK public key".into(),
                kekek_uuid: Uuid::new_v4(),
                kekek_pubkey: vec![0x30, 0x82],
            },
            keys: vec![ExportedKey {
                comment: "Public key".into(),
                uuid: Uuid::new_v4(),
                master_id: Uuid::new_v4(),
                key_type: KeyType::EcPublic,
                flags: 0x10,
                pkcs8: None,
                kek: None,
                spki: Some(vec![1, 2, 3]),
            }],
            exported_at: Utc::now(),
        };

        let json = serde_json::to_value(&bundle).unwrap();
        let key = &json["keys"][0];
        assert_eq!(key["spki"], "AQID");
        assert!(key.get("pkcs8").is_none());
        assert_eq!(json["kekek"]["kekek_pubkey"], "MII=");

        let back: ExportBundle = serde_json::from_value(json).unwrap();
        assert_eq!(back, bundle);
    }
}
