//! Appliance settings consulted on the request path
//!
//! Values are seeded from the command line and may be flipped at runtime by
//! the operator console, so every field is individually synchronized.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use serde::Serialize;

#[derive(Debug, Default)]
pub struct Settings {
    masterkey_set: AtomicBool,
    exportable_private_keys: AtomicBool,
    key_export: AtomicBool,
    advertised_ip: RwLock<String>,
}

/// Point-in-time copy of [`Settings`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SettingsSnapshot {
    pub masterkey_set: bool,
    pub exportable_private_keys: bool,
    pub key_export: bool,
    pub advertised_ip: String,
}

impl Settings {
    pub fn new(
        masterkey_set: bool,
        exportable_private_keys: bool,
        key_export: bool,
        advertised_ip: impl Into<String>,
    ) -> Self {
        Self {
            masterkey_set: AtomicBool::new(masterkey_set),
            exportable_private_keys: AtomicBool::new(exportable_private_keys),
            key_export: AtomicBool::new(key_export),
            advertised_ip: RwLock::new(advertised_ip.into()),
        }
    }

    pub fn masterkey_set(&self) -> bool {
        self.masterkey_set.load(Ordering::Acquire)
    }

    pub fn set_masterkey_set(&self, value: bool) {
        self.masterkey_set.store(value, Ordering::Release);
    }

    /// Whether generated private keys get the EXPORTABLE flag by default
    pub fn exportable_private_keys(&self) -> bool {
        self.exportable_private_keys.load(Ordering::Acquire)
    }

    pub fn set_exportable_private_keys(&self, value: bool) {
        self.exportable_private_keys.store(value, Ordering::Release);
    }

    /// Whether network clients may call PKEY_EXPORT
    pub fn key_export(&self) -> bool {
        self.key_export.load(Ordering::Acquire)
    }

    pub fn set_key_export(&self, value: bool) {
        self.key_export.store(value, Ordering::Release);
    }

    pub fn advertised_ip(&self) -> String {
        match self.advertised_ip.read() {
            Ok(ip) => ip.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn set_advertised_ip(&self, ip: impl Into<String>) {
        if let Ok(mut current) = self.advertised_ip.write() {
            *current = ip.into();
        }
    }

    pub fn snapshot(&self) -> SettingsSnapshot {
        SettingsSnapshot {
            masterkey_set: self.masterkey_set(),
            exportable_private_keys: self.exportable_private_keys(),
            key_export: self.key_export(),
            advertised_ip: self.advertised_ip(),
        }
    }
}
