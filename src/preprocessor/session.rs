//! Per-connection routing context

use std::collections::HashMap;

use uuid::Uuid;

use crate::protocol::KeyType;

/// Where an open key handle lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyBinding {
    pub device: usize,
    pub device_key: Uuid,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub handle: u32,
    pub from_untrusted: bool,
    /// Pinned device; `None` lets the router choose
    pub device_override: Option<usize>,
    pub cache_generated_keys: bool,
    /// Open and match take device-local identifiers instead of master ids
    pub incoming_device_uuids: bool,
    pub exportable_private_keys: bool,
    /// hash handle → device
    pub hash_bindings: HashMap<u32, usize>,
    /// key handle → device and device key
    pub key_bindings: HashMap<u32, KeyBinding>,
    /// Type of the last key this session generated
    pub last_key_type: KeyType,
    /// Device of the last key-bearing call
    pub last_key_device: Option<usize>,
}

impl Session {
    pub fn new(handle: u32, from_untrusted: bool, exportable_private_keys: bool) -> Self {
        Self {
            handle,
            from_untrusted,
            device_override: None,
            cache_generated_keys: true,
            incoming_device_uuids: false,
            exportable_private_keys,
            hash_bindings: HashMap::new(),
            key_bindings: HashMap::new(),
            last_key_type: KeyType::None,
            last_key_device: None,
        }
    }
}
