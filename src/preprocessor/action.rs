//! What the router decided to do with a request

use uuid::Uuid;

use crate::protocol::{KeyMatchRequest, KeyType};

/// Outcome of routing one request (or one step of a multi-device request)
#[derive(Debug)]
pub enum Action {
    /// Answer the client without touching a device
    Reply(Vec<u8>),
    /// Send `request` to every device in `targets`, then resume with `then`
    Forward {
        request: Vec<u8>,
        targets: Vec<usize>,
        then: Continuation,
    },
}

impl Action {
    pub fn forward(request: Vec<u8>, device: usize, then: Continuation) -> Self {
        Self::Forward {
            request,
            targets: vec![device],
            then,
        }
    }
}

/// Next step once the forwarded replies are in
#[derive(Debug)]
pub enum Continuation {
    /// Single reply goes back unchanged
    PassThrough,
    /// Replies from every device must agree
    AllDevices,
    /// Record the new hash handle against `device`
    StartHash { device: usize },
    /// Drop the hash binding once finalize is answered
    EndHash { hash_handle: u32 },
    /// Record the opened key handle
    OpenKey { device: usize, device_key: Uuid },
    /// Bind, cache and rewrite the reply of a key-creating call
    CreateKey {
        device: usize,
        key_type: KeyType,
        flags: u32,
    },
    /// Release a key handle, unlinking the key from the cache on delete
    CloseKey {
        key_handle: u32,
        device: usize,
        device_key: Uuid,
        delete: bool,
    },
    /// One device's page of a key search
    Match(MatchProgress),
}

/// State carried between the per-device legs of a PKEY_MATCH
#[derive(Debug)]
pub struct MatchProgress {
    pub request: KeyMatchRequest,
    pub device: usize,
    /// The client's result_max; `request.result_max` is what this leg asked for
    pub wanted: u32,
    /// Master identities collected so far
    pub found: Vec<Uuid>,
}
