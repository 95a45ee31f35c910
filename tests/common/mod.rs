//! In-memory alpha device for integration tests
//!
//! `FakeHsm` answers the HAL RPC subset the gateway and the synchronizer
//! use, keeps a real keystore (ordered by uuid, like the device), and counts
//! every call by function code so tests can assert which device was asked.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::ops::Bound;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use hsm_gateway::cache::KeyCache;
use hsm_gateway::device::{DeviceSession, DeviceTransport, TransportConnector};
use hsm_gateway::protocol::packets::{error_reply, keygen_result, ok_reply_writer, PacketHeader};
use hsm_gateway::protocol::{key_flags, HalError, KeyMatchReply, KeyMatchRequest, KeyType, RpcFunc, XdrReader, XdrWriter};
use hsm_gateway::settings::Settings;
use hsm_gateway::types::{HsmError, Result};
use hsm_gateway::RpcPreprocessor;

pub const EXCHANGE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy)]
struct FakeKey {
    key_type: KeyType,
    flags: u32,
}

#[derive(Default)]
struct Model {
    index: usize,
    keys: BTreeMap<Uuid, FakeKey>,
    open: HashMap<u32, Uuid>,
    hashes: HashSet<u32>,
    next_handle: u32,
    calls: HashMap<u32, usize>,
    forced: HashMap<u32, HalError>,
    connects: usize,
    refuse_connect: bool,
}

/// Marker DER: SEQUENCE tag, key type, then the key's uuid
fn key_blob(key_type: KeyType, uuid: &Uuid) -> Vec<u8> {
    let mut blob = vec![0x30, key_type as u8];
    blob.extend_from_slice(uuid.as_bytes());
    blob
}

fn blob_type(blob: &[u8]) -> Option<KeyType> {
    blob.get(1).and_then(|t| KeyType::from_code(*t as u32))
}

impl Model {
    fn allocate_handle(&mut self) -> u32 {
        self.next_handle += 1;
        self.next_handle
    }

    fn create_key(&mut self, key_type: KeyType, flags: u32) -> (u32, Uuid) {
        let uuid = Uuid::new_v4();
        self.keys.insert(uuid, FakeKey { key_type, flags });
        let pkey = self.allocate_handle();
        self.open.insert(pkey, uuid);
        (pkey, uuid)
    }

    fn open_key(&self, pkey: u32) -> std::result::Result<(Uuid, FakeKey), HalError> {
        let uuid = self.open.get(&pkey).ok_or(HalError::KeyNotFound)?;
        let key = self.keys.get(uuid).ok_or(HalError::KeyNotFound)?;
        Ok((*uuid, *key))
    }

    fn handle(&mut self, request: &[u8]) -> Vec<u8> {
        let header = match PacketHeader::parse(request) {
            Ok(header) => header,
            Err(_) => return error_reply(0, 0, HalError::RpcProtocolError.code()),
        };
        *self.calls.entry(header.code).or_default() += 1;

        if let Some(status) = self.forced.get(&header.code) {
            return error_reply(header.code, header.handle, status.code());
        }

        match self.dispatch(header, request) {
            Ok(reply) => reply,
            Err(status) => error_reply(header.code, header.handle, status.code()),
        }
    }

    fn dispatch(&mut self, header: PacketHeader, request: &[u8]) -> std::result::Result<Vec<u8>, HalError> {
        let Some(func) = RpcFunc::from_code(header.code) else {
            return Err(HalError::RpcBadFunction);
        };
        let bad = |_: HsmError| HalError::BadArguments;

        let mut r = XdrReader::new(request);
        r.get_u32().map_err(bad)?;
        r.get_u32().map_err(bad)?;
        let mut w = ok_reply_writer(header.code, header.handle);

        use RpcFunc::*;
        match func {
            GetVersion => {
                w.put_u32(0x0100_0000);
            }
            GetRandom => {
                let len = r.get_u32().map_err(bad)?;
                w.put_opaque(&vec![self.index as u8; len as usize]);
            }
            SetPin | Login | Logout | LogoutAll | IsLoggedIn | CheckTamper | PkeyVerify
            | PkeySetAttributes | PkeyGetAttributes => {}
            HashGetDigestLen => {
                w.put_u32(32);
            }
            HashGetDigestAlgorithmId => {
                w.put_opaque(&[0x06, 0x09]);
            }
            HashInitialize => {
                let hash = self.allocate_handle();
                self.hashes.insert(hash);
                w.put_u32(hash);
            }
            HashGetAlgorithm | HashUpdate => {
                let hash = r.get_u32().map_err(bad)?;
                if !self.hashes.contains(&hash) {
                    return Err(HalError::BadArguments);
                }
                if func == HashGetAlgorithm {
                    w.put_u32(3);
                }
            }
            HashFinalize => {
                let hash = r.get_u32().map_err(bad)?;
                if !self.hashes.remove(&hash) {
                    return Err(HalError::BadArguments);
                }
                w.put_opaque(&[0u8; 32]);
            }
            PkeyLoad => {
                r.get_u32().map_err(bad)?;
                let der = r.get_opaque().map_err(bad)?;
                let flags = r.get_u32().map_err(bad)?;
                let key_type = blob_type(der).ok_or(HalError::Asn1ParseFailed)?;
                let (pkey, uuid) = self.create_key(key_type.public_variant(), flags);
                return Ok(keygen_result(header.code, header.handle, 0, pkey, &uuid));
            }
            PkeyOpen => {
                r.get_u32().map_err(bad)?;
                let uuid = Uuid::from_slice(r.get_opaque().map_err(bad)?).map_err(|_| HalError::BadArguments)?;
                if !self.keys.contains_key(&uuid) {
                    return Err(HalError::KeyNotFound);
                }
                let pkey = self.allocate_handle();
                self.open.insert(pkey, uuid);
                w.put_u32(pkey);
            }
            PkeyGenerateRsa | PkeyGenerateEc | PkeyGenerateHashsig => {
                r.get_u32().map_err(bad)?;
                let key_type = match func {
                    PkeyGenerateRsa => {
                        r.get_u32().map_err(bad)?;
                        r.get_opaque().map_err(bad)?;
                        KeyType::RsaPrivate
                    }
                    PkeyGenerateEc => {
                        r.get_u32().map_err(bad)?;
                        KeyType::EcPrivate
                    }
                    _ => {
                        for _ in 0..3 {
                            r.get_u32().map_err(bad)?;
                        }
                        KeyType::HashsigPrivate
                    }
                };
                let flags = r.get_u32().map_err(bad)?;
                let (pkey, uuid) = self.create_key(key_type, flags);
                return Ok(keygen_result(header.code, header.handle, 0, pkey, &uuid));
            }
            PkeyClose => {
                let pkey = r.get_u32().map_err(bad)?;
                self.open.remove(&pkey).ok_or(HalError::KeyNotFound)?;
            }
            PkeyDelete => {
                let pkey = r.get_u32().map_err(bad)?;
                let uuid = self.open.remove(&pkey).ok_or(HalError::KeyNotFound)?;
                self.keys.remove(&uuid);
            }
            PkeyGetKeyType => {
                let (_, key) = self.open_key(r.get_u32().map_err(bad)?)?;
                w.put_u32(key.key_type as u32);
            }
            PkeyGetKeyFlags => {
                let (_, key) = self.open_key(r.get_u32().map_err(bad)?)?;
                w.put_u32(key.flags);
            }
            PkeyGetKeyCurve => {
                self.open_key(r.get_u32().map_err(bad)?)?;
                w.put_u32(0);
            }
            PkeyGetPublicKeyLen => {
                self.open_key(r.get_u32().map_err(bad)?)?;
                w.put_u32(18);
            }
            PkeyGetPublicKey => {
                let (uuid, key) = self.open_key(r.get_u32().map_err(bad)?)?;
                w.put_opaque(&key_blob(key.key_type.public_variant(), &uuid));
            }
            PkeySign => {
                self.open_key(r.get_u32().map_err(bad)?)?;
                w.put_opaque(&[self.index as u8; 8]);
            }
            PkeyMatch => {
                let m = KeyMatchRequest::parse(request).map_err(bad)?;
                let start = if m.previous.is_nil() {
                    Bound::Unbounded
                } else {
                    Bound::Excluded(m.previous)
                };
                let uuids: Vec<Uuid> = self
                    .keys
                    .range((start, Bound::Unbounded))
                    .filter(|(_, key)| m.key_type == 0 || key.key_type as u32 == m.key_type)
                    .filter(|(_, key)| key.flags & m.mask == m.flags & m.mask)
                    .map(|(uuid, _)| *uuid)
                    .take(m.result_max as usize)
                    .collect();
                return Ok(KeyMatchReply::encode(header.code, header.handle, m.state + 1, &uuids, m.result_max));
            }
            PkeyExport => {
                let (uuid, key) = self.open_key(r.get_u32().map_err(bad)?)?;
                self.open_key(r.get_u32().map_err(bad)?)?;
                if key.flags & key_flags::EXPORTABLE == 0 {
                    return Err(HalError::Forbidden);
                }
                w.put_opaque(&key_blob(key.key_type, &uuid))
                    .put_opaque(&[0x4b; 40]);
            }
            PkeyImport => {
                r.get_u32().map_err(bad)?;
                self.open_key(r.get_u32().map_err(bad)?)?;
                let pkcs8 = r.get_opaque().map_err(bad)?;
                r.get_opaque().map_err(bad)?;
                let flags = r.get_u32().map_err(bad)?;
                let key_type = blob_type(pkcs8).ok_or(HalError::Asn1ParseFailed)?;
                let (pkey, uuid) = self.create_key(key_type, flags);
                return Ok(keygen_result(header.code, header.handle, 0, pkey, &uuid));
            }
            GetHsmState | GetIp | SetRpcDevice | DisableCacheKeygen | EnableCacheKeygen
            | UseIncomingDeviceUuids | UseIncomingMasterUuids => {
                return Err(HalError::RpcBadFunction);
            }
        }
        Ok(w.finish())
    }
}

/// Shared handle to one fake device; clones see the same keystore
#[derive(Clone, Default)]
pub struct FakeHsm {
    model: Arc<Mutex<Model>>,
}

impl FakeHsm {
    pub fn new(index: usize) -> Self {
        let fake = Self::default();
        fake.model.lock().unwrap().index = index;
        fake
    }

    /// Put a key straight into the keystore
    pub fn add_key(&self, key_type: KeyType, flags: u32) -> Uuid {
        let mut model = self.model.lock().unwrap();
        let (pkey, uuid) = model.create_key(key_type, flags);
        model.open.remove(&pkey);
        uuid
    }

    /// Put a key into the keystore under a chosen uuid, to control match order
    pub fn insert_key(&self, uuid: Uuid, key_type: KeyType, flags: u32) {
        self.model
            .lock()
            .unwrap()
            .keys
            .insert(uuid, FakeKey { key_type, flags });
    }

    pub fn has_key(&self, uuid: &Uuid) -> bool {
        self.model.lock().unwrap().keys.contains_key(uuid)
    }

    pub fn key_count(&self) -> usize {
        self.model.lock().unwrap().keys.len()
    }

    pub fn key_type(&self, uuid: &Uuid) -> Option<KeyType> {
        self.model.lock().unwrap().keys.get(uuid).map(|k| k.key_type)
    }

    /// Answer every `func` request with `status`
    pub fn fail_with(&self, func: RpcFunc, status: HalError) {
        self.model.lock().unwrap().forced.insert(func.code(), status);
    }

    pub fn refuse_connections(&self) {
        self.model.lock().unwrap().refuse_connect = true;
    }

    pub fn calls(&self, func: RpcFunc) -> usize {
        self.model
            .lock()
            .unwrap()
            .calls
            .get(&func.code())
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.model.lock().unwrap().calls.values().sum()
    }

    pub fn connects(&self) -> usize {
        self.model.lock().unwrap().connects
    }
}

struct FakeLink {
    model: Arc<Mutex<Model>>,
    replies: VecDeque<Vec<u8>>,
}

#[async_trait]
impl DeviceTransport for FakeLink {
    async fn send_frame(&mut self, payload: &[u8]) -> Result<()> {
        let reply = self.model.lock().unwrap().handle(payload);
        self.replies.push_back(reply);
        Ok(())
    }

    async fn recv_frame(&mut self) -> Result<Vec<u8>> {
        self.replies
            .pop_front()
            .ok_or_else(|| HsmError::Transport("fake device has nothing to send".into()))
    }
}

#[async_trait]
impl TransportConnector for FakeHsm {
    async fn connect(&self) -> Result<Box<dyn DeviceTransport>> {
        let mut model = self.model.lock().unwrap();
        model.connects += 1;
        if model.refuse_connect {
            return Err(HsmError::Transport("fake device unplugged".into()));
        }
        Ok(Box::new(FakeLink {
            model: Arc::clone(&self.model),
            replies: VecDeque::new(),
        }))
    }

    fn describe(&self) -> String {
        format!("fake://alpha-{}", self.model.lock().unwrap().index)
    }
}

// =============================================================================
// Gateway fixture
// =============================================================================

pub struct Gateway {
    pub fakes: Vec<FakeHsm>,
    pub devices: Vec<Arc<DeviceSession>>,
    pub cache: Arc<KeyCache>,
    pub settings: Arc<Settings>,
    pub preprocessor: Arc<RpcPreprocessor>,
}

pub fn spawn_devices(fakes: &[FakeHsm]) -> Vec<Arc<DeviceSession>> {
    fakes
        .iter()
        .enumerate()
        .map(|(index, fake)| DeviceSession::spawn(index, Arc::new(fake.clone()), EXCHANGE_TIMEOUT))
        .collect()
}

/// Unlocked gateway with an initialized, empty cache over `count` fake devices
pub fn gateway(count: usize) -> Gateway {
    let fakes: Vec<FakeHsm> = (0..count).map(FakeHsm::new).collect();
    let devices = spawn_devices(&fakes);
    let cache = Arc::new(KeyCache::new(count));
    cache.set_initialized(true);
    let settings = Arc::new(Settings::new(true, false, false, "10.1.2.3"));
    let preprocessor = Arc::new(RpcPreprocessor::new(
        devices.clone(),
        Arc::clone(&cache),
        Arc::clone(&settings),
        2,
    ));
    preprocessor.unlock_hsm();

    Gateway {
        fakes,
        devices,
        cache,
        settings,
        preprocessor,
    }
}

impl Gateway {
    /// Key present on `device` and linked in the cache; returns (device key, master)
    pub fn seed_key(&self, device: usize, key_type: KeyType, flags: u32) -> (Uuid, Uuid) {
        let device_key = self.fakes[device].add_key(key_type, flags);
        let master = self
            .cache
            .link_key(device, device_key, key_type, flags, None)
            .unwrap();
        (device_key, master)
    }

    pub fn total_calls(&self) -> usize {
        self.fakes.iter().map(FakeHsm::total_calls).sum()
    }
}

// =============================================================================
// Client request builders
// =============================================================================

pub fn request(func: RpcFunc, handle: u32, body: impl FnOnce(&mut XdrWriter)) -> Vec<u8> {
    let mut w = XdrWriter::new();
    w.put_u32(func.code()).put_u32(handle);
    body(&mut w);
    w.finish()
}

pub fn status(reply: &[u8]) -> u32 {
    hsm_gateway::protocol::ReplyHeader::parse(reply).unwrap().status
}

pub fn match_request(handle: u32, result_max: u32, previous: Uuid) -> Vec<u8> {
    let mut m = KeyMatchRequest::all(0, result_max);
    m.previous = previous;
    m.encode(handle)
}
