//! Command execution for the synchronizer worker

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::client::DeviceClient;
use super::command::{ExportBundle, ExportedKey, KekekInfo, SyncCommand, SyncResult};
use super::{report, Job};
use crate::cache::KeyCache;
use crate::device::DeviceSession;
use crate::protocol::{key_flags, HalUser, KeyType};
use crate::types::{HsmError, Result, SecretBytes};

const KEKEK_FLAGS: u32 = key_flags::USAGE_KEYENCIPHERMENT | key_flags::TOKEN;
const KEKEK_BITS: u32 = 2048;
const KEKEK_EXPONENT: [u8; 3] = [0x01, 0x00, 0x01];

/// How an imported key joins the cache
enum LinkTarget {
    /// Master already cached on this appliance
    Existing(Uuid),
    /// Master from another appliance, created under the same id
    Adopt(Uuid),
}

pub(super) struct SyncWorker {
    devices: Vec<Arc<DeviceSession>>,
    cache: Arc<KeyCache>,
    handle: u32,
    tamper: Arc<AtomicBool>,
    initialized: bool,
}

impl SyncWorker {
    pub(super) fn new(
        devices: Vec<Arc<DeviceSession>>,
        cache: Arc<KeyCache>,
        handle: u32,
        tamper: Arc<AtomicBool>,
    ) -> Self {
        Self {
            devices,
            cache,
            handle,
            tamper,
            initialized: false,
        }
    }

    pub(super) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Job>) {
        while let Some(Job { command, reports }) = rx.recv().await {
            info!(command = command.name(), "Synchronizer command started");
            let result = self.execute(&command).await;
            match &result {
                SyncResult::Failed(reason) => {
                    warn!(command = command.name(), "Synchronizer command failed: {}", reason)
                }
                _ => info!(command = command.name(), "Synchronizer command finished"),
            }
            if let Some(reports) = reports {
                let _ = reports.send(report(command, result));
            }
        }
        debug!("Synchronizer queue closed");
    }

    async fn execute(&mut self, command: &SyncCommand) -> SyncResult {
        if self.tamper.load(Ordering::Acquire) {
            return SyncResult::Failed("tamper detected, synchronizer halted".into());
        }

        let outcome = match command {
            SyncCommand::Initialize { .. } if self.initialized => {
                return SyncResult::Failed("the synchronizer can not be initialized again".into())
            }
            SyncCommand::Initialize { pin } => self.initialize(pin).await,
            _ if !self.initialized => {
                return SyncResult::Failed("the synchronizer has not been initialized".into())
            }
            SyncCommand::BuildCache { from, to } => self.build_cache(*from, *to).await,
            SyncCommand::OneWayCopy {
                src,
                dest,
                max_keys,
            } => self.one_way_copy(*src, *dest, *max_keys).await,
            SyncCommand::TwoWayCopy { a, b, max_keys } => self.two_way_copy(*a, *b, *max_keys).await,
            SyncCommand::RemoteSetup { dest } => self.remote_setup(*dest).await,
            SyncCommand::RemoteExport { src, kekek } => self.remote_export(*src, kekek).await,
            SyncCommand::RemoteImport { dest, bundle } => self.remote_import(*dest, bundle).await,
        };

        outcome.unwrap_or_else(|e| SyncResult::Failed(e.to_string()))
    }

    fn client(&self, index: usize) -> Result<DeviceClient<'_>> {
        let device = self
            .devices
            .get(index)
            .ok_or_else(|| HsmError::Sync(format!("no device {}", index)))?;
        Ok(DeviceClient::new(device, self.handle))
    }

    fn backup(&self) {
        if let Err(e) = self.cache.backup() {
            warn!("Cache snapshot after sync failed: {}", e);
        }
    }

    // =========================================================================
    // Initialize and cache rebuild
    // =========================================================================

    async fn initialize(&mut self, pin: &SecretBytes) -> Result<SyncResult> {
        for index in 0..self.devices.len() {
            self.client(index)?.login(HalUser::Wheel, pin.expose()).await?;
        }
        self.initialized = true;
        Ok(SyncResult::Message(format!(
            "Synchronizer initialized on {} devices",
            self.devices.len()
        )))
    }

    async fn build_cache(&self, from: usize, to: usize) -> Result<SyncResult> {
        if from > to || to > self.devices.len() {
            return Err(HsmError::Sync(format!(
                "device range {}..{} outside 0..{}",
                from,
                to,
                self.devices.len()
            )));
        }

        self.cache.clear();
        let mapping = match self.cache.load_mapping() {
            Ok(mapping) => mapping.unwrap_or_default(),
            Err(e) => {
                warn!("Saved key mapping unreadable, keys get fresh master ids: {}", e);
                Default::default()
            }
        };

        let mut found = 0usize;
        for index in from..to {
            let client = self.client(index)?;
            for uuid in client.match_all(KeyType::None, 0, 0).await? {
                let (key_type, flags) = client.describe_key(&uuid).await?;
                let linked = match mapping.get(&uuid) {
                    Some(master) => self.cache.adopt_key(index, uuid, key_type, flags, *master),
                    None => self.cache.link_key(index, uuid, key_type, flags, None),
                };
                if let Err(e) = linked {
                    warn!(device = index, %uuid, "Saved mapping conflicts, linking fresh: {}", e);
                    self.cache.link_key(index, uuid, key_type, flags, None)?;
                }
                debug!(device = index, %uuid, key_type = ?key_type, "Found key");
                found += 1;
            }
        }

        self.cache.set_initialized(true);
        self.backup();
        Ok(SyncResult::Message(format!(
            "Cache generated: {} keys, {} master keys",
            found,
            self.cache.master_count()
        )))
    }

    // =========================================================================
    // Device to device copies
    // =========================================================================

    /// Keys on `src` whose master has no copy on `dest`, as (device key, master)
    fn copy_list(&self, src: usize, dest: usize, max_keys: usize) -> Vec<(Uuid, Uuid)> {
        let limit = if max_keys == 0 { usize::MAX } else { max_keys };
        let rows: BTreeMap<Uuid, Uuid> = self
            .cache
            .device_keys(src)
            .into_iter()
            .map(|(key, row)| (key, row.master_id))
            .collect();

        rows.into_iter()
            .filter(|(_, master)| !self.cache.devices_holding(master).contains_key(&dest))
            .take(limit)
            .collect()
    }

    async fn one_way_copy(&self, src: usize, dest: usize, max_keys: usize) -> Result<SyncResult> {
        if src == dest {
            return Err(HsmError::Sync("source and destination are the same device".into()));
        }
        let source = self.client(src)?;
        let destination = self.client(dest)?;

        let list = self.copy_list(src, dest, max_keys);
        if list.is_empty() {
            return Ok(SyncResult::Message(format!(
                "Devices {} and {} already hold the same keys",
                src, dest
            )));
        }
        info!(src, dest, keys = list.len(), "Copying keys");

        let kekek = self.setup_kekek(&destination).await?;
        let exported = self.export_keys(&source, &kekek, &list).await?;
        let imported = self
            .import_keys(&destination, &kekek.kekek_uuid, &exported, Some(src))
            .await?;

        self.backup();
        Ok(SyncResult::Message(format!(
            "One way copy from {} to {} complete: {} of {} keys copied",
            src,
            dest,
            imported,
            list.len()
        )))
    }

    async fn two_way_copy(&self, a: usize, b: usize, max_keys: usize) -> Result<SyncResult> {
        self.one_way_copy(a, b, max_keys).await?;
        self.one_way_copy(b, a, max_keys).await?;
        Ok(SyncResult::Message(format!(
            "Two way copy between {} and {} complete",
            a, b
        )))
    }

    // =========================================================================
    // KEKEK handling, export and import
    // =========================================================================

    /// Reuse a suitable RSA key-encipherment key on the device or make one
    async fn setup_kekek(&self, client: &DeviceClient<'_>) -> Result<KekekInfo> {
        let candidates = client
            .match_all(KeyType::RsaPrivate, KEKEK_FLAGS, KEKEK_FLAGS)
            .await?;

        for uuid in candidates {
            let pkey = client.open(&uuid).await?;
            let checked = async {
                let usable = client.key_type(pkey).await? == KeyType::RsaPrivate
                    && client.key_flags(pkey).await? & key_flags::USAGE_KEYENCIPHERMENT != 0;
                if usable {
                    client.public_key(pkey).await.map(Some)
                } else {
                    Ok(None)
                }
            }
            .await;
            client.close_quietly(pkey).await;

            if let Some(kekek_pubkey) = checked? {
                debug!(device = client.index(), %uuid, "Reusing KEKEK");
                return Ok(KekekInfo {
                    comment: "KEKEK public key".into(),
                    kekek_uuid: uuid,
                    kekek_pubkey,
                });
            }
        }

        let (pkey, uuid) = client
            .generate_rsa(KEKEK_BITS, &KEKEK_EXPONENT, KEKEK_FLAGS)
            .await?;
        let public = client.public_key(pkey).await;
        client.close_quietly(pkey).await;
        info!(device = client.index(), %uuid, "Generated KEKEK");

        Ok(KekekInfo {
            comment: "KEKEK public key".into(),
            kekek_uuid: uuid,
            kekek_pubkey: public?,
        })
    }

    /// Export `keys` from the device wrapped under `kekek`.
    ///
    /// The KEKEK public key is loaded for the duration of the export and
    /// deleted afterwards.
    async fn export_keys(
        &self,
        client: &DeviceClient<'_>,
        kekek: &KekekInfo,
        keys: &[(Uuid, Uuid)],
    ) -> Result<Vec<ExportedKey>> {
        let (kekek_pkey, _) = client
            .load(&kekek.kekek_pubkey, key_flags::USAGE_KEYENCIPHERMENT)
            .await?;

        let exported = async {
            let mut exported = Vec::new();
            for (uuid, master_id) in keys {
                let pkey = client.open(uuid).await?;
                let one = Self::export_one(client, pkey, kekek_pkey, *uuid, *master_id).await;
                client.close_quietly(pkey).await;
                if let Some(key) = one? {
                    exported.push(key);
                }
            }
            Ok::<_, HsmError>(exported)
        }
        .await;

        if let Err(e) = client.delete(kekek_pkey).await {
            warn!(device = client.index(), "Failed to delete loaded KEKEK: {}", e);
        }
        exported
    }

    async fn export_one(
        client: &DeviceClient<'_>,
        pkey: u32,
        kekek_pkey: u32,
        uuid: Uuid,
        master_id: Uuid,
    ) -> Result<Option<ExportedKey>> {
        let key_type = client.key_type(pkey).await?;
        let flags = client.key_flags(pkey).await?;

        match key_type {
            KeyType::RsaPrivate | KeyType::EcPrivate => {
                if flags & key_flags::EXPORTABLE == 0 {
                    debug!(device = client.index(), %uuid, "Private key not exportable, skipped");
                    return Ok(None);
                }
                let (pkcs8, kek) = client.export(pkey, kekek_pkey).await?;
                Ok(Some(ExportedKey {
                    comment: "Encrypted private key".into(),
                    uuid,
                    master_id,
                    key_type,
                    flags,
                    pkcs8: Some(SecretBytes::new(pkcs8)),
                    kek: Some(SecretBytes::new(kek)),
                    spki: None,
                }))
            }
            KeyType::RsaPublic | KeyType::EcPublic => Ok(Some(ExportedKey {
                comment: "Public key".into(),
                uuid,
                master_id,
                key_type,
                flags,
                pkcs8: None,
                kek: None,
                spki: Some(client.public_key(pkey).await?),
            })),
            other => {
                debug!(device = client.index(), %uuid, key_type = ?other, "Key type cannot be transferred");
                Ok(None)
            }
        }
    }

    /// Decide which master an incoming key joins, or `None` to skip it
    fn link_target(&self, key: &ExportedKey, dest: usize, source: Option<usize>) -> Option<LinkTarget> {
        match source {
            Some(src) => {
                let master = self.cache.master_for(src, &key.uuid)?;
                let holders = self.cache.devices_holding(&master);
                (!holders.contains_key(&dest)).then_some(LinkTarget::Existing(master))
            }
            None => {
                let holders = self.cache.devices_holding(&key.master_id);
                if holders.contains_key(&dest) {
                    None
                } else if holders.is_empty() {
                    Some(LinkTarget::Adopt(key.master_id))
                } else {
                    Some(LinkTarget::Existing(key.master_id))
                }
            }
        }
    }

    /// Import `keys` under the KEKEK `kekek_uuid` and link each to its master.
    ///
    /// `source` is the local device the keys came from, `None` for a bundle
    /// from another appliance. Returns the number of keys imported.
    async fn import_keys(
        &self,
        client: &DeviceClient<'_>,
        kekek_uuid: &Uuid,
        keys: &[ExportedKey],
        source: Option<usize>,
    ) -> Result<usize> {
        let dest = client.index();
        let kekek = client.open(kekek_uuid).await?;

        let imported = async {
            let mut imported = 0;
            for key in keys {
                let Some(target) = self.link_target(key, dest, source) else {
                    debug!(device = dest, uuid = %key.uuid, "Source key gone or already present, skipped");
                    continue;
                };

                let (pkey, new_uuid) = match (&key.pkcs8, &key.kek, &key.spki) {
                    (Some(pkcs8), Some(kek), _) => {
                        client.import(kekek, pkcs8.expose(), kek.expose(), key.flags).await?
                    }
                    (_, _, Some(spki)) => client.load(spki, key.flags).await?,
                    _ => {
                        warn!(uuid = %key.uuid, "Bundle entry carries no key material");
                        continue;
                    }
                };
                client.close_quietly(pkey).await;

                let master = match target {
                    LinkTarget::Existing(master) => {
                        self.cache
                            .link_key(dest, new_uuid, key.key_type, key.flags, Some(master))?
                    }
                    LinkTarget::Adopt(master) => {
                        self.cache
                            .adopt_key(dest, new_uuid, key.key_type, key.flags, master)?
                    }
                };
                info!(device = dest, from = %key.uuid, to = %new_uuid, %master, "Key copied");
                imported += 1;
            }
            Ok::<_, HsmError>(imported)
        }
        .await;

        client.close_quietly(kekek).await;
        imported
    }

    // =========================================================================
    // Remote transfer
    // =========================================================================

    async fn remote_setup(&self, dest: usize) -> Result<SyncResult> {
        let client = self.client(dest)?;
        Ok(SyncResult::Kekek(self.setup_kekek(&client).await?))
    }

    async fn remote_export(&self, src: usize, kekek: &KekekInfo) -> Result<SyncResult> {
        let client = self.client(src)?;
        let keys: Vec<(Uuid, Uuid)> = self
            .cache
            .device_keys(src)
            .into_iter()
            .map(|(key, row)| (key, row.master_id))
            .collect::<BTreeMap<_, _>>()
            .into_iter()
            .collect();

        let exported = self.export_keys(&client, kekek, &keys).await?;
        info!(device = src, keys = exported.len(), "Keys exported for remote import");
        Ok(SyncResult::Exported(ExportBundle {
            comment: "Cryptech Alpha encrypted key backup".into(),
            kekek: kekek.clone(),
            keys: exported,
            exported_at: Utc::now(),
        }))
    }

    async fn remote_import(&self, dest: usize, bundle: &ExportBundle) -> Result<SyncResult> {
        let client = self.client(dest)?;
        let imported = self
            .import_keys(&client, &bundle.kekek.kekek_uuid, &bundle.keys, None)
            .await?;
        self.backup();
        Ok(SyncResult::Message(format!(
            "Imported {} of {} keys onto device {}",
            imported,
            bundle.keys.len(),
            dest
        )))
    }
}
