//! Master/device key directory
//!
//! Two tables guarded by one coarse lock:
//!
//! - **master table**: master id → key type, flags and the device keys that
//!   hold a copy of the key material (one per device index)
//! - **device tables**: one per device, device key → master id
//!
//! Every accessor copies data out before the lock is released, so nothing
//! outside this module can observe a table while it mutates. Structural
//! changes to the master↔device links are followed by an immediate save of
//! the mapping file when a snapshot directory is configured.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::snapshot;
use crate::protocol::KeyType;
use crate::types::{HsmError, Result};

/// One logical key, wherever its copies live
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterKeyRecord {
    pub id: Uuid,
    pub key_type: KeyType,
    pub flags: u32,
    /// device index → device-local key id
    pub device_keys: BTreeMap<usize, Uuid>,
}

/// Row of a per-device table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceKeyRecord {
    pub master_id: Uuid,
}

#[derive(Debug, Default)]
pub(super) struct CacheTables {
    pub(super) masters: HashMap<Uuid, MasterKeyRecord>,
    pub(super) devices: Vec<HashMap<Uuid, DeviceKeyRecord>>,
}

impl CacheTables {
    fn new(device_count: usize) -> Self {
        Self {
            masters: HashMap::new(),
            devices: vec![HashMap::new(); device_count],
        }
    }

    pub(super) fn mapping(&self) -> BTreeMap<Uuid, Uuid> {
        self.devices
            .iter()
            .flat_map(|table| table.iter().map(|(key, row)| (*key, row.master_id)))
            .collect()
    }
}

/// How `link` treats a master id that is not in the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnknownMaster {
    FreshId,
    KeepId,
}

/// Concurrent key-location cache shared by the preprocessor and the synchronizer
pub struct KeyCache {
    device_count: usize,
    tables: Mutex<CacheTables>,
    initialized: AtomicBool,
    snapshot_dir: Option<PathBuf>,
    /// serializes mutate-then-save so an older mapping never overwrites a newer one
    snapshot_lock: Mutex<()>,
}

impl KeyCache {
    /// Memory-only cache for `device_count` devices
    pub fn new(device_count: usize) -> Self {
        Self {
            device_count,
            tables: Mutex::new(CacheTables::new(device_count)),
            initialized: AtomicBool::new(false),
            snapshot_dir: None,
            snapshot_lock: Mutex::new(()),
        }
    }

    /// Cache that saves its mapping into `dir` after every link change
    pub fn with_snapshot_dir(device_count: usize, dir: impl Into<PathBuf>) -> Self {
        Self {
            snapshot_dir: Some(dir.into()),
            ..Self::new(device_count)
        }
    }

    pub fn device_count(&self) -> usize {
        self.device_count
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn set_initialized(&self, initialized: bool) {
        self.initialized.store(initialized, Ordering::Release);
    }

    fn tables(&self) -> MutexGuard<'_, CacheTables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_index(&self, device: usize) {
        assert!(
            device < self.device_count,
            "device index {} outside cache of {} devices",
            device,
            self.device_count
        );
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    /// Record that `device` holds `device_key`.
    ///
    /// With an existing `master_id` the key joins that master; otherwise a
    /// new master is created under a fresh id. Returns the master id.
    pub fn link_key(
        &self,
        device: usize,
        device_key: Uuid,
        key_type: KeyType,
        flags: u32,
        master_id: Option<Uuid>,
    ) -> Result<Uuid> {
        self.link(device, device_key, key_type, flags, master_id, UnknownMaster::FreshId)
    }

    /// Like [`link_key`](Self::link_key), but an unknown `master_id` is created
    /// under exactly that id. Used when rebuilding from a saved mapping.
    pub fn adopt_key(
        &self,
        device: usize,
        device_key: Uuid,
        key_type: KeyType,
        flags: u32,
        master_id: Uuid,
    ) -> Result<Uuid> {
        self.link(device, device_key, key_type, flags, Some(master_id), UnknownMaster::KeepId)
    }

    fn link(
        &self,
        device: usize,
        device_key: Uuid,
        key_type: KeyType,
        flags: u32,
        master_id: Option<Uuid>,
        unknown: UnknownMaster,
    ) -> Result<Uuid> {
        self.check_index(device);
        let _snapshot_guard = self.snapshot_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let (master, mapping) = {
            let mut tables = self.tables();

            if let Some(existing) = tables.devices[device].get(&device_key) {
                if master_id == Some(existing.master_id) {
                    return Ok(existing.master_id);
                }
                return Err(HsmError::Cache(format!(
                    "device key {} on device {} already belongs to master {}",
                    device_key, device, existing.master_id
                )));
            }

            let target = match master_id {
                Some(id) if tables.masters.contains_key(&id) => Some(id),
                Some(id) if unknown == UnknownMaster::KeepId => {
                    tables.masters.insert(
                        id,
                        MasterKeyRecord {
                            id,
                            key_type,
                            flags,
                            device_keys: BTreeMap::new(),
                        },
                    );
                    Some(id)
                }
                _ => None,
            };

            let master = match target {
                Some(id) => {
                    let record = tables
                        .masters
                        .get_mut(&id)
                        .ok_or_else(|| HsmError::Internal("master vanished under lock".into()))?;
                    if let Some(other) = record.device_keys.get(&device) {
                        return Err(HsmError::Cache(format!(
                            "master {} already has key {} on device {}",
                            id, other, device
                        )));
                    }
                    record.device_keys.insert(device, device_key);
                    id
                }
                None => {
                    let id = Uuid::new_v4();
                    tables.masters.insert(
                        id,
                        MasterKeyRecord {
                            id,
                            key_type,
                            flags,
                            device_keys: BTreeMap::from([(device, device_key)]),
                        },
                    );
                    id
                }
            };

            tables.devices[device].insert(device_key, DeviceKeyRecord { master_id: master });
            (master, self.snapshot_dir.as_ref().map(|_| tables.mapping()))
        };

        debug!(device, %device_key, %master, "Linked key");
        self.save_mapping_best_effort(mapping);
        Ok(master)
    }

    /// Forget that `device` holds `device_key`. Returns false if it was never cached.
    pub fn unlink_key(&self, device: usize, device_key: &Uuid) -> bool {
        self.check_index(device);
        let _snapshot_guard = self.snapshot_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mapping = {
            let mut tables = self.tables();

            let Some(row) = tables.devices[device].remove(device_key) else {
                return false;
            };

            let emptied = match tables.masters.get_mut(&row.master_id) {
                Some(record) => {
                    record.device_keys.remove(&device);
                    record.device_keys.is_empty()
                }
                None => {
                    warn!(device, %device_key, master = %row.master_id, "Device row pointed at missing master");
                    false
                }
            };
            if emptied {
                tables.masters.remove(&row.master_id);
            }

            self.snapshot_dir.as_ref().map(|_| tables.mapping())
        };

        debug!(device, %device_key, "Unlinked key");
        self.save_mapping_best_effort(mapping);
        true
    }

    /// Drop every record. The cache is no longer initialized afterwards.
    pub fn clear(&self) {
        let mut tables = self.tables();
        *tables = CacheTables::new(self.device_count);
        self.set_initialized(false);
    }

    // =========================================================================
    // Lookup (all results are copies)
    // =========================================================================

    /// Device locations of a master key; empty if unknown
    pub fn devices_holding(&self, master_id: &Uuid) -> BTreeMap<usize, Uuid> {
        self.tables()
            .masters
            .get(master_id)
            .map(|record| record.device_keys.clone())
            .unwrap_or_default()
    }

    /// Holder with the smallest device index
    pub fn lowest_index_holding(&self, master_id: &Uuid) -> Option<(usize, Uuid)> {
        self.tables()
            .masters
            .get(master_id)
            .and_then(|record| record.device_keys.iter().next().map(|(d, k)| (*d, *k)))
    }

    pub fn master_for(&self, device: usize, device_key: &Uuid) -> Option<Uuid> {
        self.check_index(device);
        self.tables().devices[device]
            .get(device_key)
            .map(|row| row.master_id)
    }

    pub fn master_record(&self, master_id: &Uuid) -> Option<MasterKeyRecord> {
        self.tables().masters.get(master_id).cloned()
    }

    pub fn master_records(&self) -> HashMap<Uuid, MasterKeyRecord> {
        self.tables().masters.clone()
    }

    pub fn device_keys(&self, device: usize) -> HashMap<Uuid, DeviceKeyRecord> {
        self.check_index(device);
        self.tables().devices[device].clone()
    }

    pub fn master_count(&self) -> usize {
        self.tables().masters.len()
    }

    /// Verify that both tables agree with each other
    pub fn check_consistency(&self) -> Result<()> {
        let tables = self.tables();

        for (device, table) in tables.devices.iter().enumerate() {
            for (key, row) in table {
                let held = tables
                    .masters
                    .get(&row.master_id)
                    .and_then(|record| record.device_keys.get(&device));
                if held != Some(key) {
                    return Err(HsmError::Cache(format!(
                        "device {} key {} points at master {} which does not list it",
                        device, key, row.master_id
                    )));
                }
            }
        }

        for (id, record) in &tables.masters {
            if record.device_keys.is_empty() {
                return Err(HsmError::Cache(format!("master {} has no device keys", id)));
            }
            for (device, key) in &record.device_keys {
                let row = tables.devices.get(*device).and_then(|t| t.get(key));
                if row.map(|r| r.master_id) != Some(*id) {
                    return Err(HsmError::Cache(format!(
                        "master {} lists key {} on device {} without a device row",
                        id, key, device
                    )));
                }
            }
        }

        Ok(())
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    fn save_mapping_best_effort(&self, mapping: Option<BTreeMap<Uuid, Uuid>>) {
        let (Some(dir), Some(mapping)) = (self.snapshot_dir.as_deref(), mapping) else {
            return;
        };
        if let Err(e) = snapshot::write_mapping(dir, &mapping) {
            error!(dir = %dir.display(), "Failed to save key mapping: {}", e);
        }
    }

    /// Saved device key → master id mapping from the snapshot directory.
    ///
    /// `Ok(None)` when no directory is configured or nothing was saved yet.
    pub fn load_mapping(&self) -> Result<Option<HashMap<Uuid, Uuid>>> {
        match self.snapshot_dir.as_deref() {
            Some(dir) => snapshot::read_mapping(dir),
            None => Ok(None),
        }
    }

    /// Write the mapping, master table and every device table into `dir`
    pub fn snapshot_to_disk(&self, dir: &Path) -> Result<()> {
        let _snapshot_guard = self.snapshot_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let (mapping, masters, devices) = {
            let tables = self.tables();
            (tables.mapping(), tables.masters.clone(), tables.devices.clone())
        };

        snapshot::write_mapping(dir, &mapping)?;
        snapshot::write_master_table(dir, &masters)?;
        for (index, table) in devices.iter().enumerate() {
            snapshot::write_device_table(dir, index, table)?;
        }

        info!(
            dir = %dir.display(),
            masters = masters.len(),
            devices = devices.len(),
            "Cache snapshot written"
        );
        Ok(())
    }

    /// Snapshot into the configured directory, if any
    pub fn backup(&self) -> Result<()> {
        match self.snapshot_dir.as_deref() {
            Some(dir) => self.snapshot_to_disk(dir),
            None => Ok(()),
        }
    }

    /// Replace the tables with a snapshot from `dir`.
    ///
    /// Returns `Ok(false)` when no master table exists there. A snapshot
    /// that fails the consistency check is rejected and leaves the cache empty.
    pub fn restore_from_disk(&self, dir: &Path) -> Result<bool> {
        let Some(masters) = snapshot::read_master_table(dir)? else {
            return Ok(false);
        };

        let mut restored = CacheTables::new(self.device_count);
        for record in masters {
            for (device, key) in &record.device_keys {
                if *device >= self.device_count {
                    return Err(HsmError::Cache(format!(
                        "snapshot references device {} but only {} are attached",
                        device, self.device_count
                    )));
                }
                restored.devices[*device].insert(*key, DeviceKeyRecord { master_id: record.id });
            }
            restored.masters.insert(record.id, record);
        }

        for device in 0..self.device_count {
            let rows = snapshot::read_device_table(dir, device)?.unwrap_or_default();
            if rows != restored.devices[device] {
                return Err(HsmError::Cache(format!(
                    "device table {} disagrees with the master table",
                    device
                )));
            }
        }

        *self.tables() = restored;
        if let Err(e) = self.check_consistency() {
            self.clear();
            return Err(e);
        }
        self.set_initialized(true);
        info!(dir = %dir.display(), masters = self.master_count(), "Cache restored from snapshot");
        Ok(true)
    }
}
