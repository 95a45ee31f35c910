//! Synchronizer integration tests
//!
//! Runs the synchronizer worker against fake devices:
//! - initialize gate and login
//! - cache rebuild from device keystores and the saved mapping
//! - one-way and two-way copies
//! - remote export and import between two appliances

mod common;

use std::sync::Arc;

use common::{spawn_devices, FakeHsm};
use hsm_gateway::cache::KeyCache;
use hsm_gateway::protocol::{key_flags, KeyType, RpcFunc};
use hsm_gateway::sync::{ExportBundle, SyncCommand, SyncResult, Synchronizer};
use hsm_gateway::tamper::TamperObserver;
use hsm_gateway::types::SecretBytes;
use tempfile::TempDir;

struct Appliance {
    fakes: Vec<FakeHsm>,
    cache: Arc<KeyCache>,
    sync: Synchronizer,
}

fn appliance(count: usize, cache: KeyCache) -> Appliance {
    let fakes: Vec<FakeHsm> = (0..count).map(FakeHsm::new).collect();
    let devices = spawn_devices(&fakes);
    let cache = Arc::new(cache);
    let sync = Synchronizer::spawn(devices, Arc::clone(&cache), 0x5151);
    Appliance { fakes, cache, sync }
}

async fn initialize(app: &Appliance) {
    let result = app
        .sync
        .run(SyncCommand::Initialize {
            pin: SecretBytes::from("wheel-pin"),
        })
        .await;
    assert!(result.is_success(), "initialize failed: {:?}", result);
}

async fn build(app: &Appliance) {
    let result = app
        .sync
        .run(SyncCommand::BuildCache {
            from: 0,
            to: app.fakes.len(),
        })
        .await;
    assert!(result.is_success(), "build failed: {:?}", result);
}

const EXPORTABLE_SIGNING: u32 = key_flags::USAGE_DIGITALSIGNATURE | key_flags::EXPORTABLE;

// =============================================================================
// Initialize gate
// =============================================================================

#[tokio::test]
async fn test_commands_refused_before_initialize() {
    let app = appliance(1, KeyCache::new(1));

    let result = app.sync.run(SyncCommand::BuildCache { from: 0, to: 1 }).await;
    assert!(matches!(result, SyncResult::Failed(_)));
    assert_eq!(app.fakes[0].calls(RpcFunc::PkeyMatch), 0);

    initialize(&app).await;
    assert_eq!(app.fakes[0].calls(RpcFunc::Login), 1);

    let again = app
        .sync
        .run(SyncCommand::Initialize {
            pin: SecretBytes::from("wheel-pin"),
        })
        .await;
    assert!(matches!(again, SyncResult::Failed(_)));
}

#[tokio::test]
async fn test_tamper_fails_queued_commands() {
    let app = appliance(1, KeyCache::new(1));
    initialize(&app).await;

    app.sync.on_tamper_changed(true);
    let result = app.sync.run(SyncCommand::BuildCache { from: 0, to: 1 }).await;
    assert!(matches!(result, SyncResult::Failed(_)));
    assert_eq!(app.fakes[0].calls(RpcFunc::PkeyMatch), 0);

    app.sync.on_tamper_changed(false);
    build(&app).await;
}

// =============================================================================
// Cache rebuild
// =============================================================================

#[tokio::test]
async fn test_build_cache_links_every_key() {
    let app = appliance(2, KeyCache::new(2));
    let a = app.fakes[0].add_key(KeyType::RsaPrivate, key_flags::TOKEN);
    let b = app.fakes[0].add_key(KeyType::EcPublic, key_flags::PUBLIC);
    let c = app.fakes[1].add_key(KeyType::EcPrivate, 0);

    initialize(&app).await;
    build(&app).await;

    assert!(app.cache.is_initialized());
    assert_eq!(app.cache.master_count(), 3);
    let master = app.cache.master_for(0, &a).unwrap();
    assert_eq!(app.cache.master_record(&master).unwrap().key_type, KeyType::RsaPrivate);
    assert!(app.cache.master_for(0, &b).is_some());
    assert!(app.cache.master_for(1, &c).is_some());
    app.cache.check_consistency().unwrap();
}

#[tokio::test]
async fn test_rebuild_keeps_master_ids_from_mapping() {
    let dir = TempDir::new().unwrap();
    let first = appliance(1, KeyCache::with_snapshot_dir(1, dir.path()));
    let key = first.fakes[0].add_key(KeyType::EcPrivate, 0);
    initialize(&first).await;
    build(&first).await;
    let master = first.cache.master_for(0, &key).unwrap();

    // Same keystore, fresh process
    let cache = KeyCache::with_snapshot_dir(1, dir.path());
    let devices = spawn_devices(&first.fakes);
    let cache = Arc::new(cache);
    let sync = Synchronizer::spawn(devices, Arc::clone(&cache), 7);
    assert!(sync
        .run(SyncCommand::Initialize { pin: SecretBytes::from("wheel-pin") })
        .await
        .is_success());
    assert!(sync.run(SyncCommand::BuildCache { from: 0, to: 1 }).await.is_success());

    assert_eq!(cache.master_for(0, &key), Some(master));
}

// =============================================================================
// Device to device copies
// =============================================================================

#[tokio::test]
async fn test_one_way_copy_links_new_key_to_source_master() {
    let app = appliance(2, KeyCache::new(2));
    let original = app.fakes[0].add_key(KeyType::EcPrivate, EXPORTABLE_SIGNING);
    initialize(&app).await;
    build(&app).await;
    let master = app.cache.master_for(0, &original).unwrap();

    let result = app
        .sync
        .run(SyncCommand::OneWayCopy {
            src: 0,
            dest: 1,
            max_keys: 10,
        })
        .await;
    assert!(result.is_success(), "copy failed: {:?}", result);

    let holders = app.cache.devices_holding(&master);
    assert_eq!(holders.len(), 2);
    assert_eq!(holders[&0], original);
    let copy = holders[&1];
    assert_ne!(copy, original);
    assert!(app.fakes[1].has_key(&copy));
    assert_eq!(app.fakes[1].key_type(&copy), Some(KeyType::EcPrivate));

    // The KEKEK public key loaded on the source was removed again
    assert_eq!(app.fakes[0].key_count(), 1);
    app.cache.check_consistency().unwrap();
}

#[tokio::test]
async fn test_one_way_copy_moves_public_and_skips_unexportable() {
    let app = appliance(2, KeyCache::new(2));
    let public = app.fakes[0].add_key(KeyType::RsaPublic, key_flags::PUBLIC);
    let locked = app.fakes[0].add_key(KeyType::RsaPrivate, key_flags::USAGE_DIGITALSIGNATURE);
    initialize(&app).await;
    build(&app).await;

    let result = app
        .sync
        .run(SyncCommand::OneWayCopy {
            src: 0,
            dest: 1,
            max_keys: 0,
        })
        .await;
    assert!(result.is_success(), "copy failed: {:?}", result);

    let public_master = app.cache.master_for(0, &public).unwrap();
    let locked_master = app.cache.master_for(0, &locked).unwrap();
    assert!(app.cache.devices_holding(&public_master).contains_key(&1));
    assert!(!app.cache.devices_holding(&locked_master).contains_key(&1));
    assert_eq!(app.fakes[0].calls(RpcFunc::PkeyExport), 0);
}

#[tokio::test]
async fn test_copy_respects_max_keys_and_reuses_kekek() {
    let app = appliance(2, KeyCache::new(2));
    for _ in 0..3 {
        app.fakes[0].add_key(KeyType::EcPrivate, EXPORTABLE_SIGNING);
    }
    initialize(&app).await;
    build(&app).await;

    let copy = SyncCommand::OneWayCopy {
        src: 0,
        dest: 1,
        max_keys: 2,
    };
    assert!(app.sync.run(copy.clone()).await.is_success());
    assert_eq!(app.cache.device_keys(1).len(), 2);

    assert!(app.sync.run(copy).await.is_success());
    assert_eq!(app.cache.device_keys(1).len(), 3);

    // One KEKEK generated, then found by match on the second run
    assert_eq!(app.fakes[1].calls(RpcFunc::PkeyGenerateRsa), 1);
    assert_eq!(app.fakes[1].key_count(), 4);
}

#[tokio::test]
async fn test_two_way_copy_evens_out_devices() {
    let app = appliance(2, KeyCache::new(2));
    app.fakes[0].add_key(KeyType::EcPrivate, EXPORTABLE_SIGNING);
    app.fakes[1].add_key(KeyType::EcPrivate, EXPORTABLE_SIGNING);
    initialize(&app).await;
    build(&app).await;

    let result = app
        .sync
        .run(SyncCommand::TwoWayCopy {
            a: 0,
            b: 1,
            max_keys: 0,
        })
        .await;
    assert!(result.is_success(), "copy failed: {:?}", result);

    for (master, record) in app.cache.master_records() {
        if record.key_type == KeyType::EcPrivate {
            assert_eq!(record.device_keys.len(), 2, "master {} not on both devices", master);
        }
    }
}

// =============================================================================
// Remote transfer
// =============================================================================

#[tokio::test]
async fn test_remote_export_import_keeps_master_identity() {
    let source = appliance(1, KeyCache::new(1));
    let target = appliance(1, KeyCache::new(1));
    let key = source.fakes[0].add_key(KeyType::EcPrivate, EXPORTABLE_SIGNING);
    for app in [&source, &target] {
        initialize(app).await;
        build(app).await;
    }
    let master = source.cache.master_for(0, &key).unwrap();

    let SyncResult::Kekek(kekek) = target.sync.run(SyncCommand::RemoteSetup { dest: 0 }).await else {
        panic!("remote setup did not return a KEKEK");
    };

    let SyncResult::Exported(bundle) = source
        .sync
        .run(SyncCommand::RemoteExport { src: 0, kekek })
        .await
    else {
        panic!("remote export did not return a bundle");
    };
    assert_eq!(bundle.keys.len(), 1);
    assert_eq!(bundle.keys[0].master_id, master);

    // The bundle travels as JSON
    let json = serde_json::to_string(&bundle).unwrap();
    let bundle: ExportBundle = serde_json::from_str(&json).unwrap();

    let result = target
        .sync
        .run(SyncCommand::RemoteImport { dest: 0, bundle })
        .await;
    assert!(result.is_success(), "import failed: {:?}", result);

    let holders = target.cache.devices_holding(&master);
    let imported = holders[&0];
    assert!(target.fakes[0].has_key(&imported));
    assert_eq!(target.cache.master_record(&master).unwrap().key_type, KeyType::EcPrivate);
}
