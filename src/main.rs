//! hsm-gateway - RPC multiplexer for Cryptech alpha HSM devices

use clap::Parser;
use std::future::pending;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use hsm_gateway::{
    cache::KeyCache,
    config::{Args, DeviceAddr},
    device::{DeviceSession, SerialConnector, TcpConnector, TransportConnector},
    preprocessor::RpcPreprocessor,
    server,
    settings::Settings,
    sync::{SyncCommand, SyncResult, Synchronizer},
    tamper::{FileTamperSource, TamperMonitor},
    types::SecretBytes,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    // Initialize tracing/logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("hsm_gateway={},info", args.log_level).into());
    let fmt_layer = if args.log_json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };
    tracing_subscriber::registry().with(filter).with(fmt_layer).init();

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let device_addrs = args.device_list();

    info!("======================================");
    info!("  hsm-gateway - alpha RPC multiplexer");
    info!("======================================");
    info!("Listen: {} (network)", args.listen);
    match &args.unix_socket {
        Some(path) => info!("Local socket: {}", path.display()),
        None => info!("Local socket: disabled"),
    }
    info!("Devices: {}", device_addrs.len());
    for (i, addr) in device_addrs.iter().enumerate() {
        info!("  alpha-{}: {:?}", i, addr);
    }
    match &args.cache_dir {
        Some(dir) => info!("Cache dir: {}", dir.display()),
        None => info!("Cache dir: none (memory only)"),
    }
    info!("Uses before rotate: {}", args.uses_before_rotate);
    info!("======================================");

    let settings = Arc::new(Settings::new(
        args.masterkey_set,
        args.exportable_private_keys,
        args.key_export,
        args.advertised_ip.clone(),
    ));
    info!("Settings: {}", serde_json::to_string(&settings.snapshot())?);

    let devices: Vec<Arc<DeviceSession>> = device_addrs
        .into_iter()
        .enumerate()
        .map(|(index, addr)| {
            let connector: Arc<dyn TransportConnector> = match addr {
                DeviceAddr::Serial(path) => {
                    Arc::new(SerialConnector::new(path.to_string_lossy().into_owned()))
                }
                DeviceAddr::Tcp(addr) => Arc::new(TcpConnector::new(addr)),
            };
            DeviceSession::spawn(index, connector, args.exchange_timeout())
        })
        .collect();
    if devices.is_empty() {
        warn!("No devices configured; every device request will be refused");
    }

    let cache = Arc::new(match &args.cache_dir {
        Some(dir) => KeyCache::with_snapshot_dir(devices.len(), dir.clone()),
        None => KeyCache::new(devices.len()),
    });

    let preprocessor = Arc::new(RpcPreprocessor::new(
        devices.clone(),
        Arc::clone(&cache),
        Arc::clone(&settings),
        args.uses_before_rotate,
    ));

    let synchronizer = Arc::new(Synchronizer::spawn(
        devices.clone(),
        Arc::clone(&cache),
        preprocessor.next_client_handle(),
    ));

    // Tamper fan-out
    let tamper = Arc::new(TamperMonitor::new());
    tamper.add_observer(preprocessor.clone());
    tamper.add_observer(synchronizer.clone());
    let tamper_files = args.tamper_files();
    if !tamper_files.is_empty() {
        info!("Polling {} tamper line(s)", tamper_files.len());
        Arc::clone(&tamper).spawn_polling(
            Box::new(FileTamperSource::new(tamper_files)),
            args.tamper_poll_interval(),
        );
    }

    // Cache from snapshot, if asked
    if args.restore_cache {
        if let Some(dir) = &args.cache_dir {
            match cache.restore_from_disk(dir) {
                Ok(true) => {}
                Ok(false) => warn!("No cache snapshot in {}", dir.display()),
                Err(e) => warn!("Cache snapshot rejected: {}", e),
            }
        }
    }

    // Unlock and build the cache when the wheel PIN is supplied
    match &args.wheel_pin {
        Some(pin) => {
            let pin = SecretBytes::from(pin.as_str());
            match synchronizer.run(SyncCommand::Initialize { pin }).await {
                SyncResult::Failed(reason) => error!("Synchronizer initialize failed: {}", reason),
                _ => {
                    preprocessor.unlock_hsm();
                    if !cache.is_initialized() {
                        let build = SyncCommand::BuildCache {
                            from: 0,
                            to: devices.len(),
                        };
                        match synchronizer.run(build).await {
                            SyncResult::Message(message) => info!("{}", message),
                            SyncResult::Failed(reason) => error!("Cache build failed: {}", reason),
                            other => warn!("Unexpected cache build result: {:?}", other),
                        }
                    }
                }
            }
        }
        None => warn!("No wheel PIN given; the HSM stays locked"),
    }

    let tcp = tokio::net::TcpListener::bind(args.listen).await?;
    let unix = match &args.unix_socket {
        Some(path) => Some(server::bind_unix(path)?),
        None => None,
    };

    let tcp_task = server::serve_tcp(Arc::clone(&preprocessor), tcp);
    let local = Arc::clone(&preprocessor);
    let unix_task = async move {
        match unix {
            Some(listener) => server::serve_unix(local, listener).await,
            None => pending().await,
        }
    };

    tokio::select! {
        result = tcp_task => {
            if let Err(e) = result {
                error!("Network listener stopped: {}", e);
            }
        }
        result = unix_task => {
            if let Err(e) = result {
                error!("Local listener stopped: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    preprocessor.lock_hsm();
    if let Err(e) = cache.backup() {
        warn!("Final cache snapshot failed: {}", e);
    }

    Ok(())
}
