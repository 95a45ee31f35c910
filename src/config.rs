//! Configuration for the gateway
//!
//! CLI arguments and environment variable handling using clap.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Where a device is reached
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeviceAddr {
    /// USB serial node, e.g. /dev/ttyUSB0
    Serial(PathBuf),
    /// TCP bridge in front of a serial line
    Tcp(String),
}

/// hsm-gateway - RPC multiplexer for Cryptech alpha devices
#[derive(Parser, Debug, Clone)]
#[command(name = "hsm-gateway")]
#[command(about = "Routes HAL RPC calls to a set of alpha HSM devices")]
pub struct Args {
    /// TCP address for untrusted (network) clients
    #[arg(long, env = "RPC_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Unix socket path for trusted local clients
    #[arg(long, env = "RPC_SOCKET")]
    pub unix_socket: Option<PathBuf>,

    /// Comma-separated serial device nodes
    #[arg(long, env = "HSM_SERIAL_DEVICES")]
    pub serial_devices: Option<String>,

    /// Comma-separated host:port serial bridges
    #[arg(long, env = "HSM_DEVICE_ADDRS")]
    pub device_addrs: Option<String>,

    /// Directory for the key cache snapshot files
    #[arg(long, env = "HSM_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Load the cache snapshot at start instead of rebuilding from devices
    #[arg(long, env = "HSM_RESTORE_CACHE", default_value = "false")]
    pub restore_cache: bool,

    /// Deadline for one device request/reply exchange
    #[arg(long, env = "HSM_EXCHANGE_TIMEOUT_MS", default_value = "5000")]
    pub exchange_timeout_ms: u64,

    /// Consecutive any-device calls sent to one device before rotating
    #[arg(long, env = "HSM_USES_BEFORE_ROTATE", default_value = "2")]
    pub uses_before_rotate: u32,

    /// The devices' master key has been set
    #[arg(long, env = "HSM_MASTERKEY_SET", default_value = "false")]
    pub masterkey_set: bool,

    /// Generated private keys become exportable unless they carry a usage flag
    #[arg(long, env = "HSM_EXPORTABLE_PRIVATE_KEYS", default_value = "false")]
    pub exportable_private_keys: bool,

    /// Allow PKEY_EXPORT from network clients
    #[arg(long, env = "HSM_KEY_EXPORT", default_value = "false")]
    pub key_export: bool,

    /// Wheel PIN; unlocks the HSM and builds the cache at start
    #[arg(long, env = "HSM_WHEEL_PIN", hide_env_values = true)]
    pub wheel_pin: Option<String>,

    /// GPIO value files polled for tamper (comma-separated)
    #[arg(long, env = "HSM_TAMPER_FILE")]
    pub tamper_file: Option<String>,

    /// Tamper poll interval
    #[arg(long, env = "HSM_TAMPER_POLL_MS", default_value = "1000")]
    pub tamper_poll_ms: u64,

    /// Address reported by GET_IP
    #[arg(long, env = "HSM_ADVERTISED_IP", default_value = "0.0.0.0")]
    pub advertised_ip: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    pub log_json: bool,
}

fn split_list(list: &Option<String>) -> Vec<String> {
    list.as_deref()
        .map(|list| {
            list.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

impl Args {
    /// Devices in index order: serial nodes first, then TCP bridges
    pub fn device_list(&self) -> Vec<DeviceAddr> {
        split_list(&self.serial_devices)
            .into_iter()
            .map(|path| DeviceAddr::Serial(PathBuf::from(path)))
            .chain(split_list(&self.device_addrs).into_iter().map(DeviceAddr::Tcp))
            .collect()
    }

    pub fn tamper_files(&self) -> Vec<PathBuf> {
        split_list(&self.tamper_file)
            .into_iter()
            .map(PathBuf::from)
            .collect()
    }

    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_millis(self.exchange_timeout_ms)
    }

    pub fn tamper_poll_interval(&self) -> Duration {
        Duration::from_millis(self.tamper_poll_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.exchange_timeout_ms == 0 {
            return Err("HSM_EXCHANGE_TIMEOUT_MS must be greater than zero".to_string());
        }

        if self.uses_before_rotate == 0 {
            return Err("HSM_USES_BEFORE_ROTATE must be at least 1".to_string());
        }

        if self.restore_cache && self.cache_dir.is_none() {
            return Err("--restore-cache needs HSM_CACHE_DIR".to_string());
        }

        if self.tamper_file.is_some() && self.tamper_poll_ms == 0 {
            return Err("HSM_TAMPER_POLL_MS must be greater than zero".to_string());
        }

        if let Some(pin) = &self.wheel_pin {
            if pin.is_empty() {
                return Err("HSM_WHEEL_PIN must not be empty".to_string());
            }
        }

        let mut seen = std::collections::HashSet::new();
        for device in self.device_list() {
            if !seen.insert(device.clone()) {
                return Err(format!("device {:?} listed twice", device));
            }
        }

        Ok(())
    }
}
