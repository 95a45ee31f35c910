//! hsm-gateway - RPC multiplexer for Cryptech alpha HSM devices
//!
//! One logical HAL RPC endpoint in front of several physical devices.
//! Calls are routed to the right device, replicated where the devices must
//! agree (PINs, logins), and every key is tracked in a location cache so
//! identifier-addressed calls go straight to a device that holds the key.
//!
//! ## Components
//!
//! - **Server**: TCP (untrusted) and Unix socket (trusted) listeners
//! - **Preprocessor**: per-session routing and reply rewriting
//! - **Device**: one serialized exchange worker per device
//! - **Cache**: master key to device key mapping with disk snapshots
//! - **Sync**: background cache rebuild and key copies between devices
//! - **Tamper**: tamper line polling and lockdown fan-out

pub mod cache;
pub mod config;
pub mod device;
pub mod preprocessor;
pub mod protocol;
pub mod server;
pub mod settings;
pub mod sync;
pub mod tamper;
pub mod types;

pub use config::Args;
pub use preprocessor::RpcPreprocessor;
pub use types::{HsmError, Result};
