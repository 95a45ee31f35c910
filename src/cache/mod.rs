//! Key-location cache
//!
//! Maps each logical (master) key to the device-local keys that hold its
//! material, so handle- and uuid-addressed calls can be routed without
//! asking the hardware.

pub mod snapshot;
pub mod store;

pub use store::{DeviceKeyRecord, KeyCache, MasterKeyRecord};
