//! Shared types

pub mod error;
pub mod secret;

pub use error::{HsmError, Result};
pub use secret::SecretBytes;
