//! Alpha device sessions
//!
//! - `state`: operational state and load counters
//! - `transport`: SLIP-framed byte streams (serial node or TCP bridge)
//! - `session`: per-device worker serializing all exchanges

pub mod session;
pub mod state;
pub mod transport;

pub use session::DeviceSession;
pub use state::{DeviceState, DeviceStatus};
pub use transport::{DeviceTransport, SerialConnector, SlipStream, TcpConnector, TransportConnector};
