//! Alpha RPC wire protocol
//!
//! XDR-encoded packets carried in SLIP frames. Every request starts with a
//! function code and a client handle; every reply repeats both and adds a
//! HAL status word before the payload.

pub mod codes;
pub mod packets;
pub mod slip;
pub mod xdr;

pub use codes::{key_flags, HalError, HalUser, KeyType, RpcFunc};
pub use packets::{KeyMatchReply, KeyMatchRequest, PacketHeader, ReplyHeader};
pub use xdr::{XdrReader, XdrWriter};
