//! Packet builders and parsers for the requests and replies the gateway
//! has to look inside of or synthesize itself

use uuid::Uuid;

use super::codes::{HalError, HalUser, RpcFunc};
use super::xdr::{pad_len, write_u32_at, XdrReader, XdrWriter};
use crate::types::{HsmError, Result};

/// Offset of the client handle inside every request and reply
pub const HANDLE_OFFSET: usize = 4;

/// Smallest packet that carries a function code and a client handle
pub const MIN_PACKET_LEN: usize = 8;

/// Function code and client handle that open every packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub code: u32,
    pub handle: u32,
}

impl PacketHeader {
    pub fn parse(packet: &[u8]) -> Result<Self> {
        let mut r = XdrReader::new(packet);
        Ok(Self {
            code: r.get_u32()?,
            handle: r.get_u32()?,
        })
    }
}

/// Header plus status of a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyHeader {
    pub code: u32,
    pub handle: u32,
    pub status: u32,
}

impl ReplyHeader {
    pub fn parse(reply: &[u8]) -> Result<Self> {
        let mut r = XdrReader::new(reply);
        Ok(Self {
            code: r.get_u32()?,
            handle: r.get_u32()?,
            status: r.get_u32()?,
        })
    }

    pub fn is_ok(&self) -> bool {
        self.status == HalError::Ok.code()
    }
}

/// Replace the client handle in place, returning the previous one
pub fn swap_client_handle(packet: &mut [u8], handle: u32) -> Result<u32> {
    let previous = PacketHeader::parse(packet)?.handle;
    write_u32_at(packet, HANDLE_OFFSET, handle)?;
    Ok(previous)
}

pub fn error_reply(code: u32, handle: u32, status: u32) -> Vec<u8> {
    let mut w = XdrWriter::with_capacity(12);
    w.put_u32(code).put_u32(handle).put_u32(status);
    w.finish()
}

/// Start of a locally generated OK reply; callers append the payload
pub fn ok_reply_writer(code: u32, handle: u32) -> XdrWriter {
    let mut w = XdrWriter::new();
    w.put_u32(code).put_u32(handle).put_u32(HalError::Ok.code());
    w
}

pub fn uuid_from_wire(bytes: &[u8]) -> Result<Uuid> {
    Uuid::from_slice(bytes)
        .map_err(|_| HsmError::BadRequest(format!("uuid field has {} bytes", bytes.len())))
}

/// Reply to a key-creating call: handle of the open key plus its identity
pub fn keygen_result(code: u32, handle: u32, status: u32, key_handle: u32, uuid: &Uuid) -> Vec<u8> {
    let mut w = XdrWriter::with_capacity(36);
    w.put_u32(code)
        .put_u32(handle)
        .put_u32(status)
        .put_u32(key_handle)
        .put_opaque(uuid.as_bytes());
    w.finish()
}

/// Key handle and identity carried by a successful key-creating reply
pub fn parse_keygen_result(reply: &[u8]) -> Result<(ReplyHeader, u32, Uuid)> {
    let header = ReplyHeader::parse(reply)?;
    let mut r = XdrReader::new(reply);
    r.get_u32()?;
    r.get_u32()?;
    r.get_u32()?;
    let key_handle = r.get_u32()?;
    let uuid = uuid_from_wire(r.get_opaque()?)?;
    Ok((header, key_handle, uuid))
}

pub fn pkey_open_request(handle: u32, session: u32, uuid: &Uuid) -> Vec<u8> {
    let mut w = XdrWriter::with_capacity(36);
    w.put_u32(RpcFunc::PkeyOpen.code())
        .put_u32(handle)
        .put_u32(session)
        .put_opaque(uuid.as_bytes());
    w.finish()
}

/// Byte offset of the flags word in a key generation request
pub fn keygen_flag_offset(func: RpcFunc, request: &[u8]) -> Result<usize> {
    match func {
        RpcFunc::PkeyGenerateRsa => {
            // code, handle, session, key length, then the exponent
            let mut r = XdrReader::new(request);
            for _ in 0..4 {
                r.get_u32()?;
            }
            let exponent = r.get_opaque()?;
            Ok(20 + exponent.len() + pad_len(exponent.len()))
        }
        RpcFunc::PkeyGenerateEc => Ok(16),
        RpcFunc::PkeyGenerateHashsig => Ok(24),
        other => Err(HsmError::BadRequest(format!(
            "{:?} is not a key generation call",
            other
        ))),
    }
}

// =============================================================================
// Key matching
// =============================================================================

/// Decoded PKEY_MATCH request body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMatchRequest {
    pub session: u32,
    pub key_type: u32,
    pub curve: u32,
    pub mask: u32,
    pub flags: u32,
    pub attributes: Vec<(u32, Vec<u8>)>,
    pub state: u32,
    pub result_max: u32,
    pub previous: Uuid,
}

impl KeyMatchRequest {
    /// Match everything, starting from the beginning
    pub fn all(session: u32, result_max: u32) -> Self {
        Self {
            session,
            key_type: 0,
            curve: 0,
            mask: 0,
            flags: 0,
            attributes: Vec::new(),
            state: 0,
            result_max,
            previous: Uuid::nil(),
        }
    }

    /// Parse a full request, header included
    pub fn parse(request: &[u8]) -> Result<Self> {
        let mut r = XdrReader::new(request);
        r.get_u32()?;
        r.get_u32()?;

        let session = r.get_u32()?;
        let key_type = r.get_u32()?;
        let curve = r.get_u32()?;
        let mask = r.get_u32()?;
        let flags = r.get_u32()?;

        let attr_count = r.get_u32()?;
        let mut attributes = Vec::new();
        for _ in 0..attr_count {
            let attr_type = r.get_u32()?;
            attributes.push((attr_type, r.get_opaque()?.to_vec()));
        }

        Ok(Self {
            session,
            key_type,
            curve,
            mask,
            flags,
            attributes,
            state: r.get_u32()?,
            result_max: r.get_u32()?,
            previous: uuid_from_wire(r.get_opaque()?)?,
        })
    }

    pub fn encode(&self, handle: u32) -> Vec<u8> {
        let mut w = XdrWriter::new();
        w.put_u32(RpcFunc::PkeyMatch.code())
            .put_u32(handle)
            .put_u32(self.session)
            .put_u32(self.key_type)
            .put_u32(self.curve)
            .put_u32(self.mask)
            .put_u32(self.flags)
            .put_u32(self.attributes.len() as u32);
        for (attr_type, value) in &self.attributes {
            w.put_u32(*attr_type).put_opaque(value);
        }
        w.put_u32(self.state)
            .put_u32(self.result_max)
            .put_opaque(self.previous.as_bytes());
        w.finish()
    }
}

/// Decoded PKEY_MATCH reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMatchReply {
    pub header: ReplyHeader,
    pub state: u32,
    pub uuids: Vec<Uuid>,
}

impl KeyMatchReply {
    /// Parse a reply; the payload is only read when the status is OK
    pub fn parse(reply: &[u8]) -> Result<Self> {
        let header = ReplyHeader::parse(reply)?;
        if !header.is_ok() {
            return Ok(Self {
                header,
                state: 0,
                uuids: Vec::new(),
            });
        }

        let mut r = XdrReader::new(reply);
        for _ in 0..3 {
            r.get_u32()?;
        }
        let state = r.get_u32()?;
        let count = r.get_u32()?;
        let mut uuids = Vec::new();
        for _ in 0..count {
            uuids.push(uuid_from_wire(r.get_opaque()?)?);
        }

        Ok(Self {
            header,
            state,
            uuids,
        })
    }

    /// Build a reply, truncating the list to `result_max`
    pub fn encode(code: u32, handle: u32, state: u32, uuids: &[Uuid], result_max: u32) -> Vec<u8> {
        let count = uuids.len().min(result_max as usize);
        let mut w = ok_reply_writer(code, handle);
        w.put_u32(state).put_u32(count as u32);
        for uuid in &uuids[..count] {
            w.put_opaque(uuid.as_bytes());
        }
        w.finish()
    }
}

// =============================================================================
// Requests issued by the gateway itself
// =============================================================================

pub fn logout_request(handle: u32) -> Vec<u8> {
    let mut w = XdrWriter::with_capacity(8);
    w.put_u32(RpcFunc::Logout.code()).put_u32(handle);
    w.finish()
}

pub fn login_request(handle: u32, user: HalUser, pin: &[u8]) -> Vec<u8> {
    let mut w = XdrWriter::new();
    w.put_u32(RpcFunc::Login.code())
        .put_u32(handle)
        .put_u32(user as u32)
        .put_opaque(pin);
    w.finish()
}

/// Requests that only carry a key handle (close, delete, type, flags)
pub fn pkey_handle_request(func: RpcFunc, handle: u32, pkey: u32) -> Vec<u8> {
    let mut w = XdrWriter::with_capacity(12);
    w.put_u32(func.code()).put_u32(handle).put_u32(pkey);
    w.finish()
}

pub fn get_public_key_request(handle: u32, pkey: u32, der_max: u32) -> Vec<u8> {
    let mut w = XdrWriter::with_capacity(16);
    w.put_u32(RpcFunc::PkeyGetPublicKey.code())
        .put_u32(handle)
        .put_u32(pkey)
        .put_u32(der_max);
    w.finish()
}

pub fn pkey_load_request(handle: u32, session: u32, der: &[u8], flags: u32) -> Vec<u8> {
    let mut w = XdrWriter::new();
    w.put_u32(RpcFunc::PkeyLoad.code())
        .put_u32(handle)
        .put_u32(session)
        .put_opaque(der)
        .put_u32(flags);
    w.finish()
}

pub fn generate_rsa_request(
    handle: u32,
    session: u32,
    key_len: u32,
    exponent: &[u8],
    flags: u32,
) -> Vec<u8> {
    let mut w = XdrWriter::new();
    w.put_u32(RpcFunc::PkeyGenerateRsa.code())
        .put_u32(handle)
        .put_u32(session)
        .put_u32(key_len)
        .put_opaque(exponent)
        .put_u32(flags);
    w.finish()
}

pub fn pkey_export_request(handle: u32, pkey: u32, kekek: u32, pkcs8_max: u32, kek_max: u32) -> Vec<u8> {
    let mut w = XdrWriter::with_capacity(24);
    w.put_u32(RpcFunc::PkeyExport.code())
        .put_u32(handle)
        .put_u32(pkey)
        .put_u32(kekek)
        .put_u32(pkcs8_max)
        .put_u32(kek_max);
    w.finish()
}

pub fn pkey_import_request(
    handle: u32,
    session: u32,
    kekek: u32,
    pkcs8: &[u8],
    kek: &[u8],
    flags: u32,
) -> Vec<u8> {
    let mut w = XdrWriter::new();
    w.put_u32(RpcFunc::PkeyImport.code())
        .put_u32(handle)
        .put_u32(session)
        .put_u32(kekek)
        .put_opaque(pkcs8)
        .put_opaque(kek)
        .put_u32(flags);
    w.finish()
}

/// Reader positioned at the payload of an OK reply, or the device status as an error
pub fn ok_payload(reply: &[u8]) -> Result<XdrReader<'_>> {
    let header = ReplyHeader::parse(reply)?;
    if !header.is_ok() {
        return Err(match HalError::from_code(header.status) {
            Some(status) => HsmError::Hal(status),
            None => HsmError::Transport(format!("unknown device status {}", header.status)),
        });
    }
    let mut r = XdrReader::new(reply);
    for _ in 0..3 {
        r.get_u32()?;
    }
    Ok(r)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::xdr::read_u32_at;

    #[test]
    fn test_swap_client_handle() {
        let mut packet = error_reply(3, 0x11, 0);
        let old = swap_client_handle(&mut packet, 0x22).unwrap();
        assert_eq!(old, 0x11);
        assert_eq!(PacketHeader::parse(&packet).unwrap().handle, 0x22);
    }

    #[test]
    fn test_rsa_flag_offset_accounts_for_exponent_padding() {
        let request = generate_rsa_request(1, 2, 2048, &[0x01, 0x00, 0x01], 0x8);
        let offset = keygen_flag_offset(RpcFunc::PkeyGenerateRsa, &request).unwrap();
        assert_eq!(offset, 20 + 3 + 1);
        assert_eq!(read_u32_at(&request, offset).unwrap(), 0x8);
    }

    #[test]
    fn test_match_request_survives_reencoding() {
        let mut request = KeyMatchRequest::all(9, 64);
        request.mask = 0x20;
        request.flags = 0x20;
        request.attributes.push((0x100, b"label".to_vec()));
        request.previous = Uuid::new_v4();

        let parsed = KeyMatchRequest::parse(&request.encode(5)).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn test_match_reply_truncates_to_max() {
        let uuids: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
        let reply = KeyMatchReply::encode(25, 1, 0, &uuids, 3);
        let parsed = KeyMatchReply::parse(&reply).unwrap();
        assert_eq!(parsed.uuids, uuids[..3].to_vec());
    }

    #[test]
    fn test_ok_payload_surfaces_device_status() {
        let reply = error_reply(3, 1, HalError::PinIncorrect.code());
        assert!(matches!(
            ok_payload(&reply),
            Err(HsmError::Hal(HalError::PinIncorrect))
        ));
    }
}
