//! XDR encoding used by the alpha RPC protocol
//!
//! Only the two primitives the protocol needs: big-endian u32 and
//! variable-length opaque data padded to a four byte boundary.

use bytes::{BufMut, BytesMut};

use crate::types::{HsmError, Result};

/// Padding needed to bring `len` up to a multiple of four
pub fn pad_len(len: usize) -> usize {
    (4 - len % 4) % 4
}

/// Append-only XDR packet builder
#[derive(Debug, Default)]
pub struct XdrWriter {
    buf: BytesMut,
}

impl XdrWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.buf.put_u32(value);
        self
    }

    pub fn put_opaque(&mut self, data: &[u8]) -> &mut Self {
        self.buf.put_u32(data.len() as u32);
        self.buf.put_slice(data);
        self.buf.put_bytes(0, pad_len(data.len()));
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

/// Cursor over a received XDR packet
#[derive(Debug, Clone)]
pub struct XdrReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> XdrReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn get_opaque(&mut self) -> Result<&'a [u8]> {
        let len = self.get_u32()? as usize;
        let data = self.take(len)?;
        self.take(pad_len(len))?;
        Ok(data)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(HsmError::BadRequest(format!(
                "truncated packet: wanted {} bytes at offset {}, have {}",
                len,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }
}

/// Read the u32 stored at `offset`
pub fn read_u32_at(packet: &[u8], offset: usize) -> Result<u32> {
    let mut reader = XdrReader::new(packet);
    reader.take(offset)?;
    reader.get_u32()
}

/// Overwrite the u32 stored at `offset`
pub fn write_u32_at(packet: &mut [u8], offset: usize, value: u32) -> Result<()> {
    let field = packet.get_mut(offset..offset + 4).ok_or_else(|| {
        HsmError::BadRequest(format!("no u32 field at offset {}", offset))
    })?;
    field.copy_from_slice(&value.to_be_bytes());
    Ok(())
}
