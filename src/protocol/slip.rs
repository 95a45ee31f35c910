//! SLIP byte stuffing (RFC 1055) as spoken by the Cryptech mux
//!
//! Frames are written as `END payload END`; readers split on `END` and
//! discard the empty frames produced by back-to-back delimiters.

use bytes::{Buf, BytesMut};
use tracing::warn;

pub const END: u8 = 0xC0;
pub const ESC: u8 = 0xDB;
pub const ESC_END: u8 = 0xDC;
pub const ESC_ESC: u8 = 0xDD;

/// Stuff `payload` and wrap it in frame delimiters
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + payload.len() / 8 + 2);
    out.push(END);
    for &byte in payload {
        match byte {
            END => out.extend_from_slice(&[ESC, ESC_END]),
            ESC => out.extend_from_slice(&[ESC, ESC_ESC]),
            other => out.push(other),
        }
    }
    out.push(END);
    out
}

/// Undo byte stuffing on one frame body (delimiters already stripped)
pub fn decode(frame: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(frame.len());
    let mut iter = frame.iter().copied().peekable();
    while let Some(byte) = iter.next() {
        if byte != ESC {
            out.push(byte);
            continue;
        }
        match iter.peek().copied() {
            Some(ESC_END) => {
                iter.next();
                out.push(END);
            }
            Some(ESC_ESC) => {
                iter.next();
                out.push(ESC);
            }
            // unknown escape sequences pass through untouched
            _ => out.push(ESC),
        }
    }
    out
}

/// Longest stuffed frame body accepted before the decoder gives up on it
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Incremental frame splitter for a byte stream.
///
/// Only bytes not yet searched are scanned for `END`. A frame that grows
/// past [`MAX_FRAME_LEN`] is dropped, along with the rest of it up to the
/// next delimiter.
#[derive(Debug, Default)]
pub struct SlipDecoder {
    pending: BytesMut,
    /// Leading bytes of `pending` already known to hold no `END`
    scanned: usize,
    discarding: bool,
}

impl SlipDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes from the stream
    pub fn extend(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
        if self.pending.len() > MAX_FRAME_LEN && self.find_end().is_none() {
            self.drop_oversized();
        }
    }

    /// Next complete, non-empty, decoded frame if one is buffered
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            let Some(end) = self.find_end() else {
                self.drop_oversized();
                return None;
            };
            let raw = self.pending.split_to(end);
            self.pending.advance(1);
            self.scanned = 0;

            if std::mem::take(&mut self.discarding) {
                continue;
            }
            if raw.len() > MAX_FRAME_LEN {
                warn!(len = raw.len(), "Dropping oversized SLIP frame");
                continue;
            }
            if !raw.is_empty() {
                return Some(decode(&raw));
            }
        }
    }

    /// Bytes received after the last delimiter
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Whether the decoder is skipping the tail of an oversized frame
    pub fn is_discarding(&self) -> bool {
        self.discarding
    }

    fn find_end(&mut self) -> Option<usize> {
        match self.pending[self.scanned..].iter().position(|&b| b == END) {
            Some(offset) => Some(self.scanned + offset),
            None => {
                self.scanned = self.pending.len();
                None
            }
        }
    }

    /// Call only when `pending` holds no delimiter
    fn drop_oversized(&mut self) {
        if self.pending.len() <= MAX_FRAME_LEN {
            return;
        }
        if !self.discarding {
            warn!(len = self.pending.len(), "Unterminated SLIP frame too long, discarding");
        }
        self.pending.clear();
        self.scanned = 0;
        self.discarding = true;
    }
}
