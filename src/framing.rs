//! Frame decoding for the sector-aligned transport byte channel.
//!
//! The transport delivers opaque blocks with a 512-byte minimum unit;
//! command frames are `[opcode][len][payload]` and do not align to block
//! boundaries. The decoder keeps an append-only buffer, yields complete
//! frames, and retains partial trailing bytes for the next fill.
//!
//! Drain rule: bytes at or below [`MIN_DECODE_BYTES`] are never consumed,
//! only re-examined after the next feed. The original firmware could eat a
//! stray byte when data sat below the threshold across fills; here the
//! cursor only ever advances by whole frames (or by the declared length of
//! a malformed one), which makes re-synchronization deterministic.

use heapless::Vec;
use thiserror::Error;
use tracing::warn;

use crate::opcodes::{Opcode, MIN_DECODE_BYTES, SECTOR_SIZE};

/// Receive buffer, sized for a few transport sectors ahead of the
/// processor.
pub const RX_BUF_SIZE: usize = 4 * SECTOR_SIZE;

/// Largest payload a one-byte length field can declare.
pub const MAX_PAYLOAD: usize = 255;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("opcode 0x{opcode:02x} is not in the defined set")]
    InvalidOpcode { opcode: u8 },
    #[error("opcode 0x{opcode:02x} declared payload length {len} outside its size class")]
    InvalidLength { opcode: u8, len: usize },
    #[error("byte stream truncated mid-frame")]
    Truncated,
    #[error("response carried unknown error code 0x{code:02x}")]
    BadErrorCode { code: u8 },
}

/// One decoded command frame, transient, one per transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    pub opcode: Opcode,
    pub payload: Vec<u8, MAX_PAYLOAD>,
}

impl CommandFrame {
    pub fn new(opcode: Opcode) -> Self {
        CommandFrame {
            opcode,
            payload: Vec::new(),
        }
    }
}

/// Incremental decoder over the transport byte stream.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8, RX_BUF_SIZE>,
    pos: usize,
    /// Remaining payload bytes of a malformed frame still to discard.
    pending_skip: usize,
    /// After a TERMINATOR, zero bytes are sector padding and are consumed
    /// silently until the next nonzero byte.
    in_padding: bool,
    dropped_bytes: u32,
}

impl FrameDecoder {
    pub fn new() -> Self {
        FrameDecoder {
            buf: Vec::new(),
            pos: 0,
            pending_skip: 0,
            in_padding: false,
            dropped_bytes: 0,
        }
    }

    /// Append transport bytes. Returns the number of bytes accepted;
    /// overflow beyond the receive buffer is dropped and counted.
    pub fn feed(&mut self, bytes: &[u8]) -> usize {
        self.compact();
        let room = RX_BUF_SIZE - self.buf.len();
        let take = bytes.len().min(room);
        // Cannot fail: take is bounded by remaining capacity
        let _ = self.buf.extend_from_slice(&bytes[..take]);
        if take < bytes.len() {
            let dropped = (bytes.len() - take) as u32;
            self.dropped_bytes += dropped;
            warn!(dropped, "receive buffer overflow, transport bytes dropped");
        }
        take
    }

    /// Bytes currently buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn dropped_bytes(&self) -> u32 {
        self.dropped_bytes
    }

    /// Discard everything buffered. Used by RESET.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.pos = 0;
        self.pending_skip = 0;
        self.in_padding = false;
    }

    /// Decode the next complete frame, if any. `Some(Err(_))` reports a
    /// malformed frame whose bytes have already been stepped over.
    pub fn next_frame(&mut self) -> Option<Result<CommandFrame, FrameError>> {
        // Finish discarding a malformed frame's declared payload first.
        if self.pending_skip > 0 {
            let take = self.pending_skip.min(self.buffered());
            self.pos += take;
            self.pending_skip -= take;
            if self.pending_skip > 0 {
                return None;
            }
        }

        if self.in_padding {
            while self.buffered() > 0 && self.buf[self.pos] == 0 {
                self.pos += 1;
            }
            if self.buffered() == 0 {
                return None;
            }
            self.in_padding = false;
        }

        // Sub-threshold bytes are retained untouched until the next feed.
        if self.buffered() < MIN_DECODE_BYTES {
            return None;
        }

        let op_byte = self.buf[self.pos];
        if op_byte == 0 {
            self.pos += 1;
            self.in_padding = true;
            return Some(Ok(CommandFrame::new(Opcode::Terminator)));
        }

        let len = self.buf[self.pos + 1] as usize;
        let Some(opcode) = Opcode::from_u7(op_byte) else {
            // Advance past the malformed frame using its declared length;
            // bytes not yet received are discarded as they arrive.
            let have = len.min(self.buffered() - 2);
            self.pos += 2 + have;
            self.pending_skip = len - have;
            return Some(Err(FrameError::InvalidOpcode { opcode: op_byte }));
        };

        if self.buffered() < 2 + len {
            return None;
        }

        if !opcode.payload_len().accepts(len) {
            self.pos += 2 + len;
            return Some(Err(FrameError::InvalidLength {
                opcode: op_byte,
                len,
            }));
        }

        let mut frame = CommandFrame::new(opcode);
        // Cannot fail: len <= MAX_PAYLOAD by construction of the length byte
        let _ = frame
            .payload
            .extend_from_slice(&self.buf[self.pos + 2..self.pos + 2 + len]);
        self.pos += 2 + len;
        Some(Ok(frame))
    }

    fn compact(&mut self) {
        if self.pos == 0 {
            return;
        }
        let remaining = self.buf.len() - self.pos;
        self.buf.copy_within(self.pos.., 0);
        self.buf.truncate(remaining);
        self.pos = 0;
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Host-side frame builder.
pub fn encode_frame(opcode: Opcode, payload: &[u8]) -> std::vec::Vec<u8> {
    debug_assert!(payload.len() <= MAX_PAYLOAD);
    debug_assert!(opcode.payload_len().accepts(payload.len()));
    let mut out = std::vec::Vec::with_capacity(2 + payload.len());
    if opcode == Opcode::Terminator {
        out.push(0);
        return out;
    }
    out.push(opcode.as_u8());
    out.push(payload.len() as u8);
    out.extend_from_slice(payload);
    out
}

/// Zero-pad a byte block up to the next whole transport sector.
pub fn pad_to_sector(buf: &mut std::vec::Vec<u8>) {
    let rem = buf.len() % SECTOR_SIZE;
    if rem != 0 || buf.is_empty() {
        buf.resize(buf.len() + (SECTOR_SIZE - rem), 0);
    }
}
