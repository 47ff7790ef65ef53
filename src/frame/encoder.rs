//! Write view that emits encoded frames into caller-owned memory.

use bytes::BytesMut;

use super::mask::apply_mask;
use super::{
    Frame, Opcode, FIN_BIT, LEN_16_MARKER, LEN_16_MAX, LEN_64_MARKER, LEN_64_MAX, LEN_7_MAX,
    MASK_BIT, MAX_CONTROL_PAYLOAD,
};
use crate::error::FrameError;

fn header_len(payload_len: u64) -> usize {
    if payload_len <= LEN_7_MAX {
        2
    } else if payload_len <= LEN_16_MAX {
        4
    } else {
        10
    }
}

/// Bytes needed to encode a frame with this payload size.
pub fn encoded_len(payload_len: usize, masked: bool) -> usize {
    let mask_len = if masked { 4 } else { 0 };
    header_len(payload_len as u64) + mask_len + payload_len
}

fn check_frame(opcode: Opcode, fin: bool, payload_len: usize) -> Result<(), FrameError> {
    if opcode.is_control() {
        if !fin {
            return Err(FrameError::FragmentedControl);
        }
        if payload_len > MAX_CONTROL_PAYLOAD {
            return Err(FrameError::ControlPayloadTooLarge(payload_len as u64));
        }
    }
    if payload_len as u64 > LEN_64_MAX {
        return Err(FrameError::Malformed("payload too long".into()));
    }
    Ok(())
}

/// Write view over a caller-owned byte region, starting at `offset`.
pub struct FrameWriter<'a> {
    buf: &'a mut [u8],
    offset: usize,
}

impl<'a> FrameWriter<'a> {
    pub fn new(buf: &'a mut [u8], offset: usize) -> Self {
        Self { buf, offset }
    }

    /// Encode one frame at the current offset and advance past it.
    ///
    /// Returns the number of bytes written. The region is left untouched on error.
    pub fn write(
        &mut self,
        opcode: Opcode,
        fin: bool,
        flags: u8,
        payload: &[u8],
        mask: Option<[u8; 4]>,
    ) -> Result<usize, FrameError> {
        check_frame(opcode, fin, payload.len())?;
        let total = encoded_len(payload.len(), mask.is_some());
        let available = self.buf.len().saturating_sub(self.offset);
        if total > available {
            return Err(FrameError::BufferTooSmall {
                needed: total as u64,
                available,
            });
        }

        let out = &mut self.buf[self.offset..self.offset + total];
        let fin_bit = if fin { FIN_BIT } else { 0 };
        out[0] = fin_bit | ((flags & 0x07) << 4) | opcode as u8;
        let mask_bit = if mask.is_some() { MASK_BIT } else { 0 };
        let len = payload.len() as u64;
        let mut pos = match header_len(len) {
            2 => {
                out[1] = mask_bit | len as u8;
                2
            }
            4 => {
                out[1] = mask_bit | LEN_16_MARKER;
                out[2..4].copy_from_slice(&(len as u16).to_be_bytes());
                4
            }
            _ => {
                out[1] = mask_bit | LEN_64_MARKER;
                out[2..10].copy_from_slice(&len.to_be_bytes());
                10
            }
        };
        if let Some(key) = mask {
            out[pos..pos + 4].copy_from_slice(&key);
            pos += 4;
        }
        out[pos..].copy_from_slice(payload);
        if let Some(key) = mask {
            apply_mask(&mut out[pos..], key, 0);
        }

        self.offset += total;
        Ok(total)
    }

    /// Offset where the next frame will be written.
    pub fn position(&self) -> usize {
        self.offset
    }
}

/// Append `frame` to `out`, masking the payload with `mask` when given.
pub fn encode(frame: &Frame, mask: Option<[u8; 4]>, out: &mut BytesMut) -> Result<usize, FrameError> {
    check_frame(frame.opcode, frame.fin, frame.payload.len())?;
    let total = encoded_len(frame.payload.len(), mask.is_some());
    let start = out.len();
    out.resize(start + total, 0);
    FrameWriter::new(&mut out[..], start).write(
        frame.opcode,
        frame.fin,
        frame.flags,
        &frame.payload,
        mask,
    )
}
