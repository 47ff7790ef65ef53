//! Read view over an encoded frame.

use std::ops::Range;

use super::mask::apply_mask;
use super::{
    Frame, Opcode, FIN_BIT, FLAGS_MASK, LEN_16_MARKER, LEN_64_MARKER, LEN_64_MAX, LEN_MASK,
    MASK_BIT, MAX_CONTROL_PAYLOAD, OPCODE_MASK,
};
use crate::error::FrameError;

/// Length prefix of the frame starting at `offset`: (payload length, header bytes before mask).
fn read_length(buf: &[u8], offset: usize) -> Result<Option<(u64, usize)>, FrameError> {
    if buf.len() < offset + 2 {
        return Ok(None);
    }
    match buf[offset + 1] & LEN_MASK {
        LEN_16_MARKER => {
            if buf.len() < offset + 4 {
                return Ok(None);
            }
            let len = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as u64;
            Ok(Some((len, 4)))
        }
        LEN_64_MARKER => {
            if buf.len() < offset + 10 {
                return Ok(None);
            }
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[offset + 2..offset + 10]);
            let len = u64::from_be_bytes(b);
            if len > LEN_64_MAX {
                return Err(FrameError::Malformed(
                    "64-bit length with most significant bit set".into(),
                ));
            }
            Ok(Some((len, 10)))
        }
        short => Ok(Some((short as u64, 2))),
    }
}

/// Opcode and control-frame rules that the first two header bytes already decide.
///
/// A control frame whose 7-bit length field is 126 or 127 cannot fit in 125
/// bytes; the error carries the declared length when it is already readable.
fn check_head(buf: &[u8], offset: usize) -> Result<Opcode, FrameError> {
    let b0 = buf[offset];
    let opcode = Opcode::from_u8(b0 & OPCODE_MASK)?;
    if opcode.is_control() {
        if b0 & FIN_BIT == 0 {
            return Err(FrameError::FragmentedControl);
        }
        let short = buf[offset + 1] & LEN_MASK;
        if short as usize > MAX_CONTROL_PAYLOAD {
            let declared = read_length(buf, offset)?.map_or(short as u64, |(len, _)| len);
            return Err(FrameError::ControlPayloadTooLarge(declared));
        }
    }
    Ok(opcode)
}

/// Total encoded size of the frame at `offset`, or `None` while its header is incomplete.
///
/// A header that can never become a valid frame fails as soon as its first
/// two bytes are present, without waiting for the payload.
pub fn peek_frame_len(buf: &[u8], offset: usize) -> Result<Option<usize>, FrameError> {
    if buf.len() < offset + 2 {
        return Ok(None);
    }
    check_head(buf, offset)?;
    let Some((len, header)) = read_length(buf, offset)? else {
        return Ok(None);
    };
    let mask_len = if buf[offset + 1] & MASK_BIT != 0 { 4 } else { 0 };
    let total = (header as u64 + mask_len)
        .checked_add(len)
        .and_then(|t| usize::try_from(t).ok())
        .ok_or_else(|| FrameError::Malformed("frame length overflows address space".into()))?;
    Ok(Some(total))
}

/// A bounds-checked, non-owning view of one frame inside a caller's buffer.
///
/// The view is valid only while the buffer it borrows is; reusing the buffer
/// for the next frame ends its lifetime.
#[derive(Clone, Copy, Debug)]
pub struct FrameRef<'a> {
    buf: &'a [u8],
    offset: usize,
    opcode: Opcode,
    payload_offset: usize,
    payload_length: usize,
    mask: Option<[u8; 4]>,
}

impl<'a> FrameRef<'a> {
    /// Validate the frame starting at `offset` and return a view of it.
    pub fn parse(buf: &'a [u8], offset: usize) -> Result<Self, FrameError> {
        let (len, header) = read_length(buf, offset)?.ok_or(FrameError::BufferTooSmall {
            needed: offset as u64 + 2,
            available: buf.len(),
        })?;
        let b1 = buf[offset + 1];
        let opcode = check_head(buf, offset)?;
        if header == 4 && len <= super::LEN_7_MAX || header == 10 && len <= super::LEN_16_MAX {
            return Err(FrameError::Malformed("non-minimal length encoding".into()));
        }

        let masked = b1 & MASK_BIT != 0;
        let mask_len = if masked { 4 } else { 0 };
        let payload_offset = offset + header + mask_len;
        let limit = (payload_offset as u64).checked_add(len);
        match limit {
            Some(limit) if limit <= buf.len() as u64 => {}
            _ => {
                return Err(FrameError::BufferTooSmall {
                    needed: (payload_offset as u64).saturating_add(len),
                    available: buf.len(),
                })
            }
        }

        let mask = masked.then(|| {
            let m = &buf[payload_offset - 4..payload_offset];
            [m[0], m[1], m[2], m[3]]
        });

        Ok(Self {
            buf,
            offset,
            opcode,
            payload_offset,
            payload_length: len as usize,
            mask,
        })
    }

    pub fn fin(&self) -> bool {
        self.buf[self.offset] & FIN_BIT != 0
    }

    /// Reserved bits RSV1..RSV3 as a 3-bit value.
    pub fn flags(&self) -> u8 {
        (self.buf[self.offset] & FLAGS_MASK) >> 4
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn payload_offset(&self) -> usize {
        self.payload_offset
    }

    pub fn payload_length(&self) -> usize {
        self.payload_length
    }

    /// One past the last byte of this frame; the next frame starts here.
    pub fn limit(&self) -> usize {
        self.payload_offset + self.payload_length
    }

    pub fn mask(&self) -> Option<[u8; 4]> {
        self.mask
    }

    /// Payload bytes as they sit in the buffer (still masked if `mask()` is set).
    pub fn raw_payload(&self) -> &'a [u8] {
        &self.buf[self.payload_offset..self.limit()]
    }

    /// Copy the unmasked payload bytes in `range` into `dst`; returns the count copied.
    pub fn copy_payload(&self, range: Range<usize>, dst: &mut [u8]) -> Result<usize, FrameError> {
        if range.start > range.end || range.end > self.payload_length {
            return Err(FrameError::Malformed(format!(
                "payload range {:?} outside 0..{}",
                range, self.payload_length
            )));
        }
        let n = (range.end - range.start).min(dst.len());
        let src = &self.raw_payload()[range.start..range.start + n];
        dst[..n].copy_from_slice(src);
        if let Some(key) = self.mask {
            apply_mask(&mut dst[..n], key, range.start);
        }
        Ok(n)
    }

    /// Unmasked copy of the whole payload.
    pub fn payload_vec(&self) -> Vec<u8> {
        let mut out = self.raw_payload().to_vec();
        if let Some(key) = self.mask {
            apply_mask(&mut out, key, 0);
        }
        out
    }

    /// Owned frame for the extension pipeline.
    pub fn to_frame(&self) -> Frame {
        Frame {
            fin: self.fin(),
            flags: self.flags(),
            opcode: self.opcode,
            payload: self.payload_vec().into(),
        }
    }
}
