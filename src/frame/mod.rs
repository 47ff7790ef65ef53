//! WebSocket frame codec (RFC 6455 section 5).
//!
//! [`FrameRef`] is a read view and [`FrameWriter`] a write view over byte
//! regions owned by the caller; neither copies the payload. [`Frame`] is the
//! owned form handed to the extension pipeline.

mod decoder;
mod encoder;
pub mod mask;

pub use decoder::{peek_frame_len, FrameRef};
pub use encoder::{encode, encoded_len, FrameWriter};

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::FrameError;

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Largest payload that fits the 7-bit length form.
pub(crate) const LEN_7_MAX: u64 = 125;

/// Largest payload that fits the 16-bit length form.
pub(crate) const LEN_16_MAX: u64 = 0xFFFF;

/// Largest payload the 64-bit length form may declare (top bit must be clear).
pub(crate) const LEN_64_MAX: u64 = i64::MAX as u64;

pub(crate) const FIN_BIT: u8 = 0x80;
pub(crate) const FLAGS_MASK: u8 = 0x70;
pub(crate) const OPCODE_MASK: u8 = 0x0F;
pub(crate) const MASK_BIT: u8 = 0x80;
pub(crate) const LEN_MASK: u8 = 0x7F;
pub(crate) const LEN_16_MARKER: u8 = 126;
pub(crate) const LEN_64_MARKER: u8 = 127;

/// Frame opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Result<Self, FrameError> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            other => Err(FrameError::UnknownOpcode(other)),
        }
    }

    /// Close, ping and pong.
    pub fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }

    pub fn is_data(self) -> bool {
        !self.is_control()
    }
}

/// Close status codes (RFC 6455 section 7.4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CloseCode {
    Normal = 1000,
    GoingAway = 1001,
    ProtocolError = 1002,
    UnsupportedData = 1003,
    NoStatus = 1005,
    Abnormal = 1006,
    InvalidPayload = 1007,
    PolicyViolation = 1008,
    MessageTooBig = 1009,
    MandatoryExtension = 1010,
    InternalError = 1011,
}

impl CloseCode {
    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            1000 => Some(Self::Normal),
            1001 => Some(Self::GoingAway),
            1002 => Some(Self::ProtocolError),
            1003 => Some(Self::UnsupportedData),
            1005 => Some(Self::NoStatus),
            1006 => Some(Self::Abnormal),
            1007 => Some(Self::InvalidPayload),
            1008 => Some(Self::PolicyViolation),
            1009 => Some(Self::MessageTooBig),
            1010 => Some(Self::MandatoryExtension),
            1011 => Some(Self::InternalError),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// An owned frame: header fields plus unmasked payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    /// RSV1..RSV3 as a 3-bit value (RSV1 is the high bit).
    pub flags: u8,
    pub opcode: Opcode,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(opcode: Opcode, fin: bool, payload: impl Into<Bytes>) -> Self {
        Self {
            fin,
            flags: 0,
            opcode,
            payload: payload.into(),
        }
    }

    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Text, true, payload)
    }

    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Binary, true, payload)
    }

    pub fn continuation(fin: bool, payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Continuation, fin, payload)
    }

    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Ping, true, payload)
    }

    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Pong, true, payload)
    }

    /// Close frame with a status code and UTF-8 reason, truncated to fit 125 bytes.
    pub fn close(code: CloseCode, reason: &str) -> Self {
        let mut reason_len = reason.len().min(MAX_CONTROL_PAYLOAD - 2);
        while !reason.is_char_boundary(reason_len) {
            reason_len -= 1;
        }
        let mut buf = BytesMut::with_capacity(2 + reason_len);
        buf.put_u16(code.as_u16());
        buf.put_slice(&reason.as_bytes()[..reason_len]);
        Self::new(Opcode::Close, true, buf.freeze())
    }

    pub fn with_flags(mut self, flags: u8) -> Self {
        self.flags = flags & 0x07;
        self
    }

    pub fn is_control(&self) -> bool {
        self.opcode.is_control()
    }

    /// Status code and reason of a close frame. An empty payload yields `NoStatus`.
    pub fn close_reason(&self) -> Result<(u16, String), FrameError> {
        match self.payload.len() {
            0 => Ok((CloseCode::NoStatus.as_u16(), String::new())),
            1 => Err(FrameError::Malformed("close payload of 1 byte".into())),
            _ => {
                let code = u16::from_be_bytes([self.payload[0], self.payload[1]]);
                let reason = std::str::from_utf8(&self.payload[2..])
                    .map_err(|e| FrameError::Malformed(format!("close reason: {}", e)))?;
                Ok((code, reason.to_string()))
            }
        }
    }
}
