use thiserror::Error;

use crate::frame::CloseCode;

/// Library result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when opening or using a connection.
#[derive(Error, Debug)]
pub enum Error {
    #[error("frame: {0}")]
    Frame(#[from] FrameError),

    #[error("negotiation: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("extension: {0}")]
    Extension(#[from] ExtensionError),

    #[error("connection: {0}")]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    LockMisuse(#[from] LockMisuse),

    #[error("unauthenticated: no challenge handler answered for {location}")]
    Unauthenticated { location: String },

    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Close code a WebSocket should send when this error ends the connection.
    pub fn close_code(&self) -> CloseCode {
        match self {
            Self::Frame(FrameError::MessageTooLarge { .. }) => CloseCode::MessageTooBig,
            Self::Frame(_) | Self::Extension(_) => CloseCode::ProtocolError,
            Self::Connection(ConnectionError::Closed) => CloseCode::Normal,
            _ => CloseCode::InternalError,
        }
    }

    /// Whether the error leaves the connection unusable.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Unauthenticated { .. } | Self::IllegalArgument(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Connection(ConnectionError::Io(e))
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::Connection(ConnectionError::InvalidUrl(e.to_string()))
    }
}

/// Structural violations found while encoding or decoding a frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("unknown opcode {0:#x}")]
    UnknownOpcode(u8),

    #[error("control frame payload of {0} bytes exceeds 125")]
    ControlPayloadTooLarge(u64),

    #[error("fragmented control frame")]
    FragmentedControl,

    #[error("frame needs {needed} bytes but buffer holds {available}")]
    BufferTooSmall { needed: u64, available: usize },

    #[error("message of {size} bytes exceeds limit {limit}")]
    MessageTooLarge { size: usize, limit: usize },
}

/// Failures to agree on a protocol during connection establishment.
#[derive(Error, Debug)]
pub enum NegotiationError {
    #[error("unexpected HTTP status {0}")]
    UnexpectedStatus(u16),

    #[error("missing header {0}")]
    MissingHeader(&'static str),

    #[error("invalid header {name}: {value}")]
    InvalidHeader { name: &'static str, value: String },

    #[error("unrecognized strategy {0:?}")]
    UnknownStrategy(String),

    #[error("server chose strategy {0} which was not offered")]
    StrategyNotOffered(String),

    #[error("invalid Sec-WebSocket-Accept: expected {expected}, got {actual}")]
    InvalidAccept { expected: String, actual: String },

    #[error("server confirmed extension {0} which was not offered")]
    UnexpectedExtension(String),

    #[error("invalid location {0}")]
    InvalidLocation(String),
}

/// A fault raised by an extension hook.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtensionError {
    #[error("{extension}: {reason}")]
    Transform { extension: String, reason: String },

    #[error("invalid extension header {0:?}")]
    InvalidHeader(String),

    #[error("unknown extension {0}")]
    Unknown(String),
}

/// Connection-level errors.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("connection closed")]
    Closed,

    #[error("already connected")]
    AlreadyConnected,

    #[error("timeout")]
    Timeout,

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("sequence mismatch: expected {expected}, got {actual}")]
    Sequence { expected: u64, actual: u64 },

    #[error("unsupported scheme {0}")]
    UnsupportedScheme(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("redirect to {0} refused by policy")]
    RedirectRefused(String),

    #[error("too many redirects")]
    TooManyRedirects,

    #[error("http: {0}")]
    Http(String),

    #[error("closed by peer with code {code}: {reason}")]
    ClosedByPeer { code: u16, reason: String },
}

/// Unlock attempted by a thread that does not own the lock.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("lock released by a thread that does not own it")]
pub struct LockMisuse;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_codes_follow_error_kind() {
        let e = Error::from(FrameError::UnknownOpcode(3));
        assert_eq!(e.close_code(), CloseCode::ProtocolError);
        let e = Error::from(FrameError::MessageTooLarge { size: 10, limit: 5 });
        assert_eq!(e.close_code(), CloseCode::MessageTooBig);
        let e = Error::from(ExtensionError::Transform {
            extension: "x".into(),
            reason: "boom".into(),
        });
        assert_eq!(e.close_code(), CloseCode::ProtocolError);
        let e = Error::from(ConnectionError::Timeout);
        assert_eq!(e.close_code(), CloseCode::InternalError);
    }

    #[test]
    fn unauthenticated_is_not_fatal() {
        let e = Error::Unauthenticated {
            location: "a.b".into(),
        };
        assert!(!e.is_fatal());
        assert!(Error::from(LockMisuse).is_fatal());
    }
}
