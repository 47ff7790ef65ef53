//! BBOSH: a byte stream carried over plain HTTP round trips.
//!
//! The client POSTs to a factory URL offering strategies in `X-Accept-Strategy`.
//! The factory answers `201 Created` with the instance `Location` and the
//! chosen `X-Strategy`. Afterwards every request to the instance carries the
//! next `X-Sequence-No`, which the server echoes back.

mod connection;
mod socket;
mod strategy;

pub use connection::BboshConnection;
pub use strategy::{BboshStrategy, DEFAULT_LONG_POLLING_REQUESTS};

use url::Url;

pub const PROTOCOL: &str = "bbosh/1.0";
pub const HEADER_PROTOCOL: &str = "X-Protocol";
pub const HEADER_SEQUENCE_NO: &str = "X-Sequence-No";
pub const HEADER_ACCEPT_STRATEGY: &str = "X-Accept-Strategy";
pub const HEADER_STRATEGY: &str = "X-Strategy";
pub const CONTENT_TYPE: &str = "application/octet-stream";

/// A negotiated BBOSH instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BboshSession {
    pub factory_url: Url,
    pub instance_url: Url,
    pub strategy: BboshStrategy,
    sequence: u64,
}

impl BboshSession {
    pub fn new(factory_url: Url, instance_url: Url, strategy: BboshStrategy, sequence: u64) -> Self {
        Self {
            factory_url,
            instance_url,
            strategy,
            sequence,
        }
    }

    /// Last sequence number used.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Advance and return the sequence number for the next round trip.
    pub fn next_sequence(&mut self) -> u64 {
        self.sequence = self.sequence.wrapping_add(1);
        self.sequence
    }
}
