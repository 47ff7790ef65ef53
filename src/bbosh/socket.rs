//! Wire helpers shared by the polling, long-polling and streaming sockets.

use std::collections::{BTreeMap, VecDeque};

use bytes::Bytes;
use url::Url;

use super::{CONTENT_TYPE, HEADER_PROTOCOL, HEADER_SEQUENCE_NO, PROTOCOL};
use crate::error::{ConnectionError, NegotiationError};
use crate::http::{HttpRequest, Method};
use crate::Result;

/// Capacity of the streaming upload channel, in chunks.
pub(super) const UPSTREAM_CAPACITY: usize = 32;

/// Request to the instance URL carrying sequence number `seq`.
pub(super) fn data_request(method: Method, url: Url, seq: u64) -> HttpRequest {
    HttpRequest::new(method, url)
        .header(HEADER_PROTOCOL, PROTOCOL)
        .header(HEADER_SEQUENCE_NO, seq.to_string())
        .header("Content-Type", CONTENT_TYPE)
        .header("Accept", CONTENT_TYPE)
}

pub(super) fn check_status(status: u16) -> Result<()> {
    if (200..300).contains(&status) {
        Ok(())
    } else {
        Err(NegotiationError::UnexpectedStatus(status).into())
    }
}

/// The response must echo the sequence number of its request.
pub(super) fn check_echo(echoed: Option<&str>, expected: u64) -> Result<()> {
    let value = echoed.ok_or(NegotiationError::MissingHeader(HEADER_SEQUENCE_NO))?;
    let actual: u64 = value.trim().parse().map_err(|_| NegotiationError::InvalidHeader {
        name: HEADER_SEQUENCE_NO,
        value: value.to_string(),
    })?;
    if actual != expected {
        return Err(ConnectionError::Sequence { expected, actual }.into());
    }
    Ok(())
}

/// Releases response bodies in sequence order.
///
/// Each issued sequence number reserves a slot; bodies that complete early
/// wait until every lower slot is filled. Empty bodies only advance the order.
#[derive(Debug)]
pub(super) struct SequenceBuffer {
    next: u64,
    slots: BTreeMap<u64, Option<Bytes>>,
    ready: VecDeque<Bytes>,
}

impl SequenceBuffer {
    pub(super) fn new(next: u64) -> Self {
        Self {
            next,
            slots: BTreeMap::new(),
            ready: VecDeque::new(),
        }
    }

    /// Reserve a slot for a round trip just issued.
    pub(super) fn expect(&mut self, seq: u64) {
        self.slots.insert(seq, None);
    }

    /// Fill the slot for `seq` and release whatever is now in order.
    pub(super) fn complete(&mut self, seq: u64, body: Bytes) -> std::result::Result<(), ConnectionError> {
        match self.slots.get_mut(&seq) {
            Some(slot) if slot.is_none() => *slot = Some(body),
            _ => {
                return Err(ConnectionError::Sequence {
                    expected: self.next,
                    actual: seq,
                })
            }
        }
        self.release();
        Ok(())
    }

    /// Give up the slot of a round trip that will never complete.
    ///
    /// The slot counts as an empty body, so later bodies are not held back.
    /// Filled or unknown slots are left alone.
    pub(super) fn cancel(&mut self, seq: u64) {
        if let Some(slot) = self.slots.get_mut(&seq) {
            if slot.is_none() {
                *slot = Some(Bytes::new());
                self.release();
            }
        }
    }

    fn release(&mut self) {
        while let Some(entry) = self.slots.first_entry() {
            if entry.get().is_none() {
                break;
            }
            let seq = *entry.key();
            if let Some(body) = entry.remove() {
                if !body.is_empty() {
                    self.ready.push_back(body);
                }
            }
            self.next = seq.wrapping_add(1);
        }
    }

    pub(super) fn pop(&mut self) -> Option<Bytes> {
        self.ready.pop_front()
    }

    /// Round trips issued but not yet released.
    pub(super) fn outstanding(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn releases_in_sequence_order() {
        let mut b = SequenceBuffer::new(1);
        for seq in 1..=3 {
            b.expect(seq);
        }
        b.complete(2, Bytes::from_static(b"b")).unwrap();
        assert_eq!(b.pop(), None);
        b.complete(1, Bytes::from_static(b"a")).unwrap();
        assert_eq!(b.pop().as_deref(), Some(&b"a"[..]));
        assert_eq!(b.pop().as_deref(), Some(&b"b"[..]));
        b.complete(3, Bytes::new()).unwrap();
        assert_eq!(b.pop(), None);
        assert_eq!(b.outstanding(), 0);
    }

    #[test]
    fn cancelled_slot_stops_holding_back_later_bodies() {
        let mut b = SequenceBuffer::new(1);
        b.expect(1);
        b.expect(2);
        b.complete(2, Bytes::from_static(b"b")).unwrap();
        assert_eq!(b.pop(), None);
        b.cancel(1);
        assert_eq!(b.pop().as_deref(), Some(&b"b"[..]));
        assert_eq!(b.outstanding(), 0);

        b.expect(3);
        b.complete(3, Bytes::from_static(b"c")).unwrap();
        b.cancel(3);
        b.cancel(40);
        assert_eq!(b.pop().as_deref(), Some(&b"c"[..]));
        assert!(matches!(
            b.complete(3, Bytes::new()),
            Err(ConnectionError::Sequence { expected: 4, actual: 3 })
        ));
    }

    #[test]
    fn unknown_or_repeated_sequence_fails() {
        let mut b = SequenceBuffer::new(1);
        b.expect(1);
        b.complete(1, Bytes::new()).unwrap();
        assert!(matches!(
            b.complete(7, Bytes::new()),
            Err(ConnectionError::Sequence { expected: 2, actual: 7 })
        ));
        assert!(matches!(
            b.complete(1, Bytes::new()),
            Err(ConnectionError::Sequence { expected: 2, actual: 1 })
        ));
    }

    #[test]
    fn echo_must_match() {
        assert!(check_echo(Some("4"), 4).is_ok());
        assert!(check_echo(Some(" 4 "), 4).is_ok());
        assert!(check_echo(None, 4).is_err());
        assert!(check_echo(Some("four"), 4).is_err());
        assert!(matches!(
            check_echo(Some("5"), 4),
            Err(crate::Error::Connection(ConnectionError::Sequence { expected: 4, actual: 5 }))
        ));
    }

    #[test]
    fn data_request_headers() {
        let url = Url::parse("http://example.com/s/1").unwrap();
        let req = data_request(Method::Post, url, 12);
        assert_eq!(req.header_value(HEADER_PROTOCOL), Some(PROTOCOL));
        assert_eq!(req.header_value(HEADER_SEQUENCE_NO), Some("12"));
        assert_eq!(req.header_value("content-type"), Some(CONTENT_TYPE));
        assert!(check_status(204).is_ok());
        assert!(check_status(404).is_err());
    }
}
