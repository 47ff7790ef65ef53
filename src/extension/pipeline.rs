use tracing::{debug, trace, warn};

use super::{dispatch_received, dispatch_sent, Extension, ExtensionHeader, ExtensionRegistry, Transform};
use crate::error::{ExtensionError, NegotiationError, Result};
use crate::frame::Frame;

/// The active extensions of one connection, in the server's confirmed order.
///
/// Index 0 sits next to the wire. The order is fixed once negotiated.
#[derive(Default)]
pub struct ExtensionPipeline {
    chain: Vec<Box<dyn Extension>>,
}

impl ExtensionPipeline {
    /// Pipeline with no extensions: frames pass straight through.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Validate each offered header on its own and keep the ones that pass.
    ///
    /// Unparsable, unknown and rejected offers are dropped; they never fail the connection.
    pub fn offer(registry: &ExtensionRegistry, offered: &[String]) -> Vec<ExtensionHeader> {
        offered
            .iter()
            .filter_map(|raw| {
                let header = match raw.parse::<ExtensionHeader>() {
                    Ok(h) => h,
                    Err(e) => {
                        warn!(offer = %raw, error = %e, "dropping unparsable extension offer");
                        return None;
                    }
                };
                let Some(factory) = registry.get(&header.name) else {
                    warn!(extension = %header.name, "dropping offer for unregistered extension");
                    return None;
                };
                match factory.validate(&header) {
                    Ok(()) => Some(header),
                    Err(e) => {
                        warn!(extension = %header.name, error = %e, "extension offer failed validation");
                        None
                    }
                }
            })
            .collect()
    }

    /// Build the chain from the server's `Sec-WebSocket-Extensions` answer.
    ///
    /// One extension is created per confirmed name, in the server's order. A
    /// confirmed name that was never offered fails the negotiation.
    pub fn negotiate(
        registry: &ExtensionRegistry,
        offered: &[ExtensionHeader],
        confirmed: Option<&str>,
    ) -> Result<Self> {
        let Some(confirmed) = confirmed else {
            return Ok(Self::empty());
        };
        let mut chain = Vec::new();
        for header in ExtensionHeader::parse_list(confirmed)? {
            if !offered.iter().any(|o| o.name == header.name) {
                return Err(NegotiationError::UnexpectedExtension(header.name).into());
            }
            let factory = registry
                .get(&header.name)
                .ok_or_else(|| ExtensionError::Unknown(header.name.clone()))?;
            chain.push(factory.create(&header)?);
        }
        let pipeline = Self { chain };
        debug!(extensions = ?pipeline.names(), "negotiated extensions");
        Ok(pipeline)
    }

    /// Pipeline over already-built extensions, first element next to the wire.
    pub fn from_extensions(chain: Vec<Box<dyn Extension>>) -> Self {
        Self { chain }
    }

    /// Run a frame read from the wire towards the application.
    ///
    /// `Ok(None)` means some hook suppressed it.
    pub fn receive(&mut self, frame: Frame) -> std::result::Result<Option<Frame>, ExtensionError> {
        let mut frame = frame;
        for ext in self.chain.iter_mut() {
            match dispatch_received(ext.as_mut(), frame)? {
                Transform::Forward(next) => frame = next,
                Transform::Suppress => {
                    trace!(extension = ext.name(), "inbound frame suppressed");
                    return Ok(None);
                }
            }
        }
        Ok(Some(frame))
    }

    /// Run a frame from the application towards the wire (reverse chain order).
    pub fn send(&mut self, frame: Frame) -> std::result::Result<Option<Frame>, ExtensionError> {
        let mut frame = frame;
        for ext in self.chain.iter_mut().rev() {
            match dispatch_sent(ext.as_mut(), frame)? {
                Transform::Forward(next) => frame = next,
                Transform::Suppress => {
                    trace!(extension = ext.name(), "outbound frame suppressed");
                    return Ok(None);
                }
            }
        }
        Ok(Some(frame))
    }

    pub fn names(&self) -> Vec<&str> {
        self.chain.iter().map(|e| e.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }
}

impl std::fmt::Debug for ExtensionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ExtensionPipeline").field(&self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::extension::ExtensionFactory;
    use crate::frame::Opcode;
    use bytes::{BufMut, BytesMut};
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<String>>>;

    /// Appends its tag to text payloads and records each hook call.
    struct Tagger {
        tag: String,
        log: Log,
    }

    impl Tagger {
        fn tagged(&self, frame: Frame) -> Frame {
            let mut buf = BytesMut::from(&frame.payload[..]);
            buf.put_slice(self.tag.as_bytes());
            Frame {
                payload: buf.freeze(),
                ..frame
            }
        }
    }

    impl Extension for Tagger {
        fn name(&self) -> &str {
            &self.tag
        }

        fn on_text_received(&mut self, frame: Frame) -> std::result::Result<Transform, ExtensionError> {
            self.log.lock().unwrap().push(format!("recv:{}", self.tag));
            Ok(Transform::Forward(self.tagged(frame)))
        }

        fn on_text_sent(&mut self, frame: Frame) -> std::result::Result<Transform, ExtensionError> {
            self.log.lock().unwrap().push(format!("send:{}", self.tag));
            Ok(Transform::Forward(self.tagged(frame)))
        }
    }

    struct TaggerFactory {
        name: &'static str,
        log: Log,
    }

    impl ExtensionFactory for TaggerFactory {
        fn name(&self) -> &str {
            self.name
        }

        fn validate(&self, offer: &ExtensionHeader) -> std::result::Result<(), ExtensionError> {
            if offer.has_parameter("bad") {
                return Err(ExtensionError::InvalidHeader(offer.to_string()));
            }
            Ok(())
        }

        fn create(&self, _: &ExtensionHeader) -> std::result::Result<Box<dyn Extension>, ExtensionError> {
            Ok(Box::new(Tagger {
                tag: self.name.to_string(),
                log: Arc::clone(&self.log),
            }))
        }
    }

    fn registry(log: &Log) -> ExtensionRegistry {
        ExtensionRegistry::new()
            .with(Arc::new(TaggerFactory {
                name: "a",
                log: Arc::clone(log),
            }))
            .with(Arc::new(TaggerFactory {
                name: "b",
                log: Arc::clone(log),
            }))
    }

    #[test]
    fn offer_drops_invalid_entries_only() {
        let log = Log::default();
        let offered = ExtensionPipeline::offer(
            &registry(&log),
            &[
                "a;x=1".to_string(),
                "b;bad".to_string(),
                "unknown".to_string(),
                "not valid".to_string(),
                "b".to_string(),
            ],
        );
        let names: Vec<_> = offered.iter().map(|h| h.to_string()).collect();
        assert_eq!(names, ["a;x=1", "b"]);
    }

    #[test]
    fn chain_follows_server_order() {
        let log = Log::default();
        let reg = registry(&log);
        let offered = ExtensionPipeline::offer(&reg, &["b".into(), "a".into()]);
        let mut pipeline = ExtensionPipeline::negotiate(&reg, &offered, Some("a, b")).unwrap();
        assert_eq!(pipeline.names(), ["a", "b"]);

        let inbound = pipeline.receive(Frame::text("m")).unwrap().unwrap();
        assert_eq!(&inbound.payload[..], b"mab");
        let outbound = pipeline.send(Frame::text("m")).unwrap().unwrap();
        assert_eq!(&outbound.payload[..], b"mba");

        assert_eq!(
            *log.lock().unwrap(),
            ["recv:a", "recv:b", "send:b", "send:a"]
        );
    }

    #[test]
    fn binary_frames_skip_text_hooks() {
        let log = Log::default();
        let reg = registry(&log);
        let offered = ExtensionPipeline::offer(&reg, &["a".into()]);
        let mut pipeline = ExtensionPipeline::negotiate(&reg, &offered, Some("a")).unwrap();
        let out = pipeline.receive(Frame::binary(vec![1, 2])).unwrap().unwrap();
        assert_eq!(out.opcode, Opcode::Binary);
        assert_eq!(&out.payload[..], &[1, 2]);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn unoffered_confirmation_fails() {
        let log = Log::default();
        let reg = registry(&log);
        let offered = ExtensionPipeline::offer(&reg, &["a".into()]);
        let err = ExtensionPipeline::negotiate(&reg, &offered, Some("b")).unwrap_err();
        assert!(matches!(
            err,
            Error::Negotiation(NegotiationError::UnexpectedExtension(ref n)) if n == "b"
        ));
    }

    #[test]
    fn no_confirmation_means_empty_chain() {
        let log = Log::default();
        let reg = registry(&log);
        let pipeline = ExtensionPipeline::negotiate(&reg, &[], None).unwrap();
        assert!(pipeline.is_empty());
    }

    struct Swallow;

    impl Extension for Swallow {
        fn name(&self) -> &str {
            "swallow"
        }

        fn on_continuation_received(&mut self, _: Frame) -> std::result::Result<Transform, ExtensionError> {
            Ok(Transform::Suppress)
        }
    }

    struct Faulty;

    impl Extension for Faulty {
        fn name(&self) -> &str {
            "faulty"
        }

        fn on_binary_sent(&mut self, _: Frame) -> std::result::Result<Transform, ExtensionError> {
            Err(ExtensionError::Transform {
                extension: "faulty".into(),
                reason: "cannot encode".into(),
            })
        }
    }

    #[test]
    fn suppression_stops_delivery() {
        let mut pipeline = ExtensionPipeline::from_extensions(vec![Box::new(Swallow)]);
        assert_eq!(pipeline.receive(Frame::continuation(true, "x")).unwrap(), None);
        assert!(pipeline.receive(Frame::text("x")).unwrap().is_some());
    }

    #[test]
    fn hook_error_surfaces() {
        let mut pipeline =
            ExtensionPipeline::from_extensions(vec![Box::new(Faulty), Box::new(Swallow)]);
        assert!(matches!(
            pipeline.send(Frame::binary(vec![0])),
            Err(ExtensionError::Transform { .. })
        ));
        assert!(pipeline.send(Frame::text("ok")).is_ok());
    }
}
