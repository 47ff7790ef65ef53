//! Negotiated WebSocket extensions and the frame transform chain they form.
//!
//! An [`ExtensionFactory`] validates offers and instantiates [`Extension`]s
//! for the names the server confirms. The resulting [`ExtensionPipeline`]
//! runs every inbound frame through the chain wire-side first, and every
//! outbound frame application-side first.

mod header;
mod pipeline;

pub use header::ExtensionHeader;
pub use pipeline::ExtensionPipeline;

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ExtensionError;
use crate::frame::{Frame, Opcode};

/// Outcome of one hook.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transform {
    /// Hand the (possibly rewritten) frame to the next hook.
    Forward(Frame),
    /// Stop here; nothing reaches the application or the wire.
    Suppress,
}

/// A negotiated extension. Every hook forwards unchanged unless overridden.
pub trait Extension: Send {
    fn name(&self) -> &str;

    fn on_text_received(&mut self, frame: Frame) -> Result<Transform, ExtensionError> {
        Ok(Transform::Forward(frame))
    }

    fn on_binary_received(&mut self, frame: Frame) -> Result<Transform, ExtensionError> {
        Ok(Transform::Forward(frame))
    }

    fn on_continuation_received(&mut self, frame: Frame) -> Result<Transform, ExtensionError> {
        Ok(Transform::Forward(frame))
    }

    /// Close, ping and pong frames from the peer.
    fn on_control_received(&mut self, frame: Frame) -> Result<Transform, ExtensionError> {
        Ok(Transform::Forward(frame))
    }

    fn on_text_sent(&mut self, frame: Frame) -> Result<Transform, ExtensionError> {
        Ok(Transform::Forward(frame))
    }

    fn on_binary_sent(&mut self, frame: Frame) -> Result<Transform, ExtensionError> {
        Ok(Transform::Forward(frame))
    }

    fn on_continuation_sent(&mut self, frame: Frame) -> Result<Transform, ExtensionError> {
        Ok(Transform::Forward(frame))
    }

    fn on_control_sent(&mut self, frame: Frame) -> Result<Transform, ExtensionError> {
        Ok(Transform::Forward(frame))
    }
}

/// Route an inbound frame to the hook for its opcode.
pub(crate) fn dispatch_received(
    ext: &mut dyn Extension,
    frame: Frame,
) -> Result<Transform, ExtensionError> {
    match frame.opcode {
        Opcode::Text => ext.on_text_received(frame),
        Opcode::Binary => ext.on_binary_received(frame),
        Opcode::Continuation => ext.on_continuation_received(frame),
        Opcode::Close | Opcode::Ping | Opcode::Pong => ext.on_control_received(frame),
    }
}

/// Route an outbound frame to the hook for its opcode.
pub(crate) fn dispatch_sent(
    ext: &mut dyn Extension,
    frame: Frame,
) -> Result<Transform, ExtensionError> {
    match frame.opcode {
        Opcode::Text => ext.on_text_sent(frame),
        Opcode::Binary => ext.on_binary_sent(frame),
        Opcode::Continuation => ext.on_continuation_sent(frame),
        Opcode::Close | Opcode::Ping | Opcode::Pong => ext.on_control_sent(frame),
    }
}

/// Validates offers for one extension name and builds instances once confirmed.
pub trait ExtensionFactory: Send + Sync {
    fn name(&self) -> &str;

    /// Check an offer before it is sent. An error drops this offer only.
    fn validate(&self, offer: &ExtensionHeader) -> Result<(), ExtensionError> {
        let _ = offer;
        Ok(())
    }

    /// Build the extension from the parameters the server confirmed.
    fn create(&self, confirmed: &ExtensionHeader) -> Result<Box<dyn Extension>, ExtensionError>;
}

/// Extension factories keyed by name.
#[derive(Clone, Default)]
pub struct ExtensionRegistry {
    factories: HashMap<String, Arc<dyn ExtensionFactory>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, factory: Arc<dyn ExtensionFactory>) {
        self.factories.insert(factory.name().to_string(), factory);
    }

    pub fn with(mut self, factory: Arc<dyn ExtensionFactory>) -> Self {
        self.register(factory);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn ExtensionFactory>> {
        self.factories.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl std::fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}
