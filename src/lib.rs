//! # wirelink
//!
//! Client library for opening byte-stream connections by URL.
//!
//! ## Features
//!
//! - WebSocket (RFC 6455) framing with zero-copy frame views
//! - Negotiated WebSocket extensions run as a frame transform pipeline
//! - Redirect policies and authentication challenge dispatch during the handshake
//! - BBOSH: a byte stream over HTTP with polling, long-polling and streaming strategies
//! - A reentrant lock guarding per-connection state
//!
//! ## Example
//!
//! ```ignore
//! use wirelink::{ConnectOptions, Connector};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let connector = Connector::with_defaults(ConnectOptions::default())?;
//!     let conn = connector.open("ws://localhost:8000/echo").await?;
//!     conn.send(b"hello").await?;
//!     let reply = conn.recv().await?;
//!     println!("{:?}", reply);
//!     conn.close().await?;
//!     Ok(())
//! }
//! ```

pub mod bbosh;
pub mod challenge;
pub mod config;
pub mod connector;
pub mod error;
pub mod extension;
pub mod frame;
pub mod http;
pub mod sync;
pub mod transport;
pub mod websocket;

pub use bbosh::{BboshConnection, BboshSession, BboshStrategy};
pub use challenge::{ChallengeHandler, ChallengeRequest, ChallengeResponse, DispatchChallengeHandler};
pub use config::ConnectOptions;
pub use connector::{Connector, ProtocolHandler};
pub use error::{Error, Result};
pub use extension::{Extension, ExtensionFactory, ExtensionPipeline, ExtensionRegistry};
pub use frame::{CloseCode, Frame, FrameRef, Opcode};
pub use http::{HttpExchange, RedirectPolicy};
pub use sync::{ReentrantLock, ReentrantMutex};
pub use transport::{TcpTransport, Transport};
pub use websocket::{Message, WebSocket};
