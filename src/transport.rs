//! Byte-stream abstraction shared by every connection kind.
//!
//! TCP, WebSocket and BBOSH connections all implement [`Transport`], so code
//! holding an `Arc<dyn Transport>` does not care which scheme opened it.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::error::ConnectionError;
use crate::Result;

/// An open connection carrying bytes.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send raw bytes over the transport.
    async fn send(&self, data: &[u8]) -> Result<()>;

    /// Next chunk of bytes from the peer. Chunk boundaries are transport specific.
    async fn recv(&self) -> Result<Bytes>;

    /// Close the transport.
    async fn close(&self) -> Result<()>;
}

const READ_CHUNK: usize = 8 * 1024;

/// Plain TCP pass-through.
pub struct TcpTransport {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, data: &[u8]) -> Result<()> {
        let mut w = self.writer.lock().await;
        w.write_all(data).await?;
        w.flush().await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        let mut r = self.reader.lock().await;
        if r.read_buf(&mut buf).await? == 0 {
            return Err(ConnectionError::Closed.into());
        }
        Ok(buf.freeze())
    }

    async fn close(&self) -> Result<()> {
        let mut w = self.writer.lock().await;
        w.shutdown().await?;
        Ok(())
    }
}
