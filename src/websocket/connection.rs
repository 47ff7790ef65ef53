use std::cell::RefCell;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{watch, Mutex};
use tracing::{debug, trace, warn};

use crate::error::{ConnectionError, Error, FrameError};
use crate::extension::ExtensionPipeline;
use crate::frame::{encode, encoded_len, mask, peek_frame_len, CloseCode, Frame, FrameRef, Opcode};
use crate::sync::ReentrantMutex;
use crate::transport::Transport;
use crate::Result;

/// How long `close` waits for the peer's close frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// A complete message delivered to the application.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
    /// The peer started the closing handshake; it has already been answered.
    Close { code: u16, reason: String },
}

struct Fragments {
    opcode: Opcode,
    data: BytesMut,
}

struct State {
    pipeline: ExtensionPipeline,
    close_sent: bool,
    close_received: bool,
    closed: bool,
    fragments: Option<Fragments>,
}

/// What the reader does with one inbound frame.
enum Step {
    Continue,
    Deliver(Message),
    Reply(Frame),
}

struct Reader<R> {
    io: R,
    buf: BytesMut,
}

/// A client WebSocket over an upgraded byte stream.
///
/// Reads and writes use separate halves so one task can wait in `recv` while
/// others send. Outgoing frames are masked with a fresh key.
pub struct WebSocket<S> {
    reader: Mutex<Reader<ReadHalf<S>>>,
    writer: Mutex<WriteHalf<S>>,
    state: ReentrantMutex<RefCell<State>>,
    /// Flips to true once the peer's close frame has been read.
    peer_closed: watch::Sender<bool>,
    protocol: Option<String>,
    max_message_size: usize,
}

impl<S> WebSocket<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Wrap a stream whose upgrade already succeeded. `leftover` holds bytes read past the response head.
    pub fn new(
        stream: S,
        leftover: BytesMut,
        pipeline: ExtensionPipeline,
        protocol: Option<String>,
        max_message_size: usize,
    ) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(Reader {
                io: read,
                buf: leftover,
            }),
            writer: Mutex::new(write),
            state: ReentrantMutex::new(RefCell::new(State {
                pipeline,
                close_sent: false,
                close_received: false,
                closed: false,
                fragments: None,
            })),
            peer_closed: watch::channel(false).0,
            protocol,
            max_message_size,
        }
    }

    /// Subprotocol the server selected.
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    /// Names of the negotiated extensions, wire side first.
    pub fn extensions(&self) -> Vec<String> {
        self.with_state(|s| s.pipeline.names().into_iter().map(str::to_string).collect())
    }

    pub fn is_closed(&self) -> bool {
        self.with_state(|s| s.closed)
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        f(&mut state)
    }

    pub async fn send_text(&self, text: &str) -> Result<()> {
        self.send_frame(Frame::text(Bytes::copy_from_slice(text.as_bytes()))).await
    }

    pub async fn send_binary(&self, data: &[u8]) -> Result<()> {
        self.send_frame(Frame::binary(Bytes::copy_from_slice(data))).await
    }

    /// Run `frame` through the extensions and write it.
    pub async fn send_frame(&self, frame: Frame) -> Result<()> {
        let outgoing = self.with_state(|s| -> Result<Option<Frame>> {
            if s.closed || s.close_sent {
                return Err(ConnectionError::Closed.into());
            }
            if frame.opcode == Opcode::Close {
                s.close_sent = true;
            }
            Ok(s.pipeline.send(frame)?)
        });
        match outgoing {
            Ok(Some(frame)) => self.write_frame(&frame).await,
            Ok(None) => Ok(()),
            Err(e @ Error::Extension(_)) => Err(self.abort(e).await),
            Err(e) => Err(e),
        }
    }

    async fn write_frame(&self, frame: &Frame) -> Result<()> {
        let mut out = BytesMut::with_capacity(encoded_len(frame.payload.len(), true));
        encode(frame, Some(mask::random_key()), &mut out)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&out).await?;
        writer.flush().await?;
        trace!(opcode = ?frame.opcode, len = frame.payload.len(), "frame sent");
        Ok(())
    }

    async fn read_frame(&self, reader: &mut Reader<ReadHalf<S>>) -> Result<Frame> {
        loop {
            if let Some(len) = peek_frame_len(&reader.buf, 0)? {
                if len > self.max_message_size.saturating_add(14) {
                    return Err(FrameError::MessageTooLarge {
                        size: len,
                        limit: self.max_message_size,
                    }
                    .into());
                }
                if reader.buf.len() >= len {
                    let frame = FrameRef::parse(&reader.buf[..len], 0)?.to_frame();
                    reader.buf.advance(len);
                    return Ok(frame);
                }
            }
            if reader.io.read_buf(&mut reader.buf).await? == 0 {
                return Err(ConnectionError::Closed.into());
            }
        }
    }

    fn check_size(&self, size: usize) -> std::result::Result<(), FrameError> {
        if size > self.max_message_size {
            return Err(FrameError::MessageTooLarge {
                size,
                limit: self.max_message_size,
            });
        }
        Ok(())
    }

    /// Apply one inbound frame to the connection state.
    fn on_frame(&self, frame: Frame) -> Result<Step> {
        self.with_state(|s| -> Result<Step> {
            let Some(frame) = s.pipeline.receive(frame)? else {
                return Ok(Step::Continue);
            };
            match frame.opcode {
                Opcode::Ping if s.close_sent => Ok(Step::Continue),
                Opcode::Ping => Ok(Step::Reply(Frame::pong(frame.payload))),
                Opcode::Pong => Ok(Step::Continue),
                Opcode::Close => {
                    let (code, reason) = frame.close_reason()?;
                    s.close_received = true;
                    self.peer_closed.send_replace(true);
                    Ok(Step::Deliver(Message::Close { code, reason }))
                }
                Opcode::Text | Opcode::Binary => {
                    if s.fragments.is_some() {
                        return Err(FrameError::Malformed("data frame inside a fragmented message".into()).into());
                    }
                    self.check_size(frame.payload.len())?;
                    if frame.fin {
                        return Ok(Step::Deliver(into_message(frame.opcode, frame.payload)?));
                    }
                    s.fragments = Some(Fragments {
                        opcode: frame.opcode,
                        data: BytesMut::from(&frame.payload[..]),
                    });
                    Ok(Step::Continue)
                }
                Opcode::Continuation => {
                    let Some(fragments) = s.fragments.as_mut() else {
                        return Err(FrameError::Malformed("continuation without a message".into()).into());
                    };
                    self.check_size(fragments.data.len() + frame.payload.len())?;
                    fragments.data.extend_from_slice(&frame.payload);
                    if !frame.fin {
                        return Ok(Step::Continue);
                    }
                    match s.fragments.take() {
                        Some(done) => Ok(Step::Deliver(into_message(done.opcode, done.data.freeze())?)),
                        None => Ok(Step::Continue),
                    }
                }
            }
        })
    }

    /// Next complete message. Pings are answered and pongs dropped on the way.
    pub async fn recv(&self) -> Result<Message> {
        if self.is_closed() {
            return Err(ConnectionError::Closed.into());
        }
        let mut reader = self.reader.lock().await;
        loop {
            let step = match self.read_frame(&mut reader).await {
                Ok(frame) => self.on_frame(frame),
                Err(e) => Err(e),
            };
            match step {
                Ok(Step::Continue) => {}
                Ok(Step::Reply(pong)) => {
                    if let Err(e) = self.send_frame(pong).await {
                        return Err(self.abort(e).await);
                    }
                }
                Ok(Step::Deliver(Message::Close { code, reason })) => {
                    self.finish_close(code).await;
                    return Ok(Message::Close { code, reason });
                }
                Ok(Step::Deliver(message)) => return Ok(message),
                Err(e) => return Err(self.abort(e).await),
            }
        }
    }

    /// Answer the peer's close (unless we started it) and shut the stream.
    async fn finish_close(&self, code: u16) {
        let echo = self.with_state(|s| !s.close_sent);
        if echo {
            let reply = CloseCode::from_u16(code)
                .filter(|c| *c != CloseCode::NoStatus)
                .unwrap_or(CloseCode::Normal);
            if let Err(e) = self.send_frame(Frame::close(reply, "")).await {
                debug!(error = %e, "close reply not sent");
            }
        }
        self.shutdown().await;
        debug!(code, "websocket closed by peer");
    }

    async fn shutdown(&self) {
        self.with_state(|s| s.closed = true);
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    /// Close the connection after a fatal error, telling the peer why.
    async fn abort(&self, error: Error) -> Error {
        let first = self.with_state(|s| !s.closed);
        if first && !matches!(error, Error::Connection(ConnectionError::Closed)) {
            let code = error.close_code();
            warn!(error = %error, code = code.as_u16(), "closing websocket after error");
            let notify = self.with_state(|s| !std::mem::replace(&mut s.close_sent, true));
            if notify {
                let _ = self.write_frame(&Frame::close(code, "")).await;
            }
        }
        self.shutdown().await;
        error
    }

    /// Start the closing handshake and wait briefly for the peer's answer.
    pub async fn close(&self, code: CloseCode, reason: &str) -> Result<()> {
        if self.is_closed() {
            return Err(ConnectionError::Closed.into());
        }
        let mut answered = self.peer_closed.subscribe();
        self.send_frame(Frame::close(code, reason)).await?;

        if !*answered.borrow_and_update() {
            // A task already in `recv` may own the reader; it reports the answer through `peer_closed`.
            let wait = async {
                tokio::select! {
                    _ = answered.changed() => {}
                    _ = self.read_until_close() => {}
                }
            };
            if tokio::time::timeout(CLOSE_TIMEOUT, wait).await.is_err() {
                debug!("peer did not answer close");
            }
        }
        self.shutdown().await;
        Ok(())
    }

    async fn read_until_close(&self) {
        let mut reader = self.reader.lock().await;
        while !self.with_state(|s| s.close_received) {
            match self.read_frame(&mut reader).await {
                Ok(frame) if frame.opcode == Opcode::Close => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    }
}

fn into_message(opcode: Opcode, payload: Bytes) -> Result<Message> {
    match opcode {
        Opcode::Text => String::from_utf8(payload.to_vec())
            .map(Message::Text)
            .map_err(|_| FrameError::Malformed("text message is not UTF-8".into()).into()),
        _ => Ok(Message::Binary(payload)),
    }
}

#[async_trait]
impl<S> Transport for WebSocket<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn send(&self, data: &[u8]) -> Result<()> {
        self.send_binary(data).await
    }

    async fn recv(&self) -> Result<Bytes> {
        match WebSocket::recv(self).await? {
            Message::Binary(data) => Ok(data),
            Message::Text(text) => Ok(Bytes::from(text)),
            Message::Close { code, reason } => Err(ConnectionError::ClosedByPeer { code, reason }.into()),
        }
    }

    async fn close(&self) -> Result<()> {
        WebSocket::close(self, CloseCode::Normal, "").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExtensionError;
    use crate::extension::{Extension, Transform};
    use std::sync::Arc;
    use tokio::io::DuplexStream;
    use tokio::time::Instant;

    /// Raw peer side: writes unmasked frames and decodes what the client sent.
    struct Peer {
        io: DuplexStream,
        buf: BytesMut,
    }

    impl Peer {
        async fn send(&mut self, frame: Frame) {
            let mut out = BytesMut::new();
            encode(&frame, None, &mut out).unwrap();
            self.io.write_all(&out).await.unwrap();
        }

        async fn send_raw(&mut self, bytes: &[u8]) {
            self.io.write_all(bytes).await.unwrap();
        }

        async fn next(&mut self) -> (Frame, Option<[u8; 4]>) {
            loop {
                if let Some(len) = peek_frame_len(&self.buf, 0).unwrap() {
                    if self.buf.len() >= len {
                        let view = FrameRef::parse(&self.buf[..len], 0).unwrap();
                        let out = (view.to_frame(), view.mask());
                        self.buf.advance(len);
                        return out;
                    }
                }
                assert!(self.io.read_buf(&mut self.buf).await.unwrap() > 0, "client hung up");
            }
        }
    }

    fn pair_with(pipeline: ExtensionPipeline, max: usize) -> (WebSocket<DuplexStream>, Peer) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let ws = WebSocket::new(client, BytesMut::new(), pipeline, None, max);
        (
            ws,
            Peer {
                io: server,
                buf: BytesMut::new(),
            },
        )
    }

    fn pair() -> (WebSocket<DuplexStream>, Peer) {
        pair_with(ExtensionPipeline::empty(), 1024)
    }

    #[tokio::test]
    async fn client_frames_are_masked() {
        let (ws, mut peer) = pair();
        ws.send_text("Hello").await.unwrap();
        let (frame, key) = peer.next().await;
        assert!(key.is_some());
        assert_eq!(frame, Frame::text("Hello"));
    }

    #[tokio::test]
    async fn reassembles_fragments_and_answers_pings() {
        let (ws, mut peer) = pair();
        peer.send(Frame::new(Opcode::Text, false, "Hel")).await;
        peer.send(Frame::ping("p")).await;
        peer.send(Frame::continuation(true, "lo")).await;
        assert_eq!(ws.recv().await.unwrap(), Message::Text("Hello".into()));

        let (pong, _) = peer.next().await;
        assert_eq!(pong, Frame::pong("p"));
    }

    #[tokio::test]
    async fn leftover_bytes_are_read_first() {
        let (client, _server) = tokio::io::duplex(1024);
        let mut early = BytesMut::new();
        encode(&Frame::binary(&b"early"[..]), None, &mut early).unwrap();
        let ws = WebSocket::new(client, early, ExtensionPipeline::empty(), Some("chat".into()), 1024);
        assert_eq!(ws.recv().await.unwrap(), Message::Binary(Bytes::from_static(b"early")));
        assert_eq!(ws.protocol(), Some("chat"));
    }

    #[tokio::test]
    async fn peer_close_is_echoed() {
        let (ws, mut peer) = pair();
        peer.send(Frame::close(CloseCode::GoingAway, "bye")).await;
        assert_eq!(
            ws.recv().await.unwrap(),
            Message::Close {
                code: 1001,
                reason: "bye".into()
            }
        );
        let (echo, _) = peer.next().await;
        assert_eq!(echo.close_reason().unwrap().0, 1001);
        assert!(ws.is_closed());
        assert!(matches!(
            ws.send_text("late").await,
            Err(Error::Connection(ConnectionError::Closed))
        ));
    }

    #[tokio::test]
    async fn client_close_waits_for_answer() {
        let (ws, mut peer) = pair();
        let server = tokio::spawn(async move {
            let (frame, _) = peer.next().await;
            let (code, reason) = frame.close_reason().unwrap();
            peer.send(Frame::close(CloseCode::Normal, "")).await;
            (code, reason)
        });
        ws.close(CloseCode::Normal, "done").await.unwrap();
        assert_eq!(server.await.unwrap(), (1000, "done".to_string()));
        assert!(ws.close(CloseCode::Normal, "").await.is_err());
    }

    #[tokio::test]
    async fn close_completes_while_another_task_reads() {
        let (ws, mut peer) = pair();
        let ws = Arc::new(ws);
        let reader = tokio::spawn({
            let ws = ws.clone();
            async move { ws.recv().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let server = tokio::spawn(async move {
            let (frame, _) = peer.next().await;
            peer.send(Frame::close(CloseCode::Normal, "")).await;
            frame.close_reason().unwrap().0
        });
        let started = Instant::now();
        ws.close(CloseCode::Normal, "").await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(server.await.unwrap(), 1000);
        assert_eq!(
            reader.await.unwrap().unwrap(),
            Message::Close {
                code: 1000,
                reason: String::new()
            }
        );
    }

    #[tokio::test]
    async fn ping_after_our_close_is_not_answered() {
        let (ws, mut peer) = pair();
        ws.send_frame(Frame::close(CloseCode::Normal, "")).await.unwrap();
        let (close, _) = peer.next().await;
        assert_eq!(close.opcode, Opcode::Close);

        peer.send(Frame::ping("late")).await;
        peer.send(Frame::close(CloseCode::Normal, "")).await;
        assert_eq!(
            ws.recv().await.unwrap(),
            Message::Close {
                code: 1000,
                reason: String::new()
            }
        );
        assert!(ws.is_closed());
    }

    #[tokio::test]
    async fn oversized_control_header_fails_without_payload() {
        let (ws, mut peer) = pair();
        peer.send_raw(&[0x89, 0x7E, 0xFF, 0xFF]).await;
        let result = tokio::time::timeout(Duration::from_secs(1), ws.recv())
            .await
            .expect("header alone decides");
        assert!(matches!(
            result,
            Err(Error::Frame(FrameError::ControlPayloadTooLarge(0xFFFF)))
        ));
        let (close, _) = peer.next().await;
        assert_eq!(close.close_reason().unwrap().0, 1002);
    }

    #[tokio::test]
    async fn protocol_violation_closes_with_1002() {
        let (ws, mut peer) = pair();
        peer.send(Frame::continuation(true, "orphan")).await;
        let err = ws.recv().await.unwrap_err();
        assert!(matches!(err, Error::Frame(FrameError::Malformed(_))));
        let (close, _) = peer.next().await;
        assert_eq!(close.close_reason().unwrap().0, 1002);
        assert!(matches!(ws.recv().await, Err(Error::Connection(ConnectionError::Closed))));
    }

    #[tokio::test]
    async fn unknown_opcode_is_rejected() {
        let (ws, mut peer) = pair();
        peer.send_raw(&[0x83, 0x00]).await;
        assert!(matches!(
            ws.recv().await,
            Err(Error::Frame(FrameError::UnknownOpcode(3)))
        ));
    }

    #[tokio::test]
    async fn oversized_message_closes_with_1009() {
        let (ws, mut peer) = pair_with(ExtensionPipeline::empty(), 8);
        peer.send(Frame::new(Opcode::Binary, false, &b"12345"[..])).await;
        peer.send(Frame::continuation(true, &b"67890"[..])).await;
        let err = ws.recv().await.unwrap_err();
        assert!(matches!(err, Error::Frame(FrameError::MessageTooLarge { size: 10, limit: 8 })));
        let (close, _) = peer.next().await;
        assert_eq!(close.close_reason().unwrap().0, 1009);
    }

    struct Upper;

    impl Extension for Upper {
        fn name(&self) -> &str {
            "x-upper"
        }

        fn on_text_received(&mut self, frame: Frame) -> std::result::Result<Transform, ExtensionError> {
            let upper = frame.payload.to_ascii_uppercase();
            Ok(Transform::Forward(Frame { payload: upper.into(), ..frame }))
        }

        fn on_binary_sent(&mut self, _frame: Frame) -> std::result::Result<Transform, ExtensionError> {
            Err(ExtensionError::Transform {
                extension: "x-upper".into(),
                reason: "binary not allowed".into(),
            })
        }
    }

    #[tokio::test]
    async fn extensions_see_every_frame() {
        let pipeline = ExtensionPipeline::from_extensions(vec![Box::new(Upper) as Box<dyn Extension>]);
        let (ws, mut peer) = pair_with(pipeline, 1024);
        assert_eq!(ws.extensions(), ["x-upper"]);
        peer.send(Frame::text("shout")).await;
        assert_eq!(ws.recv().await.unwrap(), Message::Text("SHOUT".into()));

        let err = ws.send_binary(b"x").await.unwrap_err();
        assert!(matches!(err, Error::Extension(_)));
        let (close, _) = peer.next().await;
        assert_eq!(close.close_reason().unwrap().0, 1002);
    }

    #[tokio::test]
    async fn transport_carries_bytes() {
        let (ws, mut peer) = pair();
        Transport::send(&ws, b"abc").await.unwrap();
        let (frame, _) = peer.next().await;
        assert_eq!(frame, Frame::binary(&b"abc"[..]));

        peer.send(Frame::text("xyz")).await;
        assert_eq!(&Transport::recv(&ws).await.unwrap()[..], b"xyz");

        peer.send(Frame::close(CloseCode::Normal, "")).await;
        assert!(matches!(
            Transport::recv(&ws).await,
            Err(Error::Connection(ConnectionError::ClosedByPeer { code: 1000, .. }))
        ));
    }
}
