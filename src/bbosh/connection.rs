use std::cell::RefCell;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tracing::{debug, trace, warn};
use url::Url;

use super::socket::{check_echo, check_status, data_request, SequenceBuffer, UPSTREAM_CAPACITY};
use super::{
    BboshSession, BboshStrategy, CONTENT_TYPE, HEADER_ACCEPT_STRATEGY, HEADER_PROTOCOL,
    HEADER_SEQUENCE_NO, HEADER_STRATEGY, PROTOCOL,
};
use crate::config::ConnectOptions;
use crate::error::{ConnectionError, Error, NegotiationError};
use crate::http::{HttpExchange, HttpRequest, Method};
use crate::sync::ReentrantMutex;
use crate::transport::Transport;
use crate::Result;

type Downstream = BoxStream<'static, Result<Bytes>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Initialized,
    Connecting,
    Connected,
    Closed,
}

struct State {
    phase: Phase,
    session: Option<BboshSession>,
    buffer: SequenceBuffer,
}

type SharedState = ReentrantMutex<RefCell<State>>;

/// Slot reserved for one round trip. Dropped before the response lands, it
/// gives the slot up and later responses are released without it.
struct Reservation<'a> {
    state: &'a SharedState,
    seq: u64,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        let guard = self.state.lock();
        guard.borrow_mut().buffer.cancel(self.seq);
    }
}

/// A BBOSH connection over an [`HttpExchange`].
///
/// Created in the initialized state; [`connect`](Self::connect) negotiates an
/// instance with the factory and [`close`](Self::close) ends it. Polling and
/// long-polling carry each `send` and `recv` as one POST; streaming keeps one
/// chunked upload and one chunked download open.
pub struct BboshConnection<H> {
    http: Arc<H>,
    factory_url: Url,
    strategies: Vec<BboshStrategy>,
    initial_sequence: u64,
    state: SharedState,
    inflight: Semaphore,
    closed: watch::Sender<bool>,
    upstream: Mutex<Option<mpsc::Sender<Bytes>>>,
    downstream: Mutex<Option<Downstream>>,
}

impl<H: HttpExchange> BboshConnection<H> {
    /// Connection to `factory_url` offering the strategies from `options`.
    pub fn new(http: Arc<H>, factory_url: Url, options: &ConnectOptions) -> Result<Self> {
        let strategies = options.strategies()?;
        Self::with_strategies(http, factory_url, strategies, options.bbosh_initial_sequence)
    }

    pub fn with_strategies(
        http: Arc<H>,
        factory_url: Url,
        strategies: Vec<BboshStrategy>,
        initial_sequence: u64,
    ) -> Result<Self> {
        if strategies.is_empty() {
            return Err(Error::IllegalArgument("no BBOSH strategy offered".into()));
        }
        Ok(Self {
            http,
            factory_url,
            strategies,
            initial_sequence,
            state: ReentrantMutex::new(RefCell::new(State {
                phase: Phase::Initialized,
                session: None,
                buffer: SequenceBuffer::new(initial_sequence.wrapping_add(1)),
            })),
            inflight: Semaphore::new(0),
            closed: watch::channel(false).0,
            upstream: Mutex::new(None),
            downstream: Mutex::new(None),
        })
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        f(&mut state)
    }

    /// The negotiated session, once connected.
    pub fn session(&self) -> Option<BboshSession> {
        self.with_state(|s| s.session.clone())
    }

    pub fn is_connected(&self) -> bool {
        self.with_state(|s| s.phase == Phase::Connected)
    }

    pub fn is_closed(&self) -> bool {
        self.with_state(|s| s.phase == Phase::Closed)
    }

    /// Negotiate an instance with the factory, bounded by `timeout`.
    pub async fn connect(&self, timeout: Duration) -> Result<()> {
        self.with_state(|s| -> std::result::Result<(), ConnectionError> {
            match s.phase {
                Phase::Initialized => {
                    s.phase = Phase::Connecting;
                    Ok(())
                }
                Phase::Connecting | Phase::Connected => Err(ConnectionError::AlreadyConnected),
                Phase::Closed => Err(ConnectionError::Closed),
            }
        })?;

        let negotiated = match tokio::time::timeout(timeout, self.negotiate()).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout.into()),
        };
        let (session, streams) = match negotiated {
            Ok(n) => n,
            Err(e) => {
                self.with_state(|s| {
                    if s.phase == Phase::Connecting {
                        s.phase = Phase::Initialized;
                    }
                });
                debug!(factory = %self.factory_url, error = %e, "bbosh negotiation failed");
                return Err(e);
            }
        };

        let strategy = session.strategy;
        if let Some((upstream, downstream)) = streams {
            *self.upstream.lock().await = Some(upstream);
            *self.downstream.lock().await = Some(downstream);
        }
        let opened = self.with_state(|s| {
            if s.phase != Phase::Connecting {
                return false;
            }
            s.phase = Phase::Connected;
            s.buffer = SequenceBuffer::new(session.sequence().wrapping_add(1));
            s.session = Some(session.clone());
            true
        });
        if !opened {
            return Err(ConnectionError::Closed.into());
        }
        if strategy != BboshStrategy::Streaming {
            self.inflight.add_permits(strategy.requests() as usize);
        }
        debug!(instance = %session.instance_url, %strategy, "bbosh connected");
        Ok(())
    }

    async fn negotiate(&self) -> Result<(BboshSession, Option<(mpsc::Sender<Bytes>, Downstream)>)> {
        let mut request = HttpRequest::post(self.factory_url.clone())
            .header(HEADER_PROTOCOL, PROTOCOL)
            .header(HEADER_SEQUENCE_NO, self.initial_sequence.to_string())
            .header("Accept", CONTENT_TYPE);
        for strategy in &self.strategies {
            request = request.header(HEADER_ACCEPT_STRATEGY, strategy.to_string());
        }
        let response = self.http.send(request).await?;
        if response.status != 201 {
            return Err(NegotiationError::UnexpectedStatus(response.status).into());
        }
        if let Some(echoed) = response.header_value(HEADER_SEQUENCE_NO) {
            check_echo(Some(echoed), self.initial_sequence)?;
        }

        let location = response
            .header_value("Location")
            .ok_or(NegotiationError::MissingHeader("Location"))?;
        let instance_url = self
            .factory_url
            .join(location)
            .map_err(|_| NegotiationError::InvalidLocation(location.to_string()))?;
        let chosen = response
            .header_value(HEADER_STRATEGY)
            .ok_or(NegotiationError::MissingHeader(HEADER_STRATEGY))?;
        let strategy: BboshStrategy = chosen.parse()?;
        if !self.strategies.iter().any(|s| s.kind() == strategy.kind()) {
            return Err(NegotiationError::StrategyNotOffered(chosen.to_string()).into());
        }

        let mut session = BboshSession::new(
            self.factory_url.clone(),
            instance_url,
            strategy,
            self.initial_sequence,
        );
        let streams = match strategy {
            BboshStrategy::Streaming => Some(self.open_streams(&mut session).await?),
            _ => None,
        };
        Ok((session, streams))
    }

    async fn open_streams(&self, session: &mut BboshSession) -> Result<(mpsc::Sender<Bytes>, Downstream)> {
        let seq = session.next_sequence();
        let (tx, rx) = mpsc::channel(UPSTREAM_CAPACITY);
        let request = data_request(Method::Post, session.instance_url.clone(), seq);
        let response = self.http.open_stream(request, rx).await?;
        check_status(response.status)?;
        check_echo(response.header_value(HEADER_SEQUENCE_NO), seq)?;
        Ok((tx, response.body))
    }

    fn strategy(&self) -> Result<BboshStrategy> {
        self.with_state(|s| -> Result<BboshStrategy> {
            match (s.phase, &s.session) {
                (Phase::Connected, Some(session)) => Ok(session.strategy),
                _ => Err(ConnectionError::Closed.into()),
            }
        })
    }

    /// Allocate the next sequence number and reserve its slot.
    fn issue(&self) -> Result<(Url, u64)> {
        self.with_state(|s| -> Result<(Url, u64)> {
            if s.phase != Phase::Connected {
                return Err(ConnectionError::Closed.into());
            }
            let session = s.session.as_mut().ok_or(ConnectionError::Closed)?;
            let seq = session.next_sequence();
            s.buffer.expect(seq);
            Ok((session.instance_url.clone(), seq))
        })
    }

    fn take_ready(&self) -> Result<Option<Bytes>> {
        self.with_state(|s| -> Result<Option<Bytes>> {
            if let Some(data) = s.buffer.pop() {
                return Ok(Some(data));
            }
            match s.phase {
                Phase::Connected => Ok(None),
                _ => Err(ConnectionError::Closed.into()),
            }
        })
    }

    /// Move to closed after a failure and hand the error back.
    fn fail(&self, error: Error) -> Error {
        let was_open = self.with_state(|s| std::mem::replace(&mut s.phase, Phase::Closed) != Phase::Closed);
        self.inflight.close();
        self.closed.send_replace(true);
        if was_open {
            warn!(instance = ?self.session().map(|s| s.instance_url), error = %error, "bbosh connection failed");
        }
        error
    }

    /// One POST to the instance. The response body joins the ordered buffer.
    async fn round_trip(&self, body: Bytes) -> Result<()> {
        let _permit = self
            .inflight
            .acquire()
            .await
            .map_err(|_| Error::from(ConnectionError::Closed))?;
        let (url, seq) = self.issue()?;
        let _reservation = Reservation {
            state: &self.state,
            seq,
        };
        let request = data_request(Method::Post, url, seq).body(body);

        let result: Result<()> = async {
            let response = self.http.send(request).await?;
            check_status(response.status)?;
            check_echo(response.header_value(HEADER_SEQUENCE_NO), seq)?;
            trace!(seq, len = response.body.len(), "bbosh round trip");
            let body = response.body;
            self.with_state(|s| s.buffer.complete(seq, body))?;
            Ok(())
        }
        .await;
        result.map_err(|e| self.fail(e))
    }

    async fn recv_stream(&self) -> Result<Bytes> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(ConnectionError::Closed.into());
        }
        let mut downstream = self.downstream.lock().await;
        let stream = downstream.as_mut().ok_or(ConnectionError::Closed)?;
        loop {
            let next = tokio::select! {
                next = stream.next() => next,
                _ = closed.changed() => return Err(ConnectionError::Closed.into()),
            };
            match next {
                Some(Ok(chunk)) if chunk.is_empty() => continue,
                Some(Ok(chunk)) => return Ok(chunk),
                Some(Err(e)) => return Err(self.fail(e)),
                None => return Err(self.fail(ConnectionError::Closed.into())),
            }
        }
    }

    /// Send bytes to the server.
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        match self.strategy()? {
            BboshStrategy::Streaming => {
                let upstream = self.upstream.lock().await.clone().ok_or(ConnectionError::Closed)?;
                upstream
                    .send(Bytes::copy_from_slice(data))
                    .await
                    .map_err(|_| self.fail(ConnectionError::Closed.into()))
            }
            _ => self.round_trip(Bytes::copy_from_slice(data)).await,
        }
    }

    /// Next non-empty chunk from the server, in sequence order.
    pub async fn recv(&self) -> Result<Bytes> {
        loop {
            if let Some(data) = self.take_ready()? {
                return Ok(data);
            }
            match self.strategy()? {
                BboshStrategy::Streaming => return self.recv_stream().await,
                BboshStrategy::Polling { interval } => {
                    self.round_trip(Bytes::new()).await?;
                    if let Some(data) = self.take_ready()? {
                        return Ok(data);
                    }
                    tokio::time::sleep(interval).await;
                }
                BboshStrategy::LongPolling { .. } => self.round_trip(Bytes::new()).await?,
            }
        }
    }

    /// Close the instance. A `DELETE` is sent to the server when connected.
    pub async fn close(&self) -> Result<()> {
        let previous = self.with_state(|s| std::mem::replace(&mut s.phase, Phase::Closed));
        self.inflight.close();
        self.closed.send_replace(true);
        self.upstream.lock().await.take();
        self.downstream.lock().await.take();
        match previous {
            Phase::Closed => Err(ConnectionError::Closed.into()),
            Phase::Connected => {
                let target = self.with_state(|s| {
                    s.session
                        .as_mut()
                        .map(|session| (session.instance_url.clone(), session.next_sequence()))
                });
                if let Some((url, seq)) = target {
                    match self.http.send(data_request(Method::Delete, url.clone(), seq)).await {
                        Ok(response) => debug!(instance = %url, status = response.status, "bbosh closed"),
                        Err(e) => warn!(instance = %url, error = %e, "bbosh delete failed"),
                    }
                }
                Ok(())
            }
            Phase::Initialized | Phase::Connecting => Ok(()),
        }
    }
}

#[async_trait]
impl<H: HttpExchange + 'static> Transport for BboshConnection<H> {
    async fn send(&self, data: &[u8]) -> Result<()> {
        BboshConnection::send(self, data).await
    }

    async fn recv(&self) -> Result<Bytes> {
        BboshConnection::recv(self).await
    }

    async fn close(&self) -> Result<()> {
        BboshConnection::close(self).await
    }
}
