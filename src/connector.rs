//! Open connections by URL.
//!
//! A [`Connector`] maps URL schemes to [`ProtocolHandler`]s. The defaults are
//! `tcp` and `ws`, plus `bbosh` and `bbosh+http` with the `full` feature.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};
use url::Url;

use crate::bbosh::BboshConnection;
use crate::challenge::ChallengeHandler;
use crate::config::ConnectOptions;
use crate::error::ConnectionError;
use crate::extension::ExtensionRegistry;
use crate::http::HttpExchange;
use crate::transport::{TcpTransport, Transport};
use crate::websocket;
use crate::Result;

/// Opens connections for one or more URL schemes.
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    fn schemes(&self) -> Vec<&'static str>;

    async fn open_connection(&self, url: &Url) -> Result<Arc<dyn Transport>>;
}

/// `tcp://host:port`
pub struct TcpHandler {
    options: ConnectOptions,
}

impl TcpHandler {
    pub fn new(options: ConnectOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl ProtocolHandler for TcpHandler {
    fn schemes(&self) -> Vec<&'static str> {
        vec!["tcp"]
    }

    async fn open_connection(&self, url: &Url) -> Result<Arc<dyn Transport>> {
        if url.port().is_none() {
            return Err(ConnectionError::InvalidUrl(format!("{} has no port", url)).into());
        }
        let stream = websocket::dial(url, &self.options).await?;
        Ok(Arc::new(TcpTransport::new(stream)))
    }
}

/// `ws://` with extension negotiation and optional challenge handling.
pub struct WebSocketHandler {
    options: ConnectOptions,
    registry: ExtensionRegistry,
    challenges: Option<Arc<dyn ChallengeHandler>>,
}

impl WebSocketHandler {
    pub fn new(options: ConnectOptions) -> Self {
        Self {
            options,
            registry: ExtensionRegistry::new(),
            challenges: None,
        }
    }

    pub fn with_registry(mut self, registry: ExtensionRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_challenge_handler(mut self, handler: Arc<dyn ChallengeHandler>) -> Self {
        self.challenges = Some(handler);
        self
    }
}

#[async_trait]
impl ProtocolHandler for WebSocketHandler {
    fn schemes(&self) -> Vec<&'static str> {
        vec!["ws"]
    }

    async fn open_connection(&self, url: &Url) -> Result<Arc<dyn Transport>> {
        let ws = websocket::connect(url, &self.options, &self.registry, self.challenges.as_deref()).await?;
        Ok(Arc::new(ws))
    }
}

/// `bbosh://` and `bbosh+http://`: the factory is the same URL over `http`.
pub struct BboshHandler<H> {
    http: Arc<H>,
    options: ConnectOptions,
}

impl<H: HttpExchange + 'static> BboshHandler<H> {
    pub fn new(http: Arc<H>, options: ConnectOptions) -> Self {
        Self { http, options }
    }

    /// Factory URL for a `bbosh` URL.
    pub fn factory_url(url: &Url) -> Result<Url> {
        let rest = &url.as_str()[url.scheme().len()..];
        Ok(Url::parse(&format!("http{}", rest))?)
    }
}

#[async_trait]
impl<H: HttpExchange + 'static> ProtocolHandler for BboshHandler<H> {
    fn schemes(&self) -> Vec<&'static str> {
        vec!["bbosh", "bbosh+http"]
    }

    async fn open_connection(&self, url: &Url) -> Result<Arc<dyn Transport>> {
        let factory = Self::factory_url(url)?;
        let conn = BboshConnection::new(self.http.clone(), factory, &self.options)?;
        conn.connect(self.options.connect_timeout()).await?;
        Ok(Arc::new(conn))
    }
}

/// Scheme to handler registry.
#[derive(Default)]
pub struct Connector {
    handlers: HashMap<String, Arc<dyn ProtocolHandler>>,
}

impl Connector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector with the built-in handlers.
    pub fn with_defaults(options: ConnectOptions) -> Result<Self> {
        let mut connector = Self::new();
        connector.register(Arc::new(TcpHandler::new(options.clone())));
        connector.register(Arc::new(WebSocketHandler::new(options.clone())));
        #[cfg(feature = "full")]
        {
            let http = Arc::new(crate::http::ReqwestExchange::new()?);
            connector.register(Arc::new(BboshHandler::new(http, options)));
        }
        Ok(connector)
    }

    /// Register `handler` for each of its schemes, replacing earlier ones.
    pub fn register(&mut self, handler: Arc<dyn ProtocolHandler>) {
        for scheme in handler.schemes() {
            debug!(scheme, "registered protocol handler");
            self.handlers.insert(scheme.to_string(), handler.clone());
        }
    }

    pub fn schemes(&self) -> Vec<&str> {
        let mut schemes: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        schemes.sort_unstable();
        schemes
    }

    /// Open a connection to `url` with the handler for its scheme.
    pub async fn open(&self, url: &str) -> Result<Arc<dyn Transport>> {
        let url = Url::parse(url)?;
        let handler = self
            .handlers
            .get(url.scheme())
            .ok_or_else(|| ConnectionError::UnsupportedScheme(url.scheme().to_string()))?;
        let transport = handler.open_connection(&url).await?;
        info!(%url, "connection opened");
        Ok(transport)
    }
}
