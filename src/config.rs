//! Connection options shared by every transport.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bbosh::BboshStrategy;
use crate::http::RedirectPolicy;
use crate::Result;

/// Default strategy preference offered to a BBOSH factory.
pub const DEFAULT_BBOSH_STRATEGIES: [&str; 3] = [
    "streaming;request=chunked",
    "long-polling;interval=30s",
    "polling;interval=5s",
];

/// Options applied while opening and running a connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectOptions {
    pub connect_timeout_ms: u64,
    pub redirect_policy: RedirectPolicy,
    pub max_redirects: u32,
    pub max_auth_attempts: u32,
    /// Extension names offered during the WebSocket handshake, in order.
    pub extensions: Vec<String>,
    /// Values for `Sec-WebSocket-Protocol`; empty means the header is omitted.
    pub protocols: Vec<String>,
    /// BBOSH strategies in preference order, in wire form.
    pub bbosh_strategies: Vec<String>,
    pub bbosh_initial_sequence: u64,
    /// Largest reassembled WebSocket message accepted.
    pub max_message_size: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 30_000,
            redirect_policy: RedirectPolicy::Origin,
            max_redirects: 5,
            max_auth_attempts: 3,
            extensions: Vec::new(),
            protocols: Vec::new(),
            bbosh_strategies: DEFAULT_BBOSH_STRATEGIES.iter().map(|s| s.to_string()).collect(),
            bbosh_initial_sequence: 0,
            max_message_size: 16 * 1024 * 1024,
        }
    }
}

impl ConnectOptions {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis().try_into().unwrap_or(u64::MAX);
        self
    }

    pub fn with_redirect_policy(mut self, policy: RedirectPolicy) -> Self {
        self.redirect_policy = policy;
        self
    }

    pub fn with_extension(mut self, name: impl Into<String>) -> Self {
        self.extensions.push(name.into());
        self
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocols.push(protocol.into());
        self
    }

    pub fn with_bbosh_strategies<I, S>(mut self, strategies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bbosh_strategies = strategies.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Parse [`bbosh_strategies`](Self::bbosh_strategies).
    pub fn strategies(&self) -> Result<Vec<BboshStrategy>> {
        self.bbosh_strategies
            .iter()
            .map(|s| s.parse::<BboshStrategy>().map_err(Into::into))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let o = ConnectOptions::default();
        assert_eq!(o.connect_timeout(), Duration::from_secs(30));
        assert_eq!(o.redirect_policy, RedirectPolicy::Origin);
        assert_eq!(o.max_redirects, 5);
        assert_eq!(o.max_auth_attempts, 3);
        assert_eq!(o.strategies().unwrap().len(), 3);
        assert_eq!(o.strategies().unwrap()[0], BboshStrategy::Streaming);
    }

    #[test]
    fn invalid_strategy_is_reported() {
        let o = ConnectOptions::default().with_bbosh_strategies(["carrier-pigeon"]);
        assert!(o.strategies().is_err());
    }

    #[test]
    fn builders_chain() {
        let o = ConnectOptions::default()
            .with_connect_timeout(Duration::from_millis(250))
            .with_redirect_policy(RedirectPolicy::Never)
            .with_extension("x-idle-timeout")
            .with_protocol("chat");
        assert_eq!(o.connect_timeout_ms, 250);
        assert_eq!(o.redirect_policy, RedirectPolicy::Never);
        assert_eq!(o.extensions, ["x-idle-timeout"]);
        assert_eq!(o.protocols, ["chat"]);
    }
}
