//! Authentication challenge handling for the WebSocket opening handshake.
//!
//! When a server answers the upgrade with `401` and a `WWW-Authenticate`
//! challenge, the connection asks its [`ChallengeHandler`] for credentials.
//! [`DispatchChallengeHandler`] routes challenges by location through a
//! [`DispatchTrie`].

mod basic;
mod dispatch;
mod trie;

pub use basic::BasicChallengeHandler;
pub use dispatch::{location_segments, DispatchChallengeHandler};
pub use trie::{DispatchTrie, NodeId, WILDCARD};

use std::sync::LazyLock;

use regex::Regex;

static REALM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i:\brealm)\s*=\s*(?:"([^"]*)"|([^\s,]+))"#).expect("valid realm regex")
});

/// A challenge seen at a location.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChallengeRequest {
    /// URL (or dotted location key) the challenge came from.
    pub location: String,
    /// Raw `WWW-Authenticate` value, e.g. `Basic realm="admin"`.
    pub challenge: String,
}

impl ChallengeRequest {
    pub fn new(location: impl Into<String>, challenge: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            challenge: challenge.into(),
        }
    }

    /// Authentication scheme token, e.g. `Basic`.
    pub fn scheme(&self) -> &str {
        self.challenge.split_whitespace().next().unwrap_or("")
    }

    /// Value of the `realm` parameter. The name matches case-insensitively, the value is kept as sent.
    pub fn realm(&self) -> Option<&str> {
        let caps = REALM.captures(&self.challenge)?;
        caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str())
    }
}

/// Credentials produced for a challenge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChallengeResponse {
    /// Value for the `Authorization` header; `None` when the handler answered without credentials.
    pub credentials: Option<String>,
}

impl ChallengeResponse {
    pub fn new(credentials: impl Into<String>) -> Self {
        Self {
            credentials: Some(credentials.into()),
        }
    }
}

/// Answers authentication challenges.
pub trait ChallengeHandler: Send + Sync {
    /// Whether this handler understands the challenge (scheme, realm).
    fn can_handle(&self, request: &ChallengeRequest) -> bool;

    /// Produce credentials, or `None` to decline.
    fn handle(&self, request: &ChallengeRequest) -> Option<ChallengeResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_and_quoted_realm() {
        let req = ChallengeRequest::new("x", r#"Basic realm="Admin Area", charset="UTF-8""#);
        assert_eq!(req.scheme(), "Basic");
        assert_eq!(req.realm(), Some("Admin Area"));
    }

    #[test]
    fn realm_name_is_case_insensitive() {
        let req = ChallengeRequest::new("x", r#"Basic REALM="Mixed""#);
        assert_eq!(req.realm(), Some("Mixed"));
        let req = ChallengeRequest::new("x", "Negotiate Realm=plain");
        assert_eq!(req.realm(), Some("plain"));
    }

    #[test]
    fn missing_realm() {
        let req = ChallengeRequest::new("x", "Bearer");
        assert_eq!(req.scheme(), "Bearer");
        assert_eq!(req.realm(), None);
        assert_eq!(ChallengeRequest::new("x", "").scheme(), "");
    }
}
