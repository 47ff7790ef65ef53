use std::sync::Arc;

use tracing::{debug, trace};
use url::Url;

use super::trie::DispatchTrie;
use super::{ChallengeHandler, ChallengeRequest, ChallengeResponse};
use crate::error::Result;

/// Trie segments for a location.
///
/// URLs become their host labels in reverse (`com`, `example`, `www`), the
/// port, then the path segments, so shorter prefixes are more general.
/// Anything else is read as a dotted key such as `com.example.*`.
pub fn location_segments(location: &str) -> Vec<String> {
    if location.contains("://") {
        if let Ok(url) = Url::parse(location) {
            let mut segments: Vec<String> = url
                .host_str()
                .unwrap_or("")
                .split('.')
                .rev()
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            if let Some(port) = url.port_or_known_default() {
                segments.push(port.to_string());
            }
            if let Some(path) = url.path_segments() {
                segments.extend(path.filter(|s| !s.is_empty()).map(str::to_string));
            }
            return segments;
        }
    }
    location.split('.').map(str::to_string).collect()
}

/// Routes each challenge to the handlers registered for the closest location.
///
/// Candidates are tried most specific location first and, within a location,
/// in registration order. Handlers that cannot handle the challenge, or
/// decline it, are skipped.
#[derive(Default)]
pub struct DispatchChallengeHandler {
    trie: DispatchTrie<Arc<dyn ChallengeHandler>>,
}

impl DispatchChallengeHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for a URL or dotted location; `*` matches any one segment.
    pub fn register(&mut self, location: &str, handler: Arc<dyn ChallengeHandler>) -> Result<()> {
        let segments = location_segments(location);
        let refs: Vec<&str> = segments.iter().map(String::as_str).collect();
        let node = self.trie.insert_path(&refs, handler)?;
        debug!(location = %self.trie.full_name(node), "registered challenge handler");
        Ok(())
    }

    fn candidates<'a>(
        &'a self,
        request: &'a ChallengeRequest,
    ) -> impl Iterator<Item = &'a Arc<dyn ChallengeHandler>> + 'a {
        let segments = location_segments(&request.location);
        let refs: Vec<&str> = segments.iter().map(String::as_str).collect();
        self.trie
            .lookup_path(&refs)
            .into_iter()
            .flat_map(move |node| self.trie.values(node).iter())
            .filter(move |h| h.can_handle(request))
    }
}

impl ChallengeHandler for DispatchChallengeHandler {
    fn can_handle(&self, request: &ChallengeRequest) -> bool {
        self.candidates(request).next().is_some()
    }

    fn handle(&self, request: &ChallengeRequest) -> Option<ChallengeResponse> {
        let response = self.candidates(request).find_map(|h| h.handle(request));
        trace!(
            location = %request.location,
            scheme = request.scheme(),
            answered = response.is_some(),
            "challenge dispatched"
        );
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Answers with a fixed token for one scheme and, optionally, one realm.
    struct Fixed {
        scheme: &'static str,
        realm: Option<&'static str>,
        answer: Option<&'static str>,
    }

    impl ChallengeHandler for Fixed {
        fn can_handle(&self, request: &ChallengeRequest) -> bool {
            request.scheme().eq_ignore_ascii_case(self.scheme)
                && self.realm.is_none_or(|r| request.realm() == Some(r))
        }

        fn handle(&self, _: &ChallengeRequest) -> Option<ChallengeResponse> {
            self.answer.map(ChallengeResponse::new)
        }
    }

    fn fixed(scheme: &'static str, realm: Option<&'static str>, answer: &'static str) -> Arc<dyn ChallengeHandler> {
        Arc::new(Fixed {
            scheme,
            realm,
            answer: Some(answer),
        })
    }

    fn answer(d: &DispatchChallengeHandler, location: &str, challenge: &str) -> Option<String> {
        d.handle(&ChallengeRequest::new(location, challenge))
            .and_then(|r| r.credentials)
    }

    #[test]
    fn url_locations_become_reversed_segments() {
        assert_eq!(
            location_segments("http://www.example.com:8080/chat/room"),
            ["com", "example", "www", "8080", "chat", "room"]
        );
        assert_eq!(location_segments("ws://example.com"), ["com", "example", "80"]);
        assert_eq!(location_segments("a.b.*"), ["a", "b", "*"]);
    }

    #[test]
    fn falls_back_to_less_specific_location() {
        let mut d = DispatchChallengeHandler::new();
        d.register("a.b", fixed("Basic", None, "ab")).unwrap();
        assert_eq!(answer(&d, "a.b.c", "Basic"), Some("ab".into()));
        assert_eq!(answer(&d, "a.c", "Basic"), None);
    }

    #[test]
    fn realm_mismatch_falls_through() {
        let mut d = DispatchChallengeHandler::new();
        d.register("a", fixed("Basic", None, "general")).unwrap();
        d.register("a.b", fixed("Basic", Some("admin"), "admin")).unwrap();
        d.register("a.b", fixed("Basic", Some("users"), "users")).unwrap();

        assert_eq!(answer(&d, "a.b", r#"Basic realm="users""#), Some("users".into()));
        assert_eq!(answer(&d, "a.b", r#"Basic realm="admin""#), Some("admin".into()));
        assert_eq!(answer(&d, "a.b", r#"Basic realm="Admin""#), Some("general".into()));
        assert_eq!(answer(&d, "a.b", r#"Digest realm="admin""#), None);
    }

    #[test]
    fn declining_handler_is_skipped() {
        let mut d = DispatchChallengeHandler::new();
        d.register(
            "a.*",
            Arc::new(Fixed {
                scheme: "Basic",
                realm: None,
                answer: None,
            }),
        )
        .unwrap();
        d.register("a", fixed("Basic", None, "parent")).unwrap();
        let req = ChallengeRequest::new("a.x", "Basic");
        assert!(d.can_handle(&req));
        assert_eq!(answer(&d, "a.x", "Basic"), Some("parent".into()));
    }

    #[test]
    fn url_registration_matches_paths_below_it() {
        let mut d = DispatchChallengeHandler::new();
        d.register("http://example.com", fixed("Basic", None, "site")).unwrap();
        assert_eq!(answer(&d, "http://example.com/chat", "Basic"), Some("site".into()));
        assert_eq!(answer(&d, "http://example.com:81/chat", "Basic"), None);
        assert!(!d.can_handle(&ChallengeRequest::new("http://other.org/", "Basic")));
    }
}
