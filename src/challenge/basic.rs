use base64::Engine;

use super::{ChallengeHandler, ChallengeRequest, ChallengeResponse};

type CredentialSource = Box<dyn Fn(&ChallengeRequest) -> Option<(String, String)> + Send + Sync>;

/// Answers `Basic` challenges with `user:password` from a callback.
pub struct BasicChallengeHandler {
    realm: Option<String>,
    credentials: CredentialSource,
}

impl BasicChallengeHandler {
    /// Handler for any realm. The callback may return `None` to decline.
    pub fn new<F>(credentials: F) -> Self
    where
        F: Fn(&ChallengeRequest) -> Option<(String, String)> + Send + Sync + 'static,
    {
        Self {
            realm: None,
            credentials: Box::new(credentials),
        }
    }

    /// Handler with fixed credentials.
    pub fn with_credentials(user: impl Into<String>, password: impl Into<String>) -> Self {
        let user = user.into();
        let password = password.into();
        Self::new(move |_| Some((user.clone(), password.clone())))
    }

    /// Only answer challenges whose realm equals `realm` exactly.
    pub fn for_realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = Some(realm.into());
        self
    }
}

impl ChallengeHandler for BasicChallengeHandler {
    fn can_handle(&self, request: &ChallengeRequest) -> bool {
        request.scheme().eq_ignore_ascii_case("Basic")
            && self
                .realm
                .as_deref()
                .is_none_or(|realm| request.realm() == Some(realm))
    }

    fn handle(&self, request: &ChallengeRequest) -> Option<ChallengeResponse> {
        let (user, password) = (self.credentials)(request)?;
        let token = base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, password));
        Some(ChallengeResponse::new(format!("Basic {}", token)))
    }
}
