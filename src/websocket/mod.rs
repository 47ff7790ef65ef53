//! WebSocket client: opening handshake plus the framed connection.
//!
//! [`connect`] dials TCP, performs the upgrade, follows redirects the
//! [`RedirectPolicy`](crate::http::RedirectPolicy) allows and answers `401`
//! challenges through a [`ChallengeHandler`]. Only `ws` URLs are dialed.

mod connection;
mod handshake;

pub use connection::{Message, WebSocket};
pub use handshake::{accept_key, exchange, generate_key, HandshakeRequest, ResponseHead};

use tokio::net::TcpStream;
use tracing::{debug, info};
use url::{Host, Url};

use crate::challenge::{ChallengeHandler, ChallengeRequest};
use crate::config::ConnectOptions;
use crate::error::{ConnectionError, Error, NegotiationError};
use crate::extension::{ExtensionPipeline, ExtensionRegistry};
use crate::Result;

/// Open a TCP stream to the host and port of `url`, bounded by the connect timeout.
pub(crate) async fn dial(url: &Url, options: &ConnectOptions) -> Result<TcpStream> {
    let host = match url.host() {
        Some(Host::Domain(d)) => d.to_string(),
        Some(Host::Ipv4(a)) => a.to_string(),
        Some(Host::Ipv6(a)) => a.to_string(),
        None => return Err(ConnectionError::InvalidUrl(format!("{} has no host", url)).into()),
    };
    let port = url
        .port_or_known_default()
        .ok_or_else(|| ConnectionError::InvalidUrl(format!("{} has no port", url)))?;
    match tokio::time::timeout(options.connect_timeout(), TcpStream::connect((host.as_str(), port))).await {
        Ok(stream) => Ok(stream?),
        Err(_) => Err(ConnectionError::Timeout.into()),
    }
}

/// Open a WebSocket to `url`.
///
/// Extensions named in `options.extensions` are offered when `registry` knows
/// them. On `401` the `WWW-Authenticate` challenge goes to `challenges`; the
/// attempt is retried with its answer until `max_auth_attempts` is reached.
pub async fn connect(
    url: &Url,
    options: &ConnectOptions,
    registry: &ExtensionRegistry,
    challenges: Option<&dyn ChallengeHandler>,
) -> Result<WebSocket<TcpStream>> {
    let mut current = url.clone();
    let mut redirects = 0;
    let mut auth_attempts = 0;
    let mut authorization: Option<String> = None;

    loop {
        if current.scheme() != "ws" {
            return Err(ConnectionError::UnsupportedScheme(current.scheme().to_string()).into());
        }
        let offered = ExtensionPipeline::offer(registry, &options.extensions);
        let request = HandshakeRequest::new(&current)?
            .with_protocols(&options.protocols)
            .with_extensions(offered.clone())
            .with_authorization(authorization.clone());

        let mut stream = dial(&current, options).await?;
        let (head, leftover) = match tokio::time::timeout(options.connect_timeout(), exchange(&mut stream, &request)).await {
            Ok(result) => result?,
            Err(_) => return Err(ConnectionError::Timeout.into()),
        };
        debug!(url = %current, status = head.status, "handshake response");

        if head.status == 101 {
            let protocol = request.validate(&head)?;
            let pipeline = ExtensionPipeline::negotiate(registry, &offered, head.header(handshake::HEADER_EXTENSIONS))?;
            info!(url = %current, extensions = ?pipeline.names(), "websocket connected");
            return Ok(WebSocket::new(stream, leftover, pipeline, protocol, options.max_message_size));
        }

        if head.is_redirect() {
            let location = head
                .header("Location")
                .ok_or(NegotiationError::MissingHeader("Location"))?;
            let target = current
                .join(location)
                .map_err(|_| NegotiationError::InvalidLocation(location.to_string()))?;
            if redirects >= options.max_redirects {
                return Err(ConnectionError::TooManyRedirects.into());
            }
            if !options.redirect_policy.allows(&current, &target) {
                return Err(ConnectionError::RedirectRefused(target.to_string()).into());
            }
            redirects += 1;
            debug!(from = %current, to = %target, "following redirect");
            current = target;
            authorization = None;
            continue;
        }

        if head.status == 401 {
            let unauthenticated = || Error::Unauthenticated {
                location: current.to_string(),
            };
            if auth_attempts >= options.max_auth_attempts {
                return Err(unauthenticated());
            }
            auth_attempts += 1;
            let challenge = ChallengeRequest::new(current.as_str(), head.header("WWW-Authenticate").unwrap_or_default());
            let answer = challenges
                .filter(|h| h.can_handle(&challenge))
                .and_then(|h| h.handle(&challenge))
                .and_then(|r| r.credentials);
            match answer {
                Some(credentials) => {
                    debug!(url = %current, scheme = challenge.scheme(), "retrying with credentials");
                    authorization = Some(credentials);
                    continue;
                }
                None => return Err(unauthenticated()),
            }
        }

        return Err(NegotiationError::UnexpectedStatus(head.status).into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge::BasicChallengeHandler;
    use crate::http::RedirectPolicy;
    use crate::transport::Transport;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Accepts connections and answers each request head with `respond`.
    /// Request heads are recorded. A `101` answer keeps the socket and echoes one binary frame.
    async fn server<F>(respond: F) -> (Url, Arc<Mutex<Vec<String>>>)
    where
        F: Fn(usize, &str) -> String + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = Url::parse(&format!("ws://{}/chat", listener.local_addr().unwrap())).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        tokio::spawn(async move {
            let mut n = 0;
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    let read = socket.read(&mut chunk).await.unwrap();
                    if read == 0 {
                        break;
                    }
                    buf.extend_from_slice(&chunk[..read]);
                }
                let head = String::from_utf8_lossy(&buf).into_owned();
                let answer = respond(n, &head);
                log.lock().unwrap().push(head);
                n += 1;
                socket.write_all(answer.as_bytes()).await.unwrap();
                if answer.starts_with("HTTP/1.1 101") {
                    tokio::spawn(async move {
                        let mut frame = [0u8; 6 + 16];
                        let read = socket.read(&mut frame).await.unwrap_or(0);
                        if read >= 6 {
                            let len = (frame[1] & 0x7f) as usize;
                            let key = [frame[2], frame[3], frame[4], frame[5]];
                            let payload: Vec<u8> = frame[6..6 + len]
                                .iter()
                                .enumerate()
                                .map(|(i, b)| b ^ key[i % 4])
                                .collect();
                            let mut out = vec![0x82, len as u8];
                            out.extend_from_slice(&payload);
                            let _ = socket.write_all(&out).await;
                        }
                    });
                }
            }
        });
        (url, seen)
    }

    fn key_of(head: &str) -> String {
        head.lines()
            .find_map(|l| l.strip_prefix("Sec-WebSocket-Key: "))
            .unwrap()
            .trim()
            .to_string()
    }

    fn switching(head: &str) -> String {
        format!(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
            accept_key(&key_of(head))
        )
    }

    fn options() -> ConnectOptions {
        ConnectOptions::default().with_connect_timeout(std::time::Duration::from_secs(5))
    }

    #[tokio::test]
    async fn connects_and_exchanges_frames() {
        let (url, seen) = server(|_, head| switching(head)).await;
        let ws = connect(&url, &options(), &ExtensionRegistry::new(), None).await.unwrap();
        Transport::send(&ws, b"echo").await.unwrap();
        assert_eq!(&Transport::recv(&ws).await.unwrap()[..], b"echo");
        assert!(seen.lock().unwrap()[0].starts_with("GET /chat HTTP/1.1"));
    }

    #[tokio::test]
    async fn follows_same_origin_redirect() {
        let (url, seen) = server(|n, head| match n {
            0 => "HTTP/1.1 302 Found\r\nLocation: /moved\r\nContent-Length: 0\r\n\r\n".to_string(),
            _ => switching(head),
        })
        .await;
        connect(&url, &options(), &ExtensionRegistry::new(), None).await.unwrap();
        assert!(seen.lock().unwrap()[1].starts_with("GET /moved HTTP/1.1"));
    }

    #[tokio::test]
    async fn refuses_redirect_under_never() {
        let (url, _) = server(|_, _| "HTTP/1.1 301 Moved\r\nLocation: /elsewhere\r\n\r\n".to_string()).await;
        let opts = options().with_redirect_policy(RedirectPolicy::Never);
        let err = connect(&url, &opts, &ExtensionRegistry::new(), None).await.err().unwrap();
        assert!(matches!(err, Error::Connection(ConnectionError::RedirectRefused(_))));
    }

    #[tokio::test]
    async fn redirect_loop_is_bounded() {
        let (url, seen) = server(|_, _| "HTTP/1.1 307 Again\r\nLocation: /chat\r\n\r\n".to_string()).await;
        let mut opts = options();
        opts.max_redirects = 2;
        let err = connect(&url, &opts, &ExtensionRegistry::new(), None).await.err().unwrap();
        assert!(matches!(err, Error::Connection(ConnectionError::TooManyRedirects)));
        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn answers_basic_challenge() {
        let (url, seen) = server(|_, head| {
            if head.contains("Authorization: Basic dTpw") {
                switching(head)
            } else {
                "HTTP/1.1 401 Unauthorized\r\nWWW-Authenticate: Basic realm=\"chat\"\r\n\r\n".to_string()
            }
        })
        .await;
        let handler = BasicChallengeHandler::with_credentials("u", "p").for_realm("chat");
        connect(&url, &options(), &ExtensionRegistry::new(), Some(&handler)).await.unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(!seen[0].contains("Authorization"));
    }

    #[tokio::test]
    async fn unanswered_challenge_is_unauthenticated() {
        let (url, _) =
            server(|_, _| "HTTP/1.1 401 Unauthorized\r\nWWW-Authenticate: Digest realm=\"x\"\r\n\r\n".to_string()).await;
        let handler = BasicChallengeHandler::with_credentials("u", "p");
        let err = connect(&url, &options(), &ExtensionRegistry::new(), Some(&handler)).await.err().unwrap();
        assert!(matches!(err, Error::Unauthenticated { .. }));
        let err = connect(&url, &options(), &ExtensionRegistry::new(), None).await.err().unwrap();
        assert!(matches!(err, Error::Unauthenticated { .. }));
    }

    #[tokio::test]
    async fn auth_attempts_are_bounded() {
        let (url, seen) =
            server(|_, _| "HTTP/1.1 401 Unauthorized\r\nWWW-Authenticate: Basic realm=\"x\"\r\n\r\n".to_string()).await;
        let handler = BasicChallengeHandler::with_credentials("u", "wrong");
        let err = connect(&url, &options(), &ExtensionRegistry::new(), Some(&handler)).await.err().unwrap();
        assert!(matches!(err, Error::Unauthenticated { .. }));
        assert_eq!(seen.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn wss_is_not_dialed() {
        let url = Url::parse("wss://example.com/").unwrap();
        let err = connect(&url, &options(), &ExtensionRegistry::new(), None).await.err().unwrap();
        assert!(matches!(err, Error::Connection(ConnectionError::UnsupportedScheme(s)) if s == "wss"));
    }
}
