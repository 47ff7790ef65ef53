//! Client side of the HTTP upgrade (RFC 6455 section 4).

use base64::Engine;
use bytes::{Buf, BytesMut};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use url::Url;

use crate::error::{ConnectionError, Error, NegotiationError};
use crate::extension::ExtensionHeader;
use crate::http::Headers;
use crate::Result;

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Largest response head accepted before the upgrade completes.
const MAX_HEAD_LEN: usize = 16 * 1024;

pub const HEADER_EXTENSIONS: &str = "Sec-WebSocket-Extensions";
pub const HEADER_PROTOCOL: &str = "Sec-WebSocket-Protocol";

/// `Sec-WebSocket-Accept` value the server must return for `client_key`.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Random 16-byte nonce, base64 encoded.
pub fn generate_key() -> String {
    let nonce: [u8; 16] = rand::random();
    base64::engine::general_purpose::STANDARD.encode(nonce)
}

/// The upgrade request for one attempt.
#[derive(Clone, Debug)]
pub struct HandshakeRequest {
    url: Url,
    key: String,
    protocols: Vec<String>,
    extensions: Vec<ExtensionHeader>,
    authorization: Option<String>,
}

impl HandshakeRequest {
    pub fn new(url: &Url) -> Result<Self> {
        if url.host_str().is_none() {
            return Err(ConnectionError::InvalidUrl(format!("{} has no host", url)).into());
        }
        Ok(Self {
            url: url.clone(),
            key: generate_key(),
            protocols: Vec::new(),
            extensions: Vec::new(),
            authorization: None,
        })
    }

    pub fn with_protocols(mut self, protocols: &[String]) -> Self {
        self.protocols = protocols.to_vec();
        self
    }

    pub fn with_extensions(mut self, extensions: Vec<ExtensionHeader>) -> Self {
        self.extensions = extensions;
        self
    }

    pub fn with_authorization(mut self, authorization: Option<String>) -> Self {
        self.authorization = authorization;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn host_header(&self) -> String {
        let host = self.url.host_str().unwrap_or_default();
        match self.url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }

    fn target(&self) -> String {
        match self.url.query() {
            Some(q) => format!("{}?{}", self.url.path(), q),
            None => self.url.path().to_string(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut head = format!(
            "GET {} HTTP/1.1\r\n\
             Host: {}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {}\r\n\
             Sec-WebSocket-Version: 13\r\n",
            self.target(),
            self.host_header(),
            self.key
        );
        if !self.protocols.is_empty() {
            head.push_str(&format!("{}: {}\r\n", HEADER_PROTOCOL, self.protocols.join(", ")));
        }
        if !self.extensions.is_empty() {
            let offers: Vec<String> = self.extensions.iter().map(ToString::to_string).collect();
            head.push_str(&format!("{}: {}\r\n", HEADER_EXTENSIONS, offers.join(", ")));
        }
        if let Some(auth) = &self.authorization {
            head.push_str(&format!("Authorization: {}\r\n", auth));
        }
        head.push_str("\r\n");
        head.into_bytes()
    }

    /// Check a `101` answer. Returns the subprotocol the server selected.
    pub fn validate(&self, response: &ResponseHead) -> Result<Option<String>> {
        if response.status != 101 {
            return Err(NegotiationError::UnexpectedStatus(response.status).into());
        }
        let upgrade = response
            .header("Upgrade")
            .ok_or(NegotiationError::MissingHeader("Upgrade"))?;
        if !upgrade.eq_ignore_ascii_case("websocket") {
            return Err(NegotiationError::InvalidHeader {
                name: "Upgrade",
                value: upgrade.to_string(),
            }
            .into());
        }
        let connection = response
            .header("Connection")
            .ok_or(NegotiationError::MissingHeader("Connection"))?;
        if !connection
            .split(',')
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        {
            return Err(NegotiationError::InvalidHeader {
                name: "Connection",
                value: connection.to_string(),
            }
            .into());
        }
        let accept = response
            .header("Sec-WebSocket-Accept")
            .ok_or(NegotiationError::MissingHeader("Sec-WebSocket-Accept"))?;
        let expected = accept_key(&self.key);
        if accept.trim() != expected {
            return Err(NegotiationError::InvalidAccept {
                expected,
                actual: accept.to_string(),
            }
            .into());
        }
        match response.header(HEADER_PROTOCOL) {
            None => Ok(None),
            Some(chosen) if self.protocols.iter().any(|p| p == chosen.trim()) => {
                Ok(Some(chosen.trim().to_string()))
            }
            Some(chosen) => Err(NegotiationError::InvalidHeader {
                name: HEADER_PROTOCOL,
                value: chosen.to_string(),
            }
            .into()),
        }
    }
}

/// Status line and headers of an HTTP/1.1 response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
}

fn malformed(msg: &str) -> Error {
    Error::Connection(ConnectionError::Http(format!("malformed response head: {}", msg)))
}

impl ResponseHead {
    /// Parse a complete head, terminating blank line optional.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data).map_err(|_| malformed("invalid UTF-8"))?;
        let mut lines = text.split("\r\n");
        let status_line = lines.next().filter(|l| !l.is_empty()).ok_or_else(|| malformed("empty"))?;
        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        if !version.starts_with("HTTP/") {
            return Err(malformed("missing HTTP version"));
        }
        let status = parts
            .next()
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or_else(|| malformed("invalid status code"))?;
        let reason = parts.next().unwrap_or_default().to_string();

        let mut headers = Headers::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let (name, value) = line.split_once(':').ok_or_else(|| malformed("header without colon"))?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
        Ok(Self {
            status,
            reason,
            headers,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self.status, 301 | 302 | 303 | 307 | 308)
    }
}

/// Write the upgrade request and read the response head.
///
/// Bytes the server sent after the head (early frames) are returned alongside it.
pub async fn exchange<S>(stream: &mut S, request: &HandshakeRequest) -> Result<(ResponseHead, BytesMut)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&request.to_bytes()).await?;
    stream.flush().await?;

    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = ResponseHead::parse(&buf[..end])?;
            buf.advance(end + 4);
            return Ok((head, buf));
        }
        if buf.len() > MAX_HEAD_LEN {
            return Err(malformed("head too large"));
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(ConnectionError::Closed.into());
        }
    }
}
