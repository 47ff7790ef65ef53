use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::StreamExt;
use tokio::sync::mpsc;

use super::{Headers, HttpExchange, HttpRequest, HttpResponse, Method, StreamingResponse};
use crate::error::{ConnectionError, Error};
use crate::Result;

fn http_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        return Error::Connection(ConnectionError::Timeout);
    }
    Error::Connection(ConnectionError::Http(e.to_string()))
}

fn method(m: Method) -> reqwest::Method {
    match m {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Delete => reqwest::Method::DELETE,
    }
}

fn headers(map: &reqwest::header::HeaderMap) -> Headers {
    map.iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

/// [`HttpExchange`] backed by `reqwest`. Redirects are never followed here;
/// callers apply their own [`RedirectPolicy`](super::RedirectPolicy).
#[derive(Clone, Debug)]
pub struct ReqwestExchange {
    client: reqwest::Client,
}

impl ReqwestExchange {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(http_error)?;
        Ok(Self { client })
    }

    fn builder(&self, request: &HttpRequest) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(method(request.method), request.url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder
    }
}

#[async_trait]
impl HttpExchange for ReqwestExchange {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let response = self
            .builder(&request)
            .body(request.body)
            .send()
            .await
            .map_err(http_error)?;
        let status = response.status().as_u16();
        let headers = headers(response.headers());
        let body = response.bytes().await.map_err(http_error)?;
        Ok(HttpResponse { status, headers, body })
    }

    async fn open_stream(
        &self,
        request: HttpRequest,
        mut upstream: mpsc::Receiver<Bytes>,
    ) -> Result<StreamingResponse> {
        let chunks = futures::stream::poll_fn(move |cx| {
            upstream
                .poll_recv(cx)
                .map(|chunk| chunk.map(Ok::<_, std::io::Error>))
        });
        let response = self
            .builder(&request)
            .body(reqwest::Body::wrap_stream(chunks))
            .send()
            .await
            .map_err(http_error)?;
        let status = response.status().as_u16();
        let headers = headers(response.headers());
        let body = response.bytes_stream().map(|r| r.map_err(http_error)).boxed();
        Ok(StreamingResponse { status, headers, body })
    }
}
