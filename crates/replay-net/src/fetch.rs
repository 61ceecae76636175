// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! HTTP port used by the network, plus the reqwest adapter.

use std::fmt;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use replay_proto::ErrorPayload;

/// Fully built HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// Endpoint.
    pub url: String,
    /// HTTP method.
    pub method: String,
    /// Header pairs, in send order.
    pub headers: Vec<(String, String)>,
    /// Request body.
    pub body: Bytes,
}

impl FetchRequest {
    /// First header named `name` (ASCII case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Response head plus a body that arrives in chunks.
pub struct FetchResponse {
    /// HTTP status code.
    pub status: u16,
    /// `Content-Type` header, if any.
    pub content_type: Option<String>,
    /// Body chunks.
    pub body: BoxStream<'static, Result<Bytes, FetchError>>,
}

impl fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchResponse")
            .field("status", &self.status)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

/// Transport-level failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// Non-2xx status.
    #[error("unexpected status {status}")]
    Http {
        /// Status code.
        status: u16,
        /// Body text (possibly truncated).
        body: String,
    },
    /// Connection or body read failed.
    #[error("transport error: {0}")]
    Transport(String),
    /// Cancelled by an abort signal.
    #[error("request aborted")]
    Aborted,
    /// The response could not be interpreted.
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl FetchError {
    /// Serializable form carried by replay channels.
    pub fn to_payload(&self) -> ErrorPayload {
        match self {
            Self::Http { status, body } => ErrorPayload::http_status(*status, body.clone()),
            Self::Transport(msg) => ErrorPayload::transport(msg.clone()),
            Self::Aborted => ErrorPayload::aborted(),
            Self::MalformedResponse(msg) => ErrorPayload::parse(msg.clone()),
        }
    }
}

/// Performs HTTP requests. Implementations must be cheap to share.
pub trait Fetcher: Send + Sync {
    /// Send `request`; resolves once the response head is available.
    fn fetch(&self, request: FetchRequest) -> BoxFuture<'static, Result<FetchResponse, FetchError>>;
}

#[cfg(feature = "reqwest")]
pub use reqwest_fetcher::ReqwestFetcher;

#[cfg(feature = "reqwest")]
mod reqwest_fetcher {
    use futures_util::{FutureExt, StreamExt, TryStreamExt};

    use super::{BoxFuture, FetchError, FetchRequest, FetchResponse, Fetcher};

    /// [`Fetcher`] backed by a shared `reqwest::Client`.
    #[derive(Debug, Clone, Default)]
    pub struct ReqwestFetcher {
        client: reqwest::Client,
    }

    impl ReqwestFetcher {
        /// Fetcher with a default client.
        pub fn new() -> Self {
            Self::default()
        }

        /// Fetcher over a preconfigured client (timeouts, proxies, TLS).
        pub fn with_client(client: reqwest::Client) -> Self {
            Self { client }
        }
    }

    impl Fetcher for ReqwestFetcher {
        fn fetch(&self, request: FetchRequest) -> BoxFuture<'static, Result<FetchResponse, FetchError>> {
            let client = self.client.clone();
            async move {
                let method = reqwest::Method::from_bytes(request.method.as_bytes()).map_err(|e| {
                    FetchError::Transport(format!("invalid method {}: {e}", request.method))
                })?;
                let mut builder = client.request(method, &request.url).body(request.body);
                for (name, value) in &request.headers {
                    builder = builder.header(name.as_str(), value.as_str());
                }
                let response = builder
                    .send()
                    .await
                    .map_err(|e| FetchError::Transport(e.to_string()))?;

                let status = response.status().as_u16();
                let content_type = response
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let body = response
                    .bytes_stream()
                    .map_err(|e| FetchError::Transport(e.to_string()))
                    .boxed();
                Ok(FetchResponse {
                    status,
                    content_type,
                    body,
                })
            }
            .boxed()
        }
    }
}
