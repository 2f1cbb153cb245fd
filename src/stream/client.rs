//! HTTP transport for text event streams.
//!
//! The client opens request/response sessions (chat, sync) and the
//! notification push channel. Every request carries the bearer credential
//! read from a [`SessionContext`] at open time; the response body is handed
//! to a [`FrameStream`] undecoded.

use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use reqwest::{Client, Method, Response, StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::context::SessionContext;
use crate::retry::{with_timeout, ReconnectPolicy};
use crate::stream::framer::FrameStream;

const ERROR_BODY_SNIPPET_LEN: usize = 220;
const ERROR_BODY_READ_LIMIT: usize = 16 * 1024;
const EVENT_STREAM_MIME: &str = "text/event-stream";
/// Local development base URL.
pub const LOCAL_BASE_URL: &str = "http://localhost:8080";
/// Default path of the chat token stream.
pub const CHAT_STREAM_PATH: &str = "/api/ai/chat/stream";
/// Default path of the sync progress stream.
pub const SYNC_STREAM_PATH: &str = "/api/sync/stream";
/// Default path of the notification push channel.
pub const NOTIFICATIONS_PATH: &str = "/api/notifications/stream";

/// Raw body chunks of one open stream.
pub type ChunkStream = BoxStream<'static, Result<Bytes, StreamClientError>>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StreamDefaults;

impl StreamDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const ESTABLISH_TIMEOUT: Duration = Duration::from_secs(15);
    pub const RECONNECT_DELAY: Duration = ReconnectPolicy::DEFAULT_DELAY;
}

/// Paths of the three stream endpoints, relative to the base URL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamPaths {
    pub chat: String,
    pub sync: String,
    pub notifications: String,
}

impl Default for StreamPaths {
    fn default() -> Self {
        Self {
            chat: CHAT_STREAM_PATH.to_string(),
            sync: SYNC_STREAM_PATH.to_string(),
            notifications: NOTIFICATIONS_PATH.to_string(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct StreamClientOptions {
    /// TCP/TLS connect timeout.
    pub connect_timeout: Duration,
    /// Upper bound for receiving response headers when a stream is opened.
    ///
    /// The body itself is unbounded; streams stay open as long as the server
    /// keeps them open.
    pub establish_timeout: Duration,
    /// Delay policy for the notification push channel.
    pub reconnect: ReconnectPolicy,
    pub paths: StreamPaths,
}

impl Default for StreamClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: StreamDefaults::CONNECT_TIMEOUT,
            establish_timeout: StreamDefaults::ESTABLISH_TIMEOUT,
            reconnect: ReconnectPolicy::fixed(StreamDefaults::RECONNECT_DELAY),
            paths: StreamPaths::default(),
        }
    }
}

/// One request that opens an event stream.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamRequest {
    pub method: Method,
    /// Path relative to the client's base URL.
    pub path: String,
    /// JSON body, sent only when present.
    pub body: Option<Value>,
}

impl StreamRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            body: None,
        }
    }

    /// Builds a `POST` request with a JSON body.
    pub fn post<T: Serialize + ?Sized>(
        path: impl Into<String>,
        body: &T,
    ) -> Result<Self, StreamClientError> {
        Ok(Self {
            method: Method::POST,
            path: path.into(),
            body: Some(serde_json::to_value(body)?),
        })
    }
}

/// Entry point for opening event streams.
#[derive(Clone, Debug)]
pub struct StreamClient {
    http: Client,
    base_url: String,
    local: bool,
    endpoint_override: Option<String>,
    options: StreamClientOptions,
}

impl StreamClient {
    /// Creates a client for `base_url` with default options.
    pub fn new(base_url: impl Into<String>) -> Result<Self, StreamClientError> {
        Self::with_options(base_url, StreamClientOptions::default())
    }

    pub fn with_options(
        base_url: impl Into<String>,
        options: StreamClientOptions,
    ) -> Result<Self, StreamClientError> {
        let base_url = normalize_base_url(base_url.into())?;
        let http = Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(StreamClientError::Transport)?;

        Ok(Self {
            http,
            base_url,
            local: false,
            endpoint_override: None,
            options,
        })
    }

    /// Enables or disables local mode base URL routing.
    pub fn with_local_mode(mut self, local: bool) -> Self {
        self.local = local;
        self
    }

    /// Sets an explicit base URL override.
    ///
    /// The override takes precedence over local mode when set.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Result<Self, StreamClientError> {
        self.endpoint_override = Some(normalize_base_url(endpoint.into())?);
        Ok(self)
    }

    pub fn options(&self) -> &StreamClientOptions {
        &self.options
    }

    /// Opens a request/response stream with the context's current credential.
    ///
    /// Fails with [`StreamClientError::MissingCredential`] without sending
    /// anything when the context holds no credential.
    pub async fn open_stream(
        &self,
        request: &StreamRequest,
        context: &SessionContext,
    ) -> Result<FrameStream<ChunkStream>, StreamClientError> {
        let credential = context
            .credential()
            .ok_or(StreamClientError::MissingCredential)?;
        self.open_with_credential(request, &credential).await
    }

    /// Opens a stream with an explicit credential.
    pub async fn open_with_credential(
        &self,
        request: &StreamRequest,
        credential: &SecretString,
    ) -> Result<FrameStream<ChunkStream>, StreamClientError> {
        let endpoint = self.endpoint(&request.path);
        let mut builder = self
            .http
            .request(request.method.clone(), endpoint.as_str())
            .bearer_auth(credential.expose_secret())
            .header(ACCEPT, EVENT_STREAM_MIME)
            .header(CACHE_CONTROL, "no-cache");
        if let Some(body) = request.body.as_ref() {
            builder = builder.json(body);
        }

        let timeout = self.options.establish_timeout;
        let response = with_timeout(timeout, builder.send())
            .await
            .map_err(|_| StreamClientError::Timeout(timeout))?
            .map_err(StreamClientError::Transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = read_error_body(response, timeout).await;
            debug!(
                event = "stream_open_rejected",
                path = %request.path,
                status = status.as_u16()
            );
            return Err(StreamClientError::HttpStatus {
                status,
                body: summarize_error_body(&body),
            });
        }

        debug!(event = "stream_opened", path = %request.path, status = status.as_u16());
        let chunks = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(StreamClientError::Transport))
            .boxed();
        Ok(FrameStream::new(chunks))
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url(), path)
    }

    fn base_url(&self) -> &str {
        if let Some(endpoint) = self.endpoint_override.as_deref() {
            return endpoint;
        }
        if self.local {
            LOCAL_BASE_URL
        } else {
            &self.base_url
        }
    }
}

/// Errors produced by stream transport and establishment.
#[derive(Debug, Error)]
pub enum StreamClientError {
    /// HTTP transport error, at establishment or mid-stream.
    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    /// Server answered with a non-success status.
    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    /// No credential was available; no request was sent.
    #[error("no credential available")]
    MissingCredential,

    /// Response headers did not arrive in time.
    #[error("stream was not established within {0:?}")]
    Timeout(Duration),

    /// JSON serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Base URL could not be parsed.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

impl StreamClientError {
    /// Returns `true` when the server rejected the credential.
    pub fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            Self::HttpStatus { status, .. }
                if *status == StatusCode::UNAUTHORIZED || *status == StatusCode::FORBIDDEN
        )
    }
}

fn normalize_base_url(raw: String) -> Result<String, StreamClientError> {
    let trimmed = raw.trim().trim_end_matches('/').to_string();
    Url::parse(&trimmed).map_err(|err| StreamClientError::InvalidEndpoint(format!("{raw}: {err}")))?;
    Ok(trimmed)
}

/// Reads at most `ERROR_BODY_READ_LIMIT` bytes of a rejected response.
///
/// Rejections may stream a body that never ends, so the read is bounded by
/// `limit` and keeps whatever arrived before it expired.
async fn read_error_body(response: Response, limit: Duration) -> String {
    let mut body = Vec::new();
    let mut chunks = response.bytes_stream();
    let read = with_timeout(limit, async {
        while let Some(Ok(chunk)) = chunks.next().await {
            body.extend_from_slice(&chunk);
            if body.len() >= ERROR_BODY_READ_LIMIT {
                break;
            }
        }
    })
    .await;
    if read.is_err() {
        debug!(event = "stream_error_body_truncated", read = body.len());
    }
    body.truncate(ERROR_BODY_READ_LIMIT);
    String::from_utf8_lossy(&body).into_owned()
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        reason: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.error.or(parsed.message).or(parsed.reason) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}
