// HTTP-shaped transport seam
//
// Operations that talk to remote services go through the `Transport` trait so
// that failures arrive as `TransportError` / `DecodeError` and can be
// classified into `AppError` in one place.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::error::{classify, AppError};
use crate::operation::Operation;

/// Request method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Get => write!(f, "GET"),
            Self::Post => write!(f, "POST"),
            Self::Put => write!(f, "PUT"),
            Self::Patch => write!(f, "PATCH"),
            Self::Delete => write!(f, "DELETE"),
        }
    }
}

/// Outgoing request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::Delete, url)
    }

    /// Build a request with a JSON body
    pub fn json<B: Serialize>(method: Method, url: impl Into<String>, body: &B) -> Result<Self, DecodeError> {
        let bytes = serde_json::to_vec(body)?;
        Ok(Self::new(method, url)
            .with_header("content-type", "application/json")
            .with_body(bytes))
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }
}

/// Response as received from the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// Build a 200 response with a JSON body
    pub fn json<B: Serialize>(body: &B) -> Result<Self, DecodeError> {
        Ok(Self::new(200, serde_json::to_vec(body)?)
            .with_header("content-type", "application/json"))
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// First header with this name, compared case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Failure below the application layer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// The transport gave up waiting; `elapsed` is how long the request ran
    #[error("transport timed out after {elapsed:?}: {detail}")]
    TimedOut { elapsed: Duration, detail: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },
}

/// Payload that could not be decoded
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct DecodeError {
    message: String,
    path: Option<String>,
}

impl DecodeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            path: None,
        }
    }

    /// Attach the location inside the payload
    pub fn at(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }
}

impl From<serde_json::Error> for DecodeError {
    fn from(err: serde_json::Error) -> Self {
        let located = err.line() > 0;
        let decode = Self::new(err.to_string());
        if located {
            decode.at(format!("line {} column {}", err.line(), err.column()))
        } else {
            decode
        }
    }
}

/// Decode a JSON payload
pub fn decode_json<T: DeserializeOwned>(body: &[u8]) -> Result<T, DecodeError> {
    serde_json::from_slice(body).map_err(DecodeError::from)
}

/// Sends requests to a remote service
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<RawResponse, TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(&self, request: HttpRequest) -> Result<RawResponse, TransportError> {
        (**self).send(request).await
    }
}

/// JSON client over a [`Transport`]
///
/// Every failure comes back as a classified [`AppError`]: transport faults
/// and non-success statuses through [`TransportError`], bad payloads through
/// [`DecodeError`].
pub struct HttpClient<Tr: ?Sized> {
    base_url: String,
    transport: Arc<Tr>,
}

impl<Tr: ?Sized> Clone for HttpClient<Tr> {
    fn clone(&self) -> Self {
        Self {
            base_url: self.base_url.clone(),
            transport: Arc::clone(&self.transport),
        }
    }
}

impl<Tr: Transport + ?Sized> HttpClient<Tr> {
    pub fn new(base_url: &str, transport: Arc<Tr>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            transport,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute URL for a path relative to the base
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send a request and reject non-success statuses
    #[instrument(skip(self, request), fields(method = %request.method, url = %request.url))]
    pub async fn send_checked(&self, request: HttpRequest) -> Result<RawResponse, AppError> {
        let url = request.url.clone();
        let response = self.transport.send(request).await.map_err(classify)?;
        debug!(status = response.status, "response received");

        if !response.is_success() {
            return Err(classify(TransportError::Status {
                status: response.status,
                url,
            }));
        }
        Ok(response)
    }

    /// GET `path` and decode the JSON body
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, AppError> {
        let response = self.send_checked(HttpRequest::get(self.url(path))).await?;
        Ok(decode_json(&response.body)?)
    }

    /// POST a JSON body to `path` and decode the JSON reply
    pub async fn post_json<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, AppError> {
        let request = HttpRequest::json(Method::Post, self.url(path), body)?;
        let response = self.send_checked(request).await?;
        Ok(decode_json(&response.body)?)
    }

    /// Re-invocable operation that sends `request` and decodes the reply as `T`
    pub fn json_operation<T>(&self, request: HttpRequest) -> JsonRequest<Tr, T> {
        JsonRequest {
            client: self.clone(),
            request,
            _output: PhantomData,
        }
    }
}

/// Operation returned by [`HttpClient::json_operation`]
pub struct JsonRequest<Tr: ?Sized, T> {
    client: HttpClient<Tr>,
    request: HttpRequest,
    _output: PhantomData<fn() -> T>,
}

#[async_trait]
impl<Tr, T> Operation for JsonRequest<Tr, T>
where
    Tr: Transport + ?Sized + 'static,
    T: DeserializeOwned + Send + 'static,
{
    type Output = T;
    type Error = AppError;

    async fn call(&self) -> Result<T, AppError> {
        let response = self.client.send_checked(self.request.clone()).await?;
        Ok(decode_json(&response.body)?)
    }
}

#[cfg(feature = "reqwest")]
pub use self::reqwest_transport::ReqwestTransport;

#[cfg(feature = "reqwest")]
mod reqwest_transport {
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::time::Instant;

    use super::{HttpRequest, Method, RawResponse, Transport, TransportError};

    /// [`Transport`] backed by a `reqwest::Client`
    #[derive(Debug, Clone, Default)]
    pub struct ReqwestTransport {
        http: reqwest::Client,
    }

    impl ReqwestTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_client(http: reqwest::Client) -> Self {
            Self { http }
        }
    }

    fn map_error(url: &str, e: reqwest::Error, elapsed: Duration) -> TransportError {
        tracing::error!("HTTP request failed for {}: {}", url, e);
        if e.is_timeout() {
            TransportError::TimedOut {
                elapsed,
                detail: e.to_string(),
            }
        } else if e.is_connect() {
            TransportError::ConnectionRefused(e.to_string())
        } else if e.is_body() || e.is_decode() {
            TransportError::Io(e.to_string())
        } else {
            TransportError::Protocol(e.to_string())
        }
    }

    #[async_trait]
    impl Transport for ReqwestTransport {
        async fn send(&self, request: HttpRequest) -> Result<RawResponse, TransportError> {
            let method = match request.method {
                Method::Get => reqwest::Method::GET,
                Method::Post => reqwest::Method::POST,
                Method::Put => reqwest::Method::PUT,
                Method::Patch => reqwest::Method::PATCH,
                Method::Delete => reqwest::Method::DELETE,
            };

            let mut builder = self.http.request(method, &request.url);
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if let Some(body) = request.body {
                builder = builder.body(body);
            }

            let started = Instant::now();
            let response = builder
                .send()
                .await
                .map_err(|e| map_error(&request.url, e, started.elapsed()))?;

            let status = response.status().as_u16();
            let headers = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), v.to_string()))
                })
                .collect();
            let body = response
                .bytes()
                .await
                .map_err(|e| map_error(&request.url, e, started.elapsed()))?
                .to_vec();

            Ok(RawResponse {
                status,
                headers,
                body,
            })
        }
    }
}
