//! The request/response seam between the engine and the network.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{ACCEPT, LOCATION};
use serde_json::Value;

use cypherstream_core::error::classify_status;
use cypherstream_core::{ClientConfig, EngineError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Post,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Post => f.write_str("POST"),
            Self::Delete => f.write_str("DELETE"),
        }
    }
}

/// One outgoing exchange with the transaction resource.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

pub type BodyStream = BoxStream<'static, Result<Bytes, EngineError>>;

/// Status line, resource location, and an incrementally delivered body.
pub struct TransportResponse {
    pub status: u16,
    pub location: Option<String>,
    pub body: BodyStream,
}

impl fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

impl TransportResponse {
    /// Pass 2xx responses through; drain anything else into a
    /// [`EngineError::Transport`] carrying the raw body.
    pub async fn into_success(self) -> Result<Self, EngineError> {
        if (200..300).contains(&self.status) {
            return Ok(self);
        }
        let status = self.status;
        let chunks: Vec<Bytes> = self.body.try_collect().await?;
        let body = chunks.concat();
        Err(classify_status(status, &body).unwrap_or_else(|| EngineError::Transport {
            status: Some(status),
            body: String::from_utf8_lossy(&body).into_owned(),
        }))
    }
}

/// Sends requests to the transactional endpoint.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, EngineError>;
}

/// [`Transport`] over HTTP using a shared reqwest client.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    user: Option<String>,
    password: Option<String>,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| EngineError::connection(e.to_string()))?;
        Ok(Self {
            client,
            user: config.user.clone(),
            password: config.password.clone(),
        })
    }
}

fn transport_error(error: reqwest::Error) -> EngineError {
    EngineError::Transport {
        status: error.status().map(|s| s.as_u16()),
        body: error.to_string(),
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, EngineError> {
        let mut builder = match request.method {
            Method::Post => self.client.post(&request.url),
            Method::Delete => self.client.delete(&request.url),
        };
        builder = builder.header(ACCEPT, "application/json; charset=UTF-8");
        if let Some(user) = &self.user {
            builder = builder.basic_auth(user, self.password.as_deref());
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status().as_u16();
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        tracing::debug!(method = %request.method, url = %request.url, status, "Response received");

        let body = response.bytes_stream().map_err(transport_error).boxed();
        Ok(TransportResponse {
            status,
            location,
            body,
        })
    }
}
