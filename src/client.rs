//! The HTTP transport virtual users send their requests through.
//!
//! [`ReqwestTransport`] is used unless a custom [`Transport`] is given to
//! [`Swarm::set_transport`](../struct.Swarm.html#method.set_transport).

use async_trait::async_trait;
use http::StatusCode;
use reqwest::header::HeaderMap;
use reqwest::Client;
use std::fmt;
use url::Url;

use crate::SwarmError;

static APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// A response that made it back from the server, whatever its status.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: StatusCode,
    /// The URL that was ultimately loaded, after any redirects.
    pub final_url: String,
}

/// The request failed before a response was received.
#[derive(Debug, Clone)]
pub struct TransportError {
    pub message: String,
}
impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for TransportError {}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> TransportError {
        TransportError {
            message: err.to_string(),
        }
    }
}

/// Issues GET requests on behalf of virtual users.
///
/// Timeouts, connection pooling and TLS are the transport's concern.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(
        &self,
        url: &Url,
        params: &[(String, String)],
        headers: &HeaderMap,
    ) -> Result<TransportResponse, TransportError>;
}

/// The default transport, one [`reqwest::Client`] per virtual user.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}
impl ReqwestTransport {
    pub fn new() -> Result<Self, SwarmError> {
        let client = Client::builder()
            .user_agent(APP_USER_AGENT)
            .gzip(true)
            .build()?;
        Ok(ReqwestTransport { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(
        &self,
        url: &Url,
        params: &[(String, String)],
        headers: &HeaderMap,
    ) -> Result<TransportResponse, TransportError> {
        let response = self
            .client
            .get(url.clone())
            .query(params)
            .headers(headers.clone())
            .send()
            .await?;
        let status = response.status();
        let final_url = response.url().to_string();
        // Read the whole body so response time includes the transfer.
        let _body = response.bytes().await?;
        Ok(TransportResponse { status, final_url })
    }
}
