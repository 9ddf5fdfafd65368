//! HTTP transport
//!
//! The engine talks to the network through the [`Transport`] trait so tests can
//! script responses. [`HttpTransport`] is the reqwest-backed implementation.

use crate::config::CrawlerConfig;
use crate::engine::request::{FetchRequest, RawResponse};
use crate::engine::EngineError;
use async_trait::async_trait;
use reqwest::redirect::Policy;
use reqwest::Client;
use std::sync::Arc;
use thiserror::Error;
use url::Url;

/// Errors raised before a response is available
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timeout: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("redirect rejected: {0}")]
    Redirect(String),

    #[error("{0}")]
    Other(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(e.to_string())
        } else if e.is_redirect() {
            Self::Redirect(e.to_string())
        } else if e.is_connect() {
            Self::Connect(e.to_string())
        } else {
            Self::Other(e.to_string())
        }
    }
}

/// Approves or rejects a redirect to `next`, given the URLs already visited
pub type RedirectHook = Arc<dyn Fn(&Url, &[Url]) -> Result<(), String> + Send + Sync>;

/// Sends one request and returns the raw response
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &FetchRequest) -> Result<RawResponse, TransportError>;
}

/// Transport backed by a shared reqwest client
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Builds the client from engine configuration
    ///
    /// Redirects beyond `max_redirects`, or rejected by `redirect_hook`, end the
    /// request with a redirect error.
    pub fn new(config: &CrawlerConfig, redirect_hook: Option<RedirectHook>) -> Result<Self, EngineError> {
        let max_redirects = config.max_redirects;
        let policy = Policy::custom(move |attempt| {
            if attempt.previous().len() > max_redirects {
                return attempt.error(format!("stopped after {} redirects", max_redirects));
            }
            if let Some(hook) = &redirect_hook {
                if let Err(reason) = hook(attempt.url(), attempt.previous()) {
                    return attempt.error(reason);
                }
            }
            attempt.follow()
        });

        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.request_timeout())
            .redirect(policy)
            .gzip(true)
            .brotli(true)
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &FetchRequest) -> Result<RawResponse, TransportError> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();

        Ok(RawResponse {
            status,
            headers,
            body,
        })
    }
}
