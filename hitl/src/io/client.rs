//! Producer-side HTTP client.
//!
//! Every outcome, including an unreachable server, comes back as a
//! [`Response`] so tool code can branch on `success` without a second error
//! channel.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use reqwest::{Client, Url};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::sanitize;
use crate::core::types::{Request, RequestKind, Response};
use crate::io::config::ClientConfig;

/// Why a submission produced no server-side response.
#[derive(Debug, Error)]
enum ProducerError {
    #[error("Server error: {status} - {body}")]
    Server { status: u16, body: String },
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Connection error: no reply within {0} seconds")]
    Timeout(u64),
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

fn transport_error(err: reqwest::Error, wait: Duration) -> ProducerError {
    if err.is_timeout() {
        ProducerError::Timeout(wait.as_secs())
    } else {
        ProducerError::Connection(err.to_string())
    }
}

/// Append path segments to a base URL, tolerating a trailing slash.
pub(crate) fn endpoint(base: &Url, segments: &[&str]) -> Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|()| anyhow!("{base} cannot be used as a base URL"))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

pub(crate) fn parse_base_url(raw: &str) -> Result<Url> {
    Url::parse(raw).with_context(|| format!("invalid server url {raw:?}"))
}

/// Client used by tools that need a human in the loop.
#[derive(Debug, Clone)]
pub struct HitlClient {
    http: Client,
    base: Url,
    config: ClientConfig,
}

impl HitlClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let base = parse_base_url(&config.server_url)?;
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .context("build HTTP client")?;
        Ok(Self { http, base, config })
    }

    /// Client configured from `HITL_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::new(ClientConfig::from_env()?)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Send a request and wait for its outcome.
    ///
    /// A FEEDBACK request without a timeout gets the configured default. The
    /// HTTP wait is the request timeout plus the grace margin, so a broker
    /// timeout arrives as the broker's own failure response.
    #[instrument(skip_all, fields(id = %request.id, kind = %request.kind))]
    pub async fn submit(&self, mut request: Request) -> Response {
        if !self.config.enabled {
            debug!("human-in-the-loop disabled, answering locally");
            let value = match request.kind {
                RequestKind::Feedback => None,
                RequestKind::Notify => Some(Value::Bool(true)),
            };
            return Response::ok(request.id, value);
        }

        if request.kind == RequestKind::Feedback && request.timeout().is_none() {
            request = request.with_timeout(self.config.default_timeout);
        }
        let wait = request
            .timeout()
            .unwrap_or(self.config.default_timeout)
            .saturating_add(self.config.grace);

        match self.post_request(&request, wait).await {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "request did not reach a consumer");
                Response::failure(request.id, err.to_string())
            }
        }
    }

    async fn post_request(&self, request: &Request, wait: Duration) -> Result<Response, ProducerError> {
        let url = endpoint(&self.base, &["request"])
            .map_err(|err| ProducerError::Unexpected(format!("{err:#}")))?;
        let reply = self
            .http
            .post(url)
            .timeout(wait)
            .json(request)
            .send()
            .await
            .map_err(|err| transport_error(err, wait))?;

        let status = reply.status();
        if !status.is_success() {
            let body = reply.text().await.unwrap_or_default();
            return Err(ProducerError::Server {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = reply
            .bytes()
            .await
            .map_err(|err| transport_error(err, wait))?;
        serde_json::from_str(&sanitize::json_payload(&bytes))
            .map_err(|err| ProducerError::Unexpected(err.to_string()))
    }

    /// Ask the operator a question. `None` means no usable answer (failure,
    /// timeout, or an empty value).
    pub async fn request_feedback(
        &self,
        prompt: &str,
        source: &str,
        context: Option<Map<String, Value>>,
        timeout: Option<Duration>,
    ) -> Option<String> {
        let mut request = Request::feedback(prompt).with_source(source);
        if let Some(context) = context {
            request = request.with_context(context);
        }
        if let Some(timeout) = timeout {
            request = request.with_timeout(timeout);
        }

        let response = self.submit(request).await;
        if !response.success {
            info!(error = response.error.as_deref().unwrap_or(""), "no feedback");
            return None;
        }
        response.value_text()
    }

    /// Tell the operator something. `true` when the notification was
    /// acknowledged or accepted for delivery.
    pub async fn notify(
        &self,
        message: &str,
        source: &str,
        context: Option<Map<String, Value>>,
    ) -> bool {
        let mut request = Request::notify(message).with_source(source);
        if let Some(context) = context {
            request = request.with_context(context);
        }
        self.submit(request).await.success
    }
}
