//! Consumer-side HTTP client: long-polls the server for work and posts answers.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::consumer::{Delivery, QueueSource};
use crate::core::sanitize;
use crate::core::types::{Health, Request, Response};
use crate::io::client::{endpoint, parse_base_url};

/// Margin on top of the long-poll budget before the transport gives up.
const POLL_SLACK: Duration = Duration::from_secs(10);
const CALL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ShellClient {
    http: Client,
    base: Url,
}

impl ShellClient {
    pub fn new(server_url: &str) -> Result<Self> {
        let base = parse_base_url(server_url)?;
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .context("build HTTP client")?;
        Ok(Self { http, base })
    }

    /// Snapshot of every in-flight request, oldest first.
    pub async fn pending(&self) -> Result<Vec<Request>> {
        self.get_json(&["pending"]).await
    }

    pub async fn health(&self) -> Result<Health> {
        self.get_json(&["health"]).await
    }

    /// `/next` URL carrying the long-poll budget in (fractional) seconds.
    fn next_url(&self, wait: Duration) -> Result<Url> {
        let mut url = endpoint(&self.base, &["next"])?;
        url.query_pairs_mut()
            .append_pair("timeout", &wait.as_secs_f64().to_string());
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T> {
        let url = endpoint(&self.base, segments)?;
        let reply = self
            .http
            .get(url.clone())
            .timeout(CALL_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;
        let status = reply.status();
        if !status.is_success() {
            let body = reply.text().await.unwrap_or_default();
            bail!("GET {url} returned {status}: {body}");
        }
        let bytes = reply.bytes().await.with_context(|| format!("read {url}"))?;
        serde_json::from_str(&sanitize::json_payload(&bytes)).with_context(|| format!("decode {url}"))
    }
}

impl QueueSource for ShellClient {
    async fn claim_next(&self, wait: Duration) -> Result<Option<Request>> {
        let reply = self
            .http
            .get(self.next_url(wait)?)
            .timeout(wait.saturating_add(POLL_SLACK))
            .send()
            .await
            .context("poll for next request")?;
        let status = reply.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if !status.is_success() {
            let body = reply.text().await.unwrap_or_default();
            bail!("poll returned {status}: {body}");
        }

        let bytes = reply.bytes().await.context("read next request")?;
        let request: Option<Request> = serde_json::from_str(&sanitize::json_payload(&bytes))
            .context("decode next request")?;
        if let Some(request) = &request {
            debug!(id = %request.id, "claimed remote request");
        }
        Ok(request)
    }

    async fn respond(&self, response: Response) -> Result<Delivery> {
        let url = endpoint(&self.base, &["response", response.request_id.as_str()])?;
        let reply = self
            .http
            .post(url)
            .timeout(CALL_TIMEOUT)
            .json(&response)
            .send()
            .await
            .with_context(|| format!("deliver response for {}", response.request_id))?;

        match reply.status() {
            StatusCode::OK => Ok(Delivery::Delivered),
            StatusCode::NOT_FOUND => Ok(Delivery::NotFound),
            status => {
                let body = reply.text().await.unwrap_or_default();
                bail!("server rejected response with {status}: {body}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_base_url() {
        assert!(ShellClient::new("not a url").is_err());
        assert!(ShellClient::new("http://localhost:8765").is_ok());
    }

    #[test]
    fn poll_budget_keeps_fractions() {
        let client = ShellClient::new("http://localhost:8765").expect("client");
        let url = client.next_url(Duration::from_millis(500)).expect("url");
        assert_eq!(url.as_str(), "http://localhost:8765/next?timeout=0.5");

        let url = client.next_url(Duration::from_secs(2)).expect("url");
        assert_eq!(url.query(), Some("timeout=2"));
    }

    #[tokio::test]
    async fn unreachable_server_is_an_error_not_a_value() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
            listener.local_addr().expect("addr").port()
        };
        let client = ShellClient::new(&format!("http://127.0.0.1:{port}")).expect("client");
        assert!(client.claim_next(Duration::from_secs(1)).await.is_err());
        assert!(client.health().await.is_err());
    }
}
