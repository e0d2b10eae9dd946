use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Instant;

use super::AgentEndpoint;
use crate::types::{AgentRequest, AgentResponse};

/// Reaches an agent over HTTP: requests go to `POST {base}/process`, probes
/// to `GET {base}/health`.
pub struct HttpEndpoint {
    base_url: String,
    client: reqwest::Client,
}

impl HttpEndpoint {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, reqwest::Client::new())
    }

    pub fn with_client(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { base_url, client }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn probe(&self, request: &AgentRequest) -> Result<AgentResponse> {
        let started = Instant::now();
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .with_context(|| format!("health probe to {} failed", self.base_url))?;

        let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let status = response.status();
        if !status.is_success() {
            return Ok(AgentResponse::error(
                request.id,
                "unhealthy",
                format!("health endpoint returned {}", status),
                true,
            ));
        }

        let body = response.json().await.unwrap_or(serde_json::Value::Null);
        Ok(AgentResponse::success(request.id, body, elapsed))
    }
}

#[async_trait]
impl AgentEndpoint for HttpEndpoint {
    async fn process(&self, request: AgentRequest) -> Result<AgentResponse> {
        if request.is_health_check() {
            return self.probe(&request).await;
        }

        let response = self
            .client
            .post(format!("{}/process", self.base_url))
            .json(&request)
            .send()
            .await
            .with_context(|| format!("request to {} failed", self.base_url))?
            .error_for_status()?;

        let body: AgentResponse = response
            .json()
            .await
            .context("agent returned an invalid response body")?;
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_endpoint_creation() {
        let endpoint = HttpEndpoint::new("http://localhost:9001/");
        assert_eq!(endpoint.base_url(), "http://localhost:9001");
    }
}
