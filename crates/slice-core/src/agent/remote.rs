//! HTTP client for a node agent running on another host

use super::TransportAgent;
use crate::error::{Result, SliceError};
use crate::models::{BandwidthPolicy, Measurement, Tunnel, TunnelState, Vni};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Body of `GET /v1/node/tunnels/{vni}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelStatus {
    pub vni: Vni,
    pub state: TunnelState,
}

/// [`TransportAgent`] backed by the node HTTP API
pub struct RemoteAgent {
    node: String,
    client: Client,
    base_url: Url,
}

impl RemoteAgent {
    pub fn new(node: impl Into<String>, base_url: &str, timeout: Duration) -> Result<Self> {
        let node = node.into();
        let base_url = Url::parse(base_url)
            .map_err(|e| SliceError::Configuration(format!("agent url for {}: {}", node, e)))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SliceError::Configuration(format!("http client for {}: {}", node, e)))?;
        Ok(Self {
            node,
            client,
            base_url,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| self.failure(format!("invalid path {}: {}", path, e)))
    }

    fn failure(&self, reason: String) -> SliceError {
        SliceError::ApplyFailed {
            node: self.node.clone(),
            reason,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Response> {
        request
            .send()
            .await
            .map_err(|e| self.failure(format!("request failed: {}", e)))
    }

    async fn expect_success(&self, response: Response) -> Result<Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(self.failure(format!("agent returned {}: {}", status, body.trim())))
    }
}

#[async_trait]
impl TransportAgent for RemoteAgent {
    fn node(&self) -> &str {
        &self.node
    }

    async fn apply(&self, policy: &BandwidthPolicy) -> Result<()> {
        let url = self.url("/v1/node/policies")?;
        let response = self.send(self.client.post(url).json(policy)).await?;
        self.expect_success(response).await?;
        Ok(())
    }

    async fn remove_policy(&self, slice_id: &str, interface: &str) -> Result<()> {
        let url = self.url(&format!("/v1/node/policies/{}/{}", slice_id, interface))?;
        let response = self.send(self.client.delete(url)).await?;
        self.expect_success(response).await?;
        Ok(())
    }

    async fn create_tunnel(&self, tunnel: &Tunnel) -> Result<()> {
        let url = self.url("/v1/node/tunnels")?;
        let response = self.send(self.client.post(url).json(tunnel)).await?;
        self.expect_success(response).await?;
        Ok(())
    }

    async fn teardown_tunnel(&self, vni: Vni) -> Result<()> {
        let url = self.url(&format!("/v1/node/tunnels/{}", vni))?;
        let response = self.send(self.client.delete(url)).await?;
        self.expect_success(response).await?;
        Ok(())
    }

    async fn tunnel_status(&self, vni: Vni) -> Result<Option<TunnelState>> {
        let url = self.url(&format!("/v1/node/tunnels/{}", vni))?;
        let response = self.send(self.client.get(url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let status: TunnelStatus = self
            .expect_success(response)
            .await?
            .json()
            .await
            .map_err(|e| self.failure(format!("invalid status body: {}", e)))?;
        Ok(Some(status.state))
    }

    async fn measurements(&self) -> Result<Vec<Measurement>> {
        let url = self.url("/v1/node/measurements")?;
        let response = self.send(self.client.get(url)).await?;
        self.expect_success(response)
            .await?
            .json()
            .await
            .map_err(|e| self.failure(format!("invalid measurements body: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(url: &str) -> RemoteAgent {
        RemoteAgent::new("node-b", url, Duration::from_secs(2)).unwrap()
    }

    #[test]
    fn test_rejects_bad_url() {
        assert!(matches!(
            RemoteAgent::new("n", "not a url", Duration::from_secs(1)),
            Err(SliceError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_tunnel_status() {
        let mut server = mockito::Server::new_async().await;
        let up = server
            .mock("GET", "/v1/node/tunnels/1000")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"vni":1000,"state":"up"}"#)
            .create_async()
            .await;
        let missing = server
            .mock("GET", "/v1/node/tunnels/1001")
            .with_status(404)
            .create_async()
            .await;

        let agent = agent(&server.url());
        assert_eq!(agent.tunnel_status(1000).await.unwrap(), Some(TunnelState::Up));
        assert_eq!(agent.tunnel_status(1001).await.unwrap(), None);
        up.assert_async().await;
        missing.assert_async().await;
    }

    #[tokio::test]
    async fn test_agent_errors_become_apply_failed() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("DELETE", "/v1/node/tunnels/1000")
            .with_status(502)
            .with_body("RTNETLINK answers: Operation not permitted")
            .create_async()
            .await;

        let err = agent(&server.url()).teardown_tunnel(1000).await.unwrap_err();
        assert!(err.is_retryable());
        match err {
            SliceError::ApplyFailed { node, reason } => {
                assert_eq!(node, "node-b");
                assert!(reason.contains("502"));
                assert!(reason.contains("Operation not permitted"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_measurements() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/v1/node/measurements")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"[{"slice_id":"s","node":"node-b","throughput_mbps":1.5,"latency_ms":4.0,"loss_rate":0.0,"observed_at":0}]"#,
            )
            .create_async()
            .await;

        let readings = agent(&server.url()).measurements().await.unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].throughput_mbps, 1.5);
    }
}
