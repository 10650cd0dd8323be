// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! JSON over HTTP agent transport.

use std::time::Duration;

use tracing::{debug, warn};

use super::{AgentClient, AgentCommand, AgentError, Answer};
use crate::model::Host;

/// Posts commands to `http://{host.address}:{port}/agent/command`.
pub struct HttpAgentClient {
    client: reqwest::Client,
    port: u16,
    timeout: Duration,
}

impl HttpAgentClient {
    /// Client for agents listening on `port`, giving up after `timeout`.
    pub fn new(port: u16, timeout: Duration) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AgentError::Protocol(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            port,
            timeout,
        })
    }

    fn url(&self, host: &Host) -> String {
        format!("http://{}:{}/agent/command", host.address, self.port)
    }
}

#[async_trait::async_trait]
impl AgentClient for HttpAgentClient {
    async fn send(&self, host: &Host, command: &AgentCommand) -> Result<Answer, AgentError> {
        let url = self.url(host);
        debug!(host_id = host.id, url = %url, command = command.name(), "Sending agent command");

        let response = self
            .client
            .post(&url)
            .json(command)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AgentError::Timeout {
                        host_id: host.id,
                        timeout: self.timeout,
                    }
                } else {
                    AgentError::Unreachable {
                        host_id: host.id,
                        details: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(host_id = host.id, status = status.as_u16(), "Agent returned error status");
            return Err(AgentError::Protocol(format!(
                "HTTP {} from {}: {}",
                status.as_u16(),
                url,
                body
            )));
        }

        response.json::<Answer>().await.map_err(|e| {
            if e.is_timeout() {
                AgentError::Timeout {
                    host_id: host.id,
                    timeout: self.timeout,
                }
            } else {
                AgentError::Protocol(format!("invalid answer from {}: {}", url, e))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::HostState;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn host_at(server: &MockServer) -> (Host, u16) {
        let addr = server.address();
        let host = Host {
            id: 7,
            name: "kvm-7".to_string(),
            address: addr.ip().to_string(),
            data_center_id: 1,
            pod_id: 1,
            cluster_id: 1,
            state: HostState::Up,
            total_cpu: 4,
            total_memory: 4096,
        };
        (host, addr.port())
    }

    fn stop() -> AgentCommand {
        AgentCommand::Stop {
            vm_id: 1,
            vm_name: "i-1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_posts_command_and_reads_answer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/agent/command"))
            .and(body_partial_json(serde_json::json!({"type": "stop", "vm_id": 1})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"result": false, "details": "busy"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let (host, port) = host_at(&server);
        let client = HttpAgentClient::new(port, Duration::from_secs(5)).unwrap();

        let answer = client.send(&host, &stop()).await.unwrap();
        assert_eq!(answer, Answer::failed("busy"));
    }

    #[tokio::test]
    async fn test_error_status_is_protocol_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/agent/command"))
            .respond_with(ResponseTemplate::new(500).set_body_string("oops"))
            .mount(&server)
            .await;

        let (host, port) = host_at(&server);
        let client = HttpAgentClient::new(port, Duration::from_secs(5)).unwrap();

        let err = client.send(&host, &stop()).await.unwrap_err();
        assert!(matches!(err, AgentError::Protocol(ref msg) if msg.contains("HTTP 500")));
    }

    #[tokio::test]
    async fn test_slow_agent_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/agent/command"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"result": true}))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let (host, port) = host_at(&server);
        let client = HttpAgentClient::new(port, Duration::from_millis(100)).unwrap();

        let err = client.send(&host, &stop()).await.unwrap_err();
        assert!(matches!(err, AgentError::Timeout { host_id: 7, .. }));
    }
}
