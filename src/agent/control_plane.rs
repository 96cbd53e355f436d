//! HTTP client for the out-of-scope project-agent control plane (spec §4.8's
//! "external systems"): registering this agent's HTTP surface, reporting a
//! heartbeat, and (optionally) submitting a task result. Uses `backoff` for
//! retry the same way the teacher retries its outbound HTTP calls, since a
//! control-plane blip shouldn't take an agent down.

use std::time::Duration;

use backoff::future::retry;
use backoff::ExponentialBackoffBuilder;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::envelope::TaskResult;

#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error("control-plane request failed: {0}")]
    Request(String),
}

pub struct ControlPlaneClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct RegisterRequest<'a> {
    project_id: &'a str,
    work_dir: &'a str,
    agent_url: &'a str,
}

#[derive(Debug, Serialize)]
struct HeartbeatRequest<'a> {
    project_id: &'a str,
    busy: bool,
    timestamp: DateTime<Utc>,
}

impl ControlPlaneClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    /// Registers this agent's HTTP surface with the control plane, retrying
    /// transient failures with exponential backoff up to a total of thirty
    /// seconds (registration happens once at startup, so it's worth waiting
    /// out a control-plane restart rather than failing the agent outright).
    pub async fn register(&self, project_id: &str, work_dir: &str, agent_url: &str) -> Result<(), ControlPlaneError> {
        let url = format!("{}/project-agents/register", self.base_url);
        let body = RegisterRequest { project_id, work_dir, agent_url };
        let backoff = ExponentialBackoffBuilder::new()
            .with_max_elapsed_time(Some(Duration::from_secs(30)))
            .build();

        retry(backoff, || async {
            self.http
                .post(&url)
                .json(&body)
                .send()
                .await
                .map_err(|e| backoff::Error::transient(ControlPlaneError::Request(e.to_string())))?
                .error_for_status()
                .map_err(|e| backoff::Error::transient(ControlPlaneError::Request(e.to_string())))?;
            Ok(())
        })
        .await
    }

    /// Reports liveness and busy/idle state. Not retried: a missed
    /// heartbeat is superseded by the next one shortly after.
    pub async fn heartbeat(&self, instance_id: &str, project_id: &str, busy: bool) -> Result<(), ControlPlaneError> {
        let url = format!("{}/project-agents/{instance_id}/heartbeat", self.base_url);
        let body = HeartbeatRequest { project_id, busy, timestamp: Utc::now() };
        self.http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ControlPlaneError::Request(e.to_string()))?
            .error_for_status()
            .map_err(|e| ControlPlaneError::Request(e.to_string()))?;
        Ok(())
    }

    /// Submits a completed task's result to the control plane, for
    /// callers that track results there instead of (or in addition to)
    /// the bus's results subject.
    pub async fn submit_result(&self, instance_id: &str, result: &TaskResult) -> Result<(), ControlPlaneError> {
        let url = format!("{}/project-agents/{instance_id}/results", self.base_url);
        self.http
            .post(&url)
            .json(result)
            .send()
            .await
            .map_err(|e| ControlPlaneError::Request(e.to_string()))?
            .error_for_status()
            .map_err(|e| ControlPlaneError::Request(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::ResultStatus;

    #[tokio::test]
    async fn register_posts_to_the_expected_route() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/project-agents/register")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "project_id": "proj",
                "work_dir": "/work",
                "agent_url": "http://127.0.0.1:9000",
            })))
            .with_status(200)
            .create_async()
            .await;

        let client = ControlPlaneClient::new(server.url());
        client.register("proj", "/work", "http://127.0.0.1:9000").await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn heartbeat_posts_to_the_instance_route() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/project-agents/inst-1/heartbeat")
            .with_status(200)
            .create_async()
            .await;

        let client = ControlPlaneClient::new(server.url());
        client.heartbeat("inst-1", "proj", true).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn submit_result_posts_the_task_result() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/project-agents/inst-1/results")
            .with_status(200)
            .create_async()
            .await;

        let client = ControlPlaneClient::new(server.url());
        let result = TaskResult {
            status: ResultStatus::Success,
            output: "done".to_string(),
            error: None,
            commits: vec![],
            artifacts: vec![],
            duration_ms: 10,
            next_action: None,
            context: Default::default(),
        };
        client.submit_result("inst-1", &result).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn heartbeat_surfaces_an_error_on_failure() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/project-agents/inst-1/heartbeat")
            .with_status(500)
            .create_async()
            .await;

        let client = ControlPlaneClient::new(server.url());
        let err = client.heartbeat("inst-1", "proj", false).await.unwrap_err();
        assert!(matches!(err, ControlPlaneError::Request(_)));
        mock.assert_async().await;
    }
}
