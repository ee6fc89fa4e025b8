//! External function workers
//!
//! Workers accept a tool invocation, run it asynchronously and report
//! completion out of band. The engine only needs to submit and poll.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::WorkerConfig;
use crate::dag::Params;
use crate::error::{FlowError, Result};
use crate::quota::{ResourceUsageSample, UsageSource};

/// Status reported by a worker for a submitted task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum TaskState {
    Pending,
    Success,
    Failed {
        #[serde(default)]
        message: Option<String>,
    },
}

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Submit a tool invocation, returning the worker's task id
    async fn submit_task(&self, tool_name: &str, params: &Params) -> Result<String>;

    async fn poll_task_status(&self, external_task_id: &str) -> Result<TaskState>;
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    task_id: String,
}

/// HTTP client for the function workers
///
/// - `POST {base}/functions/{tool}` with `{params, callback_url}` → `{task_id}`
/// - `GET {base}/tasks/{id}` → `{status, message?}`
/// - `GET {base}/tasks/{id}/usage` → usage sample, 404 when none was recorded
#[derive(Clone)]
pub struct HttpExecutor {
    client: Client,
    config: WorkerConfig,
}

impl HttpExecutor {
    pub fn new(config: WorkerConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl TaskExecutor for HttpExecutor {
    async fn submit_task(&self, tool_name: &str, params: &Params) -> Result<String> {
        let body = json!({
            "params": params,
            "callback_url": self.config.callback_url,
        });

        tracing::debug!("Submitting {} to {}", tool_name, self.config.base_url);

        let response = self
            .client
            .post(self.url(&format!("functions/{}", tool_name)))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(FlowError::ExternalSubmission {
                tool_name: tool_name.to_string(),
                message: format!("{}: {}", status, message),
            });
        }

        let submitted: SubmitResponse = response.json().await?;
        Ok(submitted.task_id)
    }

    async fn poll_task_status(&self, external_task_id: &str) -> Result<TaskState> {
        let state = self
            .client
            .get(self.url(&format!("tasks/{}", external_task_id)))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(state)
    }
}

#[async_trait]
impl UsageSource for HttpExecutor {
    async fn get_resource_usage(
        &self,
        external_task_id: &str,
    ) -> Result<Option<ResourceUsageSample>> {
        let response = self
            .client
            .get(self.url(&format!("tasks/{}/usage", external_task_id)))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        Ok(Some(response.error_for_status()?.json().await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_state_wire_format() {
        let state: TaskState = serde_json::from_value(json!({"status": "Success"})).unwrap();
        assert_eq!(state, TaskState::Success);

        let state: TaskState =
            serde_json::from_value(json!({"status": "Failed", "message": "oom"})).unwrap();
        assert_eq!(state, TaskState::Failed { message: Some("oom".to_string()) });

        let state: TaskState = serde_json::from_value(json!({"status": "Failed"})).unwrap();
        assert_eq!(state, TaskState::Failed { message: None });
    }

    #[test]
    fn test_url_join() {
        let executor = HttpExecutor::new(WorkerConfig {
            base_url: "http://workers:9000/".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(executor.url("tasks/abc"), "http://workers:9000/tasks/abc");
    }
}
