use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;
use uuid::Uuid;

use super::{JobDescription, RenderBackend};
use crate::error::BackendError;
use crate::pool::InstanceTarget;
use crate::state_machine::ArtifactRef;

/// Output lists a render server reports per node.
const OUTPUT_KINDS: [&str; 3] = ["images", "gifs", "videos"];

/// Consecutive failed history polls before a submission gives up.
const MAX_POLL_ERRORS: u32 = 3;

/// Client for a ComfyUI-style render server.
///
/// A job is queued with `POST /prompt`, then `GET /history/{prompt_id}` is
/// polled until the entry shows up. A few failed polls in a row are
/// tolerated. The overall bound on a submission is applied by the caller.
pub struct HttpRenderBackend {
    client: Client,
    client_id: String,
    poll_interval: Duration,
}

#[derive(Debug, Deserialize)]
struct QueueResponse {
    prompt_id: Option<String>,
    #[serde(default)]
    node_errors: Value,
}

impl HttpRenderBackend {
    pub fn new(poll_interval: Duration) -> Result<Self, BackendError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| BackendError::Protocol(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            client_id: Uuid::new_v4().to_string(),
            poll_interval,
        })
    }

    async fn queue(&self, target: &InstanceTarget, workflow: &Value) -> Result<String, BackendError> {
        let requested_id = Uuid::new_v4().to_string();
        let response = self
            .client
            .post(format!("{}/prompt", target.address))
            .json(&json!({
                "prompt": workflow,
                "client_id": self.client_id,
                "prompt_id": requested_id,
            }))
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_client_error() {
            // The server rejected the workflow itself; resending will not help.
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Execution(format!("prompt rejected ({status}): {body}")));
        }
        if !status.is_success() {
            return Err(BackendError::Protocol(format!("POST /prompt returned {status}")));
        }

        let body: QueueResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Protocol(format!("invalid /prompt response: {e}")))?;
        if body.node_errors.as_object().is_some_and(|errors| !errors.is_empty()) {
            return Err(BackendError::Execution(format!("node errors: {}", body.node_errors)));
        }
        Ok(body.prompt_id.unwrap_or(requested_id))
    }

    async fn history(&self, target: &InstanceTarget, prompt_id: &str) -> Result<Option<Value>, BackendError> {
        let response = self
            .client
            .get(format!("{}/history/{prompt_id}", target.address))
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(BackendError::Protocol(format!(
                "GET /history returned {}",
                response.status()
            )));
        }
        let mut body: Value = response
            .json()
            .await
            .map_err(|e| BackendError::Protocol(format!("invalid /history response: {e}")))?;
        Ok(body.get_mut(prompt_id).map(Value::take))
    }
}

fn transport_error(err: reqwest::Error) -> BackendError {
    if err.is_connect() || err.is_timeout() || err.is_request() {
        BackendError::Unreachable(err.to_string())
    } else {
        BackendError::Protocol(err.to_string())
    }
}

/// Turns a finished history entry into output artifacts, or the failure it
/// reports.
fn parse_history(entry: &Value) -> Result<Vec<ArtifactRef>, BackendError> {
    let status = &entry["status"];
    if status["status_str"].as_str() == Some("error") {
        let detail = status["messages"]
            .as_array()
            .and_then(|messages| {
                messages.iter().find_map(|m| {
                    (m[0].as_str() == Some("execution_error")).then(|| {
                        m[1]["exception_message"]
                            .as_str()
                            .unwrap_or("execution error")
                            .trim()
                            .to_string()
                    })
                })
            })
            .unwrap_or_else(|| "render server reported an error".to_string());
        return Err(BackendError::Execution(detail));
    }

    let mut outputs = Vec::new();
    if let Some(nodes) = entry["outputs"].as_object() {
        for node in nodes.values() {
            for kind in OUTPUT_KINDS {
                for file in node[kind].as_array().into_iter().flatten() {
                    let Some(filename) = file["filename"].as_str() else {
                        continue;
                    };
                    let location = match file["subfolder"].as_str() {
                        Some(sub) if !sub.is_empty() => format!("{sub}/{filename}"),
                        _ => filename.to_string(),
                    };
                    outputs.push(ArtifactRef::new(location));
                }
            }
        }
    }
    Ok(outputs)
}

impl RenderBackend for HttpRenderBackend {
    async fn probe(&self, target: &InstanceTarget) -> Result<(), BackendError> {
        let response = self
            .client
            .get(format!("{}/system_stats", target.address))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(transport_error)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(BackendError::Unreachable(format!(
                "system_stats returned {}",
                response.status()
            )))
        }
    }

    async fn submit(
        &self,
        target: &InstanceTarget,
        description: JobDescription,
    ) -> Result<Vec<ArtifactRef>, BackendError> {
        let prompt_id = self.queue(target, &description.workflow).await?;
        debug!(job_id = %description.job_id, instance = %target.id, prompt_id = %prompt_id, "prompt queued");

        let mut poll_errors = 0;
        loop {
            match self.history(target, &prompt_id).await {
                Ok(Some(entry)) => {
                    let outputs = parse_history(&entry)?;
                    debug!(job_id = %description.job_id, outputs = outputs.len(), "prompt finished");
                    return Ok(outputs);
                }
                Ok(None) => poll_errors = 0,
                Err(e) => {
                    poll_errors += 1;
                    if poll_errors >= MAX_POLL_ERRORS {
                        return Err(e);
                    }
                    debug!(
                        job_id = %description.job_id,
                        prompt_id = %prompt_id,
                        failures = poll_errors,
                        error = %e,
                        "history poll failed"
                    );
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
