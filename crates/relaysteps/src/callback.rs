use crate::process::parse_structured;
use async_trait::async_trait;
use relaycore::{StepContext, StepError, StepExecutor, StepKind, StepResult, WorkflowStep};
use serde_json::json;
use std::time::Duration;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Calls an external HTTP endpoint with the step's context
pub struct ExternalCallbackExecutor {
    client: reqwest::Client,
}

impl ExternalCallbackExecutor {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for ExternalCallbackExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// Map a callback response onto a step result: any 2xx completes the step
/// with the body, everything else fails it.
pub fn callback_result(step_id: &str, status: u16, body: &str) -> StepResult {
    if (200..300).contains(&status) {
        let result = StepResult::completed(step_id, body);
        match parse_structured(body) {
            Some(value) => result.with_structured(value),
            None => result,
        }
    } else {
        StepResult::failed(step_id, format!("callback returned HTTP {}: {}", status, body.trim()))
    }
}

#[async_trait]
impl StepExecutor for ExternalCallbackExecutor {
    fn kind(&self) -> StepKind {
        StepKind::ExternalCallback
    }

    fn description(&self) -> &str {
        "POST the step context to an external URL"
    }

    async fn execute(&self, step: &WorkflowStep, ctx: StepContext) -> Result<StepResult, StepError> {
        let url = step.config.require_str("url")?;
        let method = step.config.get_str("method").unwrap_or("POST").to_uppercase();
        let timeout_secs = step.config.get_u64("timeout").unwrap_or(DEFAULT_TIMEOUT_SECS);

        let inputs: serde_json::Map<String, serde_json::Value> = ctx
            .upstream
            .iter()
            .map(|u| (u.step_id.clone(), json!(u.output)))
            .collect();
        let payload = json!({
            "run_id": ctx.run.run_id,
            "thread_id": ctx.run.thread_id,
            "step_id": step.id,
            "task": step.task,
            "inputs": inputs,
        });

        ctx.events.info(format!("{} {}", method, url));

        let request = match method.as_str() {
            "POST" => self.client.post(url).json(&payload),
            "PUT" => self.client.put(url).json(&payload),
            "PATCH" => self.client.patch(url).json(&payload),
            "GET" => self.client.get(url),
            "DELETE" => self.client.delete(url),
            _ => return Err(StepError::Configuration(format!("Unsupported method: {}", method))),
        };

        // Add headers if provided
        let request = match step.config.get("headers") {
            Some(serde_json::Value::Object(headers)) => {
                let mut req = request;
                for (key, value) in headers {
                    if let Some(val_str) = value.as_str() {
                        req = req.header(key.as_str(), val_str);
                    }
                }
                req
            }
            _ => request,
        };

        ctx.check_cancelled()?;
        let response = request
            .timeout(Duration::from_secs(timeout_secs))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    StepError::Timeout {
                        seconds: timeout_secs,
                    }
                } else {
                    StepError::ExecutionFailed(format!("Callback request failed: {}", e))
                }
            })?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| StepError::ExecutionFailed(format!("Failed to read response: {}", e)))?;

        ctx.events.info(format!("Response status: {}", status));

        Ok(callback_result(&step.id, status, &body).with_started_at(ctx.started_at))
    }
}
