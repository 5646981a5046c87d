use async_trait::async_trait;
use relaycore::{StepContext, StepError, StepExecutor, StepKind, StepResult, WorkflowStep};
use tokio::time::{sleep, Duration};

/// Returns a canned response after an optional delay
pub struct MockExecutor;

#[async_trait]
impl StepExecutor for MockExecutor {
    fn kind(&self) -> StepKind {
        StepKind::Mock
    }

    fn description(&self) -> &str {
        "Canned response after an optional delay, with failure injection"
    }

    async fn execute(&self, step: &WorkflowStep, ctx: StepContext) -> Result<StepResult, StepError> {
        let delay_ms = step.config.get_u64("delay_ms").unwrap_or(0);

        if delay_ms > 0 {
            ctx.events.info(format!("Delaying for {}ms", delay_ms));
            tokio::select! {
                _ = ctx.cancellation.cancelled() => return Err(StepError::Cancelled),
                _ = sleep(Duration::from_millis(delay_ms)) => {}
            }
        }

        if step.config.get_bool("fail").unwrap_or(false) {
            let error = step.config.get_str("error").unwrap_or("mock failure");
            return Ok(ctx.failed(error));
        }

        let result = match step.config.get("response") {
            Some(serde_json::Value::String(text)) => ctx.completed(text.clone()),
            Some(value) => ctx.completed(value.to_string()).with_structured(value.clone()),
            None => ctx.completed(format!("Mock response for: {}", step.task)),
        };
        Ok(result)
    }
}
