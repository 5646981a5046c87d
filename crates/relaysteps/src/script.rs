use crate::process::{parse_structured, run_process, ProcessOutput};
use async_trait::async_trait;
use relaycore::{StepContext, StepError, StepExecutor, StepKind, StepResult, WorkflowStep};
use serde_json::json;
use std::str::FromStr;
use tokio::process::Command;

const DEFAULT_IMAGE: &str = "alpine:3.19";
const DEFAULT_MEMORY: &str = "256m";
const DEFAULT_CPUS: &str = "1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sandbox {
    /// Local shell in a scratch directory with a cleared environment
    Process,
    /// Throwaway container without network access
    Docker,
}

impl FromStr for Sandbox {
    type Err = StepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "process" => Ok(Sandbox::Process),
            "docker" => Ok(Sandbox::Docker),
            other => Err(StepError::Configuration(format!("Unknown sandbox: {}", other))),
        }
    }
}

/// Runs a script in an isolated environment with the step's context on stdin
pub struct SandboxedScriptExecutor;

impl SandboxedScriptExecutor {
    fn docker_command(step: &WorkflowStep, interpreter: &str, script: &str) -> Command {
        let config = &step.config;
        let mut cmd = Command::new("docker");
        cmd.arg("run")
            .arg("--rm")
            .arg("-i")
            .arg("--network")
            .arg(config.get_str("network").unwrap_or("none"))
            .arg("--memory")
            .arg(config.get_str("memory_limit").unwrap_or(DEFAULT_MEMORY))
            .arg("--cpus")
            .arg(config.get_str("cpu_limit").unwrap_or(DEFAULT_CPUS))
            .arg("--read-only")
            .arg("--tmpfs")
            .arg("/tmp")
            .arg(config.get_str("image").unwrap_or(DEFAULT_IMAGE))
            .arg(interpreter)
            .arg("-c")
            .arg(script);
        cmd
    }

    fn process_command(
        step: &WorkflowStep,
        interpreter: &str,
        script: &str,
        workdir: &std::path::Path,
    ) -> Command {
        let mut cmd = Command::new(interpreter);
        cmd.arg("-c")
            .arg(script)
            .current_dir(workdir)
            .env_clear()
            .env("PATH", "/usr/local/bin:/usr/bin:/bin")
            .env("HOME", workdir)
            .env("RELAY_STEP_ID", &step.id);
        cmd
    }

    fn into_result(ctx: &StepContext, output: ProcessOutput) -> StepResult {
        let stderr = output.stderr.trim();
        if !stderr.is_empty() {
            tracing::warn!(step_id = %ctx.step_id, "script stderr: {}", stderr);
            for line in stderr.lines().take(10) {
                ctx.events.warn(format!("stderr: {}", line));
            }
        }

        if !output.success {
            let code = output.exit_code.unwrap_or(-1);
            ctx.events.warn(format!("Script exited with code {}", code));
            return ctx.failed(format!("script exited with code {}: {}", code, stderr));
        }

        let stdout = output.stdout.trim();
        let result = ctx.completed(stdout);
        match parse_structured(stdout) {
            Some(value) => result.with_structured(value),
            None => result,
        }
    }
}

#[async_trait]
impl StepExecutor for SandboxedScriptExecutor {
    fn kind(&self) -> StepKind {
        StepKind::SandboxedScript
    }

    fn description(&self) -> &str {
        "Run a script in a process or docker sandbox"
    }

    async fn execute(&self, step: &WorkflowStep, ctx: StepContext) -> Result<StepResult, StepError> {
        let script = step.config.require_str("script")?;
        let sandbox: Sandbox = step.config.get_str("sandbox").unwrap_or("process").parse()?;
        let interpreter = step.config.get_str("interpreter").unwrap_or("sh");
        let timeout = step.config.get_u64("timeout");

        let context = json!({
            "run_id": ctx.run.run_id,
            "thread_id": ctx.run.thread_id,
            "step_id": step.id,
            "task": step.task,
            "upstream": ctx.upstream,
        });
        let input = serde_json::to_vec(&context)
            .map_err(|e| StepError::ExecutionFailed(format!("Failed to encode context: {}", e)))?;

        ctx.check_cancelled()?;
        ctx.events.info(format!("Running script in {:?} sandbox", sandbox));

        let output = match sandbox {
            Sandbox::Docker => {
                let cmd = Self::docker_command(step, interpreter, script);
                run_process(cmd, &input, timeout).await?
            }
            Sandbox::Process => {
                // Removed when dropped, after the child has exited
                let workdir = tempfile::tempdir()
                    .map_err(|e| StepError::ExecutionFailed(format!("Failed to create sandbox dir: {}", e)))?;
                let cmd = Self::process_command(step, interpreter, script, workdir.path());
                run_process(cmd, &input, timeout).await?
            }
        };

        Ok(Self::into_result(&ctx, output))
    }
}
