use relaycore::StepError;
use std::io::ErrorKind;
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

/// Captured result of a child process
#[derive(Debug, Clone)]
pub(crate) struct ProcessOutput {
    pub exit_code: Option<i32>,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Spawn `cmd`, feed `input` on stdin and collect its output. The child is
/// killed on timeout and whenever the returned future is dropped.
pub(crate) async fn run_process(
    mut cmd: Command,
    input: &[u8],
    timeout_secs: Option<u64>,
) -> Result<ProcessOutput, StepError> {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| StepError::ExecutionFailed(format!("Failed to spawn process: {}", e)))?;

    // Fed concurrently with the readers so a child that writes while it
    // reads never fills its stdout pipe while we are blocked on stdin.
    let stdin_opt = child.stdin.take();
    let stdin_future = async move {
        let Some(mut stdin) = stdin_opt else {
            return Ok(());
        };
        match stdin.write_all(input).await {
            Ok(()) => Ok(()),
            // The child may exit without reading its input
            Err(e) if e.kind() == ErrorKind::BrokenPipe => Ok(()),
            Err(e) => Err(StepError::ExecutionFailed(format!(
                "Failed to write stdin: {}",
                e
            ))),
        }
    };

    let mut stdout_opt = child.stdout.take();
    let mut stderr_opt = child.stderr.take();

    let stdout_future = async move {
        let mut data = Vec::new();
        if let Some(ref mut stdout) = stdout_opt {
            let _ = stdout.read_to_end(&mut data).await;
        }
        data
    };

    let stderr_future = async move {
        let mut data = Vec::new();
        if let Some(ref mut stderr) = stderr_opt {
            let _ = stderr.read_to_end(&mut data).await;
        }
        data
    };

    let collect = async {
        let (written, stdout, stderr) = tokio::join!(stdin_future, stdout_future, stderr_future);
        written?;
        let status = child
            .wait()
            .await
            .map_err(|e| StepError::ExecutionFailed(format!("Process wait failed: {}", e)))?;
        Ok::<_, StepError>((status, stdout, stderr))
    };

    let (status, stdout, stderr) = match timeout_secs {
        Some(seconds) => {
            let collected =
                tokio::time::timeout(std::time::Duration::from_secs(seconds), collect).await;
            match collected {
                Ok(result) => result?,
                Err(_) => {
                    let _ = child.kill().await;
                    return Err(StepError::Timeout { seconds });
                }
            }
        }
        None => collect.await?,
    };

    Ok(ProcessOutput {
        exit_code: status.code(),
        success: status.success(),
        stdout: String::from_utf8_lossy(&stdout).to_string(),
        stderr: String::from_utf8_lossy(&stderr).to_string(),
    })
}

/// Parse text as a JSON object or array; scalars stay plain text.
pub(crate) fn parse_structured(text: &str) -> Option<serde_json::Value> {
    serde_json::from_str::<serde_json::Value>(text.trim())
        .ok()
        .filter(|v| v.is_object() || v.is_array())
}
