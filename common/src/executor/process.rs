// Child process plumbing shared by the script executor and the operation handlers
// Output is streamed line by line from both pipes while the child runs.

use crate::errors::ExecutionError;
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Captured result of a finished child process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs platform utilities (installer, service control, registry tool) as child processes
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, ExecutionError>;
}

/// CommandRunner backed by tokio::process
#[derive(Debug, Clone, Default)]
pub struct TokioCommandRunner;

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    #[tracing::instrument(skip(self, cancel))]
    async fn run(
        &self,
        program: &str,
        args: &[String],
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, ExecutionError> {
        let mut command = Command::new(program);
        command.args(args);
        run_captured(command, cancel).await
    }
}

/// Spawn `command` with piped stdout/stderr and wait for it, honouring cancellation.
///
/// Both pipes are drained concurrently by dedicated tasks, so a child that writes
/// faster than we consume never blocks on a full pipe. On cancellation the child is
/// killed and `ExecutionError::Cancelled` is returned.
pub async fn run_captured(
    mut command: Command,
    cancel: &CancellationToken,
) -> Result<CommandOutput, ExecutionError> {
    let program = command.as_std().get_program().to_string_lossy().into_owned();

    if cancel.is_cancelled() {
        return Err(ExecutionError::Cancelled);
    }

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|e| ExecutionError::SpawnFailed {
        program: program.clone(),
        reason: e.to_string(),
    })?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ExecutionError::CaptureFailed("stdout pipe unavailable".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| ExecutionError::CaptureFailed("stderr pipe unavailable".to_string()))?;

    let stdout_task = tokio::spawn(collect_lines(stdout));
    let stderr_task = tokio::spawn(collect_lines(stderr));

    let status = tokio::select! {
        status = child.wait() => status.map_err(|e| ExecutionError::WaitFailed(e.to_string()))?,
        _ = cancel.cancelled() => {
            if let Err(e) = child.kill().await {
                warn!(program = %program, error = %e, "Failed to kill cancelled process");
            }
            stdout_task.abort();
            stderr_task.abort();
            debug!(program = %program, "Process cancelled");
            return Err(ExecutionError::Cancelled);
        }
    };

    let stdout = stdout_task
        .await
        .map_err(|e| ExecutionError::CaptureFailed(e.to_string()))?;
    let stderr = stderr_task
        .await
        .map_err(|e| ExecutionError::CaptureFailed(e.to_string()))?;

    Ok(CommandOutput {
        // Terminated by a signal on unix
        exit_code: status.code().unwrap_or(-1),
        stdout,
        stderr,
    })
}

/// Read a pipe to completion, keeping non-empty lines
async fn collect_lines<R>(reader: R) -> String
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buffer = String::new();
    let mut line = Vec::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end_matches(['\r', '\n']);
                if !text.is_empty() {
                    buffer.push_str(text);
                    buffer.push('\n');
                }
            }
            Err(e) => {
                warn!(error = %e, "Stopped reading process output");
                break;
            }
        }
    }

    buffer
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_captures_stdout_stderr_and_exit_code() {
        let runner = TokioCommandRunner;
        let output = runner
            .run(
                "sh",
                &args(&["-c", "echo out; echo err 1>&2; exit 3"]),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
        assert!(!output.success());
    }

    #[tokio::test]
    async fn test_large_output_does_not_deadlock() {
        let runner = TokioCommandRunner;
        let output = runner
            .run(
                "sh",
                &args(&["-c", "i=0; while [ $i -lt 20000 ]; do echo line-$i; echo e-$i 1>&2; i=$((i+1)); done"]),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(output.success());
        assert_eq!(output.stdout.lines().count(), 20000);
        assert_eq!(output.stderr.lines().count(), 20000);
    }

    #[tokio::test]
    async fn test_cancellation_kills_child() {
        let runner = TokioCommandRunner;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let result = runner.run("sh", &args(&["-c", "sleep 30"]), &cancel).await;

        assert_eq!(result, Err(ExecutionError::Cancelled));
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_failure() {
        let runner = TokioCommandRunner;
        let result = runner
            .run("definitely-not-a-real-program-xyz", &[], &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(ExecutionError::SpawnFailed { .. })));
    }
}
