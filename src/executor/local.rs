//! Local process and filesystem operations

use crate::cancel::CancellationToken;
use crate::error::{execution_error, PipelineError, PipelineResult};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Captured output of a finished process
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Combined text for evidence and results
    pub fn text(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

/// Build `shell [-e] -c script` in `working_dir` with extra variables
pub fn shell_command(
    shell: &str,
    script: &str,
    errexit: bool,
    working_dir: Option<&Path>,
    variables: &BTreeMap<String, String>,
) -> Command {
    let mut cmd = Command::new(shell);
    if errexit {
        cmd.arg("-e");
    }
    cmd.arg("-c").arg(script);
    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }
    cmd.envs(variables);
    cmd
}

/// Run a process to completion under a timeout, aborting (and killing the
/// child) when the run is cancelled
pub async fn run_process(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    cancel: &CancellationToken,
    label: &str,
) -> PipelineResult<ProcessOutput> {
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| execution_error(format!("{}: failed to start: {}", label, e)))?;

    // stdin is fed while the child runs so a child that never reads cannot
    // stall the run past its timeout
    let pipe = child.stdin.take();
    let feed = async move {
        if let (Some(input), Some(mut pipe)) = (stdin, pipe) {
            match pipe.write_all(input).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                Err(e) => return Err(e),
            }
            // closing stdin lets the child see EOF
            drop(pipe);
        }
        Ok(())
    };
    let run = async {
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        fed.map_err(|e| execution_error(format!("{}: failed to write stdin: {}", label, e)))
            .and(output.map_err(|e| execution_error(format!("{}: {}", label, e))))
    };

    let output = tokio::select! {
        result = tokio::time::timeout(timeout, run) => match result {
            Ok(output) => output?,
            Err(_) => {
                return Err(PipelineError::Timeout {
                    message: format!("{} timed out after {:?}", label, timeout),
                });
            }
        },
        _ = cancel.cancelled() => {
            return Err(PipelineError::Cancelled {
                message: format!("{} cancelled", label),
            });
        }
    };

    Ok(ProcessOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// Run a process and require exit status zero
pub async fn run_checked(
    cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    cancel: &CancellationToken,
    label: &str,
) -> PipelineResult<ProcessOutput> {
    let output = run_process(cmd, stdin, timeout, cancel, label).await?;
    if output.success() {
        Ok(output)
    } else {
        Err(execution_error(format!(
            "{} exited with {}: {}",
            label,
            output
                .code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string()),
            output.stderr.trim()
        )))
    }
}

/// Run a filesystem operation under a timeout, giving up when cancelled
pub async fn with_deadline<T, F>(
    op: F,
    timeout: Duration,
    cancel: &CancellationToken,
    label: &str,
) -> PipelineResult<T>
where
    F: Future<Output = PipelineResult<T>>,
{
    tokio::select! {
        result = tokio::time::timeout(timeout, op) => match result {
            Ok(inner) => inner,
            Err(_) => Err(PipelineError::Timeout {
                message: format!("{} timed out after {:?}", label, timeout),
            }),
        },
        _ = cancel.cancelled() => Err(PipelineError::Cancelled {
            message: format!("{} cancelled", label),
        }),
    }
}

/// Current file content, `None` when the file does not exist
pub async fn read_optional(path: &Path) -> PipelineResult<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(execution_error(format!("cannot read {}: {}", path.display(), e))),
    }
}
