//! Command execution contract and its process-backed implementation.
//!
//! The server never runs child processes directly; it hands authorised
//! requests to a [`CommandExecutor`]. [`ProcessExecutor`] is the real one,
//! tests substitute stubs.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{GenieError, Result};

/// Upper bound on captured output. The capture stops growing past this, but
/// the streams are still drained so the child never blocks on a full pipe.
const MAX_CAPTURE_BYTES: usize = 1024 * 1024;

/// What a finished command left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutcome {
    /// The child's exit code. On unix a signal death maps to `128 + signal`.
    pub exit_code: i32,
    /// Combined stdout and stderr, in arrival order.
    pub output: String,
}

/// Runs one command to completion within a time budget.
#[async_trait]
pub trait CommandExecutor: Send + Sync + 'static {
    /// Run `binary` with `args`, capturing combined output.
    ///
    /// Returns [`GenieError::Timeout`] when the budget expires; the child is
    /// killed in that case.
    async fn run(&self, binary: &Path, args: &[String], timeout: Duration) -> Result<ExecOutcome>;
}

/// [`CommandExecutor`] backed by real child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessExecutor;

#[async_trait]
impl CommandExecutor for ProcessExecutor {
    async fn run(&self, binary: &Path, args: &[String], timeout: Duration) -> Result<ExecOutcome> {
        let mut child = Command::new(binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| GenieError::io_with_path(e, binary))?;

        // Both pipes drain into one buffer so the capture keeps the order the
        // chunks arrived in.
        let capture = Arc::new(Mutex::new(Vec::new()));
        let stdout = child.stdout.take().map(|r| tokio::spawn(drain(r, capture.clone())));
        let stderr = child.stderr.take().map(|r| tokio::spawn(drain(r, capture.clone())));

        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                warn!(binary = %binary.display(), ?timeout, "command timed out, killing child");
                if let Err(e) = child.start_kill() {
                    warn!(error = %e, "cannot kill timed-out child");
                }
                let _ = child.wait().await;
                return Err(GenieError::Timeout(timeout));
            }
        };

        if let Some(task) = stdout {
            let _ = task.await;
        }
        if let Some(task) = stderr {
            let _ = task.await;
        }

        let exit_code = exit_code_of(&status);
        let output = String::from_utf8_lossy(&capture.lock().await).into_owned();
        debug!(binary = %binary.display(), exit_code, "command finished");

        Ok(ExecOutcome { exit_code, output })
    }
}

async fn drain<R>(mut reader: R, capture: Arc<Mutex<Vec<u8>>>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                let mut capture = capture.lock().await;
                let room = MAX_CAPTURE_BYTES.saturating_sub(capture.len());
                capture.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
}

fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status
            .code()
            .or_else(|| status.signal().map(|signal| 128 + signal))
            .unwrap_or(-1)
    }
    #[cfg(not(unix))]
    {
        status.code().unwrap_or(-1)
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sh() -> PathBuf {
        PathBuf::from("/bin/sh")
    }

    fn script(body: &str) -> Vec<String> {
        vec!["-c".to_string(), body.to_string()]
    }

    #[tokio::test]
    async fn test_run_captures_output_and_exit_code() {
        let outcome = ProcessExecutor
            .run(&sh(), &script("echo hello"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.output, "hello\n");
    }

    #[tokio::test]
    async fn test_run_combines_stdout_and_stderr() {
        let outcome = ProcessExecutor
            .run(
                &sh(),
                &script("echo out; echo err 1>&2"),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert!(outcome.output.contains("out\n"));
        assert!(outcome.output.contains("err\n"));
    }

    #[tokio::test]
    async fn test_run_reports_nonzero_exit_code() {
        let outcome = ProcessExecutor
            .run(&sh(), &script("exit 3"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 3);
    }

    #[tokio::test]
    async fn test_run_times_out_and_kills_the_child() {
        let started = std::time::Instant::now();
        let err = ProcessExecutor
            .run(&sh(), &script("sleep 10"), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, GenieError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_run_missing_binary_is_io_error() {
        let err = ProcessExecutor
            .run(
                &PathBuf::from("/does/not/exist"),
                &[],
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GenieError::Io { .. }));
    }
}
