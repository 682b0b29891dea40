use parking_lot::Mutex;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Exit code reported when the command could not be spawned or timed out
pub const EXIT_CODE_UNAVAILABLE: i32 = -1;

/// Outcome of running one step command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    /// stdout, then stderr separated by a newline when stderr is non-empty
    pub output: String,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs step commands through `sh -c`
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    work_dir: PathBuf,
    timeout: Duration,
}

impl CommandExecutor {
    pub fn new(work_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            work_dir: work_dir.into(),
            timeout,
        }
    }

    /// Run `command` in `path`, or in the default work directory when empty
    pub async fn execute(&self, path: &str, command: &str) -> CommandOutput {
        let dir = if path.trim().is_empty() {
            self.work_dir.clone()
        } else {
            PathBuf::from(path)
        };
        info!(dir = %dir.display(), command, "Executing step command");

        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match child {
            Ok(child) => child,
            Err(e) => {
                error!(dir = %dir.display(), error = %e, "Failed to spawn command");
                return CommandOutput {
                    exit_code: EXIT_CODE_UNAVAILABLE,
                    output: e.to_string(),
                    timed_out: false,
                };
            }
        };

        let stdout = OutputCollector::spawn(child.stdout.take());
        let stderr = OutputCollector::spawn(child.stderr.take());

        match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => {
                let stdout = stdout.finish(None).await;
                let stderr = stderr.finish(None).await;
                // Killed by a signal: no code
                let exit_code = status.code().unwrap_or(EXIT_CODE_UNAVAILABLE);
                info!(exit_code, "Step command finished");
                CommandOutput {
                    exit_code,
                    output: combine(&stdout, &stderr),
                    timed_out: false,
                }
            }
            Ok(Err(e)) => {
                error!(error = %e, "Failed to wait for command");
                CommandOutput {
                    exit_code: EXIT_CODE_UNAVAILABLE,
                    output: e.to_string(),
                    timed_out: false,
                }
            }
            Err(_) => {
                warn!(timeout_ms = self.timeout.as_millis() as u64, "Step command timed out");
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill timed out command");
                }
                // Background children of the shell may still hold the pipes open
                let stdout = stdout.finish(Some(OUTPUT_DRAIN_GRACE)).await;
                let stderr = stderr.finish(Some(OUTPUT_DRAIN_GRACE)).await;
                let mut output = combine(&stdout, &stderr);
                if !output.is_empty() && !output.ends_with('\n') {
                    output.push('\n');
                }
                output.push_str(&format!("command timed out after {:?}", self.timeout));
                CommandOutput {
                    exit_code: EXIT_CODE_UNAVAILABLE,
                    output,
                    timed_out: true,
                }
            }
        }
    }
}

/// How long to keep draining pipes after a timed out command is killed
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(200);

/// Reads one child pipe into a shared buffer so partial output survives a kill
struct OutputCollector {
    buffer: Arc<Mutex<Vec<u8>>>,
    reader: JoinHandle<()>,
}

impl OutputCollector {
    fn spawn<R>(pipe: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink = buffer.clone();
        let reader = tokio::spawn(async move {
            let Some(mut pipe) = pipe else {
                return;
            };
            let mut chunk = [0u8; 8192];
            loop {
                match pipe.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => sink.lock().extend_from_slice(&chunk[..n]),
                    Err(e) => {
                        debug!(error = %e, "Stopped reading command output");
                        break;
                    }
                }
            }
        });
        Self { buffer, reader }
    }

    /// Wait for the pipe to close, or at most `grace`, and return what was read
    async fn finish(self, grace: Option<Duration>) -> Vec<u8> {
        let Self { buffer, mut reader } = self;
        match grace {
            None => {
                let _ = (&mut reader).await;
            }
            Some(grace) => {
                if tokio::time::timeout(grace, &mut reader).await.is_err() {
                    reader.abort();
                }
            }
        }
        let collected = std::mem::take(&mut *buffer.lock());
        collected
    }
}

/// stdout, then stderr after a newline when stderr is non-empty
fn combine(stdout: &[u8], stderr: &[u8]) -> String {
    let mut combined = String::from_utf8_lossy(stdout).into_owned();
    if !stderr.is_empty() {
        combined.push('\n');
        combined.push_str(&String::from_utf8_lossy(stderr));
    }
    combined
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor() -> CommandExecutor {
        CommandExecutor::new(std::env::temp_dir(), Duration::from_secs(10))
    }

    #[tokio::test]
    async fn test_captures_stdout_and_exit_code() {
        let result = executor().execute("", "echo hello").await;
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.output, "hello\n");
        assert!(result.succeeded());
    }

    #[tokio::test]
    async fn test_stderr_follows_stdout() {
        let result = executor()
            .execute("", "echo out; echo err 1>&2; exit 7")
            .await;
        assert_eq!(result.exit_code, 7);
        assert_eq!(result.output, "out\n\nerr\n");
    }

    #[tokio::test]
    async fn test_runs_in_step_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().canonicalize().unwrap();
        let result = executor()
            .execute(path.to_str().unwrap(), "pwd -P")
            .await;
        assert_eq!(result.output.trim(), path.to_str().unwrap());
    }

    #[tokio::test]
    async fn test_missing_directory_is_spawn_failure() {
        let result = executor()
            .execute("/definitely/not/a/dir", "true")
            .await;
        assert_eq!(result.exit_code, EXIT_CODE_UNAVAILABLE);
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn test_timeout_reports_minus_one() {
        let executor = CommandExecutor::new(std::env::temp_dir(), Duration::from_millis(100));
        let result = executor.execute("", "sleep 5").await;
        assert_eq!(result.exit_code, EXIT_CODE_UNAVAILABLE);
        assert!(result.timed_out);
    }

    #[tokio::test]
    async fn test_timeout_keeps_partial_output() {
        let executor = CommandExecutor::new(std::env::temp_dir(), Duration::from_millis(300));
        let started = std::time::Instant::now();
        let result = executor
            .execute("", "echo partial-line; echo partial-err 1>&2; sleep 5")
            .await;
        assert_eq!(result.exit_code, EXIT_CODE_UNAVAILABLE);
        assert!(result.timed_out);
        assert!(result.output.contains("partial-line"), "{:?}", result.output);
        assert!(result.output.contains("partial-err"), "{:?}", result.output);
        assert!(result.output.ends_with("command timed out after 300ms"));
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
