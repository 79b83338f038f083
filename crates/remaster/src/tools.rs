//! External tool invocation with hard time limits.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::ErrorCode;

/// Time allowed for a `--version` query.
pub const VERSION_TIMEOUT: Duration = Duration::from_secs(5);

/// Stderr kept in error messages.
const STDERR_TAIL: usize = 2048;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{tool} is not installed or not on PATH")]
    NotFound { tool: String },

    #[error("failed to start {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} did not finish within {after:?}")]
    Timeout { tool: String, after: Duration },

    #[error("{tool} exited with {status}: {stderr}")]
    Failed {
        tool: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("synthesis failed: {0}")]
    Synth(String),

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ToolError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Timeout { .. } => ErrorCode::RenderTimeout,
            _ => ErrorCode::RenderFailed,
        }
    }
}

/// Captured output of a finished tool.
#[derive(Debug)]
pub struct ToolOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Run `program` to completion or kill it once `timeout` passes.
///
/// Stdout and stderr are drained while waiting so a chatty tool cannot
/// block on a full pipe. A non-zero exit is an error.
pub async fn run_tool(program: &str, args: &[String], timeout: Duration) -> Result<ToolOutput, ToolError> {
    debug!(tool = program, ?args, "spawning");
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| match source.kind() {
            std::io::ErrorKind::NotFound => ToolError::NotFound {
                tool: program.to_string(),
            },
            _ => ToolError::Spawn {
                tool: program.to_string(),
                source,
            },
        })?;

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();

    let run = async {
        let mut out = Vec::new();
        let mut err = Vec::new();
        let read_out = async {
            if let Some(pipe) = stdout.as_mut() {
                if let Err(e) = pipe.read_to_end(&mut out).await {
                    warn!(tool = program, error = %e, "failed reading stdout");
                }
            }
        };
        let read_err = async {
            if let Some(pipe) = stderr.as_mut() {
                if let Err(e) = pipe.read_to_end(&mut err).await {
                    warn!(tool = program, error = %e, "failed reading stderr");
                }
            }
        };
        let (status, _, _) = tokio::join!(child.wait(), read_out, read_err);
        status.map(|status| (status, out, err))
    };

    let finished = tokio::time::timeout(timeout, run).await;
    let (status, stdout, stderr) = match finished {
        Ok(Ok(done)) => done,
        Ok(Err(source)) => {
            return Err(ToolError::Spawn {
                tool: program.to_string(),
                source,
            })
        }
        Err(_) => {
            warn!(tool = program, ?timeout, "tool timed out, killing");
            // kill() also reaps, so no zombie is left behind.
            if let Err(e) = child.kill().await {
                warn!(tool = program, error = %e, "failed to kill timed out tool");
            }
            return Err(ToolError::Timeout {
                tool: program.to_string(),
                after: timeout,
            });
        }
    };

    if !status.success() {
        return Err(ToolError::Failed {
            tool: program.to_string(),
            status,
            stderr: tail(&stderr),
        });
    }

    Ok(ToolOutput { stdout, stderr })
}

/// First non-empty output line of `program <arg>`, or `None` if the tool is
/// missing or does not answer within [`VERSION_TIMEOUT`].
///
/// Exit status is ignored: `fluidsynth -h` exits non-zero on some builds.
pub async fn query_version(program: &str, arg: &str) -> Option<String> {
    let child = Command::new(program)
        .arg(arg)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(VERSION_TIMEOUT, child).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            debug!(tool = program, error = %e, "version query failed");
            return None;
        }
        Err(_) => {
            warn!(tool = program, "version query timed out");
            return None;
        }
    };

    let first_line = [&output.stdout, &output.stderr].into_iter().find_map(|bytes| {
        String::from_utf8_lossy(bytes)
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string)
    });
    Some(first_line.unwrap_or_else(|| program.to_string()))
}

fn tail(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    let start = text
        .char_indices()
        .rev()
        .nth(STDERR_TAIL)
        .map(|(i, _)| i)
        .unwrap_or(0);
    text[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_tool() {
        let err = run_tool("remaster-no-such-tool-xyz", &[], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::NotFound { .. }));
        assert_eq!(err.code(), ErrorCode::RenderFailed);
    }

    #[tokio::test]
    async fn test_missing_tool_has_no_version() {
        assert_eq!(query_version("remaster-no-such-tool-xyz", "--version").await, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills() {
        let err = run_tool("sleep", &["5".to_string()], Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Timeout { .. }));
        assert_eq!(err.code(), ErrorCode::RenderTimeout);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit() {
        let args = vec!["-c".to_string(), "echo broken >&2; exit 3".to_string()];
        let err = run_tool("sh", &args, Duration::from_secs(5)).await.unwrap_err();
        match err {
            ToolError::Failed { stderr, .. } => assert_eq!(stderr, "broken"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_version_is_first_output_line() {
        assert_eq!(
            query_version("echo", "FluidSynth runtime version 2.3.4").await.as_deref(),
            Some("FluidSynth runtime version 2.3.4")
        );
        assert_eq!(query_version("true", "quiet").await.as_deref(), Some("true"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_output_captured() {
        let args = vec!["-c".to_string(), "echo out; echo err >&2".to_string()];
        let output = run_tool("sh", &args, Duration::from_secs(5)).await.unwrap();
        assert_eq!(output.stdout, b"out\n");
        assert_eq!(output.stderr, b"err\n");
    }

    #[test]
    fn test_tail_short_text() {
        assert_eq!(tail(b"  oops\n"), "oops");
    }
}
