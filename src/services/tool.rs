use crate::metrics::Metrics;
use camino::{Utf8Path, Utf8PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;

/// Errors from running an external tool
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Failed to start {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} timed out after {timeout:?}")]
    Timeout { tool: String, timeout: Duration },

    #[error("{tool} exited with code {code}: {stderr}")]
    Failed {
        tool: String,
        code: i32,
        stderr: String,
    },
}

/// Runs external tools with a timeout, discarding stdout and capturing stderr.
///
/// Arguments are passed to the process directly, never through a shell.
#[derive(Debug, Clone)]
pub struct ToolRunner {
    timeout: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl ToolRunner {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            metrics: None,
        }
    }

    /// Record every invocation's duration in `metrics`
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run `program` with `args`.
    ///
    /// # Errors
    /// [`ToolError::Failed`] carries the trimmed stderr of a non-zero exit.
    pub async fn run<S: AsRef<str>>(
        &self,
        program: &Utf8Path,
        args: &[S],
    ) -> Result<(), ToolError> {
        let tool = tool_name(program);
        let args: Vec<&str> = args.iter().map(AsRef::as_ref).collect();
        tracing::debug!("Executing: {} {}", program, args.join(" "));

        let mut cmd = Command::new(program.as_std_path());
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let start = Instant::now();
        let child = cmd.spawn().map_err(|source| ToolError::Spawn {
            tool: tool.clone(),
            source,
        })?;

        let output = timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                tracing::warn!("{} timed out after {:?}", tool, self.timeout);
                ToolError::Timeout {
                    tool: tool.clone(),
                    timeout: self.timeout,
                }
            })?
            .map_err(|source| ToolError::Spawn {
                tool: tool.clone(),
                source,
            })?;

        let duration = start.elapsed();
        if let Some(metrics) = &self.metrics {
            metrics.record_tool_time(duration);
        }

        let exit_code = output.status.code().unwrap_or(-1);
        tracing::debug!(
            "{} completed in {:.2}s with exit code {}",
            tool,
            duration.as_secs_f32(),
            exit_code
        );

        if output.status.success() {
            Ok(())
        } else {
            Err(ToolError::Failed {
                tool,
                code: exit_code,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

fn tool_name(program: &Utf8Path) -> String {
    program
        .file_stem()
        .map(str::to_string)
        .unwrap_or_else(|| program.to_string())
}

/// Turn a path into a plain argument string
pub fn arg(path: impl AsRef<Utf8Path>) -> String {
    path.as_ref().as_str().to_string()
}

/// Resolve `path` against `dir` unless it is already absolute
pub fn resolve_in(dir: &Utf8Path, path: &Utf8Path) -> Utf8PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        dir.join(path)
    }
}
