use crate::services::tool::{ToolError, ToolRunner, arg};
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

/// Errors from applying a binary diff
#[derive(Error, Debug)]
pub enum PatchError {
    #[error("Patch source not found: {0}")]
    SourceNotFound(Utf8PathBuf),

    #[error(transparent)]
    Tool(#[from] ToolError),
}

/// Applies one binary diff to one file
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PatchApplier: Send + Sync {
    /// Write `original` patched with `diff` to `output`, replacing `output` if present
    async fn apply(
        &self,
        original: &Utf8Path,
        diff: &Utf8Path,
        output: &Utf8Path,
    ) -> Result<(), PatchError>;
}

/// [`PatchApplier`] backed by the `xdelta3` command line tool
pub struct XdeltaPatcher {
    xdelta: Utf8PathBuf,
    runner: ToolRunner,
}

impl XdeltaPatcher {
    pub fn new(xdelta: impl Into<Utf8PathBuf>, runner: ToolRunner) -> Self {
        Self {
            xdelta: xdelta.into(),
            runner,
        }
    }

    fn command_args(original: &Utf8Path, diff: &Utf8Path, output: &Utf8Path) -> Vec<String> {
        vec![
            "-f".to_string(),
            "-d".to_string(),
            "-s".to_string(),
            arg(original),
            arg(diff),
            arg(output),
        ]
    }
}

#[async_trait]
impl PatchApplier for XdeltaPatcher {
    async fn apply(
        &self,
        original: &Utf8Path,
        diff: &Utf8Path,
        output: &Utf8Path,
    ) -> Result<(), PatchError> {
        if !original.exists() {
            return Err(PatchError::SourceNotFound(original.to_path_buf()));
        }

        let args = Self::command_args(original, diff, output);
        self.runner.run(&self.xdelta, &args).await?;
        Ok(())
    }
}
