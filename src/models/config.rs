use crate::models::container::PatchTarget;
use camino::Utf8PathBuf;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Settings from `gamepatcher.yaml`
///
/// Every field has a default, so a missing or partial file is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatcherConfig {
    /// External tool executables
    pub tools: ToolPaths,

    /// Maximum time a single tool invocation may take
    pub tool_timeout_secs: u64,

    /// Downgrade failed patch entries to warnings instead of failing the mapping
    pub tolerant: bool,

    /// Maximum number of images / mappings processed at the same time
    pub max_workers: usize,

    pub debug_mode: bool,

    pub log_dir: Utf8PathBuf,

    /// Patch archive entry name for each patch target
    pub patch_names: IndexMap<PatchTarget, String>,
}

/// Paths (or bare names resolved through `PATH`) of the external tools
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    pub xdelta: Utf8PathBuf,
    pub dstool: Utf8PathBuf,
    pub ctrtool: Utf8PathBuf,
    pub makerom: Utf8PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            xdelta: Utf8PathBuf::from("xdelta3"),
            dstool: Utf8PathBuf::from("3dstool"),
            ctrtool: Utf8PathBuf::from("ctrtool"),
            makerom: Utf8PathBuf::from("makerom"),
        }
    }
}

impl Default for PatcherConfig {
    fn default() -> Self {
        Self {
            tools: ToolPaths::default(),
            tool_timeout_secs: default_tool_timeout(),
            tolerant: false,
            max_workers: default_max_workers(),
            debug_mode: false,
            log_dir: Utf8PathBuf::from("logs"),
            patch_names: default_patch_names(),
        }
    }
}

fn default_tool_timeout() -> u64 {
    1800
}

fn default_max_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_patch_names() -> IndexMap<PatchTarget, String> {
    PatchTarget::ALL
        .into_iter()
        .map(|t| (t, t.default_entry_name().to_string()))
        .collect()
}

impl PatcherConfig {
    /// Entry name configured for `target`, falling back to its default
    pub fn patch_name(&self, target: PatchTarget) -> &str {
        self.patch_names
            .get(&target)
            .map(String::as_str)
            .unwrap_or_else(|| target.default_entry_name())
    }

    /// Worker count, never less than one
    pub fn workers(&self) -> usize {
        self.max_workers.max(1)
    }
}
