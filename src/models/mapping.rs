use crate::models::container::ContainerKind;
use crate::models::version::VersionCode;
use anyhow::{Context, Result};
use camino::Utf8Path;
use regex::Regex;
use std::fmt;
use std::fs;
use std::sync::LazyLock;

/// Extension of patch archives
pub const PATCH_EXTENSION: &str = "zip";

static NON_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\w]+").expect("Invalid escape regex"));

/// One unit of work: apply `patch` to `game` and stamp the result with `version`.
///
/// Field order gives the processing order: patch name first, then game name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Mapping {
    pub patch: String,
    pub game: String,
    pub version: VersionCode,
}

impl Mapping {
    pub fn new(patch: impl Into<String>, game: impl Into<String>, version: VersionCode) -> Self {
        Self {
            patch: patch.into(),
            game: game.into(),
            version,
        }
    }

    /// Name of the container this mapping produces
    pub fn output_name(&self) -> String {
        output_name(&self.game, &self.patch)
    }
}

impl fmt::Display for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} → {}", self.patch, self.game)
    }
}

/// `"<game-stem> (<patch-stem>)<game-ext>"`
pub fn output_name(game: &str, patch: &str) -> String {
    let (game_stem, game_ext) = split_extension(game);
    let (patch_stem, _) = split_extension(patch);
    format!("{} ({}){}", game_stem, patch_stem, game_ext)
}

/// Split a file name into stem and extension (including the dot).
///
/// Leading dots do not start an extension, so `.hidden` has no extension.
pub fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 && !name[..idx].ends_with(['/', '\\']) => name.split_at(idx),
        _ => (name, ""),
    }
}

/// Collapse runs of non-word characters to `_` and trim underscores at both ends.
pub fn escape_name(name: &str) -> String {
    NON_WORD.replace_all(name, "_").trim_matches('_').to_string()
}

/// A regular file in the working directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
}

impl FileEntry {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
        }
    }

    /// Patch archives are matched on their exact extension
    pub fn is_patch(&self) -> bool {
        split_extension(&self.name).1 == format!(".{}", PATCH_EXTENSION)
    }

    pub fn kind(&self) -> Option<ContainerKind> {
        ContainerKind::from_path(&self.name)
    }
}

/// Snapshot of the regular files in a working directory, sorted by name.
///
/// Mapping inference only ever looks at a snapshot, so results do not depend on
/// directory iteration order or on files appearing mid-run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileListing {
    entries: Vec<FileEntry>,
}

impl FileListing {
    pub fn new(mut entries: Vec<FileEntry>) -> Self {
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries.dedup_by(|a, b| a.name == b.name);
        Self { entries }
    }

    /// Read the regular files directly inside `dir`.
    ///
    /// Files whose names are not valid UTF-8 can be neither patch nor game and are
    /// skipped with a warning.
    pub fn scan(dir: &Utf8Path) -> Result<Self> {
        let mut entries = Vec::new();

        for entry in
            fs::read_dir(dir).with_context(|| format!("Failed to read directory: {}", dir))?
        {
            let entry = entry.with_context(|| format!("Failed to read entry in {}", dir))?;
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(name) => {
                    tracing::warn!(
                        "Skipping file with a non UTF-8 name: {}",
                        name.to_string_lossy()
                    );
                    continue;
                }
            };
            let path = dir.join(&name);
            let metadata =
                fs::metadata(&path).with_context(|| format!("Failed to stat {}", path))?;
            if metadata.is_file() {
                entries.push(FileEntry::new(name, metadata.len()));
            }
        }

        tracing::debug!("Scanned {} files in {}", entries.len(), dir);
        Ok(Self::new(entries))
    }

    pub fn entries(&self) -> &[FileEntry] {
        &self.entries
    }

    pub fn get(&self, name: &str) -> Option<&FileEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn patches(&self) -> impl Iterator<Item = &FileEntry> {
        self.entries.iter().filter(|e| e.is_patch())
    }

    pub fn games(&self, kind: ContainerKind) -> impl Iterator<Item = &FileEntry> {
        self.entries.iter().filter(move |e| e.kind() == Some(kind))
    }
}
