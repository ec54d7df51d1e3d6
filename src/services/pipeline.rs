//! The four per-mapping pipeline stages: Extract, Stage, Apply, Rebuild.
//!
//! Every stage returns a [`StageError`] instead of propagating tool failures, so the
//! coordinator can record it against the image or mapping and carry on with the rest.

use crate::metrics::Metrics;
use crate::models::{COMPONENTS, ContainerKind, Mapping, PatchTarget, PatcherConfig};
use crate::services::codec::{CodecError, ContainerCodec, existing_components};
use crate::services::patcher::{PatchApplier, PatchError};
use crate::services::workspace::Workspace;
use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use std::fs;
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Directory inside a mapping workspace the patch archive is expanded into
const PATCHES_DIR: &str = "Patches";

/// ExeFS files whose extension differs between the image and the extracted form
const EXEFS_RENAMES: [(&str, &str); 2] = [("banner.bnr", "banner.bin"), ("icon.icn", "icon.bin")];

/// Patch entry name → component it patches
pub type ComponentTable = IndexMap<String, PatchTarget>;

/// Build the entry-name lookup from the configured patch names
pub fn component_table(config: &PatcherConfig) -> ComponentTable {
    PatchTarget::ALL
        .into_iter()
        .map(|target| (config.patch_name(target).to_string(), target))
        .collect()
}

/// Why a stage failed for an image or mapping
#[derive(Error, Debug)]
pub enum StageError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Patch error: {0}")]
    Patch(#[from] PatchError),

    #[error("Unknown patch: {0}")]
    UnknownPatchEntry(String),

    #[error("Invalid patch archive {path}: {source}")]
    Archive {
        path: Utf8PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("Patch archive entry escapes its directory: {0}")]
    UnsafeEntry(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Not a supported container: {0}")]
    UnsupportedContainer(String),
}

impl StageError {
    fn io(path: impl Into<Utf8PathBuf>, source: io::Error) -> Self {
        StageError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Runs the stages for one working directory
pub struct Pipeline {
    workspace: Workspace,
    codec: Arc<dyn ContainerCodec>,
    applier: Arc<dyn PatchApplier>,
    table: ComponentTable,
    tolerant: bool,
    metrics: Arc<Metrics>,
}

impl Pipeline {
    pub fn new(
        workspace: Workspace,
        codec: Arc<dyn ContainerCodec>,
        applier: Arc<dyn PatchApplier>,
        table: ComponentTable,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            workspace,
            codec,
            applier,
            table,
            tolerant: false,
            metrics,
        }
    }

    /// Downgrade failed patch entries to warnings
    pub fn tolerant(mut self, tolerant: bool) -> Self {
        self.tolerant = tolerant;
        self
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Decode `game` into its image workspace, unless that workspace already exists.
    ///
    /// A failed extraction leaves no workspace behind.
    pub async fn extract(&self, game: &str) -> Result<(), StageError> {
        let dir = self.workspace.image_dir(game);
        if Workspace::exists(&dir) {
            tracing::info!("Found {}", dir);
            self.metrics.record_extract_cache_hit();
            return Ok(());
        }

        let kind = container_kind(game)?;
        tracing::info!("Extract {}", game);

        let container = self.workspace.file(game);
        let result = self.codec.decompose(&container, kind, &dir).await;
        let decoded = match result {
            Ok(components) => canonicalize_exefs(&dir).map(|_| components),
            Err(e) => Err(e.into()),
        };

        match decoded {
            Ok(components) => {
                self.metrics.record_image_extracted();
                tracing::info!("Extracted {} components to {}", components.len(), dir);
                Ok(())
            }
            Err(e) => {
                discard(&dir);
                Err(e)
            }
        }
    }

    /// Copy the image template into the mapping workspace and create every "Custom"
    /// counterpart, unless the mapping workspace already exists.
    pub async fn stage(&self, mapping: &Mapping) -> Result<(), StageError> {
        let dir = self.workspace.mapping_dir(&mapping.game, &mapping.patch);
        if Workspace::exists(&dir) {
            tracing::info!("Found {}", dir);
            self.metrics.record_stage_cache_hit();
            return Ok(());
        }

        let template = self.workspace.image_dir(&mapping.game);
        tracing::info!("Copy {}", template);

        let result = {
            let src = template.clone();
            let dest = dir.clone();
            match tokio::task::spawn_blocking(move || stage_dir(&src, &dest)).await {
                Ok(result) => result,
                Err(e) => Err(StageError::io(&template, io::Error::other(e))),
            }
        };
        if result.is_err() {
            discard(&dir);
        } else {
            tracing::info!("Copied to {}", dir);
        }
        result
    }

    /// Expand the patch archive and apply every entry to its component.
    ///
    /// The expanded entries are removed again whether or not patching succeeded.
    pub async fn apply(&self, mapping: &Mapping) -> Result<(), StageError> {
        let dir = self.workspace.mapping_dir(&mapping.game, &mapping.patch);
        let patch_dir = dir.join(PATCHES_DIR);
        tracing::info!("Apply {}", mapping);

        let result = self.apply_entries(mapping, &dir, &patch_dir).await;
        if let Err(e) = Workspace::delete(&patch_dir) {
            tracing::warn!("Failed to remove {}: {}", patch_dir, e);
        }

        if result.is_ok() {
            tracing::info!("Applied {}", mapping.patch);
        }
        result
    }

    async fn apply_entries(
        &self,
        mapping: &Mapping,
        dir: &Utf8Path,
        patch_dir: &Utf8Path,
    ) -> Result<(), StageError> {
        let archive = self.workspace.file(&mapping.patch);
        let entries = {
            let src = archive.clone();
            let dest = patch_dir.to_path_buf();
            tokio::task::spawn_blocking(move || expand_archive(&src, &dest))
                .await
                .map_err(|e| StageError::io(&archive, io::Error::other(e)))??
        };

        for entry in entries {
            let name = entry.file_name().unwrap_or(entry.as_str());
            let Some(target) = self.table.get(name) else {
                self.tolerate(StageError::UnknownPatchEntry(name.to_string()))?;
                continue;
            };

            let (original, custom) = target.paths();
            tracing::info!("Apply {}", name);
            let result = self
                .applier
                .apply(&dir.join(original), &patch_dir.join(&entry), &dir.join(custom))
                .await;
            if let Err(e) = result {
                self.tolerate(e.into())?;
            }
        }

        Ok(())
    }

    /// In tolerant mode log `error` and carry on, otherwise fail with it
    fn tolerate(&self, error: StageError) -> Result<(), StageError> {
        if !self.tolerant {
            return Err(error);
        }
        tracing::warn!("Skipping incompatible patch: {}", error);
        self.metrics.record_entry_tolerated();
        Ok(())
    }

    /// Compose the "Custom" components into the output container, replacing any
    /// previous output.
    pub async fn rebuild(&self, mapping: &Mapping) -> Result<(), StageError> {
        let kind = container_kind(&mapping.game)?;
        let dir = self.workspace.mapping_dir(&mapping.game, &mapping.patch);
        let output = self.workspace.output_path(&mapping.game, &mapping.patch);

        if output.is_file() {
            fs::remove_file(&output).map_err(|e| StageError::io(&output, e))?;
        }

        let version = kind.uses_version().then_some(mapping.version);
        match version {
            Some(v) => tracing::info!("Rebuild {} ({} {})", dir, kind, v),
            None => tracing::info!("Rebuild {} ({})", dir, kind),
        }

        let components = existing_components(&dir, |c| c.custom);
        let exefs = dir.join(custom_exefs_dir());

        restore_exefs(&exefs)?;
        let result = self
            .codec
            .compose(&dir, &components, kind, version, &output)
            .await;
        canonicalize_exefs_in(&exefs)?;
        result?;

        tracing::info!("Rebuilt {}", output);
        Ok(())
    }
}

fn container_kind(game: &str) -> Result<ContainerKind, StageError> {
    ContainerKind::from_path(game).ok_or_else(|| StageError::UnsupportedContainer(game.to_string()))
}

fn discard(dir: &Utf8Path) {
    if let Err(e) = Workspace::delete(dir) {
        tracing::warn!("Failed to remove incomplete workspace {}: {}", dir, e);
    }
}

fn custom_exefs_dir() -> &'static str {
    COMPONENTS
        .iter()
        .find(|c| c.is_dir)
        .map_or("CustomExeFS", |c| c.custom)
}

fn original_exefs_dir() -> &'static str {
    COMPONENTS
        .iter()
        .find(|c| c.is_dir)
        .map_or("ExtractedExeFS", |c| c.original)
}

fn stage_dir(template: &Utf8Path, dir: &Utf8Path) -> Result<(), StageError> {
    Workspace::clone_dir(template, dir).map_err(|e| StageError::io(template, e))?;

    for component in COMPONENTS {
        let original = dir.join(component.original);
        let custom = dir.join(component.custom);
        let copied = if component.is_dir {
            if !original.is_dir() {
                continue;
            }
            Workspace::clone_dir(&original, &custom)
        } else {
            if !original.is_file() {
                continue;
            }
            fs::copy(&original, &custom).map(|_| ())
        };
        copied.map_err(|e| StageError::io(&custom, e))?;
    }

    Ok(())
}

fn canonicalize_exefs(image_dir: &Utf8Path) -> Result<(), StageError> {
    canonicalize_exefs_in(&image_dir.join(original_exefs_dir()))
}

/// `banner.bnr` → `banner.bin`, `icon.icn` → `icon.bin`
fn canonicalize_exefs_in(exefs: &Utf8Path) -> Result<(), StageError> {
    for (native, canonical) in EXEFS_RENAMES {
        rename_if_present(&exefs.join(native), &exefs.join(canonical))?;
    }
    Ok(())
}

fn restore_exefs(exefs: &Utf8Path) -> Result<(), StageError> {
    for (native, canonical) in EXEFS_RENAMES {
        rename_if_present(&exefs.join(canonical), &exefs.join(native))?;
    }
    Ok(())
}

fn rename_if_present(from: &Utf8Path, to: &Utf8Path) -> Result<(), StageError> {
    if from.is_file() {
        fs::rename(from, to).map_err(|e| StageError::io(from, e))?;
    }
    Ok(())
}

/// Expand the regular file entries of `archive` below `dest`.
///
/// Returns the entry paths relative to `dest`, sorted by name.
fn expand_archive(archive: &Utf8Path, dest: &Utf8Path) -> Result<Vec<Utf8PathBuf>, StageError> {
    let zip_error = |source| StageError::Archive {
        path: archive.to_path_buf(),
        source,
    };

    let file = fs::File::open(archive).map_err(|e| StageError::io(archive, e))?;
    let mut zip = zip::ZipArchive::new(file).map_err(zip_error)?;
    fs::create_dir_all(dest).map_err(|e| StageError::io(dest, e))?;

    let mut entries = Vec::new();
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).map_err(zip_error)?;
        if entry.is_dir() {
            continue;
        }

        let relative = entry
            .enclosed_name()
            .and_then(|p| Utf8PathBuf::from_path_buf(p.to_path_buf()).ok())
            .ok_or_else(|| StageError::UnsafeEntry(entry.name().to_string()))?;

        let target = dest.join(&relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| StageError::io(parent, e))?;
        }
        let mut out = fs::File::create(&target).map_err(|e| StageError::io(&target, e))?;
        io::copy(&mut entry, &mut out).map_err(|e| StageError::io(&target, e))?;
        entries.push(relative);
    }

    entries.sort();
    Ok(entries)
}
