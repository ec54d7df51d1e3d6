//! Container Codec: turns a container into named component files and back.
//!
//! [`ThreeDsToolCodec`] drives three external tools:
//! - `ctrtool` decrypts the contents of a `.cia` into one file per content index
//! - `3dstool` splits `.3ds` images into partitions, partitions into components,
//!   and the ExeFS image into a directory (and the reverse of all three)
//! - `makerom` packs rebuilt partitions into a new `.cia`

use crate::models::container::{PartitionFormat, PartitionSlot, component, find_component};
use crate::models::{ContainerKind, VersionCode};
use crate::services::tool::{ToolError, ToolRunner, arg};
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use std::fs;
use thiserror::Error;

/// Component name → file (or directory) path
pub type ComponentMap = IndexMap<String, Utf8PathBuf>;

/// Errors from decoding or encoding a container
#[derive(Error, Debug)]
pub enum CodecError {
    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unexpected file in extraction output: {0}")]
    UnexpectedOutput(String),

    #[error("No partitions to compose in {0}")]
    NoPartitions(Utf8PathBuf),

    #[error("Missing component '{0}'")]
    MissingComponent(&'static str),

    #[error("A {0} container needs a version to rebuild")]
    MissingVersion(ContainerKind),
}

impl CodecError {
    fn io(path: impl Into<Utf8PathBuf>, source: std::io::Error) -> Self {
        CodecError::Io {
            path: path.into(),
            source,
        }
    }
}

/// The Container Codec collaborator
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContainerCodec: Send + Sync {
    /// Decode `container` into components written under `dest`.
    ///
    /// Returns the components that were actually produced, keyed by component name.
    async fn decompose(
        &self,
        container: &Utf8Path,
        kind: ContainerKind,
        dest: &Utf8Path,
    ) -> Result<ComponentMap, CodecError>;

    /// Encode `components` (living in `source`) into a new container at `output`.
    ///
    /// `version` is required for kinds where [`ContainerKind::uses_version`] holds and
    /// ignored otherwise.
    async fn compose(
        &self,
        source: &Utf8Path,
        components: &ComponentMap,
        kind: ContainerKind,
        version: Option<VersionCode>,
        output: &Utf8Path,
    ) -> Result<(), CodecError>;
}

/// Tool executables used by [`ThreeDsToolCodec`]
#[derive(Debug, Clone)]
pub struct CodecTools {
    pub dstool: Utf8PathBuf,
    pub ctrtool: Utf8PathBuf,
    pub makerom: Utf8PathBuf,
}

/// [`ContainerCodec`] backed by ctrtool, 3dstool and makerom
pub struct ThreeDsToolCodec {
    tools: CodecTools,
    runner: ToolRunner,
}

impl ThreeDsToolCodec {
    pub fn new(tools: CodecTools, runner: ToolRunner) -> Self {
        Self { tools, runner }
    }

    /// Decrypt every content of a CIA into `DecryptedPartition<N>.bin`
    async fn decrypt_cia(&self, container: &Utf8Path, dest: &Utf8Path) -> Result<Vec<u8>, CodecError> {
        let prefix = dest.join("Decrypted");
        let args = vec!["-x".to_string(), format!("--content={}", prefix), arg(container)];
        self.runner.run(&self.tools.ctrtool, &args).await?;

        collect_contents(dest, ContainerKind::Cia.partition_slots())
    }

    /// Split a CCI into `HeaderNCSD.bin` and `DecryptedPartition<N>.bin`
    async fn split_cci(&self, container: &Utf8Path, dest: &Utf8Path) -> Result<Vec<u8>, CodecError> {
        let slots = ContainerKind::Cci.partition_slots();
        let mut args = vec![
            "-xtf".to_string(),
            "3ds".to_string(),
            arg(container),
            "--header".to_string(),
            arg(dest.join(original_name(component::NCSD_HEADER)?)),
        ];
        for slot in slots {
            args.push(format!("-{}", slot.index));
            args.push(arg(dest.join(slot.decrypted_file())));
        }
        self.runner.run(&self.tools.dstool, &args).await?;

        Ok(slots
            .iter()
            .filter(|slot| dest.join(slot.decrypted_file()).is_file())
            .map(|slot| slot.index)
            .collect())
    }

    /// Split one decrypted partition into its components and drop the partition file
    async fn split_partition(&self, slot: &PartitionSlot, dest: &Utf8Path) -> Result<(), CodecError> {
        let Some(kind) = format_arg(slot.format) else {
            return Ok(());
        };

        let partition = dest.join(slot.decrypted_file());
        let mut args = vec!["-xtf".to_string(), kind.to_string(), arg(&partition)];
        for &name in slot.components {
            args.push(partition_flag(name).to_string());
            args.push(arg(dest.join(original_name(name)?)));
        }

        tracing::debug!("Splitting partition {}", slot.index);
        self.runner.run(&self.tools.dstool, &args).await?;
        fs::remove_file(&partition).map_err(|e| CodecError::io(&partition, e))
    }

    async fn extract_exefs(&self, dest: &Utf8Path) -> Result<(), CodecError> {
        let image = dest.join(original_name(component::EXEFS_IMAGE)?);
        if !image.is_file() {
            return Ok(());
        }

        let args = vec![
            "-xtf".to_string(),
            "exefs".to_string(),
            arg(&image),
            "--exefs-dir".to_string(),
            arg(dest.join(original_name(component::EXEFS_DIR)?)),
            "--header".to_string(),
            arg(dest.join(original_name(component::EXEFS_HEADER)?)),
        ];
        self.runner.run(&self.tools.dstool, &args).await?;
        Ok(())
    }

    /// Rebuild the ExeFS image from its directory, if both directory and header are present
    async fn build_exefs(
        &self,
        source: &Utf8Path,
        components: &mut ComponentMap,
    ) -> Result<(), CodecError> {
        let (Some(dir), Some(header)) = (
            components.get(component::EXEFS_DIR),
            components.get(component::EXEFS_HEADER),
        ) else {
            return Ok(());
        };

        let image = match components.get(component::EXEFS_IMAGE) {
            Some(path) => path.clone(),
            None => source.join(custom_name(component::EXEFS_IMAGE)?),
        };
        let args = vec![
            "-ctf".to_string(),
            "exefs".to_string(),
            arg(&image),
            "--exefs-dir".to_string(),
            arg(dir),
            "--header".to_string(),
            arg(header),
        ];
        self.runner.run(&self.tools.dstool, &args).await?;

        components.insert(component::EXEFS_IMAGE.to_string(), image);
        Ok(())
    }

    /// Assemble one partition from its components.
    ///
    /// Returns the partition file, or `None` if the required components are missing.
    async fn build_partition(
        &self,
        slot: &PartitionSlot,
        source: &Utf8Path,
        components: &ComponentMap,
    ) -> Result<Option<Utf8PathBuf>, CodecError> {
        let Some(kind) = format_arg(slot.format) else {
            // Raw partitions are passed through as they are
            return Ok(slot.components.first().and_then(|c| components.get(*c).cloned()));
        };

        if !required_components(slot)
            .iter()
            .all(|name| components.contains_key(*name))
        {
            return Ok(None);
        }

        let partition = source.join(slot.custom_file());
        let mut args = vec!["-ctf".to_string(), kind.to_string(), arg(&partition)];
        for &name in slot.components {
            if let Some(path) = components.get(name) {
                args.push(partition_flag(name).to_string());
                args.push(arg(path));
            }
        }

        tracing::debug!("Building partition {}", slot.index);
        self.runner.run(&self.tools.dstool, &args).await?;
        Ok(Some(partition))
    }
}

#[async_trait]
impl ContainerCodec for ThreeDsToolCodec {
    async fn decompose(
        &self,
        container: &Utf8Path,
        kind: ContainerKind,
        dest: &Utf8Path,
    ) -> Result<ComponentMap, CodecError> {
        fs::create_dir_all(dest).map_err(|e| CodecError::io(dest, e))?;

        let indices = match kind {
            ContainerKind::Cia => self.decrypt_cia(container, dest).await?,
            ContainerKind::Cci => self.split_cci(container, dest).await?,
        };

        for slot in kind.partition_slots() {
            if indices.contains(&slot.index) {
                self.split_partition(slot, dest).await?;
            }
        }
        self.extract_exefs(dest).await?;

        Ok(existing_components(dest, |c| c.original))
    }

    async fn compose(
        &self,
        source: &Utf8Path,
        components: &ComponentMap,
        kind: ContainerKind,
        version: Option<VersionCode>,
        output: &Utf8Path,
    ) -> Result<(), CodecError> {
        let mut components = components.clone();
        self.build_exefs(source, &mut components).await?;

        let mut partitions = Vec::new();
        for slot in kind.partition_slots() {
            if let Some(path) = self.build_partition(slot, source, &components).await? {
                partitions.push((slot, path));
            }
        }
        if partitions.is_empty() {
            return Err(CodecError::NoPartitions(source.to_path_buf()));
        }

        let args = match kind {
            ContainerKind::Cia => {
                let version = version.ok_or(CodecError::MissingVersion(kind))?;
                cia_args(&partitions, version, output)
            }
            ContainerKind::Cci => {
                let header = components
                    .get(component::NCSD_HEADER)
                    .ok_or(CodecError::MissingComponent(component::NCSD_HEADER))?;
                cci_args(&partitions, header, output)
            }
        };
        let program = match kind {
            ContainerKind::Cia => &self.tools.makerom,
            ContainerKind::Cci => &self.tools.dstool,
        };
        self.runner.run(program, &args).await?;

        for (slot, path) in &partitions {
            if slot.format != PartitionFormat::Raw {
                fs::remove_file(path).map_err(|e| CodecError::io(path, e))?;
            }
        }
        Ok(())
    }
}

/// Content index encoded in a ctrtool output name such as `Decrypted.0001.00000000`
fn content_index(name: &str) -> Option<u16> {
    name.strip_prefix("Decrypted.")?.get(..4)?.parse().ok()
}

/// Rename the decrypted contents in `dest` that belong to a partition slot and
/// remove the rest. Returns the slot indices found, sorted.
fn collect_contents(dest: &Utf8Path, slots: &[PartitionSlot]) -> Result<Vec<u8>, CodecError> {
    let mut indices = Vec::new();
    for entry in dest.read_dir_utf8().map_err(|e| CodecError::io(dest, e))? {
        let entry = entry.map_err(|e| CodecError::io(dest, e))?;
        let name = entry.file_name();
        let index = content_index(name)
            .ok_or_else(|| CodecError::UnexpectedOutput(name.to_string()))?;

        let Some(slot) = slots.iter().find(|s| u16::from(s.index) == index) else {
            tracing::debug!("Dropping content {} without a partition slot", index);
            fs::remove_file(entry.path()).map_err(|e| CodecError::io(entry.path(), e))?;
            continue;
        };
        let target = dest.join(slot.decrypted_file());
        fs::rename(entry.path(), &target).map_err(|e| CodecError::io(&target, e))?;
        indices.push(slot.index);
    }

    indices.sort_unstable();
    Ok(indices)
}

fn format_arg(format: PartitionFormat) -> Option<&'static str> {
    match format {
        PartitionFormat::Cxi => Some("cxi"),
        PartitionFormat::Cfa => Some("cfa"),
        PartitionFormat::Raw => None,
    }
}

/// 3dstool option that carries `name` inside a partition
fn partition_flag(name: &str) -> &'static str {
    match name {
        component::EX_HEADER => "--exh",
        component::EXEFS_IMAGE => "--exefs",
        component::LOGO => "--logo",
        component::PLAIN => "--plain",
        component::ROMFS | component::MANUAL | component::DOWNLOAD_PLAY => "--romfs",
        _ => "--header",
    }
}

/// Components a partition cannot be built without
fn required_components(slot: &PartitionSlot) -> &'static [&'static str] {
    match slot.format {
        PartitionFormat::Cxi => &[component::HEADER0, component::EX_HEADER, component::EXEFS_IMAGE],
        _ => slot.components,
    }
}

fn original_name(name: &'static str) -> Result<&'static str, CodecError> {
    find_component(name)
        .map(|c| c.original)
        .ok_or(CodecError::MissingComponent(name))
}

fn custom_name(name: &'static str) -> Result<&'static str, CodecError> {
    find_component(name)
        .map(|c| c.custom)
        .ok_or(CodecError::MissingComponent(name))
}

/// Every catalog component present in `dir` under the name chosen by `pick`
pub fn existing_components(
    dir: &Utf8Path,
    pick: impl Fn(&crate::models::Component) -> &'static str,
) -> ComponentMap {
    crate::models::COMPONENTS
        .iter()
        .filter_map(|c| {
            let path = dir.join(pick(c));
            let present = if c.is_dir { path.is_dir() } else { path.is_file() };
            present.then(|| (c.name.to_string(), path))
        })
        .collect()
}

fn cia_args(
    partitions: &[(&PartitionSlot, Utf8PathBuf)],
    version: VersionCode,
    output: &Utf8Path,
) -> Vec<String> {
    let mut args = vec!["-f".to_string(), "cia".to_string()];
    for (slot, path) in partitions {
        args.push("-content".to_string());
        args.push(format!("{}:{}:{}", path, slot.index, slot.index));
    }
    args.extend([
        "-ver".to_string(),
        version.raw().to_string(),
        "-o".to_string(),
        arg(output),
        "-target".to_string(),
        "p".to_string(),
        "-ignoresign".to_string(),
    ]);
    args
}

fn cci_args(
    partitions: &[(&PartitionSlot, Utf8PathBuf)],
    header: &Utf8Path,
    output: &Utf8Path,
) -> Vec<String> {
    let mut args = vec![
        "-ctf".to_string(),
        "3ds".to_string(),
        arg(output),
        "--header".to_string(),
        arg(header),
    ];
    for (slot, path) in partitions {
        args.push(format!("-{}", slot.index));
        args.push(arg(path));
    }
    args
}
