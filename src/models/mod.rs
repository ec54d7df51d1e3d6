//! Data models for GamePatcher.
//!
//! - [`VersionCode`]: packed three-part title version
//! - [`ContainerKind`], [`Component`], [`PatchTarget`]: container layouts and the files they decompose into
//! - [`Mapping`], [`FileListing`]: units of work and the directory snapshot they are inferred from
//! - [`PatcherConfig`]: settings loaded from `gamepatcher.yaml`
//! - [`RunState`]: per-mapping progress through the pipeline

pub mod config;
pub mod container;
pub mod mapping;
pub mod run_state;
pub mod version;

pub use config::{PatcherConfig, ToolPaths};
pub use container::{COMPONENTS, Component, ContainerKind, PartitionFormat, PartitionSlot, PatchTarget};
pub use mapping::{FileEntry, FileListing, Mapping, escape_name, output_name};
pub use run_state::{MappingStatus, PipelineStage, RunState};
pub use version::{VersionCode, VersionError};
