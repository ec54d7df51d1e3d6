//! Services module - the patching pipeline and the collaborators it drives.
//!
//! # Components
//!
//! - [`resolver`]: decides which patch archive goes onto which game container, either
//!   from explicit `--mapping` triples or by inference over a directory snapshot.
//! - [`workspace`]: names the cached per-image and per-mapping working directories
//!   and removes them again on cleanup.
//! - [`codec`] and [`patcher`]: the two external collaborators, behind the
//!   [`ContainerCodec`] and [`PatchApplier`] traits. The default implementations
//!   shell out to ctrtool / 3dstool / makerom and xdelta3 through [`tool::ToolRunner`].
//! - [`pipeline`]: the Extract, Stage, Apply and Rebuild stages for a single unit.
//! - [`coordinator`]: runs the stages over a whole mapping set with bounded
//!   concurrency and produces the [`RunSummary`].
//!
//! # Usage Example
//!
//! ```ignore
//! use gamepatcher::services::*;
//!
//! let listing = FileListing::scan(dir)?;
//! let mappings = resolve(&listing, None)?;
//!
//! let pipeline = Pipeline::new(workspace, codec, applier, table, metrics.clone());
//! let summary = RunCoordinator::new(Arc::new(pipeline), state, metrics)
//!     .with_max_workers(4)
//!     .run(&mappings)
//!     .await;
//! summary.log();
//! ```

pub mod codec;
pub mod coordinator;
pub mod patcher;
pub mod pipeline;
pub mod resolver;
pub mod tool;
pub mod workspace;

pub use codec::{CodecError, CodecTools, ComponentMap, ContainerCodec, ThreeDsToolCodec};
pub use coordinator::{MappingReport, Outcome, RunCoordinator, RunSummary};
pub use patcher::{PatchApplier, PatchError, XdeltaPatcher};
pub use pipeline::{ComponentTable, Pipeline, StageError, component_table};
pub use resolver::{
    MappingInputError, ResolveError, infer_mappings, parse_explicit_mapping, resolve,
    version_token,
};
pub use tool::{ToolError, ToolRunner};
pub use workspace::Workspace;
