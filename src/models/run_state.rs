use crate::models::mapping::Mapping;
use indexmap::IndexMap;
use std::fmt;

/// The four ordered pipeline stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineStage {
    Extract,
    Stage,
    Apply,
    Rebuild,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineStage::Extract => "extract",
            PipelineStage::Stage => "stage",
            PipelineStage::Apply => "apply",
            PipelineStage::Rebuild => "rebuild",
        };
        f.write_str(name)
    }
}

/// Where a mapping is in `Pending → Extracted → Applied → Rebuilt`.
///
/// `Failed` and `Aborted` are terminal and reachable from any non-terminal state.
/// `Aborted` marks an internal error (a worker task panicked or was cancelled)
/// rather than a failure of the unit itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingStatus {
    Pending,
    Extracted,
    Applied,
    Rebuilt,
    Failed { stage: PipelineStage, reason: String },
    Aborted { reason: String },
}

impl MappingStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MappingStatus::Rebuilt | MappingStatus::Failed { .. } | MappingStatus::Aborted { .. }
        )
    }

    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            MappingStatus::Failed { .. } | MappingStatus::Aborted { .. }
        )
    }

    fn rank(&self) -> u8 {
        match self {
            MappingStatus::Pending => 0,
            MappingStatus::Extracted => 1,
            MappingStatus::Applied => 2,
            MappingStatus::Rebuilt => 3,
            MappingStatus::Failed { .. } | MappingStatus::Aborted { .. } => 4,
        }
    }

    /// Whether moving from `self` to `next` is a legal transition
    pub fn can_advance_to(&self, next: &MappingStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next.is_failed() {
            return true;
        }
        next.rank() == self.rank() + 1
    }

    /// Short label used in logs and progress events
    pub fn label(&self) -> &'static str {
        match self {
            MappingStatus::Pending => "pending",
            MappingStatus::Extracted => "extracted",
            MappingStatus::Applied => "applied",
            MappingStatus::Rebuilt => "rebuilt",
            MappingStatus::Failed { .. } => "failed",
            MappingStatus::Aborted { .. } => "aborted",
        }
    }
}

/// Progress of one run over a mapping set
#[derive(Clone, Debug, Default)]
pub struct RunState {
    pub is_running: bool,
    pub current_stage: Option<PipelineStage>,

    /// Every mapping of the run, in processing order
    pub mappings: IndexMap<Mapping, MappingStatus>,
}

impl RunState {
    /// Reset and register `mappings` as pending
    pub fn start(&mut self, mappings: impl IntoIterator<Item = Mapping>) {
        self.is_running = true;
        self.current_stage = None;
        self.mappings = mappings
            .into_iter()
            .map(|m| (m, MappingStatus::Pending))
            .collect();
    }

    /// Move `mapping` to `next` if that is a legal transition.
    ///
    /// Returns `false` (and leaves the state alone) for unknown mappings and
    /// illegal transitions.
    pub fn advance(&mut self, mapping: &Mapping, next: MappingStatus) -> bool {
        match self.mappings.get_mut(mapping) {
            Some(status) if status.can_advance_to(&next) => {
                *status = next;
                true
            }
            Some(status) => {
                tracing::warn!(
                    "Ignoring illegal transition for {}: {} -> {}",
                    mapping,
                    status.label(),
                    next.label()
                );
                false
            }
            None => false,
        }
    }

    pub fn status(&self, mapping: &Mapping) -> Option<&MappingStatus> {
        self.mappings.get(mapping)
    }

    /// Number of mappings that produced an output
    pub fn created(&self) -> usize {
        self.mappings
            .values()
            .filter(|s| matches!(s, MappingStatus::Rebuilt))
            .count()
    }

    /// Number of mappings that failed or were aborted
    pub fn failed(&self) -> usize {
        self.mappings.values().filter(|s| s.is_failed()).count()
    }

    /// Number of mappings that reached a terminal state
    pub fn finished(&self) -> usize {
        self.mappings.values().filter(|s| s.is_terminal()).count()
    }

    pub fn total(&self) -> usize {
        self.mappings.len()
    }
}
