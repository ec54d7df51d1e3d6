// State management module
//
// This module provides the StateManager which wraps RunState with thread-safe access
// using Arc<RwLock<T>> and emits change events for progress reporting.

use crate::models::{Mapping, MappingStatus, PipelineStage, RunState};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;

/// Change events emitted when run state is modified
///
/// Subscribers (the CLI progress logger, tests) receive these without polling.
#[derive(Clone, Debug, PartialEq)]
pub enum StateChange {
    /// A run over `total` mappings has started
    RunStarted { total: usize },

    /// The coordinator moved on to another pipeline stage
    StageChanged { stage: PipelineStage },

    /// A mapping moved through the state machine
    MappingAdvanced {
        mapping: Mapping,
        status: MappingStatus,
        finished: usize,
        total: usize,
    },

    /// The run is over
    RunFinished { created: usize, failed: usize },
}

/// Thread-safe run state with event emission
///
/// Worker tasks of the coordinator share one `StateManager` (it is cheap to clone)
/// and report every transition through it; the manager rejects illegal
/// transitions and broadcasts the legal ones.
pub struct StateManager {
    state: Arc<RwLock<RunState>>,

    /// Broadcast channel for emitting state change events
    state_tx: broadcast::Sender<StateChange>,
}

impl StateManager {
    /// Create a new StateManager with an empty run
    ///
    /// The broadcast channel buffers 256 events; slow subscribers lag rather than block workers.
    pub fn new() -> Self {
        let (state_tx, _) = broadcast::channel(256);
        Self {
            state: Arc::new(RwLock::new(RunState::default())),
            state_tx,
        }
    }

    // A worker that panicked while holding the lock leaves the state readable.
    fn read_guard(&self) -> RwLockReadGuard<'_, RunState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_guard(&self) -> RwLockWriteGuard<'_, RunState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Clone the current state
    pub fn snapshot(&self) -> RunState {
        self.read_guard().clone()
    }

    /// Execute a function with read access to the state
    ///
    /// # Example
    /// ```ignore
    /// let failed = state_manager.read(|state| state.failed());
    /// ```
    pub fn read<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&RunState) -> R,
    {
        let state = self.read_guard();
        f(&state)
    }

    /// Subscribe to state change events
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.state_tx.subscribe()
    }

    fn emit(&self, change: StateChange) {
        // Ignore send errors - it's OK if no one is listening
        let _ = self.state_tx.send(change);
    }

    /// Register a new run; every mapping starts as pending
    pub fn start_run(&self, mappings: impl IntoIterator<Item = Mapping>) -> StateChange {
        let total = {
            let mut state = self.write_guard();
            state.start(mappings);
            state.total()
        };

        let change = StateChange::RunStarted { total };
        self.emit(change.clone());
        change
    }

    /// Record that the coordinator entered `stage`
    pub fn enter_stage(&self, stage: PipelineStage) {
        self.write_guard().current_stage = Some(stage);
        self.emit(StateChange::StageChanged { stage });
    }

    /// Move a mapping to `status`
    ///
    /// # Returns
    /// The emitted event, or `None` if the transition was rejected
    pub fn advance(&self, mapping: &Mapping, status: MappingStatus) -> Option<StateChange> {
        let change = {
            let mut state = self.write_guard();
            if !state.advance(mapping, status.clone()) {
                return None;
            }
            StateChange::MappingAdvanced {
                mapping: mapping.clone(),
                status,
                finished: state.finished(),
                total: state.total(),
            }
        };

        self.emit(change.clone());
        Some(change)
    }

    /// Mark the run as finished
    pub fn finish_run(&self) -> StateChange {
        let change = {
            let mut state = self.write_guard();
            state.is_running = false;
            state.current_stage = None;
            StateChange::RunFinished {
                created: state.created(),
                failed: state.failed(),
            }
        };

        self.emit(change.clone());
        change
    }
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}

// Make StateManager cloneable for sharing across worker tasks
impl Clone for StateManager {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            state_tx: self.state_tx.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::VersionCode;

    fn mapping(patch: &str) -> Mapping {
        Mapping::new(patch, "game.cia", VersionCode::from_raw(1024))
    }

    #[test]
    fn test_new_state_manager() {
        let manager = StateManager::new();
        let state = manager.snapshot();

        assert!(!state.is_running);
        assert_eq!(state.total(), 0);
    }

    #[test]
    fn test_start_run() {
        let manager = StateManager::new();
        let change = manager.start_run([mapping("a.zip"), mapping("b.zip")]);

        assert_eq!(change, StateChange::RunStarted { total: 2 });
        assert!(manager.read(|s| s.is_running));
    }

    #[test]
    fn test_advance_emits_progress() {
        let manager = StateManager::new();
        let m = mapping("a.zip");
        manager.start_run([m.clone()]);

        let change = manager.advance(&m, MappingStatus::Extracted);
        assert!(matches!(
            change,
            Some(StateChange::MappingAdvanced {
                finished: 0,
                total: 1,
                ..
            })
        ));
    }

    #[test]
    fn test_illegal_transition_is_rejected() {
        let manager = StateManager::new();
        let m = mapping("a.zip");
        manager.start_run([m.clone()]);

        assert!(manager.advance(&m, MappingStatus::Rebuilt).is_none());
        assert_eq!(manager.read(|s| s.status(&m).cloned()), Some(MappingStatus::Pending));
    }

    #[test]
    fn test_finish_run_counts() {
        let manager = StateManager::new();
        let ok = mapping("a.zip");
        let bad = mapping("b.zip");
        manager.start_run([ok.clone(), bad.clone()]);

        manager.advance(&ok, MappingStatus::Extracted);
        manager.advance(&ok, MappingStatus::Applied);
        manager.advance(&ok, MappingStatus::Rebuilt);
        manager.advance(
            &bad,
            MappingStatus::Failed {
                stage: PipelineStage::Extract,
                reason: "codec".to_string(),
            },
        );

        assert_eq!(
            manager.finish_run(),
            StateChange::RunFinished {
                created: 1,
                failed: 1
            }
        );
        assert!(!manager.read(|s| s.is_running));
    }

    #[test]
    fn test_subscribe_to_changes() {
        let manager = StateManager::new();
        let mut rx = manager.subscribe();

        manager.start_run([mapping("a.zip")]);
        manager.enter_stage(PipelineStage::Extract);

        assert!(matches!(
            rx.try_recv().unwrap(),
            StateChange::RunStarted { total: 1 }
        ));
        assert!(matches!(
            rx.try_recv().unwrap(),
            StateChange::StageChanged {
                stage: PipelineStage::Extract
            }
        ));
    }

    #[test]
    fn test_clones_share_state() {
        let manager = StateManager::new();
        let clone = manager.clone();
        let m = mapping("a.zip");

        manager.start_run([m.clone()]);
        clone.advance(&m, MappingStatus::Extracted);

        assert_eq!(
            manager.read(|s| s.status(&m).cloned()),
            Some(MappingStatus::Extracted)
        );
    }
}
