use crate::metrics::Metrics;
use crate::models::{Mapping, MappingStatus, PipelineStage};
use crate::services::pipeline::{Pipeline, StageError};
use crate::state::StateManager;
use camino::Utf8PathBuf;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Result of one unit of work; the error is the terminal status to record
type UnitResult = Result<(), MappingStatus>;

/// What became of one mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Created { output: String },
    Failed { stage: PipelineStage, reason: String },
    /// The worker task panicked or was cancelled
    Aborted { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingReport {
    pub mapping: Mapping,
    pub outcome: Outcome,
}

/// Per-mapping results of a run, in processing order
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub reports: Vec<MappingReport>,
}

impl RunSummary {
    pub fn created(&self) -> impl Iterator<Item = &MappingReport> {
        self.reports
            .iter()
            .filter(|r| matches!(r.outcome, Outcome::Created { .. }))
    }

    pub fn failed(&self) -> impl Iterator<Item = &MappingReport> {
        self.reports
            .iter()
            .filter(|r| !matches!(r.outcome, Outcome::Created { .. }))
    }

    /// Whether every mapping produced its output
    pub fn all_created(&self) -> bool {
        self.failed().next().is_none()
    }

    pub fn outcome(&self, mapping: &Mapping) -> Option<&Outcome> {
        self.reports
            .iter()
            .find(|r| &r.mapping == mapping)
            .map(|r| &r.outcome)
    }

    pub fn log(&self) {
        tracing::info!("~~ Summary ~~");
        for report in &self.reports {
            match &report.outcome {
                Outcome::Created { output } => tracing::info!("Created {}", output),
                Outcome::Failed { stage, reason } => {
                    tracing::error!("Failed {} ({} failed: {})", report.mapping, stage, reason)
                }
                Outcome::Aborted { reason } => {
                    tracing::error!("Aborted {} (internal error: {})", report.mapping, reason)
                }
            }
        }
    }
}

/// Drives every mapping through Extract → Stage/Apply → Rebuild.
///
/// Each phase runs its units as tokio tasks bounded by a semaphore. A failed image
/// fails every mapping that uses it; a failed mapping never affects another.
pub struct RunCoordinator {
    pipeline: Arc<Pipeline>,
    state: StateManager,
    metrics: Arc<Metrics>,
    max_workers: usize,
}

impl RunCoordinator {
    pub fn new(pipeline: Arc<Pipeline>, state: StateManager, metrics: Arc<Metrics>) -> Self {
        Self {
            pipeline,
            state,
            metrics,
            max_workers: 1,
        }
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    pub async fn run(&self, mappings: &BTreeSet<Mapping>) -> RunSummary {
        self.state.start_run(mappings.iter().cloned());
        tracing::info!(
            "Starting run over {} mappings (max concurrent: {})",
            mappings.len(),
            self.max_workers
        );

        // Extract each image once
        self.state.enter_stage(PipelineStage::Extract);
        let games: Vec<String> = mappings
            .iter()
            .map(|m| m.game.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let workspace = self.pipeline.workspace();
        let shared_images = shared_workspaces(&games, |game| workspace.image_dir(game));
        let games: Vec<String> = games
            .into_iter()
            .filter(|game| !shared_images.contains_key(game))
            .collect();
        let mut extracted: HashMap<String, UnitResult> = self
            .fan_out(games, |pipeline, game: String| async move {
                pipeline
                    .extract(&game)
                    .await
                    .map_err(|e| failed(PipelineStage::Extract, &game, e))
            })
            .await
            .into_iter()
            .collect();
        for (game, dir) in shared_images {
            tracing::error!("{} and another image both extract to {}", game, dir);
            let status = MappingStatus::Failed {
                stage: PipelineStage::Extract,
                reason: format!("workspace {} is shared with another image", dir),
            };
            extracted.insert(game, Err(status));
        }

        for mapping in mappings {
            match extracted.get(&mapping.game) {
                Some(Ok(())) => self.record(mapping, Ok(())),
                Some(Err(status)) => {
                    tracing::warn!("Skip {}", mapping);
                    self.record(mapping, Err(status.clone()));
                }
                None => self.record(
                    mapping,
                    Err(MappingStatus::Aborted {
                        reason: "image was never extracted".to_string(),
                    }),
                ),
            }
        }

        // Stage and patch
        self.state.enter_stage(PipelineStage::Stage);
        let all: Vec<Mapping> = mappings.iter().cloned().collect();
        let shared_mappings =
            shared_workspaces(&all, |m| workspace.mapping_dir(&m.game, &m.patch));
        for (mapping, dir) in &shared_mappings {
            tracing::error!("{} and another mapping both stage to {}", mapping, dir);
            self.record(
                mapping,
                Err(MappingStatus::Failed {
                    stage: PipelineStage::Stage,
                    reason: format!("workspace {} is shared with another mapping", dir),
                }),
            );
        }
        let pending = self.mappings_in(|s| matches!(s, MappingStatus::Extracted));
        let applied = self
            .fan_out(pending, |pipeline, mapping| async move {
                pipeline
                    .stage(&mapping)
                    .await
                    .map_err(|e| failed(PipelineStage::Stage, &mapping, e))?;
                pipeline
                    .apply(&mapping)
                    .await
                    .map_err(|e| failed(PipelineStage::Apply, &mapping, e))
            })
            .await;
        for (mapping, result) in applied {
            self.record(&mapping, result);
        }

        self.state.enter_stage(PipelineStage::Rebuild);
        let pending = self.mappings_in(|s| matches!(s, MappingStatus::Applied));
        let rebuilt = self
            .fan_out(pending, |pipeline, mapping| async move {
                pipeline
                    .rebuild(&mapping)
                    .await
                    .map_err(|e| failed(PipelineStage::Rebuild, &mapping, e))
            })
            .await;
        for (mapping, result) in rebuilt {
            self.record(&mapping, result);
        }

        self.state.finish_run();
        tracing::info!("Run completed");
        self.summarize()
    }

    /// Run `work` for every key, at most `max_workers` at a time
    async fn fan_out<K, F, Fut>(&self, keys: Vec<K>, work: F) -> Vec<(K, UnitResult)>
    where
        K: Clone + Send + 'static,
        F: Fn(Arc<Pipeline>, K) -> Fut,
        Fut: Future<Output = UnitResult> + Send + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let mut tasks = Vec::with_capacity(keys.len());

        for key in keys {
            let semaphore = Arc::clone(&semaphore);
            let unit = work(Arc::clone(&self.pipeline), key.clone());
            let task = tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| MappingStatus::Aborted {
                        reason: e.to_string(),
                    })?;
                unit.await
            });
            tasks.push((key, task));
        }

        let mut results = Vec::with_capacity(tasks.len());
        for (key, task) in tasks {
            let result = match task.await {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!("Task join error: {}", e);
                    Err(MappingStatus::Aborted {
                        reason: e.to_string(),
                    })
                }
            };
            results.push((key, result));
        }
        results
    }

    /// Advance `mapping` to the next status, or to the failure in `result`
    fn record(&self, mapping: &Mapping, result: UnitResult) {
        let next = match (result, self.state.read(|s| s.status(mapping).cloned())) {
            (Err(status), _) => status,
            (Ok(()), Some(MappingStatus::Pending)) => MappingStatus::Extracted,
            (Ok(()), Some(MappingStatus::Extracted)) => MappingStatus::Applied,
            (Ok(()), Some(MappingStatus::Applied)) => MappingStatus::Rebuilt,
            (Ok(()), _) => return,
        };
        self.state.advance(mapping, next);
    }

    fn mappings_in(&self, filter: impl Fn(&MappingStatus) -> bool) -> Vec<Mapping> {
        self.state.read(|s| {
            s.mappings
                .iter()
                .filter(|(_, status)| filter(status))
                .map(|(m, _)| m.clone())
                .collect()
        })
    }

    fn summarize(&self) -> RunSummary {
        let reports = self.state.read(|s| {
            s.mappings
                .iter()
                .map(|(mapping, status)| {
                    let outcome = match status {
                        MappingStatus::Rebuilt => Outcome::Created {
                            output: mapping.output_name(),
                        },
                        MappingStatus::Failed { stage, reason } => Outcome::Failed {
                            stage: *stage,
                            reason: reason.clone(),
                        },
                        MappingStatus::Aborted { reason } => Outcome::Aborted {
                            reason: reason.clone(),
                        },
                        other => Outcome::Aborted {
                            reason: format!("stopped while {}", other.label()),
                        },
                    };
                    MappingReport {
                        mapping: mapping.clone(),
                        outcome,
                    }
                })
                .collect::<Vec<_>>()
        });

        for report in &reports {
            match report.outcome {
                Outcome::Created { .. } => self.metrics.record_mapping_created(),
                _ => self.metrics.record_mapping_failed(),
            }
        }
        RunSummary { reports }
    }
}

/// Keys whose workspace directory is also claimed by another key
fn shared_workspaces<K: Clone + Ord>(
    keys: &[K],
    dir_of: impl Fn(&K) -> Utf8PathBuf,
) -> BTreeMap<K, Utf8PathBuf> {
    let mut claims: BTreeMap<Utf8PathBuf, Vec<&K>> = BTreeMap::new();
    for key in keys {
        claims.entry(dir_of(key)).or_default().push(key);
    }
    claims
        .into_iter()
        .filter(|(_, owners)| owners.len() > 1)
        .flat_map(|(dir, owners)| owners.into_iter().map(move |key| (key.clone(), dir.clone())))
        .collect()
}

fn failed(stage: PipelineStage, unit: &dyn std::fmt::Display, error: StageError) -> MappingStatus {
    tracing::error!("{} failed for {}: {}", stage, unit, error);
    MappingStatus::Failed {
        stage,
        reason: error.to_string(),
    }
}
