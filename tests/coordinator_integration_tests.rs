//! End-to-end runs of the coordinator over a real working directory.
//!
//! The container codec and the diff applier are replaced with in-process fakes
//! that write plain files, so these tests exercise:
//! - Extract → Stage/Apply → Rebuild over several mappings
//! - Reuse of existing image and mapping workspaces
//! - Failure isolation between images and mappings
//! - Strict versus tolerant handling of incompatible patches

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use gamepatcher::models::{ContainerKind, PipelineStage};
use gamepatcher::services::{
    CodecError, ComponentMap, ContainerCodec, Outcome, PatchApplier, PatchError, Pipeline,
    RunCoordinator, ToolError, Workspace, component_table,
};
use gamepatcher::{Mapping, Metrics, PatcherConfig, StateManager, VersionCode};
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::io::Write;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Writes a RomFS and an ExeFS directory per image; composes by copying the
/// custom RomFS into the output.
#[derive(Default)]
struct FakeCodec {
    broken: HashSet<String>,
    decomposed: Mutex<Vec<String>>,
    composed: Mutex<Vec<(ContainerKind, Option<VersionCode>)>>,
}

impl FakeCodec {
    fn broken(games: &[&str]) -> Self {
        Self {
            broken: games.iter().map(|g| g.to_string()).collect(),
            ..Self::default()
        }
    }

    fn decomposed(&self) -> Vec<String> {
        self.decomposed.lock().unwrap().clone()
    }

    fn composed(&self) -> Vec<(ContainerKind, Option<VersionCode>)> {
        self.composed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContainerCodec for FakeCodec {
    async fn decompose(
        &self,
        container: &Utf8Path,
        _kind: ContainerKind,
        dest: &Utf8Path,
    ) -> Result<ComponentMap, CodecError> {
        let name = container.file_name().unwrap().to_string();
        self.decomposed.lock().unwrap().push(name.clone());

        // Leave a partial workspace behind, like a tool dying halfway through
        fs::create_dir_all(dest.join("ExtractedExeFS")).unwrap();
        if self.broken.contains(&name) {
            return Err(CodecError::NoPartitions(container.to_path_buf()));
        }

        let content = fs::read(container).unwrap();
        fs::write(dest.join("DecryptedRomFS.bin"), &content).unwrap();
        fs::write(dest.join("ExtractedExeFS/banner.bnr"), b"banner").unwrap();

        let mut components = ComponentMap::new();
        components.insert("romfs".to_string(), dest.join("DecryptedRomFS.bin"));
        components.insert("exefs_dir".to_string(), dest.join("ExtractedExeFS"));
        Ok(components)
    }

    async fn compose(
        &self,
        source: &Utf8Path,
        components: &ComponentMap,
        kind: ContainerKind,
        version: Option<VersionCode>,
        output: &Utf8Path,
    ) -> Result<(), CodecError> {
        self.composed.lock().unwrap().push((kind, version));
        assert!(source.join("CustomExeFS/banner.bnr").is_file());

        let romfs = components
            .get("romfs")
            .ok_or(CodecError::MissingComponent("romfs"))?;
        fs::copy(romfs, output).unwrap();
        Ok(())
    }
}

/// Appends the diff to the original; a diff reading `incompatible` fails like
/// xdelta3 does on a checksum mismatch.
#[derive(Default)]
struct FakeApplier {
    applied: Mutex<Vec<Utf8PathBuf>>,
}

#[async_trait]
impl PatchApplier for FakeApplier {
    async fn apply(
        &self,
        original: &Utf8Path,
        diff: &Utf8Path,
        output: &Utf8Path,
    ) -> Result<(), PatchError> {
        self.applied.lock().unwrap().push(diff.to_path_buf());

        let diff = fs::read(diff).unwrap();
        if diff == b"incompatible" {
            return Err(PatchError::Tool(ToolError::Failed {
                tool: "xdelta3".to_string(),
                code: 1,
                stderr: "target window checksum mismatch".to_string(),
            }));
        }

        let mut patched =
            fs::read(original).map_err(|_| PatchError::SourceNotFound(original.to_path_buf()))?;
        patched.extend_from_slice(&diff);
        fs::write(output, patched).unwrap();
        Ok(())
    }
}

struct Fixture {
    _temp_dir: TempDir,
    dir: Utf8PathBuf,
    codec: Arc<FakeCodec>,
    applier: Arc<FakeApplier>,
    metrics: Arc<Metrics>,
}

impl Fixture {
    fn new(codec: FakeCodec) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let dir = Utf8PathBuf::try_from(temp_dir.path().to_path_buf()).unwrap();
        Self {
            _temp_dir: temp_dir,
            dir,
            codec: Arc::new(codec),
            applier: Arc::new(FakeApplier::default()),
            metrics: Arc::new(Metrics::new()),
        }
    }

    fn game(&self, name: &str, content: &[u8]) {
        fs::write(self.dir.join(name), content).unwrap();
    }

    fn patch(&self, name: &str, entries: &[(&str, &[u8])]) {
        let file = fs::File::create(self.dir.join(name)).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);
        for (entry, content) in entries {
            writer.start_file(entry.to_string(), options).unwrap();
            writer.write_all(content).unwrap();
        }
        writer.finish().unwrap();
    }

    async fn run(&self, mappings: &BTreeSet<Mapping>, tolerant: bool) -> gamepatcher::services::RunSummary {
        let pipeline = Pipeline::new(
            Workspace::new(self.dir.clone()),
            self.codec.clone(),
            self.applier.clone(),
            component_table(&PatcherConfig::default()),
            self.metrics.clone(),
        )
        .tolerant(tolerant);

        RunCoordinator::new(Arc::new(pipeline), StateManager::new(), self.metrics.clone())
            .with_max_workers(4)
            .run(mappings)
            .await
    }
}

fn base() -> VersionCode {
    VersionCode::from_raw(1024)
}

fn set(mappings: &[Mapping]) -> BTreeSet<Mapping> {
    mappings.iter().cloned().collect()
}

#[tokio::test]
async fn test_run_creates_outputs_for_both_kinds() {
    let fx = Fixture::new(FakeCodec::default());
    fx.game("Game.cia", b"cia-");
    fx.game("Game.3ds", b"cci-");
    fx.patch("Patch.zip", &[("RomFS.xdelta", b"patched")]);

    let mappings = set(&[
        Mapping::new("Patch.zip", "Game.cia", base()),
        Mapping::new("Patch.zip", "Game.3ds", base()),
    ]);
    let summary = fx.run(&mappings, false).await;

    assert!(summary.all_created(), "{:?}", summary.reports);
    assert_eq!(fs::read(fx.dir.join("Game (Patch).cia")).unwrap(), b"cia-patched");
    assert_eq!(fs::read(fx.dir.join("Game (Patch).3ds")).unwrap(), b"cci-patched");

    // Only the CIA rebuild carries a version
    let mut composed = fx.codec.composed();
    composed.sort_by_key(|(kind, _)| *kind);
    assert_eq!(
        composed,
        vec![(ContainerKind::Cia, Some(base())), (ContainerKind::Cci, None)]
    );

    // Extracted templates stay untouched and canonical
    let template = fx.dir.join("Game_cia");
    assert_eq!(fs::read(template.join("DecryptedRomFS.bin")).unwrap(), b"cia-");
    assert!(template.join("ExtractedExeFS/banner.bin").is_file());
    assert!(!fx.dir.join("Game_Patch_cia/Patches").exists());
    assert_eq!(fx.metrics.mappings_created.load(Ordering::Relaxed), 2);
}

#[tokio::test]
async fn test_image_shared_by_mappings_is_extracted_once() {
    let fx = Fixture::new(FakeCodec::default());
    fx.game("Game.cia", b"g");
    fx.patch("A.zip", &[("RomFS.xdelta", b"a")]);
    fx.patch("B.zip", &[("RomFS.xdelta", b"b")]);

    let summary = fx
        .run(
            &set(&[
                Mapping::new("A.zip", "Game.cia", base()),
                Mapping::new("B.zip", "Game.cia", base()),
            ]),
            false,
        )
        .await;

    assert!(summary.all_created());
    assert_eq!(fx.codec.decomposed(), vec!["Game.cia".to_string()]);
    assert_eq!(fs::read(fx.dir.join("Game (A).cia")).unwrap(), b"ga");
    assert_eq!(fs::read(fx.dir.join("Game (B).cia")).unwrap(), b"gb");
}

#[tokio::test]
async fn test_existing_workspaces_are_reused() {
    let fx = Fixture::new(FakeCodec::default());
    fx.game("Game.cia", b"g");
    fx.patch("Patch.zip", &[("RomFS.xdelta", b"p")]);
    let mappings = set(&[Mapping::new("Patch.zip", "Game.cia", base())]);

    assert!(fx.run(&mappings, false).await.all_created());
    let second = fx.run(&mappings, false).await;

    assert!(second.all_created());
    assert_eq!(fx.codec.decomposed().len(), 1);
    assert_eq!(fx.metrics.extract_cache_hits.load(Ordering::Relaxed), 1);
    assert_eq!(fx.metrics.stage_cache_hits.load(Ordering::Relaxed), 1);
    // Patches are reapplied to the pristine originals
    assert_eq!(fs::read(fx.dir.join("Game (Patch).cia")).unwrap(), b"gp");
}

#[tokio::test]
async fn test_failed_image_fails_only_its_mappings() {
    let fx = Fixture::new(FakeCodec::broken(&["Broken.cia"]));
    fx.game("Broken.cia", b"x");
    fx.game("Game.cia", b"g");
    fx.patch("Patch.zip", &[("RomFS.xdelta", b"p")]);

    let broken = Mapping::new("Patch.zip", "Broken.cia", base());
    let healthy = Mapping::new("Patch.zip", "Game.cia", base());
    let summary = fx.run(&set(&[broken.clone(), healthy.clone()]), false).await;

    assert!(matches!(
        summary.outcome(&broken),
        Some(Outcome::Failed {
            stage: PipelineStage::Extract,
            ..
        })
    ));
    assert!(matches!(summary.outcome(&healthy), Some(Outcome::Created { .. })));

    // Nothing of the broken image survives and nothing was attempted after extract
    assert!(!fx.dir.join("Broken_cia").exists());
    assert!(!fx.dir.join("Broken_Patch_cia").exists());
    assert!(!fx.dir.join("Broken (Patch).cia").exists());
    assert_eq!(fx.codec.composed().len(), 1);
    assert!(!summary.all_created());
}

#[tokio::test]
async fn test_incompatible_patch_fails_mapping_in_strict_mode() {
    let fx = Fixture::new(FakeCodec::default());
    fx.game("Game.cia", b"g");
    fx.patch("Bad.zip", &[("RomFS.xdelta", b"incompatible")]);
    fx.patch("Good.zip", &[("RomFS.xdelta", b"ok")]);

    let bad = Mapping::new("Bad.zip", "Game.cia", base());
    let good = Mapping::new("Good.zip", "Game.cia", base());
    let summary = fx.run(&set(&[bad.clone(), good.clone()]), false).await;

    match summary.outcome(&bad) {
        Some(Outcome::Failed { stage, reason }) => {
            assert_eq!(*stage, PipelineStage::Apply);
            assert!(reason.contains("checksum mismatch"), "{}", reason);
        }
        other => panic!("Expected apply failure, got {:?}", other),
    }
    assert!(matches!(summary.outcome(&good), Some(Outcome::Created { .. })));
    assert!(!fx.dir.join("Game (Bad).cia").exists());
    assert_eq!(summary.failed().count(), 1);
}

#[tokio::test]
async fn test_incompatible_patch_is_skipped_in_tolerant_mode() {
    let fx = Fixture::new(FakeCodec::default());
    fx.game("Game.cia", b"g");
    fx.patch(
        "Mixed.zip",
        &[
            ("RomFS.xdelta", b"incompatible"),
            ("banner.xdelta", b"!"),
            ("notes.txt", b"readme"),
        ],
    );

    let mapping = Mapping::new("Mixed.zip", "Game.cia", base());
    let summary = fx.run(&set(&[mapping.clone()]), true).await;

    assert!(summary.all_created(), "{:?}", summary.reports);
    // The RomFS stayed unpatched, the banner was patched
    assert_eq!(fs::read(fx.dir.join("Game (Mixed).cia")).unwrap(), b"g");
    assert_eq!(
        fs::read(fx.dir.join("Game_Mixed_cia/CustomExeFS/banner.bin")).unwrap(),
        b"banner!"
    );
    assert_eq!(fx.metrics.entries_tolerated.load(Ordering::Relaxed), 2);
}

#[tokio::test]
async fn test_unknown_entry_fails_in_strict_mode() {
    let fx = Fixture::new(FakeCodec::default());
    fx.game("Game.cia", b"g");
    fx.patch("Patch.zip", &[("notes.txt", b"readme")]);

    let mapping = Mapping::new("Patch.zip", "Game.cia", base());
    let summary = fx.run(&set(&[mapping.clone()]), false).await;

    match summary.outcome(&mapping) {
        Some(Outcome::Failed { stage, reason }) => {
            assert_eq!(*stage, PipelineStage::Apply);
            assert!(reason.contains("notes.txt"));
        }
        other => panic!("Expected apply failure, got {:?}", other),
    }
    assert!(fx.applier.applied.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_state_events_cover_every_mapping() {
    let fx = Fixture::new(FakeCodec::default());
    fx.game("Game.cia", b"g");
    fx.patch("Patch.zip", &[("RomFS.xdelta", b"p")]);
    let mapping = Mapping::new("Patch.zip", "Game.cia", base());

    let state = StateManager::new();
    let mut rx = state.subscribe();
    let pipeline = Pipeline::new(
        Workspace::new(fx.dir.clone()),
        fx.codec.clone(),
        fx.applier.clone(),
        component_table(&PatcherConfig::default()),
        fx.metrics.clone(),
    );
    RunCoordinator::new(Arc::new(pipeline), state, fx.metrics.clone())
        .run(&set(&[mapping]))
        .await;

    let mut labels = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let gamepatcher::StateChange::MappingAdvanced { status, .. } = event {
            labels.push(status.label());
        }
    }
    assert_eq!(labels, vec!["extracted", "applied", "rebuilt"]);
}

#[tokio::test]
async fn test_mappings_sharing_a_workspace_fail_at_stage() {
    let fx = Fixture::new(FakeCodec::default());
    fx.game("Game.cia", b"g");
    fx.patch("A B.zip", &[("RomFS.xdelta", b"1")]);
    fx.patch("A_B.zip", &[("RomFS.xdelta", b"2")]);
    fx.patch("C.zip", &[("RomFS.xdelta", b"c")]);

    let spaced = Mapping::new("A B.zip", "Game.cia", base());
    let underscored = Mapping::new("A_B.zip", "Game.cia", base());
    let other = Mapping::new("C.zip", "Game.cia", base());
    let summary = fx
        .run(&set(&[spaced.clone(), underscored.clone(), other.clone()]), false)
        .await;

    for mapping in [&spaced, &underscored] {
        match summary.outcome(mapping) {
            Some(Outcome::Failed { stage, reason }) => {
                assert_eq!(*stage, PipelineStage::Stage);
                assert!(reason.contains("Game_A_B_cia"), "{}", reason);
            }
            other => panic!("Expected stage failure, got {:?}", other),
        }
    }
    assert!(matches!(summary.outcome(&other), Some(Outcome::Created { .. })));

    // Neither output is built from the other's patch
    assert!(!fx.dir.join("Game (A B).cia").exists());
    assert!(!fx.dir.join("Game (A_B).cia").exists());
    assert!(!fx.dir.join("Game_A_B_cia").exists());
    assert_eq!(fs::read(fx.dir.join("Game (C).cia")).unwrap(), b"gc");
}

#[tokio::test]
async fn test_images_sharing_a_workspace_are_not_extracted() {
    let fx = Fixture::new(FakeCodec::default());
    fx.game("A B.cia", b"1");
    fx.game("A_B.cia", b"2");
    fx.patch("Patch.zip", &[("RomFS.xdelta", b"p")]);

    let spaced = Mapping::new("Patch.zip", "A B.cia", base());
    let underscored = Mapping::new("Patch.zip", "A_B.cia", base());
    let summary = fx.run(&set(&[spaced.clone(), underscored.clone()]), false).await;

    for mapping in [&spaced, &underscored] {
        assert!(matches!(
            summary.outcome(mapping),
            Some(Outcome::Failed {
                stage: PipelineStage::Extract,
                ..
            })
        ));
    }
    assert!(fx.codec.decomposed().is_empty());
    assert!(!fx.dir.join("A_B_cia").exists());
}
