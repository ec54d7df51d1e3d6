//! Integration tests for workspace naming and cleanup
//!
//! Cleanup must remove exactly the workspaces a run could have created and must
//! never touch the inputs or the rebuilt containers.

use camino::Utf8PathBuf;
use gamepatcher::services::Workspace;
use gamepatcher::{FileListing, Mapping, VersionCode};
use std::fs;
use tempfile::TempDir;

fn setup() -> (TempDir, Utf8PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let dir = Utf8PathBuf::try_from(temp_dir.path().to_path_buf()).unwrap();
    for file in ["A.zip", "B.zip", "Game.cia", "Cart.3ds", "Game (A).cia"] {
        fs::write(dir.join(file), b"data").unwrap();
    }
    for workspace in ["Game_cia", "Cart_3ds", "Game_A_cia", "Game_B_cia", "Cart_A_3ds", "Unrelated"] {
        fs::create_dir_all(dir.join(workspace).join("ExtractedExeFS")).unwrap();
    }
    (temp_dir, dir)
}

fn v() -> VersionCode {
    VersionCode::from_raw(1024)
}

fn remaining(dir: &Utf8PathBuf) -> Vec<String> {
    let mut names: Vec<String> = dir
        .read_dir_utf8()
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string())
        .collect();
    names.sort();
    names
}

#[test]
fn test_workspace_names() {
    let workspace = Workspace::new("/work");

    assert_eq!(workspace.image_dir("My Game v1.0.cia"), "/work/My_Game_v1_0_cia");
    assert_eq!(
        workspace.mapping_dir("My Game.3ds", "Fan Patch.zip"),
        "/work/My_Game_Fan_Patch_3ds"
    );
    assert_eq!(
        workspace.output_path("My Game.3ds", "Fan Patch.zip"),
        "/work/My Game (Fan Patch).3ds"
    );
}

#[test]
fn test_cleanup_removes_exactly_the_implicated_workspaces() {
    let (_temp_dir, dir) = setup();
    let workspace = Workspace::new(dir.clone());
    let mappings = [Mapping::new("A.zip", "Game.cia", v())];

    let mut removed = workspace.cleanup(&mappings).unwrap();
    removed.sort();

    assert_eq!(removed, vec![dir.join("Game_A_cia"), dir.join("Game_cia")]);
    assert_eq!(
        remaining(&dir),
        vec![
            "A.zip",
            "B.zip",
            "Cart.3ds",
            "Cart_3ds",
            "Cart_A_3ds",
            "Game (A).cia",
            "Game.cia",
            "Game_B_cia",
            "Unrelated",
        ]
    );
}

#[test]
fn test_cleanup_is_idempotent() {
    let (_temp_dir, dir) = setup();
    let workspace = Workspace::new(dir.clone());
    let mappings = [Mapping::new("B.zip", "Cart.3ds", v())];

    assert_eq!(workspace.cleanup(&mappings).unwrap(), vec![dir.join("Cart_3ds")]);
    assert!(workspace.cleanup(&mappings).unwrap().is_empty());
}

#[test]
fn test_cleanup_all_keeps_inputs_and_outputs() {
    let (_temp_dir, dir) = setup();
    let workspace = Workspace::new(dir.clone());
    let listing = FileListing::scan(&dir).unwrap();

    let removed = workspace.cleanup_all(&listing).unwrap();

    assert_eq!(removed.len(), 5);
    assert_eq!(
        remaining(&dir),
        vec!["A.zip", "B.zip", "Cart.3ds", "Game (A).cia", "Game.cia", "Unrelated"]
    );
}

#[test]
fn test_clone_dir_copies_nested_files() {
    let (_temp_dir, dir) = setup();
    let template = dir.join("Game_cia");
    fs::write(template.join("ExtractedExeFS/code.bin"), b"code").unwrap();
    fs::write(template.join("DecryptedRomFS.bin"), b"romfs").unwrap();

    let copy = dir.join("Copy");
    Workspace::clone_dir(&template, &copy).unwrap();

    assert_eq!(fs::read(copy.join("ExtractedExeFS/code.bin")).unwrap(), b"code");
    assert_eq!(fs::read(copy.join("DecryptedRomFS.bin")).unwrap(), b"romfs");
    assert!(Workspace::clone_dir(&dir.join("Missing"), &dir.join("Other")).is_err());
}
