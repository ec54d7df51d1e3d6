use crate::models::{FileListing, Mapping, escape_name, output_name};
use camino::{Utf8Path, Utf8PathBuf};
use std::collections::BTreeSet;
use std::fs;
use std::io;
use walkdir::WalkDir;

/// Names and manages the cached working directories inside a base directory.
///
/// Image workspaces are keyed by the escaped image file name, mapping workspaces by
/// the escaped output name. A directory with the expected name counts as a
/// finished stage, whatever it contains.
#[derive(Debug, Clone)]
pub struct Workspace {
    base: Utf8PathBuf,
}

impl Workspace {
    pub fn new(base: impl Into<Utf8PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Path of a file in the base directory
    pub fn file(&self, name: &str) -> Utf8PathBuf {
        self.base.join(name)
    }

    /// Workspace holding the extracted template of `game`
    pub fn image_dir(&self, game: &str) -> Utf8PathBuf {
        self.base.join(escape_name(game))
    }

    /// Workspace holding the patched copy for `(game, patch)`
    pub fn mapping_dir(&self, game: &str, patch: &str) -> Utf8PathBuf {
        self.base.join(escape_name(&output_name(game, patch)))
    }

    /// Rebuilt container for `(game, patch)`
    pub fn output_path(&self, game: &str, patch: &str) -> Utf8PathBuf {
        self.base.join(output_name(game, patch))
    }

    pub fn exists(path: &Utf8Path) -> bool {
        path.is_dir()
    }

    /// Recursively copy `src` to `dst`.
    ///
    /// # Errors
    /// Fails with `NotFound` if `src` is not a directory.
    pub fn clone_dir(src: &Utf8Path, dst: &Utf8Path) -> io::Result<()> {
        if !src.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("Workspace not found: {}", src),
            ));
        }

        for entry in WalkDir::new(src).follow_links(false) {
            let entry = entry.map_err(io::Error::other)?;
            let relative = entry
                .path()
                .strip_prefix(src)
                .map_err(io::Error::other)?;
            let target = dst.as_std_path().join(relative);

            if entry.file_type().is_dir() {
                fs::create_dir_all(&target)?;
            } else {
                fs::copy(entry.path(), &target)?;
            }
        }

        Ok(())
    }

    /// Recursively remove `path`; a missing directory is not an error.
    pub fn delete(path: &Utf8Path) -> io::Result<()> {
        match fs::remove_dir_all(path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    /// Every workspace directory a set of mappings may have created
    pub fn implicated_dirs<'a>(&self, mappings: impl IntoIterator<Item = &'a Mapping>) -> BTreeSet<Utf8PathBuf> {
        let mut dirs = BTreeSet::new();
        for mapping in mappings {
            dirs.insert(self.image_dir(&mapping.game));
            dirs.insert(self.mapping_dir(&mapping.game, &mapping.patch));
        }
        dirs
    }

    /// Remove the image and mapping workspaces of `mappings` and nothing else.
    ///
    /// Returns the directories that existed and were removed.
    pub fn cleanup<'a>(&self, mappings: impl IntoIterator<Item = &'a Mapping>) -> io::Result<Vec<Utf8PathBuf>> {
        self.remove_all(self.implicated_dirs(mappings))
    }

    /// Remove every workspace that any patch/container pair in `listing` could have created.
    ///
    /// Rebuilt containers are regular files and are never touched.
    pub fn cleanup_all(&self, listing: &FileListing) -> io::Result<Vec<Utf8PathBuf>> {
        let games: Vec<&str> = listing
            .entries()
            .iter()
            .filter(|e| e.kind().is_some())
            .map(|e| e.name.as_str())
            .collect();

        let mut dirs = BTreeSet::new();
        for game in &games {
            dirs.insert(self.image_dir(game));
            for patch in listing.patches() {
                dirs.insert(self.mapping_dir(game, &patch.name));
            }
        }
        self.remove_all(dirs)
    }

    fn remove_all(&self, dirs: BTreeSet<Utf8PathBuf>) -> io::Result<Vec<Utf8PathBuf>> {
        let mut removed = Vec::new();
        for dir in dirs {
            if Self::exists(&dir) {
                Self::delete(&dir)?;
                tracing::info!("Removed {}", dir);
                removed.push(dir);
            }
        }
        Ok(removed)
    }
}
