//! Mapping resolution: which patch goes onto which game, and with which version.
//!
//! Inference is a pure function of a [`FileListing`] snapshot (names and sizes), so
//! the same directory always produces the same mapping set.

use crate::models::mapping::{PATCH_EXTENSION, split_extension};
use crate::models::version::{BASE_VERSION, UPDATE_BUMP};
use crate::models::{ContainerKind, FileEntry, FileListing, Mapping, VersionCode, VersionError};
use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use regex::Regex;
use std::collections::{BTreeSet, HashSet};
use std::sync::LazyLock;
use thiserror::Error;

/// Token a file name carries when it was released for a specific title version
static VERSION_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"v\d\.\d(\.\d)?").expect("Invalid version token regex"));

const BASE_TOKEN: &str = "v1.0";

/// The run cannot start because there is nothing (or nothing unambiguous) to do
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("No patches were found. Place the patches as .zip files in the working directory.")]
    NoPatches,

    #[error("No games were found. Place the games as .cia or .3ds files in the working directory.")]
    NoGames,

    #[error("The mappings could not be assigned automatically. Use --mapping to assign them.")]
    NoAutomaticMapping,
}

/// An explicit `--mapping PATCH GAME VERSION` triple was rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MappingInputError {
    #[error("No such file: '{0}'")]
    FileNotFound(Utf8PathBuf),

    #[error("Not a patch archive: '{0}'")]
    NotAPatch(String),

    #[error("Not a supported game container: '{0}'")]
    NotAGame(String),

    #[error(transparent)]
    Version(#[from] VersionError),
}

/// Validate an explicit mapping against the files in `dir`.
///
/// `patch` and `game` name files directly inside `dir`. `version` is either
/// `vMAJOR.MINOR[.PATCH]` or an already packed integer.
pub fn parse_explicit_mapping(
    dir: &Utf8Path,
    patch: &str,
    game: &str,
    version: &str,
) -> Result<Mapping, MappingInputError> {
    let patch = existing_file_name(dir, patch)?;
    if split_extension(&patch).1 != format!(".{}", PATCH_EXTENSION) {
        return Err(MappingInputError::NotAPatch(patch));
    }

    let game = existing_file_name(dir, game)?;
    if ContainerKind::from_path(&game).is_none() {
        return Err(MappingInputError::NotAGame(game));
    }

    let version = VersionCode::parse(version)?;
    Ok(Mapping::new(patch, game, version))
}

fn existing_file_name(dir: &Utf8Path, name: &str) -> Result<String, MappingInputError> {
    let file_name = Utf8Path::new(name)
        .file_name()
        .ok_or_else(|| MappingInputError::FileNotFound(Utf8PathBuf::from(name)))?;
    let path = dir.join(file_name);
    if !path.is_file() {
        return Err(MappingInputError::FileNotFound(path));
    }
    Ok(file_name.to_string())
}

/// Resolve the mapping set for a run.
///
/// Explicit mappings are used as given (duplicates collapse). Without them the
/// mappings are inferred from `listing`.
///
/// # Errors
/// [`ResolveError`] when there are no inputs or inference is ambiguous.
pub fn resolve(
    listing: &FileListing,
    explicit: Option<Vec<Mapping>>,
) -> Result<BTreeSet<Mapping>, ResolveError> {
    if let Some(mappings) = explicit {
        if !mappings.is_empty() {
            return Ok(mappings.into_iter().collect());
        }
    }

    if listing.patches().next().is_none() {
        return Err(ResolveError::NoPatches);
    }
    if ContainerKind::ALL
        .iter()
        .all(|&kind| listing.games(kind).next().is_none())
    {
        return Err(ResolveError::NoGames);
    }

    let mappings = infer_mappings(listing);
    if mappings.is_empty() {
        Err(ResolveError::NoAutomaticMapping)
    } else {
        Ok(mappings)
    }
}

/// Infer mappings for every container kind and return their union
pub fn infer_mappings(listing: &FileListing) -> BTreeSet<Mapping> {
    ContainerKind::ALL
        .into_iter()
        .flat_map(|kind| infer_kind(listing, kind))
        .collect()
}

/// Version token embedded in a file name, if any
pub fn version_token(name: &str) -> Option<&str> {
    VERSION_TOKEN.find(name).map(|m| m.as_str())
}

type Tokens<'a> = IndexMap<&'a str, Option<&'a str>>;

fn infer_kind(listing: &FileListing, kind: ContainerKind) -> Vec<Mapping> {
    let patches: Vec<&FileEntry> = listing.patches().collect();
    let markers: Vec<String> = patches
        .iter()
        .map(|p| format!("({})", split_extension(&p.name).0))
        .collect();

    // Outputs of an earlier run carry the patch name in parentheses
    let games: Vec<&FileEntry> = listing
        .games(kind)
        .filter(|g| !markers.iter().any(|m| g.name.contains(m.as_str())))
        .collect();
    if patches.is_empty() || games.is_empty() {
        return Vec::new();
    }

    let detected: Tokens = patches
        .iter()
        .map(|p| (p.name.as_str(), version_token(&p.name)))
        .collect();
    let patch_tokens = guess_first_version(detected.clone());
    let mut game_tokens = guess_first_version(
        games
            .iter()
            .map(|g| (g.name.as_str(), version_token(&g.name)))
            .collect(),
    );

    let update_tokens: BTreeSet<&str> = patch_tokens
        .values()
        .flatten()
        .copied()
        .filter(|t| *t != BASE_TOKEN)
        .collect();

    if game_tokens.values().any(Option::is_none) && games.len() == 2 && update_tokens.len() <= 1 {
        let mut by_size = games.clone();
        by_size.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.name.cmp(&b.name)));

        game_tokens = Tokens::new();
        game_tokens.insert(by_size[0].name.as_str(), Some(BASE_TOKEN));
        match update_tokens.first() {
            Some(update) => {
                game_tokens.insert(by_size[1].name.as_str(), Some(*update));
            }
            None => tracing::debug!(
                "Ignoring {} in favour of the larger {}",
                by_size[1].name,
                by_size[0].name
            ),
        }
    }

    let distinct: HashSet<Option<&str>> = game_tokens.values().copied().collect();
    let any_match = patch_tokens
        .values()
        .any(|t| game_tokens.values().any(|g| g == t));
    if distinct.len() != game_tokens.len() || !any_match {
        tracing::debug!("No automatic {} mapping", kind);
        return Vec::new();
    }

    let mut mappings = Vec::new();
    for (patch, token) in &patch_tokens {
        let Some((game, _)) = game_tokens.iter().find(|(_, g)| *g == token) else {
            continue;
        };
        let version = mapping_version(detected.get(patch).copied().flatten());
        mappings.push(Mapping::new(*patch, *game, version));
    }
    mappings
}

/// If exactly one file in the set has no token, it is taken to be the base release
fn guess_first_version(mut tokens: Tokens<'_>) -> Tokens<'_> {
    if tokens.values().filter(|t| t.is_none()).count() == 1 {
        for token in tokens.values_mut() {
            token.get_or_insert(BASE_TOKEN);
        }
    }
    tokens
}

/// Version stamped on a mapping, from the token originally found in the patch name.
///
/// Untagged patches get 0. Update tokens are bumped by one minor version so the
/// rebuilt title is not reported as outdated.
fn mapping_version(detected: Option<&str>) -> VersionCode {
    let Some(token) = detected else {
        return VersionCode::from_raw(0);
    };

    let version = VersionCode::parse(token).unwrap_or(BASE_VERSION);
    if token == BASE_TOKEN {
        version
    } else {
        version.bumped(UPDATE_BUMP)
    }
}
