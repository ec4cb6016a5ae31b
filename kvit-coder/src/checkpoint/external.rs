//! Mirror of files outside the workspace.
//!
//! Tools occasionally touch files beyond the workspace root (a global
//! config, a crontab). Those cannot ride along in the work-tree snapshot,
//! so each tracked path gets a stable key, a live mirror copy under
//! `external-files/<key>`, and a content-addressed blob per turn so that
//! `restore` can put the file back exactly as it was.
//!
//! The mapping file (`external-files.json`) persists key assignments and
//! per-turn blob ids; keys are assigned once per original path and stay
//! stable across restores.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::git::GitStore;
use crate::error::{CoderError, Result};

/// Maximum length of the sanitised path suffix in a key.
const MAX_KEY_SUFFIX: usize = 50;

/// Mapping entry for one tracked external file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalFileEntry {
    /// Absolute path the file lives at.
    pub original_path: PathBuf,
    /// Turn during which the file was first tracked.
    pub first_tracked_turn: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Mapping {
    /// key → entry.
    files: BTreeMap<String, ExternalFileEntry>,
    /// turn → key → blob id.
    turns: BTreeMap<u64, BTreeMap<String, String>>,
}

/// The external-file mirror of one shadow store.
#[derive(Debug)]
pub(crate) struct ExternalFiles {
    dir: PathBuf,
    mapping_path: PathBuf,
    mapping: Mapping,
}

impl ExternalFiles {
    /// Create the mirror directory under `shadow_dir`.
    pub(crate) async fn create(shadow_dir: &Path) -> Result<Self> {
        let dir = shadow_dir.join("external-files");
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            mapping_path: shadow_dir.join("external-files.json"),
            mapping: Mapping::default(),
        })
    }

    /// Track `path`, assigning a key on first sight. Idempotent.
    pub(crate) async fn track(&mut self, path: &Path, current_turn: u64) -> Result<String> {
        if !path.is_absolute() {
            return Err(CoderError::checkpoint(format!(
                "external path must be absolute: {}",
                path.display()
            )));
        }
        if let Some(key) = self.key_for(path) {
            return Ok(key);
        }

        let key = format!("{:03}-{}", self.mapping.files.len(), sanitize(path));
        self.mapping.files.insert(
            key.clone(),
            ExternalFileEntry {
                original_path: path.to_path_buf(),
                first_tracked_turn: current_turn,
            },
        );
        self.save().await?;
        debug!(key, path = %path.display(), "tracking external file");
        Ok(key)
    }

    /// The key assigned to `path`, if tracked.
    pub(crate) fn key_for(&self, path: &Path) -> Option<String> {
        self.mapping
            .files
            .iter()
            .find(|(_, e)| e.original_path == path)
            .map(|(k, _)| k.clone())
    }

    /// Number of tracked files.
    pub(crate) fn len(&self) -> usize {
        self.mapping.files.len()
    }

    /// Mirror every tracked file and record its blob for `turn`.
    ///
    /// A tracked file that no longer exists at its original path is
    /// recorded as absent for the turn (no blob entry).
    pub(crate) async fn snapshot_turn(&mut self, turn: u64, store: &GitStore) -> Result<()> {
        let mut blobs = BTreeMap::new();
        for (key, entry) in &self.mapping.files {
            if tokio::fs::metadata(&entry.original_path).await.is_err() {
                continue;
            }
            let mirror = self.dir.join(key);
            tokio::fs::copy(&entry.original_path, &mirror).await?;
            let blob = store.hash_object(&mirror).await?;
            blobs.insert(key.clone(), blob);
        }
        self.mapping.turns.insert(turn, blobs);
        self.save().await
    }

    /// Restore every file recorded at `turn` (or the closest earlier turn)
    /// to its original path. Returns the restored paths.
    pub(crate) async fn restore_at(&self, turn: u64, store: &GitStore) -> Result<Vec<PathBuf>> {
        let mut restored = Vec::new();
        for (key, entry) in &self.mapping.files {
            if entry.first_tracked_turn > turn {
                continue;
            }
            let Some(blob) = self.blob_at(key, turn) else {
                continue;
            };
            let content = store.cat_blob(&blob).await?;
            if let Some(parent) = entry.original_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&entry.original_path, content).await?;
            restored.push(entry.original_path.clone());
        }
        Ok(restored)
    }

    /// The blob recorded for `key` at the latest turn `<= turn`.
    fn blob_at(&self, key: &str, turn: u64) -> Option<String> {
        self.mapping
            .turns
            .range(..=turn)
            .rev()
            .find_map(|(_, blobs)| blobs.get(key).cloned())
    }

    async fn save(&self) -> Result<()> {
        let json = serde_json::to_vec_pretty(&self.mapping)?;
        tokio::fs::write(&self.mapping_path, json).await?;
        Ok(())
    }
}

/// Sanitise a path into a key suffix: non-alphanumeric runs collapse to a
/// single `-`, keeping at most the last [`MAX_KEY_SUFFIX`] characters.
fn sanitize(path: &Path) -> String {
    let mut out = String::new();
    let mut last_dash = true;
    for c in path.to_string_lossy().chars() {
        if c.is_ascii_alphanumeric() || c == '.' {
            out.push(c);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    let trimmed = out.trim_matches('-');
    let mut start = trimmed.len().saturating_sub(MAX_KEY_SUFFIX);
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    trimmed[start..].to_owned()
}
