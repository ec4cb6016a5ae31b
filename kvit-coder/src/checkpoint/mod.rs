//! Shadow, content-addressed version store over the working tree.
//!
//! The engine keeps an append-only sequence of per-turn snapshots of the
//! session workspace in a private directory under the system temp dir,
//! named `go-coder-checkpoints-<session_id>`. Snapshots are git commits in
//! a detached git-dir whose work-tree is the workspace; identical file
//! contents share storage, and every turn is reachable through a `turn-N`
//! tag. Files outside the workspace can be tracked through the external
//! mirror and are restored together with the tree.
//!
//! Restores never rewrite history: restoring to turn N produces a *new*
//! turn `M = current + 1` with the message `turn-M (restored to turn-N)`.
//!
//! A failed initialisation disables the engine for the rest of the
//! process: every operation becomes a no-op except
//! [`CheckpointEngine::restore`], which reports
//! [`CoderError::CheckpointsDisabled`].

mod external;
mod git;
mod lock;

pub use git::{DEFAULT_EXCLUDES, DEFAULT_MAX_FILE_SIZE_KB};
pub use lock::{LOCK_FILE_NAME, WorkspaceLock};

use std::path::{Path, PathBuf};

use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use self::external::ExternalFiles;
use self::git::GitStore;
use crate::error::{CoderError, Result};

/// Checkpoint engine tuning knobs.
#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    /// Files larger than this are left out of snapshots.
    pub max_file_size_kb: u64,
    /// Ignore patterns applied inside the shadow store.
    pub excludes: Vec<String>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            max_file_size_kb: DEFAULT_MAX_FILE_SIZE_KB,
            excludes: DEFAULT_EXCLUDES.iter().map(|s| (*s).to_owned()).collect(),
        }
    }
}

/// One entry of [`CheckpointEngine::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnEntry {
    /// Turn number.
    pub turn: u64,
    /// Files the turn's commit touched.
    pub files_changed: usize,
    /// Whether the turn was produced by a restore.
    pub is_restore: bool,
    /// The turn that was restored to, when `is_restore`.
    pub restored_to: Option<u64>,
}

struct Inner {
    current_turn: u64,
    external: ExternalFiles,
}

/// The per-session checkpoint engine.
///
/// All mutating operations serialise on a writer lock; queries share a
/// reader lock.
pub struct CheckpointEngine {
    session_id: String,
    workspace: PathBuf,
    shadow_dir: PathBuf,
    store: GitStore,
    config: CheckpointConfig,
    inner: RwLock<Option<Inner>>,
}

impl std::fmt::Debug for CheckpointEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointEngine")
            .field("session_id", &self.session_id)
            .field("workspace", &self.workspace)
            .field("shadow_dir", &self.shadow_dir)
            .finish_non_exhaustive()
    }
}

impl CheckpointEngine {
    /// Initialize the engine for `workspace`, capturing turn 0 from the
    /// current state of the tree.
    ///
    /// Initialisation failure does not surface as an error: the engine
    /// comes up disabled and logs the cause.
    pub async fn initialize(workspace: impl Into<PathBuf>, config: CheckpointConfig) -> Self {
        let workspace = workspace.into();
        let session_id = Uuid::new_v4().to_string();
        let shadow_dir = std::env::temp_dir().join(format!("go-coder-checkpoints-{session_id}"));
        let store = GitStore::new(shadow_dir.join("repo"), &workspace);

        let mut engine = Self {
            session_id,
            workspace,
            shadow_dir,
            store,
            config,
            inner: RwLock::new(None),
        };

        match engine.try_init().await {
            Ok(inner) => {
                engine.inner = RwLock::new(Some(inner));
            }
            Err(err) => {
                warn!(error = %err, "checkpoint initialisation failed; engine disabled");
            }
        }
        engine
    }

    /// Create a permanently disabled engine (no shadow store).
    #[must_use]
    pub fn disabled(workspace: impl Into<PathBuf>) -> Self {
        let workspace = workspace.into();
        let session_id = Uuid::new_v4().to_string();
        let shadow_dir = std::env::temp_dir().join(format!("go-coder-checkpoints-{session_id}"));
        let store = GitStore::new(shadow_dir.join("repo"), &workspace);
        Self {
            session_id,
            workspace,
            shadow_dir,
            store,
            config: CheckpointConfig::default(),
            inner: RwLock::new(None),
        }
    }

    async fn try_init(&self) -> Result<Inner> {
        tokio::fs::create_dir_all(&self.shadow_dir).await?;
        self.store.init(&self.config.excludes).await?;
        let external = ExternalFiles::create(&self.shadow_dir).await?;

        // Turn 0: the state of the workspace at session start.
        self.store.stage(self.config.max_file_size_kb).await?;
        self.store.commit_tagged("turn-0", "turn-0").await?;
        debug!(shadow = %self.shadow_dir.display(), "checkpoint store initialised");

        Ok(Inner {
            current_turn: 0,
            external,
        })
    }

    /// Session identifier embedded in the shadow directory name.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Whether the engine is operational.
    pub async fn is_enabled(&self) -> bool {
        self.inner.read().await.is_some()
    }

    /// The current turn number.
    pub async fn current_turn(&self) -> u64 {
        self.inner
            .read()
            .await
            .as_ref()
            .map_or(0, |i| i.current_turn)
    }

    /// Open a new turn. Returns the new turn number, or `None` when the
    /// engine is disabled.
    ///
    /// # Errors
    ///
    /// Currently infallible; kept fallible for parity with the other
    /// mutating operations.
    pub async fn start_turn(&self) -> Result<Option<u64>> {
        let mut guard = self.inner.write().await;
        let Some(inner) = guard.as_mut() else {
            return Ok(None);
        };
        inner.current_turn += 1;
        Ok(Some(inner.current_turn))
    }

    /// Commit the current workspace state and external mirror as the
    /// current turn. An unchanged tree commits empty.
    ///
    /// # Errors
    ///
    /// Surfaces store errors verbatim.
    pub async fn end_turn(&self) -> Result<()> {
        let mut guard = self.inner.write().await;
        let Some(inner) = guard.as_mut() else {
            return Ok(());
        };
        let turn = inner.current_turn;

        self.store.stage(self.config.max_file_size_kb).await?;
        inner.external.snapshot_turn(turn, &self.store).await?;
        let tag = format!("turn-{turn}");
        self.store.commit_tagged(&tag, &tag).await?;
        debug!(turn, "turn committed");
        Ok(())
    }

    /// Track a file outside the workspace. Idempotent; returns the
    /// assigned key, or `None` when the engine is disabled.
    ///
    /// # Errors
    ///
    /// Rejects relative paths and surfaces I/O errors.
    pub async fn track_external(&self, path: &Path) -> Result<Option<String>> {
        let mut guard = self.inner.write().await;
        let Some(inner) = guard.as_mut() else {
            return Ok(None);
        };
        let turn = inner.current_turn;
        inner.external.track(path, turn).await.map(Some)
    }

    /// Restore workspace and external files to turn `n`, committing the
    /// result as a new turn. Returns the paths that changed.
    ///
    /// # Errors
    ///
    /// [`CoderError::CheckpointsDisabled`] when disabled, a checkpoint
    /// error for an invalid turn, and store errors verbatim.
    pub async fn restore(&self, n: u64) -> Result<Vec<String>> {
        let mut guard = self.inner.write().await;
        let Some(inner) = guard.as_mut() else {
            return Err(CoderError::CheckpointsDisabled);
        };
        if n > inner.current_turn {
            return Err(CoderError::checkpoint(format!(
                "invalid turn {n}: current turn is {}",
                inner.current_turn
            )));
        }
        let tag = format!("turn-{n}");
        if !self.store.tag_exists(&tag).await {
            return Err(CoderError::checkpoint(format!("no snapshot for turn {n}")));
        }

        // Everything that will change, before touching the tree. Paths
        // with status `A` exist now but not at turn n; the rest exist in
        // the tag's tree and can be checked out from it.
        let statuses = self.store.name_status(&tag).await?;
        let mut changed: Vec<String> = statuses.iter().map(|(_, p)| p.clone()).collect();
        let (added, in_tag): (Vec<_>, Vec<_>) =
            statuses.into_iter().partition(|(status, _)| *status == 'A');

        let to_checkout: Vec<String> = in_tag.into_iter().map(|(_, p)| p).collect();
        self.store.checkout_paths(&tag, &to_checkout).await?;
        for (_, path) in &added {
            let on_disk = self.workspace.join(path);
            if on_disk.exists() {
                tokio::fs::remove_file(&on_disk).await?;
            }
        }

        for path in inner.external.restore_at(n, &self.store).await? {
            changed.push(path.to_string_lossy().into_owned());
        }

        // The restore itself is a new turn.
        inner.current_turn += 1;
        let new_turn = inner.current_turn;
        self.store.stage(self.config.max_file_size_kb).await?;
        inner.external.snapshot_turn(new_turn, &self.store).await?;
        let new_tag = format!("turn-{new_turn}");
        self.store
            .commit_tagged(&new_tag, &format!("turn-{new_turn} (restored to turn-{n})"))
            .await?;

        debug!(from = new_turn, to = n, "workspace restored");
        Ok(changed)
    }

    /// Unified diff between the current workspace and turn `n`, optionally
    /// limited to one path.
    ///
    /// # Errors
    ///
    /// A checkpoint error for an invalid turn; store errors verbatim.
    /// Returns an empty diff when the engine is disabled.
    pub async fn diff(&self, n: u64, path: Option<&Path>) -> Result<String> {
        let guard = self.inner.read().await;
        if guard.is_none() {
            return Ok(String::new());
        }
        let tag = format!("turn-{n}");
        if !self.store.tag_exists(&tag).await {
            return Err(CoderError::checkpoint(format!("no snapshot for turn {n}")));
        }
        let rel = path.map(|p| self.relativize(p)).transpose()?;
        self.store.diff(&tag, rel.as_deref()).await
    }

    /// Enumerate all turns in order.
    ///
    /// # Errors
    ///
    /// Surfaces store errors verbatim. Empty when disabled.
    pub async fn list(&self) -> Result<Vec<TurnEntry>> {
        let guard = self.inner.read().await;
        let Some(inner) = guard.as_ref() else {
            return Ok(Vec::new());
        };

        let mut entries = Vec::new();
        for turn in 0..=inner.current_turn {
            let tag = format!("turn-{turn}");
            if !self.store.tag_exists(&tag).await {
                continue;
            }
            let subject = self.store.subject(&tag).await?;
            let files_changed = self.store.commit_files(&tag).await?.len();
            let restored_to = parse_restored_to(&subject);
            entries.push(TurnEntry {
                turn,
                files_changed,
                is_restore: restored_to.is_some(),
                restored_to,
            });
        }
        Ok(entries)
    }

    /// Restore a single workspace file to its state at turn 0.
    ///
    /// # Errors
    ///
    /// [`CoderError::FileNotAtSessionStart`], with a ranked candidate
    /// list, when the path was not captured at turn 0.
    pub async fn restore_file(&self, path: &Path) -> Result<()> {
        let guard = self.inner.write().await;
        if guard.is_none() {
            return Ok(());
        }
        let rel = self.relativize(path)?;

        match self.store.show_file("turn-0", &rel).await {
            Ok(content) => {
                let target = self.workspace.join(&rel);
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&target, content).await?;
                Ok(())
            }
            Err(_) => {
                let known = self.store.ls_tree("turn-0").await.unwrap_or_default();
                Err(CoderError::FileNotAtSessionStart {
                    path: rel.clone(),
                    candidates: rank_candidates(&rel, &known),
                })
            }
        }
    }

    /// Absolute paths of workspace files that differ from turn 0.
    ///
    /// # Errors
    ///
    /// Surfaces store errors verbatim. Empty when disabled.
    pub async fn get_modified_files(&self) -> Result<Vec<PathBuf>> {
        let guard = self.inner.read().await;
        if guard.is_none() {
            return Ok(Vec::new());
        }
        Ok(self
            .store
            .changed_files("turn-0")
            .await?
            .into_iter()
            .map(|p| self.workspace.join(p))
            .collect())
    }

    /// Remove the shadow store and disable the engine.
    ///
    /// # Errors
    ///
    /// Surfaces I/O errors from the removal.
    pub async fn cleanup(&self) -> Result<()> {
        let mut guard = self.inner.write().await;
        *guard = None;
        if self.shadow_dir.exists() {
            tokio::fs::remove_dir_all(&self.shadow_dir).await?;
        }
        Ok(())
    }

    fn relativize(&self, path: &Path) -> Result<String> {
        let rel = if path.is_absolute() {
            path.strip_prefix(&self.workspace).map_err(|_| {
                CoderError::checkpoint(format!(
                    "path outside workspace: {}",
                    path.display()
                ))
            })?
        } else {
            path
        };
        Ok(rel.to_string_lossy().into_owned())
    }
}

impl Drop for CheckpointEngine {
    /// Best-effort removal of the shadow store at shutdown. Explicit
    /// [`cleanup`](Self::cleanup) already removed it for well-behaved
    /// hosts; this catches early exits.
    fn drop(&mut self) {
        if self.shadow_dir.exists() {
            let _ = std::fs::remove_dir_all(&self.shadow_dir);
        }
    }
}

/// Parse `turn-M (restored to turn-N)` commit subjects.
fn parse_restored_to(subject: &str) -> Option<u64> {
    let marker = "(restored to turn-";
    let start = subject.find(marker)? + marker.len();
    let rest = &subject[start..];
    let end = rest.find(')')?;
    rest[..end].parse().ok()
}

/// Rank files from turn 0 by similarity to the requested path: exact
/// basename match first, then path-suffix matches, then substring matches.
/// Case insensitive throughout; at most five results.
fn rank_candidates(query: &str, known: &[String]) -> Vec<String> {
    let query_lower = query.to_lowercase();
    let query_base = basename(&query_lower);
    let query_stem = query_base.split('.').next().unwrap_or(query_base);

    let mut scored: Vec<(u8, &String)> = known
        .iter()
        .filter_map(|path| {
            let lower = path.to_lowercase();
            let base = basename(&lower);
            let score = if base == query_base {
                3
            } else if lower.ends_with(&query_lower) || query_lower.ends_with(&lower) {
                2
            } else if !query_stem.is_empty() && base.contains(query_stem) {
                1
            } else {
                return None;
            };
            Some((score, path))
        })
        .collect();

    scored.sort_by(|(sa, pa), (sb, pb)| sb.cmp(sa).then_with(|| pa.cmp(pb)));
    scored.into_iter().take(5).map(|(_, p)| p.clone()).collect()
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
