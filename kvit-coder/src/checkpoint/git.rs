//! Subprocess driver for the shadow version store.
//!
//! The store is a git repository whose git-dir lives inside the shadow
//! directory and whose work-tree is the session workspace. The workspace
//! itself is never touched beyond checkouts: no `.git` appears in it, and
//! exclusion patterns live in the store's own `info/exclude`.

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::debug;

use crate::error::{CoderError, Result};

/// Staging skips files larger than this many kilobytes.
pub const DEFAULT_MAX_FILE_SIZE_KB: u64 = 1024;

/// Default exclusion patterns: dependency and cache directories that would
/// bloat the store without being restorable state.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    ".git/",
    ".kvit-coder.lock",
    "node_modules/",
    "target/",
    "dist/",
    "build/",
    ".venv/",
    "venv/",
    "__pycache__/",
    ".cache/",
    ".DS_Store",
];

/// How many paths to pass to one `git add` invocation.
const ADD_CHUNK: usize = 128;

/// A git repository with a detached git-dir shadowing a work-tree.
#[derive(Debug, Clone)]
pub(crate) struct GitStore {
    git_dir: PathBuf,
    work_tree: PathBuf,
}

impl GitStore {
    pub(crate) fn new(git_dir: impl Into<PathBuf>, work_tree: impl Into<PathBuf>) -> Self {
        Self {
            git_dir: git_dir.into(),
            work_tree: work_tree.into(),
        }
    }

    /// Initialize the repository and write the exclusion file.
    pub(crate) async fn init(&self, excludes: &[String]) -> Result<()> {
        tokio::fs::create_dir_all(&self.git_dir).await?;
        self.run(&["init", "--quiet"]).await?;
        self.run(&["config", "user.name", "kvit-coder"]).await?;
        self.run(&["config", "user.email", "coder@localhost"])
            .await?;
        self.run(&["config", "commit.gpgsign", "false"]).await?;

        let info_dir = self.git_dir.join("info");
        tokio::fs::create_dir_all(&info_dir).await?;
        tokio::fs::write(info_dir.join("exclude"), excludes.join("\n") + "\n").await?;
        Ok(())
    }

    /// Stage every changed workspace file within the size cap. Deletions
    /// are always staged; oversized files are skipped.
    pub(crate) async fn stage(&self, max_file_size_kb: u64) -> Result<()> {
        let status = self
            .run(&["-c", "status.renames=false", "status", "--porcelain", "-z"])
            .await?;

        let mut to_add: Vec<String> = Vec::new();
        for entry in status.split('\0').filter(|e| e.len() > 3) {
            let path = entry[3..].to_owned();
            let on_disk = self.work_tree.join(&path);
            match tokio::fs::metadata(&on_disk).await {
                Err(_) => to_add.push(path), // deletion
                Ok(meta) if meta.len() <= max_file_size_kb * 1024 => to_add.push(path),
                Ok(meta) => {
                    debug!(path, size = meta.len(), "skipping oversized file");
                }
            }
        }

        for chunk in to_add.chunks(ADD_CHUNK) {
            let mut args = vec!["add", "--"];
            args.extend(chunk.iter().map(String::as_str));
            self.run(&args).await?;
        }
        Ok(())
    }

    /// Commit the index, allowing empty commits, and tag the result.
    pub(crate) async fn commit_tagged(&self, tag: &str, message: &str) -> Result<()> {
        self.run(&["commit", "--allow-empty", "--quiet", "-m", message])
            .await?;
        self.run(&["tag", "-f", tag]).await?;
        Ok(())
    }

    /// Returns `true` when `tag` exists.
    pub(crate) async fn tag_exists(&self, tag: &str) -> bool {
        self.run(&[
            "rev-parse",
            "--verify",
            "--quiet",
            &format!("refs/tags/{tag}"),
        ])
        .await
        .is_ok()
    }

    /// Unified diff between the work-tree and `tag`, optionally limited to
    /// one path.
    pub(crate) async fn diff(&self, tag: &str, path: Option<&str>) -> Result<String> {
        let mut args = vec!["--no-pager", "diff", "--no-color", tag, "--"];
        if let Some(path) = path {
            args.push(path);
        }
        self.run(&args).await
    }

    /// Paths differing between the work-tree and `tag`.
    pub(crate) async fn changed_files(&self, tag: &str) -> Result<Vec<String>> {
        let out = self.run(&["diff", "--name-only", tag]).await?;
        Ok(out.lines().map(str::to_owned).collect())
    }

    /// `(status, path)` pairs differing between the work-tree and `tag`.
    pub(crate) async fn name_status(&self, tag: &str) -> Result<Vec<(char, String)>> {
        let out = self.run(&["diff", "--name-status", tag]).await?;
        Ok(out
            .lines()
            .filter_map(|line| {
                let mut parts = line.splitn(2, '\t');
                let status = parts.next()?.chars().next()?;
                let path = parts.next()?.to_owned();
                Some((status, path))
            })
            .collect())
    }

    /// Check out the given `tag`-recorded paths into the work-tree and
    /// index. Paths must exist in the tag's tree.
    pub(crate) async fn checkout_paths(&self, tag: &str, paths: &[String]) -> Result<()> {
        for chunk in paths.chunks(ADD_CHUNK) {
            let mut args = vec!["checkout", "--quiet", tag, "--"];
            args.extend(chunk.iter().map(String::as_str));
            self.run(&args).await?;
        }
        Ok(())
    }

    /// File content at `tag:path`.
    pub(crate) async fn show_file(&self, tag: &str, path: &str) -> Result<Vec<u8>> {
        self.run_bytes(&["show", &format!("{tag}:{path}")]).await
    }

    /// All paths recorded in `tag`.
    pub(crate) async fn ls_tree(&self, tag: &str) -> Result<Vec<String>> {
        let out = self.run(&["ls-tree", "-r", "--name-only", tag]).await?;
        Ok(out.lines().map(str::to_owned).collect())
    }

    /// The commit subject at `tag`.
    pub(crate) async fn subject(&self, tag: &str) -> Result<String> {
        Ok(self
            .run(&["log", "-1", "--format=%s", tag])
            .await?
            .trim()
            .to_owned())
    }

    /// Paths touched by the commit at `tag` relative to its parent (the
    /// full tree for the root commit).
    pub(crate) async fn commit_files(&self, tag: &str) -> Result<Vec<String>> {
        let out = self
            .run(&["show", "--name-only", "--format=", tag])
            .await?;
        Ok(out
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_owned)
            .collect())
    }

    /// Write `path`'s content into the object store, returning the blob id.
    pub(crate) async fn hash_object(&self, path: &Path) -> Result<String> {
        let path = path.to_string_lossy().into_owned();
        Ok(self
            .run(&["hash-object", "-w", "--", &path])
            .await?
            .trim()
            .to_owned())
    }

    /// Content of the blob `id`.
    pub(crate) async fn cat_blob(&self, id: &str) -> Result<Vec<u8>> {
        self.run_bytes(&["cat-file", "blob", id]).await
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let bytes = self.run_bytes(args).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    async fn run_bytes(&self, args: &[&str]) -> Result<Vec<u8>> {
        let output = Command::new("git")
            .args(args)
            .env("GIT_DIR", &self.git_dir)
            .env("GIT_WORK_TREE", &self.work_tree)
            .env_remove("GIT_INDEX_FILE")
            .current_dir(&self.work_tree)
            .output()
            .await
            .map_err(|e| CoderError::checkpoint(format!("failed to spawn git: {e}")))?;

        if output.status.success() {
            Ok(output.stdout)
        } else {
            Err(CoderError::checkpoint(format!(
                "git {} failed: {}",
                args.first().copied().unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}
