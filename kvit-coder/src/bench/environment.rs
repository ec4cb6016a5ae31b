//! Per-run workspace isolation.
//!
//! Every benchmark run gets a freshly rebuilt `workspace/` directory under
//! the benchmarks root, next to `setup/`, `expected/`, and `results/`.
//! Parallel harness processes must use distinct workspace suffixes.

use std::path::{Path, PathBuf};

use base64::Engine as _;

use crate::error::{CoderError, Result};

use super::definition::BenchmarkDefinition;

/// Directory layout for benchmark runs.
#[derive(Debug, Clone)]
pub struct Environment {
    root: PathBuf,
    workspace: PathBuf,
}

impl Environment {
    /// Create the directory tree under `root`.
    ///
    /// # Errors
    ///
    /// Surfaces I/O errors from directory creation.
    pub async fn create(root: impl Into<PathBuf>) -> Result<Self> {
        Self::with_workspace_suffix(root, None).await
    }

    /// Create the tree with a suffixed workspace (`workspace-<suffix>`),
    /// for parallel harness processes sharing one root.
    ///
    /// # Errors
    ///
    /// Surfaces I/O errors from directory creation.
    pub async fn with_workspace_suffix(
        root: impl Into<PathBuf>,
        suffix: Option<&str>,
    ) -> Result<Self> {
        let root = root.into();
        let workspace_name = match suffix {
            Some(suffix) => format!("workspace-{suffix}"),
            None => "workspace".to_owned(),
        };
        let workspace = root.join(workspace_name);

        for dir in ["setup", "expected", "results"] {
            tokio::fs::create_dir_all(root.join(dir)).await?;
        }
        tokio::fs::create_dir_all(&workspace).await?;
        Ok(Self { root, workspace })
    }

    /// The benchmarks root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The per-run workspace directory.
    #[must_use]
    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// The results directory.
    #[must_use]
    pub fn results_dir(&self) -> PathBuf {
        self.root.join("results")
    }

    /// Remove and recreate the workspace, then materialise the
    /// benchmark's setup files into it.
    ///
    /// # Errors
    ///
    /// Rejects setup paths that escape the workspace; surfaces I/O and
    /// base64 errors.
    pub async fn rebuild_workspace(&self, benchmark: &BenchmarkDefinition) -> Result<()> {
        if self.workspace.exists() {
            tokio::fs::remove_dir_all(&self.workspace).await?;
        }
        tokio::fs::create_dir_all(&self.workspace).await?;

        for file in &benchmark.setup {
            let target = self.resolve(&file.path)?;
            if file.directory {
                tokio::fs::create_dir_all(&target).await?;
                continue;
            }
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            if let Some(encoded) = &file.binary {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(encoded)
                    .map_err(|e| {
                        CoderError::bench(format!("invalid base64 in setup '{}': {e}", file.path))
                    })?;
                tokio::fs::write(&target, bytes).await?;
            } else {
                tokio::fs::write(&target, file.content.as_deref().unwrap_or_default()).await?;
            }
        }
        Ok(())
    }

    /// Remove the workspace entirely (successful-run cleanup).
    ///
    /// # Errors
    ///
    /// Surfaces I/O errors from the removal.
    pub async fn remove_workspace(&self) -> Result<()> {
        if self.workspace.exists() {
            tokio::fs::remove_dir_all(&self.workspace).await?;
        }
        Ok(())
    }

    fn resolve(&self, rel: &str) -> Result<PathBuf> {
        let path = Path::new(rel);
        if path.is_absolute()
            || path
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(CoderError::bench(format!(
                "setup path escapes the workspace: {rel}"
            )));
        }
        Ok(self.workspace.join(path))
    }
}
