//! Loading and saving sessions on behalf of the commands.

use anyhow::{Context as _, Result};
use ctxver_core::{Config, Context, ContextHistory, DiffList, SessionSnapshot, Workspace};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// An open session: a workspace over the project root plus its history.
pub struct Session {
    history: ContextHistory,
}

impl Session {
    /// A fresh session holding only the empty context.
    pub fn create(config: &Config, root: PathBuf) -> Result<Self> {
        let workspace = open_workspace(config, root)?;
        Ok(Self {
            history: ContextHistory::new(Context::empty(&workspace)),
        })
    }

    /// Load a saved session. The root falls back from `root` to the one
    /// recorded in the session, then to the current directory.
    pub fn load(config: &Config, path: &Path, root: Option<PathBuf>) -> Result<Self> {
        let snapshot = SessionSnapshot::load(path)
            .with_context(|| format!("failed to load session {}", path.display()))?;
        let root = match root.or_else(|| snapshot.root.clone()) {
            Some(root) => root,
            None => std::env::current_dir().context("failed to read current directory")?,
        };
        let workspace = open_workspace(config, root)?;
        let history = snapshot
            .restore(&workspace)
            .with_context(|| format!("failed to restore session {}", path.display()))?;

        tracing::info!(
            path = %path.display(),
            contexts = history.len(),
            "Session loaded"
        );
        Ok(Self { history })
    }

    pub fn workspace(&self) -> &Arc<Workspace> {
        self.history.workspace()
    }

    pub fn history(&self) -> &ContextHistory {
        &self.history
    }

    /// Diff `context` against its predecessor, waiting for the result.
    pub fn diff(&self, context: &Context) -> Result<DiffList> {
        self.history
            .diff_cache()
            .diff(context)
            .join()
            .context("failed to compute diff")
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        SessionSnapshot::capture(&self.history)
            .save(path)
            .with_context(|| format!("failed to save session {}", path.display()))
    }
}

fn open_workspace(config: &Config, root: PathBuf) -> Result<Arc<Workspace>> {
    let root = root
        .canonicalize()
        .with_context(|| format!("failed to resolve project root {}", root.display()))?;
    Workspace::open(root.clone(), config)
        .with_context(|| format!("failed to open workspace at {}", root.display()))
}
