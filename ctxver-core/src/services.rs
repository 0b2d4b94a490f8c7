//! Collaborator seams and the workspace environment.
//!
//! The core consumes four narrow interfaces:
//!
//! - [`CodeIntelligence`]: resolves analysis targets to text, symbols and files
//! - [`FileSource`]: reads files, reporting absence instead of failing
//! - [`TrackedFiles`]: asks version control whether a file is tracked
//! - [`TextDiffer`]: line diffs between two texts
//!
//! A [`Workspace`] bundles them with the fragment worker pool, the
//! background pool, the dynamic-id allocator and the configuration. Every
//! fragment and context holds an `Arc<Workspace>`.
//!
//! `StaticIntelligence` and `TrackedSet` are in-memory implementations for
//! hosts without an analyzer or git, and for tests.

use crate::cell::{BlockingPool, Executor};
use crate::config::Config;
use crate::error::Result;
use crate::ids::IdAllocator;
use crate::project::{CodeUnit, ProjectFile};
use crate::textdiff::{TextDiff, UnifiedDiffer};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

// ============================================
// Code intelligence
// ============================================

/// Direction of a call-graph query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    /// Callees of the method
    Out,
    /// Callers of the method
    In,
}

impl CallDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallDirection::Out => "OUT",
            CallDirection::In => "IN",
        }
    }
}

/// What a fragment asks the code-intelligence collaborator to resolve.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AnalysisTarget {
    /// Symbols declared in a file
    Declarations(ProjectFile),
    /// Source text of a method or class
    Source { fq_name: String },
    /// Skeleton of one class
    ClassSkeleton { fq_name: String },
    /// Skeletons of every class in a file
    FileSkeletons(ProjectFile),
    /// Call sites of a symbol
    Usages { target: String, include_tests: bool },
    /// Call graph around a method
    CallGraph {
        method: String,
        depth: u32,
        direction: CallDirection,
    },
}

/// Text, symbols and files produced for an [`AnalysisTarget`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    pub text: String,
    pub symbols: BTreeSet<CodeUnit>,
    pub files: BTreeSet<ProjectFile>,
}

impl Resolution {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_symbol(mut self, symbol: CodeUnit) -> Self {
        self.files.insert(symbol.file.clone());
        self.symbols.insert(symbol);
        self
    }

    pub fn with_file(mut self, file: ProjectFile) -> Self {
        self.files.insert(file);
        self
    }
}

/// Static-analysis collaborator.
///
/// `None` means "unavailable right now" (analyzer not ready, unknown
/// target); callers treat it as empty results, never as an error.
pub trait CodeIntelligence: Send + Sync {
    fn resolve(&self, target: &AnalysisTarget) -> Option<Resolution>;
}

/// Code intelligence that is never available.
#[derive(Debug, Default)]
pub struct NoIntelligence;

impl CodeIntelligence for NoIntelligence {
    fn resolve(&self, _target: &AnalysisTarget) -> Option<Resolution> {
        None
    }
}

/// Code intelligence answering from a fixed table.
#[derive(Debug, Default)]
pub struct StaticIntelligence {
    entries: HashMap<AnalysisTarget, Resolution>,
    calls: AtomicUsize,
}

impl StaticIntelligence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, target: AnalysisTarget, resolution: Resolution) -> Self {
        self.entries.insert(target, resolution);
        self
    }

    /// Number of `resolve` calls served so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CodeIntelligence for StaticIntelligence {
    fn resolve(&self, target: &AnalysisTarget) -> Option<Resolution> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.entries.get(target).cloned()
    }
}

// ============================================
// Files and version control
// ============================================

/// File reads. Missing or unreadable files are `None`.
pub trait FileSource: Send + Sync {
    fn read(&self, path: &Path) -> Option<Vec<u8>>;

    fn exists(&self, path: &Path) -> bool {
        self.read(path).is_some()
    }
}

/// Reads straight from disk.
#[derive(Debug, Default)]
pub struct DiskFiles;

impl FileSource for DiskFiles {
    fn read(&self, path: &Path) -> Option<Vec<u8>> {
        match std::fs::read(path) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "File not readable");
                None
            }
        }
    }

    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }
}

/// Version-control membership.
pub trait TrackedFiles: Send + Sync {
    fn is_tracked(&self, file: &ProjectFile) -> bool;
}

/// No version control: nothing is tracked.
#[derive(Debug, Default)]
pub struct Untracked;

impl TrackedFiles for Untracked {
    fn is_tracked(&self, _file: &ProjectFile) -> bool {
        false
    }
}

/// In-memory set of tracked files.
#[derive(Debug, Default)]
pub struct TrackedSet {
    files: Mutex<HashSet<ProjectFile>>,
}

impl TrackedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, file: ProjectFile) {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(file);
    }
}

impl TrackedFiles for TrackedSet {
    fn is_tracked(&self, file: &ProjectFile) -> bool {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(file)
    }
}

/// Deterministic line diff. `diff` is empty iff the texts are equal.
pub trait TextDiffer: Send + Sync {
    fn diff(&self, old: &str, new: &str, old_label: &str, new_label: &str) -> TextDiff;
}

// ============================================
// Workspace
// ============================================

/// Timeouts shared by fragments, contexts and diffs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Text extraction while diffing
    pub text: Duration,
    /// Freezing a fragment when its context is pushed
    pub snapshot: Duration,
    /// Extraction of usage and call-graph fragments
    pub slow_analysis: Duration,
}

impl Timeouts {
    fn from_config(config: &Config) -> Self {
        Self {
            text: config.diff.text_timeout(),
            snapshot: config.history.snapshot_timeout(),
            slow_analysis: config.fragments.slow_analysis_timeout(),
        }
    }
}

/// The environment every fragment and context runs in.
pub struct Workspace {
    root: PathBuf,
    config: Config,
    timeouts: Timeouts,
    ids: IdAllocator,
    intelligence: Arc<dyn CodeIntelligence>,
    files: Arc<dyn FileSource>,
    tracked: Arc<dyn TrackedFiles>,
    differ: Arc<dyn TextDiffer>,
    fragment_pool: Arc<dyn Executor>,
    background: Arc<BlockingPool>,
}

impl Workspace {
    pub fn builder(root: impl Into<PathBuf>) -> WorkspaceBuilder {
        WorkspaceBuilder {
            root: root.into(),
            config: Config::default(),
            intelligence: None,
            files: None,
            tracked: None,
            differ: None,
            fragment_pool: None,
            background: None,
        }
    }

    /// A workspace with default collaborators (disk files, no analyzer,
    /// no version control).
    pub fn open(root: impl Into<PathBuf>, config: &Config) -> Result<Arc<Self>> {
        Self::builder(root).config(config.clone()).build()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    pub fn ids(&self) -> &IdAllocator {
        &self.ids
    }

    pub fn intelligence(&self) -> &dyn CodeIntelligence {
        self.intelligence.as_ref()
    }

    pub fn files(&self) -> &dyn FileSource {
        self.files.as_ref()
    }

    pub fn tracked(&self) -> &dyn TrackedFiles {
        self.tracked.as_ref()
    }

    pub fn differ(&self) -> &dyn TextDiffer {
        self.differ.as_ref()
    }

    /// Pool for fragment derivations.
    pub fn fragment_executor(&self) -> Arc<dyn Executor> {
        Arc::clone(&self.fragment_pool)
    }

    /// Pool for diff computation and warm-up.
    pub fn background(&self) -> &Arc<BlockingPool> {
        &self.background
    }

    /// A project file under this workspace's root.
    pub fn project_file(&self, rel: impl AsRef<Path>) -> ProjectFile {
        ProjectFile::new(self.root.clone(), rel)
    }
}

impl fmt::Debug for Workspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workspace")
            .field("root", &self.root)
            .field("next_id", &self.ids.peek_next())
            .finish()
    }
}

/// Builder for [`Workspace`]; unset collaborators get defaults.
pub struct WorkspaceBuilder {
    root: PathBuf,
    config: Config,
    intelligence: Option<Arc<dyn CodeIntelligence>>,
    files: Option<Arc<dyn FileSource>>,
    tracked: Option<Arc<dyn TrackedFiles>>,
    differ: Option<Arc<dyn TextDiffer>>,
    fragment_pool: Option<Arc<dyn Executor>>,
    background: Option<Arc<BlockingPool>>,
}

impl WorkspaceBuilder {
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn intelligence(mut self, intelligence: Arc<dyn CodeIntelligence>) -> Self {
        self.intelligence = Some(intelligence);
        self
    }

    pub fn files(mut self, files: Arc<dyn FileSource>) -> Self {
        self.files = Some(files);
        self
    }

    pub fn tracked(mut self, tracked: Arc<dyn TrackedFiles>) -> Self {
        self.tracked = Some(tracked);
        self
    }

    pub fn differ(mut self, differ: Arc<dyn TextDiffer>) -> Self {
        self.differ = Some(differ);
        self
    }

    pub fn fragment_pool(mut self, pool: Arc<dyn Executor>) -> Self {
        self.fragment_pool = Some(pool);
        self
    }

    /// The host's background scheduler.
    pub fn background(mut self, pool: Arc<BlockingPool>) -> Self {
        self.background = Some(pool);
        self
    }

    pub fn build(self) -> Result<Arc<Workspace>> {
        self.config.validate()?;

        let fragment_pool = match self.fragment_pool {
            Some(pool) => pool,
            None => Arc::new(BlockingPool::new(
                "fragments",
                self.config.fragments.worker_threads,
            )?),
        };
        let background = match self.background {
            Some(pool) => pool,
            None => Arc::new(BlockingPool::new(
                "diffs",
                self.config.diff.warm_up_workers() + 1,
            )?),
        };

        tracing::debug!(root = %self.root.display(), "Workspace opened");

        Ok(Arc::new(Workspace {
            timeouts: Timeouts::from_config(&self.config),
            root: self.root,
            config: self.config,
            ids: IdAllocator::new(),
            intelligence: self.intelligence.unwrap_or_else(|| Arc::new(NoIntelligence)),
            files: self.files.unwrap_or_else(|| Arc::new(DiskFiles)),
            tracked: self.tracked.unwrap_or_else(|| Arc::new(Untracked)),
            differ: self.differ.unwrap_or_else(|| Arc::new(UnifiedDiffer::default())),
            fragment_pool,
            background,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_intelligence_counts_calls() {
        let file = ProjectFile::new("/repo", "a.py");
        let intelligence = StaticIntelligence::new().with(
            AnalysisTarget::FileSkeletons(file.clone()),
            Resolution::new("class A: ...").with_file(file.clone()),
        );

        let hit = intelligence.resolve(&AnalysisTarget::FileSkeletons(file.clone()));
        assert_eq!(hit.unwrap().text, "class A: ...");
        assert!(intelligence.resolve(&AnalysisTarget::Declarations(file)).is_none());
        assert_eq!(intelligence.call_count(), 2);
    }

    #[test]
    fn test_tracked_set() {
        let tracked = TrackedSet::new();
        let file = ProjectFile::new("/repo", "src/main.rs");
        assert!(!tracked.is_tracked(&file));
        tracked.track(file.clone());
        assert!(tracked.is_tracked(&file));
        assert!(!Untracked.is_tracked(&file));
    }

    #[test]
    fn test_disk_files_reports_absence() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("present.txt");
        std::fs::write(&present, "hi").unwrap();

        assert_eq!(DiskFiles.read(&present), Some(b"hi".to_vec()));
        assert!(DiskFiles.exists(&present));
        assert_eq!(DiskFiles.read(&dir.path().join("missing.txt")), None);
    }

    #[test]
    fn test_workspace_builder_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::builder(dir.path()).build().unwrap();

        assert_eq!(workspace.root(), dir.path());
        assert_eq!(workspace.timeouts().text, Duration::from_secs(2));
        assert_eq!(workspace.project_file("x/y.rs").rel_str(), "x/y.rs");
        assert!(workspace
            .intelligence()
            .resolve(&AnalysisTarget::Source {
                fq_name: "a.b".to_string()
            })
            .is_none());
    }

    #[test]
    fn test_workspace_rejects_invalid_config() {
        let mut config = Config::default();
        config.history.max_depth = 0;
        assert!(Workspace::open("/tmp", &config).is_err());
    }
}
