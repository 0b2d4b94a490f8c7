//! Fragments: addressable units of workspace content.
//!
//! A fragment is an immutable handle (`Arc` inside, cheap to clone) over a
//! [`FragmentKind`] payload. Everything it derives (text, symbols, files,
//! image bytes) hangs off one lazily computed [`ContentSnapshot`] cell that
//! runs on the workspace's fragment pool.
//!
//! ## Identity
//!
//! ```text
//!   dynamic        ProjectPath ExternalPath ImageFile Skeleton Usage Code CallGraph
//!                  id = workspace counter ("17"), new id on refresh_copy()
//!
//!   content-hash   everything else
//!                  id = sha256(type, description, content, style, tag), stable
//! ```
//!
//! Semantic equivalence (`has_same_source`) is separate from identity and
//! drives dedup in contexts and old/new matching in diffs.
//!
//! ## Freezing
//!
//! A fragment may carry one write-once byte buffer holding its materialized
//! content. Once set, every accessor reads from it instead of the live
//! source, which keeps historical contexts reproducible.

mod kind;
mod snapshot;

pub use kind::{
    file_ref, render_history, FileRef, FragmentKind, FragmentType, SkeletonTarget, CODE_NOTES,
    DISCARDED_CONTEXT, LATEST_BUILD_RESULTS,
};
pub use snapshot::{ContentSnapshot, IMAGE_PLACEHOLDER_TEXT};

use crate::cell::AsyncCell;
use crate::context::TaskEntry;
use crate::error::{Error, Result};
use crate::ids::FragmentId;
use crate::project::{CodeUnit, ProjectFile};
use crate::services::{CallDirection, Workspace};
use snapshot::{compute_live, decode_frozen, decode_text};
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

/// An addressable unit of workspace content.
#[derive(Clone)]
pub struct Fragment {
    inner: Arc<FragmentInner>,
}

struct FragmentInner {
    id: FragmentId,
    kind: FragmentKind,
    workspace: Arc<Workspace>,
    description: AsyncCell<String>,
    live: AsyncCell<Arc<ContentSnapshot>>,
    frozen: OnceLock<Arc<[u8]>>,
    decoded: OnceLock<AsyncCell<Arc<ContentSnapshot>>>,
}

impl Fragment {
    /// Create a fragment, allocating its id by the kind's identity regime.
    pub fn new(workspace: &Arc<Workspace>, kind: FragmentKind) -> Self {
        Self::with_description(workspace, kind, None)
    }

    fn with_description(
        workspace: &Arc<Workspace>,
        kind: FragmentKind,
        description: Option<AsyncCell<String>>,
    ) -> Self {
        let id = if kind.fragment_type().has_dynamic_identity() {
            FragmentId::dynamic(workspace.ids().next_id())
        } else {
            FragmentId::new(kind.content_hash())
        };
        Self::assemble(workspace, id, kind, description, None)
    }

    /// Rebuild a persisted fragment under its original id.
    ///
    /// Dynamic ids must be numeric; the workspace allocator is advanced
    /// past them so new fragments never collide.
    pub fn restore(
        workspace: &Arc<Workspace>,
        id: FragmentId,
        kind: FragmentKind,
        frozen: Option<Arc<[u8]>>,
        description: Option<String>,
    ) -> Result<Self> {
        if kind.fragment_type().has_dynamic_identity() {
            let value = id.as_number().ok_or_else(|| {
                Error::Persist(format!(
                    "{} fragment has non-numeric id {:?}",
                    kind.fragment_type(),
                    id.as_str()
                ))
            })?;
            workspace.ids().observe(value);
        }
        let description =
            description.map(|d| AsyncCell::completed(format!("fragment:{}:description", id), d));
        Ok(Self::assemble(workspace, id, kind, description, frozen))
    }

    fn assemble(
        workspace: &Arc<Workspace>,
        id: FragmentId,
        kind: FragmentKind,
        description: Option<AsyncCell<String>>,
        frozen: Option<Arc<[u8]>>,
    ) -> Self {
        let description = description.unwrap_or_else(|| {
            AsyncCell::completed(format!("fragment:{}:description", id), kind.description())
        });

        let key = format!("fragment:{}:snapshot", id);
        let live = match kind.static_snapshot() {
            Some(snapshot) => AsyncCell::completed(key, Arc::new(snapshot)),
            None => {
                let payload = kind.clone();
                let env = Arc::clone(workspace);
                AsyncCell::lazy(key, workspace.fragment_executor(), move || {
                    Arc::new(compute_live(&payload, &env))
                })
            }
        };

        let frozen_slot = OnceLock::new();
        if let Some(bytes) = frozen {
            let _ = frozen_slot.set(bytes);
        }

        Self {
            inner: Arc::new(FragmentInner {
                id,
                kind,
                workspace: Arc::clone(workspace),
                description,
                live,
                frozen: frozen_slot,
                decoded: OnceLock::new(),
            }),
        }
    }

    // ============================================
    // Constructors per kind
    // ============================================

    /// Full content of a project file, `rel` relative to the workspace root.
    pub fn project_path(workspace: &Arc<Workspace>, rel: impl AsRef<Path>) -> Self {
        Self::project_file(workspace, workspace.project_file(rel))
    }

    pub fn project_file(workspace: &Arc<Workspace>, file: ProjectFile) -> Self {
        Self::new(workspace, FragmentKind::ProjectPath { file })
    }

    pub fn git_file(
        workspace: &Arc<Workspace>,
        file: ProjectFile,
        revision: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::new(
            workspace,
            FragmentKind::GitFile {
                file,
                revision: revision.into(),
                content: content.into(),
            },
        )
    }

    pub fn external_path(workspace: &Arc<Workspace>, path: impl Into<PathBuf>) -> Self {
        Self::new(workspace, FragmentKind::ExternalPath { path: path.into() })
    }

    /// An image on disk; relative paths resolve against the workspace root.
    pub fn image_file(workspace: &Arc<Workspace>, path: impl AsRef<Path>) -> Self {
        let file = file_ref(workspace.root(), path.as_ref());
        Self::new(workspace, FragmentKind::ImageFile { file })
    }

    pub fn string(
        workspace: &Arc<Workspace>,
        description: impl Into<String>,
        text: impl Into<String>,
        syntax_style: impl Into<String>,
    ) -> Self {
        Self::new(
            workspace,
            FragmentKind::String {
                description: description.into(),
                text: text.into(),
                syntax_style: syntax_style.into(),
                files: BTreeSet::new(),
            },
        )
    }

    pub fn search_result(
        workspace: &Arc<Workspace>,
        query: impl Into<String>,
        text: impl Into<String>,
        files: BTreeSet<ProjectFile>,
    ) -> Self {
        Self::new(
            workspace,
            FragmentKind::SearchResult {
                query: query.into(),
                text: text.into(),
                files,
            },
        )
    }

    pub fn class_summary(workspace: &Arc<Workspace>, fq_name: impl Into<String>) -> Self {
        Self::new(
            workspace,
            FragmentKind::Skeleton {
                target: SkeletonTarget::Class(fq_name.into()),
            },
        )
    }

    pub fn file_summary(workspace: &Arc<Workspace>, file: ProjectFile) -> Self {
        Self::new(
            workspace,
            FragmentKind::Skeleton {
                target: SkeletonTarget::File(file),
            },
        )
    }

    pub fn usage(workspace: &Arc<Workspace>, target: impl Into<String>, include_tests: bool) -> Self {
        Self::new(
            workspace,
            FragmentKind::Usage {
                target: target.into(),
                include_tests,
            },
        )
    }

    pub fn code(workspace: &Arc<Workspace>, fq_name: impl Into<String>) -> Self {
        Self::new(
            workspace,
            FragmentKind::Code {
                fq_name: fq_name.into(),
            },
        )
    }

    pub fn call_graph(
        workspace: &Arc<Workspace>,
        method: impl Into<String>,
        depth: u32,
        direction: CallDirection,
    ) -> Self {
        Self::new(
            workspace,
            FragmentKind::CallGraph {
                method: method.into(),
                depth,
                direction,
            },
        )
    }

    pub fn history(workspace: &Arc<Workspace>, entries: Vec<TaskEntry>) -> Self {
        Self::new(workspace, FragmentKind::History { entries })
    }

    pub fn task(
        workspace: &Arc<Workspace>,
        description: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self::new(
            workspace,
            FragmentKind::Task {
                description: description.into(),
                text: text.into(),
            },
        )
    }

    /// Pasted text; `description` may still be computing (a summary, say).
    pub fn paste_text(
        workspace: &Arc<Workspace>,
        text: impl Into<String>,
        description: Option<AsyncCell<String>>,
    ) -> Self {
        Self::with_description(workspace, FragmentKind::PasteText { text: text.into() }, description)
    }

    pub fn paste_image(
        workspace: &Arc<Workspace>,
        bytes: impl Into<Arc<[u8]>>,
        description: Option<AsyncCell<String>>,
    ) -> Self {
        Self::with_description(
            workspace,
            FragmentKind::PasteImage {
                bytes: bytes.into(),
            },
            description,
        )
    }

    pub fn stack_trace(
        workspace: &Arc<Workspace>,
        original: impl Into<String>,
        exception: impl Into<String>,
        code: impl Into<String>,
        sources: BTreeSet<CodeUnit>,
    ) -> Self {
        Self::new(
            workspace,
            FragmentKind::StackTrace {
                original: original.into(),
                exception: exception.into(),
                code: code.into(),
                sources,
            },
        )
    }

    pub fn build_log(workspace: &Arc<Workspace>, text: impl Into<String>) -> Self {
        Self::new(workspace, FragmentKind::BuildLog { text: text.into() })
    }

    // ============================================
    // Identity
    // ============================================

    pub fn id(&self) -> &FragmentId {
        &self.inner.id
    }

    pub fn kind(&self) -> &FragmentKind {
        &self.inner.kind
    }

    pub fn fragment_type(&self) -> FragmentType {
        self.inner.kind.fragment_type()
    }

    pub fn workspace(&self) -> &Arc<Workspace> {
        &self.inner.workspace
    }

    pub fn repr(&self) -> String {
        self.inner.kind.repr()
    }

    pub fn is_text(&self) -> bool {
        self.fragment_type().is_text()
    }

    pub fn is_dynamic(&self) -> bool {
        self.fragment_type().has_dynamic_identity()
    }

    /// Same instance, not merely the same id.
    pub fn ptr_eq(&self, other: &Fragment) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Whether `other` stands for the same logical content.
    pub fn has_same_source(&self, other: &Fragment) -> bool {
        if self.ptr_eq(other) {
            return true;
        }
        let ty = self.fragment_type();
        if ty != other.fragment_type() {
            return false;
        }

        if let (
            FragmentKind::GitFile {
                file: a,
                revision: rev_a,
                ..
            },
            FragmentKind::GitFile {
                file: b,
                revision: rev_b,
                ..
            },
        ) = (self.kind(), other.kind())
        {
            return (a.abs_path() == b.abs_path() && rev_a == rev_b) || self.id() == other.id();
        }

        if let (Some(a), Some(b)) = (self.inner.kind.source_path(), other.inner.kind.source_path()) {
            if a == b {
                return true;
            }
        }

        if ty.has_dynamic_identity() {
            let (repr_a, repr_b) = (self.repr(), other.repr());
            if repr_a.is_empty() || repr_b.is_empty() {
                return self.id() == other.id();
            }
            return repr_a == repr_b;
        }

        if self.id() == other.id() {
            return true;
        }
        match (
            self.inner.kind.singleton_description(),
            other.inner.kind.singleton_description(),
        ) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    // ============================================
    // Derived properties
    // ============================================

    /// The materialized content, from the frozen buffer when present.
    pub fn snapshot(&self) -> AsyncCell<Arc<ContentSnapshot>> {
        match self.inner.frozen.get() {
            None => self.inner.live.clone(),
            Some(frozen) => self
                .inner
                .decoded
                .get_or_init(|| self.decoded_cell(frozen))
                .clone(),
        }
    }

    fn decoded_cell(&self, frozen: &Arc<[u8]>) -> AsyncCell<Arc<ContentSnapshot>> {
        let key = format!("fragment:{}:frozen", self.id());
        let kind = &self.inner.kind;
        // Symbols and files from the live snapshot that was frozen, if any.
        if let Some(live) = self.inner.live.peek() {
            let snapshot = ContentSnapshot {
                text: decode_text(frozen),
                image_bytes: (!self.is_text()).then(|| Arc::clone(frozen)),
                valid: true,
                ..(*live).clone()
            };
            return AsyncCell::completed(key, Arc::new(snapshot));
        }
        if !self.is_text() || kind.static_snapshot().is_some() {
            let snapshot = decode_frozen(kind, frozen, &self.inner.workspace);
            return AsyncCell::completed(key, Arc::new(snapshot));
        }
        let payload = kind.clone();
        let bytes = Arc::clone(frozen);
        let env = Arc::clone(&self.inner.workspace);
        AsyncCell::lazy(key, self.inner.workspace.fragment_executor(), move || {
            Arc::new(decode_frozen(&payload, &bytes, &env))
        })
    }

    fn derive<U, F>(&self, name: &str, f: F) -> AsyncCell<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(&ContentSnapshot) -> U + Send + 'static,
    {
        let snapshot = self.snapshot();
        match snapshot.peek() {
            Some(ready) => {
                AsyncCell::completed(format!("fragment:{}:{}", self.id(), name), f(&*ready))
            }
            None => snapshot.map(move |s| f(&*s)),
        }
    }

    /// Content text. Completed immediately for frozen fragments.
    pub fn text(&self) -> AsyncCell<String> {
        match self.frozen_text() {
            Some(text) => AsyncCell::completed(format!("fragment:{}:text", self.id()), text),
            None => self.derive("text", |s| s.text.clone()),
        }
    }

    fn frozen_text(&self) -> Option<String> {
        if !self.is_text() {
            return None;
        }
        self.inner.frozen.get().map(|bytes| decode_text(bytes))
    }

    pub fn sources(&self) -> AsyncCell<BTreeSet<CodeUnit>> {
        self.derive("sources", |s| s.sources.clone())
    }

    pub fn files(&self) -> AsyncCell<BTreeSet<ProjectFile>> {
        match self.inner.kind.static_files() {
            Some(files) => AsyncCell::completed(format!("fragment:{}:files", self.id()), files),
            None => self.derive("files", |s| s.files.clone()),
        }
    }

    /// Image bytes for non-text fragments; `None` for text fragments.
    pub fn image_bytes(&self) -> Option<AsyncCell<Option<Arc<[u8]>>>> {
        if self.is_text() {
            return None;
        }
        if let Some(bytes) = self.frozen_bytes() {
            let key = format!("fragment:{}:image", self.id());
            return Some(AsyncCell::completed(key, Some(bytes)));
        }
        Some(self.derive("image", |s| s.image_bytes.clone()))
    }

    pub fn description(&self) -> AsyncCell<String> {
        self.inner.description.clone()
    }

    pub fn short_description(&self) -> AsyncCell<String> {
        match self.fragment_type() {
            FragmentType::PasteText | FragmentType::PasteImage => self.description(),
            _ => AsyncCell::completed(
                format!("fragment:{}:short", self.id()),
                self.inner.kind.short_description(),
            ),
        }
    }

    pub fn syntax_style(&self) -> AsyncCell<String> {
        AsyncCell::completed(
            format!("fragment:{}:style", self.id()),
            self.inner.kind.syntax_style(),
        )
    }

    /// Description if known, else the payload's default. Never blocks.
    pub fn description_now(&self) -> String {
        self.inner
            .description
            .peek()
            .unwrap_or_else(|| self.inner.kind.description())
    }

    /// Short description if known, else the payload's default. Never blocks.
    pub fn short_description_now(&self) -> String {
        self.short_description()
            .peek()
            .unwrap_or_else(|| self.inner.kind.short_description())
    }

    /// False once the materialized snapshot reports a vanished source.
    pub fn is_valid(&self) -> bool {
        self.snapshot().peek().map_or(true, |s| s.valid)
    }

    /// Referenced files, waiting up to `timeout` if they need computing.
    ///
    /// # Blocking
    ///
    /// Only for kinds whose files depend on code intelligence.
    pub fn referenced_files(&self, timeout: Duration) -> BTreeSet<ProjectFile> {
        self.referenced_files_until(Instant::now() + timeout)
    }

    /// Like [`Fragment::referenced_files`], bounded by a shared deadline.
    pub(crate) fn referenced_files_until(&self, deadline: Instant) -> BTreeSet<ProjectFile> {
        if let Some(files) = self.inner.kind.static_files() {
            return files;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        match self.files().await_timeout(remaining) {
            Ok(Some(files)) => files,
            Ok(None) => {
                tracing::warn!(
                    fragment = %self.description_now(),
                    timeout_ms = remaining.as_millis() as u64,
                    "Timed out resolving referenced files"
                );
                BTreeSet::new()
            }
            Err(e) => {
                tracing::warn!(fragment = %self.description_now(), error = %e, "Failed to resolve referenced files");
                BTreeSet::new()
            }
        }
    }

    /// Start resolving referenced files, unless they are static. Never blocks.
    pub(crate) fn start_files(&self) {
        if self.inner.kind.static_files().is_none() {
            self.snapshot().start();
        }
    }

    /// Start materializing live content, unless it is frozen. Never blocks.
    pub fn start_content(&self) {
        if !self.is_frozen() {
            self.inner.live.start();
        }
    }

    /// How long to wait on this fragment's own derivations.
    pub fn resolution_timeout(&self) -> Duration {
        let timeouts = self.inner.workspace.timeouts();
        if self.fragment_type().is_slow_analysis() {
            timeouts.slow_analysis
        } else {
            timeouts.snapshot
        }
    }

    /// Prompt rendering: `<fragment description=… fragmentid=…>text</fragment>`.
    pub fn format(&self) -> AsyncCell<String> {
        let description = self.description_now();
        let id = self.id().clone();
        let render = move |text: &str| {
            format!(
                "<fragment description=\"{}\" fragmentid=\"{}\">\n{}\n</fragment>",
                description, id, text
            )
        };
        match self.frozen_text() {
            Some(text) => AsyncCell::completed(format!("fragment:{}:format", self.id()), render(&text)),
            None => self.derive("format", move |s| render(&s.text)),
        }
    }

    /// One-line table-of-contents entry. Never blocks.
    pub fn format_toc(&self) -> String {
        format!(
            "<fragment-toc description=\"{}\" fragmentid=\"{}\" />",
            self.description_now(),
            self.id()
        )
    }

    // ============================================
    // Freezing and refresh
    // ============================================

    pub fn is_frozen(&self) -> bool {
        self.inner.frozen.get().is_some()
    }

    pub fn frozen_bytes(&self) -> Option<Arc<[u8]>> {
        self.inner.frozen.get().cloned()
    }

    /// Set the frozen buffer. First write wins; returns whether this one did.
    pub fn freeze_with(&self, bytes: Arc<[u8]>) -> bool {
        self.inner.frozen.set(bytes).is_ok()
    }

    /// Materialize the live content and freeze it.
    ///
    /// # Blocking
    ///
    /// Waits up to `timeout` for the snapshot. Returns whether the fragment
    /// is frozen afterwards; vanished sources are not frozen.
    pub fn freeze(&self, timeout: Duration) -> bool {
        self.freeze_until(Instant::now() + timeout)
    }

    /// Like [`Fragment::freeze`], bounded by a shared deadline.
    pub(crate) fn freeze_until(&self, deadline: Instant) -> bool {
        if self.is_frozen() {
            return true;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        let snapshot = match self.inner.live.await_timeout(remaining) {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                tracing::warn!(
                    fragment = %self.description_now(),
                    timeout_ms = remaining.as_millis() as u64,
                    "Timed out freezing fragment"
                );
                return false;
            }
            Err(e) => {
                tracing::warn!(fragment = %self.description_now(), error = %e, "Failed to freeze fragment");
                return false;
            }
        };
        if !snapshot.valid {
            return false;
        }

        let bytes: Arc<[u8]> = if self.is_text() {
            Arc::from(snapshot.text.as_bytes())
        } else {
            match &snapshot.image_bytes {
                Some(bytes) => Arc::clone(bytes),
                None => return false,
            }
        };
        self.freeze_with(bytes);
        true
    }

    /// A copy that re-reads its sources.
    ///
    /// Content-hashed fragments return themselves. Dynamic ones get a new
    /// id and fresh cells; the frozen buffer is not carried over.
    pub fn refresh_copy(&self) -> Fragment {
        if !self.is_dynamic() {
            return self.clone();
        }
        Self::with_description(&self.inner.workspace, self.inner.kind.clone(), None)
    }
}

impl PartialEq for Fragment {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id() && self.fragment_type() == other.fragment_type()
    }
}

impl Eq for Fragment {}

impl Hash for Fragment {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl fmt::Debug for Fragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fragment")
            .field("id", &self.id().as_str())
            .field("type", &self.fragment_type())
            .field("description", &self.description_now())
            .field("frozen", &self.is_frozen())
            .finish()
    }
}
