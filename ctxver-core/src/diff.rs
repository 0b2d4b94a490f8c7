//! Content diffs between a context and its predecessor.
//!
//! ## Per-fragment rules
//!
//! Given a new fragment `N` and the predecessor fragment `O` with the same
//! source (if any):
//!
//! ```text
//!   O absent,  N image                        → nothing
//!   O absent,  N tracked project file on disk → nothing (already in git)
//!   O absent,  N text                         → diff against ""
//!   O image,   N image                        → "[Image changed]" if bytes differ
//!   O text,    N text                         → unified diff, if non-empty
//! ```
//!
//! Text extraction shares one deadline per diff; a fragment still
//! materializing when it passes reads as [`TEXT_TIMEOUT_PLACEHOLDER`].
//!
//! ## Cache
//!
//! [`DiffCache`] memoizes one cell per context id (insert-if-absent, so
//! racing callers share a computation) and warms up recent history on the
//! workspace's background pool. Warm-up claims entries through the same
//! insert-if-absent path, so a context is never diffed twice. Claims are
//! refused once the generation captured at schedule time is stale;
//! `invalidate` bumps it and clears claimed entries under the publish lock.

use crate::cell::{AsyncCell, BlockingPool, Completer, Executor};
use crate::context::{Context, DiffEntry};
use crate::error::CellError;
use crate::fragment::{Fragment, FragmentKind};
use crate::ids::ContextId;
use crate::services::Workspace;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Stand-in text for content that did not materialize in time.
pub const TEXT_TIMEOUT_PLACEHOLDER: &str = "Timeout loading contents. Please consider reporting a bug";
/// Diff text of a changed image.
pub const IMAGE_CHANGED: &str = "[Image changed]";

const IMAGE_CONTENT: &str = "[image]";

/// The computed diff of one context.
pub type DiffList = Arc<Vec<DiffEntry>>;

/// Completed diffs by context id, for carrying across a reload.
pub type DiffSnapshot = HashMap<ContextId, DiffList>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffOptions {
    /// Bound on text extraction across one diff
    pub text_timeout: Duration,
}

impl DiffOptions {
    pub fn from_workspace(workspace: &Workspace) -> Self {
        Self {
            text_timeout: workspace.timeouts().text,
        }
    }
}

// ============================================
// Per-fragment diff
// ============================================

/// Diff one fragment against its predecessor.
///
/// # Blocking
///
/// Waits up to `options.text_timeout` for content.
pub fn diff_fragment(old: Option<&Fragment>, new: &Fragment, options: &DiffOptions) -> Option<DiffEntry> {
    diff_fragment_by(old, new, Instant::now() + options.text_timeout)
}

/// [`diff_fragment`] bounded by a deadline shared with other fragments.
pub(crate) fn diff_fragment_by(old: Option<&Fragment>, new: &Fragment, deadline: Instant) -> Option<DiffEntry> {
    let Some(old) = old else {
        if !new.is_text() || is_tracked_on_disk(new) {
            return None;
        }
        let new_text = extract_text(new, deadline);
        return text_entry(new, String::new(), new_text);
    };

    if !old.is_text() || !new.is_text() {
        return image_entry(old, new, deadline);
    }
    let old_text = extract_text(old, deadline);
    let new_text = extract_text(new, deadline);
    text_entry(new, old_text, new_text)
}

fn is_tracked_on_disk(fragment: &Fragment) -> bool {
    let FragmentKind::ProjectPath { file } = fragment.kind() else {
        return false;
    };
    let workspace = fragment.workspace();
    let tracked = workspace.tracked().is_tracked(file) && workspace.files().exists(&file.abs_path());
    if tracked {
        tracing::trace!(file = %file, "Skipping new tracked file");
    }
    tracked
}

fn text_entry(new: &Fragment, old_text: String, new_text: String) -> Option<DiffEntry> {
    let label = new.short_description_now();
    let diff = new.workspace().differ().diff(
        &old_text,
        &new_text,
        &format!("old/{}", label),
        &format!("new/{}", label),
    );
    if diff.is_empty() {
        return None;
    }

    tracing::trace!(
        fragment = %label,
        lines_added = diff.lines_added,
        lines_deleted = diff.lines_deleted,
        "Fragment changed"
    );
    Some(DiffEntry {
        fragment: new.clone(),
        diff: diff.diff,
        lines_added: diff.lines_added,
        lines_deleted: diff.lines_deleted,
        old_content: old_text,
        new_content: new_text,
    })
}

fn image_entry(old: &Fragment, new: &Fragment, deadline: Instant) -> Option<DiffEntry> {
    let changed = match (extract_image(old, deadline), extract_image(new, deadline)) {
        (Some(a), Some(b)) => a != b,
        (None, None) => false,
        _ => true,
    };
    if !changed {
        return None;
    }
    Some(DiffEntry {
        fragment: new.clone(),
        diff: IMAGE_CHANGED.to_string(),
        lines_added: 1,
        lines_deleted: 1,
        old_content: IMAGE_CONTENT.to_string(),
        new_content: IMAGE_CONTENT.to_string(),
    })
}

fn extract_text(fragment: &Fragment, deadline: Instant) -> String {
    let remaining = deadline.saturating_duration_since(Instant::now());
    match fragment.text().await_timeout(remaining) {
        Ok(Some(text)) => text,
        Ok(None) => {
            tracing::warn!(
                fragment = %fragment.description_now(),
                "Timed out loading fragment contents for diff"
            );
            TEXT_TIMEOUT_PLACEHOLDER.to_string()
        }
        Err(e) => {
            tracing::warn!(fragment = %fragment.description_now(), error = %e, "Failed to load fragment contents for diff");
            TEXT_TIMEOUT_PLACEHOLDER.to_string()
        }
    }
}

fn extract_image(fragment: &Fragment, deadline: Instant) -> Option<Arc<[u8]>> {
    let cell = fragment.image_bytes()?;
    let remaining = deadline.saturating_duration_since(Instant::now());
    match cell.await_timeout(remaining) {
        Ok(bytes) => bytes.flatten(),
        Err(e) => {
            tracing::warn!(fragment = %fragment.description_now(), error = %e, "Failed to load image for diff");
            None
        }
    }
}

// ============================================
// Context diff
// ============================================

/// Fragments considered for a context diff: editable ones, then images.
fn diff_candidates(context: &Context) -> Vec<Fragment> {
    let mut seen = HashSet::new();
    context
        .fragments()
        .iter()
        .filter(|f| f.fragment_type().is_editable())
        .chain(context.fragments().iter().filter(|f| !f.is_text()))
        .filter(|f| seen.insert(f.id().clone()))
        .cloned()
        .collect()
}

/// Diff `current` against `previous`, in candidate order without duplicates.
///
/// # Blocking
///
/// All derivations are started up front; the waits share one deadline of
/// `options.text_timeout`.
pub fn diff_contexts(current: &Context, previous: &Context, options: &DiffOptions) -> Vec<DiffEntry> {
    let pairs: Vec<(Option<Fragment>, Fragment)> = diff_candidates(current)
        .into_iter()
        .map(|new| (previous.find_with_same_source(&new), new))
        .filter(|(old, new)| !old.as_ref().is_some_and(|o| o.ptr_eq(new)))
        .collect();

    for (old, new) in &pairs {
        new.start_content();
        if let Some(old) = old {
            old.start_content();
        }
    }

    let deadline = Instant::now() + options.text_timeout;
    let mut entries: Vec<DiffEntry> = Vec::new();
    for (old, new) in &pairs {
        if let Some(entry) = diff_fragment_by(old.as_ref(), new, deadline) {
            if !entries.contains(&entry) {
                entries.push(entry);
            }
        }
    }
    entries
}

// ============================================
// DiffCache
// ============================================

/// Where a [`DiffCache`] finds predecessors and recent contexts.
pub trait Lineage: Send + Sync {
    fn previous_of(&self, context: &Context) -> Option<Context>;

    /// Up to `max` contexts, newest first.
    fn recent(&self, max: usize) -> Vec<Context>;
}

/// Outcome of one warm-up pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WarmUpReport {
    pub generation: u64,
    /// Diffs this pass computed itself
    pub computed: usize,
    /// Computed diffs still cached when the pass finished
    pub published: usize,
    /// Computed diffs orphaned because the cache was invalidated
    pub dropped: usize,
}

/// Memoized per-context diffs against the predecessor in history.
#[derive(Clone)]
pub struct DiffCache {
    shared: Arc<Shared>,
}

struct Shared {
    lineage: Arc<dyn Lineage>,
    entries: DashMap<ContextId, AsyncCell<DiffList>>,
    generation: AtomicU64,
    publish: RwLock<()>,
    options: DiffOptions,
    computations: Arc<AtomicUsize>,
    pool: Arc<BlockingPool>,
    warm_up_workers: usize,
}

impl DiffCache {
    pub fn new(workspace: &Workspace, lineage: Arc<dyn Lineage>) -> Self {
        Self {
            shared: Arc::new(Shared {
                lineage,
                entries: DashMap::new(),
                generation: AtomicU64::new(0),
                publish: RwLock::new(()),
                options: DiffOptions::from_workspace(workspace),
                computations: Arc::new(AtomicUsize::new(0)),
                pool: Arc::clone(workspace.background()),
                warm_up_workers: workspace.config().diff.warm_up_workers(),
            }),
        }
    }

    /// The diff of `context` against its predecessor, computed at most once.
    pub fn diff(&self, context: &Context) -> AsyncCell<DiffList> {
        let id = context.id();
        if let Some(cell) = self.shared.entries.get(&id) {
            tracing::debug!(context_id = %id, "Diff cache hit");
            return cell.value().clone();
        }

        let candidate = self.shared.compute_cell(context.clone());
        let cell = self.shared.entries.entry(id).or_insert(candidate).value().clone();
        tracing::debug!(context_id = %id, "Diff cache miss");
        cell.start();
        cell
    }

    /// The diff of `context` if already computed. Never blocks.
    pub fn peek(&self, context: &Context) -> Option<DiffList> {
        self.shared.entries.get(&context.id()).and_then(|c| c.peek())
    }

    /// Compute diffs for up to `max` recent contexts in the background.
    ///
    /// Results are discarded if [`DiffCache::invalidate`] runs before they
    /// are published.
    pub fn warm_up_recent(&self, max: usize) -> AsyncCell<WarmUpReport> {
        let generation = self.generation();
        let shared = Arc::clone(&self.shared);
        let handle = self.shared.pool.handle().clone();

        let cell = AsyncCell::deferred(
            format!("diff:warm-up:{}", generation),
            move |completer: Completer<WarmUpReport>| {
                handle.spawn(async move {
                    let report = shared.warm_up(generation, max).await;
                    completer.complete(Ok(report));
                });
            },
        );
        cell.start();
        cell
    }

    /// Drop every entry and orphan in-flight warm-up results.
    pub fn invalidate(&self) {
        let _guard = self
            .shared
            .publish
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.entries.clear();
        tracing::info!(generation, "Diff cache invalidated");
    }

    /// Keep only entries for `live` contexts.
    pub fn retain_only(&self, live: &BTreeSet<ContextId>) {
        let before = self.shared.entries.len();
        self.shared.entries.retain(|id, _| live.contains(id));
        let pruned = before.saturating_sub(self.shared.entries.len());
        if pruned > 0 {
            tracing::debug!(pruned, "Pruned diff cache");
        }
    }

    /// Drop the entry for one context, e.g. when its predecessor leaves
    /// history.
    pub fn forget(&self, id: ContextId) -> bool {
        let removed = self.shared.entries.remove(&id).is_some();
        if removed {
            tracing::debug!(context_id = %id, "Forgot cached diff");
        }
        removed
    }

    /// Completed entries, for persisting across a reload.
    pub fn snapshot(&self) -> DiffSnapshot {
        self.shared
            .entries
            .iter()
            .filter_map(|e| e.value().peek().map(|diff| (*e.key(), diff)))
            .collect()
    }

    /// Fill in entries from `prior` for `allowed` ids, never overwriting.
    /// Returns how many were added.
    pub fn seed_from(&self, prior: &DiffSnapshot, allowed: &BTreeSet<ContextId>) -> usize {
        let mut seeded = 0;
        for (id, diff) in prior.iter().filter(|(id, _)| allowed.contains(*id)) {
            if self.shared.entries.contains_key(id) {
                continue;
            }
            self.shared
                .entries
                .entry(*id)
                .or_insert_with(|| AsyncCell::completed(format!("diff:{}", id), Arc::clone(diff)));
            seeded += 1;
        }
        seeded
    }

    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::SeqCst)
    }

    /// How many context diffs have been computed so far.
    pub fn computation_count(&self) -> usize {
        self.shared.computations.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.shared.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.entries.is_empty()
    }
}

fn compute(lineage: &dyn Lineage, counter: &AtomicUsize, context: &Context, options: &DiffOptions) -> DiffList {
    counter.fetch_add(1, Ordering::SeqCst);
    let started = Instant::now();
    let entries = match lineage.previous_of(context) {
        Some(previous) => diff_contexts(context, &previous, options),
        None => Vec::new(),
    };
    tracing::debug!(
        context_id = %context.id(),
        entries = entries.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Computed context diff"
    );
    Arc::new(entries)
}

impl Shared {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn compute_cell(&self, context: Context) -> AsyncCell<DiffList> {
        let lineage = Arc::clone(&self.lineage);
        let counter = Arc::clone(&self.computations);
        let options = self.options;
        let executor: Arc<dyn Executor> = self.pool.clone();
        AsyncCell::lazy(format!("diff:{}", context.id()), executor, move || {
            compute(lineage.as_ref(), &counter, &context, &options)
        })
    }

    /// Claim the entry for `context` if it has none and `generation` is
    /// still live. The caller computes the diff and completes the claim;
    /// `None` if another caller owns the entry or the cache moved on.
    fn claim(&self, generation: u64, context: &Context) -> Option<Completer<DiffList>> {
        let _guard = self.publish.read().unwrap_or_else(PoisonError::into_inner);
        if !self.is_current(generation) {
            return None;
        }
        match self.entries.entry(context.id()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let (cell, completer) = AsyncCell::promise(format!("diff:{}", context.id()));
                slot.insert(cell);
                Some(completer)
            }
        }
    }

    /// Compute a claimed diff on the current thread.
    fn compute_claimed(&self, context: &Context, completer: Completer<DiffList>) -> Option<CellError> {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            compute(self.lineage.as_ref(), &self.computations, context, &self.options)
        }))
        .map_err(|_| CellError::Panicked(format!("diff of context {}", context.id())));
        let failure = outcome.as_ref().err().cloned();
        completer.complete(outcome);
        failure
    }

    async fn warm_up(self: Arc<Self>, generation: u64, max: usize) -> WarmUpReport {
        let started = Instant::now();
        let mut report = WarmUpReport {
            generation,
            ..WarmUpReport::default()
        };
        if !self.is_current(generation) {
            return report;
        }

        let targets: Vec<Context> = self
            .lineage
            .recent(max)
            .into_iter()
            .filter(|c| !self.entries.contains_key(&c.id()))
            .filter(|c| self.lineage.previous_of(c).is_some())
            .collect();

        let semaphore = Arc::new(Semaphore::new(self.warm_up_workers.max(1)));
        let mut workers = JoinSet::new();
        for context in targets {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            if !self.is_current(generation) {
                break;
            }
            let shared = Arc::clone(&self);
            workers.spawn_blocking(move || {
                let _permit = permit;
                let completer = shared.claim(generation, &context)?;
                Some((context.id(), shared.compute_claimed(&context, completer)))
            });
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Some((id, failure))) => {
                    report.computed += 1;
                    if !self.is_current(generation) {
                        tracing::warn!(context_id = %id, generation, "Dropping stale warm-up diff");
                        report.dropped += 1;
                        continue;
                    }
                    if let Some(e) = failure {
                        tracing::warn!(context_id = %id, error = %e, "Diff warm-up computation failed");
                    }
                    report.published += 1;
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "Diff warm-up worker failed"),
            }
        }

        tracing::info!(
            generation,
            computed = report.computed,
            published = report.published,
            dropped = report.dropped,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Diff warm-up finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::FragmentId;
    use crate::project::ProjectFile;
    use crate::services::{AnalysisTarget, CodeIntelligence, Resolution, TrackedSet};
    use std::sync::Mutex;
    use std::thread;
    use tempfile::TempDir;

    const WAIT: Duration = Duration::from_secs(10);

    fn workspace() -> (TempDir, Arc<Workspace>) {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::builder(dir.path()).build().unwrap();
        (dir, workspace)
    }

    fn options() -> DiffOptions {
        DiffOptions {
            text_timeout: Duration::from_secs(5),
        }
    }

    /// Contexts in push order; the predecessor is the previous element.
    #[derive(Default)]
    struct ListLineage(Mutex<Vec<Context>>);

    impl ListLineage {
        fn push(&self, context: Context) {
            self.0.lock().unwrap().push(context);
        }
    }

    impl Lineage for ListLineage {
        fn previous_of(&self, context: &Context) -> Option<Context> {
            let list = self.0.lock().unwrap();
            let index = list.iter().position(|c| c.id() == context.id())?;
            index.checked_sub(1).map(|i| list[i].clone())
        }

        fn recent(&self, max: usize) -> Vec<Context> {
            self.0.lock().unwrap().iter().rev().take(max).cloned().collect()
        }
    }

    struct SlowIntelligence(Duration);

    impl CodeIntelligence for SlowIntelligence {
        fn resolve(&self, _target: &AnalysisTarget) -> Option<Resolution> {
            thread::sleep(self.0);
            Some(Resolution::new("fn slow() {}"))
        }
    }

    #[test]
    fn test_new_text_diffs_against_empty() {
        let (dir, ws) = workspace();
        std::fs::write(dir.path().join("a.txt"), "one\ntwo\n").unwrap();
        let fragment = Fragment::project_path(&ws, "a.txt");

        let entry = diff_fragment(None, &fragment, &options()).unwrap();
        assert_eq!(entry.lines_added, 2);
        assert_eq!(entry.lines_deleted, 0);
        assert_eq!(entry.old_content, "");
        assert!(entry.diff.contains("+++ new/a.txt"));
    }

    #[test]
    fn test_new_tracked_file_is_suppressed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "tracked").unwrap();
        let tracked = Arc::new(TrackedSet::new());
        tracked.track(ProjectFile::new(dir.path(), "a.txt"));
        let ws = Workspace::builder(dir.path()).tracked(tracked).build().unwrap();

        let fragment = Fragment::project_path(&ws, "a.txt");
        assert!(diff_fragment(None, &fragment, &options()).is_none());
    }

    #[test]
    fn test_images() {
        let (dir, ws) = workspace();
        std::fs::write(dir.path().join("logo.png"), [1u8, 2, 3]).unwrap();
        let old = Fragment::image_file(&ws, "logo.png");
        assert!(old.freeze(WAIT));

        assert!(diff_fragment(None, &old, &options()).is_none());

        let same = old.refresh_copy();
        assert!(diff_fragment(Some(&old), &same, &options()).is_none());

        std::fs::write(dir.path().join("logo.png"), [9u8, 9]).unwrap();
        let changed = old.refresh_copy();
        let entry = diff_fragment(Some(&old), &changed, &options()).unwrap();
        assert_eq!(entry.diff, IMAGE_CHANGED);
        assert_eq!((entry.lines_added, entry.lines_deleted), (1, 1));
    }

    #[test]
    fn test_slow_content_reads_as_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::builder(dir.path())
            .intelligence(Arc::new(SlowIntelligence(Duration::from_millis(500))))
            .build()
            .unwrap();
        let code = Fragment::code(&ws, "a.B.run");

        let started = Instant::now();
        let entry = diff_fragment(
            None,
            &code,
            &DiffOptions {
                text_timeout: Duration::from_millis(50),
            },
        )
        .unwrap();
        assert!(started.elapsed() < Duration::from_millis(400));
        assert_eq!(entry.new_content, TEXT_TIMEOUT_PLACEHOLDER);
    }

    #[test]
    fn test_frozen_text_does_not_wait_on_analysis() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::builder(dir.path())
            .intelligence(Arc::new(SlowIntelligence(Duration::from_secs(3))))
            .build()
            .unwrap();
        let old = Fragment::code(&ws, "a.B.run");
        assert!(old.freeze_with(Arc::from(&b"fn run() { old }"[..])));
        let new = old.refresh_copy();
        assert!(new.freeze_with(Arc::from(&b"fn run() { new }"[..])));
        let restored = Fragment::restore(
            &ws,
            FragmentId::dynamic(41),
            old.kind().clone(),
            old.frozen_bytes(),
            None,
        )
        .unwrap();

        let started = Instant::now();
        let short = Duration::from_millis(500);
        assert_eq!(
            restored.text().await_timeout(short).unwrap(),
            Some("fn run() { old }".to_string())
        );
        assert!(restored.format().peek().unwrap().contains("fn run() { old }"));
        let entry = diff_fragment(Some(&restored), &new, &DiffOptions { text_timeout: short }).unwrap();
        assert!(started.elapsed() < short);

        assert_eq!(entry.old_content, "fn run() { old }");
        assert_eq!(entry.new_content, "fn run() { new }");
        assert_eq!((entry.lines_added, entry.lines_deleted), (1, 1));
    }

    #[test]
    fn test_context_diff_covers_editable_fragments_only() {
        let (dir, ws) = workspace();
        std::fs::write(dir.path().join("a.txt"), "hello").unwrap();
        let c1 = Context::empty(&ws).add_fragments([Fragment::project_path(&ws, "a.txt")]);
        c1.freeze(WAIT);
        std::fs::write(dir.path().join("a.txt"), "hello world").unwrap();
        let c2 = c1
            .copy_and_refresh(None)
            .add_fragments([Fragment::build_log(&ws, "warning: unused")]);

        let entries = diff_contexts(&c2, &c1, &options());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].title(), "a.txt");
        assert_eq!((entries[0].lines_added, entries[0].lines_deleted), (1, 1));
    }

    #[test]
    fn test_cache_memoizes_per_context() {
        let (dir, ws) = workspace();
        std::fs::write(dir.path().join("a.txt"), "hello").unwrap();
        let lineage = Arc::new(ListLineage::default());
        let cache = DiffCache::new(&ws, lineage.clone());

        let c1 = Context::empty(&ws).add_fragments([Fragment::project_path(&ws, "a.txt")]);
        c1.freeze(WAIT);
        std::fs::write(dir.path().join("a.txt"), "hello world").unwrap();
        let c2 = c1.copy_and_refresh(None);
        lineage.push(c1);
        lineage.push(c2.clone());

        assert!(cache.peek(&c2).is_none());
        let first = cache.diff(&c2).join().unwrap();
        let second = cache.diff(&c2).join().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 1);
        assert_eq!(cache.computation_count(), 1);
        assert_eq!(cache.peek(&c2), Some(first));
    }

    #[test]
    fn test_context_without_predecessor_has_no_diff() {
        let (_dir, ws) = workspace();
        let lineage = Arc::new(ListLineage::default());
        let cache = DiffCache::new(&ws, lineage.clone());
        let root = Context::empty(&ws);
        lineage.push(root.clone());

        assert!(cache.diff(&root).join().unwrap().is_empty());
    }

    fn slow_history(ws: &Arc<Workspace>, lineage: &ListLineage, versions: usize) {
        let mut ctx = Context::empty(ws);
        lineage.push(ctx.clone());
        for i in 0..versions {
            ctx = ctx.add_fragments([Fragment::code(ws, format!("a.B.m{}", i))]);
            lineage.push(ctx.clone());
        }
    }

    #[test]
    fn test_warm_up_publishes_recent() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::builder(dir.path())
            .intelligence(Arc::new(SlowIntelligence(Duration::from_millis(10))))
            .build()
            .unwrap();
        let lineage = Arc::new(ListLineage::default());
        slow_history(&ws, &lineage, 4);
        let cache = DiffCache::new(&ws, lineage.clone());

        let report = cache.warm_up_recent(3).await_timeout(WAIT).unwrap().unwrap();
        assert_eq!(report.published, 3);
        assert_eq!(report.dropped, 0);
        for ctx in lineage.recent(3) {
            assert!(cache.peek(&ctx).is_some());
        }
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_invalidate_orphans_warm_up() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::builder(dir.path())
            .intelligence(Arc::new(SlowIntelligence(Duration::from_millis(200))))
            .build()
            .unwrap();
        let lineage = Arc::new(ListLineage::default());
        slow_history(&ws, &lineage, 3);
        let cache = DiffCache::new(&ws, lineage.clone());

        let warm_up = cache.warm_up_recent(3);
        cache.invalidate();
        let report = warm_up.await_timeout(WAIT).unwrap().unwrap();

        assert_eq!(report.published, 0);
        assert_eq!(cache.generation(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_retain_snapshot_and_seed() {
        let (_dir, ws) = workspace();
        let lineage = Arc::new(ListLineage::default());
        let c1 = Context::empty(&ws);
        let c2 = c1.add_fragments([Fragment::project_path(&ws, "a.txt")]);
        lineage.push(c1.clone());
        lineage.push(c2.clone());

        let cache = DiffCache::new(&ws, lineage.clone());
        cache.diff(&c1).join().unwrap();
        cache.diff(&c2).join().unwrap();
        let saved = cache.snapshot();
        assert_eq!(saved.len(), 2);

        cache.retain_only(&BTreeSet::from([c2.id()]));
        assert!(cache.peek(&c1).is_none());
        assert!(cache.peek(&c2).is_some());

        let fresh = DiffCache::new(&ws, lineage);
        let seeded = fresh.seed_from(&saved, &BTreeSet::from([c1.id()]));
        assert_eq!(seeded, 1);
        assert!(fresh.peek(&c1).is_some());
        assert!(fresh.peek(&c2).is_none());
        assert_eq!(fresh.seed_from(&saved, &BTreeSet::from([c1.id()])), 0);
    }
}
