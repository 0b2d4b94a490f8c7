//! Integration tests for diffing context versions through the session cache

use ctxver_core::project::ProjectFile;
use ctxver_core::diff::Lineage;
use ctxver_core::services::{AnalysisTarget, CodeIntelligence, Resolution, TrackedSet};
use ctxver_core::{Context, ContextDelta, ContextHistory, DiffCache, Fragment, Workspace};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(10);

fn workspace() -> (TempDir, Arc<Workspace>) {
    let dir = tempfile::tempdir().unwrap();
    let workspace = Workspace::builder(dir.path()).build().unwrap();
    (dir, workspace)
}

/// Every analysis answer takes a while.
struct SlowIntelligence(Duration);

impl CodeIntelligence for SlowIntelligence {
    fn resolve(&self, target: &AnalysisTarget) -> Option<Resolution> {
        thread::sleep(self.0);
        Some(Resolution::new(format!("{:?}", target)))
    }
}

/// Unfrozen contexts in push order; the predecessor is the previous element.
#[derive(Default)]
struct ContextList(Mutex<Vec<Context>>);

impl ContextList {
    fn push(&self, context: Context) {
        self.0.lock().unwrap().push(context);
    }
}

impl Lineage for ContextList {
    fn previous_of(&self, context: &Context) -> Option<Context> {
        let list = self.0.lock().unwrap();
        let index = list.iter().position(|c| c.id() == context.id())?;
        index.checked_sub(1).map(|i| list[i].clone())
    }

    fn recent(&self, max: usize) -> Vec<Context> {
        self.0.lock().unwrap().iter().rev().take(max).cloned().collect()
    }
}

fn slow_workspace(delay: Duration) -> (TempDir, Arc<Workspace>) {
    let dir = tempfile::tempdir().unwrap();
    let ws = Workspace::builder(dir.path())
        .intelligence(Arc::new(SlowIntelligence(delay)))
        .build()
        .unwrap();
    (dir, ws)
}

#[test]
fn test_single_line_change_scenario() {
    let (dir, ws) = workspace();
    std::fs::write(dir.path().join("a.txt"), "hello").unwrap();
    let history = ContextHistory::new(Context::empty(&ws));

    history.push(|c0| c0.add_fragments([Fragment::project_path(&ws, "a.txt")]));
    std::fs::write(dir.path().join("a.txt"), "hello world").unwrap();
    let c2 = history.push(|c1| c1.copy_and_refresh(None)).unwrap();

    let entries = history.diff_cache().diff(&c2).await_timeout(WAIT).unwrap().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].title(), "a.txt");
    assert_eq!(entries[0].lines_added, 1);
    assert_eq!(entries[0].lines_deleted, 1);
    assert_eq!(entries[0].old_content, "hello");
    assert_eq!(entries[0].new_content, "hello world");
}

#[test]
fn test_diff_is_memoized() {
    let (dir, ws) = workspace();
    std::fs::write(dir.path().join("a.txt"), "one\n").unwrap();
    let history = ContextHistory::new(Context::empty(&ws));
    let c1 = history
        .push(|ctx| ctx.add_fragments([Fragment::project_path(&ws, "a.txt")]))
        .unwrap();
    let cache = history.diff_cache();

    let first = cache.diff(&c1);
    let second = cache.diff(&c1);
    assert_eq!(first.join().unwrap(), second.join().unwrap());
    assert_eq!(cache.computation_count(), 1);
    assert_eq!(cache.peek(&c1).unwrap().len(), 1);
}

#[test]
fn test_racing_callers_share_one_computation() {
    let (dir, ws) = workspace();
    std::fs::write(dir.path().join("a.txt"), "one\n").unwrap();
    let history = Arc::new(ContextHistory::new(Context::empty(&ws)));
    let c1 = history
        .push(|ctx| ctx.add_fragments([Fragment::project_path(&ws, "a.txt")]))
        .unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let history = Arc::clone(&history);
            let c1 = c1.clone();
            thread::spawn(move || history.diff_cache().diff(&c1).join().unwrap())
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(results.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(history.diff_cache().computation_count(), 1);
}

#[test]
fn test_invalidation_drops_in_flight_warm_up() {
    let dir = tempfile::tempdir().unwrap();
    let ws = Workspace::builder(dir.path())
        .intelligence(Arc::new(SlowIntelligence(Duration::from_millis(200))))
        .build()
        .unwrap();
    let history = ContextHistory::new(Context::empty(&ws));
    for method in ["a.B.one", "a.B.two", "a.B.three"] {
        let fragment = Fragment::code(&ws, method);
        history.push_live(history.top().add_fragments([fragment]));
    }
    let cache = history.diff_cache();

    let warm_up = cache.warm_up_recent(3);
    history.invalidate_diffs();
    let report = warm_up.await_timeout(WAIT).unwrap().unwrap();

    assert_eq!(report.published, 0);
    assert!(cache.is_empty());
    for ctx in history.contexts() {
        assert!(cache.peek(&ctx).is_none());
    }
}

#[test]
fn test_warm_up_fills_recent_entries() {
    let (dir, ws) = workspace();
    let history = ContextHistory::new(Context::empty(&ws));
    for name in ["a.txt", "b.txt", "c.txt", "d.txt"] {
        std::fs::write(dir.path().join(name), name).unwrap();
        history.push(|ctx| ctx.add_fragments([Fragment::project_path(&ws, name)]));
    }

    let report = history
        .diff_cache()
        .warm_up_recent(2)
        .await_timeout(WAIT)
        .unwrap()
        .unwrap();
    assert_eq!(report.published, 2);

    let contexts = history.contexts();
    let newest = &contexts[contexts.len() - 1];
    let entries = history.diff_cache().peek(newest).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].title(), "d.txt");
    assert!(history.diff_cache().peek(&contexts[1]).is_none());
}

#[test]
fn test_tracked_new_files_are_not_reported() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("tracked.rs"), "fn main() {}").unwrap();
    std::fs::write(dir.path().join("scratch.rs"), "fn scratch() {}").unwrap();
    let tracked = Arc::new(TrackedSet::new());
    tracked.track(ProjectFile::new(dir.path(), "tracked.rs"));
    let ws = Workspace::builder(dir.path()).tracked(tracked).build().unwrap();

    let history = ContextHistory::new(Context::empty(&ws));
    let c1 = history
        .push(|ctx| {
            ctx.add_fragments([
                Fragment::project_path(&ws, "tracked.rs"),
                Fragment::project_path(&ws, "scratch.rs"),
            ])
        })
        .unwrap();

    let entries = history.diff_cache().diff(&c1).join().unwrap();
    let titles: Vec<String> = entries.iter().map(|e| e.title()).collect();
    assert_eq!(titles, vec!["scratch.rs".to_string()]);
}

#[test]
fn test_truncation_prunes_cached_diffs() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = ctxver_core::Config::default();
    config.history.max_depth = 2;
    let ws = Workspace::builder(dir.path()).config(config).build().unwrap();
    let history = ContextHistory::new(Context::empty(&ws));

    let first = history
        .push(|ctx| ctx.add_fragments([Fragment::project_path(&ws, "a.txt")]))
        .unwrap();
    history.diff_cache().diff(&first).join().unwrap();
    assert_eq!(history.diff_cache().len(), 1);

    history.push(|ctx| ctx.add_fragments([Fragment::project_path(&ws, "b.txt")]));
    history.push(|ctx| ctx.add_fragments([Fragment::project_path(&ws, "c.txt")]));
    let live: BTreeSet<_> = history.contexts().iter().map(|c| c.id()).collect();
    assert!(!live.contains(&first.id()));
    assert!(history.diff_cache().peek(&first).is_none());
}

#[test]
fn test_delta_descriptions_follow_history() {
    let (_dir, ws) = workspace();
    let history = ContextHistory::new(Context::empty(&ws));
    history.push(|ctx| {
        ctx.add_fragments(["a.rs", "b.rs", "c.rs"].map(|n| Fragment::project_path(&ws, n)))
    });
    history.push(|ctx| ctx.remove_all());

    let contexts = history.contexts();
    let described: Vec<String> = contexts
        .windows(2)
        .map(|w| ContextDelta::between(&w[0], &w[1]).description())
        .collect();
    assert_eq!(described, vec!["Added a.rs, b.rs, 1 more", "Dropped all Context"]);
}

#[test]
fn test_diff_during_warm_up_shares_its_computation() {
    let (_dir, ws) = slow_workspace(Duration::from_millis(400));
    let lineage = Arc::new(ContextList::default());
    let c0 = Context::empty(&ws);
    let c1 = c0.add_fragments([Fragment::code(&ws, "a.B.run")]);
    lineage.push(c0);
    lineage.push(c1.clone());
    let cache = DiffCache::new(&ws, lineage);

    let warm_up = cache.warm_up_recent(1);
    thread::sleep(Duration::from_millis(100));
    let entries = cache.diff(&c1).join().unwrap();
    let report = warm_up.await_timeout(WAIT).unwrap().unwrap();

    assert_eq!(entries.len(), 1);
    assert_eq!(cache.computation_count(), 1);
    assert!(report.computed <= 1);
    assert_eq!(report.published, report.computed);
    assert_eq!(report.dropped, 0);
    assert_eq!(cache.peek(&c1), Some(entries));
}

#[test]
fn test_warm_up_skips_contexts_already_diffed() {
    let (dir, ws) = workspace();
    std::fs::write(dir.path().join("a.txt"), "one\n").unwrap();
    let history = ContextHistory::new(Context::empty(&ws));
    let c1 = history
        .push(|ctx| ctx.add_fragments([Fragment::project_path(&ws, "a.txt")]))
        .unwrap();
    let cache = history.diff_cache();
    cache.diff(&c1).join().unwrap();

    let report = cache.warm_up_recent(5).await_timeout(WAIT).unwrap().unwrap();
    assert_eq!(report.computed, 0);
    assert_eq!(report.published, 0);
    assert_eq!(cache.computation_count(), 1);
}

#[test]
fn test_freeze_waits_once_for_all_fragments() {
    let (_dir, ws) = slow_workspace(Duration::from_secs(2));
    let ctx = Context::empty(&ws).add_fragments(
        ["a.B.one", "a.B.two", "a.B.three", "a.B.four"].map(|m| Fragment::code(&ws, m)),
    );

    let started = Instant::now();
    let frozen = ctx.freeze(Duration::from_millis(300));

    assert_eq!(frozen, 0);
    assert!(
        started.elapsed() < Duration::from_millis(900),
        "freeze took {:?}",
        started.elapsed()
    );
}

#[test]
fn test_refresh_waits_once_for_all_fragments() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = ctxver_core::Config::default();
    config.diff.text_timeout_ms = 300;
    let ws = Workspace::builder(dir.path())
        .config(config)
        .intelligence(Arc::new(SlowIntelligence(Duration::from_secs(2))))
        .build()
        .unwrap();
    let ctx = Context::empty(&ws).add_fragments(
        ["a.B.one", "a.B.two", "a.B.three", "a.B.four"].map(|m| Fragment::code(&ws, m)),
    );

    let started = Instant::now();
    let refreshed = ctx.copy_and_refresh(None);

    assert_eq!(refreshed.id(), ctx.id());
    assert!(
        started.elapsed() < Duration::from_millis(900),
        "refresh took {:?}",
        started.elapsed()
    );
}

#[test]
fn test_truncation_forgets_diff_of_new_oldest_context() {
    let dir = tempfile::tempdir().unwrap();
    for name in ["a.txt", "b.txt"] {
        std::fs::write(dir.path().join(name), name).unwrap();
    }
    let mut config = ctxver_core::Config::default();
    config.history.max_depth = 2;
    let ws = Workspace::builder(dir.path()).config(config).build().unwrap();
    let history = ContextHistory::new(Context::empty(&ws));

    let first = history
        .push(|ctx| ctx.add_fragments([Fragment::project_path(&ws, "a.txt")]))
        .unwrap();
    assert_eq!(history.diff_cache().diff(&first).join().unwrap().len(), 1);

    history.push(|ctx| ctx.add_fragments([Fragment::project_path(&ws, "b.txt")]));
    assert_eq!(history.contexts()[0].id(), first.id());
    assert!(history.previous_of(&first).is_none());
    assert!(history.diff_cache().peek(&first).is_none());
    assert!(history.diff_cache().diff(&first).join().unwrap().is_empty());
}
