//! Session history: the append-only list of contexts plus undo/redo.
//!
//! ```text
//!   history: [C0, C1, C2, C3]   ← top
//!   redo:    []
//!
//!   undo(2)  → history: [C0, C1]      redo: [C3, C2]
//!   redo()   → history: [C0, C1, C2]  redo: [C3]
//!   push(..) → redo cleared
//! ```
//!
//! Every pushed context is frozen first, so walking back through history
//! shows content as it was, not as it is on disk now.

use crate::cell::AsyncCell;
use crate::context::{Context, LOAD_EXTERNAL_CHANGES};
use crate::diff::{DiffCache, Lineage};
use crate::ids::ContextId;
use crate::project::ProjectFile;
use crate::services::Workspace;
use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Outcome of an undo request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UndoResult {
    pub undone: bool,
    pub steps: usize,
}

impl UndoResult {
    fn none() -> Self {
        Self {
            undone: false,
            steps: 0,
        }
    }
}

struct HistoryState {
    history: VecDeque<Context>,
    redo: Vec<Context>,
    selected: Option<ContextId>,
}

struct HistoryLog {
    state: Mutex<HistoryState>,
}

impl HistoryLog {
    fn state(&self) -> MutexGuard<'_, HistoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Lineage for HistoryLog {
    fn previous_of(&self, context: &Context) -> Option<Context> {
        let state = self.state();
        let index = state.history.iter().position(|c| c.id() == context.id())?;
        index.checked_sub(1).and_then(|i| state.history.get(i).cloned())
    }

    fn recent(&self, max: usize) -> Vec<Context> {
        self.state().history.iter().rev().take(max).cloned().collect()
    }
}

/// Owner of a session's contexts and its diff cache.
pub struct ContextHistory {
    workspace: Arc<Workspace>,
    log: Arc<HistoryLog>,
    diffs: DiffCache,
}

impl ContextHistory {
    /// A history holding just `initial` (frozen).
    pub fn new(initial: Context) -> Self {
        Self::from_parts(vec![initial], Vec::new(), None)
    }

    /// Rebuild a history; `contexts` oldest first, `redo` in stack order.
    ///
    /// # Panics
    ///
    /// If `contexts` is empty.
    pub fn from_parts(contexts: Vec<Context>, redo: Vec<Context>, selected: Option<ContextId>) -> Self {
        assert!(!contexts.is_empty(), "a context history needs at least one context");
        let workspace = Arc::clone(contexts[0].workspace());
        let timeout = workspace.timeouts().snapshot;
        for context in &contexts {
            context.freeze(timeout);
        }

        let selected = selected
            .filter(|id| contexts.iter().any(|c| c.id() == *id))
            .or_else(|| contexts.last().map(Context::id));
        let log = Arc::new(HistoryLog {
            state: Mutex::new(HistoryState {
                history: contexts.into(),
                redo,
                selected,
            }),
        });
        let diffs = DiffCache::new(&workspace, log.clone());

        Self {
            workspace,
            log,
            diffs,
        }
    }

    pub fn workspace(&self) -> &Arc<Workspace> {
        &self.workspace
    }

    pub fn top(&self) -> Context {
        let state = self.log.state();
        match state.history.back() {
            Some(top) => top.clone(),
            None => Context::empty(&self.workspace),
        }
    }

    /// Oldest first.
    pub fn contexts(&self) -> Vec<Context> {
        self.log.state().history.iter().cloned().collect()
    }

    /// Redo stack, next redo last.
    pub fn redo_stack(&self) -> Vec<Context> {
        self.log.state().redo.clone()
    }

    pub fn len(&self) -> usize {
        self.log.state().history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.state().history.is_empty()
    }

    pub fn previous_of(&self, context: &Context) -> Option<Context> {
        self.log.previous_of(context)
    }

    /// Apply `edit` to the top context and push the result.
    ///
    /// Returns `None` when `edit` was a no-op (returned the top itself).
    ///
    /// # Blocking
    ///
    /// Freezes the new context's fragments; see [`ContextHistory::push_live`].
    pub fn push(&self, edit: impl FnOnce(&Context) -> Context) -> Option<Context> {
        let top = self.top();
        let next = edit(&top);
        if next.id() == top.id() {
            tracing::debug!(context_id = %top.id(), "Push was a no-op");
            return None;
        }
        self.push_live(next.clone());
        Some(next)
    }

    /// Freeze and append `context`, clear redo, select it, and truncate.
    ///
    /// # Blocking
    ///
    /// Up to the snapshot timeout per fragment still materializing.
    pub fn push_live(&self, context: Context) {
        let frozen = context.freeze(self.workspace.timeouts().snapshot);
        let max_depth = self.workspace.config().history.max_depth;

        let (truncated, live, head) = {
            let mut state = self.log.state();
            state.history.push_back(context.clone());
            state.redo.clear();
            state.selected = Some(context.id());

            let mut truncated = 0;
            while state.history.len() > max_depth {
                state.history.pop_front();
                truncated += 1;
            }
            let live: BTreeSet<ContextId> = state.history.iter().map(Context::id).collect();
            (truncated, live, state.history.front().map(Context::id))
        };

        if truncated > 0 {
            self.diffs.retain_only(&live);
            // The new oldest context has no predecessor left to diff against.
            if let Some(head) = head {
                self.diffs.forget(head);
            }
        }
        tracing::info!(
            context_id = %context.id(),
            action = %context.action(),
            frozen,
            truncated,
            "Pushed context"
        );
    }

    /// Replace the newest context, coalescing rapid changes.
    ///
    /// # Blocking
    ///
    /// Freezes `context` like [`ContextHistory::push_live`].
    pub fn replace_top(&self, context: Context) {
        context.freeze(self.workspace.timeouts().snapshot);
        let live = {
            let mut state = self.log.state();
            state.history.pop_back();
            state.history.push_back(context.clone());
            state.selected = Some(context.id());
            state.history.iter().map(Context::id).collect::<BTreeSet<_>>()
        };
        self.diffs.retain_only(&live);
        tracing::info!(context_id = %context.id(), action = %context.action(), "Replaced top context");
    }

    /// Move up to `steps` contexts onto the redo stack, keeping at least one.
    pub fn undo(&self, steps: usize) -> UndoResult {
        let mut state = self.log.state();
        let steps = steps.min(state.history.len().saturating_sub(1));
        if steps == 0 {
            return UndoResult::none();
        }
        for _ in 0..steps {
            if let Some(context) = state.history.pop_back() {
                state.redo.push(context);
            }
        }
        state.selected = state.history.back().map(Context::id);
        tracing::info!(steps, "Undo");
        UndoResult { undone: true, steps }
    }

    /// Undo until `target` is the top context.
    pub fn undo_until(&self, target: &Context) -> UndoResult {
        let steps = {
            let state = self.log.state();
            match state.history.iter().position(|c| c.id() == target.id()) {
                Some(index) => state.history.len() - 1 - index,
                None => return UndoResult::none(),
            }
        };
        self.undo(steps)
    }

    /// Re-apply the most recently undone context.
    pub fn redo(&self) -> bool {
        let mut state = self.log.state();
        let Some(context) = state.redo.pop() else {
            return false;
        };
        state.selected = Some(context.id());
        state.history.push_back(context);
        true
    }

    pub fn has_undo(&self) -> bool {
        self.log.state().history.len() > 1
    }

    pub fn has_redo(&self) -> bool {
        !self.log.state().redo.is_empty()
    }

    pub fn selected(&self) -> Option<Context> {
        let state = self.log.state();
        let id = state.selected?;
        state.history.iter().find(|c| c.id() == id).cloned()
    }

    /// Select a context in history. Returns false if it is not there.
    pub fn set_selected(&self, context: &Context) -> bool {
        let mut state = self.log.state();
        if !state.history.iter().any(|c| c.id() == context.id()) {
            return false;
        }
        state.selected = Some(context.id());
        true
    }

    /// Refresh the top context against `changed` files.
    ///
    /// Returns the new top, or `None` if no fragment content changed.
    /// Consecutive loads coalesce into one entry labelled with a count.
    ///
    /// # Blocking
    ///
    /// Re-reads affected fragments and freezes the result.
    pub fn process_external_file_changes(&self, changed: &BTreeSet<ProjectFile>) -> Option<Context> {
        let top = self.top();
        let refreshed = top.copy_and_refresh(Some(changed));
        if refreshed.id() == top.id() {
            return None;
        }

        match load_count(&top.action()) {
            Some(loads) => {
                let label = format!("{} ({})", LOAD_EXTERNAL_CHANGES, loads + 1);
                let coalesced = refreshed.with_action(AsyncCell::completed("context:action", label));
                self.replace_top(coalesced.clone());
                Some(coalesced)
            }
            None => {
                self.push_live(refreshed.clone());
                Some(refreshed)
            }
        }
    }

    pub fn diff_cache(&self) -> &DiffCache {
        &self.diffs
    }

    /// Session switch: drop cached diffs and orphan running warm-ups.
    pub fn invalidate_diffs(&self) {
        self.diffs.invalidate();
    }
}

/// `"Load external changes"` → 1, `"Load external changes (4)"` → 4.
fn load_count(action: &str) -> Option<usize> {
    let rest = action.strip_prefix(LOAD_EXTERNAL_CHANGES)?;
    if rest.is_empty() {
        return Some(1);
    }
    rest.strip_prefix(" (")?.strip_suffix(')')?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::fragment::Fragment;
    use std::time::Duration;
    use tempfile::TempDir;

    fn workspace_with_depth(max_depth: usize) -> (TempDir, Arc<Workspace>) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.history.max_depth = max_depth;
        let workspace = Workspace::builder(dir.path()).config(config).build().unwrap();
        (dir, workspace)
    }

    fn add(ws: &Arc<Workspace>, name: &str) -> impl FnOnce(&Context) -> Context {
        let fragment = Fragment::project_path(ws, name);
        move |ctx: &Context| ctx.add_fragments([fragment])
    }

    #[test]
    fn test_push_freezes_and_skips_no_ops() {
        let (dir, ws) = workspace_with_depth(10);
        std::fs::write(dir.path().join("a.txt"), "v1").unwrap();
        let history = ContextHistory::new(Context::empty(&ws));

        let pushed = history.push(add(&ws, "a.txt")).unwrap();
        assert!(pushed.fragments()[0].is_frozen());
        assert_eq!(history.len(), 2);

        assert!(history.push(|ctx| ctx.clone()).is_none());
        assert_eq!(history.len(), 2);
        assert_eq!(history.selected().unwrap().id(), pushed.id());
    }

    #[test]
    fn test_truncates_to_max_depth() {
        let (_dir, ws) = workspace_with_depth(3);
        let history = ContextHistory::new(Context::empty(&ws));
        for name in ["a", "b", "c", "d"] {
            history.push(add(&ws, name));
        }

        assert_eq!(history.len(), 3);
        let contexts = history.contexts();
        assert!(history.previous_of(&contexts[0]).is_none());
        assert_eq!(history.previous_of(&contexts[2]).unwrap().id(), contexts[1].id());
    }

    #[test]
    fn test_undo_redo() {
        let (_dir, ws) = workspace_with_depth(10);
        let root = Context::empty(&ws);
        let history = ContextHistory::new(root.clone());
        let c1 = history.push(add(&ws, "a")).unwrap();
        let c2 = history.push(add(&ws, "b")).unwrap();

        assert_eq!(history.undo(5), UndoResult { undone: true, steps: 2 });
        assert_eq!(history.top().id(), root.id());
        assert!(!history.undo(1).undone);

        assert!(history.redo());
        assert_eq!(history.top().id(), c1.id());
        assert!(history.has_redo());

        history.push(add(&ws, "c"));
        assert!(!history.has_redo());
        assert!(!history.redo());
        assert!(!history.contexts().iter().any(|c| c.id() == c2.id()));
    }

    #[test]
    fn test_undo_until() {
        let (_dir, ws) = workspace_with_depth(10);
        let history = ContextHistory::new(Context::empty(&ws));
        let c1 = history.push(add(&ws, "a")).unwrap();
        history.push(add(&ws, "b"));
        history.push(add(&ws, "c"));

        assert_eq!(history.undo_until(&c1).steps, 2);
        assert_eq!(history.top().id(), c1.id());
        assert!(!history.undo_until(&Context::empty(&ws)).undone);
    }

    #[test]
    fn test_selection() {
        let (_dir, ws) = workspace_with_depth(10);
        let root = Context::empty(&ws);
        let history = ContextHistory::new(root.clone());
        history.push(add(&ws, "a"));

        assert!(history.set_selected(&root));
        assert_eq!(history.selected().unwrap().id(), root.id());
        assert!(!history.set_selected(&Context::empty(&ws)));
    }

    #[test]
    fn test_external_changes_coalesce() {
        let (dir, ws) = workspace_with_depth(10);
        std::fs::write(dir.path().join("a.txt"), "v1").unwrap();
        let history = ContextHistory::new(Context::empty(&ws));
        history.push(add(&ws, "a.txt"));
        let changed = BTreeSet::from([ws.project_file("a.txt")]);

        assert!(history.process_external_file_changes(&changed).is_none());

        std::fs::write(dir.path().join("a.txt"), "v2").unwrap();
        let first = history.process_external_file_changes(&changed).unwrap();
        assert_eq!(first.action(), LOAD_EXTERNAL_CHANGES);
        assert_eq!(history.len(), 3);

        std::fs::write(dir.path().join("a.txt"), "v3").unwrap();
        let second = history.process_external_file_changes(&changed).unwrap();
        assert_eq!(second.action(), "Load external changes (2)");
        assert_eq!(history.len(), 3);
        assert_eq!(
            second.fragments()[0].text().await_timeout(Duration::from_secs(5)).unwrap().as_deref(),
            Some("v3")
        );
    }

    #[test]
    fn test_load_count() {
        assert_eq!(load_count("Load external changes"), Some(1));
        assert_eq!(load_count("Load external changes (7)"), Some(7));
        assert_eq!(load_count("Added a.rs"), None);
    }
}
