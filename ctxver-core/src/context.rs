//! Immutable, versioned workspace contexts.
//!
//! A [`Context`] is one snapshot of the workspace: an ordered fragment list
//! with no two fragments sharing a source, the task history, read-only and
//! pinned markers, and group metadata. Every operation returns a new
//! context with a fresh [`ContextId`] and shares untouched fragments with
//! its parent; documented no-ops return the receiver itself.
//!
//! ```text
//!   C0 (empty) ──add_fragments──▶ C1 ──copy_and_refresh──▶ C2 ──remove_fragments──▶ C3
//!                                  │
//!                                  └──set_read_only──▶ C1'
//! ```

use crate::cell::AsyncCell;
use crate::delta::{describe_fragments, CLEARED_TASK_HISTORY, COMPRESSED_HISTORY, DROPPED_ALL_CONTEXT};
use crate::diff::{diff_fragment_by, DiffOptions};
use crate::error::{Error, Result};
use crate::fragment::{Fragment, FragmentType, LATEST_BUILD_RESULTS};
use crate::ids::{ContextId, FragmentId};
use crate::project::ProjectFile;
use crate::services::Workspace;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Action shown while a context's action text is still being computed.
pub const SUMMARIZING: &str = "(Summarizing)";
/// Action of contexts produced by refreshing against changed files.
pub const LOAD_EXTERNAL_CHANGES: &str = "Load external changes";

const SESSION_START: &str = "Session start";

// ============================================
// Task history
// ============================================

/// One request/response pair in a context's task history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEntry {
    pub sequence: u32,
    pub description: String,
    /// Full conversation log, dropped once the entry is compressed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TaskEntry {
    pub fn new(sequence: u32, description: impl Into<String>, log: impl Into<String>) -> Self {
        Self {
            sequence,
            description: description.into(),
            log: Some(log.into()),
            summary: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.summary.is_some()
    }

    /// This entry with its log replaced by `summary`.
    pub fn compressed(&self, summary: impl Into<String>) -> Self {
        Self {
            log: None,
            summary: Some(summary.into()),
            ..self.clone()
        }
    }

    /// Summary if compressed, else the description.
    pub fn headline(&self) -> &str {
        self.summary.as_deref().unwrap_or(&self.description)
    }
}

// ============================================
// Diff entries
// ============================================

/// One fragment's content change between two context versions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffEntry {
    pub fragment: Fragment,
    pub diff: String,
    pub lines_added: usize,
    pub lines_deleted: usize,
    pub old_content: String,
    pub new_content: String,
}

impl DiffEntry {
    pub fn title(&self) -> String {
        self.fragment.short_description_now()
    }
}

// ============================================
// Context
// ============================================

/// One immutable version of the workspace.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextState>,
}

#[derive(Clone)]
struct ContextState {
    id: ContextId,
    workspace: Arc<Workspace>,
    fragments: Vec<Fragment>,
    task_history: Vec<TaskEntry>,
    read_only: BTreeSet<FragmentId>,
    pinned: BTreeSet<FragmentId>,
    group_id: Option<Uuid>,
    group_label: Option<String>,
    parsed_output: Option<Fragment>,
    action: AsyncCell<String>,
}

/// Everything needed to rebuild a context under its original id.
pub struct ContextParts {
    pub id: ContextId,
    pub fragments: Vec<Fragment>,
    pub task_history: Vec<TaskEntry>,
    pub read_only: BTreeSet<FragmentId>,
    pub pinned: BTreeSet<FragmentId>,
    pub group_id: Option<Uuid>,
    pub group_label: Option<String>,
    pub parsed_output: Option<Fragment>,
    pub action: String,
}

/// Referenced files of each fragment, all resolved against one deadline.
fn referenced_files_of(fragments: &[&Fragment]) -> Vec<BTreeSet<ProjectFile>> {
    for fragment in fragments {
        fragment.start_files();
    }
    let timeout = fragments
        .iter()
        .map(|f| f.resolution_timeout())
        .max()
        .unwrap_or_default();
    let deadline = Instant::now() + timeout;
    fragments
        .iter()
        .map(|f| f.referenced_files_until(deadline))
        .collect()
}

fn action_cell(action: impl Into<String>) -> AsyncCell<String> {
    AsyncCell::completed("context:action", action.into())
}

impl Context {
    /// The root of every session.
    pub fn empty(workspace: &Arc<Workspace>) -> Self {
        Self {
            inner: Arc::new(ContextState {
                id: ContextId::new(),
                workspace: Arc::clone(workspace),
                fragments: Vec::new(),
                task_history: Vec::new(),
                read_only: BTreeSet::new(),
                pinned: BTreeSet::new(),
                group_id: None,
                group_label: None,
                parsed_output: None,
                action: action_cell(SESSION_START),
            }),
        }
    }

    /// Rebuild a persisted context. Markers for absent fragments are dropped.
    pub fn from_parts(workspace: &Arc<Workspace>, parts: ContextParts) -> Self {
        let present: BTreeSet<FragmentId> = parts.fragments.iter().map(|f| f.id().clone()).collect();
        Self {
            inner: Arc::new(ContextState {
                id: parts.id,
                workspace: Arc::clone(workspace),
                read_only: parts.read_only.intersection(&present).cloned().collect(),
                pinned: parts.pinned.intersection(&present).cloned().collect(),
                fragments: parts.fragments,
                task_history: parts.task_history,
                group_id: parts.group_id,
                group_label: parts.group_label,
                parsed_output: parts.parsed_output,
                action: action_cell(parts.action),
            }),
        }
    }

    /// Derive a child: copy, give it a new id and action, apply `edit`.
    fn derive(&self, action: AsyncCell<String>, edit: impl FnOnce(&mut ContextState)) -> Context {
        let mut next = (*self.inner).clone();
        next.id = ContextId::new();
        next.action = action;
        edit(&mut next);

        let present: BTreeSet<FragmentId> = next.fragments.iter().map(|f| f.id().clone()).collect();
        next.read_only.retain(|id| present.contains(id));
        next.pinned.retain(|id| present.contains(id));

        Context {
            inner: Arc::new(next),
        }
    }

    // ============================================
    // Accessors
    // ============================================

    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    pub fn workspace(&self) -> &Arc<Workspace> {
        &self.inner.workspace
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.inner.fragments
    }

    pub fn task_history(&self) -> &[TaskEntry] {
        &self.inner.task_history
    }

    pub fn group_id(&self) -> Option<Uuid> {
        self.inner.group_id
    }

    pub fn group_label(&self) -> Option<&str> {
        self.inner.group_label.as_deref()
    }

    pub fn parsed_output(&self) -> Option<&Fragment> {
        self.inner.parsed_output.as_ref()
    }

    /// The action that produced this context. Never blocks.
    pub fn action(&self) -> String {
        self.inner
            .action
            .peek()
            .unwrap_or_else(|| SUMMARIZING.to_string())
    }

    pub fn action_cell(&self) -> AsyncCell<String> {
        self.inner.action.clone()
    }

    pub fn read_only_fragments(&self) -> Vec<Fragment> {
        self.filter(|f| self.inner.read_only.contains(f.id()))
    }

    pub fn pinned_fragments(&self) -> Vec<Fragment> {
        self.filter(|f| self.inner.pinned.contains(f.id()))
    }

    pub fn is_read_only(&self, fragment: &Fragment) -> bool {
        self.inner.read_only.contains(fragment.id())
    }

    pub fn is_pinned(&self, fragment: &Fragment) -> bool {
        self.inner.pinned.contains(fragment.id())
    }

    pub fn contains(&self, fragment: &Fragment) -> bool {
        self.inner.fragments.iter().any(|f| f.id() == fragment.id())
    }

    /// Editable fragments not marked read-only, in fragment order.
    pub fn editable_fragments(&self) -> Vec<Fragment> {
        self.filter(|f| f.fragment_type().is_editable() && !self.is_read_only(f))
    }

    /// Fragments the model may read but not edit.
    pub fn read_only_view(&self) -> Vec<Fragment> {
        self.filter(|f| !f.fragment_type().is_editable() || self.is_read_only(f))
    }

    pub fn path_fragments(&self) -> Vec<Fragment> {
        self.filter(|f| f.fragment_type().is_path())
    }

    pub fn find_with_same_source(&self, fragment: &Fragment) -> Option<Fragment> {
        self.inner
            .fragments
            .iter()
            .find(|f| f.has_same_source(fragment))
            .cloned()
    }

    pub fn find_by_id(&self, id: &FragmentId) -> Result<Fragment> {
        self.inner
            .fragments
            .iter()
            .find(|f| f.id() == id)
            .cloned()
            .ok_or_else(|| Error::FragmentNotFound(id.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.inner.fragments.is_empty() && self.inner.task_history.is_empty()
    }

    pub fn contains_dynamic_fragments(&self) -> bool {
        self.inner.fragments.iter().any(Fragment::is_dynamic)
    }

    pub fn next_task_sequence(&self) -> u32 {
        self.inner
            .task_history
            .last()
            .map_or(1, |entry| entry.sequence + 1)
    }

    fn filter(&self, keep: impl Fn(&Fragment) -> bool) -> Vec<Fragment> {
        self.inner.fragments.iter().filter(|f| keep(f)).cloned().collect()
    }

    // ============================================
    // Fragment operations
    // ============================================

    /// Add fragments, deduplicating by source.
    ///
    /// Incoming full-content path fragments supersede existing summaries of
    /// the same files. Returns `self` when nothing new remains to add.
    ///
    /// # Blocking
    ///
    /// May wait (bounded) for the files of class summaries when promoting.
    pub fn add_fragments(&self, to_add: impl IntoIterator<Item = Fragment>) -> Context {
        let mut incoming: Vec<Fragment> = Vec::new();
        for fragment in to_add {
            if !incoming.iter().any(|f| f.has_same_source(&fragment)) {
                incoming.push(fragment);
            }
        }
        if incoming.is_empty() {
            return self.clone();
        }

        let promoted: BTreeSet<ProjectFile> = incoming
            .iter()
            .filter(|f| f.fragment_type().is_path())
            .filter_map(|f| f.kind().static_files())
            .flatten()
            .collect();

        let summaries: Vec<&Fragment> = if promoted.is_empty() {
            Vec::new()
        } else {
            self.inner
                .fragments
                .iter()
                .filter(|f| f.fragment_type() == FragmentType::Skeleton)
                .collect()
        };
        let superseded_ids: BTreeSet<FragmentId> = summaries
            .iter()
            .zip(referenced_files_of(&summaries))
            .filter(|(_, files)| !files.is_disjoint(&promoted))
            .map(|(f, _)| f.id().clone())
            .collect();
        let survivors: Vec<Fragment> = self.filter(|f| !superseded_ids.contains(f.id()));

        let additions: Vec<Fragment> = incoming
            .into_iter()
            .filter(|f| !survivors.iter().any(|s| s.has_same_source(f)))
            .collect();
        if additions.is_empty() {
            return self.clone();
        }

        let superseded = self.inner.fragments.len() - survivors.len();
        if superseded > 0 {
            tracing::debug!(superseded, "Full file fragments replaced summaries");
        }

        let action = action_cell(describe_fragments("Added", &additions));
        self.derive(action, move |next| {
            next.fragments = survivors;
            next.fragments.extend(additions);
        })
    }

    /// Remove fragments by id. Returns `self` if none of them are present.
    pub fn remove_fragments(&self, to_remove: &[Fragment]) -> Context {
        let ids: BTreeSet<&FragmentId> = to_remove.iter().map(Fragment::id).collect();
        let removed: Vec<Fragment> = self.filter(|f| ids.contains(f.id()));
        if removed.is_empty() {
            return self.clone();
        }

        let action = if removed.len() == self.inner.fragments.len() {
            action_cell(DROPPED_ALL_CONTEXT)
        } else {
            action_cell(describe_fragments("Removed", &removed))
        };
        self.derive(action, |next| {
            next.fragments.retain(|f| !ids.contains(f.id()));
        })
    }

    /// Drop every fragment and the task history.
    pub fn remove_all(&self) -> Context {
        self.derive(action_cell(DROPPED_ALL_CONTEXT), |next| {
            next.fragments.clear();
            next.task_history.clear();
            next.parsed_output = None;
        })
    }

    /// Mark or unmark `fragment` read-only.
    ///
    /// # Panics
    ///
    /// If `fragment` is not in this context.
    pub fn set_read_only(&self, fragment: &Fragment, read_only: bool) -> Context {
        assert!(
            self.contains(fragment),
            "set_read_only: fragment {} is not in context {}",
            fragment.id(),
            self.id()
        );
        let verb = if read_only { "Set read-only" } else { "Unset read-only" };
        let action = action_cell(format!("{} {}", verb, fragment.short_description_now()));
        let id = fragment.id().clone();
        self.derive(action, move |next| {
            if read_only {
                next.read_only.insert(id);
            } else {
                next.read_only.remove(&id);
            }
        })
    }

    /// Pin or unpin `fragment`.
    ///
    /// # Panics
    ///
    /// If `fragment` is not in this context.
    pub fn with_pinned(&self, fragment: &Fragment, pinned: bool) -> Context {
        assert!(
            self.contains(fragment),
            "with_pinned: fragment {} is not in context {}",
            fragment.id(),
            self.id()
        );
        let verb = if pinned { "Pin" } else { "Unpin" };
        let action = action_cell(format!("{} {}", verb, fragment.short_description_now()));
        let id = fragment.id().clone();
        self.derive(action, move |next| {
            if pinned {
                next.pinned.insert(id);
            } else {
                next.pinned.remove(&id);
            }
        })
    }

    /// Refresh fragments whose files changed (all of them for `None`).
    ///
    /// A refreshed copy replaces its original only when the content really
    /// differs; read-only and pinned markers follow the replacement. Returns
    /// `self` when nothing was replaced.
    ///
    /// # Blocking
    ///
    /// Materializes old and new content concurrently, bounded in total by
    /// the diff text timeout.
    pub fn copy_and_refresh(&self, changed: Option<&BTreeSet<ProjectFile>>) -> Context {
        let current = &self.inner.fragments;
        let affected: Vec<bool> = match changed {
            None => vec![true; current.len()],
            Some(files) => {
                let all: Vec<&Fragment> = current.iter().collect();
                referenced_files_of(&all)
                    .iter()
                    .map(|refs| !refs.is_disjoint(files))
                    .collect()
            }
        };

        let candidates: Vec<(usize, Fragment)> = current
            .iter()
            .enumerate()
            .filter(|(i, _)| affected[*i])
            .map(|(i, f)| (i, f.refresh_copy()))
            .filter(|(i, fresh)| !fresh.ptr_eq(&current[*i]))
            .collect();
        for (i, fresh) in &candidates {
            current[*i].start_content();
            fresh.start_content();
        }

        let options = DiffOptions::from_workspace(&self.inner.workspace);
        let deadline = Instant::now() + options.text_timeout;
        let mut replaced: HashMap<FragmentId, FragmentId> = HashMap::new();
        let mut fragments = current.clone();
        for (i, fresh) in candidates {
            let old = &current[i];
            if diff_fragment_by(Some(old), &fresh, deadline).is_none() {
                continue;
            }
            replaced.insert(old.id().clone(), fresh.id().clone());
            fragments[i] = fresh;
        }

        if replaced.is_empty() {
            return self.clone();
        }

        tracing::debug!(
            context_id = %self.id(),
            replaced = replaced.len(),
            "Refreshed fragments from changed sources"
        );

        let remap = |ids: &BTreeSet<FragmentId>| -> BTreeSet<FragmentId> {
            ids.iter()
                .map(|id| replaced.get(id).cloned().unwrap_or_else(|| id.clone()))
                .collect()
        };
        let read_only = remap(&self.inner.read_only);
        let pinned = remap(&self.inner.pinned);

        self.derive(action_cell(LOAD_EXTERNAL_CHANGES), move |next| {
            next.fragments = fragments;
            next.read_only = read_only;
            next.pinned = pinned;
        })
    }

    /// Merge `other` into this context; this context wins on conflicts.
    pub fn union(&self, other: &Context) -> Context {
        self.add_fragments(other.fragments().iter().cloned())
    }

    // ============================================
    // History and metadata
    // ============================================

    pub fn add_history_entry(
        &self,
        entry: TaskEntry,
        parsed_output: Option<Fragment>,
        action: AsyncCell<String>,
    ) -> Context {
        self.derive(action, move |next| {
            next.task_history.push(entry);
            next.parsed_output = parsed_output;
        })
    }

    pub fn clear_history(&self) -> Context {
        self.derive(action_cell(CLEARED_TASK_HISTORY), |next| {
            next.task_history.clear();
            next.parsed_output = None;
        })
    }

    pub fn with_compressed_history(&self, entries: Vec<TaskEntry>) -> Context {
        self.derive(action_cell(COMPRESSED_HISTORY), move |next| {
            next.task_history = entries;
        })
    }

    pub fn with_group(&self, group_id: Option<Uuid>, group_label: Option<String>) -> Context {
        let action = self.inner.action.clone();
        self.derive(action, move |next| {
            next.group_id = group_id;
            next.group_label = group_label;
        })
    }

    pub fn with_action(&self, action: AsyncCell<String>) -> Context {
        self.derive(action, |_| {})
    }

    pub fn with_parsed_output(&self, parsed_output: Option<Fragment>, action: AsyncCell<String>) -> Context {
        self.derive(action, move |next| {
            next.parsed_output = parsed_output;
        })
    }

    /// Replace build output: drop earlier build fragments and, on failure,
    /// add the output as the "Latest Build Results" fragment.
    pub fn with_build_result(&self, success: bool, output: &str) -> Context {
        let workspace = Arc::clone(&self.inner.workspace);
        let failure = (!success).then(|| Fragment::string(&workspace, LATEST_BUILD_RESULTS, output, "none"));
        let action = if success { "Build succeeded" } else { "Build failed" };

        self.derive(action_cell(action), move |next| {
            next.fragments.retain(|f| {
                f.fragment_type() != FragmentType::BuildLog
                    && f.kind().singleton_description() != Some(LATEST_BUILD_RESULTS)
            });
            next.fragments.extend(failure);
        })
    }

    /// Freeze every fragment's current content. Returns how many are frozen.
    ///
    /// # Blocking
    ///
    /// Up to `timeout` in total; all fragments materialize concurrently.
    pub fn freeze(&self, timeout: Duration) -> usize {
        for fragment in &self.inner.fragments {
            fragment.start_content();
        }
        let deadline = Instant::now() + timeout;
        self.inner
            .fragments
            .iter()
            .filter(|f| f.freeze_until(deadline))
            .count()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("fragments", &self.inner.fragments.len())
            .field("tasks", &self.inner.task_history.len())
            .field("action", &self.action())
            .finish()
    }
}
