//! Structural differences between two context versions.

use crate::context::{Context, TaskEntry};
use crate::fragment::Fragment;

pub const CLEARED_TASK_HISTORY: &str = "Cleared Task History";
pub const DROPPED_ALL_CONTEXT: &str = "Dropped all Context";
pub const COMPRESSED_HISTORY: &str = "Compressed History";
pub const NO_CHANGES: &str = "(No changes)";

const MAX_TASK_SUMMARY: usize = 80;
const LISTED_FRAGMENTS: usize = 2;

/// What changed from one context to another, by fragment source.
#[derive(Debug, Clone, Default)]
pub struct ContextDelta {
    pub added_fragments: Vec<Fragment>,
    pub removed_fragments: Vec<Fragment>,
    /// Only set when the task history strictly grew
    pub added_tasks: Vec<TaskEntry>,
    pub cleared_history: bool,
    pub compressed_history: bool,
    pub session_reset: bool,
    all_removed: bool,
}

impl ContextDelta {
    pub fn between(from: &Context, to: &Context) -> Self {
        let added_fragments: Vec<Fragment> = to
            .fragments()
            .iter()
            .filter(|f| !from.fragments().iter().any(|g| g.has_same_source(f)))
            .cloned()
            .collect();
        let removed_fragments: Vec<Fragment> = from
            .fragments()
            .iter()
            .filter(|f| !to.fragments().iter().any(|g| g.has_same_source(f)))
            .cloned()
            .collect();

        let (old_tasks, new_tasks) = (from.task_history(), to.task_history());
        let added_tasks = if new_tasks.len() > old_tasks.len() {
            new_tasks[old_tasks.len()..].to_vec()
        } else {
            Vec::new()
        };
        let compressed = |tasks: &[TaskEntry]| tasks.iter().filter(|t| t.is_compressed()).count();

        Self {
            all_removed: !removed_fragments.is_empty() && to.fragments().is_empty(),
            added_fragments,
            removed_fragments,
            added_tasks,
            cleared_history: !old_tasks.is_empty() && new_tasks.is_empty(),
            compressed_history: !new_tasks.is_empty()
                && new_tasks.len() == old_tasks.len()
                && compressed(new_tasks) > compressed(old_tasks),
            session_reset: !from.is_empty() && to.is_empty(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added_fragments.is_empty()
            && self.removed_fragments.is_empty()
            && self.added_tasks.is_empty()
            && !self.cleared_history
            && !self.compressed_history
            && !self.session_reset
    }

    /// Human-readable summary, most significant change first.
    pub fn description(&self) -> String {
        if let Some(task) = self.added_tasks.last() {
            return summarize_task(task);
        }
        if !self.added_fragments.is_empty() {
            return describe_fragments("Added", &self.added_fragments);
        }
        if self.session_reset || self.all_removed {
            return DROPPED_ALL_CONTEXT.to_string();
        }
        if !self.removed_fragments.is_empty() {
            return describe_fragments("Removed", &self.removed_fragments);
        }
        if self.cleared_history {
            return CLEARED_TASK_HISTORY.to_string();
        }
        if self.compressed_history {
            return COMPRESSED_HISTORY.to_string();
        }
        NO_CHANGES.to_string()
    }
}

/// `"Added a.rs, b.rs, 3 more"`
pub(crate) fn describe_fragments(verb: &str, fragments: &[Fragment]) -> String {
    let names: Vec<String> = fragments
        .iter()
        .take(LISTED_FRAGMENTS)
        .map(Fragment::short_description_now)
        .collect();
    let mut text = format!("{} {}", verb, names.join(", "));
    if fragments.len() > LISTED_FRAGMENTS {
        text.push_str(&format!(", {} more", fragments.len() - LISTED_FRAGMENTS));
    }
    text
}

fn summarize_task(task: &TaskEntry) -> String {
    let flat = task.headline().replace(['\r', '\n'], " ");
    let flat = flat.trim();
    if flat.chars().count() <= MAX_TASK_SUMMARY {
        return flat.to_string();
    }
    let cut: String = flat.chars().take(MAX_TASK_SUMMARY - 3).collect();
    format!("{}...", cut)
}
