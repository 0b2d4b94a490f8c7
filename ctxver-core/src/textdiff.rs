//! Unified line diffs with added/deleted counts.

use crate::services::TextDiffer;
use similar::{ChangeTag, TextDiff as LineDiff};

/// Result of diffing two texts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextDiff {
    /// Unified diff, empty when the inputs are equal
    pub diff: String,
    pub lines_added: usize,
    pub lines_deleted: usize,
}

impl TextDiff {
    pub fn is_empty(&self) -> bool {
        self.diff.is_empty()
    }
}

/// Default [`TextDiffer`]: unified diff over lines.
#[derive(Debug, Clone)]
pub struct UnifiedDiffer {
    context_radius: usize,
}

impl UnifiedDiffer {
    pub fn new(context_radius: usize) -> Self {
        Self { context_radius }
    }
}

impl Default for UnifiedDiffer {
    fn default() -> Self {
        Self::new(3)
    }
}

impl TextDiffer for UnifiedDiffer {
    fn diff(&self, old: &str, new: &str, old_label: &str, new_label: &str) -> TextDiff {
        if old == new {
            return TextDiff::default();
        }

        let diff = LineDiff::from_lines(old, new);
        let mut lines_added = 0;
        let mut lines_deleted = 0;
        for change in diff.iter_all_changes() {
            match change.tag() {
                ChangeTag::Insert => lines_added += 1,
                ChangeTag::Delete => lines_deleted += 1,
                ChangeTag::Equal => {}
            }
        }

        let text = diff
            .unified_diff()
            .context_radius(self.context_radius)
            .header(old_label, new_label)
            .to_string();

        TextDiff {
            diff: text,
            lines_added,
            lines_deleted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_texts_have_empty_diff() {
        let diff = UnifiedDiffer::default().diff("same\n", "same\n", "old/a", "new/a");
        assert!(diff.is_empty());
        assert_eq!(diff.lines_added, 0);
        assert_eq!(diff.lines_deleted, 0);
    }

    #[test]
    fn test_single_line_change() {
        let diff = UnifiedDiffer::default().diff("hello", "hello world", "old/a.txt", "new/a.txt");
        assert_eq!(diff.lines_added, 1);
        assert_eq!(diff.lines_deleted, 1);
        assert!(diff.diff.contains("--- old/a.txt"));
        assert!(diff.diff.contains("+++ new/a.txt"));
        assert!(diff.diff.contains("+hello world"));
    }

    #[test]
    fn test_diff_against_empty() {
        let diff = UnifiedDiffer::default().diff("", "one\ntwo\n", "old/x", "new/x");
        assert_eq!(diff.lines_added, 2);
        assert_eq!(diff.lines_deleted, 0);
    }
}
