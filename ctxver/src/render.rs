//! Terminal output for diff entries.

use ctxver_core::DiffEntry;

/// One `+added -deleted title` line per entry; with `full`, the unified
/// diff follows each line, indented.
pub fn print_entries(entries: &[DiffEntry], full: bool) {
    for entry in entries {
        println!("  {}", entry_line(entry));
        if full {
            for line in entry.diff.lines() {
                println!("    {}", line);
            }
        }
    }
}

pub fn entry_line(entry: &DiffEntry) -> String {
    format!(
        "+{} -{} {}",
        entry.lines_added,
        entry.lines_deleted,
        entry.title()
    )
}

/// Totals across entries, e.g. `2 file(s), +3 -1`
pub fn summary_line(entries: &[DiffEntry]) -> String {
    let added: usize = entries.iter().map(|e| e.lines_added).sum();
    let deleted: usize = entries.iter().map(|e| e.lines_deleted).sum();
    format!("{} fragment(s), +{} -{}", entries.len(), added, deleted)
}
