//! Materialized fragment content and how each kind derives it.

use super::kind::FragmentKind;
use crate::project::{CodeUnit, ProjectFile};
use crate::services::Workspace;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Text of image fragments; the bytes travel out of band.
pub const IMAGE_PLACEHOLDER_TEXT: &str = "[Image content provided out of band]";

/// The materialized result of deriving a fragment.
///
/// `valid == false` means the source disappeared (a deleted file, say);
/// the other fields are then empty rather than an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentSnapshot {
    pub text: String,
    pub sources: BTreeSet<CodeUnit>,
    pub files: BTreeSet<ProjectFile>,
    pub image_bytes: Option<Arc<[u8]>>,
    pub valid: bool,
}

impl ContentSnapshot {
    pub fn text(text: String, files: BTreeSet<ProjectFile>) -> Self {
        Self {
            text,
            sources: BTreeSet::new(),
            files,
            image_bytes: None,
            valid: true,
        }
    }

    pub fn missing(files: BTreeSet<ProjectFile>) -> Self {
        Self {
            valid: false,
            ..Self::text(String::new(), files)
        }
    }
}

/// Derive a snapshot from live sources. Blocking; runs on the fragment pool.
pub(crate) fn compute_live(kind: &FragmentKind, workspace: &Workspace) -> ContentSnapshot {
    if let Some(snapshot) = kind.static_snapshot() {
        return snapshot;
    }
    let static_files = kind.static_files().unwrap_or_default();

    match kind {
        FragmentKind::ProjectPath { file } => {
            let Some(bytes) = workspace.files().read(&file.abs_path()) else {
                return ContentSnapshot::missing(static_files);
            };
            let mut snapshot =
                ContentSnapshot::text(String::from_utf8_lossy(&bytes).into_owned(), static_files);
            snapshot.sources = resolve_symbols(kind, workspace);
            snapshot
        }
        FragmentKind::ExternalPath { path } => match workspace.files().read(path) {
            Some(bytes) => {
                ContentSnapshot::text(String::from_utf8_lossy(&bytes).into_owned(), static_files)
            }
            None => ContentSnapshot::missing(static_files),
        },
        FragmentKind::ImageFile { file } => {
            let bytes = workspace
                .files()
                .read(&file.abs_path())
                .filter(|b| !b.is_empty());
            ContentSnapshot {
                text: IMAGE_PLACEHOLDER_TEXT.to_string(),
                sources: BTreeSet::new(),
                files: static_files,
                valid: bytes.is_some(),
                image_bytes: bytes.map(Arc::from),
            }
        }
        _ => {
            let Some(target) = kind.analysis_target() else {
                return ContentSnapshot::text(String::new(), static_files);
            };
            match workspace.intelligence().resolve(&target) {
                Some(resolution) => {
                    let mut files = resolution.files;
                    files.extend(static_files);
                    ContentSnapshot {
                        text: resolution.text,
                        sources: resolution.symbols,
                        files,
                        image_bytes: None,
                        valid: true,
                    }
                }
                None => {
                    tracing::debug!(analysis = ?target, "Code intelligence unavailable");
                    let valid = static_files
                        .iter()
                        .all(|f| workspace.files().exists(&f.abs_path()));
                    ContentSnapshot {
                        valid,
                        ..ContentSnapshot::text(String::new(), static_files)
                    }
                }
            }
        }
    }
}

/// Frozen bytes as text.
pub(crate) fn decode_text(frozen: &[u8]) -> String {
    String::from_utf8_lossy(frozen).into_owned()
}

/// Rebuild a snapshot around frozen bytes. Text comes from the buffer;
/// symbols and files are re-derived from the payload where they can be.
///
/// # Blocking
///
/// May consult code intelligence for symbols and files. Readers of the
/// frozen text never wait on this; see `Fragment::text`.
pub(crate) fn decode_frozen(
    kind: &FragmentKind,
    frozen: &Arc<[u8]>,
    workspace: &Workspace,
) -> ContentSnapshot {
    let base = kind.static_snapshot();
    if !kind.fragment_type().is_text() {
        let files = kind.static_files().unwrap_or_default();
        return ContentSnapshot {
            text: IMAGE_PLACEHOLDER_TEXT.to_string(),
            sources: BTreeSet::new(),
            files,
            image_bytes: Some(Arc::clone(frozen)),
            valid: true,
        };
    }

    let text = decode_text(frozen);
    match base {
        Some(snapshot) => ContentSnapshot { text, ..snapshot },
        None => {
            let mut files = kind.static_files().unwrap_or_default();
            let mut sources = BTreeSet::new();
            if let Some(target) = kind.analysis_target() {
                if let Some(resolution) = workspace.intelligence().resolve(&target) {
                    sources = resolution.symbols;
                    if kind.static_files().is_none() {
                        files.extend(resolution.files);
                    }
                }
            }
            ContentSnapshot {
                text,
                sources,
                files,
                image_bytes: None,
                valid: true,
            }
        }
    }
}

fn resolve_symbols(kind: &FragmentKind, workspace: &Workspace) -> BTreeSet<CodeUnit> {
    kind.analysis_target()
        .and_then(|target| workspace.intelligence().resolve(&target))
        .map(|r| r.symbols)
        .unwrap_or_default()
}
