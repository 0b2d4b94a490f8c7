//! Durable sessions: contexts, fragments and cached diffs as JSON.
//!
//! Each fragment is written once, with its id, type tag, construction
//! payload and frozen bytes (hex). Contexts refer to fragments by id, so
//! fragments shared between versions are shared again after loading.
//! Project paths are stored relative to the workspace root.

use crate::context::{Context, ContextParts, DiffEntry, TaskEntry};
use crate::diff::DiffSnapshot;
use crate::error::{Error, Result};
use crate::fragment::{FileRef, Fragment, FragmentKind, FragmentType, SkeletonTarget};
use crate::history::ContextHistory;
use crate::ids::{ContextId, FragmentId};
use crate::project::{CodeUnit, CodeUnitKind, ProjectFile};
use crate::services::{CallDirection, Workspace};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// Format version written by this build.
pub const SESSION_FORMAT_VERSION: u32 = 1;

/// A whole session, ready to serialize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub version: u32,
    /// Workspace root the session was captured in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
    pub fragments: Vec<FragmentRecord>,
    /// Oldest first
    pub contexts: Vec<ContextRecord>,
    #[serde(default)]
    pub redo: Vec<ContextRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected: Option<ContextId>,
    #[serde(default)]
    pub diffs: Vec<DiffRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FragmentRecord {
    pub id: FragmentId,
    #[serde(rename = "type")]
    pub fragment_type: FragmentType,
    pub payload: Payload,
    /// Hex-encoded frozen content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frozen: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeUnitRecord {
    pub path: String,
    pub kind: CodeUnitKind,
    pub fq_name: String,
}

/// Construction parameters per fragment kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    ProjectPath {
        path: String,
    },
    GitFile {
        path: String,
        revision: String,
        content: String,
    },
    ExternalPath {
        path: PathBuf,
    },
    ImageFile {
        path: String,
        external: bool,
    },
    String {
        description: String,
        text: String,
        syntax_style: String,
        files: Vec<String>,
    },
    SearchResult {
        query: String,
        text: String,
        files: Vec<String>,
    },
    ClassSummary {
        fq_name: String,
    },
    FileSummary {
        path: String,
    },
    Usage {
        target: String,
        include_tests: bool,
    },
    Code {
        fq_name: String,
    },
    CallGraph {
        method: String,
        depth: u32,
        direction: CallDirection,
    },
    History {
        entries: Vec<TaskEntry>,
    },
    Task {
        description: String,
        text: String,
    },
    PasteText {
        text: String,
    },
    PasteImage {
        bytes: String,
    },
    StackTrace {
        original: String,
        exception: String,
        code: String,
        sources: Vec<CodeUnitRecord>,
    },
    BuildLog {
        text: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextRecord {
    pub id: ContextId,
    pub fragments: Vec<FragmentId>,
    #[serde(default)]
    pub read_only: Vec<FragmentId>,
    #[serde(default)]
    pub pinned: Vec<FragmentId>,
    #[serde(default)]
    pub task_history: Vec<TaskEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parsed_output: Option<FragmentId>,
    pub action: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffRecord {
    pub context: ContextId,
    pub entries: Vec<DiffEntryRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffEntryRecord {
    pub fragment: FragmentId,
    pub diff: String,
    pub lines_added: usize,
    pub lines_deleted: usize,
    pub old_content: String,
    pub new_content: String,
}

// ============================================
// Capture
// ============================================

impl SessionSnapshot {
    /// Snapshot `history`, including its completed diffs.
    pub fn capture(history: &ContextHistory) -> Self {
        let contexts = history.contexts();
        let redo = history.redo_stack();

        let mut seen = HashSet::new();
        let mut fragments = Vec::new();
        for context in contexts.iter().chain(redo.iter()) {
            let owned = context.fragments().iter().chain(context.parsed_output());
            for fragment in owned {
                if seen.insert(fragment.id().clone()) {
                    fragments.push(FragmentRecord::capture(fragment));
                }
            }
        }

        let live: HashSet<ContextId> = contexts.iter().map(Context::id).collect();
        let mut diffs: Vec<DiffRecord> = history
            .diff_cache()
            .snapshot()
            .into_iter()
            .filter(|(id, _)| live.contains(id))
            .map(|(context, entries)| DiffRecord {
                context,
                entries: entries
                    .iter()
                    .filter(|e| seen.contains(e.fragment.id()))
                    .map(DiffEntryRecord::capture)
                    .collect(),
            })
            .collect();
        diffs.sort_by_key(|d| d.context);

        Self {
            version: SESSION_FORMAT_VERSION,
            root: Some(history.workspace().root().to_path_buf()),
            fragments,
            contexts: contexts.iter().map(ContextRecord::capture).collect(),
            redo: redo.iter().map(ContextRecord::capture).collect(),
            selected: history.selected().map(|c| c.id()),
            diffs,
        }
    }

    /// Rebuild the history in `workspace`, seeding its diff cache.
    pub fn restore(&self, workspace: &Arc<Workspace>) -> Result<ContextHistory> {
        if self.version > SESSION_FORMAT_VERSION {
            return Err(Error::Persist(format!(
                "unsupported session format version {}",
                self.version
            )));
        }
        if self.contexts.is_empty() {
            return Err(Error::Persist("session has no contexts".to_string()));
        }

        let mut fragments: HashMap<FragmentId, Fragment> = HashMap::new();
        for record in &self.fragments {
            let fragment = record.restore(workspace)?;
            fragments.insert(record.id.clone(), fragment);
        }

        let contexts = self
            .contexts
            .iter()
            .map(|r| r.restore(workspace, &fragments))
            .collect::<Result<Vec<_>>>()?;
        let redo = self
            .redo
            .iter()
            .map(|r| r.restore(workspace, &fragments))
            .collect::<Result<Vec<_>>>()?;

        let history = ContextHistory::from_parts(contexts, redo, self.selected);

        let mut prior = DiffSnapshot::new();
        for record in &self.diffs {
            let entries = record
                .entries
                .iter()
                .map(|e| e.restore(&fragments))
                .collect::<Result<Vec<_>>>()?;
            prior.insert(record.context, Arc::new(entries));
        }
        let allowed: BTreeSet<ContextId> = history.contexts().iter().map(Context::id).collect();
        let seeded = history.diff_cache().seed_from(&prior, &allowed);

        tracing::info!(
            contexts = history.len(),
            fragments = fragments.len(),
            seeded_diffs = seeded,
            next_fragment_id = workspace.ids().peek_next(),
            "Restored session"
        );
        Ok(history)
    }

    /// Write as JSON, atomically replacing `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;
        tracing::debug!(path = %path.display(), "Session saved");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let snapshot: Self = serde_json::from_str(&contents)?;
        Ok(snapshot)
    }
}

// ============================================
// Records
// ============================================

impl FragmentRecord {
    fn capture(fragment: &Fragment) -> Self {
        let kind = fragment.kind();
        let description = fragment.description_now();
        Self {
            id: fragment.id().clone(),
            fragment_type: fragment.fragment_type(),
            payload: Payload::from_kind(kind),
            frozen: fragment.frozen_bytes().map(hex::encode),
            description: (description != kind.description()).then_some(description),
        }
    }

    fn restore(&self, workspace: &Arc<Workspace>) -> Result<Fragment> {
        let kind = self.payload.to_kind(workspace)?;
        if kind.fragment_type() != self.fragment_type {
            return Err(Error::Persist(format!(
                "fragment {} is tagged {} but its payload is {}",
                self.id,
                self.fragment_type,
                kind.fragment_type()
            )));
        }
        let frozen = self
            .frozen
            .as_deref()
            .map(|h| decode_hex(h, &self.id))
            .transpose()?;
        Fragment::restore(workspace, self.id.clone(), kind, frozen, self.description.clone())
    }
}

fn decode_hex(text: &str, id: &FragmentId) -> Result<Arc<[u8]>> {
    hex::decode(text)
        .map(Arc::from)
        .map_err(|e| Error::Persist(format!("fragment {}: bad hex content: {}", id, e)))
}

fn rel_paths(files: &BTreeSet<ProjectFile>) -> Vec<String> {
    files.iter().map(ProjectFile::rel_str).collect()
}

fn project_files(workspace: &Workspace, paths: &[String]) -> BTreeSet<ProjectFile> {
    paths.iter().map(|p| workspace.project_file(p)).collect()
}

impl Payload {
    fn from_kind(kind: &FragmentKind) -> Self {
        match kind {
            FragmentKind::ProjectPath { file } => Payload::ProjectPath { path: file.rel_str() },
            FragmentKind::GitFile {
                file,
                revision,
                content,
            } => Payload::GitFile {
                path: file.rel_str(),
                revision: revision.clone(),
                content: content.clone(),
            },
            FragmentKind::ExternalPath { path } => Payload::ExternalPath { path: path.clone() },
            FragmentKind::ImageFile { file } => match file {
                FileRef::Project(file) => Payload::ImageFile {
                    path: file.rel_str(),
                    external: false,
                },
                FileRef::External(path) => Payload::ImageFile {
                    path: path.display().to_string(),
                    external: true,
                },
            },
            FragmentKind::String {
                description,
                text,
                syntax_style,
                files,
            } => Payload::String {
                description: description.clone(),
                text: text.clone(),
                syntax_style: syntax_style.clone(),
                files: rel_paths(files),
            },
            FragmentKind::SearchResult { query, text, files } => Payload::SearchResult {
                query: query.clone(),
                text: text.clone(),
                files: rel_paths(files),
            },
            FragmentKind::Skeleton { target } => match target {
                SkeletonTarget::Class(fq_name) => Payload::ClassSummary {
                    fq_name: fq_name.clone(),
                },
                SkeletonTarget::File(file) => Payload::FileSummary { path: file.rel_str() },
            },
            FragmentKind::Usage {
                target,
                include_tests,
            } => Payload::Usage {
                target: target.clone(),
                include_tests: *include_tests,
            },
            FragmentKind::Code { fq_name } => Payload::Code {
                fq_name: fq_name.clone(),
            },
            FragmentKind::CallGraph {
                method,
                depth,
                direction,
            } => Payload::CallGraph {
                method: method.clone(),
                depth: *depth,
                direction: *direction,
            },
            FragmentKind::History { entries } => Payload::History {
                entries: entries.clone(),
            },
            FragmentKind::Task { description, text } => Payload::Task {
                description: description.clone(),
                text: text.clone(),
            },
            FragmentKind::PasteText { text } => Payload::PasteText { text: text.clone() },
            FragmentKind::PasteImage { bytes } => Payload::PasteImage {
                bytes: hex::encode(bytes),
            },
            FragmentKind::StackTrace {
                original,
                exception,
                code,
                sources,
            } => Payload::StackTrace {
                original: original.clone(),
                exception: exception.clone(),
                code: code.clone(),
                sources: sources
                    .iter()
                    .map(|unit| CodeUnitRecord {
                        path: unit.file.rel_str(),
                        kind: unit.kind,
                        fq_name: unit.fq_name.clone(),
                    })
                    .collect(),
            },
            FragmentKind::BuildLog { text } => Payload::BuildLog { text: text.clone() },
        }
    }

    fn to_kind(&self, workspace: &Workspace) -> Result<FragmentKind> {
        let kind = match self {
            Payload::ProjectPath { path } => FragmentKind::ProjectPath {
                file: workspace.project_file(path),
            },
            Payload::GitFile {
                path,
                revision,
                content,
            } => FragmentKind::GitFile {
                file: workspace.project_file(path),
                revision: revision.clone(),
                content: content.clone(),
            },
            Payload::ExternalPath { path } => FragmentKind::ExternalPath { path: path.clone() },
            Payload::ImageFile { path, external } => FragmentKind::ImageFile {
                file: if *external {
                    FileRef::External(PathBuf::from(path))
                } else {
                    FileRef::Project(workspace.project_file(path))
                },
            },
            Payload::String {
                description,
                text,
                syntax_style,
                files,
            } => FragmentKind::String {
                description: description.clone(),
                text: text.clone(),
                syntax_style: syntax_style.clone(),
                files: project_files(workspace, files),
            },
            Payload::SearchResult { query, text, files } => FragmentKind::SearchResult {
                query: query.clone(),
                text: text.clone(),
                files: project_files(workspace, files),
            },
            Payload::ClassSummary { fq_name } => FragmentKind::Skeleton {
                target: SkeletonTarget::Class(fq_name.clone()),
            },
            Payload::FileSummary { path } => FragmentKind::Skeleton {
                target: SkeletonTarget::File(workspace.project_file(path)),
            },
            Payload::Usage {
                target,
                include_tests,
            } => FragmentKind::Usage {
                target: target.clone(),
                include_tests: *include_tests,
            },
            Payload::Code { fq_name } => FragmentKind::Code {
                fq_name: fq_name.clone(),
            },
            Payload::CallGraph {
                method,
                depth,
                direction,
            } => FragmentKind::CallGraph {
                method: method.clone(),
                depth: *depth,
                direction: *direction,
            },
            Payload::History { entries } => FragmentKind::History {
                entries: entries.clone(),
            },
            Payload::Task { description, text } => FragmentKind::Task {
                description: description.clone(),
                text: text.clone(),
            },
            Payload::PasteText { text } => FragmentKind::PasteText { text: text.clone() },
            Payload::PasteImage { bytes } => FragmentKind::PasteImage {
                bytes: hex::decode(bytes)
                    .map(Arc::from)
                    .map_err(|e| Error::Persist(format!("pasted image: bad hex content: {}", e)))?,
            },
            Payload::StackTrace {
                original,
                exception,
                code,
                sources,
            } => FragmentKind::StackTrace {
                original: original.clone(),
                exception: exception.clone(),
                code: code.clone(),
                sources: sources
                    .iter()
                    .map(|u| CodeUnit::new(workspace.project_file(&u.path), u.kind, u.fq_name.clone()))
                    .collect(),
            },
            Payload::BuildLog { text } => FragmentKind::BuildLog { text: text.clone() },
        };
        Ok(kind)
    }
}

impl ContextRecord {
    fn capture(context: &Context) -> Self {
        Self {
            id: context.id(),
            fragments: context.fragments().iter().map(|f| f.id().clone()).collect(),
            read_only: context.read_only_fragments().iter().map(|f| f.id().clone()).collect(),
            pinned: context.pinned_fragments().iter().map(|f| f.id().clone()).collect(),
            task_history: context.task_history().to_vec(),
            group_id: context.group_id(),
            group_label: context.group_label().map(str::to_string),
            parsed_output: context.parsed_output().map(|f| f.id().clone()),
            action: context.action(),
        }
    }

    fn restore(&self, workspace: &Arc<Workspace>, fragments: &HashMap<FragmentId, Fragment>) -> Result<Context> {
        let lookup = |id: &FragmentId| {
            fragments.get(id).cloned().ok_or_else(|| {
                Error::Persist(format!("context {} refers to unknown fragment {}", self.id, id))
            })
        };
        let parts = ContextParts {
            id: self.id,
            fragments: self.fragments.iter().map(lookup).collect::<Result<Vec<_>>>()?,
            task_history: self.task_history.clone(),
            read_only: self.read_only.iter().cloned().collect(),
            pinned: self.pinned.iter().cloned().collect(),
            group_id: self.group_id,
            group_label: self.group_label.clone(),
            parsed_output: self.parsed_output.as_ref().map(lookup).transpose()?,
            action: self.action.clone(),
        };
        Ok(Context::from_parts(workspace, parts))
    }
}

impl DiffEntryRecord {
    fn capture(entry: &DiffEntry) -> Self {
        Self {
            fragment: entry.fragment.id().clone(),
            diff: entry.diff.clone(),
            lines_added: entry.lines_added,
            lines_deleted: entry.lines_deleted,
            old_content: entry.old_content.clone(),
            new_content: entry.new_content.clone(),
        }
    }

    fn restore(&self, fragments: &HashMap<FragmentId, Fragment>) -> Result<DiffEntry> {
        let fragment = fragments.get(&self.fragment).cloned().ok_or_else(|| {
            Error::Persist(format!("diff refers to unknown fragment {}", self.fragment))
        })?;
        Ok(DiffEntry {
            fragment,
            diff: self.diff.clone(),
            lines_added: self.lines_added,
            lines_deleted: self.lines_deleted,
            old_content: self.old_content.clone(),
            new_content: self.new_content.clone(),
        })
    }
}
