//! The closed set of fragment kinds and their per-kind payloads.

use super::snapshot::{ContentSnapshot, IMAGE_PLACEHOLDER_TEXT};
use crate::context::TaskEntry;
use crate::project::{normalize_path, syntax_style_for, CodeUnit, ProjectFile};
use crate::services::{AnalysisTarget, CallDirection};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

/// Description of the string fragment holding the latest failed build.
pub const LATEST_BUILD_RESULTS: &str = "Latest Build Results";
/// Description of the string fragment holding user notes on the code.
pub const CODE_NOTES: &str = "Code Notes";
/// Description of the string fragment listing dropped fragments.
pub const DISCARDED_CONTEXT: &str = "Discarded Context";

/// String fragments with these descriptions are singletons per context.
const SINGLETON_DESCRIPTIONS: [&str; 3] = [LATEST_BUILD_RESULTS, CODE_NOTES, DISCARDED_CONTEXT];

const PASTE_HASH_DESCRIPTION: &str = "(Paste)";

/// Discriminant of [`FragmentKind`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentType {
    ProjectPath,
    GitFile,
    ExternalPath,
    ImageFile,
    String,
    SearchResult,
    Skeleton,
    Usage,
    Code,
    CallGraph,
    History,
    Task,
    PasteText,
    PasteImage,
    StackTrace,
    BuildLog,
}

impl FragmentType {
    pub const ALL: [FragmentType; 16] = [
        FragmentType::ProjectPath,
        FragmentType::GitFile,
        FragmentType::ExternalPath,
        FragmentType::ImageFile,
        FragmentType::String,
        FragmentType::SearchResult,
        FragmentType::Skeleton,
        FragmentType::Usage,
        FragmentType::Code,
        FragmentType::CallGraph,
        FragmentType::History,
        FragmentType::Task,
        FragmentType::PasteText,
        FragmentType::PasteImage,
        FragmentType::StackTrace,
        FragmentType::BuildLog,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FragmentType::ProjectPath => "project_path",
            FragmentType::GitFile => "git_file",
            FragmentType::ExternalPath => "external_path",
            FragmentType::ImageFile => "image_file",
            FragmentType::String => "string",
            FragmentType::SearchResult => "search_result",
            FragmentType::Skeleton => "skeleton",
            FragmentType::Usage => "usage",
            FragmentType::Code => "code",
            FragmentType::CallGraph => "call_graph",
            FragmentType::History => "history",
            FragmentType::Task => "task",
            FragmentType::PasteText => "paste_text",
            FragmentType::PasteImage => "paste_image",
            FragmentType::StackTrace => "stack_trace",
            FragmentType::BuildLog => "build_log",
        }
    }

    /// Ids come from the workspace counter rather than a content hash.
    pub fn has_dynamic_identity(&self) -> bool {
        matches!(
            self,
            FragmentType::ProjectPath
                | FragmentType::ExternalPath
                | FragmentType::ImageFile
                | FragmentType::Skeleton
                | FragmentType::Usage
                | FragmentType::Code
                | FragmentType::CallGraph
        )
    }

    pub fn is_path(&self) -> bool {
        matches!(
            self,
            FragmentType::ProjectPath
                | FragmentType::GitFile
                | FragmentType::ExternalPath
                | FragmentType::ImageFile
        )
    }

    pub fn is_editable(&self) -> bool {
        matches!(
            self,
            FragmentType::ProjectPath | FragmentType::Usage | FragmentType::Code
        )
    }

    pub fn is_output(&self) -> bool {
        matches!(self, FragmentType::History | FragmentType::Task)
    }

    pub fn is_text(&self) -> bool {
        !matches!(self, FragmentType::ImageFile | FragmentType::PasteImage)
    }

    /// Derivation may run a whole-program analysis.
    pub fn is_slow_analysis(&self) -> bool {
        matches!(self, FragmentType::Usage | FragmentType::CallGraph)
    }
}

impl fmt::Display for FragmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FragmentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FragmentType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown fragment type: {}", s))
    }
}

/// An image file, inside or outside the project.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FileRef {
    Project(ProjectFile),
    External(PathBuf),
}

impl FileRef {
    pub fn abs_path(&self) -> PathBuf {
        match self {
            FileRef::Project(file) => file.abs_path(),
            FileRef::External(path) => normalize_path(path),
        }
    }

    pub fn project_file(&self) -> Option<&ProjectFile> {
        match self {
            FileRef::Project(file) => Some(file),
            FileRef::External(_) => None,
        }
    }

    fn display(&self) -> String {
        match self {
            FileRef::Project(file) => file.rel_str(),
            FileRef::External(path) => path.display().to_string(),
        }
    }
}

/// What a skeleton fragment summarizes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SkeletonTarget {
    /// One class, by fully qualified name
    Class(String),
    /// Every class declared in a file
    File(ProjectFile),
}

/// Per-kind construction payload.
///
/// Everything a fragment derives is a function of this payload and the
/// workspace collaborators.
#[derive(Debug, Clone, PartialEq)]
pub enum FragmentKind {
    ProjectPath {
        file: ProjectFile,
    },
    GitFile {
        file: ProjectFile,
        revision: String,
        content: String,
    },
    ExternalPath {
        path: PathBuf,
    },
    ImageFile {
        file: FileRef,
    },
    String {
        description: String,
        text: String,
        syntax_style: String,
        files: BTreeSet<ProjectFile>,
    },
    SearchResult {
        query: String,
        text: String,
        files: BTreeSet<ProjectFile>,
    },
    Skeleton {
        target: SkeletonTarget,
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
        bytes: Arc<[u8]>,
    },
    StackTrace {
        original: String,
        exception: String,
        code: String,
        sources: BTreeSet<CodeUnit>,
    },
    BuildLog {
        text: String,
    },
}

impl FragmentKind {
    pub fn fragment_type(&self) -> FragmentType {
        match self {
            FragmentKind::ProjectPath { .. } => FragmentType::ProjectPath,
            FragmentKind::GitFile { .. } => FragmentType::GitFile,
            FragmentKind::ExternalPath { .. } => FragmentType::ExternalPath,
            FragmentKind::ImageFile { .. } => FragmentType::ImageFile,
            FragmentKind::String { .. } => FragmentType::String,
            FragmentKind::SearchResult { .. } => FragmentType::SearchResult,
            FragmentKind::Skeleton { .. } => FragmentType::Skeleton,
            FragmentKind::Usage { .. } => FragmentType::Usage,
            FragmentKind::Code { .. } => FragmentType::Code,
            FragmentKind::CallGraph { .. } => FragmentType::CallGraph,
            FragmentKind::History { .. } => FragmentType::History,
            FragmentKind::Task { .. } => FragmentType::Task,
            FragmentKind::PasteText { .. } => FragmentType::PasteText,
            FragmentKind::PasteImage { .. } => FragmentType::PasteImage,
            FragmentKind::StackTrace { .. } => FragmentType::StackTrace,
            FragmentKind::BuildLog { .. } => FragmentType::BuildLog,
        }
    }

    /// Canonical representation used for semantic dedup of dynamic
    /// fragments. Empty for content-hashed kinds.
    pub fn repr(&self) -> String {
        match self {
            FragmentKind::ProjectPath { file } => format!("File(['{}'])", file.rel_str()),
            FragmentKind::ExternalPath { path } => format!("ExternalFile('{}')", path.display()),
            FragmentKind::ImageFile { file } => format!("ImageFile('{}')", file.display()),
            FragmentKind::Skeleton { target } => match target {
                SkeletonTarget::Class(fq_name) => format!("ClassSummary('{}')", fq_name),
                SkeletonTarget::File(file) => format!("FileSummary('{}')", file.rel_str()),
            },
            FragmentKind::Usage {
                target,
                include_tests,
            } => format!("SymbolUsages('{}', includeTests={})", target, include_tests),
            FragmentKind::Code { fq_name } => format!("Method(['{}'])", fq_name),
            FragmentKind::CallGraph {
                method,
                depth,
                direction,
            } => format!(
                "CallGraph('{}', depth={}, direction={})",
                method,
                depth,
                direction.as_str()
            ),
            _ => String::new(),
        }
    }

    /// Normalized absolute path, for path-based kinds.
    pub fn source_path(&self) -> Option<PathBuf> {
        match self {
            FragmentKind::ProjectPath { file } | FragmentKind::GitFile { file, .. } => {
                Some(file.abs_path())
            }
            FragmentKind::ExternalPath { path } => Some(normalize_path(path)),
            FragmentKind::ImageFile { file } => Some(file.abs_path()),
            _ => None,
        }
    }

    /// Description of string fragments that are singletons per context.
    pub(crate) fn singleton_description(&self) -> Option<&str> {
        match self {
            FragmentKind::String { description, .. }
                if SINGLETON_DESCRIPTIONS.contains(&description.as_str()) =>
            {
                Some(description.as_str())
            }
            _ => None,
        }
    }

    pub fn description(&self) -> String {
        match self {
            FragmentKind::ProjectPath { file } => path_description(file),
            FragmentKind::GitFile { file, revision, .. } => {
                let parent = file.parent();
                if parent.is_empty() {
                    format!("{} @{}", file.file_name(), short_revision(revision))
                } else {
                    format!("{} @{} [{}]", file.file_name(), short_revision(revision), parent)
                }
            }
            FragmentKind::ExternalPath { path } => path.display().to_string(),
            FragmentKind::ImageFile { file } => match file {
                FileRef::Project(file) => path_description(file),
                FileRef::External(path) => path.display().to_string(),
            },
            FragmentKind::String { description, .. } => description.clone(),
            FragmentKind::SearchResult { query, .. } => format!("Search: {}", query),
            FragmentKind::Skeleton { target } => match target {
                SkeletonTarget::Class(fq_name) => format!("Summary of {}", fq_name),
                SkeletonTarget::File(file) => format!("Summary of {}", file.rel_str()),
            },
            FragmentKind::Usage { target, .. } => format!("Uses of {}", target),
            FragmentKind::Code { fq_name } => format!("Source for {}", fq_name),
            FragmentKind::CallGraph {
                method,
                depth,
                direction,
            } => match direction {
                CallDirection::Out => format!("Callees of {} (depth {})", method, depth),
                CallDirection::In => format!("Callers of {} (depth {})", method, depth),
            },
            FragmentKind::History { entries } => {
                let n = entries.len();
                format!("Task History ({} task{})", n, if n == 1 { "" } else { "s" })
            }
            FragmentKind::Task { description, .. } => description.clone(),
            FragmentKind::PasteText { .. } => "Paste of text".to_string(),
            FragmentKind::PasteImage { .. } => "Paste of image".to_string(),
            FragmentKind::StackTrace { exception, .. } => format!("stacktrace of {}", exception),
            FragmentKind::BuildLog { .. } => "Build Results".to_string(),
        }
    }

    pub fn short_description(&self) -> String {
        match self {
            FragmentKind::ProjectPath { file } => file.file_name(),
            FragmentKind::GitFile { file, revision, .. } => {
                format!("{} @{}", file.file_name(), short_revision(revision))
            }
            FragmentKind::ExternalPath { path } => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            FragmentKind::ImageFile { file } => match file {
                FileRef::Project(file) => file.file_name(),
                FileRef::External(path) => path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string()),
            },
            FragmentKind::Skeleton { target } => match target {
                SkeletonTarget::Class(fq_name) => format!("{} (summary)", short_name(fq_name)),
                SkeletonTarget::File(file) => format!("{} (summary)", file.file_name()),
            },
            FragmentKind::Code { fq_name } => short_name(fq_name).to_string(),
            _ => self.description(),
        }
    }

    pub fn syntax_style(&self) -> String {
        let style = match self {
            FragmentKind::ProjectPath { file } | FragmentKind::GitFile { file, .. } => {
                syntax_style_for(file.rel_path())
            }
            FragmentKind::ExternalPath { path } => syntax_style_for(path),
            FragmentKind::String { syntax_style, .. } => return syntax_style.clone(),
            FragmentKind::Skeleton {
                target: SkeletonTarget::File(file),
            } => syntax_style_for(file.rel_path()),
            FragmentKind::SearchResult { .. }
            | FragmentKind::History { .. }
            | FragmentKind::Task { .. }
            | FragmentKind::PasteText { .. } => "markdown",
            _ => "none",
        };
        style.to_string()
    }

    /// Referenced files known without any computation.
    pub fn static_files(&self) -> Option<BTreeSet<ProjectFile>> {
        match self {
            FragmentKind::ProjectPath { file } | FragmentKind::GitFile { file, .. } => {
                Some(BTreeSet::from([file.clone()]))
            }
            FragmentKind::ImageFile { file } => {
                Some(file.project_file().cloned().into_iter().collect())
            }
            FragmentKind::Skeleton {
                target: SkeletonTarget::File(file),
            } => Some(BTreeSet::from([file.clone()])),
            FragmentKind::String { files, .. } | FragmentKind::SearchResult { files, .. } => {
                Some(files.clone())
            }
            FragmentKind::StackTrace { sources, .. } => {
                Some(sources.iter().map(|s| s.file.clone()).collect())
            }
            FragmentKind::ExternalPath { .. }
            | FragmentKind::History { .. }
            | FragmentKind::Task { .. }
            | FragmentKind::PasteText { .. }
            | FragmentKind::PasteImage { .. }
            | FragmentKind::BuildLog { .. } => Some(BTreeSet::new()),
            FragmentKind::Skeleton { .. }
            | FragmentKind::Usage { .. }
            | FragmentKind::Code { .. }
            | FragmentKind::CallGraph { .. } => None,
        }
    }

    /// The analysis query backing this kind, if any.
    pub fn analysis_target(&self) -> Option<AnalysisTarget> {
        match self {
            FragmentKind::ProjectPath { file } => Some(AnalysisTarget::Declarations(file.clone())),
            FragmentKind::Skeleton { target } => Some(match target {
                SkeletonTarget::Class(fq_name) => AnalysisTarget::ClassSkeleton {
                    fq_name: fq_name.clone(),
                },
                SkeletonTarget::File(file) => AnalysisTarget::FileSkeletons(file.clone()),
            }),
            FragmentKind::Usage {
                target,
                include_tests,
            } => Some(AnalysisTarget::Usages {
                target: target.clone(),
                include_tests: *include_tests,
            }),
            FragmentKind::Code { fq_name } => Some(AnalysisTarget::Source {
                fq_name: fq_name.clone(),
            }),
            FragmentKind::CallGraph {
                method,
                depth,
                direction,
            } => Some(AnalysisTarget::CallGraph {
                method: method.clone(),
                depth: *depth,
                direction: *direction,
            }),
            _ => None,
        }
    }

    /// Full snapshot for kinds whose content is part of the payload.
    pub fn static_snapshot(&self) -> Option<ContentSnapshot> {
        let files = self.static_files().unwrap_or_default();
        let snapshot = match self {
            FragmentKind::GitFile { content, .. } => ContentSnapshot::text(content.clone(), files),
            FragmentKind::String { text, .. }
            | FragmentKind::SearchResult { text, .. }
            | FragmentKind::Task { text, .. }
            | FragmentKind::PasteText { text }
            | FragmentKind::BuildLog { text } => ContentSnapshot::text(text.clone(), files),
            FragmentKind::History { entries } => {
                ContentSnapshot::text(render_history(entries), files)
            }
            FragmentKind::StackTrace {
                original,
                code,
                sources,
                ..
            } => {
                let mut snapshot = ContentSnapshot::text(
                    format!(
                        "{}\n\nStacktrace methods in this project:\n\n{}",
                        original, code
                    ),
                    files,
                );
                snapshot.sources = sources.clone();
                snapshot
            }
            FragmentKind::PasteImage { bytes } => ContentSnapshot {
                text: IMAGE_PLACEHOLDER_TEXT.to_string(),
                sources: BTreeSet::new(),
                files,
                image_bytes: Some(Arc::clone(bytes)),
                valid: true,
            },
            _ => return None,
        };
        Some(snapshot)
    }

    /// Stable id for content-hashed kinds: hex SHA-256 over type,
    /// description, primary content, syntax style and implementation tag.
    pub fn content_hash(&self) -> String {
        let description = match self {
            FragmentKind::PasteText { .. } | FragmentKind::PasteImage { .. } => {
                PASTE_HASH_DESCRIPTION.to_string()
            }
            _ => self.description(),
        };
        let primary: Vec<u8> = match self {
            FragmentKind::GitFile { content, .. } => content.as_bytes().to_vec(),
            FragmentKind::String { text, .. }
            | FragmentKind::SearchResult { text, .. }
            | FragmentKind::Task { text, .. }
            | FragmentKind::PasteText { text }
            | FragmentKind::BuildLog { text } => text.as_bytes().to_vec(),
            FragmentKind::History { entries } => render_history(entries).into_bytes(),
            FragmentKind::PasteImage { bytes } => bytes.to_vec(),
            FragmentKind::StackTrace { original, code, .. } => {
                format!("{}\n{}", original, code).into_bytes()
            }
            other => other.repr().into_bytes(),
        };

        let syntax_style = self.syntax_style();

        let mut hasher = Sha256::new();
        for field in [
            self.fragment_type().as_str().as_bytes(),
            description.as_bytes(),
            primary.as_slice(),
            syntax_style.as_bytes(),
            self.implementation_tag().as_bytes(),
        ] {
            hasher.update((field.len() as u64).to_le_bytes());
            hasher.update(field);
        }
        hex::encode(hasher.finalize())
    }

    fn implementation_tag(&self) -> &'static str {
        match self {
            FragmentKind::ProjectPath { .. } => "ProjectPathFragment",
            FragmentKind::GitFile { .. } => "GitFileFragment",
            FragmentKind::ExternalPath { .. } => "ExternalPathFragment",
            FragmentKind::ImageFile { .. } => "ImageFileFragment",
            FragmentKind::String { .. } => "StringFragment",
            FragmentKind::SearchResult { .. } => "SearchFragment",
            FragmentKind::Skeleton { .. } => "SkeletonFragment",
            FragmentKind::Usage { .. } => "UsageFragment",
            FragmentKind::Code { .. } => "CodeFragment",
            FragmentKind::CallGraph { .. } => "CallGraphFragment",
            FragmentKind::History { .. } => "HistoryFragment",
            FragmentKind::Task { .. } => "TaskFragment",
            FragmentKind::PasteText { .. } => "PasteTextFragment",
            FragmentKind::PasteImage { .. } => "PasteImageFragment",
            FragmentKind::StackTrace { .. } => "StacktraceFragment",
            FragmentKind::BuildLog { .. } => "BuildFragment",
        }
    }
}

fn path_description(file: &ProjectFile) -> String {
    let parent = file.parent();
    if parent.is_empty() {
        file.file_name()
    } else {
        format!("{} [{}]", file.file_name(), parent)
    }
}

fn short_revision(revision: &str) -> &str {
    revision.get(..7).unwrap_or(revision)
}

fn short_name(fq_name: &str) -> &str {
    fq_name.rsplit('.').next().unwrap_or(fq_name)
}

/// Markdown rendering of a task history.
pub fn render_history(entries: &[TaskEntry]) -> String {
    let mut out = String::new();
    for entry in entries {
        out.push_str(&format!("# Task {}: {}\n\n", entry.sequence, entry.description));
        if let Some(summary) = &entry.summary {
            out.push_str(summary);
            out.push('\n');
        } else if let Some(log) = &entry.log {
            out.push_str(log);
            out.push('\n');
        }
        out.push('\n');
    }
    out
}

/// Resolve an image path given by the user against the project root.
pub fn file_ref(root: &Path, path: &Path) -> FileRef {
    let abs = if path.is_absolute() {
        normalize_path(path)
    } else {
        normalize_path(&root.join(path))
    };
    let root = normalize_path(root);
    if abs.starts_with(&root) {
        FileRef::Project(ProjectFile::new(root, abs))
    } else {
        FileRef::External(abs)
    }
}
