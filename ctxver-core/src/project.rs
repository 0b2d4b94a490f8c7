//! Project files and code symbols: the vocabulary shared by fragments and
//! the code-intelligence collaborator.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// A file addressed relative to a project root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProjectFile {
    root: PathBuf,
    rel: PathBuf,
}

impl ProjectFile {
    /// `rel` may also be an absolute path under `root`.
    pub fn new(root: impl Into<PathBuf>, rel: impl AsRef<Path>) -> Self {
        let root = normalize_path(&root.into());
        let rel = rel.as_ref();
        let rel = if rel.is_absolute() {
            let abs = normalize_path(rel);
            abs.strip_prefix(&root).map(Path::to_path_buf).unwrap_or(abs)
        } else {
            normalize_path(rel)
        };
        Self { root, rel }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn rel_path(&self) -> &Path {
        &self.rel
    }

    /// Relative path with `/` separators.
    pub fn rel_str(&self) -> String {
        self.rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }

    pub fn abs_path(&self) -> PathBuf {
        self.root.join(&self.rel)
    }

    pub fn file_name(&self) -> String {
        self.rel
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Parent directory relative to the root, empty at top level.
    pub fn parent(&self) -> String {
        self.rel
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn extension(&self) -> Option<String> {
        self.rel
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
    }
}

impl fmt::Display for ProjectFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rel_str())
    }
}

/// Kind of a code symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodeUnitKind {
    Class,
    Function,
    Field,
    Module,
}

/// A code symbol declared in a project file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodeUnit {
    pub file: ProjectFile,
    pub kind: CodeUnitKind,
    pub fq_name: String,
}

impl CodeUnit {
    pub fn new(file: ProjectFile, kind: CodeUnitKind, fq_name: impl Into<String>) -> Self {
        Self {
            file,
            kind,
            fq_name: fq_name.into(),
        }
    }

    pub fn class(file: ProjectFile, fq_name: impl Into<String>) -> Self {
        Self::new(file, CodeUnitKind::Class, fq_name)
    }

    pub fn function(file: ProjectFile, fq_name: impl Into<String>) -> Self {
        Self::new(file, CodeUnitKind::Function, fq_name)
    }

    /// Last segment of the fully qualified name.
    pub fn short_name(&self) -> &str {
        self.fq_name.rsplit('.').next().unwrap_or(&self.fq_name)
    }
}

/// Lexically normalize a path: drop `.` and fold `..` where possible.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let popped = matches!(out.components().next_back(), Some(Component::Normal(_)));
                if popped {
                    out.pop();
                } else if !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Expand file arguments against `root`.
///
/// Arguments containing glob metacharacters are matched against the
/// filesystem (files only); anything else is taken literally, existing or
/// not. Results keep argument order without duplicates.
pub fn discover_files(root: &Path, patterns: &[String]) -> Result<Vec<ProjectFile>> {
    let mut files: Vec<ProjectFile> = Vec::new();
    let mut push = |file: ProjectFile| {
        if !files.contains(&file) {
            files.push(file);
        }
    };

    for pattern in patterns {
        if !pattern.contains(|c| matches!(c, '*' | '?' | '[')) {
            push(ProjectFile::new(root, pattern));
            continue;
        }
        let full_pattern = root.join(pattern);
        let pattern_str = full_pattern.to_string_lossy();
        let entries = glob::glob(&pattern_str)
            .map_err(|e| Error::Config(format!("invalid file pattern {:?}: {}", pattern, e)))?;

        let mut matched = 0;
        for entry in entries.flatten().filter(|p| p.is_file()) {
            push(ProjectFile::new(root, entry));
            matched += 1;
        }
        tracing::debug!(pattern = %pattern, matched, "Expanded file pattern");
    }
    Ok(files)
}

/// Syntax style for highlighting, from a file extension.
pub fn syntax_style_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "rs" => "rust",
        "py" => "python",
        "java" => "java",
        "kt" => "kotlin",
        "js" | "mjs" => "javascript",
        "ts" | "tsx" => "typescript",
        "go" => "go",
        "c" | "h" => "c",
        "cpp" | "cc" | "hpp" => "cpp",
        "md" => "markdown",
        "toml" => "toml",
        "json" => "json",
        "yaml" | "yml" => "yaml",
        "sh" => "shell",
        _ => "none",
    }
}
