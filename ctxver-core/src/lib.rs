//! # ctxver-core
//!
//! Core library for ctxver - versioned workspace contexts with cached diffs.
//!
//! This library provides:
//! - `AsyncCell`, a lazy, memoized, cancellable value computed off-thread
//! - Fragments: addressable units of workspace content with stable or
//!   counter-based identity and write-once frozen snapshots
//! - Immutable `Context` versions and the session `ContextHistory`
//! - `DiffCache`: per-version content diffs, memoized and warmed up in the
//!   background
//! - Configuration, logging and session persistence
//!
//! ## Architecture
//!
//! ```text
//!   Workspace ──── collaborators (files, code intelligence, git, differ)
//!       │          fragment pool · background pool · id allocator
//!       ▼
//!   Fragment ───── AsyncCell<ContentSnapshot>  (lazy, on the fragment pool)
//!       │
//!       ▼
//!   Context ────── immutable version: fragments + task history + markers
//!       │
//!       ▼
//!   ContextHistory ── frozen versions, undo/redo ──▶ DiffCache
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use ctxver_core::{Config, Context, ContextHistory, Fragment, Workspace};
//!
//! let config = Config::load().expect("failed to load config");
//! let workspace = Workspace::open("/path/to/project", &config).expect("failed to open workspace");
//!
//! let history = ContextHistory::new(Context::empty(&workspace));
//! let readme = Fragment::project_path(&workspace, "README.md");
//! history.push(|ctx| ctx.add_fragments([readme]));
//!
//! let diffs = history.diff_cache().diff(&history.top()).join();
//! ```

// Re-export commonly used items at the crate root
pub use cell::{AsyncCell, BlockingPool, Executor};
pub use config::Config;
pub use context::{Context, DiffEntry, TaskEntry};
pub use delta::ContextDelta;
pub use diff::{DiffCache, DiffList, WarmUpReport};
pub use error::{CellError, Error, Result};
pub use fragment::{Fragment, FragmentKind, FragmentType};
pub use history::{ContextHistory, UndoResult};
pub use ids::{ContextId, FragmentId, IdAllocator};
pub use persist::SessionSnapshot;
pub use project::{CodeUnit, ProjectFile};
pub use services::Workspace;

// Public modules
pub mod cell;
pub mod config;
pub mod context;
pub mod delta;
pub mod diff;
pub mod error;
pub mod fragment;
pub mod history;
pub mod ids;
pub mod logging;
pub mod persist;
pub mod project;
pub mod services;
pub mod textdiff;
