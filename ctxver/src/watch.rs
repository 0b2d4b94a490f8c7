//! `ctxver watch`: poll file mtimes and record a context per change.

use anyhow::{Context as _, Result};
use ctxver_core::{Config, Fragment, ProjectFile};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use crate::render;
use crate::session::Session;

pub struct WatchOptions {
    pub root: PathBuf,
    pub files: Vec<String>,
    pub poll: Duration,
    pub save: Option<PathBuf>,
    pub max_polls: Option<u64>,
}

pub fn run(config: &Config, options: WatchOptions) -> Result<()> {
    let session = match &options.save {
        Some(path) if path.exists() => Session::load(config, path, Some(options.root.clone()))?,
        _ => Session::create(config, options.root.clone())?,
    };
    let workspace = session.workspace();
    let history = session.history();

    let files = ctxver_core::project::discover_files(workspace.root(), &options.files)
        .context("failed to expand file patterns")?;
    let fragments: Vec<Fragment> = files
        .iter()
        .map(|file| Fragment::project_file(workspace, file.clone()))
        .collect();
    if let Some(context) = history.push(|top| top.add_fragments(fragments)) {
        println!("{}", context.action());
    }

    // Set up signal handler for graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nShutting down...");
        r.store(false, Ordering::SeqCst);
    })
    .context("failed to set Ctrl+C handler")?;

    println!(
        "Watching {} file(s) under {} (poll every {}ms). Press Ctrl+C to stop.",
        files.len(),
        workspace.root().display(),
        options.poll.as_millis()
    );

    let mut mtimes = read_mtimes(&files);
    let mut iteration = 0u64;
    let warm_up_recent = config.diff.warm_up_recent;

    while running.load(Ordering::SeqCst) {
        if options.max_polls.is_some_and(|max| iteration >= max) {
            break;
        }
        thread::sleep(options.poll);
        iteration += 1;

        let current = read_mtimes(&files);
        let changed: BTreeSet<ProjectFile> = files
            .iter()
            .filter(|f| current.get(*f) != mtimes.get(*f))
            .cloned()
            .collect();
        mtimes = current;
        if changed.is_empty() {
            continue;
        }

        let Some(context) = history.process_external_file_changes(&changed) else {
            tracing::debug!(iteration, changed = changed.len(), "Touched files have no content changes");
            continue;
        };

        let entries = session.diff(&context)?;
        let timestamp = chrono::Local::now().format("%H:%M:%S");
        println!(
            "[{}] {}: {}",
            timestamp,
            context.action(),
            render::summary_line(&entries)
        );
        render::print_entries(&entries, false);

        // Older versions are diffed in the background
        history.diff_cache().warm_up_recent(warm_up_recent);

        tracing::info!(
            iteration,
            context_id = %context.id(),
            changed = changed.len(),
            "watch iteration recorded a context"
        );
    }

    if let Some(path) = &options.save {
        session.save(path)?;
        println!("Session: {}", path.display());
    }

    println!("Watch mode stopped.");
    tracing::info!("ctxver watch mode stopped");
    Ok(())
}

/// Modification times of the files that currently exist.
fn read_mtimes(files: &[ProjectFile]) -> HashMap<ProjectFile, SystemTime> {
    files
        .iter()
        .filter_map(|file| {
            let modified = std::fs::metadata(file.abs_path())
                .and_then(|m| m.modified())
                .ok()?;
            Some((file.clone(), modified))
        })
        .collect()
}
