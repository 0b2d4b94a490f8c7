//! ctxver - snapshot, watch and diff versioned workspace contexts
//!
//! Commands:
//! - `snapshot`: build a context from project files and append it to a session
//! - `diff`: refresh a session's newest context against disk and show what changed
//! - `history`: list the contexts of a session with their change descriptions
//! - `watch`: poll files and record a new context whenever they change
//!
//! Uses XDG Base Directory specification for file locations:
//! - Logs: $XDG_STATE_HOME/ctxver/ctxver.YYYY-MM-DD.log (~/.local/state/ctxver/), one per day
//! - Config: $XDG_CONFIG_HOME/ctxver/config.toml (~/.config/ctxver/config.toml)

mod render;
mod session;
mod watch;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use ctxver_core::{Config, ContextDelta, Fragment};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::session::Session;

#[derive(Parser)]
#[command(name = "ctxver")]
#[command(about = "Snapshot, watch and diff versioned workspace contexts")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Add project files to a session as a new context version
    Snapshot {
        /// Project root the files are relative to (default: the session's
        /// recorded root, or the current directory for a new session)
        #[arg(long)]
        root: Option<PathBuf>,

        /// Files to include as file summaries (the classes each declares)
        /// instead of full text
        #[arg(long = "summary", value_name = "FILE")]
        summaries: Vec<String>,

        /// Files (or glob patterns) to include
        #[arg(value_name = "FILE")]
        files: Vec<String>,

        /// Session file to append to (created if missing)
        #[arg(short, long, value_name = "SESSION")]
        out: PathBuf,
    },

    /// Refresh the newest context against disk and print its diff
    Diff {
        /// Session file
        session: PathBuf,

        /// Project root (default: the root recorded in the session)
        #[arg(long)]
        root: Option<PathBuf>,

        /// Print the unified diff of each changed fragment
        #[arg(long)]
        full: bool,

        /// Write the refreshed context back to the session
        #[arg(long)]
        save: bool,
    },

    /// List the contexts of a session, oldest first
    History {
        /// Session file
        session: PathBuf,

        /// Project root (default: the root recorded in the session)
        #[arg(long)]
        root: Option<PathBuf>,
    },

    /// Poll files and record a context whenever they change on disk
    Watch {
        /// Project root the files are relative to
        #[arg(long, default_value = ".")]
        root: PathBuf,

        /// Files (or glob patterns) to watch
        #[arg(value_name = "FILE", required = true)]
        files: Vec<String>,

        /// Poll interval in milliseconds
        #[arg(long, default_value = "1000")]
        poll: u64,

        /// Session file to resume from and write on exit
        #[arg(long, value_name = "SESSION")]
        save: Option<PathBuf>,

        /// Stop after this many polls
        #[arg(long, hide = true)]
        max_polls: Option<u64>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Ensure XDG environment variables are set before using core library
    Config::ensure_xdg_env();

    let config = Config::load().context("failed to load configuration")?;

    let _log_guard =
        ctxver_core::logging::init(&config.logging).context("failed to initialize logging")?;

    tracing::info!("ctxver starting");

    match args.command {
        Command::Snapshot {
            root,
            summaries,
            files,
            out,
        } => cmd_snapshot(&config, root, &summaries, &files, &out),
        Command::Diff {
            session,
            root,
            full,
            save,
        } => cmd_diff(&config, &session, root, full, save),
        Command::History { session, root } => cmd_history(&config, &session, root),
        Command::Watch {
            root,
            files,
            poll,
            save,
            max_polls,
        } => watch::run(
            &config,
            watch::WatchOptions {
                root,
                files,
                poll: Duration::from_millis(poll),
                save,
                max_polls,
            },
        ),
    }
}

fn cmd_snapshot(
    config: &Config,
    root: Option<PathBuf>,
    summaries: &[String],
    files: &[String],
    out: &Path,
) -> Result<()> {
    if files.is_empty() && summaries.is_empty() {
        anyhow::bail!("nothing to snapshot: pass at least one FILE or --summary");
    }

    let session = if out.exists() {
        Session::load(config, out, root)?
    } else {
        Session::create(config, root.unwrap_or_else(|| PathBuf::from(".")))?
    };
    let workspace = session.workspace();

    let mut fragments = Vec::new();
    for file in ctxver_core::project::discover_files(workspace.root(), summaries)
        .context("failed to expand --summary patterns")?
    {
        fragments.push(Fragment::file_summary(workspace, file));
    }
    for file in ctxver_core::project::discover_files(workspace.root(), files)
        .context("failed to expand file patterns")?
    {
        fragments.push(Fragment::project_file(workspace, file));
    }

    match session.history().push(|top| top.add_fragments(fragments)) {
        Some(context) => {
            println!("{}", context.action());
            let entries = session.diff(&context)?;
            render::print_entries(&entries, false);
        }
        None => println!("No changes"),
    }

    session.save(out)?;
    println!("Session: {}", out.display());
    Ok(())
}

fn cmd_diff(
    config: &Config,
    path: &Path,
    root: Option<PathBuf>,
    full: bool,
    save: bool,
) -> Result<()> {
    let session = Session::load(config, path, root)?;

    let Some(context) = session.history().push(|top| top.copy_and_refresh(None)) else {
        println!("No changes");
        return Ok(());
    };

    let entries = session.diff(&context)?;
    if entries.is_empty() {
        println!("No changes");
    } else {
        render::print_entries(&entries, full);
    }

    if save {
        session.save(path)?;
    }
    Ok(())
}

fn cmd_history(config: &Config, path: &Path, root: Option<PathBuf>) -> Result<()> {
    let session = Session::load(config, path, root)?;
    let history = session.history();
    let selected = history.selected().map(|c| c.id());
    let contexts = history.contexts();

    println!("{} context(s) in {}", contexts.len(), path.display());
    let mut previous = None;
    for (index, context) in contexts.iter().enumerate() {
        let marker = if Some(context.id()) == selected { '*' } else { ' ' };
        let change = match previous {
            Some(prev) => ContextDelta::between(prev, context).description(),
            None => String::from("-"),
        };
        println!(
            "{} {:>3}  {:<32}  {}",
            marker,
            index + 1,
            context.action(),
            change
        );
        previous = Some(context);
    }
    Ok(())
}
