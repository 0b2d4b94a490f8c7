use ctxver_core::SessionSnapshot;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

struct CliTestEnv {
    _temp_dir: TempDir,
    home: PathBuf,
    xdg_data: PathBuf,
    xdg_config: PathBuf,
    xdg_state: PathBuf,
    project: PathBuf,
}

impl CliTestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        let home = base.join("home");
        let xdg_data = base.join("xdg-data");
        let xdg_config = base.join("xdg-config");
        let xdg_state = base.join("xdg-state");
        let project = base.join("project");

        fs::create_dir_all(&home).expect("failed to create HOME");
        fs::create_dir_all(&xdg_data).expect("failed to create XDG_DATA_HOME");
        fs::create_dir_all(&xdg_config).expect("failed to create XDG_CONFIG_HOME");
        fs::create_dir_all(&xdg_state).expect("failed to create XDG_STATE_HOME");

        seed_project(&project);

        Self {
            _temp_dir: temp_dir,
            home,
            xdg_data,
            xdg_config,
            xdg_state,
            project,
        }
    }

    fn session_path(&self) -> PathBuf {
        self.xdg_data.join("sessions/demo.json")
    }

    fn write(&self, rel: &str, contents: &str) {
        fs::write(self.project.join(rel), contents).expect("failed to write project file");
    }
}

fn seed_project(project: &Path) {
    fs::create_dir_all(project.join("src")).expect("failed to create project directories");
    fs::write(project.join("a.txt"), "hello\n").expect("failed to seed a.txt");
    fs::write(project.join("src/lib.rs"), "pub fn answer() -> u32 {\n    42\n}\n")
        .expect("failed to seed src/lib.rs");
}

fn run_bin(env: &CliTestEnv, args: &[&str]) -> Output {
    let bin_path = PathBuf::from(assert_cmd::cargo::cargo_bin!("ctxver"));

    let mut command = Command::new(bin_path);

    command
        .args(args)
        .current_dir(&env.project)
        .env("HOME", &env.home)
        .env("XDG_DATA_HOME", &env.xdg_data)
        .env("XDG_CONFIG_HOME", &env.xdg_config)
        .env("XDG_STATE_HOME", &env.xdg_state)
        .output()
        .unwrap_or_else(|e| panic!("failed to execute ctxver: {e}"))
}

fn assert_success(args: &[&str], output: &Output) {
    if output.status.success() {
        return;
    }

    let rendered_args = args
        .iter()
        .map(|arg| OsString::from(arg).to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    panic!(
        "ctxver {rendered_args} failed\nstatus: {}\nstdout:\n{}\nstderr:\n{}",
        output.status, stdout, stderr
    );
}

fn snapshot(env: &CliTestEnv, files: &[&str]) -> Output {
    let session = env.session_path();
    let root = env.project.to_string_lossy().into_owned();
    let out = session.to_string_lossy().into_owned();
    let mut args = vec!["snapshot", "--root", root.as_str(), "--out", out.as_str()];
    args.extend_from_slice(files);

    let output = run_bin(env, &args);
    assert_success(&args, &output);
    output
}

#[test]
fn snapshot_then_diff_reports_changed_line() {
    let env = CliTestEnv::new();

    let first = snapshot(&env, &["a.txt"]);
    let stdout = String::from_utf8_lossy(&first.stdout);
    assert!(stdout.contains("Added a.txt"), "unexpected snapshot output:\n{stdout}");
    assert!(env.session_path().exists(), "session file should be written");

    env.write("a.txt", "hello world\n");

    let session = env.session_path().to_string_lossy().into_owned();
    let args = ["diff", session.as_str(), "--full"];
    let output = run_bin(&env, &args);
    assert_success(&args, &output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("+1 -1 a.txt"), "expected diff line, got:\n{stdout}");
    assert!(stdout.contains("+hello world"), "expected unified diff, got:\n{stdout}");
}

#[test]
fn diff_without_changes_says_so() {
    let env = CliTestEnv::new();
    snapshot(&env, &["a.txt", "src/*.rs"]);

    let session = env.session_path().to_string_lossy().into_owned();
    let args = ["diff", session.as_str()];
    let output = run_bin(&env, &args);
    assert_success(&args, &output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("No changes"), "got:\n{stdout}");
}

#[test]
fn history_lists_versions_with_deltas() {
    let env = CliTestEnv::new();
    snapshot(&env, &["a.txt"]);
    snapshot(&env, &["src/lib.rs"]);

    let session = env.session_path().to_string_lossy().into_owned();
    let args = ["history", session.as_str()];
    let output = run_bin(&env, &args);
    assert_success(&args, &output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("3 context(s)"), "got:\n{stdout}");
    assert!(stdout.contains("Added src/lib.rs") || stdout.contains("Added lib.rs"));
    let selected: Vec<&str> = stdout.lines().filter(|l| l.starts_with('*')).collect();
    assert_eq!(selected.len(), 1, "exactly one selected context:\n{stdout}");

    let snapshot = SessionSnapshot::load(&env.session_path()).expect("failed to load session");
    assert_eq!(snapshot.contexts.len(), 3);
    assert_eq!(snapshot.fragments.len(), 2);
}

#[test]
fn diff_save_appends_refreshed_context() {
    let env = CliTestEnv::new();
    snapshot(&env, &["a.txt"]);
    env.write("a.txt", "goodbye\n");

    let session = env.session_path().to_string_lossy().into_owned();
    let args = ["diff", session.as_str(), "--save"];
    let output = run_bin(&env, &args);
    assert_success(&args, &output);

    let snapshot = SessionSnapshot::load(&env.session_path()).expect("failed to load session");
    assert_eq!(snapshot.contexts.len(), 3);
    let last = snapshot.contexts.last().expect("no contexts");
    assert_eq!(last.action, "Load external changes");
}

#[test]
fn watch_with_poll_limit_saves_session() {
    let env = CliTestEnv::new();
    let session = env.session_path().to_string_lossy().into_owned();
    let root = env.project.to_string_lossy().into_owned();
    let args = [
        "watch",
        "--root",
        root.as_str(),
        "--poll",
        "10",
        "--max-polls",
        "2",
        "--save",
        session.as_str(),
        "a.txt",
    ];
    let output = run_bin(&env, &args);
    assert_success(&args, &output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Watch mode stopped."), "got:\n{stdout}");
    assert!(env.session_path().exists());
}

#[test]
fn diff_of_missing_session_fails() {
    let env = CliTestEnv::new();
    let missing = env.xdg_data.join("nope.json");
    let missing = missing.to_string_lossy().into_owned();

    let output = run_bin(&env, &["diff", missing.as_str()]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("failed to load session"), "got:\n{stderr}");
}

#[test]
fn snapshot_help_describes_file_summaries() {
    let env = CliTestEnv::new();
    let args = ["snapshot", "--help"];
    let output = run_bin(&env, &args);
    assert_success(&args, &output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("file summaries"), "got:\n{stdout}");
    assert!(!stdout.contains("class summaries"), "got:\n{stdout}");
}
