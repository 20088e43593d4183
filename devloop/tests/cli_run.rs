//! CLI tests spawning the `devloop` binary.
//!
//! Only commands that never reach the language model or a shell are driven
//! here; full scenarios live in `harness_lifecycle.rs`.

use std::process::Command;

use devloop::core::types::Position;
use devloop::exit_codes;
use devloop::io::checkpoint::CheckpointRef;
use devloop::io::init::EnginePaths;
use devloop::io::run_store::RunStore;

fn devloop(dir: &std::path::Path, args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_devloop"))
        .current_dir(dir)
        .args(args)
        .output()
        .expect("spawn devloop")
}

#[test]
fn init_start_and_step_through_documentation() {
    let temp = tempfile::tempdir().expect("tempdir");

    let init = devloop(temp.path(), &["init"]);
    assert_eq!(init.status.code(), Some(exit_codes::OK));

    let start = devloop(temp.path(), &["start"]);
    assert_eq!(start.status.code(), Some(exit_codes::OK));
    assert_eq!(String::from_utf8_lossy(&start.stdout).trim(), "project-1");

    let step = devloop(temp.path(), &["step"]);
    assert_eq!(step.status.code(), Some(exit_codes::OK));

    let paths = EnginePaths::new(temp.path());
    let state = RunStore::new(paths.run("project-1"))
        .load(CheckpointRef::Latest)
        .expect("load");
    assert_eq!(state.position, Position::Planner);

    let status = devloop(temp.path(), &["status", "--run", "project-1"]);
    assert_eq!(status.status.code(), Some(exit_codes::OK));
    assert!(String::from_utf8_lossy(&status.stdout).contains("project-1 running at planner"));
}

#[test]
fn rust_log_enables_tracing_on_stderr() {
    let temp = tempfile::tempdir().expect("tempdir");
    devloop(temp.path(), &["init"]);

    let start = Command::new(env!("CARGO_BIN_EXE_devloop"))
        .current_dir(temp.path())
        .env("RUST_LOG", "devloop=info")
        .arg("start")
        .output()
        .expect("spawn devloop");
    assert_eq!(start.status.code(), Some(exit_codes::OK));
    let stderr = String::from_utf8_lossy(&start.stderr);
    assert!(stderr.contains("run started"), "stderr: {stderr}");
}

#[test]
fn abort_reports_failed_exit_code() {
    let temp = tempfile::tempdir().expect("tempdir");
    devloop(temp.path(), &["init"]);
    devloop(temp.path(), &["start"]);

    let abort = devloop(temp.path(), &["abort", "project-1", "--reason", "stop"]);
    assert_eq!(abort.status.code(), Some(exit_codes::FAILED));

    let again = devloop(temp.path(), &["step", "--run", "project-1"]);
    assert_eq!(again.status.code(), Some(exit_codes::INVALID));
}

#[test]
fn unknown_run_is_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    devloop(temp.path(), &["init"]);
    let status = devloop(temp.path(), &["status", "--run", "nope-1"]);
    assert_eq!(status.status.code(), Some(exit_codes::INVALID));
}
