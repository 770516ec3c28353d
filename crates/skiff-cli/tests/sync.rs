//! End-to-end runs of the `skiff` binary, with the same binary serving as
//! the remote helper (`skiff server`).

use std::env;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use eyre::Result;
use serde_json::{json, Value};

const STATE_FILE: &str = ".s2rstate.json";

fn skiff_bin() -> PathBuf {
    let exe = env::current_exe().expect("current_exe");
    let deps = exe.parent().expect("deps directory");
    deps.parent().expect("profile directory").join("skiff")
}

fn run_skiff(args: &[&str]) -> Output {
    Command::new(skiff_bin())
        .args(args)
        .output()
        .expect("run skiff")
}

fn stdout_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

/// Point the state file's helper command at `skiff server` and its remote
/// working directory at `dest`.
fn configure_remote(src: &Path, dest: &Path) -> Result<()> {
    let state_path = src.join(STATE_FILE);
    let mut state: Value = serde_json::from_slice(&fs::read(&state_path)?)?;
    state["command"] = json!([skiff_bin().to_str().unwrap(), "server"]);
    state["remotecwd"] = json!(dest.to_str().unwrap());
    fs::write(&state_path, serde_json::to_vec(&state)?)?;
    Ok(())
}

#[test]
fn genstate_records_the_current_tree() -> Result<()> {
    let src = tempfile::tempdir()?;
    fs::create_dir(src.path().join("sub"))?;
    fs::write(src.path().join("sub/f.txt"), b"data")?;

    let output = run_skiff(&["genstate", "--cwd", src.path().to_str().unwrap()]);
    assert!(output.status.success(), "{}", stderr_of(&output));

    let state: Value = serde_json::from_slice(&fs::read(src.path().join(STATE_FILE))?)?;
    assert_eq!(state["command"], json!([]));
    assert_eq!(state["remotecwd"], Value::Null);
    assert!(state["data"]["sub/f.txt"].is_array());
    Ok(())
}

#[test]
fn genemptystate_blanks_the_snapshot_but_keeps_the_config() -> Result<()> {
    let src = tempfile::tempdir()?;
    fs::write(src.path().join("f.txt"), b"data")?;
    fs::write(
        src.path().join(STATE_FILE),
        serde_json::to_vec(&json!({
            "command": ["some-helper"],
            "remotecwd": "/srv/x",
            "data": { "f.txt": [false, 1] }
        }))?,
    )?;

    let output = run_skiff(&["genemptystate", "--cwd", src.path().to_str().unwrap()]);
    assert!(output.status.success(), "{}", stderr_of(&output));

    let state: Value = serde_json::from_slice(&fs::read(src.path().join(STATE_FILE))?)?;
    assert_eq!(state["command"], json!(["some-helper"]));
    assert_eq!(state["remotecwd"], json!("/srv/x"));
    assert_eq!(state["data"], json!({}));
    Ok(())
}

#[test]
fn statefile_names_with_separators_are_rejected() -> Result<()> {
    let src = tempfile::tempdir()?;
    let output = run_skiff(&[
        "genstate",
        "--cwd",
        src.path().to_str().unwrap(),
        "--statefile",
        "a/b.json",
    ]);
    assert!(!output.status.success());
    assert!(stderr_of(&output).contains("state file name"));
    Ok(())
}

#[test]
fn sync_without_a_state_file_points_at_genstate() -> Result<()> {
    let src = tempfile::tempdir()?;
    let output = run_skiff(&["sync", "--cwd", src.path().to_str().unwrap()]);
    assert!(!output.status.success());
    assert!(stderr_of(&output).contains("genstate"));
    Ok(())
}

#[test]
fn dryrun_prints_the_plan_without_a_helper() -> Result<()> {
    let src = tempfile::tempdir()?;
    let output = run_skiff(&["genemptystate", "--cwd", src.path().to_str().unwrap()]);
    assert!(output.status.success(), "{}", stderr_of(&output));
    fs::write(src.path().join("brand-new.txt"), b"x")?;

    // No command or remotecwd configured: dryrun must not need either.
    let output = run_skiff(&[
        "sync",
        "--cwd",
        src.path().to_str().unwrap(),
        "--dryrun",
    ]);
    assert!(output.status.success(), "{}", stderr_of(&output));
    let stdout = stdout_of(&output);
    assert!(stdout.contains("will be uploaded"), "{stdout}");
    assert!(stdout.contains("brand-new.txt"), "{stdout}");
    assert!(stdout.contains("(No remote files will be deleted)"), "{stdout}");
    Ok(())
}

#[test]
fn sync_mirrors_the_tree_and_settles() -> Result<()> {
    let src = tempfile::tempdir()?;
    let dest = tempfile::tempdir()?;

    fs::create_dir(src.path().join("a"))?;
    fs::write(src.path().join("a/b.txt"), b"hello")?;
    fs::write(src.path().join("run.sh"), b"#!/bin/sh\nexit 0\n")?;
    fs::set_permissions(src.path().join("run.sh"), fs::Permissions::from_mode(0o755))?;
    std::os::unix::fs::symlink("a/b.txt", src.path().join("l"))?;

    let output = run_skiff(&["genemptystate", "--cwd", src.path().to_str().unwrap()]);
    assert!(output.status.success(), "{}", stderr_of(&output));
    configure_remote(src.path(), dest.path())?;

    let output = run_skiff(&["sync", "--cwd", src.path().to_str().unwrap()]);
    assert!(output.status.success(), "{}", stderr_of(&output));
    assert!(stdout_of(&output).contains("Sync successful."));

    assert_eq!(fs::read(dest.path().join("a/b.txt"))?, b"hello");
    assert_eq!(fs::read(dest.path().join("run.sh"))?, b"#!/bin/sh\nexit 0\n");
    let mode = fs::metadata(dest.path().join("run.sh"))?.permissions().mode();
    assert_eq!(mode & 0o111, 0o111);
    assert_eq!(fs::read_link(dest.path().join("l"))?, Path::new("a/b.txt"));
    // The state file itself never ships.
    assert!(!dest.path().join(STATE_FILE).exists());

    // A second run has nothing to do but still succeeds.
    let output = run_skiff(&["sync", "--cwd", src.path().to_str().unwrap()]);
    assert!(output.status.success(), "{}", stderr_of(&output));
    let stdout = stdout_of(&output);
    assert!(stdout.contains("Nothing to be done!"), "{stdout}");
    assert!(stdout.contains("Sync successful."), "{stdout}");
    Ok(())
}

#[test]
fn sync_propagates_deletions() -> Result<()> {
    let src = tempfile::tempdir()?;
    let dest = tempfile::tempdir()?;

    fs::write(src.path().join("keep.txt"), b"keep")?;
    fs::write(src.path().join("drop.txt"), b"drop")?;

    let output = run_skiff(&["genemptystate", "--cwd", src.path().to_str().unwrap()]);
    assert!(output.status.success(), "{}", stderr_of(&output));
    configure_remote(src.path(), dest.path())?;

    let output = run_skiff(&["sync", "--cwd", src.path().to_str().unwrap()]);
    assert!(output.status.success(), "{}", stderr_of(&output));
    assert!(dest.path().join("drop.txt").exists());

    fs::remove_file(src.path().join("drop.txt"))?;
    let output = run_skiff(&["sync", "--cwd", src.path().to_str().unwrap()]);
    assert!(output.status.success(), "{}", stderr_of(&output));

    assert!(dest.path().join("keep.txt").exists());
    assert!(!dest.path().join("drop.txt").exists());
    Ok(())
}

#[test]
fn sync_fails_cleanly_when_the_helper_cannot_start() -> Result<()> {
    let src = tempfile::tempdir()?;
    fs::write(src.path().join("f.txt"), b"x")?;
    let output = run_skiff(&["genemptystate", "--cwd", src.path().to_str().unwrap()]);
    assert!(output.status.success(), "{}", stderr_of(&output));

    let state_path = src.path().join(STATE_FILE);
    let mut state: Value = serde_json::from_slice(&fs::read(&state_path)?)?;
    state["command"] = json!(["/nonexistent/helper-binary"]);
    state["remotecwd"] = json!("/tmp/never-used");
    fs::write(&state_path, serde_json::to_vec(&state)?)?;

    let output = run_skiff(&["sync", "--cwd", src.path().to_str().unwrap()]);
    assert!(!output.status.success());
    assert!(stderr_of(&output).contains("helper"), "{}", stderr_of(&output));

    // The failed run must not have advanced the recorded snapshot.
    let state: Value = serde_json::from_slice(&fs::read(&state_path)?)?;
    assert_eq!(state["data"], json!({}));
    Ok(())
}
