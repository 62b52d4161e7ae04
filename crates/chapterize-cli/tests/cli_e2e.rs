use std::fs;

use assert_cmd::Command;
use predicates::str::contains;
use tempfile::tempdir;

fn chapterize() -> Command {
    Command::cargo_bin("chapterize").expect("binary builds")
}

#[test]
fn missing_source_path_exits_with_permanent_code() {
    let td = tempdir().unwrap();
    let missing = td.path().join("does-not-exist");

    chapterize()
        .arg(&missing)
        .assert()
        .code(2)
        .stderr(contains("does not exist"));
}

#[test]
fn dry_run_on_empty_source_directory_does_not_crash() {
    let td = tempdir().unwrap();
    let source = td.path().join("EmptyBook");
    fs::create_dir_all(&source).unwrap();

    let work_dir = td.path().join("work");
    let manifest_dir = td.path().join("manifests");
    let lock_dir = td.path().join("locks");
    let failed_dir = td.path().join("failed");
    let log_dir = td.path().join("logs");

    // An empty source directory has no audio files, so validate fails
    // permanently and the book is quarantined rather than retried forever.
    chapterize()
        .arg(&source)
        .arg("--dry-run")
        .env("WORK_DIR", &work_dir)
        .env("MANIFEST_DIR", &manifest_dir)
        .env("LOCK_DIR", &lock_dir)
        .env("FAILED_DIR", &failed_dir)
        .env("LOG_DIR", &log_dir)
        .assert()
        .code(2);
}

#[test]
fn no_lock_flag_is_accepted() {
    let td = tempdir().unwrap();
    let missing = td.path().join("nope");

    // Argument parsing must accept --no-lock even on the early-exit path
    // for a source that doesn't exist.
    chapterize().arg(&missing).arg("--no-lock").assert().code(2);
}
