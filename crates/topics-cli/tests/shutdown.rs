//! Integration tests for the `topics schedule` loop: pidfile lifecycle and
//! clean exit on SIGTERM.

use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use tempfile::TempDir;

fn topics_binary() -> PathBuf {
    assert_cmd::cargo::cargo_bin!("topics").into()
}

fn spawn_schedule(data_dir: &TempDir) -> std::process::Child {
    Command::new(topics_binary())
        .args(["schedule", "--interval-secs", "3600"])
        .env("TOPICS_DATA_DIR", data_dir.path())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to spawn topics schedule")
}

/// Wait for the pidfile to appear, indicating the loop has started.
fn wait_for_pidfile(data_dir: &TempDir) -> bool {
    let pidfile = data_dir.path().join("topics-schedule.pid");
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if pidfile.exists() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    false
}

#[cfg(unix)]
fn terminate(child: &std::process::Child) {
    unsafe {
        libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(unix)]
#[test]
fn schedule_exits_on_sigterm() {
    let dir = TempDir::new().unwrap();
    let mut child = spawn_schedule(&dir);
    assert!(wait_for_pidfile(&dir), "pidfile never appeared");
    // let the first tick commit epoch 0
    std::thread::sleep(Duration::from_millis(300));

    terminate(&child);

    let start = Instant::now();
    let status = child.wait().expect("wait");
    let elapsed = start.elapsed();

    assert!(status.success(), "schedule should exit 0 on SIGTERM, got {status}");
    assert!(elapsed < Duration::from_secs(2), "took {elapsed:?}");
}

#[cfg(unix)]
#[test]
fn pidfile_created_and_removed_on_exit() {
    let dir = TempDir::new().unwrap();
    let pidfile = dir.path().join("topics-schedule.pid");

    let mut child = spawn_schedule(&dir);
    assert!(wait_for_pidfile(&dir), "pidfile never appeared");

    let content = std::fs::read_to_string(&pidfile).unwrap();
    let file_pid: u32 = content
        .trim()
        .parse()
        .expect("pidfile should contain a PID");
    assert_eq!(file_pid, child.id(), "pidfile PID should match child PID");

    terminate(&child);
    child.wait().expect("wait");

    assert!(
        !pidfile.exists(),
        "pidfile should be removed after clean shutdown"
    );
}

#[cfg(unix)]
#[test]
fn second_scheduler_refuses_to_start() {
    let dir = TempDir::new().unwrap();
    let pidfile = dir.path().join("topics-schedule.pid");
    let mut first = spawn_schedule(&dir);
    assert!(wait_for_pidfile(&dir), "pidfile never appeared");

    let second = spawn_schedule(&dir).wait_with_output().expect("wait");
    assert!(!second.status.success(), "second scheduler should fail");
    let stderr = String::from_utf8_lossy(&second.stderr);
    assert!(stderr.contains("another scheduler"), "stderr: {stderr}");

    // the running scheduler keeps its claim
    let content = std::fs::read_to_string(&pidfile).unwrap();
    assert_eq!(content.trim(), first.id().to_string());

    terminate(&first);
    first.wait().expect("wait");
}

#[cfg(unix)]
#[test]
fn stale_pidfile_is_replaced() {
    let dir = TempDir::new().unwrap();
    let pidfile = dir.path().join("topics-schedule.pid");
    std::fs::write(&pidfile, "not-a-pid").unwrap();

    let mut child = spawn_schedule(&dir);
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut claimed = false;
    while Instant::now() < deadline {
        if std::fs::read_to_string(&pidfile).is_ok_and(|c| c.trim() == child.id().to_string()) {
            claimed = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    assert!(claimed, "scheduler never claimed the pidfile");

    terminate(&child);
    assert!(child.wait().expect("wait").success());
}

#[cfg(unix)]
#[test]
fn wal_checkpoint_on_exit() {
    let dir = TempDir::new().unwrap();
    let mut child = spawn_schedule(&dir);
    assert!(wait_for_pidfile(&dir), "pidfile never appeared");
    std::thread::sleep(Duration::from_millis(300));

    terminate(&child);
    child.wait().expect("wait");

    let wal_path = dir.path().join("topics.db-wal");
    if wal_path.exists() {
        let wal_size = std::fs::metadata(&wal_path).unwrap().len();
        assert_eq!(
            wal_size, 0,
            "WAL should be empty after TRUNCATE checkpoint, was {wal_size} bytes"
        );
    }

    let output = {
        #[allow(deprecated)]
        let mut cmd = assert_cmd::Command::cargo_bin("topics").unwrap();
        cmd.env("TOPICS_DATA_DIR", dir.path())
            .args(["--json", "status"])
            .output()
            .unwrap()
    };
    let status: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(status["committed_epochs"][0], 0, "first tick computed epoch 0");
}
