//! Integration tests for task supervision

#![cfg(unix)]

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use goule::backlog::EntryKind;
use goule::config::{SupervisorDefaults, TaskSettings};
use goule::supervisor::{SupervisorOptions, TaskInfo, TaskStatus, TaskSupervisor};
use tempfile::TempDir;

/// Settings running `script` under /bin/sh inside `dir`
fn shell(dir: &Path, script: &str) -> TaskSettings {
    TaskSettings::command("/bin/sh")
        .with_args(["-c", script])
        .with_dir(dir)
}

/// Poll `status()` until it reports `expected`
async fn wait_for_status(
    supervisor: &TaskSupervisor,
    expected: TaskStatus,
    timeout: Duration,
) -> TaskInfo {
    let start = Instant::now();
    loop {
        let info = supervisor.status().await.unwrap();
        if info.status == expected {
            return info;
        }
        assert!(
            start.elapsed() < timeout,
            "timed out waiting for {:?}, last status {:?}",
            expected,
            info.status
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Poll until `path` exists
async fn wait_for_file(path: &Path, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if path.exists() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

fn pid_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

/// True once `pid` is dead. Orphans are reaped by init, so a zombie counts.
fn process_gone(pid: u32) -> bool {
    if !pid_alive(pid) {
        return true;
    }
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| stat.rsplit(')').next().map(|rest| rest.trim_start().starts_with('Z')))
        .unwrap_or(false)
}

/// Read the pid a script wrote to `path`
async fn read_pid(path: &Path) -> u32 {
    assert!(wait_for_file(path, Duration::from_secs(5)).await);
    let start = Instant::now();
    loop {
        let text = std::fs::read_to_string(path).unwrap();
        if let Ok(pid) = text.trim().parse() {
            return pid;
        }
        assert!(start.elapsed() < Duration::from_secs(5), "no pid in {}", path.display());
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

async fn assert_gone_within(pid: u32, timeout: Duration) {
    let start = Instant::now();
    while !process_gone(pid) {
        assert!(start.elapsed() < timeout, "process {pid} outlived its task");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

// ============================================================================
// Run and relaunch
// ============================================================================

#[tokio::test]
async fn test_run_once_writes_file() {
    let dir = TempDir::new().unwrap();
    let supervisor = TaskSupervisor::new(shell(dir.path(), "echo hi > out.txt"));
    supervisor.start_loop().unwrap();

    supervisor.start().await.unwrap();
    let info = wait_for_status(&supervisor, TaskStatus::Stopped, Duration::from_secs(5)).await;

    assert_eq!(
        std::fs::read_to_string(dir.path().join("out.txt")).unwrap(),
        "hi\n"
    );
    assert!(info.last_launch.is_some());
    assert!(info.last_term.is_some());
    assert!(info.pid.is_none());

    supervisor.stop_loop().await;
}

#[tokio::test]
async fn test_relaunch_recreates_file() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("out.txt");
    let supervisor = TaskSupervisor::new(shell(dir.path(), "echo hi > out.txt").with_relaunch(1));
    supervisor.start_loop().unwrap();

    supervisor.start().await.unwrap();
    wait_for_status(&supervisor, TaskStatus::Restarting, Duration::from_secs(5)).await;
    std::fs::remove_file(&file).unwrap();

    assert!(
        wait_for_file(&file, Duration::from_secs(2)).await,
        "file was not recreated by the relaunch"
    );

    let notes: Vec<String> = supervisor
        .backlog()
        .into_iter()
        .filter(|e| e.kind == EntryKind::Status)
        .map(|e| e.text)
        .collect();
    assert!(notes.iter().any(|n| n == "restarting in 1s"));

    supervisor.stop_loop().await;
}

#[tokio::test]
async fn test_stop_during_relaunch_wait_cancels_relaunch() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("out.txt");
    let supervisor = TaskSupervisor::new(shell(dir.path(), "echo hi > out.txt").with_relaunch(1));
    supervisor.start_loop().unwrap();

    supervisor.start().await.unwrap();
    wait_for_status(&supervisor, TaskStatus::Restarting, Duration::from_secs(5)).await;
    std::fs::remove_file(&file).unwrap();

    let info = supervisor.stop().await.unwrap();
    assert_eq!(info.status, TaskStatus::Stopped);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(supervisor.status().await.unwrap().status, TaskStatus::Stopped);
    assert!(!file.exists(), "cancelled relaunch still ran");

    supervisor.stop_loop().await;
}

// ============================================================================
// Stopping
// ============================================================================

#[tokio::test]
async fn test_stop_escalates_for_process_ignoring_sigterm() {
    let dir = TempDir::new().unwrap();
    let supervisor = TaskSupervisor::new(shell(
        dir.path(),
        "trap '' TERM; while true; do sleep 1; done",
    ));
    supervisor.start_loop().unwrap();

    let pid = supervisor.start().await.unwrap().pid.unwrap();
    // Give the shell time to install its trap.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = Instant::now();
    let info = supervisor.stop().await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(info.status, TaskStatus::Stopped);
    assert!(!pid_alive(pid));

    supervisor.stop_loop().await;
}

#[tokio::test]
async fn test_no_process_survives_stop_loop() {
    let dir = TempDir::new().unwrap();
    let supervisor = TaskSupervisor::new(shell(dir.path(), "sleep 30").with_relaunch(1));
    supervisor.start_loop().unwrap();

    let pid = supervisor.start().await.unwrap().pid.unwrap();
    assert!(pid_alive(pid));

    supervisor.stop_loop().await;

    assert!(!supervisor.is_loop_running());
    assert!(!pid_alive(pid));
}

#[tokio::test]
async fn test_background_children_die_when_task_exits_on_its_own() {
    let dir = TempDir::new().unwrap();
    let supervisor = TaskSupervisor::new(shell(
        dir.path(),
        "sleep 30 >/dev/null 2>&1 & echo $! > child.pid; exit 0",
    ));
    supervisor.start_loop().unwrap();

    supervisor.start().await.unwrap();
    wait_for_status(&supervisor, TaskStatus::Stopped, Duration::from_secs(5)).await;
    let background = read_pid(&dir.path().join("child.pid")).await;

    assert_gone_within(background, Duration::from_secs(2)).await;

    supervisor.stop_loop().await;
    assert!(process_gone(background));
}

#[tokio::test]
async fn test_relaunch_cycles_do_not_accumulate_children() {
    let dir = TempDir::new().unwrap();
    let supervisor = TaskSupervisor::new(
        shell(
            dir.path(),
            "sleep 30 >/dev/null 2>&1 & echo $! >> children.pid; exit 1",
        )
        .with_relaunch(0),
    );
    supervisor.start_loop().unwrap();
    supervisor.start().await.unwrap();

    let pids_file = dir.path().join("children.pid");
    let start = Instant::now();
    let pids: Vec<u32> = loop {
        let text = std::fs::read_to_string(&pids_file).unwrap_or_default();
        let pids: Vec<u32> = text.lines().filter_map(|l| l.trim().parse().ok()).collect();
        if pids.len() >= 3 {
            break pids;
        }
        assert!(start.elapsed() < Duration::from_secs(5), "task did not relaunch");
        tokio::time::sleep(Duration::from_millis(25)).await;
    };

    supervisor.stop_loop().await;

    for pid in pids {
        assert_gone_within(pid, Duration::from_secs(2)).await;
    }
}

#[tokio::test]
async fn test_custom_grace_period_from_defaults() {
    let defaults = SupervisorDefaults {
        shutdown_grace_period_ms: 200,
        kill_wait_ms: 100,
        backlog_capacity: 10,
    };
    let dir = TempDir::new().unwrap();
    let supervisor = TaskSupervisor::with_options(
        shell(dir.path(), "trap '' TERM; while true; do sleep 1; done"),
        SupervisorOptions::from(&defaults),
    );
    supervisor.start_loop().unwrap();
    supervisor.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = Instant::now();
    supervisor.stop().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));

    supervisor.stop_loop().await;
}

// ============================================================================
// Concurrency and output
// ============================================================================

#[tokio::test]
async fn test_concurrent_control_calls_leave_consistent_state() {
    let dir = TempDir::new().unwrap();
    let supervisor = Arc::new(TaskSupervisor::new(shell(dir.path(), "sleep 30")));
    supervisor.start_loop().unwrap();

    let mut handles = Vec::new();
    for i in 0..20 {
        let supervisor = Arc::clone(&supervisor);
        handles.push(tokio::spawn(async move {
            if i % 2 == 0 {
                supervisor.start().await
            } else {
                supervisor.stop().await
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let info = supervisor.status().await.unwrap();
    match info.status {
        TaskStatus::Running => assert!(pid_alive(info.pid.unwrap())),
        TaskStatus::Stopped => assert!(info.pid.is_none()),
        other => panic!("unexpected status {:?}", other),
    }

    supervisor.stop_loop().await;
    if let Some(pid) = info.pid {
        assert!(!pid_alive(pid));
    }
}

#[tokio::test]
async fn test_backlog_holds_last_lines_only() {
    let defaults = SupervisorDefaults {
        backlog_capacity: 5,
        ..Default::default()
    };
    let dir = TempDir::new().unwrap();
    let supervisor = TaskSupervisor::with_options(
        shell(dir.path(), "for i in 1 2 3 4 5 6 7 8 9 10; do echo line$i; done"),
        SupervisorOptions::from(&defaults),
    );
    supervisor.start_loop().unwrap();

    supervisor.start().await.unwrap();
    wait_for_status(&supervisor, TaskStatus::Stopped, Duration::from_secs(5)).await;

    let backlog = supervisor.backlog();
    assert_eq!(backlog.len(), 5);
    // Output is drained before the exit note is written.
    let last = backlog.last().unwrap();
    assert_eq!(last.kind, EntryKind::Status);
    assert!(last.text.starts_with("exited"));
    let stdout: Vec<&str> = backlog
        .iter()
        .filter(|e| e.kind == EntryKind::Stdout)
        .map(|e| e.text.as_str())
        .collect();
    assert_eq!(stdout, vec!["line7", "line8", "line9", "line10"]);

    supervisor.stop_loop().await;
}
