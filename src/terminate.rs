//! Graceful-then-forceful shutdown of a supervised process group
//!
//! Children are spawned as leaders of their own process group, so signalling
//! the group reaches every descendant. The sequence is:
//!
//! 1. SIGTERM to the group, wait up to the grace period
//! 2. SIGKILL to the group, wait up to the kill wait
//! 3. kill the direct child handle, wait up to the kill wait
//! 4. give up and report [`Termination::Abandoned`]
//!
//! The whole sequence is bounded by [`TerminationEscalator::max_duration`].
//!
//! A [`GroupLeader`] notices its child's exit without reaping it. The exited
//! leader stays a zombie, which keeps its pid (and so the group id) from
//! being reused, until [`GroupLeader::reap`] has swept whatever is left of
//! the group. Where process groups are unavailable only the direct child is
//! signalled.

use crate::backlog::OutputBacklog;
use std::io;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::Child;
#[cfg(unix)]
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(1000);
pub const DEFAULT_KILL_WAIT: Duration = Duration::from_millis(500);

/// How a terminated process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Exited on its own or within the grace period after SIGTERM
    Graceful(ExitStatus),
    /// Exited only after SIGKILL
    Killed(ExitStatus),
    /// Survived every signal; the handle was given up
    Abandoned,
}

impl Termination {
    pub fn exit_status(&self) -> Option<ExitStatus> {
        match self {
            Termination::Graceful(status) | Termination::Killed(status) => Some(*status),
            Termination::Abandoned => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupSignal {
    Terminate,
    Kill,
}

#[derive(Debug)]
enum ExitState {
    /// A watcher thread reports the exit and leaves the child unreaped
    #[cfg(unix)]
    Watching(oneshot::Receiver<()>),
    /// Exit is noticed by `Child::wait`, which also reaps
    Reaping,
    Exited,
}

/// A spawned child leading its own process group
#[derive(Debug)]
pub struct GroupLeader {
    child: Child,
    pid: Option<u32>,
    state: ExitState,
}

impl GroupLeader {
    /// Take charge of a freshly spawned `child`.
    ///
    /// Take its stdout/stderr handles first.
    pub fn new(child: Child) -> Self {
        let pid = child.id();
        let state = match pid {
            Some(pid) => watch_exit(pid),
            None => ExitState::Reaping,
        };
        Self { child, pid, state }
    }

    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    /// Resolves once the leader has exited. Cancel safe.
    pub async fn exited(&mut self) {
        match &mut self.state {
            #[cfg(unix)]
            ExitState::Watching(rx) => {
                // A dropped sender means the watcher gave up; treat it as an exit.
                let _ = rx.await;
            }
            ExitState::Reaping => {
                if let Err(e) = self.child.wait().await {
                    debug!(pid = ?self.pid, error = %e, "Error waiting for process");
                }
            }
            ExitState::Exited => return,
        }
        self.state = ExitState::Exited;
    }

    /// True if the leader is known to have exited, without waiting
    fn has_exited(&mut self) -> bool {
        let exited = match &mut self.state {
            #[cfg(unix)]
            ExitState::Watching(rx) => !matches!(
                rx.try_recv(),
                Err(oneshot::error::TryRecvError::Empty)
            ),
            ExitState::Reaping => matches!(self.child.try_wait(), Ok(Some(_))),
            ExitState::Exited => true,
        };
        if exited {
            self.state = ExitState::Exited;
        }
        exited
    }

    /// Wait for the leader to exit, SIGKILL what remains of its group, then
    /// reap the leader.
    pub async fn reap(&mut self) -> io::Result<ExitStatus> {
        self.exited().await;
        sweep_group(self.pid);
        self.child.wait().await
    }

    /// Signal the child's process group, or the child alone when group
    /// signalling fails or is unsupported
    #[cfg(unix)]
    fn signal(&mut self, signal: GroupSignal) {
        let Some(pid) = self.pid else {
            return;
        };
        let signo = match signal {
            GroupSignal::Terminate => libc::SIGTERM,
            GroupSignal::Kill => libc::SIGKILL,
        };

        // The child is its group's leader, so its pid is the pgid.
        let rc = unsafe { libc::killpg(pid as libc::pid_t, signo) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            debug!(pid, error = %err, "killpg failed, signalling direct child");
            match signal {
                GroupSignal::Terminate => unsafe {
                    libc::kill(pid as libc::pid_t, signo);
                },
                GroupSignal::Kill => self.kill_direct(),
            }
        }
    }

    #[cfg(not(unix))]
    fn signal(&mut self, _signal: GroupSignal) {
        self.kill_direct();
    }

    fn kill_direct(&mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!(pid = ?self.pid, error = %e, "Direct kill failed");
        }
    }
}

/// Block a dedicated thread in `waitid(WNOWAIT)` until `pid` exits.
///
/// A plain thread rather than `spawn_blocking`, so a process that never dies
/// cannot hold up runtime shutdown.
#[cfg(unix)]
fn watch_exit(pid: u32) -> ExitState {
    let (tx, rx) = oneshot::channel();
    let spawned = std::thread::Builder::new()
        .name(format!("goule-exit-{pid}"))
        .spawn(move || {
            wait_exit_unreaped(pid);
            let _ = tx.send(());
        });

    match spawned {
        Ok(_) => ExitState::Watching(rx),
        Err(e) => {
            warn!(pid, error = %e, "Failed to start exit watcher, falling back to reaping wait");
            ExitState::Reaping
        }
    }
}

#[cfg(not(unix))]
fn watch_exit(_pid: u32) -> ExitState {
    ExitState::Reaping
}

#[cfg(unix)]
fn wait_exit_unreaped(pid: u32) {
    loop {
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        let rc = unsafe {
            libc::waitid(
                libc::P_PID,
                pid as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOWAIT,
            )
        };
        if rc == 0 {
            return;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            debug!(pid, error = %err, "waitid failed, assuming process exited");
            return;
        }
    }
}

/// SIGKILL whatever is left of the group. Only called while the leader is
/// unreaped, so the group id cannot belong to anyone else.
#[cfg(unix)]
fn sweep_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        // ESRCH here just means the group is already empty.
        unsafe {
            libc::killpg(pid as libc::pid_t, libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn sweep_group(_pid: Option<u32>) {}

#[derive(Debug, Clone, Copy)]
pub struct TerminationEscalator {
    grace_period: Duration,
    kill_wait: Duration,
}

impl Default for TerminationEscalator {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE_PERIOD, DEFAULT_KILL_WAIT)
    }
}

impl TerminationEscalator {
    pub fn new(grace_period: Duration, kill_wait: Duration) -> Self {
        Self {
            grace_period,
            kill_wait,
        }
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Upper bound on how long [`terminate`](Self::terminate) can take
    pub fn max_duration(&self) -> Duration {
        self.grace_period + self.kill_wait * 2
    }

    /// End `leader` and every process in its group, noting each step in `backlog`
    pub async fn terminate(
        &self,
        leader: &mut GroupLeader,
        backlog: &OutputBacklog,
    ) -> Termination {
        let pid = leader.id();

        if leader.has_exited() {
            debug!(?pid, "Process already exited before termination");
            return match leader.reap().await {
                Ok(status) => Termination::Graceful(status),
                Err(e) => {
                    warn!(?pid, error = %e, "Failed to reap exited process");
                    Termination::Abandoned
                }
            };
        }

        backlog.note("sending SIGTERM to process group");
        info!(?pid, "Sending SIGTERM to process group");
        leader.signal(GroupSignal::Terminate);

        if timeout(self.grace_period, leader.exited()).await.is_ok() {
            match leader.reap().await {
                Ok(status) => {
                    backlog.note(format!("process exited after SIGTERM ({status})"));
                    info!(?pid, ?status, "Process exited gracefully");
                    return Termination::Graceful(status);
                }
                Err(e) => warn!(?pid, error = %e, "Error waiting for process to exit"),
            }
        }

        backlog.note(format!(
            "grace period of {}ms elapsed, sending SIGKILL to process group",
            self.grace_period.as_millis()
        ));
        warn!(
            ?pid,
            grace_period_ms = self.grace_period.as_millis() as u64,
            "Grace period exceeded, sending SIGKILL"
        );
        leader.signal(GroupSignal::Kill);

        if let Some(status) = self.wait_killed(leader).await {
            backlog.note(format!("process killed ({status})"));
            return Termination::Killed(status);
        }

        backlog.note("process group ignored SIGKILL, killing direct child");
        warn!(?pid, "Process group still alive after SIGKILL, killing direct child");
        leader.kill_direct();

        if let Some(status) = self.wait_killed(leader).await {
            backlog.note(format!("process killed ({status})"));
            return Termination::Killed(status);
        }

        backlog.note("process did not exit after SIGKILL, abandoning it");
        warn!(?pid, "Process did not exit after SIGKILL; abandoning it");
        Termination::Abandoned
    }

    async fn wait_killed(&self, leader: &mut GroupLeader) -> Option<ExitStatus> {
        timeout(self.kill_wait, leader.exited()).await.ok()?;
        leader.reap().await.ok()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::backlog::EntryKind;
    use std::process::Stdio;
    use std::time::Instant;
    use tokio::process::Command;

    fn spawn_shell(script: &str) -> GroupLeader {
        GroupLeader::new(spawn_child(script))
    }

    fn spawn_child(script: &str) -> Child {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .process_group(0);
        cmd.spawn().unwrap()
    }

    fn escalator() -> TerminationEscalator {
        TerminationEscalator::new(Duration::from_millis(500), Duration::from_millis(300))
    }

    #[test]
    fn test_max_duration() {
        let e = TerminationEscalator::new(Duration::from_secs(1), Duration::from_millis(500));
        assert_eq!(e.max_duration(), Duration::from_secs(2));
        assert_eq!(
            TerminationEscalator::default().grace_period(),
            DEFAULT_GRACE_PERIOD
        );
    }

    #[tokio::test]
    async fn test_sigterm_ends_cooperative_process() {
        let backlog = OutputBacklog::new(16);
        let mut leader = spawn_shell("sleep 30");

        let result = escalator().terminate(&mut leader, &backlog).await;

        assert!(matches!(result, Termination::Graceful(_)));
        let notes: Vec<String> = backlog.snapshot().into_iter().map(|e| e.text).collect();
        assert_eq!(notes[0], "sending SIGTERM to process group");
        assert!(notes[1].starts_with("process exited after SIGTERM"));
    }

    #[tokio::test]
    async fn test_sigkill_ends_process_ignoring_sigterm() {
        let backlog = OutputBacklog::new(16);
        let mut leader = spawn_shell("trap '' TERM; while true; do sleep 1; done");
        // Give the shell time to install its trap.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let escalator = escalator();
        let started = Instant::now();
        let result = escalator.terminate(&mut leader, &backlog).await;

        assert!(matches!(result, Termination::Killed(_)));
        assert!(started.elapsed() < escalator.max_duration() + Duration::from_millis(200));
        assert!(backlog
            .snapshot()
            .iter()
            .all(|e| e.kind == EntryKind::Status));
        assert!(backlog
            .snapshot()
            .iter()
            .any(|e| e.text.contains("sending SIGKILL")));
    }

    #[tokio::test]
    async fn test_already_exited_process_is_graceful() {
        let backlog = OutputBacklog::new(16);
        let mut leader = spawn_shell("exit 3");
        tokio::time::sleep(Duration::from_millis(200)).await;

        let result = escalator().terminate(&mut leader, &backlog).await;

        let status = result.exit_status().unwrap();
        assert_eq!(status.code(), Some(3));
        assert!(backlog.is_empty());
    }

    /// Scheduler state letter from /proc, `None` once the pid is gone
    #[cfg(target_os = "linux")]
    fn process_state(pid: u32) -> Option<char> {
        let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
        stat.rsplit(')').next()?.trim_start().chars().next()
    }

    /// Wait until `pid` is gone; orphans are reaped by init, so a zombie counts
    #[cfg(target_os = "linux")]
    async fn assert_gone(pid: u32) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !matches!(process_state(pid), None | Some('Z')) {
            assert!(Instant::now() < deadline, "process {pid} survived");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Spawn `script`, which prints a background child's pid as its first line
    #[cfg(target_os = "linux")]
    async fn spawn_with_background_child(script: &str) -> (GroupLeader, u32) {
        use tokio::io::{AsyncBufReadExt, BufReader};

        let mut child = spawn_child(script);
        let stdout = child.stdout.take().unwrap();
        let mut line = String::new();
        BufReader::new(stdout).read_line(&mut line).await.unwrap();
        (GroupLeader::new(child), line.trim().parse().unwrap())
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_descendants_are_terminated_with_the_group() {
        let backlog = OutputBacklog::new(16);
        let (mut leader, grandchild) =
            spawn_with_background_child("sleep 30 & echo $!; wait").await;

        escalator().terminate(&mut leader, &backlog).await;

        assert_gone(grandchild).await;
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_reap_kills_descendants_of_a_leader_that_exited_on_its_own() {
        let (mut leader, grandchild) =
            spawn_with_background_child("sleep 30 >/dev/null 2>&1 & echo $!; exit 0").await;

        leader.exited().await;
        let status = leader.reap().await.unwrap();

        assert!(status.success());
        assert_gone(grandchild).await;
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_exited_leader_holds_its_pid_until_reaped() {
        let mut leader = spawn_shell("exit 7");
        let pid = leader.id().unwrap();

        leader.exited().await;
        // Still a zombie, so the pid and group id cannot be handed out again.
        assert_eq!(process_state(pid), Some('Z'));

        let status = leader.reap().await.unwrap();
        assert_eq!(status.code(), Some(7));
        assert_eq!(process_state(pid), None);
    }
}
