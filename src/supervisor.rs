//! Lifecycle of one supervised task
//!
//! A [`TaskSupervisor`] owns a single background loop (a tokio task) which
//! is the only code that touches the child process or its status. Callers
//! talk to the loop through a [`control`](crate::control) mailbox, so
//! Start/Stop/Status requests, process exit and the relaunch timer are
//! processed strictly one at a time in arrival order.
//!
//! # Usage
//!
//! ```ignore
//! let supervisor = TaskSupervisor::new(settings);
//! supervisor.start_loop()?;
//! supervisor.start().await?;
//! // ...
//! supervisor.stop_loop().await; // kills any live process
//! ```
//!
//! The loop must be stopped with [`TaskSupervisor::stop_loop`] before the
//! supervisor is discarded. Dropping a supervisor with a live loop closes
//! its mailbox, which the loop treats like `stop_loop` without anyone
//! waiting for it.

use crate::backlog::{capture_lines, BacklogEntry, EntryKind, OutputBacklog};
use crate::config::{SupervisorDefaults, TaskSettings};
use crate::control::{self, Action, ControlMessage, ControlReceiver, ControlSender};
use crate::error::SupervisorError;
use crate::terminate::{GroupLeader, TerminationEscalator};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Sleep};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How long the loop waits for output capture to drain after an exit
const OUTPUT_DRAIN_TIMEOUT_MS: u64 = 250;

/// State of a supervised task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// No process and no pending relaunch
    #[default]
    Stopped,
    /// Process is being spawned
    Starting,
    /// Process is alive
    Running,
    /// Process exited; waiting out the relaunch interval
    Restarting,
}

/// Snapshot of a task's live state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskInfo {
    pub status: TaskStatus,
    /// Pid of the live process, if any
    pub pid: Option<u32>,
    pub last_launch: Option<DateTime<Utc>>,
    pub last_term: Option<DateTime<Utc>>,
    pub last_error: Option<DateTime<Utc>>,
    pub last_error_message: Option<String>,
}

/// Customizes a task's command right before it is spawned.
///
/// This is where sandboxing (namespaces, rlimits, seccomp, ...) plugs in.
/// An error is recorded as a spawn failure.
pub trait SpawnHook: Send + Sync + 'static {
    fn prepare(&self, settings: &TaskSettings, command: &mut Command) -> std::io::Result<()>;
}

/// Tunables shared by every supervisor in a registry
#[derive(Debug, Clone, Copy)]
pub struct SupervisorOptions {
    pub escalator: TerminationEscalator,
    pub backlog_capacity: usize,
    pub output_drain_timeout: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self::from(&SupervisorDefaults::default())
    }
}

impl From<&SupervisorDefaults> for SupervisorOptions {
    fn from(defaults: &SupervisorDefaults) -> Self {
        Self {
            escalator: TerminationEscalator::new(
                defaults.shutdown_grace_period(),
                defaults.kill_wait(),
            ),
            backlog_capacity: defaults.backlog_capacity,
            output_drain_timeout: Duration::from_millis(OUTPUT_DRAIN_TIMEOUT_MS),
        }
    }
}

struct LoopHandle {
    control: ControlSender<TaskInfo>,
    task: JoinHandle<()>,
}

/// Supervises one task. Share it behind an `Arc`; every method takes `&self`.
pub struct TaskSupervisor {
    id: Uuid,
    settings: TaskSettings,
    options: SupervisorOptions,
    backlog: OutputBacklog,
    spawn_hook: Option<Arc<dyn SpawnHook>>,
    running: Mutex<Option<LoopHandle>>,
}

impl std::fmt::Debug for TaskSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSupervisor")
            .field("id", &self.id)
            .field("settings", &self.settings)
            .field("loop_running", &self.is_loop_running())
            .finish()
    }
}

impl TaskSupervisor {
    pub fn new(settings: TaskSettings) -> Self {
        Self::with_options(settings, SupervisorOptions::default())
    }

    pub fn with_options(settings: TaskSettings, options: SupervisorOptions) -> Self {
        Self {
            id: Uuid::new_v4(),
            backlog: OutputBacklog::new(options.backlog_capacity),
            settings,
            options,
            spawn_hook: None,
            running: Mutex::new(None),
        }
    }

    pub fn with_spawn_hook(mut self, hook: Arc<dyn SpawnHook>) -> Self {
        self.spawn_hook = Some(hook);
        self
    }

    /// Stable identifier used to correlate log lines
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn settings(&self) -> &TaskSettings {
        &self.settings
    }

    /// Copy of the captured output and status notes
    pub fn backlog(&self) -> Vec<BacklogEntry> {
        self.backlog.snapshot()
    }

    pub fn is_loop_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Spawn the background loop. The task itself stays stopped.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_loop(&self) -> Result<(), SupervisorError> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(SupervisorError::LoopAlreadyRunning);
        }

        let (control, mailbox) = control::channel();
        let task_loop = TaskLoop {
            id: self.id,
            settings: self.settings.clone(),
            options: self.options,
            backlog: self.backlog.clone(),
            spawn_hook: self.spawn_hook.clone(),
            info: TaskInfo::default(),
            mailbox,
        };
        let task = tokio::spawn(task_loop.run());

        debug!(task_id = %self.id, "Supervisor loop started");
        *running = Some(LoopHandle { control, task });
        Ok(())
    }

    /// Force-stop any live process and end the loop.
    ///
    /// When this returns the loop task has finished. Does nothing if the
    /// loop is not running.
    pub async fn stop_loop(&self) {
        let Some(handle) = self.running.lock().take() else {
            return;
        };

        if let Err(e) = handle.control.request(Action::Shutdown).await {
            debug!(task_id = %self.id, error = %e, "Loop ended before shutdown reply");
        }
        drop(handle.control);

        if let Err(e) = handle.task.await {
            error!(task_id = %self.id, error = %e, "Supervisor loop panicked");
        }
    }

    /// Start the task, or skip a pending relaunch wait. No-op when running.
    pub async fn start(&self) -> Result<TaskInfo, SupervisorError> {
        self.control()?.request(Action::Start).await
    }

    /// Stop the task, or cancel a pending relaunch. No-op when stopped.
    pub async fn stop(&self) -> Result<TaskInfo, SupervisorError> {
        self.control()?.request(Action::Stop).await
    }

    pub async fn status(&self) -> Result<TaskInfo, SupervisorError> {
        self.control()?.request(Action::Status).await
    }

    fn control(&self) -> Result<ControlSender<TaskInfo>, SupervisorError> {
        self.running
            .lock()
            .as_ref()
            .map(|handle| handle.control.clone())
            .ok_or(SupervisorError::LoopNotRunning)
    }
}

/// A spawned child and the tasks capturing its output
struct RunningProcess {
    leader: GroupLeader,
    captures: Vec<JoinHandle<()>>,
}

enum Phase {
    Idle,
    Running(RunningProcess),
    Restarting(Pin<Box<Sleep>>),
    Done,
}

/// State owned by the background loop
struct TaskLoop {
    id: Uuid,
    settings: TaskSettings,
    options: SupervisorOptions,
    backlog: OutputBacklog,
    spawn_hook: Option<Arc<dyn SpawnHook>>,
    info: TaskInfo,
    mailbox: ControlReceiver<TaskInfo>,
}

impl TaskLoop {
    async fn run(mut self) {
        let mut phase = Phase::Idle;

        loop {
            phase = match phase {
                Phase::Idle => match self.mailbox.recv().await {
                    Some(msg) => self.on_idle_message(msg),
                    None => Phase::Done,
                },
                Phase::Running(mut process) => {
                    tokio::select! {
                        _ = process.leader.exited() => self.on_exit(process).await,
                        msg = self.mailbox.recv() => match msg {
                            Some(msg) => self.on_running_message(msg, process).await,
                            None => {
                                self.stop_process(process).await;
                                Phase::Done
                            }
                        },
                    }
                }
                Phase::Restarting(mut wait) => {
                    tokio::select! {
                        _ = &mut wait => {
                            debug!(task_id = %self.id, "Relaunch interval elapsed");
                            self.launch()
                        }
                        msg = self.mailbox.recv() => match msg {
                            Some(msg) => self.on_restarting_message(msg, wait),
                            None => Phase::Done,
                        },
                    }
                }
                Phase::Done => break,
            };
        }

        self.mailbox.close();
        debug!(task_id = %self.id, "Supervisor loop stopped");
    }

    fn on_idle_message(&mut self, msg: ControlMessage<TaskInfo>) -> Phase {
        let next = match msg.action() {
            Action::Start => self.launch(),
            Action::Stop | Action::Status => Phase::Idle,
            Action::Shutdown => Phase::Done,
        };
        msg.reply(self.info.clone());
        next
    }

    async fn on_running_message(
        &mut self,
        msg: ControlMessage<TaskInfo>,
        process: RunningProcess,
    ) -> Phase {
        let next = match msg.action() {
            Action::Start | Action::Status => Phase::Running(process),
            Action::Stop => {
                self.stop_process(process).await;
                Phase::Idle
            }
            Action::Shutdown => {
                self.stop_process(process).await;
                Phase::Done
            }
        };
        msg.reply(self.info.clone());
        next
    }

    fn on_restarting_message(
        &mut self,
        msg: ControlMessage<TaskInfo>,
        wait: Pin<Box<Sleep>>,
    ) -> Phase {
        let next = match msg.action() {
            Action::Status => Phase::Restarting(wait),
            Action::Start => {
                self.backlog.note("relaunch wait skipped");
                self.launch()
            }
            Action::Stop => {
                self.backlog.note("relaunch cancelled");
                self.info.status = TaskStatus::Stopped;
                self.backlog.note("stopped");
                info!(task_id = %self.id, "Relaunch cancelled, task stopped");
                Phase::Idle
            }
            Action::Shutdown => {
                self.info.status = TaskStatus::Stopped;
                Phase::Done
            }
        };
        msg.reply(self.info.clone());
        next
    }

    /// Spawn the process; a failure counts as an immediate exit
    fn launch(&mut self) -> Phase {
        self.info.status = TaskStatus::Starting;

        match self.spawn() {
            Ok(process) => {
                let pid = process.leader.id();
                self.info.status = TaskStatus::Running;
                self.info.pid = pid;
                self.info.last_launch = Some(Utc::now());
                match pid {
                    Some(pid) => self.backlog.note(format!("started (pid {pid})")),
                    None => self.backlog.note("started"),
                }
                info!(task_id = %self.id, ?pid, "Task process spawned");
                Phase::Running(process)
            }
            Err(e) => {
                self.info.last_error = Some(Utc::now());
                self.info.last_error_message = Some(e.to_string());
                self.backlog.note(format!("failed to start: {e}"));
                warn!(task_id = %self.id, error = %e, "Failed to spawn task process");
                self.after_exit()
            }
        }
    }

    fn spawn(&self) -> std::io::Result<RunningProcess> {
        let program = self.settings.program().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "no program configured")
        })?;

        let mut cmd = Command::new(program);
        cmd.args(self.settings.args.iter().skip(1));
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        if let Some(ref dir) = self.settings.dir {
            cmd.current_dir(dir);
        }

        for (key, value) in &self.settings.env {
            cmd.env(key, value);
        }

        #[cfg(unix)]
        {
            // Own group, so termination reaches every descendant.
            cmd.process_group(0);

            if let Some(identity) = self.settings.identity {
                if let Some(gid) = identity.gid {
                    cmd.gid(gid);
                }
                if let Some(uid) = identity.uid {
                    cmd.uid(uid);
                }
            }
        }

        if let Some(ref hook) = self.spawn_hook {
            hook.prepare(&self.settings, &mut cmd)?;
        }

        let mut child = cmd.spawn()?;

        let mut captures = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            captures.push(tokio::spawn(capture_lines(
                stdout,
                EntryKind::Stdout,
                self.backlog.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            captures.push(tokio::spawn(capture_lines(
                stderr,
                EntryKind::Stderr,
                self.backlog.clone(),
            )));
        }

        Ok(RunningProcess {
            leader: GroupLeader::new(child),
            captures,
        })
    }

    async fn on_exit(&mut self, process: RunningProcess) -> Phase {
        let RunningProcess {
            mut leader,
            captures,
        } = process;

        // Reaping sweeps the group, so background children die with the task.
        let result = leader.reap().await;
        self.drain_output(captures).await;
        self.info.last_term = Some(Utc::now());
        self.info.pid = None;

        match result {
            Ok(status) => {
                self.backlog.note(format!("exited ({status})"));
                info!(task_id = %self.id, ?status, "Task process exited");
            }
            Err(e) => {
                self.backlog.note(format!("exited (wait failed: {e})"));
                warn!(task_id = %self.id, error = %e, "Failed to wait on task process");
            }
        }

        self.after_exit()
    }

    /// Relaunch-or-stop decision shared by exits and spawn failures
    fn after_exit(&mut self) -> Phase {
        if !self.settings.relaunch {
            self.info.status = TaskStatus::Stopped;
            return Phase::Idle;
        }

        let interval = self.settings.relaunch_interval();
        self.info.status = TaskStatus::Restarting;
        self.backlog
            .note(format!("restarting in {}s", interval.as_secs()));
        debug!(task_id = %self.id, interval_secs = interval.as_secs(), "Waiting to relaunch");
        Phase::Restarting(Box::pin(tokio::time::sleep(interval)))
    }

    async fn stop_process(&mut self, process: RunningProcess) {
        let RunningProcess {
            mut leader,
            captures,
        } = process;

        let termination = self
            .options
            .escalator
            .terminate(&mut leader, &self.backlog)
            .await;
        self.drain_output(captures).await;

        self.info.status = TaskStatus::Stopped;
        self.info.pid = None;
        self.info.last_term = Some(Utc::now());
        self.backlog.note("stopped");
        info!(task_id = %self.id, ?termination, "Task stopped");
    }

    /// Let capture tasks flush what the process wrote before it went away.
    /// Stragglers (pipes held open by orphaned descendants) are aborted.
    async fn drain_output(&self, captures: Vec<JoinHandle<()>>) {
        let deadline = Instant::now() + self.options.output_drain_timeout;
        for mut capture in captures {
            if tokio::time::timeout_at(deadline, &mut capture).await.is_err() {
                debug!(task_id = %self.id, "Output capture did not drain in time");
                capture.abort();
            }
        }
    }
}
