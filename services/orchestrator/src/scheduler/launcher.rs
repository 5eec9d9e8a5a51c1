//! Starting groups as isolated units of work.
//!
//! [`ProcessLauncher`] re-executes the orchestrator binary as
//! `orchestrator run-group`: the [`GroupJob`] goes in as JSON on stdin and
//! [`GroupEvent`] lines come back on stdout. [`TaskLauncher`] runs the
//! group in-process on the runtime.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use async_trait::async_trait;
use emufleet_events::{GroupEvent, GroupExit};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{FleetError, Result};
use crate::runner::{GroupJob, GroupRunner, GroupSink};

/// Subcommand a child process is started with.
pub const RUN_GROUP_COMMAND: &str = "run-group";

/// A started group.
#[derive(Debug)]
pub struct GroupHandle {
    pub pid: Option<u32>,
    /// Fire to terminate the group.
    pub kill: oneshot::Sender<()>,
    /// Resolves once the group has ended.
    pub done: JoinHandle<GroupExit>,
}

/// Wait for a group to end, mapping a panicked or aborted watcher to a
/// failure.
pub async fn join(done: JoinHandle<GroupExit>) -> GroupExit {
    match done.await {
        Ok(exit) => exit,
        Err(e) if e.is_cancelled() => GroupExit::Terminated,
        Err(e) => GroupExit::Failed {
            detail: e.to_string(),
        },
    }
}

#[async_trait]
pub trait GroupLauncher: Send + Sync {
    /// Start `job`, delivering its events to `sink`.
    async fn launch(&self, job: GroupJob, sink: Arc<dyn GroupSink>) -> Result<GroupHandle>;
}

/// Runs each group in a child OS process.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    envs: Vec<(OsString, OsString)>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            envs: Vec::new(),
        }
    }

    /// Set an environment variable for every child, on top of the
    /// inherited environment.
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Launcher that re-executes the running binary.
    pub fn current_exe() -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }
}

fn exit_from(status: std::io::Result<ExitStatus>) -> GroupExit {
    match status {
        Ok(status) if status.success() => GroupExit::Completed,
        Ok(status) => GroupExit::Failed {
            detail: status.to_string(),
        },
        Err(e) => GroupExit::Failed {
            detail: e.to_string(),
        },
    }
}

#[async_trait]
impl GroupLauncher for ProcessLauncher {
    async fn launch(&self, job: GroupJob, sink: Arc<dyn GroupSink>) -> Result<GroupHandle> {
        let program = self.program.display().to_string();
        let payload = serde_json::to_vec(&job)
            .map_err(|e| FleetError::command(&program, format!("encoding job: {e}")))?;

        let mut child = Command::new(&self.program)
            .arg(RUN_GROUP_COMMAND)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| FleetError::command(&program, e))?;
        let pid = child.id();

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await?;
            stdin.shutdown().await?;
        }
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FleetError::command(&program, "child stdout not captured"))?;

        let unit = job.unit_name;
        info!(unit = %unit, offset = job.offset, pid = ?pid, "Group process started");

        let (kill, mut kill_rx) = oneshot::channel::<()>();
        let done = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut reading = true;
            let mut armed = true;
            loop {
                tokio::select! {
                    line = lines.next_line(), if reading => match line {
                        Ok(Some(line)) => match GroupEvent::from_line(&line) {
                            Ok(event) => sink.emit(event),
                            Err(_) => debug!(unit = %unit, line = %line, "Ignoring non-event output"),
                        },
                        Ok(None) => reading = false,
                        Err(e) => {
                            warn!(unit = %unit, error = %e, "Reading group events failed");
                            reading = false;
                        }
                    },
                    status = child.wait(), if !reading => {
                        let exit = exit_from(status);
                        info!(unit = %unit, pid = ?pid, ?exit, "Group process exited");
                        return exit;
                    }
                    signal = &mut kill_rx, if armed => match signal {
                        Ok(()) => {
                            if let Err(e) = child.start_kill() {
                                warn!(unit = %unit, error = %e, "Failed to kill group process");
                            }
                            let _ = child.wait().await;
                            info!(unit = %unit, pid = ?pid, "Group process terminated");
                            return GroupExit::Terminated;
                        }
                        Err(_) => armed = false,
                    },
                }
            }
        });

        Ok(GroupHandle { pid, kill, done })
    }
}

/// Runs each group as a task on the current runtime.
#[derive(Debug, Clone)]
pub struct TaskLauncher {
    runner: Arc<GroupRunner>,
}

impl TaskLauncher {
    pub fn new(runner: Arc<GroupRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl GroupLauncher for TaskLauncher {
    async fn launch(&self, job: GroupJob, sink: Arc<dyn GroupSink>) -> Result<GroupHandle> {
        let runner = self.runner.clone();
        let (kill, kill_rx) = oneshot::channel::<()>();
        let done = tokio::spawn(async move {
            tokio::select! {
                result = runner.run(&job, sink.as_ref()) => match result {
                    Ok(()) => GroupExit::Completed,
                    Err(e) => GroupExit::Failed { detail: e.to_string() },
                },
                Ok(()) = kill_rx => {
                    warn!(unit = %job.unit_name, "Group task terminated, infra left to shutdown cleanup");
                    GroupExit::Terminated
                }
            }
        });
        Ok(GroupHandle {
            pid: None,
            kill,
            done,
        })
    }
}
