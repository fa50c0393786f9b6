//! Supervision of the external AP and DHCP/DNS daemons.
//!
//! Each service runs in its own process group. Its exit is observed on a
//! dedicated task that reports into a shared completion channel, so the
//! orchestrator can react to whichever service goes first. Termination is
//! always sent to the whole group so helper processes die with the service.

use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::{render_command, ApError, Result};

/// Which external service a process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceRole {
    AccessPoint,
    Dhcp,
}

impl fmt::Display for ServiceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceRole::AccessPoint => f.write_str("AP service"),
            ServiceRole::Dhcp => f.write_str("DHCP/DNS service"),
        }
    }
}

/// A command line for one supervised service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceCommand {
    pub role: ServiceRole,
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl fmt::Display for ServiceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&render_command(&self.program, &self.args))
    }
}

/// How a supervised process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitSummary {
    Code(i32),
    Signal(i32),
    WaitFailed(String),
}

impl ExitSummary {
    pub fn is_success(&self) -> bool {
        matches!(self, ExitSummary::Code(0))
    }
}

impl From<ExitStatus> for ExitSummary {
    fn from(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => ExitSummary::Code(code),
            (None, Some(signal)) => ExitSummary::Signal(signal),
            (None, None) => ExitSummary::WaitFailed(format!("unknown exit status {:?}", status)),
        }
    }
}

impl fmt::Display for ExitSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitSummary::Code(code) => write!(f, "exit code {}", code),
            ExitSummary::Signal(signal) => write!(f, "killed by signal {}", signal),
            ExitSummary::WaitFailed(e) => write!(f, "wait failed: {}", e),
        }
    }
}

/// Events delivered to the orchestrator while it is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    ServiceExited { role: ServiceRole, status: ExitSummary },
    StopRequested,
}

/// Spawns a service process detached into its own process group.
pub trait ServiceLauncher: Send + Sync {
    fn spawn(&self, command: &ServiceCommand) -> std::io::Result<Child>;
}

/// Launches real processes, sharing the orchestrator's stdout/stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLauncher;

impl ServiceLauncher for ProcessLauncher {
    fn spawn(&self, command: &ServiceCommand) -> std::io::Result<Child> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            // New group with pgid == pid: signalling the group never reaches us.
            .process_group(0);
        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }
        cmd.spawn()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Polite request to exit (SIGTERM).
    Terminate,
    /// Cannot be ignored (SIGKILL).
    Kill,
}

/// Delivers a signal to an entire process group.
pub trait GroupTerminator: Send + Sync {
    fn terminate_group(&self, pgid: u32, signal: Signal) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UnixGroupTerminator;

impl GroupTerminator for UnixGroupTerminator {
    fn terminate_group(&self, pgid: u32, signal: Signal) -> Result<()> {
        let signo = match signal {
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        let pgid = libc::pid_t::try_from(pgid)
            .map_err(|_| ApError::ParseError(format!("process group id out of range: {}", pgid)))?;
        if pgid <= 1 {
            return Err(ApError::ParseError(format!("refusing to signal process group {}", pgid)));
        }

        let rc = unsafe { libc::killpg(pgid, signo) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            // Group already gone
            return Ok(());
        }
        Err(ApError::Io(err))
    }
}

/// A running external service bound to its own process group.
#[derive(Debug)]
pub struct SupervisedProcess {
    role: ServiceRole,
    pgid: u32,
    exit: watch::Receiver<Option<ExitSummary>>,
}

impl SupervisedProcess {
    pub fn role(&self) -> ServiceRole {
        self.role
    }

    pub fn pgid(&self) -> u32 {
        self.pgid
    }

    /// Exit status if the process has already been reaped.
    pub fn exit_status(&self) -> Option<ExitSummary> {
        self.exit.borrow().clone()
    }
}

/// Starts, observes and stops supervised services.
pub struct ServiceSupervisor {
    launcher: Arc<dyn ServiceLauncher>,
    terminator: Arc<dyn GroupTerminator>,
    events: mpsc::Sender<RunEvent>,
    stop_timeout: Duration,
}

impl ServiceSupervisor {
    pub fn new(
        launcher: Arc<dyn ServiceLauncher>,
        terminator: Arc<dyn GroupTerminator>,
        events: mpsc::Sender<RunEvent>,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            launcher,
            terminator,
            events,
            stop_timeout,
        }
    }

    /// Launch a service and start observing its exit.
    pub fn start(&self, command: &ServiceCommand) -> Result<SupervisedProcess> {
        let role = command.role;
        let mut child = self
            .launcher
            .spawn(command)
            .map_err(|e| ApError::ServiceStart {
                role,
                message: format!("{}: {}", command, e),
            })?;
        let pgid = child.id().ok_or_else(|| ApError::ServiceStart {
            role,
            message: format!("{}: exited before its pid was known", command),
        })?;

        let (exit_tx, exit_rx) = watch::channel(None);
        let events = self.events.clone();
        tokio::spawn(async move {
            let status = match child.wait().await {
                Ok(status) => ExitSummary::from(status),
                Err(e) => ExitSummary::WaitFailed(e.to_string()),
            };
            debug!("{} (pgid {}) exited: {}", role, pgid, status);
            exit_tx.send_replace(Some(status.clone()));
            // Nobody listening once the run is over
            let _ = events.send(RunEvent::ServiceExited { role, status }).await;
        });

        info!("Started {} (pgid {}): {}", role, pgid, command);
        Ok(SupervisedProcess {
            role,
            pgid,
            exit: exit_rx,
        })
    }

    /// Block until the process exits.
    pub async fn wait(&self, process: &SupervisedProcess) -> ExitSummary {
        let mut exit = process.exit.clone();
        let summary = match exit.wait_for(|status| status.is_some()).await {
            Ok(status) => status
                .clone()
                .unwrap_or_else(|| ExitSummary::WaitFailed("no exit status".into())),
            Err(_) => ExitSummary::WaitFailed("exit observer ended".into()),
        };
        summary
    }

    /// Terminate the whole process group and wait for the exit.
    ///
    /// A leader still alive after the stop timeout gets its group killed
    /// outright. If the leader already exited, the rest of its group is still
    /// signalled and the recorded status returned. No-op without a process.
    pub async fn stop(&self, process: Option<&SupervisedProcess>) -> Result<Option<ExitSummary>> {
        let Some(process) = process else {
            return Ok(None);
        };

        info!("Stopping {} (pgid {})", process.role, process.pgid);
        // Helpers may outlive the group leader: signal the group regardless
        self.terminator
            .terminate_group(process.pgid, Signal::Terminate)?;
        if let Some(status) = process.exit_status() {
            return Ok(Some(status));
        }

        match tokio::time::timeout(self.stop_timeout, self.wait(process)).await {
            Ok(status) => Ok(Some(status)),
            Err(_) => {
                warn!(
                    "{} ignored SIGTERM for {:?}, sending SIGKILL",
                    process.role, self.stop_timeout
                );
                self.terminator.terminate_group(process.pgid, Signal::Kill)?;
                Ok(Some(self.wait(process).await))
            }
        }
    }
}
