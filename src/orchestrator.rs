//! Access point lifecycle: acquire the interface, start the services, apply
//! the firewall, run until a service exits or a stop is requested, then undo
//! whatever was set up.

use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Local};
use tokio::sync::mpsc;
use tokio::time::{self, Instant, Interval};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{ApError, Result};
use crate::health::{check_health, HealthStatus};
use crate::system::firewall::NatSession;
use crate::system::services::{access_point_command, dhcp_command};
use crate::system::supervisor::{ExitSummary, RunEvent, ServiceSupervisor, SupervisedProcess};
use crate::system::{
    detect_wireless_interfaces, interface_exists, CommandRunner, FirewallPolicy, GroupTerminator,
    InterfaceController, IpForwarding, IpRouteSource, PgrepTerminator, ProcessLauncher,
    RoleTerminator, RouteSource, RuleManager, ServiceLauncher, ServiceRole, SystemRunner,
    UnixGroupTerminator,
};
use crate::wifi::{render_hostapd_conf, WifiSettings};

/// Two service exits plus one stop request.
const EVENT_CHANNEL_CAPACITY: usize = 3;

/// Lifecycle phase. Phases only move forward within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    InterfaceReset,
    ServicesStarting,
    RulesApplying,
    Running,
    Stopping,
    Released,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::InterfaceReset => "interface reset",
            Phase::ServicesStarting => "services starting",
            Phase::RulesApplying => "rules applying",
            Phase::Running => "running",
            Phase::Stopping => "stopping",
            Phase::Released => "released",
        };
        f.write_str(name)
    }
}

/// Why a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopCause {
    /// A supervised service exited on its own.
    ServiceExited { role: ServiceRole, status: ExitSummary },
    /// An operator asked for the stop.
    Cancelled,
}

impl fmt::Display for StopCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopCause::ServiceExited { role, status } => {
                write!(f, "{} exited unexpectedly ({})", role, status)
            }
            StopCause::Cancelled => f.write_str("stop requested"),
        }
    }
}

/// Summary of one completed run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub cause: StopCause,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    pub phases: Vec<Phase>,
    pub warnings: Vec<String>,
}

impl RunReport {
    /// Operator-requested shutdown, as opposed to a service failure.
    pub fn is_clean(&self) -> bool {
        self.cause == StopCause::Cancelled
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = if self.is_clean() {
            "Access point shut down cleanly"
        } else {
            "Access point stopped after a service failure"
        };
        writeln!(f, "{}: {}", verdict, self.cause)?;
        writeln!(
            f,
            "  ran {} -> {} ({}s)",
            self.started_at.format("%Y-%m-%d %H:%M:%S"),
            self.finished_at.format("%H:%M:%S"),
            (self.finished_at - self.started_at).num_seconds()
        )?;
        let phases: Vec<String> = self.phases.iter().map(Phase::to_string).collect();
        write!(f, "  phases: {}", phases.join(" -> "))?;
        for warning in &self.warnings {
            write!(f, "\n  warning: {}", warning)?;
        }
        Ok(())
    }
}

/// Host capabilities the orchestrator drives.
pub struct Host {
    pub runner: Arc<dyn CommandRunner>,
    pub routes: Arc<dyn RouteSource>,
    pub launcher: Arc<dyn ServiceLauncher>,
    pub terminator: Arc<dyn GroupTerminator>,
    pub roles: Arc<dyn RoleTerminator>,
    pub sysfs_root: PathBuf,
}

impl Host {
    /// The real system: external commands, `/sys`, process groups.
    pub fn system() -> Self {
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
        Self {
            routes: Arc::new(IpRouteSource::new(runner.clone())),
            launcher: Arc::new(ProcessLauncher),
            terminator: Arc::new(UnixGroupTerminator),
            roles: Arc::new(PgrepTerminator::new(runner.clone())),
            sysfs_root: PathBuf::from("/sys"),
            runner,
        }
    }
}

/// Setup steps that completed, undone in reverse by teardown.
#[derive(Default)]
struct Acquired {
    interface: Option<String>,
    conf_file: Option<PathBuf>,
    ap: Option<SupervisedProcess>,
    dhcp: Option<SupervisedProcess>,
    admission: Option<String>,
    nat: Option<NatSession>,
}

enum Setup {
    Ready(String),
    Cancelled,
}

/// Drives one access point run from `Idle` to `Released`.
pub struct ApOrchestrator {
    config: Config,
    host: Host,
    cancel: CancellationToken,
    phases: Vec<Phase>,
    warnings: Vec<String>,
}

impl ApOrchestrator {
    pub fn new(config: Config, host: Host, cancel: CancellationToken) -> Self {
        Self {
            config,
            host,
            cancel,
            phases: vec![Phase::Idle],
            warnings: Vec::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phases.last().copied().unwrap_or(Phase::Idle)
    }

    /// Every phase entered so far, in order.
    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    /// Run the access point until a service exits or cancellation.
    ///
    /// Teardown always runs. A setup failure is returned after teardown; a
    /// cancellation at any point yields a report.
    pub async fn run(&mut self) -> Result<RunReport> {
        let started_at = Local::now();
        let (events_tx, mut events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let supervisor = ServiceSupervisor::new(
            self.host.launcher.clone(),
            self.host.terminator.clone(),
            events_tx.clone(),
            self.config.stop_timeout(),
        );
        let mut acquired = Acquired::default();

        let outcome = match self.setup(&supervisor, &mut acquired).await {
            Ok(Setup::Ready(iface)) => {
                self.enter(Phase::Running);
                Ok(self.wait_running(&mut events_rx, &events_tx, &iface).await)
            }
            Ok(Setup::Cancelled) => {
                info!("Stop requested during setup");
                Ok(StopCause::Cancelled)
            }
            Err(e) => {
                error!("Setup failed during {}: {}", self.phase(), e);
                Err(e)
            }
        };

        self.enter(Phase::Stopping);
        self.teardown(&supervisor, acquired).await;
        self.enter(Phase::Released);

        let cause = outcome?;
        Ok(RunReport {
            cause,
            started_at,
            finished_at: Local::now(),
            phases: self.phases.clone(),
            warnings: self.warnings.clone(),
        })
    }

    fn enter(&mut self, phase: Phase) {
        info!("Phase: {} -> {}", self.phase(), phase);
        self.phases.push(phase);
    }

    fn firewall(&self) -> FirewallPolicy {
        FirewallPolicy::new(
            RuleManager::new(self.host.runner.clone()),
            IpForwarding::new(self.host.runner.clone()),
            self.host.routes.clone(),
        )
    }

    fn interfaces(&self) -> InterfaceController {
        InterfaceController::new(
            self.host.runner.clone(),
            self.host.roles.clone(),
            self.host.sysfs_root.clone(),
        )
    }

    fn warn(&mut self, message: String) {
        warn!("{}", message);
        self.warnings.push(message);
    }

    /// Configured interface, or the first wireless one found.
    fn select_interface(&self) -> Result<String> {
        let name = match &self.config.interface {
            Some(name) => name.clone(),
            None => {
                let detected = detect_wireless_interfaces(&self.host.sysfs_root)?
                    .into_iter()
                    .next()
                    .ok_or_else(|| ApError::InterfaceNotFound("no wireless interface detected".into()))?;
                info!(
                    "Detected wireless interface {} (index {:?}, {}, MAC {})",
                    detected.name,
                    detected.index,
                    detected.phy.as_deref().unwrap_or("unknown phy"),
                    detected.mac.as_deref().unwrap_or("unknown")
                );
                detected.name
            }
        };
        if !interface_exists(&self.host.sysfs_root, &name) {
            return Err(ApError::InterfaceNotFound(name));
        }
        Ok(name)
    }

    async fn setup(&mut self, supervisor: &ServiceSupervisor, acquired: &mut Acquired) -> Result<Setup> {
        self.config.validate()?;
        let gateway = self.config.gateway()?;
        let settings = WifiSettings::resolve(
            self.config.generation,
            self.config.band.as_deref(),
            self.config.channel,
        );
        if self.cancel.is_cancelled() {
            return Ok(Setup::Cancelled);
        }
        let iface = self.select_interface()?;
        info!("Using {} for the access point ({})", iface, settings);

        self.enter(Phase::InterfaceReset);
        // Hand-back is owed from here on, even if the reset fails midway
        acquired.interface = Some(iface.clone());
        let controller = self.interfaces();
        for warning in controller.reset(&iface).await? {
            self.warnings.push(warning);
        }
        if let Err(e) = controller.assign_address(&iface, gateway).await {
            self.warn(format!("could not assign {} to {}: {}", gateway, iface, e));
        }
        if self.cancel.is_cancelled() {
            return Ok(Setup::Cancelled);
        }

        self.enter(Phase::ServicesStarting);
        let conf_path = self.config.hostapd_conf_path();
        let conf = render_hostapd_conf(&iface, &self.config.ssid, &self.config.passphrase, &settings);
        write_private_file(&conf_path, &conf)?;
        acquired.conf_file = Some(conf_path.clone());

        acquired.ap = Some(supervisor.start(&access_point_command(&self.config.hostapd_bin, &conf_path))?);
        acquired.dhcp = Some(supervisor.start(&dhcp_command(
            &self.config.dnsmasq_bin,
            &iface,
            gateway.addr(),
        ))?);
        if self.cancel.is_cancelled() {
            return Ok(Setup::Cancelled);
        }

        self.enter(Phase::RulesApplying);
        let firewall = self.firewall();
        firewall.enable_admission(&iface).await?;
        acquired.admission = Some(iface.clone());

        let session = firewall
            .nat_session(gateway.network(), &iface, self.config.wan_interface.as_deref())
            .await?;
        firewall.enable_nat(&session).await?;
        acquired.nat = Some(session);

        Ok(Setup::Ready(iface))
    }

    /// Wait for the first service exit or stop request.
    async fn wait_running(
        &self,
        events: &mut mpsc::Receiver<RunEvent>,
        events_tx: &mpsc::Sender<RunEvent>,
        iface: &str,
    ) -> StopCause {
        info!("Access point up on {}", iface);

        let stop_listener = {
            let token = self.cancel.clone();
            let tx = events_tx.clone();
            tokio::spawn(async move {
                token.cancelled().await;
                let _ = tx.send(RunEvent::StopRequested).await;
            })
        };

        let mut health: Option<Interval> = self
            .config
            .health_interval()
            .map(|period| time::interval_at(Instant::now() + period, period));

        let cause = loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(RunEvent::ServiceExited { role, status }) => {
                        if status.is_success() {
                            info!("{} exited: {}", role, status);
                        } else {
                            warn!("{} exited: {}", role, status);
                        }
                        break StopCause::ServiceExited { role, status };
                    }
                    Some(RunEvent::StopRequested) | None => break StopCause::Cancelled,
                },
                _ = next_tick(health.as_mut()) => {
                    match check_health(&self.host.runner, iface).await {
                        HealthStatus::Healthy => {}
                        HealthStatus::Degraded(msg) => warn!("Health degraded: {}", msg),
                        HealthStatus::Down(msg) => warn!("Health down: {}", msg),
                    }
                }
            }
        };

        stop_listener.abort();
        cause
    }

    /// Undo completed setup steps: services, then rules, then the interface.
    async fn teardown(&mut self, supervisor: &ServiceSupervisor, acquired: Acquired) {
        for process in [acquired.dhcp.as_ref(), acquired.ap.as_ref()].into_iter().flatten() {
            match supervisor.stop(Some(process)).await {
                Ok(Some(status)) => info!(
                    "{} (pgid {}) stopped: {}",
                    process.role(),
                    process.pgid(),
                    status
                ),
                Ok(None) => {}
                Err(e) => self.warn(format!("could not stop {}: {}", process.role(), e)),
            }
        }

        let firewall = self.firewall();
        if let Some(session) = &acquired.nat {
            for e in firewall.disable_nat(session).await {
                self.warn(format!("could not remove NAT rule: {}", e));
            }
        }
        if let Some(iface) = &acquired.admission {
            for e in firewall.disable_admission(iface).await {
                self.warn(format!("could not remove admission rule: {}", e));
            }
        }

        if let Some(iface) = &acquired.interface {
            if let Err(e) = self.interfaces().release(iface).await {
                self.warn(format!("could not hand {} back to NetworkManager: {}", iface, e));
            }
        }

        if let Some(path) = &acquired.conf_file {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => self.warn(format!("could not remove {}: {}", path.display(), e)),
            }
        }
    }
}

async fn next_tick(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Write a file readable only by its owner.
fn write_private_file(path: &Path, contents: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // mode() only applies to newly created files
    file.set_permissions(fs::Permissions::from_mode(0o600))?;
    file.write_all(contents.as_bytes())
}
