//! In-process fakes for the system seams, used by unit tests.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use crate::error::Result;
use crate::system::command::{CommandOutput, CommandRunner};
use crate::system::route::{RouteEntry, RouteSource};
use crate::system::supervisor::{ServiceCommand, ServiceLauncher, ServiceRole};

/// A rule held by the fake iptables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRule {
    pub table: String,
    pub chain: String,
    pub spec: Vec<String>,
    pub action: String,
}

#[derive(Default)]
struct FakeState {
    calls: Vec<String>,
    failures: Vec<(String, i32, String)>,
    responses: Vec<(String, String)>,
    rules: Vec<StoredRule>,
}

/// Records every command and simulates iptables against an in-memory store.
///
/// Failures registered with `fail_with` win over canned responses, which win
/// over the simulation. `pgrep` finds nothing unless told otherwise; every
/// other command succeeds silently.
#[derive(Default)]
pub struct FakeRunner {
    state: Mutex<FakeState>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands starting with `prefix` exit with `code` and `stderr`.
    pub fn fail_with(&self, prefix: &str, code: i32, stderr: &str) {
        self.state
            .lock()
            .unwrap()
            .failures
            .push((prefix.to_string(), code, stderr.to_string()));
    }

    /// Commands starting with `prefix` succeed and print `stdout`.
    pub fn respond(&self, prefix: &str, stdout: &str) {
        self.state
            .lock()
            .unwrap()
            .responses
            .push((prefix.to_string(), stdout.to_string()));
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    /// Current iptables store, in chain order.
    pub fn rules(&self) -> Vec<StoredRule> {
        self.state.lock().unwrap().rules.clone()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        let line = if args.is_empty() {
            program.to_string()
        } else {
            format!("{} {}", program, args.join(" "))
        };

        let mut state = self.state.lock().unwrap();
        state.calls.push(line.clone());

        if let Some((_, code, stderr)) = state.failures.iter().find(|(p, _, _)| line.starts_with(p.as_str())) {
            return Ok(output(*code, "", stderr));
        }
        if let Some((_, stdout)) = state.responses.iter().find(|(p, _)| line.starts_with(p.as_str())) {
            return Ok(output(0, stdout, ""));
        }

        match program {
            "iptables" => Ok(simulate_iptables(&mut state.rules, args)),
            "pgrep" => Ok(output(1, "", "")),
            _ => Ok(output(0, "", "")),
        }
    }
}

fn output(code: i32, stdout: &str, stderr: &str) -> CommandOutput {
    CommandOutput {
        code: Some(code),
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
    }
}

fn simulate_iptables(store: &mut Vec<StoredRule>, args: &[String]) -> CommandOutput {
    let mut rest: Vec<&str> = args.iter().map(String::as_str).collect();
    rest.retain(|a| *a != "-w");

    let mut table = "filter";
    if rest.first() == Some(&"-t") && rest.len() > 1 {
        table = rest[1];
        rest.drain(..2);
    }
    if rest.len() < 2 {
        return output(2, "", "iptables: bad arguments");
    }
    let op = rest[0];
    let chain = rest[1];
    let mut body = &rest[2..];

    let mut position = None;
    if op == "-I" {
        if let Some(n) = body.first().and_then(|n| n.parse::<usize>().ok()) {
            position = Some(n.saturating_sub(1));
            body = &body[1..];
        }
    }

    let Some(jump) = body.iter().position(|a| *a == "-j") else {
        return output(2, "", "iptables: no target");
    };
    let rule = StoredRule {
        table: table.to_string(),
        chain: chain.to_string(),
        spec: body[..jump].iter().map(|s| s.to_string()).collect(),
        action: body.get(jump + 1).map(|s| s.to_string()).unwrap_or_default(),
    };
    let found = store.iter().position(|r| *r == rule);

    match op {
        "-C" => output(if found.is_some() { 0 } else { 1 }, "", ""),
        "-I" => {
            let at = position.unwrap_or(0);
            // Head of this chain: before the first rule already in it
            let index = store
                .iter()
                .enumerate()
                .filter(|(_, r)| r.table == rule.table && r.chain == rule.chain)
                .map(|(i, _)| i)
                .nth(at)
                .unwrap_or(store.len());
            store.insert(index, rule);
            output(0, "", "")
        }
        "-D" => match found {
            Some(i) => {
                store.remove(i);
                output(0, "", "")
            }
            None => output(1, "", "iptables: Bad rule (does a matching rule exist in that chain?)."),
        },
        _ => output(2, "", "iptables: unknown operation"),
    }
}

/// Fixed routing table.
pub struct StaticRoutes {
    routes: Vec<RouteEntry>,
}

impl StaticRoutes {
    pub fn new(routes: Vec<RouteEntry>) -> Self {
        Self { routes }
    }
}

#[async_trait]
impl RouteSource for StaticRoutes {
    async fn ipv4_routes(&self) -> Result<Vec<RouteEntry>> {
        Ok(self.routes.clone())
    }
}

/// What a fake launch does for a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchBehavior {
    /// Run until signalled.
    Run,
    /// Exit immediately with this code.
    ExitWith(i32),
    FailToSpawn,
}

/// Launches stand-in processes instead of the real daemons.
#[derive(Default)]
pub struct FakeLauncher {
    behaviors: Mutex<HashMap<ServiceRole, LaunchBehavior>>,
    spawned: Mutex<Vec<(ServiceRole, u32)>>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, role: ServiceRole, behavior: LaunchBehavior) {
        self.behaviors.lock().unwrap().insert(role, behavior);
    }

    /// Roles spawned so far, in launch order.
    pub fn spawned(&self) -> Vec<ServiceRole> {
        self.spawned.lock().unwrap().iter().map(|(r, _)| *r).collect()
    }

    pub fn pid_of(&self, role: ServiceRole) -> Option<u32> {
        self.spawned
            .lock()
            .unwrap()
            .iter()
            .find(|(r, _)| *r == role)
            .map(|(_, pid)| *pid)
    }
}

impl ServiceLauncher for FakeLauncher {
    fn spawn(&self, command: &ServiceCommand) -> io::Result<Child> {
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&command.role)
            .copied()
            .unwrap_or(LaunchBehavior::Run);

        let mut cmd = match behavior {
            LaunchBehavior::Run => {
                let mut cmd = Command::new("sleep");
                cmd.arg("30");
                cmd
            }
            LaunchBehavior::ExitWith(code) => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(format!("exit {}", code));
                cmd
            }
            LaunchBehavior::FailToSpawn => {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{}: not found", command.program),
                ))
            }
        };
        let child = cmd.process_group(0).kill_on_drop(true).spawn()?;
        if let Some(pid) = child.id() {
            self.spawned.lock().unwrap().push((command.role, pid));
        }
        Ok(child)
    }
}

/// A service command running `script` under `sh -c`.
pub fn sh(role: ServiceRole, script: &str) -> ServiceCommand {
    ServiceCommand {
        role,
        program: "sh".into(),
        args: vec!["-c".into(), script.into()],
        working_dir: None,
    }
}

/// A fake sysfs tree with `class/net/<name>` entries.
///
/// Interfaces given a phy name get a `phy80211/name` attribute and so count
/// as wireless.
pub fn fake_sysfs(interfaces: &[(&str, Option<&str>)]) -> tempfile::TempDir {
    let root = tempfile::tempdir().unwrap();
    for (i, (name, phy)) in interfaces.iter().enumerate() {
        let dir = root.path().join("class/net").join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("ifindex"), format!("{}\n", i + 2)).unwrap();
        fs::write(dir.join("address"), format!("02:00:00:00:00:{:02x}\n", i + 1)).unwrap();
        if let Some(phy) = phy {
            let phy_dir = dir.join("phy80211");
            fs::create_dir_all(&phy_dir).unwrap();
            fs::write(phy_dir.join("name"), format!("{}\n", phy)).unwrap();
        }
    }
    root
}
