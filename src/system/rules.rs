//! Idempotent packet-filter rule management via iptables.
//!
//! The live rule set is the source of truth: nothing is cached in-process.
//! Every apply or remove first asks iptables whether the rule exists (`-C`),
//! so repeated calls never duplicate or fail on a missing rule.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use super::command::{failure, CommandRunner};
use crate::error::{ApError, Result};

const IPTABLES: &str = "iptables";

/// iptables exit status for "no matching rule" on a `-C` check.
const CHECK_NOT_FOUND: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Filter,
    Nat,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Filter => "filter",
            Table::Nat => "nat",
        }
    }
}

/// Where a new rule lands in its chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Position {
    /// Rule number 1, ahead of anything a desktop firewall manager installs.
    Head,
}

/// Declarative description of a single filter rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FirewallRule {
    pub table: Table,
    pub chain: String,
    /// Match predicate, e.g. `["-i", "wlan0", "-p", "udp", "--dport", "67"]`.
    pub matches: Vec<String>,
    /// Jump target, e.g. `ACCEPT` or `MASQUERADE`.
    pub action: String,
    pub position: Position,
}

impl FirewallRule {
    pub fn new(table: Table, chain: &str, matches: &[&str], action: &str) -> Self {
        Self {
            table,
            chain: chain.to_string(),
            matches: matches.iter().map(|m| m.to_string()).collect(),
            action: action.to_string(),
            position: Position::Head,
        }
    }

    /// Rule body shared by check, insert and delete.
    pub fn spec(&self) -> Vec<String> {
        let mut spec = self.matches.clone();
        spec.push("-j".into());
        spec.push(self.action.clone());
        spec
    }

    pub fn check_args(&self) -> Vec<String> {
        self.with_op(&["-C", self.chain.as_str()])
    }

    pub fn insert_args(&self) -> Vec<String> {
        match self.position {
            Position::Head => self.with_op(&["-I", self.chain.as_str(), "1"]),
        }
    }

    pub fn delete_args(&self) -> Vec<String> {
        self.with_op(&["-D", self.chain.as_str()])
    }

    fn with_op(&self, op: &[&str]) -> Vec<String> {
        // -w waits for the xtables lock instead of failing when another tool holds it
        let mut args: Vec<String> = vec!["-w".into(), "-t".into(), self.table.as_str().into()];
        args.extend(op.iter().map(|s| s.to_string()));
        args.extend(self.spec());
        args
    }
}

impl fmt::Display for FirewallRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "-t {} {} {}",
            self.table.as_str(),
            self.chain,
            self.spec().join(" ")
        )
    }
}

/// Applies and removes rules against the live iptables state.
#[derive(Clone)]
pub struct RuleManager {
    runner: Arc<dyn CommandRunner>,
}

impl RuleManager {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Whether a rule matching `rule` currently exists.
    ///
    /// "Not found" is the normal negative answer; any other failure is an
    /// error carrying the command line and its output.
    pub async fn is_present(&self, rule: &FirewallRule) -> Result<bool> {
        let args = rule.check_args();
        let output = self.runner.run(IPTABLES, &args).await?;
        match output.code {
            Some(0) => Ok(true),
            Some(CHECK_NOT_FOUND) => Ok(false),
            _ => Err(ApError::command(
                IPTABLES,
                &args,
                format!("rule check failed: {}", output.message()),
            )),
        }
    }

    /// Insert `rule` unless it is already present.
    ///
    /// Returns `true` if the rule was inserted by this call.
    pub async fn ensure(&self, rule: &FirewallRule) -> Result<bool> {
        if self.is_present(rule).await? {
            debug!("rule already present: {}", rule);
            return Ok(false);
        }

        let args = rule.insert_args();
        let output = self.runner.run(IPTABLES, &args).await?;
        if !output.success() {
            return Err(failure(IPTABLES, &args, &output));
        }
        debug!("rule inserted: {}", rule);
        Ok(true)
    }

    /// Remove `rule` if it is present; absent rules are not an error.
    ///
    /// Returns `true` if a rule was removed by this call.
    pub async fn remove_if_present(&self, rule: &FirewallRule) -> Result<bool> {
        if !self.is_present(rule).await? {
            debug!("rule not present, nothing to remove: {}", rule);
            return Ok(false);
        }

        let args = rule.delete_args();
        let output = self.runner.run(IPTABLES, &args).await?;
        if !output.success() {
            return Err(failure(IPTABLES, &args, &output));
        }
        debug!("rule removed: {}", rule);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRunner;

    fn dhcp_rule() -> FirewallRule {
        FirewallRule::new(
            Table::Filter,
            "INPUT",
            &["-i", "wlan0", "-p", "udp", "--dport", "67"],
            "ACCEPT",
        )
    }

    #[test]
    fn test_rule_args() {
        let rule = dhcp_rule();
        assert_eq!(
            rule.check_args().join(" "),
            "-w -t filter -C INPUT -i wlan0 -p udp --dport 67 -j ACCEPT"
        );
        assert_eq!(
            rule.insert_args().join(" "),
            "-w -t filter -I INPUT 1 -i wlan0 -p udp --dport 67 -j ACCEPT"
        );
        assert_eq!(
            rule.delete_args().join(" "),
            "-w -t filter -D INPUT -i wlan0 -p udp --dport 67 -j ACCEPT"
        );
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let runner = Arc::new(FakeRunner::new());
        let rules = RuleManager::new(runner.clone());

        assert!(rules.ensure(&dhcp_rule()).await.unwrap());
        assert!(!rules.ensure(&dhcp_rule()).await.unwrap());

        let store = runner.rules();
        assert_eq!(store.len(), 1);
        assert_eq!(store[0].chain, "INPUT");
    }

    #[tokio::test]
    async fn test_ensure_inserts_at_head() {
        let runner = Arc::new(FakeRunner::new());
        let rules = RuleManager::new(runner.clone());
        let deny = FirewallRule::new(Table::Filter, "INPUT", &["-i", "wlan0"], "DROP");

        rules.ensure(&deny).await.unwrap();
        rules.ensure(&dhcp_rule()).await.unwrap();

        let store = runner.rules();
        assert_eq!(store[0].action, "ACCEPT");
        assert_eq!(store[1].action, "DROP");
    }

    #[tokio::test]
    async fn test_remove_if_present() {
        let runner = Arc::new(FakeRunner::new());
        let rules = RuleManager::new(runner.clone());

        // Absent: silently succeeds
        assert!(!rules.remove_if_present(&dhcp_rule()).await.unwrap());

        rules.ensure(&dhcp_rule()).await.unwrap();
        assert!(rules.remove_if_present(&dhcp_rule()).await.unwrap());
        assert!(!rules.remove_if_present(&dhcp_rule()).await.unwrap());
        assert!(runner.rules().is_empty());
    }

    #[tokio::test]
    async fn test_check_failure_is_an_error() {
        let runner = Arc::new(FakeRunner::new());
        runner.fail_with("iptables -w -t filter -C INPUT", 2, "iptables: Bad built-in chain name.");
        let rules = RuleManager::new(runner.clone());

        match rules.ensure(&dhcp_rule()).await.unwrap_err() {
            ApError::CommandFailed { command, message } => {
                assert!(command.starts_with("iptables -w -t filter -C INPUT"));
                assert!(message.contains("Bad built-in chain name"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(runner.rules().is_empty());
    }

    #[tokio::test]
    async fn test_insert_failure_is_an_error() {
        let runner = Arc::new(FakeRunner::new());
        runner.fail_with("iptables -w -t filter -I INPUT", 4, "Resource temporarily unavailable");
        let rules = RuleManager::new(runner.clone());

        assert!(rules.ensure(&dhcp_rule()).await.is_err());
        assert!(runner.rules().is_empty());
    }
}
