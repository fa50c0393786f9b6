//! apshare - software access point for Linux
//!
//! Turns a wireless interface into a WPA2 access point: hostapd for the
//! radio, dnsmasq for DHCP/DNS, iptables NAT to the uplink. Runs until a
//! service exits or the operator stops it, then restores the host.

mod config;
mod error;
mod health;
mod orchestrator;
mod system;
#[cfg(test)]
mod testing;
mod wifi;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::Config;
use orchestrator::{ApOrchestrator, Host};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("apshare=info")),
        )
        .init();

    // Check for root privileges
    if !is_root() {
        eprintln!("Error: This program must be run as root (sudo).");
        eprintln!("Usage: sudo apshare [passphrase]");
        std::process::exit(1);
    }

    let mut config = Config::load();
    if Config::path().is_some_and(|path| !path.exists()) {
        // First run: leave an editable copy of the defaults behind
        config.save();
    }
    if let Some(passphrase) = std::env::args().nth(1) {
        config.passphrase = passphrase;
    }

    let cancel = CancellationToken::new();
    spawn_stop_listener(cancel.clone())?;

    let mut orchestrator = ApOrchestrator::new(config, Host::system(), cancel);
    let report = orchestrator
        .run()
        .await
        .context("Access point failed to start")?;

    println!("{}", report);
    if !report.is_clean() {
        std::process::exit(1);
    }
    Ok(())
}

fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Cancel the run on Ctrl-C or SIGTERM.
fn spawn_stop_listener(cancel: CancellationToken) -> Result<()> {
    let mut terminate = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Interrupt received, shutting down"),
            _ = terminate.recv() => info!("SIGTERM received, shutting down"),
        }
        cancel.cancel();
    });
    Ok(())
}
