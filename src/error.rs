//! Error types for access point lifecycle operations.

use thiserror::Error;

use crate::system::ServiceRole;

#[derive(Error, Debug)]
pub enum ApError {
    #[error("Command failed: {command} - {message}")]
    CommandFailed { command: String, message: String },

    #[error("Wireless interface not found: {0}")]
    InterfaceNotFound(String),

    #[error("Permission denied. Run with sudo.")]
    PermissionDenied,

    #[error("Failed to parse output: {0}")]
    ParseError(String),

    #[error("Invalid LAN range: {0}")]
    InvalidCidr(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("No default IPv4 route found. Is the uplink connected?")]
    NoDefaultRoute,

    #[error("Failed to start {role}: {message}")]
    ServiceStart { role: ServiceRole, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ApError {
    /// Build a `CommandFailed` from a program, its arguments and a message.
    pub fn command(program: &str, args: &[String], message: impl Into<String>) -> Self {
        ApError::CommandFailed {
            command: render_command(program, args),
            message: message.into(),
        }
    }
}

/// Render a command line the way it would be typed in a shell.
pub fn render_command(program: &str, args: &[String]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{} {}", program, args.join(" "))
    }
}

pub type Result<T> = std::result::Result<T, ApError>;
