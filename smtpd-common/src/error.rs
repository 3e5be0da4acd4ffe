//! Error types shared across the smtpd crates.

use std::io;

use thiserror::Error;

/// Errors raised while loading or validating the server configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read configuration: {0}")]
    Io(#[from] io::Error),

    /// The configuration file is not valid TOML.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// A listener declaration is inconsistent.
    #[error("invalid listener {socket}: {reason}")]
    InvalidListener { socket: String, reason: String },
}
