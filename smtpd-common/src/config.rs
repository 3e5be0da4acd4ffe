//! Server and listener configuration.
//!
//! Loaded from a TOML file; every field has a sensible default so a minimal
//! configuration only names its listeners:
//!
//! ```toml
//! hostname = "mail.example.org"
//!
//! [[listener]]
//! socket = "0.0.0.0:25"
//! tag = "public"
//! starttls = true
//!
//! [listener.tls]
//! certificate = "/etc/ssl/mail.crt"
//! key = "/etc/ssl/private/mail.key"
//! ```

use std::{net::SocketAddr, path::Path, path::PathBuf, time::Duration};

use serde::Deserialize;

use crate::error::ConfigError;

/// Default cap on a single message, in bytes.
const DEFAULT_MAX_MESSAGE_SIZE: u64 = 35 * 1024 * 1024;

const fn default_session_timeout() -> u64 {
    300
}

fn default_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

const fn default_max_message_size() -> u64 {
    DEFAULT_MAX_MESSAGE_SIZE
}

/// Per-session timers.
#[derive(Debug, Clone, Deserialize)]
pub struct Timeouts {
    /// Idle timeout for a session, in seconds.
    #[serde(default = "default_session_timeout")]
    pub session_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            session_secs: default_session_timeout(),
        }
    }
}

impl Timeouts {
    #[must_use]
    pub const fn session(&self) -> Duration {
        Duration::from_secs(self.session_secs)
    }
}

/// TLS material for a listener.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    pub certificate: PathBuf,
    pub key: PathBuf,
}

/// One inbound listener.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    pub socket: SocketAddr,
    #[serde(default)]
    pub tag: String,
    /// Offer STARTTLS.
    #[serde(default)]
    pub starttls: bool,
    /// Refuse MAIL FROM until the channel is secured.
    #[serde(default)]
    pub starttls_require: bool,
    /// Implicit TLS: handshake before the banner.
    #[serde(default)]
    pub smtps: bool,
    /// Offer AUTH PLAIN/LOGIN on a secured channel.
    #[serde(default)]
    pub auth: bool,
    /// Refuse MAIL FROM until authenticated.
    #[serde(default)]
    pub auth_require: bool,
    /// Stream DATA lines through the filter subsystem.
    #[serde(default)]
    pub filter_dataline: bool,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

/// Top-level server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: u64,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default, alias = "listener")]
    pub listeners: Vec<ListenerConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            max_message_size: default_max_message_size(),
            timeouts: Timeouts::default(),
            listeners: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Load and validate a configuration file.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the file cannot be read or parsed, or a
    /// listener declaration is inconsistent.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(&std::fs::read_to_string(path)?)?;
        config.validate()?;
        Ok(config)
    }

    /// Check listener declarations for consistency.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidListener`] when a TLS-dependent flag is
    /// set without TLS material.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for listener in &self.listeners {
            if (listener.smtps || listener.starttls) && listener.tls.is_none() {
                return Err(ConfigError::InvalidListener {
                    socket: listener.socket.to_string(),
                    reason: "smtps/starttls requires a tls section".to_string(),
                });
            }
            if listener.smtps && listener.starttls {
                return Err(ConfigError::InvalidListener {
                    socket: listener.socket.to_string(),
                    reason: "smtps and starttls are mutually exclusive".to_string(),
                });
            }
        }
        Ok(())
    }
}
