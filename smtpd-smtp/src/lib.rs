//! The server-side SMTP session engine.
//!
//! One [`Session`](session::Session) per inbound connection drives the ESMTP
//! dialogue: banner, greeting, optional STARTTLS and SASL authentication,
//! envelope construction, DATA spooling and commit. The engine itself owns
//! no policy: reverse DNS, filtering, queueing and credential checks are
//! performed by collaborator subsystems reached over typed channels
//! ([`peer`]), with replies correlated back to waiting sessions through the
//! [`registry`].

pub mod command;
pub mod connection;
pub mod error;
pub mod listener;
pub mod peer;
pub mod registry;
pub mod session;
pub mod state;

use std::sync::Arc;

use futures_util::future::join_all;
use smtpd_common::{config::ServerConfig, internal, Signal};
use tokio::sync::broadcast;

use crate::{
    error::TlsError,
    listener::Listener,
    peer::{PeerReplies, Peers},
    registry::Registries,
    session::SessionConfig,
};

/// Longest accepted command or body line, CRLF excluded.
pub const SMTP_LINE_MAX: usize = 1024;
/// Commands without forward progress before the session is kicked.
pub const SMTP_KICK_THRESHOLD: usize = 50;
/// Messages accepted on one session.
pub const SMTP_MAX_MAIL: usize = 100;
/// Recipients accepted on one transaction.
pub const SMTP_MAX_RCPT: usize = 1000;

/// The inbound SMTP engine: listeners, correlation registries and the
/// collaborator request channels, shared by every session.
pub struct SmtpIn {
    config: SessionConfig,
    listeners: Vec<Arc<Listener>>,
}

impl SmtpIn {
    /// Build the engine from a validated [`ServerConfig`] and the four
    /// collaborator channel pairs. Spawns the reply router tasks, so this
    /// must run inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns a [`TlsError`] when a listener's certificate or key cannot
    /// be loaded.
    pub fn new(config: &ServerConfig, peers: Peers, replies: PeerReplies) -> Result<Self, TlsError> {
        let registries = Arc::new(Registries::new());
        peer::spawn_routers(Arc::clone(&registries), replies);

        let listeners = config
            .listeners
            .iter()
            .map(|l| Listener::from_config(l.clone()).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            config: SessionConfig {
                hostname: Arc::from(config.hostname.as_str()),
                max_message_size: config.max_message_size,
                timeouts: config.timeouts.clone(),
                registries,
                peers,
            },
            listeners,
        })
    }

    /// The shared per-session configuration, for driving a [`session::Session`]
    /// over an arbitrary stream.
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        self.config.clone()
    }

    /// Accept connections on every listener until shutdown.
    ///
    /// # Errors
    ///
    /// Returns the first bind or accept error encountered by a listener.
    pub async fn serve(&self, shutdown: broadcast::Receiver<Signal>) -> anyhow::Result<()> {
        let results = join_all(self.listeners.iter().map(|l| {
            Arc::clone(l).serve(self.config.clone(), shutdown.resubscribe())
        }))
        .await;

        for result in results {
            if let Err(err) = result {
                internal!(level = ERROR, "listener failed: {err}");
                return Err(err);
            }
        }

        Ok(())
    }
}
