//! Inbound listeners.

use std::{net::SocketAddr, sync::Arc};

use futures_util::future::join_all;
use smtpd_common::{config::ListenerConfig, internal, tracing, Signal};
use tokio::{net::TcpListener, sync::broadcast};
use tokio_rustls::TlsAcceptor;

use crate::{
    connection,
    error::TlsError,
    session::{Session, SessionConfig},
};

/// One configured listener: its flags plus, when TLS is configured, the
/// acceptor built once at startup.
pub struct Listener {
    config: ListenerConfig,
    pub(crate) tls: Option<TlsAcceptor>,
}

impl Listener {
    /// Build a listener, loading its TLS material if any.
    ///
    /// # Errors
    ///
    /// Returns a [`TlsError`] when certificate or key loading fails.
    pub fn from_config(config: ListenerConfig) -> Result<Self, TlsError> {
        let tls = match &config.tls {
            Some(tls) => Some(connection::acceptor(tls)?),
            None => None,
        };
        Ok(Self { config, tls })
    }

    #[must_use]
    pub fn socket(&self) -> SocketAddr {
        self.config.socket
    }

    #[must_use]
    pub fn tag(&self) -> &str {
        &self.config.tag
    }

    #[must_use]
    pub fn starttls(&self) -> bool {
        self.config.starttls
    }

    #[must_use]
    pub fn starttls_require(&self) -> bool {
        self.config.starttls_require
    }

    #[must_use]
    pub fn smtps(&self) -> bool {
        self.config.smtps
    }

    #[must_use]
    pub fn auth(&self) -> bool {
        self.config.auth
    }

    #[must_use]
    pub fn auth_require(&self) -> bool {
        self.config.auth_require
    }

    #[must_use]
    pub fn filter_dataline(&self) -> bool {
        self.config.filter_dataline
    }

    /// Accept connections until shutdown, one session task each.
    ///
    /// # Errors
    ///
    /// Returns bind or accept errors.
    pub(crate) async fn serve(
        self: Arc<Self>,
        config: SessionConfig,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> anyhow::Result<()> {
        let socket = TcpListener::bind(self.config.socket).await?;
        internal!(
            level = INFO,
            "smtp-in: listening on {} (tag \"{}\")",
            self.config.socket,
            self.config.tag
        );

        let mut sessions = Vec::new();
        loop {
            tokio::select! {
                sig = shutdown.recv() => {
                    if matches!(sig, Ok(Signal::Shutdown) | Err(_)) {
                        internal!(
                            level = INFO,
                            "smtp-in: listener {} finishing sessions",
                            self.config.socket
                        );
                        join_all(sessions).await;
                        break;
                    }
                }

                conn = socket.accept() => {
                    let (stream, peer) = conn?;
                    tracing::debug!(target: "smtpd", "connection from {peer} on {}", self.config.socket);
                    let session = Session::create(stream, peer, Arc::clone(&self), config.clone());
                    sessions.push(tokio::spawn(session.run()));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> ListenerConfig {
        ListenerConfig {
            socket: "127.0.0.1:0".parse().unwrap(),
            tag: "test".to_string(),
            starttls: false,
            starttls_require: false,
            smtps: false,
            auth: false,
            auth_require: false,
            filter_dataline: false,
            tls: None,
        }
    }

    #[test]
    fn plain_listener_has_no_acceptor() {
        let listener = Listener::from_config(base_config()).unwrap();
        assert!(listener.tls.is_none());
        assert_eq!(listener.tag(), "test");
        assert!(!listener.starttls());
    }

    #[test]
    fn missing_tls_material_fails() {
        let config = ListenerConfig {
            starttls: true,
            tls: Some(smtpd_common::config::TlsConfig {
                certificate: "/nonexistent/cert.pem".into(),
                key: "/nonexistent/key.pem".into(),
            }),
            ..base_config()
        };

        assert!(Listener::from_config(config).is_err());
    }
}
