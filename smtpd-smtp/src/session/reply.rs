//! Reply emission.
//!
//! Replies go through a single choke point that enforces the wire bounds
//! and keeps the failure transcript: every 4xx/5xx reply is logged together
//! with the command that provoked it, control characters escaped.

use smtpd_common::{internal, logging::visible, outgoing};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{error::SessionError, SMTP_LINE_MAX};

use super::Session;

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> Session<Stream> {
    /// Emit one reply line.
    ///
    /// # Panics
    ///
    /// A reply shorter than four bytes or reaching the line maximum is a
    /// protocol bug in the engine itself.
    ///
    /// # Errors
    ///
    /// Propagates transport errors.
    pub(crate) async fn reply(&mut self, line: &str) -> Result<(), SessionError> {
        assert!(line.len() >= 4, "smtp_reply: response too short: {line:?}");
        assert!(line.len() < SMTP_LINE_MAX, "smtp_reply: line too long");

        outgoing!("{line}");

        if matches!(line.as_bytes()[0], b'4' | b'5') {
            internal!(
                level = INFO,
                "smtp-in: Failed command on session {:016x}: \"{}\" => {}",
                self.id,
                visible(&self.cmd),
                line
            );
        }

        self.conn.send(line).await?;
        Ok(())
    }
}
