//! DATA ingest.
//!
//! The body is streamed line by line into the spool file handed over by the
//! queue. Lines are dot-unstuffed, optionally masked to 7 bits, and counted
//! against the per-message size cap. When the listener's DATA-line hook is
//! enabled, lines detour through the filter subsystem and come back
//! scrubbed; the end-of-body gate fires once both the client's final `"."`
//! and the filter's `"."` sentinel have been seen.

use smtpd_common::{internal, stats::stats, tracing};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    time::timeout,
};

use crate::{
    connection::LineRead,
    error::SessionError,
    peer::{Answer, MfaReply, MfaRequest, QueueReply, QueueRequest},
    state::{Phase, State},
    SMTP_LINE_MAX,
};

use super::{unexpected, Close, DeliveryStatus, Session};

enum BodyEvent {
    Client(std::io::Result<LineRead>),
    Filter(Option<Answer>),
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> Session<Stream> {
    /// The queue produced a spool file: write the `Received:` trailer,
    /// answer `354` and enter the body.
    pub(super) async fn open_body(&mut self, file: std::fs::File) -> Result<(), SessionError> {
        let mut ofile = tokio::fs::File::from_std(file);

        self.datalen = 0;
        self.dstatus = DeliveryStatus::default();
        if self.write_received(&mut ofile).await.is_err() {
            self.dstatus.tempfail = true;
        }

        self.reply("354 Enter mail, end with \".\" on a line by itself")
            .await?;

        self.ofile = Some(ofile);
        self.flags.smtp_end = false;
        self.flags.mfa_end = false;
        self.state = State::Body;

        if self.listener.filter_dataline() {
            // the session stays parked here until the "." sentinel drains
            // the scrubbed-line stream
            self.park(&self.config.registries.mfa_data);
        } else {
            tracing::debug!(target: "smtpd", "smtp: disabling filter for message body");
            self.flags.mfa_end = true;
        }

        Ok(())
    }

    async fn write_received(&mut self, ofile: &mut tokio::fs::File) -> std::io::Result<()> {
        use std::fmt::Write as _;

        let mut header = String::new();
        let _ = write!(
            header,
            "Received: from {} ({} [{}]);\n\tby {} (OpenSMTPD) with {}SMTP id {:08x};\n",
            self.evp.helo,
            self.hostname,
            self.peer.ip(),
            self.config.hostname,
            if self.flags.ehlo { "E" } else { "" },
            self.evp.msgid()
        );

        if self.flags.secure {
            if let Some(info) = self.conn.tls_info() {
                let _ = write!(
                    header,
                    "\tTLS version={} cipher={} bits={};\n",
                    info.proto(),
                    info.cipher(),
                    info.bits()
                );
            }
        }

        if self.rcptcount == 1 {
            let _ = write!(header, "\tfor <{}>;\n", self.evp.rcpt);
        }

        let _ = write!(header, "\t{}\n", chrono::Local::now().to_rfc2822());

        ofile.write_all(header.as_bytes()).await?;
        self.datalen += header.len() as u64;
        Ok(())
    }

    /// One step of body I/O: a client line, or a scrubbed line back from
    /// the filter.
    pub(super) async fn body_io(&mut self) -> Result<Option<Close>, SessionError> {
        let read_client = !self.flags.smtp_end;
        let read_filter = self.listener.filter_dataline() && !self.flags.mfa_end;

        let event = {
            let conn = &mut self.conn;
            let answers = &mut self.answers;
            let step = async {
                tokio::select! {
                    line = conn.line(SMTP_LINE_MAX), if read_client => BodyEvent::Client(line),
                    answer = answers.recv(), if read_filter => BodyEvent::Filter(answer),
                    else => panic!("body io with nothing to wait for"),
                }
            };
            match timeout(self.config.timeouts.session(), step).await {
                Ok(event) => event,
                Err(_) => return Err(SessionError::Timeout),
            }
        };

        match event {
            BodyEvent::Client(line) => match line? {
                LineRead::Closed => {
                    internal!(
                        level = INFO,
                        "smtp-in: Received disconnect from session {:016x}",
                        self.id
                    );
                    return Ok(Some(Close::Disconnected));
                }
                LineRead::TooLong => {
                    self.reply("500 5.0.0 Line too long").await?;
                    self.state = State::Quit;
                }
                LineRead::Line(raw) => self.body_line(raw).await?,
            },

            BodyEvent::Filter(None) => return Err(SessionError::PeerGone),
            BodyEvent::Filter(Some(Answer::Mfa(MfaReply::DataLine { line, .. }))) => {
                if line == b"." {
                    self.flags.mfa_end = true;
                    self.end_body().await?;
                } else {
                    self.queue_data(&line).await;
                }
            }
            BodyEvent::Filter(Some(other)) => unexpected(&other),
        }

        Ok(None)
    }

    async fn body_line(&mut self, raw: Vec<u8>) -> Result<(), SessionError> {
        if raw == b"." {
            self.flags.smtp_end = true;
            if self.listener.filter_dataline() && !self.flags.mfa_end {
                self.to_mfa(MfaRequest::DataLine {
                    reqid: self.id,
                    line: raw,
                })
                .await?;
            }
            return self.end_body().await;
        }

        if self.listener.filter_dataline() {
            self.to_mfa(MfaRequest::DataLine {
                reqid: self.id,
                line: raw,
            })
            .await
        } else {
            self.queue_data(&raw).await;
            Ok(())
        }
    }

    /// The line sink: dot-unstuff, enforce the size cap, mask to 7 bits
    /// when 8BITMIME is off, append `\n` and write to the spool file.
    async fn queue_data(&mut self, line: &[u8]) {
        tracing::trace!(
            target: "smtpd",
            "smtp: {:016x}: [BODY] {}",
            self.id,
            String::from_utf8_lossy(line)
        );

        if self.dstatus.permfail || self.dstatus.tempfail {
            return;
        }

        // RFC 5321 4.5.2: a leading period is deleted.
        let line = if line.first() == Some(&b'.') {
            &line[1..]
        } else {
            line
        };
        let len = line.len() as u64;

        let Some(total) = self.datalen.checked_add(len + 1) else {
            self.dstatus.permfail = true;
            return;
        };
        if total > self.config.max_message_size {
            self.dstatus.permfail = true;
            return;
        }

        let mut out = Vec::with_capacity(line.len() + 1);
        if self.flags.eightbitmime {
            out.extend_from_slice(line);
        } else {
            out.extend(line.iter().map(|b| b & 0x7f));
        }
        out.push(b'\n');

        let ofile = self.ofile.as_mut().expect("no spool file in body state");
        if ofile.write_all(&out).await.is_err() {
            self.dstatus.tempfail = true;
        } else {
            self.datalen += out.len() as u64;
        }
    }

    /// End-of-body gate: fires once the client has sent `"."` and the
    /// filter has drained, then settles the transaction.
    pub(super) async fn end_body(&mut self) -> Result<(), SessionError> {
        if !(self.flags.smtp_end && self.flags.mfa_end) {
            return Ok(());
        }

        self.phase = Phase::Setup;
        // a BODY= override lasts one transaction; back to the greeting
        // default now that the body is complete
        self.flags.eightbitmime = self.flags.ehlo;

        if let Some(mut ofile) = self.ofile.take() {
            if ofile.flush().await.is_err() || ofile.sync_all().await.is_err() {
                self.dstatus.tempfail = true;
            }
        }

        if self.dstatus.permfail {
            self.reply("554 5.0.0 Transaction failed").await?;
            self.state = State::Helo;
            return Ok(());
        }
        if self.dstatus.tempfail {
            self.reply("421 4.0.0 Temporary failure").await?;
            self.state = State::Quit;
            stats().tempfailed();
            return Ok(());
        }

        self.park(&self.config.registries.queue_commit);
        self.to_queue(QueueRequest::CommitMessage {
            reqid: self.id,
            evpid: self.evp.id,
        })
        .await?;
        match self.wait().await? {
            Answer::Queue(QueueReply::CommitMessage { ok: true, .. }) => {
                self.reply(&format!(
                    "250 2.0.0 {:08x} Message accepted for delivery",
                    self.evp.msgid()
                ))
                .await?;
                internal!(
                    level = INFO,
                    "smtp-in: Accepted message {:08x} on session {:016x}: from=<{}>, size={}, nrcpts={}, proto={}",
                    self.evp.msgid(),
                    self.id,
                    self.evp.sender,
                    self.datalen,
                    self.rcptcount,
                    if self.flags.ehlo { "ESMTP" } else { "SMTP" }
                );

                self.mailcount += 1;
                self.evp.id = 0;
                self.kickcount = 0;
                self.state = State::Helo;
                Ok(())
            }
            Answer::Queue(QueueReply::CommitMessage { ok: false, .. }) => {
                self.reply("421 Temporary failure").await?;
                self.state = State::Quit;
                Ok(())
            }
            other => unexpected(&other),
        }
    }
}
