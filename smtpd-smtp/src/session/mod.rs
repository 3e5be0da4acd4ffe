//! The per-connection session actor.
//!
//! One `Session` owns one inbound socket and drives it through the SMTP
//! dialogue. Commands execute in strict order: a command is not consumed
//! while the previous one is still being answered, and a collaborator call
//! suspends the session until its reply is routed back through the
//! registries.

#[cfg(test)]
mod auth_tests;
mod body;
mod reply;
mod sasl;

use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc, LazyLock,
};

use smtpd_common::{
    config::Timeouts, envelope::Envelope, incoming, internal, mailaddr, stats::stats, tracing,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
    time::timeout,
};

use crate::{
    command::{self, Verb},
    connection::{Connection, LineRead},
    error::{SessionError, TlsError},
    listener::Listener,
    peer::{
        Answer, DnsReply, DnsRequest, MfaReply, MfaRequest, Peers, QueueReply, QueueRequest,
    },
    registry::{Registries, Waitlist},
    state::{Phase, State},
    SMTP_KICK_THRESHOLD, SMTP_LINE_MAX, SMTP_MAX_MAIL, SMTP_MAX_RCPT,
};

static BOOT_SALT: LazyLock<u32> = LazyLock::new(rand::random);
static SESSION_COUNTER: AtomicU32 = AtomicU32::new(1);

/// Process-unique session id: a random boot salt in the high word, a
/// counter in the low word.
fn generate_uid() -> u64 {
    (u64::from(*BOOT_SALT) << 32) | u64::from(SESSION_COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// Session flags. A new greeting clears everything except the channel
/// properties (`secure`, `authenticated`), which persist until the session
/// is freed.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct SessionFlags {
    pub ehlo: bool,
    pub eightbitmime: bool,
    pub secure: bool,
    pub authenticated: bool,
    pub smtp_end: bool,
    pub mfa_end: bool,
    pub kick: bool,
}

impl SessionFlags {
    fn reset_greeting(&mut self) {
        *self = Self {
            secure: self.secure,
            authenticated: self.authenticated,
            ..Self::default()
        };
    }
}

/// Delivery status of the open message body.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct DeliveryStatus {
    pub tempfail: bool,
    pub permfail: bool,
}

/// Why a session ended, for the teardown log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Close {
    Done,
    Disconnected,
    Kick,
    Rejected,
}

impl Close {
    const fn reason(self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Disconnected => "disconnected",
            Self::Kick => "kick",
            Self::Rejected => "rejected by filter",
        }
    }
}

/// Shared (per-engine) session parameters.
#[derive(Clone)]
pub struct SessionConfig {
    pub hostname: Arc<str>,
    pub max_message_size: u64,
    pub timeouts: Timeouts,
    pub registries: Arc<Registries>,
    pub peers: Peers,
}

pub(crate) fn unexpected(answer: &Answer) -> ! {
    panic!("unexpected collaborator reply: {answer:?}");
}

pub struct Session<Stream: AsyncRead + AsyncWrite + Unpin + Send> {
    id: u64,
    peer: SocketAddr,
    conn: Connection<Stream>,
    listener: Arc<Listener>,
    config: SessionConfig,
    answers_tx: mpsc::Sender<Answer>,
    answers: mpsc::Receiver<Answer>,
    hostname: String,
    state: State,
    phase: Phase,
    flags: SessionFlags,
    evp: Envelope,
    /// Last command line, kept for the failed-command transcript.
    cmd: String,
    kickcount: usize,
    mailcount: usize,
    rcptcount: usize,
    destcount: usize,
    datalen: u64,
    dstatus: DeliveryStatus,
    ofile: Option<tokio::fs::File>,
    auth: sasl::AuthState,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> Session<Stream> {
    pub fn create(
        stream: Stream,
        peer: SocketAddr,
        listener: Arc<Listener>,
        config: SessionConfig,
    ) -> Self {
        let (answers_tx, answers) = mpsc::channel(16);
        let id = generate_uid();
        let evp = Envelope {
            tag: listener.tag().to_string(),
            session_id: id,
            peer: Some(peer),
            ..Envelope::default()
        };

        Self {
            id,
            peer,
            conn: Connection::new(stream),
            listener,
            config,
            answers_tx,
            answers,
            hostname: String::new(),
            state: State::New,
            phase: Phase::Init,
            flags: SessionFlags::default(),
            evp,
            cmd: String::new(),
            kickcount: 0,
            mailcount: 0,
            rcptcount: 0,
            destcount: 0,
            datalen: 0,
            dstatus: DeliveryStatus::default(),
            ofile: None,
            auth: sasl::AuthState::default(),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Drive the session to completion and free it.
    pub async fn run(mut self) {
        stats().session_opened();

        let reason = match self.serve().await {
            Ok(close) => {
                if close == Close::Done {
                    internal!(level = INFO, "smtp-in: Closing session {:016x}", self.id);
                }
                close.reason()
            }
            Err(SessionError::Timeout) => {
                internal!(
                    level = INFO,
                    "smtp-in: Disconnecting session {:016x}: session timeout",
                    self.id
                );
                "timeout"
            }
            Err(SessionError::Connection(ref err)) => {
                internal!(
                    level = INFO,
                    "smtp-in: Disconnecting session {:016x}: IO error: {err}",
                    self.id
                );
                "IO error"
            }
            Err(ref err) => {
                internal!(
                    level = INFO,
                    "smtp-in: Disconnecting session {:016x}: {err}",
                    self.id
                );
                "error"
            }
        };

        self.free(reason);
    }

    async fn serve(&mut self) -> Result<Close, SessionError> {
        self.resolve_hostname().await?;

        self.state = State::Connected;
        internal!(
            level = INFO,
            "smtp-in: New session {:016x} from host {} [{}]",
            self.id,
            self.hostname,
            self.peer.ip()
        );

        self.park(&self.config.registries.mfa_connect);
        self.to_mfa(MfaRequest::Connect {
            reqid: self.id,
            evp: self.evp.clone(),
        })
        .await?;
        let verdict = match self.wait().await? {
            Answer::Mfa(MfaReply::Connect { verdict, .. }) => verdict,
            other => unexpected(&other),
        };
        if verdict.is_reject() {
            internal!(
                level = INFO,
                "smtp-in: Disconnecting session {:016x}: rejected by filter",
                self.id
            );
            return Ok(Close::Rejected);
        }

        if self.listener.smtps() {
            self.handshake().await?;
        }

        self.reply(&format!("220 {} ESMTP OpenSMTPD", self.config.hostname))
            .await?;
        self.state = State::Helo;

        loop {
            match self.state {
                State::Quit => return Ok(Close::Done),

                State::Tls => {
                    // plaintext pipelined behind STARTTLS would desync the
                    // handshake
                    if self.conn.buffered() > 0 {
                        self.reply("500 5.0.0 Pipelining not supported").await?;
                        self.state = State::Quit;
                        continue;
                    }
                    self.handshake().await?;
                    self.state = State::Helo;
                    self.phase = Phase::Init;
                }

                State::Body => {
                    if let Some(close) = self.body_io().await? {
                        return Ok(close);
                    }
                }

                _ => {
                    // Bytes already buffered at this point arrived ahead of
                    // the previous reply.
                    if self.conn.buffered() > 0 {
                        self.reply("500 5.0.0 Pipelining not supported").await?;
                        self.state = State::Quit;
                        continue;
                    }

                    match self.read_line().await? {
                        LineRead::Closed => {
                            internal!(
                                level = INFO,
                                "smtp-in: Received disconnect from session {:016x}",
                                self.id
                            );
                            return Ok(Close::Disconnected);
                        }
                        LineRead::TooLong => {
                            self.reply("500 5.0.0 Line too long").await?;
                            self.state = State::Quit;
                        }
                        LineRead::Line(raw) => {
                            let line = String::from_utf8_lossy(&raw).into_owned();
                            self.command(line).await?;
                            if self.flags.kick {
                                return Ok(Close::Kick);
                            }
                        }
                    }
                }
            }
        }
    }

    async fn resolve_hostname(&mut self) -> Result<(), SessionError> {
        self.park(&self.config.registries.dns_ptr);
        self.to_dns(DnsRequest::Ptr {
            reqid: self.id,
            peer: self.peer,
        })
        .await?;

        let host = match self.wait().await? {
            Answer::Dns(DnsReply::Ptr { host, .. }) => host,
            other => unexpected(&other),
        };
        self.hostname = host.unwrap_or_else(|| "<unknown>".to_string());

        // A locally enqueued message keeps its bounces local.
        if self.hostname == "localhost" {
            self.evp.flags.bounce = true;
        }
        self.evp.hostname = self.hostname.clone();
        Ok(())
    }

    async fn handshake(&mut self) -> Result<(), SessionError> {
        let acceptor = self
            .listener
            .tls
            .clone()
            .ok_or(TlsError::MissingContext)?;

        let negotiated = {
            let info = self.conn.upgrade(&acceptor).await?;
            format!(
                "version={} cipher={} bits={}",
                info.proto(),
                info.cipher(),
                info.bits()
            )
        };
        internal!(
            level = INFO,
            "smtp-in: Started TLS on session {:016x}: {negotiated}",
            self.id
        );

        self.flags.secure = true;
        self.kickcount = 0;
        stats().tls_started(self.listener.smtps());
        Ok(())
    }

    async fn read_line(&mut self) -> Result<LineRead, SessionError> {
        match timeout(self.config.timeouts.session(), self.conn.line(SMTP_LINE_MAX)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(SessionError::Timeout),
        }
    }

    /// Receive the reply for the outstanding collaborator call.
    pub(crate) async fn wait(&mut self) -> Result<Answer, SessionError> {
        match timeout(self.config.timeouts.session(), self.answers.recv()).await {
            Ok(Some(answer)) => Ok(answer),
            Ok(None) => Err(SessionError::PeerGone),
            Err(_) => Err(SessionError::Timeout),
        }
    }

    pub(crate) fn park(&self, list: &Waitlist) {
        list.insert(self.id, self.answers_tx.clone());
    }

    pub(crate) async fn to_dns(&self, req: DnsRequest) -> Result<(), SessionError> {
        self.config
            .peers
            .dns
            .send(req)
            .await
            .map_err(|_| SessionError::PeerGone)
    }

    pub(crate) async fn to_mfa(&self, req: MfaRequest) -> Result<(), SessionError> {
        self.config
            .peers
            .mfa
            .send(req)
            .await
            .map_err(|_| SessionError::PeerGone)
    }

    pub(crate) async fn to_queue(&self, req: QueueRequest) -> Result<(), SessionError> {
        self.config
            .peers
            .queue
            .send(req)
            .await
            .map_err(|_| SessionError::PeerGone)
    }

    async fn command(&mut self, line: String) -> Result<(), SessionError> {
        incoming!("{line}");
        self.cmd.clone_from(&line);

        self.kickcount += 1;
        if self.kickcount >= SMTP_KICK_THRESHOLD {
            internal!(
                level = INFO,
                "smtp-in: Disconnecting session {:016x}: session not moving forward",
                self.id
            );
            self.flags.kick = true;
            stats().kicked();
            return Ok(());
        }

        // The SASL continuation states consume raw lines.
        match self.state {
            State::AuthInit => return self.auth_plain(Some(line.as_str())).await,
            State::AuthUsername | State::AuthPassword => {
                return self.auth_login(Some(line.as_str())).await
            }
            _ => {}
        }

        let parsed = command::parse(&line);
        match parsed.verb {
            None => self.reply("500 Command unrecognized").await,
            Some(Verb::Helo) => self.cmd_helo(false, parsed.arg).await,
            Some(Verb::Ehlo) => self.cmd_helo(true, parsed.arg).await,
            Some(Verb::StartTls) => self.cmd_starttls(parsed.arg).await,
            Some(Verb::Auth) => self.cmd_auth(parsed.arg).await,
            Some(Verb::MailFrom) => self.cmd_mail(parsed.arg).await,
            Some(Verb::RcptTo) => self.cmd_rcpt(parsed.arg).await,
            Some(Verb::Data) => self.cmd_data().await,
            Some(Verb::Rset) => self.cmd_rset().await,
            Some(Verb::Quit) => self.cmd_quit().await,
            Some(Verb::Noop) => self.reply("250 2.0.0 Ok").await,
            Some(Verb::Help) => self.cmd_help().await,
        }
    }

    fn advertise_tls(&self) -> bool {
        self.listener.starttls() && !self.flags.secure
    }

    fn advertise_auth(&self) -> bool {
        self.listener.auth() && self.flags.secure && !self.flags.authenticated
    }

    async fn cmd_helo(&mut self, ehlo: bool, arg: Option<&str>) -> Result<(), SessionError> {
        if self.phase != Phase::Init {
            return self.reply("503 Already identified").await;
        }
        let Some(arg) = arg else {
            return self
                .reply(&format!(
                    "501 {} requires domain address",
                    if ehlo { "EHLO" } else { "HELO" }
                ))
                .await;
        };
        if !mailaddr::valid_domainpart(arg) {
            return self.reply("501 Invalid domain name").await;
        }

        self.evp.helo = arg.to_string();
        self.evp.session_id = self.id;
        self.flags.reset_greeting();
        if ehlo {
            self.flags.ehlo = true;
            self.flags.eightbitmime = true;
        }

        self.park(&self.config.registries.mfa_helo);
        self.to_mfa(MfaRequest::Helo {
            reqid: self.id,
            evp: self.evp.clone(),
        })
        .await?;
        let verdict = match self.wait().await? {
            Answer::Mfa(MfaReply::Helo { verdict, .. }) => verdict,
            other => unexpected(&other),
        };
        if verdict.is_reject() {
            return self
                .reply(&format!("{} Hello rejected", verdict.code(550)))
                .await;
        }

        self.reply(&format!(
            "250{}{} Hello {} [{}], pleased to meet you",
            if self.flags.ehlo { '-' } else { ' ' },
            self.config.hostname,
            self.evp.helo,
            self.peer.ip()
        ))
        .await?;

        if self.flags.ehlo {
            self.reply("250-8BITMIME").await?;
            self.reply("250-ENHANCEDSTATUSCODES").await?;
            self.reply(&format!("250-SIZE {}", self.config.max_message_size))
                .await?;
            if self.advertise_tls() {
                self.reply("250-STARTTLS").await?;
            }
            if self.advertise_auth() {
                self.reply("250-AUTH PLAIN LOGIN").await?;
            }
            self.reply("250 HELP").await?;
        }

        self.kickcount = 0;
        self.phase = Phase::Setup;
        Ok(())
    }

    async fn cmd_starttls(&mut self, arg: Option<&str>) -> Result<(), SessionError> {
        if self.phase != Phase::Setup {
            return self.reply("503 Command not allowed at this point").await;
        }
        if !self.listener.starttls() || self.listener.tls.is_none() {
            return self.reply("503 Command not supported").await;
        }
        if self.flags.secure {
            return self.reply("501 Channel already secured").await;
        }
        if arg.is_some() {
            return self.reply("501 No parameters allowed").await;
        }

        self.reply("220 Ready to start TLS").await?;
        self.state = State::Tls;
        Ok(())
    }

    async fn cmd_auth(&mut self, arg: Option<&str>) -> Result<(), SessionError> {
        if self.phase != Phase::Setup {
            return self.reply("503 Command not allowed at this point").await;
        }
        if self.flags.authenticated {
            return self.reply("503 Already authenticated").await;
        }
        if !self.advertise_auth() {
            return self.reply("503 Command not supported").await;
        }
        let Some(arg) = arg else {
            return self.reply("501 No parameters given").await;
        };

        let (method, initial) = match arg.find([' ', '\t']) {
            Some(at) => (&arg[..at], Some(arg[at + 1..].trim_start())),
            None => (arg, None),
        };

        if method.eq_ignore_ascii_case("PLAIN") {
            self.auth_plain(initial).await
        } else if method.eq_ignore_ascii_case("LOGIN") {
            self.auth_login(initial).await
        } else {
            self.reply(&format!("504 AUTH method \"{method}\" not supported"))
                .await
        }
    }

    async fn cmd_mail(&mut self, arg: Option<&str>) -> Result<(), SessionError> {
        if self.phase != Phase::Setup {
            return self.reply("503 Command not allowed at this point").await;
        }
        if self.listener.starttls_require() && !self.flags.secure {
            return self
                .reply("530 5.7.0 Must issue a STARTTLS command first")
                .await;
        }
        if self.listener.auth_require() && !self.flags.authenticated {
            return self.reply("530 5.7.0 Must issue an AUTH command first").await;
        }
        if self.mailcount >= SMTP_MAX_MAIL {
            return self.reply("452 Too many messages sent").await;
        }

        let arg = arg.unwrap_or("");
        let (addr, params) = if self.flags.ehlo {
            command::split_esmtp_params(arg)
        } else {
            (arg, Vec::new())
        };

        let sender = match mailaddr::parse_path(addr.trim()) {
            Ok(addr) => addr,
            Err(_) => return self.reply("553 5.1.7 Sender address syntax error").await,
        };

        for param in &params {
            if param.len() >= 5 && param.as_bytes()[..5].eq_ignore_ascii_case(b"AUTH=") {
                tracing::debug!(target: "smtpd", "smtp: AUTH in MAIL FROM command");
            } else if param.eq_ignore_ascii_case("BODY=7BIT") {
                self.flags.eightbitmime = false;
            } else if param.eq_ignore_ascii_case("BODY=8BITMIME") {
            } else {
                return self
                    .reply(&format!("503 5.5.4 Unsupported option {param}"))
                    .await;
            }
        }

        self.evp.sender = sender;

        self.park(&self.config.registries.mfa_mailfrom);
        self.to_mfa(MfaRequest::Mail {
            reqid: self.id,
            evp: self.evp.clone(),
        })
        .await?;
        let verdict = match self.wait().await? {
            Answer::Mfa(MfaReply::Mail { verdict, .. }) => verdict,
            other => unexpected(&other),
        };
        if verdict.is_reject() {
            return self
                .reply(&format!("{} Sender rejected", verdict.code(550)))
                .await;
        }
        if let Some(rewritten) = verdict.mailaddr {
            self.evp.sender = rewritten;
        }

        self.park(&self.config.registries.queue_msg);
        self.to_queue(QueueRequest::CreateMessage { reqid: self.id })
            .await?;
        match self.wait().await? {
            Answer::Queue(QueueReply::CreateMessage {
                evpid: Some(evpid), ..
            }) => {
                self.evp.id = evpid;
                self.rcptcount = 0;
                self.phase = Phase::Transaction;
                self.reply("250 Ok").await
            }
            Answer::Queue(QueueReply::CreateMessage { evpid: None, .. }) => {
                self.reply("421 Temporary Error").await
            }
            other => unexpected(&other),
        }
    }

    async fn cmd_rcpt(&mut self, arg: Option<&str>) -> Result<(), SessionError> {
        if self.phase != Phase::Transaction {
            return self.reply("503 Command not allowed at this point").await;
        }
        if self.rcptcount >= SMTP_MAX_RCPT {
            return self.reply("452 Too many recipients").await;
        }

        let rcpt = match mailaddr::parse_path(arg.unwrap_or("").trim()) {
            Ok(addr) => addr,
            Err(_) => {
                return self
                    .reply("553 5.1.3 Recipient address syntax error")
                    .await
            }
        };
        self.evp.rcpt = rcpt;

        self.park(&self.config.registries.mfa_rcpt);
        self.to_mfa(MfaRequest::Rcpt {
            reqid: self.id,
            evp: self.evp.clone(),
        })
        .await?;

        // The filter either answers directly, or expands the recipient
        // through the queue: zero or more SubmitEnvelope events followed by
        // one CommitEnvelopes.
        loop {
            match self.wait().await? {
                Answer::Mfa(MfaReply::Rcpt { verdict, .. }) => {
                    if verdict.is_reject() {
                        return self
                            .reply(&format!(
                                "{} 5.0.0 Recipient rejected: {}@{}",
                                verdict.code(550),
                                self.evp.rcpt.user(),
                                self.evp.rcpt.domain()
                            ))
                            .await;
                    }
                    self.rcptcount += 1;
                    self.kickcount = 0;
                    return self.reply("250 2.0.0 Recipient ok").await;
                }
                Answer::Queue(QueueReply::SubmitEnvelope { ok, .. }) => {
                    if ok {
                        self.destcount += 1;
                        tracing::trace!(
                            target: "smtpd",
                            "smtp: {:016x}: envelope submitted ({} destinations)",
                            self.id,
                            self.destcount
                        );
                    } else {
                        self.dstatus.tempfail = true;
                    }
                }
                Answer::Queue(QueueReply::CommitEnvelopes { .. }) => {
                    self.rcptcount += 1;
                    self.kickcount = 0;
                    return self.reply("250 2.0.0 Recipient ok").await;
                }
                other => unexpected(&other),
            }
        }
    }

    async fn cmd_rset(&mut self) -> Result<(), SessionError> {
        if self.phase != Phase::Transaction {
            return self.reply("503 Command not allowed at this point").await;
        }

        self.to_mfa(MfaRequest::Rset {
            reqid: self.id,
            evp: self.evp.clone(),
        })
        .await?;
        if self.evp.id != 0 {
            let _ = self
                .config
                .peers
                .queue
                .try_send(QueueRequest::RemoveMessage {
                    msgid: self.evp.msgid(),
                });
        }

        self.reply("250 2.0.0 Reset state").await?;
        self.phase = Phase::Setup;
        self.flags.eightbitmime = self.flags.ehlo;
        self.evp.id = 0;
        Ok(())
    }

    async fn cmd_data(&mut self) -> Result<(), SessionError> {
        if self.phase != Phase::Transaction {
            return self.reply("503 Command not allowed at this point").await;
        }
        if self.rcptcount == 0 {
            return self.reply("503 5.5.1 No recipient specified").await;
        }

        self.park(&self.config.registries.queue_fd);
        self.to_queue(QueueRequest::MessageFile {
            reqid: self.id,
            evpid: self.evp.id,
        })
        .await?;
        match self.wait().await? {
            Answer::Queue(QueueReply::MessageFile {
                file: Some(file), ..
            }) => self.open_body(file).await,
            Answer::Queue(QueueReply::MessageFile { file: None, .. }) => {
                self.reply("421 Temporary Error").await
            }
            other => unexpected(&other),
        }
    }

    async fn cmd_quit(&mut self) -> Result<(), SessionError> {
        self.reply("221 2.0.0 Bye").await?;
        self.state = State::Quit;
        Ok(())
    }

    async fn cmd_help(&mut self) -> Result<(), SessionError> {
        self.reply("214- This is OpenSMTPD").await?;
        self.reply("214- To report bugs in the implementation, please contact bugs@openbsd.org")
            .await?;
        self.reply("214- with full details").await?;
        self.reply("214 End of HELP info").await
    }

    /// Teardown: drop registry entries, remove an open message, close the
    /// spool file and settle the counters.
    fn free(&mut self, reason: &str) {
        tracing::debug!(target: "smtpd", "smtp: {:016x}: deleting session: {reason}", self.id);

        self.config.registries.purge(self.id);

        if self.evp.id != 0 {
            let _ = self
                .config
                .peers
                .queue
                .try_send(QueueRequest::RemoveMessage {
                    msgid: self.evp.msgid(),
                });
        }

        self.ofile = None;
        self.auth.clear();

        if self.flags.secure {
            stats().tls_closed(self.listener.smtps());
        }
        stats().session_closed();
    }
}
