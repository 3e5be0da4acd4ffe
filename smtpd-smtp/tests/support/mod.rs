//! Test harness: a full session over an in-memory duplex stream, with
//! scripted mock collaborators behind the real channels and routers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use smtpd_common::config::{ListenerConfig, Timeouts};
use smtpd_smtp::{
    listener::Listener,
    peer::{
        spawn_routers, AuthReply, AuthRequest, DnsReply, DnsRequest, MfaReply, MfaRequest,
        PeerReplies, Peers, QueueReply, QueueRequest, Verdict,
    },
    registry::Registries,
    session::{Session, SessionConfig},
};
use tempfile::TempDir;
use tokio::{
    io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf},
    sync::mpsc,
    task::JoinHandle,
};

/// Scripted collaborator behaviour.
#[derive(Debug, Clone)]
pub struct Script {
    /// PTR answer; `None` leaves the peer `<unknown>`.
    pub hostname: Option<String>,
    pub reject_connect: bool,
    pub reject_helo: Option<u16>,
    pub reject_mail: Option<u16>,
    pub reject_rcpt: Option<u16>,
    /// Answer RCPT through queue expansion instead of a direct filter
    /// verdict: one SubmitEnvelope per entry, then CommitEnvelopes.
    pub expand_rcpt: Option<Vec<bool>>,
    pub fail_create: bool,
    pub fail_message_file: bool,
    pub fail_commit: bool,
    /// Credentials the checker accepts.
    pub auth_ok: Option<(String, String)>,
    pub max_message_size: u64,
    pub session_secs: u64,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            hostname: Some("client.example".to_string()),
            reject_connect: false,
            reject_helo: None,
            reject_mail: None,
            reject_rcpt: None,
            expand_rcpt: None,
            fail_create: false,
            fail_message_file: false,
            fail_commit: false,
            auth_ok: None,
            max_message_size: 35 * 1024 * 1024,
            session_secs: 5,
        }
    }
}

/// What the mock queue saw.
#[derive(Debug, Default)]
pub struct QueueLog {
    pub files: Mutex<HashMap<u32, PathBuf>>,
    pub committed: Mutex<Vec<u32>>,
    pub removed: Mutex<Vec<u32>>,
}

impl QueueLog {
    pub fn committed(&self) -> Vec<u32> {
        self.committed.lock().unwrap().clone()
    }

    pub fn removed(&self) -> Vec<u32> {
        self.removed.lock().unwrap().clone()
    }

    /// Wait for at least `count` removals; teardown is asynchronous.
    pub async fn wait_for_removed(&self, count: usize) -> Vec<u32> {
        for _ in 0..200 {
            let removed = self.removed();
            if removed.len() >= count {
                return removed;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {count} removed message(s)");
    }

    pub fn spool_content(&self, msgid: u32) -> String {
        let path = self.files.lock().unwrap().get(&msgid).unwrap().clone();
        std::fs::read_to_string(path).unwrap()
    }
}

pub fn plain_listener() -> ListenerConfig {
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

pub struct Client {
    reader: BufReader<ReadHalf<tokio::io::DuplexStream>>,
    writer: WriteHalf<tokio::io::DuplexStream>,
}

impl Client {
    /// Read one reply line and assert its prefix.
    pub async fn expect(&mut self, prefix: &str) -> String {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await.unwrap();
        assert!(n > 0, "connection closed while expecting {prefix:?}");
        let line = line.trim_end_matches(['\r', '\n']).to_string();
        assert!(
            line.starts_with(prefix),
            "expected reply starting with {prefix:?}, got {line:?}"
        );
        line
    }

    /// Read EHLO-style replies until the `250 ` terminal line.
    pub async fn expect_ehlo_block(&mut self) -> Vec<String> {
        let mut lines = vec![self.expect("250-").await];
        loop {
            let mut line = String::new();
            self.reader.read_line(&mut line).await.unwrap();
            let line = line.trim_end_matches(['\r', '\n']).to_string();
            let done = line.starts_with("250 ");
            lines.push(line);
            if done {
                return lines;
            }
        }
    }

    pub async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\r\n").await.unwrap();
    }

    /// Write raw bytes, no CRLF appended.
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
    }

    /// True once the server has closed the stream.
    pub async fn closed(&mut self) -> bool {
        let mut line = String::new();
        self.reader.read_line(&mut line).await.unwrap() == 0
    }
}

pub struct Harness {
    pub client: Client,
    pub queue: Arc<QueueLog>,
    pub registries: Arc<Registries>,
    pub session_id: u64,
    pub session: JoinHandle<()>,
    _spool: TempDir,
}

pub async fn start(listener: ListenerConfig, script: Script) -> Harness {
    let script = Arc::new(script);
    let registries = Arc::new(Registries::new());
    let queue_log = Arc::new(QueueLog::default());
    let spool = TempDir::new().unwrap();

    let (dns_tx, dns_rx) = mpsc::channel(32);
    let (mfa_tx, mfa_rx) = mpsc::channel(32);
    let (queue_tx, queue_rx) = mpsc::channel(32);
    let (auth_tx, auth_rx) = mpsc::channel(32);
    let (dns_reply_tx, dns_reply_rx) = mpsc::channel(32);
    let (mfa_reply_tx, mfa_reply_rx) = mpsc::channel(32);
    let (queue_reply_tx, queue_reply_rx) = mpsc::channel(32);
    let (auth_reply_tx, auth_reply_rx) = mpsc::channel(32);

    spawn_routers(
        Arc::clone(&registries),
        PeerReplies {
            dns: dns_reply_rx,
            mfa: mfa_reply_rx,
            queue: queue_reply_rx,
            auth: auth_reply_rx,
        },
    );

    tokio::spawn(serve_dns(Arc::clone(&script), dns_rx, dns_reply_tx));
    tokio::spawn(serve_mfa(
        Arc::clone(&script),
        mfa_rx,
        mfa_reply_tx,
        queue_reply_tx.clone(),
    ));
    tokio::spawn(serve_queue(
        Arc::clone(&script),
        Arc::clone(&queue_log),
        spool.path().to_path_buf(),
        queue_rx,
        queue_reply_tx,
    ));
    tokio::spawn(serve_auth(Arc::clone(&script), auth_rx, auth_reply_tx));

    let listener = Arc::new(Listener::from_config(listener).unwrap());
    let config = SessionConfig {
        hostname: Arc::from("mail.example"),
        max_message_size: script.max_message_size,
        timeouts: Timeouts {
            session_secs: script.session_secs,
        },
        registries: Arc::clone(&registries),
        peers: Peers {
            dns: dns_tx,
            mfa: mfa_tx,
            queue: queue_tx,
            auth: auth_tx,
        },
    };

    let (client, server) = duplex(16 * 1024);
    let session = Session::create(server, "192.0.2.1:34567".parse().unwrap(), listener, config);
    let session_id = session.id();
    let session = tokio::spawn(session.run());

    let (reader, writer) = tokio::io::split(client);
    Harness {
        client: Client {
            reader: BufReader::new(reader),
            writer,
        },
        queue: queue_log,
        registries,
        session_id,
        session,
        _spool: spool,
    }
}

async fn serve_dns(
    script: Arc<Script>,
    mut requests: mpsc::Receiver<DnsRequest>,
    replies: mpsc::Sender<DnsReply>,
) {
    while let Some(DnsRequest::Ptr { reqid, .. }) = requests.recv().await {
        let reply = DnsReply::Ptr {
            reqid,
            host: script.hostname.clone(),
        };
        if replies.send(reply).await.is_err() {
            break;
        }
    }
}

async fn serve_mfa(
    script: Arc<Script>,
    mut requests: mpsc::Receiver<MfaRequest>,
    replies: mpsc::Sender<MfaReply>,
    queue_replies: mpsc::Sender<QueueReply>,
) {
    let verdict = |rejection: Option<u16>| match rejection {
        Some(code) => Verdict::reject(code),
        None => Verdict::ok(),
    };

    while let Some(request) = requests.recv().await {
        let reply = match request {
            MfaRequest::Connect { reqid, .. } => Some(MfaReply::Connect {
                reqid,
                verdict: if script.reject_connect {
                    Verdict::reject(554)
                } else {
                    Verdict::ok()
                },
            }),
            MfaRequest::Helo { reqid, .. } => Some(MfaReply::Helo {
                reqid,
                verdict: verdict(script.reject_helo),
            }),
            MfaRequest::Mail { reqid, .. } => Some(MfaReply::Mail {
                reqid,
                verdict: verdict(script.reject_mail),
            }),
            MfaRequest::Rcpt { reqid, .. } => {
                if script.reject_rcpt.is_none() {
                    if let Some(submits) = &script.expand_rcpt {
                        for ok in submits {
                            let _ = queue_replies
                                .send(QueueReply::SubmitEnvelope { reqid, ok: *ok })
                                .await;
                        }
                        let _ = queue_replies
                            .send(QueueReply::CommitEnvelopes { reqid, ok: true })
                            .await;
                        continue;
                    }
                }
                Some(MfaReply::Rcpt {
                    reqid,
                    verdict: verdict(script.reject_rcpt),
                })
            }
            MfaRequest::Rset { .. } => None,
            // pass-through scrubber
            MfaRequest::DataLine { reqid, line } => Some(MfaReply::DataLine { reqid, line }),
        };

        if let Some(reply) = reply {
            if replies.send(reply).await.is_err() {
                break;
            }
        }
    }
}

async fn serve_queue(
    script: Arc<Script>,
    log: Arc<QueueLog>,
    dir: PathBuf,
    mut requests: mpsc::Receiver<QueueRequest>,
    replies: mpsc::Sender<QueueReply>,
) {
    let mut next_msgid: u32 = 1;

    while let Some(request) = requests.recv().await {
        let reply = match request {
            QueueRequest::CreateMessage { reqid } => {
                let evpid = if script.fail_create {
                    None
                } else {
                    let msgid = next_msgid;
                    next_msgid += 1;
                    log.files
                        .lock()
                        .unwrap()
                        .insert(msgid, dir.join(format!("{msgid:08x}")));
                    Some((u64::from(msgid) << 32) | 1)
                };
                Some(QueueReply::CreateMessage { reqid, evpid })
            }
            QueueRequest::MessageFile { reqid, evpid } => {
                let file = if script.fail_message_file {
                    None
                } else {
                    let msgid = (evpid >> 32) as u32;
                    let path = log.files.lock().unwrap().get(&msgid).unwrap().clone();
                    std::fs::File::create(path).ok()
                };
                Some(QueueReply::MessageFile { reqid, file })
            }
            QueueRequest::CommitMessage { reqid, evpid } => {
                let ok = !script.fail_commit;
                if ok {
                    log.committed.lock().unwrap().push((evpid >> 32) as u32);
                }
                Some(QueueReply::CommitMessage { reqid, ok })
            }
            QueueRequest::RemoveMessage { msgid } => {
                log.removed.lock().unwrap().push(msgid);
                None
            }
        };

        if let Some(reply) = reply {
            if replies.send(reply).await.is_err() {
                break;
            }
        }
    }
}

async fn serve_auth(
    script: Arc<Script>,
    mut requests: mpsc::Receiver<AuthRequest>,
    replies: mpsc::Sender<AuthReply>,
) {
    while let Some(request) = requests.recv().await {
        let success = script
            .auth_ok
            .as_ref()
            .is_some_and(|(user, pass)| *user == request.user && *pass == request.pass);
        let reply = AuthReply {
            reqid: request.reqid,
            success,
        };
        if replies.send(reply).await.is_err() {
            break;
        }
    }
}
