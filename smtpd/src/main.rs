//! The smtpd binary: configuration, logging and a set of built-in
//! collaborators wired to the session engine.
//!
//! The built-ins are deliberately small: a null reverse-DNS resolver, an
//! accept-all filter, a flat-directory queue and a deny-all credential
//! checker. Each runs as its own task behind the same typed channels a real
//! subsystem would use, so swapping one out is a wiring change, not an
//! engine change.

use std::path::PathBuf;

use ahash::AHashMap;
use anyhow::Context as _;
use smtpd_common::{config::ServerConfig, envelope::evpid_to_msgid, internal, logging, tracing, Signal};
use smtpd_smtp::{
    peer::{
        AuthReply, AuthRequest, DnsReply, DnsRequest, MfaReply, MfaRequest, PeerReplies, Peers,
        QueueReply, QueueRequest, Verdict,
    },
    SmtpIn,
};
use tokio::sync::{broadcast, mpsc};

/// A null PTR resolver: every peer stays `<unknown>`.
async fn serve_dns(mut requests: mpsc::Receiver<DnsRequest>, replies: mpsc::Sender<DnsReply>) {
    while let Some(DnsRequest::Ptr { reqid, peer }) = requests.recv().await {
        tracing::debug!(target: "smtpd", "dns: no resolver for {peer}, answering unknown");
        if replies.send(DnsReply::Ptr { reqid, host: None }).await.is_err() {
            break;
        }
    }
}

/// An accept-all filter that passes DATA lines through untouched.
async fn serve_mfa(mut requests: mpsc::Receiver<MfaRequest>, replies: mpsc::Sender<MfaReply>) {
    while let Some(request) = requests.recv().await {
        let reply = match request {
            MfaRequest::Connect { reqid, .. } => Some(MfaReply::Connect {
                reqid,
                verdict: Verdict::ok(),
            }),
            MfaRequest::Helo { reqid, .. } => Some(MfaReply::Helo {
                reqid,
                verdict: Verdict::ok(),
            }),
            MfaRequest::Mail { reqid, .. } => Some(MfaReply::Mail {
                reqid,
                verdict: Verdict::ok(),
            }),
            MfaRequest::Rcpt { reqid, .. } => Some(MfaReply::Rcpt {
                reqid,
                verdict: Verdict::ok(),
            }),
            MfaRequest::Rset { .. } => None,
            MfaRequest::DataLine { reqid, line } => Some(MfaReply::DataLine { reqid, line }),
        };

        if let Some(reply) = reply {
            if replies.send(reply).await.is_err() {
                break;
            }
        }
    }
}

/// A deny-all credential checker.
async fn serve_auth(mut requests: mpsc::Receiver<AuthRequest>, replies: mpsc::Sender<AuthReply>) {
    while let Some(request) = requests.recv().await {
        internal!(
            level = INFO,
            "auth: no credential backend, refusing user {}",
            request.user
        );
        let reply = AuthReply {
            reqid: request.reqid,
            success: false,
        };
        if replies.send(reply).await.is_err() {
            break;
        }
    }
}

/// A flat-directory queue: one spool file per message, renamed into place
/// on commit.
struct FsQueue {
    dir: PathBuf,
    files: AHashMap<u32, PathBuf>,
    next_msgid: u32,
}

impl FsQueue {
    fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            files: AHashMap::new(),
            next_msgid: 1,
        }
    }

    fn create_message(&mut self) -> Option<u64> {
        let msgid = self.next_msgid;
        self.next_msgid = self.next_msgid.wrapping_add(1).max(1);

        let path = self.dir.join(format!("{msgid:08x}.tmp"));
        self.files.insert(msgid, path);
        Some((u64::from(msgid) << 32) | 1)
    }

    fn message_file(&mut self, evpid: u64) -> Option<std::fs::File> {
        let path = self.files.get(&evpid_to_msgid(evpid))?;
        std::fs::File::create(path).ok()
    }

    fn commit_message(&mut self, evpid: u64) -> bool {
        let msgid = evpid_to_msgid(evpid);
        let Some(path) = self.files.remove(&msgid) else {
            return false;
        };
        std::fs::rename(path, self.dir.join(format!("{msgid:08x}"))).is_ok()
    }

    fn remove_message(&mut self, msgid: u32) {
        if let Some(path) = self.files.remove(&msgid) {
            let _ = std::fs::remove_file(path);
        }
    }
}

async fn serve_queue(
    dir: PathBuf,
    mut requests: mpsc::Receiver<QueueRequest>,
    replies: mpsc::Sender<QueueReply>,
) -> anyhow::Result<()> {
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("creating spool directory {}", dir.display()))?;
    let mut queue = FsQueue::new(dir);

    while let Some(request) = requests.recv().await {
        let reply = match request {
            QueueRequest::CreateMessage { reqid } => Some(QueueReply::CreateMessage {
                reqid,
                evpid: queue.create_message(),
            }),
            QueueRequest::MessageFile { reqid, evpid } => Some(QueueReply::MessageFile {
                reqid,
                file: queue.message_file(evpid),
            }),
            QueueRequest::CommitMessage { reqid, evpid } => Some(QueueReply::CommitMessage {
                reqid,
                ok: queue.commit_message(evpid),
            }),
            QueueRequest::RemoveMessage { msgid } => {
                queue.remove_message(msgid);
                None
            }
        };

        if let Some(reply) = reply {
            if replies.send(reply).await.is_err() {
                break;
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "./smtpd.toml".to_string());
    let config = ServerConfig::from_file(&config_path)
        .with_context(|| format!("loading {config_path}"))?;

    let spool_dir =
        PathBuf::from(std::env::var("SMTPD_SPOOL").unwrap_or_else(|_| "./spool".to_string()));

    let (dns_tx, dns_rx) = mpsc::channel(128);
    let (mfa_tx, mfa_rx) = mpsc::channel(128);
    let (queue_tx, queue_rx) = mpsc::channel(128);
    let (auth_tx, auth_rx) = mpsc::channel(128);
    let (dns_reply_tx, dns_reply_rx) = mpsc::channel(128);
    let (mfa_reply_tx, mfa_reply_rx) = mpsc::channel(128);
    let (queue_reply_tx, queue_reply_rx) = mpsc::channel(128);
    let (auth_reply_tx, auth_reply_rx) = mpsc::channel(128);

    tokio::spawn(serve_dns(dns_rx, dns_reply_tx));
    tokio::spawn(serve_mfa(mfa_rx, mfa_reply_tx));
    tokio::spawn(serve_auth(auth_rx, auth_reply_tx));
    tokio::spawn(serve_queue(spool_dir, queue_rx, queue_reply_tx));

    let engine = SmtpIn::new(
        &config,
        Peers {
            dns: dns_tx,
            mfa: mfa_tx,
            queue: queue_tx,
            auth: auth_tx,
        },
        PeerReplies {
            dns: dns_reply_rx,
            mfa: mfa_reply_rx,
            queue: queue_reply_rx,
            auth: auth_reply_rx,
        },
    )?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(8);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            internal!(level = INFO, "shutdown requested");
            let _ = shutdown_tx.send(Signal::Shutdown);
        }
    });

    engine.serve(shutdown_rx).await
}
