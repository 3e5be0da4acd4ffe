//! Collaborator channels.
//!
//! The engine talks to four external subsystems over typed request/reply
//! channels: the reverse-DNS resolver, the mail-filter subsystem, the queue
//! and the credential checker. Requests carry the session id; router tasks
//! consume the reply channels and hand each reply to the session parked
//! under that id in the matching [`Registries`](crate::registry::Registries)
//! waitlist. A reply for an id that is parked nowhere is dropped: the
//! session is already gone, which is not an error.

use std::net::SocketAddr;
use std::sync::Arc;

use smtpd_common::{envelope::Envelope, mailaddr::Mailaddr, tracing};
use tokio::sync::mpsc;

use crate::registry::Registries;

#[derive(Debug, Clone)]
pub enum DnsRequest {
    Ptr { reqid: u64, peer: SocketAddr },
}

#[derive(Debug, Clone)]
pub enum DnsReply {
    Ptr { reqid: u64, host: Option<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MfaStatus {
    Ok,
    Reject,
}

/// A filter verdict. An accepting MAIL verdict may rewrite the sender
/// through `mailaddr`; a rejecting verdict carries the SMTP code to reply
/// with.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub status: MfaStatus,
    pub code: Option<u16>,
    pub mailaddr: Option<Mailaddr>,
}

impl Verdict {
    #[must_use]
    pub fn ok() -> Self {
        Self {
            status: MfaStatus::Ok,
            code: None,
            mailaddr: None,
        }
    }

    #[must_use]
    pub fn reject(code: u16) -> Self {
        Self {
            status: MfaStatus::Reject,
            code: Some(code),
            mailaddr: None,
        }
    }

    #[must_use]
    pub fn is_reject(&self) -> bool {
        self.status == MfaStatus::Reject
    }

    /// The reply code, defaulting per rejection kind.
    #[must_use]
    pub fn code(&self, fallback: u16) -> u16 {
        self.code.unwrap_or(fallback)
    }
}

#[derive(Debug, Clone)]
pub enum MfaRequest {
    Connect { reqid: u64, evp: Envelope },
    Helo { reqid: u64, evp: Envelope },
    Mail { reqid: u64, evp: Envelope },
    Rcpt { reqid: u64, evp: Envelope },
    Rset { reqid: u64, evp: Envelope },
    DataLine { reqid: u64, line: Vec<u8> },
}

#[derive(Debug, Clone)]
pub enum MfaReply {
    Connect { reqid: u64, verdict: Verdict },
    Helo { reqid: u64, verdict: Verdict },
    Mail { reqid: u64, verdict: Verdict },
    Rcpt { reqid: u64, verdict: Verdict },
    DataLine { reqid: u64, line: Vec<u8> },
}

#[derive(Debug)]
pub enum QueueRequest {
    CreateMessage { reqid: u64 },
    MessageFile { reqid: u64, evpid: u64 },
    CommitMessage { reqid: u64, evpid: u64 },
    /// Best-effort; no reply is expected.
    RemoveMessage { msgid: u32 },
}

#[derive(Debug)]
pub enum QueueReply {
    CreateMessage { reqid: u64, evpid: Option<u64> },
    MessageFile { reqid: u64, file: Option<std::fs::File> },
    /// Intermediate: one per expanded recipient.
    SubmitEnvelope { reqid: u64, ok: bool },
    /// Final for the pending RCPT.
    CommitEnvelopes { reqid: u64, ok: bool },
    CommitMessage { reqid: u64, ok: bool },
}

#[derive(Debug)]
pub struct AuthRequest {
    pub reqid: u64,
    pub user: String,
    pub pass: String,
}

#[derive(Debug, Clone, Copy)]
pub struct AuthReply {
    pub reqid: u64,
    pub success: bool,
}

/// A collaborator reply delivered into a parked session's mailbox.
#[derive(Debug)]
pub enum Answer {
    Dns(DnsReply),
    Mfa(MfaReply),
    Queue(QueueReply),
    Auth(AuthReply),
}

/// Request senders towards the collaborators, cloned into every session.
#[derive(Debug, Clone)]
pub struct Peers {
    pub dns: mpsc::Sender<DnsRequest>,
    pub mfa: mpsc::Sender<MfaRequest>,
    pub queue: mpsc::Sender<QueueRequest>,
    pub auth: mpsc::Sender<AuthRequest>,
}

/// Reply receivers from the collaborators, consumed by the router tasks.
#[derive(Debug)]
pub struct PeerReplies {
    pub dns: mpsc::Receiver<DnsReply>,
    pub mfa: mpsc::Receiver<MfaReply>,
    pub queue: mpsc::Receiver<QueueReply>,
    pub auth: mpsc::Receiver<AuthReply>,
}

async fn deliver(slot: Option<mpsc::Sender<Answer>>, reqid: u64, answer: Answer) {
    match slot {
        Some(tx) => {
            // The session may vanish between lookup and send.
            let _ = tx.send(answer).await;
        }
        None => {
            tracing::trace!(target: "smtpd", "dropping reply for dead session {reqid:016x}");
        }
    }
}

/// Spawn the four router tasks. Must run inside a tokio runtime.
pub fn spawn_routers(registries: Arc<Registries>, replies: PeerReplies) {
    let PeerReplies {
        mut dns,
        mut mfa,
        mut queue,
        mut auth,
    } = replies;

    let reg = Arc::clone(&registries);
    tokio::spawn(async move {
        while let Some(reply) = dns.recv().await {
            let DnsReply::Ptr { reqid, .. } = reply;
            deliver(reg.dns_ptr.pop(reqid), reqid, Answer::Dns(reply)).await;
        }
    });

    let reg = Arc::clone(&registries);
    tokio::spawn(async move {
        while let Some(reply) = mfa.recv().await {
            let (slot, reqid) = match &reply {
                MfaReply::Connect { reqid, .. } => (reg.mfa_connect.pop(*reqid), *reqid),
                MfaReply::Helo { reqid, .. } => (reg.mfa_helo.pop(*reqid), *reqid),
                MfaReply::Mail { reqid, .. } => (reg.mfa_mailfrom.pop(*reqid), *reqid),
                MfaReply::Rcpt { reqid, .. } => (reg.mfa_rcpt.pop(*reqid), *reqid),
                // The DATA-line stream keeps the session parked until the
                // "." sentinel drains it.
                MfaReply::DataLine { reqid, line } if line == b"." => {
                    (reg.mfa_data.pop(*reqid), *reqid)
                }
                MfaReply::DataLine { reqid, .. } => (reg.mfa_data.get(*reqid), *reqid),
            };
            deliver(slot, reqid, Answer::Mfa(reply)).await;
        }
    });

    let reg = Arc::clone(&registries);
    tokio::spawn(async move {
        while let Some(reply) = queue.recv().await {
            let (slot, reqid) = match &reply {
                QueueReply::CreateMessage { reqid, .. } => (reg.queue_msg.pop(*reqid), *reqid),
                QueueReply::MessageFile { reqid, .. } => (reg.queue_fd.pop(*reqid), *reqid),
                // Recipient expansion holds the RCPT in `mfa_rcpt`; only
                // the final CommitEnvelopes releases it.
                QueueReply::SubmitEnvelope { reqid, .. } => (reg.mfa_rcpt.get(*reqid), *reqid),
                QueueReply::CommitEnvelopes { reqid, .. } => (reg.mfa_rcpt.pop(*reqid), *reqid),
                QueueReply::CommitMessage { reqid, .. } => (reg.queue_commit.pop(*reqid), *reqid),
            };
            deliver(slot, reqid, Answer::Queue(reply)).await;
        }
    });

    let reg = registries;
    tokio::spawn(async move {
        while let Some(reply) = auth.recv().await {
            deliver(reg.parent_auth.pop(reply.reqid), reply.reqid, Answer::Auth(reply)).await;
        }
    });
}
