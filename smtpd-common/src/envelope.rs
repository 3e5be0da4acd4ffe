//! The per-message-attempt envelope.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::mailaddr::Mailaddr;

/// Extract the message id from an envelope id.
#[must_use]
pub const fn evpid_to_msgid(evpid: u64) -> u32 {
    (evpid >> 32) as u32
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeFlags {
    /// The message was enqueued locally and bounces stay local.
    pub bounce: bool,
}

/// Sender, current recipient and metadata for one message attempt, distinct
/// from the message body. The queue assigns `id` when the message is
/// created; a zero id means no message is open.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub tag: String,
    pub session_id: u64,
    pub id: u64,
    pub peer: Option<SocketAddr>,
    pub hostname: String,
    pub helo: String,
    pub sender: Mailaddr,
    pub rcpt: Mailaddr,
    pub flags: EnvelopeFlags,
}

impl Envelope {
    /// The message id of the open message, or zero.
    #[must_use]
    pub const fn msgid(&self) -> u32 {
        evpid_to_msgid(self.id)
    }
}
