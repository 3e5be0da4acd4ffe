//! Correlation registries.
//!
//! A session making an asynchronous call to a collaborator parks the sending
//! half of its answer mailbox here, keyed by request id, and suspends until
//! the reply is routed back. One registry per call class; a session is
//! present in at most one of them at any instant (the DATA-line stream being
//! the documented exception, where the entry persists across the whole
//! body). Replies whose id is found in no registry belong to sessions that
//! are already gone and are dropped.

use std::sync::Mutex;

use ahash::AHashMap;
use tokio::sync::mpsc;

use crate::peer::Answer;

/// One request-id-keyed waitlist.
#[derive(Debug)]
pub struct Waitlist {
    name: &'static str,
    inner: Mutex<AHashMap<u64, mpsc::Sender<Answer>>>,
}

impl Waitlist {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Mutex::new(AHashMap::new()),
        }
    }

    /// Park a session. A duplicate id is a protocol bug.
    ///
    /// # Panics
    ///
    /// Panics if the id is already parked here.
    pub fn insert(&self, id: u64, tx: mpsc::Sender<Answer>) {
        let prev = self
            .inner
            .lock()
            .expect("waitlist lock poisoned")
            .insert(id, tx);
        assert!(prev.is_none(), "{}: duplicate wait id {:016x}", self.name, id);
    }

    /// Remove and return the parked sender, if any.
    pub fn pop(&self, id: u64) -> Option<mpsc::Sender<Answer>> {
        self.inner.lock().expect("waitlist lock poisoned").remove(&id)
    }

    /// Return the parked sender without removing it.
    pub fn get(&self, id: u64) -> Option<mpsc::Sender<Answer>> {
        self.inner
            .lock()
            .expect("waitlist lock poisoned")
            .get(&id)
            .cloned()
    }

    /// Drop the entry for `id`, if any.
    pub fn remove(&self, id: u64) {
        self.inner.lock().expect("waitlist lock poisoned").remove(&id);
    }

    pub fn contains(&self, id: u64) -> bool {
        self.inner
            .lock()
            .expect("waitlist lock poisoned")
            .contains_key(&id)
    }
}

/// The ten waitlists, one per asynchronous call class.
#[derive(Debug)]
pub struct Registries {
    pub dns_ptr: Waitlist,
    pub mfa_connect: Waitlist,
    pub mfa_helo: Waitlist,
    pub mfa_mailfrom: Waitlist,
    pub mfa_rcpt: Waitlist,
    pub mfa_data: Waitlist,
    pub parent_auth: Waitlist,
    pub queue_msg: Waitlist,
    pub queue_fd: Waitlist,
    pub queue_commit: Waitlist,
}

impl Registries {
    #[must_use]
    pub fn new() -> Self {
        Self {
            dns_ptr: Waitlist::new("dns_ptr"),
            mfa_connect: Waitlist::new("mfa_connect"),
            mfa_helo: Waitlist::new("mfa_helo"),
            mfa_mailfrom: Waitlist::new("mfa_mailfrom"),
            mfa_rcpt: Waitlist::new("mfa_rcpt"),
            mfa_data: Waitlist::new("mfa_data"),
            parent_auth: Waitlist::new("parent_auth"),
            queue_msg: Waitlist::new("queue_msg"),
            queue_fd: Waitlist::new("queue_fd"),
            queue_commit: Waitlist::new("queue_commit"),
        }
    }

    fn all(&self) -> [&Waitlist; 10] {
        [
            &self.dns_ptr,
            &self.mfa_connect,
            &self.mfa_helo,
            &self.mfa_mailfrom,
            &self.mfa_rcpt,
            &self.mfa_data,
            &self.parent_auth,
            &self.queue_msg,
            &self.queue_fd,
            &self.queue_commit,
        ]
    }

    /// Remove a session from every waitlist (teardown).
    pub fn purge(&self, id: u64) {
        for list in self.all() {
            list.remove(id);
        }
    }

    /// How many waitlists hold `id` right now.
    #[must_use]
    pub fn holding(&self, id: u64) -> usize {
        self.all().iter().filter(|list| list.contains(id)).count()
    }
}

impl Default for Registries {
    fn default() -> Self {
        Self::new()
    }
}
