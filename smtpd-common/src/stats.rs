//! Process-wide counters.
//!
//! Plain atomics on the hot path; an exporter can sample [`Stats::snapshot`]
//! at whatever cadence it likes.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

static STATS: Stats = Stats::new();

/// The process-wide counter set.
#[must_use]
pub fn stats() -> &'static Stats {
    &STATS
}

#[derive(Debug)]
pub struct Stats {
    /// `smtp.session` — sessions accepted over the process lifetime.
    sessions: AtomicU64,
    /// Currently open sessions.
    sessions_active: AtomicI64,
    /// `smtp.tls` — sessions currently secured via STARTTLS.
    tls: AtomicI64,
    /// `smtp.smtps` — sessions currently secured via implicit TLS.
    smtps: AtomicI64,
    /// `smtp.kick` — sessions torn down for not moving forward.
    kick: AtomicU64,
    /// `smtp.tempfail` — message bodies dropped on a temporary failure.
    tempfail: AtomicU64,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub sessions: u64,
    pub sessions_active: i64,
    pub tls: i64,
    pub smtps: i64,
    pub kick: u64,
    pub tempfail: u64,
}

impl Stats {
    const fn new() -> Self {
        Self {
            sessions: AtomicU64::new(0),
            sessions_active: AtomicI64::new(0),
            tls: AtomicI64::new(0),
            smtps: AtomicI64::new(0),
            kick: AtomicU64::new(0),
            tempfail: AtomicU64::new(0),
        }
    }

    pub fn session_opened(&self) {
        self.sessions.fetch_add(1, Ordering::Relaxed);
        self.sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        self.sessions_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn tls_started(&self, smtps: bool) {
        if smtps {
            self.smtps.fetch_add(1, Ordering::Relaxed);
        } else {
            self.tls.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn tls_closed(&self, smtps: bool) {
        if smtps {
            self.smtps.fetch_sub(1, Ordering::Relaxed);
        } else {
            self.tls.fetch_sub(1, Ordering::Relaxed);
        }
    }

    pub fn kicked(&self) {
        self.kick.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tempfailed(&self) {
        self.tempfail.fetch_add(1, Ordering::Relaxed);
    }

    pub fn kicks(&self) -> u64 {
        self.kick.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            sessions: self.sessions.load(Ordering::Relaxed),
            sessions_active: self.sessions_active.load(Ordering::Relaxed),
            tls: self.tls.load(Ordering::Relaxed),
            smtps: self.smtps.load(Ordering::Relaxed),
            kick: self.kick.load(Ordering::Relaxed),
            tempfail: self.tempfail.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_move() {
        let stats = Stats::new();

        stats.session_opened();
        stats.session_opened();
        stats.session_closed();
        stats.tls_started(false);
        stats.tls_started(true);
        stats.tls_closed(true);
        stats.kicked();
        stats.tempfailed();

        let snap = stats.snapshot();
        assert_eq!(snap.sessions, 2);
        assert_eq!(snap.sessions_active, 1);
        assert_eq!(snap.tls, 1);
        assert_eq!(snap.smtps, 0);
        assert_eq!(snap.kick, 1);
        assert_eq!(snap.tempfail, 1);
    }
}
