//! Logging setup and the session transcript.
//!
//! Wire traffic is traced through [`incoming!`](crate::incoming) and
//! [`outgoing!`](crate::outgoing), which tag each event with its direction
//! under the `smtpd::transcript` target so one session's dialogue can be
//! followed verbatim; [`internal!`](crate::internal) carries everything the
//! engine does on its own behalf. The subscriber level comes from
//! `SMTPD_LOG` (`error`, `warn`, `info`, `debug`, `trace`).

use std::fmt::Write as _;

use chrono::Utc;
use tracing::metadata::LevelFilter;
use tracing_subscriber::fmt::time::FormatTime;

/// UTC wall-clock timestamps, millisecond precision.
struct Stamp;

impl FormatTime for Stamp {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"))
    }
}

/// A line received from the client.
#[macro_export]
macro_rules! incoming {
    ($($arg:tt)*) => {
        $crate::tracing::trace!(target: "smtpd::transcript", dir = "<<<", $($arg)*)
    };
}

/// A line sent to the client.
#[macro_export]
macro_rules! outgoing {
    ($($arg:tt)*) => {
        $crate::tracing::trace!(target: "smtpd::transcript", dir = ">>>", $($arg)*)
    };
}

/// An engine event that is not wire traffic.
#[macro_export]
macro_rules! internal {
    (level = $level:ident, $($arg:tt)*) => {
        $crate::tracing::event!(target: "smtpd", $crate::tracing::Level::$level, $($arg)*)
    };

    ($($arg:tt)*) => {
        $crate::internal!(level = TRACE, $($arg)*)
    };
}

/// Render a client-supplied string with control characters escaped, for the
/// transcript log.
#[must_use]
pub fn visible(s: &str) -> String {
    s.chars().flat_map(char::escape_default).collect()
}

const fn default_level() -> LevelFilter {
    if cfg!(debug_assertions) {
        LevelFilter::TRACE
    } else {
        LevelFilter::INFO
    }
}

fn parse_level(value: &str) -> LevelFilter {
    match value.to_ascii_lowercase().as_str() {
        "error" => LevelFilter::ERROR,
        "warn" => LevelFilter::WARN,
        "info" => LevelFilter::INFO,
        "debug" => LevelFilter::DEBUG,
        "trace" => LevelFilter::TRACE,
        _ => default_level(),
    }
}

pub fn init() {
    let level = std::env::var("SMTPD_LOG")
        .map_or_else(|_| default_level(), |value| parse_level(&value));

    tracing_subscriber::fmt()
        .compact()
        .with_timer(Stamp)
        .with_target(true)
        .with_max_level(level)
        .init();
}
