//! Session state and phase.

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

/// Fine-grained protocol state of a session.
///
/// The `Auth*` states carry the SASL sub-protocol: `AuthInit` waits for a
/// PLAIN continuation blob, `AuthUsername`/`AuthPassword` for the LOGIN
/// prompts, and `AuthFinalize` for the credential-check verdict.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    #[default]
    New,
    Connected,
    Tls,
    Helo,
    AuthInit,
    AuthUsername,
    AuthPassword,
    AuthFinalize,
    Body,
    Quit,
}

impl Display for State {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Coarse lifecycle, orthogonal to [`State`]: greeting not yet accepted
/// (`Init`), greeted but no open message (`Setup`), message open
/// (`Transaction`).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Init,
    Setup,
    Transaction,
}

impl Display for Phase {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}
