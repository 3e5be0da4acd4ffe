//! Envelope mail addresses.
//!
//! An envelope address is the restricted `local@domain` form used on the
//! SMTP `MAIL FROM`/`RCPT TO` path, not an RFC 5322 display address. The
//! empty address stands for the null sender `<>`.

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest accepted local part, in bytes.
pub const MAX_LOCALPART_SIZE: usize = 64;
/// Longest accepted domain part, in bytes.
pub const MAX_DOMAINPART_SIZE: usize = 255;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MailaddrError {
    #[error("address is not enclosed in angle brackets")]
    NotAPath,

    #[error("malformed address")]
    Malformed,

    #[error("invalid local part")]
    InvalidLocalPart,

    #[error("invalid domain part")]
    InvalidDomainPart,
}

/// A `(user, domain)` envelope address. Both parts empty denotes the null
/// sender `<>`.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mailaddr {
    user: String,
    domain: String,
}

impl Mailaddr {
    /// The null sender `<>`.
    #[must_use]
    pub fn null() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        self.user.is_empty() && self.domain.is_empty()
    }

    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }
}

impl Display for Mailaddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            Ok(())
        } else {
            write!(f, "{}@{}", self.user, self.domain)
        }
    }
}

/// Parse the address portion of a `MAIL FROM`/`RCPT TO` argument.
///
/// Accepts exactly `<local@domain>` or `<>`; the angle brackets are
/// mandatory. The inner text is handed to [`email_to_mailaddr`].
///
/// # Errors
///
/// Returns a [`MailaddrError`] when the brackets are missing or the inner
/// address does not validate.
pub fn parse_path(text: &str) -> Result<Mailaddr, MailaddrError> {
    let inner = text
        .strip_prefix('<')
        .and_then(|t| t.strip_suffix('>'))
        .ok_or(MailaddrError::NotAPath)?;

    email_to_mailaddr(inner)
}

/// Validate and split a bare `local@domain` address.
///
/// The empty string maps to the null sender. Both halves are lower-cased.
///
/// # Errors
///
/// Returns a [`MailaddrError`] when either half is missing, oversized or
/// contains characters outside the envelope-address alphabet.
pub fn email_to_mailaddr(text: &str) -> Result<Mailaddr, MailaddrError> {
    if text.is_empty() {
        return Ok(Mailaddr::null());
    }

    let at = text.rfind('@').ok_or(MailaddrError::Malformed)?;
    let (user, domain) = (&text[..at], &text[at + 1..]);

    if user.is_empty() || user.len() > MAX_LOCALPART_SIZE || !valid_localpart(user) {
        return Err(MailaddrError::InvalidLocalPart);
    }
    if domain.is_empty() || domain.len() > MAX_DOMAINPART_SIZE || !valid_domainpart(domain) {
        return Err(MailaddrError::InvalidDomainPart);
    }

    Ok(Mailaddr {
        user: user.to_ascii_lowercase(),
        domain: domain.to_ascii_lowercase(),
    })
}

/// Check a local part against the RFC 5321 atom alphabet (dots allowed as
/// separators).
#[must_use]
pub fn valid_localpart(s: &str) -> bool {
    const ATEXT: &[u8] = b"!#$%&'*+-/=?^_`{|}~";

    !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'.' || ATEXT.contains(&b))
}

/// Check a domain part: dot-separated labels or an address literal.
#[must_use]
pub fn valid_domainpart(s: &str) -> bool {
    if let Some(inner) = s.strip_prefix('[') {
        return matches!(inner.strip_suffix(']'), Some(lit) if !lit.is_empty());
    }

    if s.is_empty() || s.len() > MAX_DOMAINPART_SIZE {
        return false;
    }

    s.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
    })
}
