//! Command-line tokenization.
//!
//! Splits one wire line into a verb and its argument. Unlike the other
//! commands, `MAIL FROM` and `RCPT TO` contain a space in the verb itself
//! and split at the first `:` instead.

use phf::phf_map;

/// A recognized command verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Helo,
    Ehlo,
    StartTls,
    Auth,
    MailFrom,
    RcptTo,
    Data,
    Rset,
    Quit,
    Help,
    Noop,
}

static VERBS: phf::Map<&'static str, Verb> = phf_map! {
    "HELO" => Verb::Helo,
    "EHLO" => Verb::Ehlo,
    "STARTTLS" => Verb::StartTls,
    "AUTH" => Verb::Auth,
    "MAIL FROM" => Verb::MailFrom,
    "RCPT TO" => Verb::RcptTo,
    "DATA" => Verb::Data,
    "RSET" => Verb::Rset,
    "QUIT" => Verb::Quit,
    "HELP" => Verb::Help,
    "NOOP" => Verb::Noop,
};

/// A tokenized command line. `verb` is `None` for unrecognized verbs; `arg`
/// is the left-trimmed remainder, `None` when the line had no separator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command<'a> {
    pub verb: Option<Verb>,
    pub arg: Option<&'a str>,
}

fn starts_with_ignore_case(line: &str, prefix: &str) -> bool {
    line.len() >= prefix.len() && line.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}

/// Longest verb is `MAIL FROM` at 9 bytes.
fn lookup(verb: &str) -> Option<Verb> {
    let bytes = verb.as_bytes();
    if bytes.is_empty() || bytes.len() > 9 {
        return None;
    }

    let mut buf = [0u8; 9];
    for (i, b) in bytes.iter().enumerate() {
        buf[i] = b.to_ascii_uppercase();
    }

    // SAFETY: ASCII uppercasing never invalidates UTF-8.
    let upper = unsafe { std::str::from_utf8_unchecked(&buf[..bytes.len()]) };
    VERBS.get(upper).copied()
}

/// Tokenize one command line.
#[must_use]
pub fn parse(line: &str) -> Command<'_> {
    let split_at = if starts_with_ignore_case(line, "mail from:")
        || starts_with_ignore_case(line, "rcpt to:")
    {
        line.find(':')
    } else {
        line.find(' ')
    };

    match split_at {
        Some(at) => Command {
            verb: lookup(&line[..at]),
            arg: Some(line[at + 1..].trim_start()),
        },
        None => Command {
            verb: lookup(line),
            arg: None,
        },
    }
}

/// Peel trailing whitespace-separated ESMTP parameters off a `MAIL FROM`
/// argument, right to left, leaving the address. The returned parameters
/// are in peel order (rightmost first).
#[must_use]
pub fn split_esmtp_params(arg: &str) -> (&str, Vec<&str>) {
    let mut rest = arg.trim_end();
    let mut params = Vec::new();

    while let Some(pos) = rest.rfind(' ') {
        let param = rest[pos + 1..].trim();
        if !param.is_empty() {
            params.push(param);
        }
        rest = rest[..pos].trim_end();
    }

    (rest, params)
}
