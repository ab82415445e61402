//! Line framing for the child handshake stream.
//!
//! Every status line a plugin prints is `"<prefix>: <key>: <value>"`. The
//! prefix is chosen by the host and handed to the child via
//! `-pingo:prefix=...`, so a supervisor only ever interprets output that was
//! produced for it. Anything else on stdout/stderr is passed through to the
//! log sink untouched.

use std::fmt;

use rand::Rng;

const ALPHABET: &[u8; 64] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789_-";

/// Returns a random identifier of `n` characters over `[a-zA-Z0-9_-]`.
///
/// Used for instance prefixes, unix socket names and auth tokens. Not
/// cryptographic; tokens get their strength from length (64 chars) and the
/// short registration window.
pub fn randstr(n: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..n)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// The per-instance line prefix shared between a supervisor and its child.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Prefix(String);

impl Prefix {
    /// Wraps an explicit prefix string (child side, from argv).
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Generates a fresh instance prefix for a new handle.
    pub(crate) fn generate() -> Self {
        Self(format!("pingo{}", randstr(5)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Renders a status line without the trailing newline.
    pub fn format(&self, key: &str, val: &str) -> String {
        format!("{}: {}: {}", self.0, key, val)
    }

    /// Emits a status line on stdout (child side).
    pub fn output(&self, key: &str, val: &str) {
        println!("{}", self.format(key, val));
    }

    /// Splits a prefixed line into key and value.
    ///
    /// Returns `None` when the line does not start with `<prefix>: ` or has
    /// no `": "` separator after the key; such lines are not protocol
    /// messages.
    pub fn parse<'a>(&self, line: &'a str) -> Option<(&'a str, &'a str)> {
        line.strip_prefix(self.0.as_str())?
            .strip_prefix(": ")?
            .split_once(": ")
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_and_parse_roundtrip() {
        let p = Prefix::new("pingoAb1_z");
        let line = p.format("ready", "proto=unix addr=/tmp/x");

        assert_eq!(line, "pingoAb1_z: ready: proto=unix addr=/tmp/x");
        assert_eq!(p.parse(&line), Some(("ready", "proto=unix addr=/tmp/x")));
    }

    #[test]
    fn value_may_contain_separator() {
        let p = Prefix::new("pfx");
        assert_eq!(
            p.parse("pfx: fatal: err-http-serve: accept failed"),
            Some(("fatal", "err-http-serve: accept failed"))
        );
    }

    #[test]
    fn foreign_lines_are_not_protocol() {
        let p = Prefix::new("pfx");

        assert_eq!(p.parse("some log output"), None);
        assert_eq!(p.parse("other: ready: proto=unix addr=/x"), None);
        assert_eq!(p.parse("pfx"), None);
        assert_eq!(p.parse("pfx: "), None);
        assert_eq!(p.parse("pfx: no-separator"), None);
    }

    #[test]
    fn generated_prefix_shape() {
        let p = Prefix::generate();
        assert!(p.as_str().starts_with("pingo"));
        assert_eq!(p.as_str().len(), "pingo".len() + 5);
    }

    #[test]
    fn randstr_length_and_alphabet() {
        let s = randstr(64);
        assert_eq!(s.len(), 64);
        assert!(s
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-'));
    }
}
