//! Old-style protocol messages: `CODE SIZE ARGS\n`.
//!
//! `ARGS` is the space-joined list of `len|value` items, where `len` is the
//! byte length of `value`; `SIZE` is the byte length of `ARGS`. Values are
//! opaque and may contain spaces, pipes or newlines.

use std::fmt;

use crate::ProtoError;

/// Message codes understood by the maestro.
pub mod code {
    // Maestro <-> daemon
    pub const INI: &str = "INI";
    pub const RET: &str = "RET";
    pub const ERR: &str = "ERR";
    pub const RUN: &str = "RUN";
    pub const KIL: &str = "KIL";
    pub const CLR: &str = "CLR";
    pub const QUT: &str = "QUT";
    pub const TSK: &str = "TSK";
    pub const STA: &str = "STA";
    pub const OUT: &str = "OUT";

    // Maestro <-> client
    pub const CLIENT_INI: &str = "ini";
    pub const CLIENT_RET: &str = "ret";
    pub const CLIENT_ERR: &str = "err";
    pub const JOB_DEF: &str = "job_def";
    pub const JOB_STATUS: &str = "sta";
    pub const JOB_OUTPUT: &str = "out";
    pub const JOB_CMD: &str = "cmd";
    pub const JOB_ISSUES: &str = "iss";
    pub const SERVER_STATUS: &str = "ssta";
    pub const SERVER_TAGS: &str = "agrp";
    pub const AUTOCONNECT: &str = "ac";
    pub const SERVER_REMOVED: &str = "srm";
    pub const MPI: &str = "mpi";
    pub const QUESTION: &str = "qst";
    pub const PASSWORD: &str = "pss";
    pub const CONFIRM: &str = "cfm";

    /// Every code accepted on the wire.
    pub const ALL: &[&str] = &[
        INI, RET, ERR, RUN, KIL, CLR, QUT, TSK, STA, OUT, CLIENT_INI, CLIENT_RET, CLIENT_ERR,
        JOB_DEF, JOB_STATUS, JOB_OUTPUT, JOB_CMD, JOB_ISSUES, SERVER_STATUS, SERVER_TAGS,
        AUTOCONNECT, SERVER_REMOVED, MPI, QUESTION, PASSWORD, CONFIRM,
    ];

    pub fn is_known(code: &str) -> bool {
        ALL.contains(&code)
    }
}

/// One old-style message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub code: String,
    pub args: Vec<String>,
}

impl Message {
    /// Create a message from any list of string-like arguments.
    pub fn new<I, S>(code: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            code: code.to_string(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Arguments, checking there are exactly `expected` of them.
    pub fn expect_args(&self, expected: usize) -> Result<&[String], ProtoError> {
        if self.args.len() != expected {
            return Err(ProtoError::ArgumentCount {
                code: self.code.clone(),
                expected,
                got: self.args.len(),
            });
        }
        Ok(&self.args)
    }

    /// Arguments, checking there are at least `min` of them.
    pub fn expect_min_args(&self, min: usize) -> Result<&[String], ProtoError> {
        if self.args.len() < min {
            return Err(ProtoError::ArgumentCount {
                code: self.code.clone(),
                expected: min,
                got: self.args.len(),
            });
        }
        Ok(&self.args)
    }

    /// Serialize to the wire form, trailing newline included.
    pub fn encode(&self) -> String {
        let args = encode_args(&self.args);
        format!("{} {} {}\n", self.code, args.len(), args)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({} args)", self.code, self.args.len())
    }
}

/// Join arguments as `len|value len|value ...`.
pub fn encode_args<S: AsRef<str>>(args: &[S]) -> String {
    args.iter()
        .map(|a| {
            let a = a.as_ref();
            format!("{}|{}", a.len(), a)
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Split an argument block produced by [`encode_args`].
pub fn split_args(raw: &[u8]) -> Result<Vec<String>, ProtoError> {
    let mut args = Vec::new();
    let mut rest = raw;

    while !rest.is_empty() {
        let bar = rest
            .iter()
            .position(|&b| b == b'|')
            .ok_or_else(|| malformed(rest, "missing '|'"))?;
        let len: usize = std::str::from_utf8(&rest[..bar])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| malformed(rest, "bad length"))?;

        let value_start = bar + 1;
        let value_end = value_start
            .checked_add(len)
            .filter(|&end| end <= rest.len())
            .ok_or_else(|| malformed(rest, "value shorter than its length"))?;
        let value = String::from_utf8(rest[value_start..value_end].to_vec())
            .map_err(|_| malformed(rest, "value is not UTF-8"))?;
        args.push(value);

        rest = &rest[value_end..];
        if let Some((&sep, tail)) = rest.split_first() {
            if sep != b' ' || tail.is_empty() {
                return Err(malformed(rest, "expected a single space between arguments"));
            }
            rest = tail;
        }
    }

    Ok(args)
}

fn malformed(at: &[u8], what: &str) -> ProtoError {
    let preview: String = String::from_utf8_lossy(&at[..at.len().min(32)]).into_owned();
    ProtoError::MalformedArguments(format!("{what} near '{preview}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_matches_wire_format() {
        let msg = Message::new(code::JOB_STATUS, ["12", "running", ""]);
        assert_eq!(msg.encode(), "sta 17 2|12 7|running 0|\n");
    }

    #[test]
    fn test_split_values_with_separators() {
        let args = vec!["a b|c".to_string(), "line1\nline2".to_string(), String::new()];
        let raw = encode_args(&args);
        assert_eq!(split_args(raw.as_bytes()).unwrap(), args);
    }

    #[test]
    fn test_split_counts_bytes_not_chars() {
        let raw = "6|ação 1|x";
        assert_eq!(split_args(raw.as_bytes()).unwrap(), vec!["ação", "x"]);
    }

    #[test]
    fn test_split_rejects_malformed() {
        assert!(split_args(b"5|abc").is_err());
        assert!(split_args(b"x|abc").is_err());
        assert!(split_args(b"1|a  1|b").is_err());
        assert!(split_args(b"1|a ").is_err());
        assert!(split_args(b"").unwrap().is_empty());
    }

    #[test]
    fn test_split_rejects_huge_length() {
        assert!(matches!(
            split_args(b"18446744073709551615|abc"),
            Err(ProtoError::MalformedArguments(_))
        ));
    }

    #[test]
    fn test_expect_args() {
        let msg = Message::new(code::KIL, ["3", "1"]);
        assert!(msg.expect_args(2).is_ok());
        assert!(matches!(
            msg.expect_args(3),
            Err(ProtoError::ArgumentCount { expected: 3, got: 2, .. })
        ));
        assert!(msg.expect_min_args(1).is_ok());
    }

    #[test]
    fn test_known_codes() {
        assert!(code::is_known("job_def"));
        assert!(code::is_known("TSK"));
        assert!(!code::is_known("XYZ"));
    }
}
