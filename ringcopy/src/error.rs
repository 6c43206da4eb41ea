//! Row-level error types and the parse/insert error taxonomy.

use thiserror::Error;

/// A CSV row could not be turned into a statement: wrong field count, a
/// null primary key, or a value that does not parse as its column type.
///
/// Parse errors are never retried; the offending rows go straight to the
/// error file.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct ParseError(pub String);

impl ParseError {
    /// Build a parse error from anything displayable.
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Error-name prefixes classified as unrecoverable parse/read failures.
///
/// Everything else is treated as a (possibly transient) insert failure and
/// counted against `maxinserterrors` instead of `maxparseerrors`.
const PARSE_ERROR_PREFIXES: &[&str] =
    &["ValueError", "TypeError", "ParseError", "IndexError", "ReadError"];

/// Whether an error taxonomy tag names a parse-class failure.
#[must_use]
pub fn is_parse_error_tag(name: &str) -> bool {
    PARSE_ERROR_PREFIXES.iter().any(|p| name.starts_with(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_class_tags() {
        assert!(is_parse_error_tag("ParseError"));
        assert!(is_parse_error_tag("ReadError: bad utf-8"));
        assert!(is_parse_error_tag("ValueError"));
        assert!(!is_parse_error_tag("WriteTimeout"));
        assert!(!is_parse_error_tag("Unavailable"));
    }
}
