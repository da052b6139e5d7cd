//! Mapping of engine diagnostics to [`EngineErrorKind`].
//!
//! restic reports repository-level failures as plain text, usually prefixed
//! with `Fatal: `. The markers below are matched as exact, case-sensitive
//! substrings. A new engine version that rewords a message only needs this
//! table updated.

use crate::error::EngineErrorKind;

pub const ALREADY_INITIALIZED: &str = "repository master key and config already initialized";
pub const UNABLE_TO_OPEN_REPOSITORY: &str = "unable to open repository";
pub const BAD_REQUEST: &str = "400 Bad Request";
pub const CONFIG_FILE_UNREADABLE: &str = "unable to open config file: Stat: 400 Bad Request";
pub const LOCKED: &str = "repository is already locked by";
pub const SNAPSHOT_NOT_FOUND: &str = "failed to find snapshot: no matching ID found for prefix";
pub const TOKEN_EXPIRED: &str = "The provided token has expired";
pub const FATAL_PREFIX: &str = "Fatal: ";

/// Checked in order; the first matching marker wins. More specific markers
/// come before the ones they contain.
const MARKERS: &[(&str, EngineErrorKind)] = &[
    (ALREADY_INITIALIZED, EngineErrorKind::AlreadyInitialized),
    (SNAPSHOT_NOT_FOUND, EngineErrorKind::SnapshotNotFound),
    (LOCKED, EngineErrorKind::Locked),
    (CONFIG_FILE_UNREADABLE, EngineErrorKind::ConfigFileUnreadable),
    (TOKEN_EXPIRED, EngineErrorKind::TokenExpired),
    (UNABLE_TO_OPEN_REPOSITORY, EngineErrorKind::TokenExpired),
    (BAD_REQUEST, EngineErrorKind::TokenExpired),
];

/// The recognized failure named by `text`, if any marker matches
pub fn match_marker(text: &str) -> Option<EngineErrorKind> {
    MARKERS
        .iter()
        .find(|(marker, _)| text.contains(marker))
        .map(|(_, kind)| kind.clone())
}

/// Whether a raw line is an engine-level failure rather than ordinary output
pub fn is_fatal(text: &str) -> bool {
    text.contains(FATAL_PREFIX)
}

/// Classify a line that did not decode as a structured record.
///
/// Every such line is terminal: a known marker yields its kind, anything else
/// becomes [`EngineErrorKind::Generic`] carrying the raw text.
pub fn classify_line(text: &str) -> EngineErrorKind {
    match_marker(text).unwrap_or_else(|| EngineErrorKind::Generic(text.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_table() {
        let cases = [
            (
                "Fatal: create key in repository at s3:x failed: repository master key and config already initialized",
                EngineErrorKind::AlreadyInitialized,
            ),
            (
                "Fatal: unable to open repository at s3:s3.us-east-1.amazonaws.com/b: Access Denied",
                EngineErrorKind::TokenExpired,
            ),
            ("Fatal: Stat: 400 Bad Request", EngineErrorKind::TokenExpired),
            (
                "Fatal: unable to open config file: Stat: 400 Bad Request",
                EngineErrorKind::ConfigFileUnreadable,
            ),
            (
                "unable to create lock in backend: repository is already locked by PID 42 on host",
                EngineErrorKind::Locked,
            ),
            (
                "Fatal: failed to find snapshot: no matching ID found for prefix \"deadbeef\"",
                EngineErrorKind::SnapshotNotFound,
            ),
            (
                "Fatal: The provided token has expired.",
                EngineErrorKind::TokenExpired,
            ),
        ];

        for (line, expected) in cases {
            assert_eq!(classify_line(line), expected, "line: {line}");
        }
    }

    #[test]
    fn test_config_file_marker_wins_over_bad_request() {
        assert_eq!(
            match_marker("Fatal: unable to open config file: Stat: 400 Bad Request"),
            Some(EngineErrorKind::ConfigFileUnreadable)
        );
    }

    #[test]
    fn test_markers_are_case_sensitive() {
        assert_eq!(match_marker("the provided token has expired"), None);
    }

    #[test]
    fn test_unrecognized_text_is_generic_and_verbatim() {
        let line = "Fatal: wrong password or no key found\n";
        assert_eq!(
            classify_line(line),
            EngineErrorKind::Generic("Fatal: wrong password or no key found".to_string())
        );
        assert!(is_fatal(line));
        assert!(!is_fatal("{\"message_type\":\"status\"}"));
    }
}
