/*!
Tests for error handling and error types.
*/

#[cfg(test)]
mod tests {
    use crate::error::{BackhaulError, EngineErrorKind};
    use backhaul_retry::{RetryError, RetryableError};
    use std::io;
    use std::time::Duration;

    #[test]
    fn test_backhaul_error_display() {
        let error = BackhaulError::validation("snapshot-id is empty");
        assert_eq!(error.to_string(), "Validation error: snapshot-id is empty");

        let error = BackhaulError::invalid_endpoint("endpoint is empty");
        assert_eq!(error.to_string(), "Invalid endpoint: endpoint is empty");

        let error = BackhaulError::Engine(EngineErrorKind::TokenExpired);
        assert_eq!(error.to_string(), "Engine error: The provided token has expired");
    }

    #[test]
    fn test_recognized_kinds_display_their_engine_marker() {
        use crate::engine::classify::{match_marker, LOCKED};

        assert_eq!(EngineErrorKind::Locked.to_string(), LOCKED);
        for kind in [
            EngineErrorKind::AlreadyInitialized,
            EngineErrorKind::TokenExpired,
            EngineErrorKind::ConfigFileUnreadable,
            EngineErrorKind::Locked,
            EngineErrorKind::SnapshotNotFound,
        ] {
            assert_eq!(match_marker(&kind.to_string()), Some(kind.clone()), "{kind:?}");
        }
    }

    #[test]
    fn test_generic_engine_failure_is_verbatim() {
        let raw = "Fatal: wrong password or no key found";
        let error = BackhaulError::from(EngineErrorKind::Generic(raw.to_string()));
        assert!(error.to_string().ends_with(raw));
    }

    #[test]
    fn test_engine_kind_looks_through_wrappers() {
        let error = BackhaulError::Engine(EngineErrorKind::Locked)
            .context("backup", "photos");
        assert_eq!(error.engine_kind(), Some(&EngineErrorKind::Locked));
        assert!(error.to_string().contains("photos"));

        let exhausted = BackhaulError::RetriesExhausted {
            operation: "refresh credentials",
            attempts: 3,
            source: Box::new(BackhaulError::Engine(EngineErrorKind::TokenExpired)),
        };
        assert!(exhausted.is_token_expired());

        assert_eq!(BackhaulError::session("boom").engine_kind(), None);
    }

    #[test]
    fn test_timeout_is_distinct_from_engine_errors() {
        let error = BackhaulError::Timeout {
            operation: "backup",
            resource: "photos".to_string(),
            after: Duration::from_secs(7200),
        };
        assert_eq!(error.engine_kind(), None);
        assert!(error.to_string().contains("timed out"));
    }

    #[test]
    fn test_from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "File not found");
        match BackhaulError::from(io_error) {
            BackhaulError::Io(err) => assert_eq!(err.kind(), io::ErrorKind::NotFound),
            _ => panic!("Expected Io error variant"),
        }
    }

    #[test]
    fn test_from_json_error() {
        let json_error = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(matches!(
            BackhaulError::from(json_error),
            BackhaulError::Json(_)
        ));
    }

    #[test]
    fn test_retry_error_conversion_keeps_last_error() {
        let exhausted = RetryError::MaxRetriesExceeded {
            operation: "repair index",
            attempts: 10,
            source: BackhaulError::Engine(EngineErrorKind::Locked),
        };
        match BackhaulError::from(exhausted) {
            BackhaulError::RetriesExhausted { attempts, source, .. } => {
                assert_eq!(attempts, 10);
                assert_eq!(source.engine_kind(), Some(&EngineErrorKind::Locked));
            }
            other => panic!("unexpected {other:?}"),
        }

        let permanent = RetryError::Permanent {
            operation: "nonce",
            attempt: 1,
            source: BackhaulError::validation("bad key"),
        };
        assert!(matches!(
            BackhaulError::from(permanent),
            BackhaulError::Validation(_)
        ));
    }

    #[test]
    fn test_retry_classification() {
        assert!(BackhaulError::session("network unreachable").is_transient());
        assert!(BackhaulError::Engine(EngineErrorKind::Locked).is_transient());
        assert!(BackhaulError::validation("bad").is_permanent());
        assert!(BackhaulError::invalid_endpoint("bad").is_permanent());
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<BackhaulError>();
        assert_sync::<BackhaulError>();
    }
}
