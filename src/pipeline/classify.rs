//! Retry/error classification.
//!
//! Every per-item failure is mapped to exactly one [`ErrorClass`] by its
//! cause:
//!
//! | Class     | Causes                                                          |
//! |-----------|-----------------------------------------------------------------|
//! | Transient | timeout, network, HTTP 5xx/408/429, upstream failure            |
//! | Permanent | other HTTP 4xx, unparseable/unsupported/oversized content, not found, invalid identity |
//! | Fatal     | local storage or state unreadable, configuration invalid        |
//!
//! Transient failures are retried on later runs until the retry budget is
//! spent, then recorded as permanent.

use crate::error::ProcessError;
use crate::models::{Config, ErrorClass};
use crate::storage::Outcome;

/// HTTP statuses that will not change on retry.
pub const PERMANENT_HTTP: [u16; 5] = [401, 403, 404, 410, 451];

/// Classify a failure by its cause.
pub fn classify(error: &ProcessError) -> ErrorClass {
    match error {
        ProcessError::Timeout(_)
        | ProcessError::Network(_)
        | ProcessError::RateLimited { .. }
        | ProcessError::Upstream(_) => ErrorClass::Transient,

        ProcessError::Http { status, .. } => classify_status(*status),

        ProcessError::NotFound(_)
        | ProcessError::Unparseable(_)
        | ProcessError::UnsupportedContent(_)
        | ProcessError::TooLarge(_)
        | ProcessError::InvalidIdentity(_) => ErrorClass::Permanent,

        ProcessError::LocalState(_) | ProcessError::Configuration(_) => ErrorClass::Fatal,
    }
}

fn classify_status(status: u16) -> ErrorClass {
    match status {
        s if PERMANENT_HTTP.contains(&s) => ErrorClass::Permanent,
        408 | 429 => ErrorClass::Transient,
        400..=499 => ErrorClass::Permanent,
        _ => ErrorClass::Transient,
    }
}

/// Bounded retry budget for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.retry.max_attempts.max(1),
        }
    }

    /// Class to record after the `attempts`-th failure of an identity.
    pub fn effective_class(&self, class: ErrorClass, attempts: u32) -> ErrorClass {
        match class {
            ErrorClass::Transient if attempts >= self.max_attempts => ErrorClass::Permanent,
            other => other,
        }
    }

    /// Registry outcome for a non-fatal failure.
    pub fn outcome(&self, error: &ProcessError) -> Option<Outcome> {
        match classify(error) {
            ErrorClass::Transient => Some(Outcome::TransientFailure { kind: error.kind() }),
            ErrorClass::Permanent => Some(Outcome::PermanentFailure { kind: error.kind() }),
            ErrorClass::Fatal => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn http(status: u16) -> ProcessError {
        ProcessError::Http {
            status,
            url: "https://example.com".into(),
        }
    }

    #[test]
    fn test_permanent_http_statuses() {
        for status in PERMANENT_HTTP {
            assert_eq!(classify(&http(status)), ErrorClass::Permanent);
        }
        assert_eq!(classify(&http(400)), ErrorClass::Permanent);
    }

    #[test]
    fn test_transient_http_statuses() {
        for status in [408, 429, 500, 502, 503, 504] {
            assert_eq!(classify(&http(status)), ErrorClass::Transient, "{status}");
        }
    }

    #[test]
    fn test_transport_failures_are_transient() {
        assert_eq!(
            classify(&ProcessError::Timeout(Duration::from_secs(30))),
            ErrorClass::Transient
        );
        assert_eq!(
            classify(&ProcessError::Network("connection reset".into())),
            ErrorClass::Transient
        );
        assert_eq!(
            classify(&ProcessError::RateLimited { retry_after: None }),
            ErrorClass::Transient
        );
    }

    #[test]
    fn test_content_failures_are_permanent() {
        assert_eq!(
            classify(&ProcessError::Unparseable("empty body".into())),
            ErrorClass::Permanent
        );
        assert_eq!(
            classify(&ProcessError::UnsupportedContent("application/pdf".into())),
            ErrorClass::Permanent
        );
        assert_eq!(classify(&ProcessError::TooLarge(1 << 30)), ErrorClass::Permanent);
        assert_eq!(
            classify(&ProcessError::InvalidIdentity("::".into())),
            ErrorClass::Permanent
        );
    }

    #[test]
    fn test_local_failures_are_fatal() {
        assert_eq!(
            classify(&ProcessError::LocalState("disk full".into())),
            ErrorClass::Fatal
        );
        assert_eq!(
            classify(&ProcessError::Configuration("no api key".into())),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn test_message_text_is_ignored() {
        // A transient cause stays transient whatever its message says
        let err = ProcessError::Network("404 not found permanently".into());
        assert_eq!(classify(&err), ErrorClass::Transient);
    }

    #[test]
    fn test_budget_turns_transient_permanent() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.effective_class(ErrorClass::Transient, 2),
            ErrorClass::Transient
        );
        assert_eq!(
            policy.effective_class(ErrorClass::Transient, 3),
            ErrorClass::Permanent
        );
        assert_eq!(
            policy.effective_class(ErrorClass::Permanent, 1),
            ErrorClass::Permanent
        );
        assert!(policy
            .outcome(&ProcessError::LocalState("x".into()))
            .is_none());
    }
}
