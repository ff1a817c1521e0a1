//! Decode error log suppression
//!
//! A busy mesh produces a steady stream of expected routing failures. Errors
//! whose message contains a deny-listed fragment are only counted.

use crate::decoder::DecodeError;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

#[derive(Debug, Default)]
pub struct ErrorSuppressor {
    patterns: Vec<String>,
    suppressed: AtomicU64,
}

impl ErrorSuppressor {
    pub fn new(patterns: Vec<String>) -> Self {
        Self {
            patterns,
            suppressed: AtomicU64::new(0),
        }
    }

    /// Whether a message matches the deny-list
    pub fn is_suppressed(&self, message: &str) -> bool {
        self.patterns
            .iter()
            .any(|pattern| message.contains(pattern.as_str()))
    }

    /// Log a dropped frame's decode error unless it is suppressed
    ///
    /// Returns `true` when the error was logged.
    pub fn report(&self, endpoint: &str, error: &DecodeError) -> bool {
        let message = error.to_string();

        if self.is_suppressed(&message) {
            self.suppressed.fetch_add(1, Ordering::Relaxed);

            #[cfg(feature = "metrics")]
            metrics::counter!("mesh_processor.decode_errors_suppressed").increment(1);

            return false;
        }

        #[cfg(feature = "metrics")]
        metrics::counter!("mesh_processor.decode_errors").increment(1);

        debug!(endpoint = endpoint, error = %message, "Dropped undecodable frame");
        true
    }

    /// Number of errors suppressed so far
    pub fn suppressed_count(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_shared::config::DEFAULT_SUPPRESSED_ERRORS;

    fn suppressor() -> ErrorSuppressor {
        ErrorSuppressor::new(DEFAULT_SUPPRESSED_ERRORS.iter().map(|p| p.to_string()).collect())
    }

    #[test]
    fn test_substring_match() {
        let suppressor = suppressor();
        assert!(suppressor.is_suppressed("routing error: NO_RESPONSE"));
        assert!(suppressor.is_suppressed("routing error: MAX_RETRANSMIT"));
        assert!(!suppressor.is_suppressed("protobuf decode error: invalid wire type"));
    }

    #[test]
    fn test_report_counts_suppressed_errors() {
        let suppressor = suppressor();

        assert!(!suppressor.report("msk", &DecodeError::Routing("TIMEOUT".to_string())));
        assert!(!suppressor.report("msk", &DecodeError::Routing("GOT_NAK".to_string())));
        assert!(suppressor.report("msk", &DecodeError::Malformed("truncated".to_string())));

        assert_eq!(suppressor.suppressed_count(), 2);
    }

    #[test]
    fn test_empty_deny_list_logs_everything() {
        let suppressor = ErrorSuppressor::default();
        assert!(suppressor.report("msk", &DecodeError::Routing("TIMEOUT".to_string())));
        assert_eq!(suppressor.suppressed_count(), 0);
    }
}
