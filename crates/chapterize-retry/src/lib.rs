//! Error classification and retry-budget bookkeeping.
//!
//! This crate intentionally has no delay, backoff, or sleep logic: retries
//! happen across external scheduler cycles
//! (cron, systemd timer, whatever re-invokes the binary), never inside a
//! single process run: a failed book is left `failed` in its manifest and
//! picked back up, rewound to its failed stage, the next time the orchestrator
//! runs. What lives here is purely the decision of "has this book's retry
//! budget run out" and "was this particular failure worth spending budget on
//! at all."
//!
//! # Example
//!
//! ```
//! use chapterize_retry::{classify_message, retry_outcome, RetryOutcome};
//! use chapterize_types::ErrorCategory;
//!
//! let category = classify_message(Some(1), "ffmpeg: Invalid data found when processing input");
//! assert_eq!(category, ErrorCategory::Transient);
//!
//! let outcome = retry_outcome(category, 2, 3);
//! assert_eq!(outcome, RetryOutcome::RetryNextCycle);
//! ```

use chapterize_types::ErrorCategory;

/// Substrings that indicate an external tool's non-zero exit reflects bad
/// input rather than a flaky environment, even when the tool itself doesn't
/// use the permanent exit codes (2, 3) defines. Matched
/// case-insensitively against combined stdout+stderr.
const PERMANENT_MESSAGE_MARKERS: &[&str] = &[
    "no such file or directory",
    "invalid data found when processing input",
    "unsupported codec",
    "could not find codec parameters",
    "no audio files found",
    "unrecognized option",
];

/// Classify a failure using both its exit code (per
/// [`ErrorCategory::from_exit_code`]) and, when the code alone is ambiguous,
/// a scan of the tool's own message for known permanent-failure phrasing.
///
/// `exit_code` is `None` for failures that never produced one (process
/// killed by signal, spawn failure).
pub fn classify_message(exit_code: Option<i32>, message: &str) -> ErrorCategory {
    if let Some(code) = exit_code {
        let from_code = ErrorCategory::from_exit_code(code);
        if from_code == ErrorCategory::Permanent {
            return from_code;
        }
    }

    let lower = message.to_ascii_lowercase();
    if PERMANENT_MESSAGE_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
    {
        return ErrorCategory::Permanent;
    }

    ErrorCategory::Transient
}

/// What the orchestrator should do with a book after a failed stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Leave the book `failed`; a future invocation may pick it back up.
    RetryNextCycle,
    /// The failure is either permanent or the retry budget is exhausted;
    /// move the book out of the normal queue (quarantine).
    Quarantine,
}

/// Decide the retry outcome for a failure already recorded against a
/// manifest. `retry_count` is the count *after* this failure was recorded
/// (i.e. what [`chapterize_state::Manifest::record_failure`] returns having
/// bumped); `max_retries` is the manifest's configured budget.
pub fn retry_outcome(category: ErrorCategory, retry_count: u32, max_retries: u32) -> RetryOutcome {
    match category {
        ErrorCategory::Permanent => RetryOutcome::Quarantine,
        ErrorCategory::Transient if retry_count >= max_retries => RetryOutcome::Quarantine,
        ErrorCategory::Transient => RetryOutcome::RetryNextCycle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_message_trusts_permanent_exit_codes() {
        assert_eq!(
            classify_message(Some(2), "anything"),
            ErrorCategory::Permanent
        );
        assert_eq!(
            classify_message(Some(3), "anything"),
            ErrorCategory::Permanent
        );
    }

    #[test]
    fn classify_message_detects_permanent_phrasing_under_transient_code() {
        let category = classify_message(Some(1), "No such file or directory: input.mp3");
        assert_eq!(category, ErrorCategory::Permanent);
    }

    #[test]
    fn classify_message_defaults_to_transient() {
        let category = classify_message(Some(1), "connection reset by peer");
        assert_eq!(category, ErrorCategory::Transient);
    }

    #[test]
    fn classify_message_handles_missing_exit_code() {
        let category = classify_message(None, "process killed by signal");
        assert_eq!(category, ErrorCategory::Transient);
    }

    #[test]
    fn retry_outcome_permanent_always_quarantines() {
        assert_eq!(
            retry_outcome(ErrorCategory::Permanent, 0, 3),
            RetryOutcome::Quarantine
        );
        assert_eq!(
            retry_outcome(ErrorCategory::Permanent, 1, 3),
            RetryOutcome::Quarantine
        );
    }

    #[test]
    fn retry_outcome_transient_under_budget_retries() {
        assert_eq!(
            retry_outcome(ErrorCategory::Transient, 1, 3),
            RetryOutcome::RetryNextCycle
        );
        assert_eq!(
            retry_outcome(ErrorCategory::Transient, 2, 3),
            RetryOutcome::RetryNextCycle
        );
    }

    #[test]
    fn retry_outcome_transient_at_budget_quarantines() {
        assert_eq!(
            retry_outcome(ErrorCategory::Transient, 3, 3),
            RetryOutcome::Quarantine
        );
        assert_eq!(
            retry_outcome(ErrorCategory::Transient, 4, 3),
            RetryOutcome::Quarantine
        );
    }
}
