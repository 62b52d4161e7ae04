//! Best-effort failure notification webhook.
//!
//! Fired once per book, only on permanent failure or retry exhaustion
//! . Delivery is swallowed on error: a dead webhook endpoint
//! must never block quarantine or pipeline termination, so every public
//! function here returns `` rather than `Result` and logs failures
//! internally via the caller-supplied reporter.
//!
//! # Example
//!
//! ```
//! use chapterize_webhook::FailurePayload;
//! use chapterize_types::{ErrorCategory, StageName};
//! use chrono::Utc;
//!
//! let payload = FailurePayload {
//!     book_hash: "abc0123456789def".to_string(),
//!     source_path: "/in/Some Book".to_string(),
//!     stage: StageName::Convert,
//!     category: ErrorCategory::Permanent,
//!     exit_code: Some(2),
//!     message: "unsupported codec".to_string(),
//!     retry_count: 0,
//!     timestamp: Utc::now(),
//! };
//! let json = serde_json::to_string(&payload).unwrap();
//! assert!(json.contains("\"book_hash\""));
//! ```

use std::time::Duration;

use chapterize_types::{ErrorCategory, StageName};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Upper bound on webhook request time: timeout of 5 seconds.
pub const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(5);

/// The JSON body POSTed to `FAILURE_WEBHOOK_URL`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailurePayload {
    pub book_hash: String,
    pub source_path: String,
    pub stage: StageName,
    pub category: ErrorCategory,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub message: String,
    pub retry_count: u32,
    pub timestamp: DateTime<Utc>,
}

/// Send the failure payload to `url`, blocking up to [`WEBHOOK_TIMEOUT`].
/// Any failure (build error, connect error, non-2xx response) is reported
/// through `on_error` and otherwise ignored; this function never propagates
/// a webhook failure to its caller.
pub fn notify_failure(url: &str, payload: &FailurePayload, on_error: impl FnOnce(&str)) {
    let client = match reqwest::blocking::Client::builder()
        .timeout(WEBHOOK_TIMEOUT)
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            on_error(&format!("failed to build webhook client: {e}"));
            return;
        }
    };

    let body = match serde_json::to_string(payload) {
        Ok(body) => body,
        Err(e) => {
            on_error(&format!("failed to serialize webhook payload: {e}"));
            return;
        }
    };

    let result = client
        .post(url)
        .header("Content-Type", "application/json")
        .body(body)
        .send();

    match result {
        Ok(response) if response.status().is_success() => {}
        Ok(response) => on_error(&format!("webhook returned status {}", response.status())),
        Err(e) => on_error(&format!("webhook request failed: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payload() -> FailurePayload {
        FailurePayload {
            book_hash: "abc0123456789def".to_string(),
            source_path: "/in/Some Book".to_string(),
            stage: StageName::Convert,
            category: ErrorCategory::Permanent,
            exit_code: Some(2),
            message: "unsupported codec".to_string(),
            retry_count: 0,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn payload_serializes_with_expected_fields() {
        let json = serde_json::to_value(sample_payload()).unwrap();
        assert_eq!(json["book_hash"], "abc0123456789def");
        assert_eq!(json["stage"], "convert");
        assert_eq!(json["category"], "permanent");
        assert_eq!(json["exit_code"], 2);
    }

    #[test]
    fn payload_omits_missing_exit_code() {
        let mut payload = sample_payload();
        payload.exit_code = None;
        let json = serde_json::to_value(payload).unwrap();
        assert!(json.get("exit_code").is_none());
    }

    #[test]
    fn notify_failure_reports_connection_errors_without_panicking() {
        let mut error_message = None;
        notify_failure(
            "http://127.0.0.1:1/unreachable",
            &sample_payload(),
            |msg| error_message = Some(msg.to_string()),
        );
        assert!(error_message.is_some());
    }
}
