//! The typed error boundary between stage code and the orchestrator's
//! failure trap . Stages raise one of these two variants when
//! they know their own category; anything else bubbling up as a plain
//! `anyhow::Error` is classified by message/exit-code heuristics instead
//! (see [`chapterize_retry::classify_message`]).

use chapterize_types::ErrorCategory;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("{message}")]
    Permanent { message: String, exit_code: Option<i32> },
    #[error("{message}")]
    Transient { message: String, exit_code: Option<i32> },
}

impl PipelineError {
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
            exit_code: None,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            exit_code: None,
        }
    }

    pub fn permanent_with_code(message: impl Into<String>, exit_code: i32) -> Self {
        Self::Permanent {
            message: message.into(),
            exit_code: Some(exit_code),
        }
    }

    pub fn transient_with_code(message: impl Into<String>, exit_code: i32) -> Self {
        Self::Transient {
            message: message.into(),
            exit_code: Some(exit_code),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            PipelineError::Permanent { .. } => ErrorCategory::Permanent,
            PipelineError::Transient { .. } => ErrorCategory::Transient,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            PipelineError::Permanent { exit_code, .. } | PipelineError::Transient { exit_code, .. } => *exit_code,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            PipelineError::Permanent { message, .. } | PipelineError::Transient { message, .. } => message,
        }
    }
}

/// Classify an arbitrary `anyhow::Error` raised by a stage. Errors that are
/// (or wrap) a [`PipelineError`] use its category directly; everything else
/// falls through to [`chapterize_retry::classify_message`] against the exit
/// code (if any) and the error's display text.
pub fn classify_stage_error(error: &anyhow::Error) -> (ErrorCategory, Option<i32>, String) {
    if let Some(pipeline_error) = error.downcast_ref::<PipelineError>() {
        return (
            pipeline_error.category(),
            pipeline_error.exit_code(),
            pipeline_error.message().to_string(),
        );
    }

    let message = format!("{error:#}");
    let category = chapterize_retry::classify_message(None, &message);
    (category, None, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_error_exposes_category_and_message() {
        let err = PipelineError::permanent_with_code("no audio files found", 2);
        assert_eq!(err.category(), ErrorCategory::Permanent);
        assert_eq!(err.exit_code(), Some(2));
        assert_eq!(err.message(), "no audio files found");
    }

    #[test]
    fn classify_stage_error_recognizes_wrapped_pipeline_error() {
        let anyhow_err: anyhow::Error = PipelineError::transient("disk pressure").into();
        let (category, exit_code, message) = classify_stage_error(&anyhow_err);
        assert_eq!(category, ErrorCategory::Transient);
        assert_eq!(exit_code, None);
        assert_eq!(message, "disk pressure");
    }

    #[test]
    fn classify_stage_error_falls_back_to_message_heuristics() {
        let anyhow_err = anyhow::anyhow!("No such file or directory: input.mp3");
        let (category, _, _) = classify_stage_error(&anyhow_err);
        assert_eq!(category, ErrorCategory::Permanent);
    }
}
