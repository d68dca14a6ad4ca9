//! Intake validation
//!
//! Malformed submissions are rejected synchronously and never reach the
//! queue or the store.

use serde::Serialize;
use themis_common::{Language, NewSubmission, ProblemId};

use crate::config::IntakeConfig;
use crate::languages::Toolchains;

/// Why a submission was turned away at intake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum RejectReason {
    #[error("Code is {size} bytes, the limit is {limit}")]
    CodeTooLarge { size: usize, limit: usize },

    #[error("Code is empty")]
    EmptyCode,

    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("Problem {0} not found")]
    ProblemNotFound(ProblemId),

    #[error("Judge queue is full, try again later")]
    QueueFull,

    #[error("Judge is shutting down")]
    ShuttingDown,
}

impl RejectReason {
    /// Metric label
    pub fn label(&self) -> &'static str {
        match self {
            Self::CodeTooLarge { .. } => "code_too_large",
            Self::EmptyCode => "empty_code",
            Self::UnsupportedLanguage(_) => "unsupported_language",
            Self::ProblemNotFound(_) => "problem_not_found",
            Self::QueueFull => "queue_full",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

/// Check the parts of a submission that need no lookups.
///
/// Order: empty code, size ceiling, language. Returns the resolved language.
pub fn validate(
    submission: &NewSubmission,
    config: &IntakeConfig,
    toolchains: &Toolchains,
) -> Result<Language, RejectReason> {
    if submission.code.trim().is_empty() {
        return Err(RejectReason::EmptyCode);
    }

    let size = submission.code.len();
    if size > config.max_code_bytes {
        return Err(RejectReason::CodeTooLarge {
            size,
            limit: config.max_code_bytes,
        });
    }

    toolchains
        .resolve(&submission.language)
        .map(|(language, _)| language)
        .ok_or_else(|| RejectReason::UnsupportedLanguage(submission.language.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn submission(language: &str, code: &str) -> NewSubmission {
        NewSubmission {
            user_id: Uuid::new_v4(),
            problem_id: Uuid::new_v4(),
            contest_id: None,
            language: language.to_string(),
            code: code.to_string(),
        }
    }

    #[test]
    fn test_accepts_supported_language() {
        let config = IntakeConfig::default();
        let toolchains = Toolchains::builtin(&config.enabled_languages);
        let language = validate(&submission("C++", "int main() {}"), &config, &toolchains);
        assert_eq!(language, Ok(Language::Cpp));
    }

    #[test]
    fn test_rejections_in_order() {
        let config = IntakeConfig {
            max_code_bytes: 8,
            enabled_languages: vec![Language::Python],
        };
        let toolchains = Toolchains::builtin(&config.enabled_languages);

        assert_eq!(
            validate(&submission("brainfuck", "  \n"), &config, &toolchains),
            Err(RejectReason::EmptyCode)
        );
        assert_eq!(
            validate(&submission("brainfuck", "print(1234)"), &config, &toolchains),
            Err(RejectReason::CodeTooLarge { size: 11, limit: 8 })
        );
        assert_eq!(
            validate(&submission("cpp", "int x;"), &config, &toolchains),
            Err(RejectReason::UnsupportedLanguage("cpp".to_string()))
        );
    }

    #[test]
    fn test_reason_labels() {
        assert_eq!(RejectReason::QueueFull.label(), "queue_full");
        assert_eq!(
            RejectReason::CodeTooLarge { size: 1, limit: 0 }.to_string(),
            "Code is 1 bytes, the limit is 0"
        );
    }
}
