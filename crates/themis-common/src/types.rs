//! Common types used across Themis services.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// User ID type
pub type UserId = Uuid;

/// Contest ID type
pub type ContestId = Uuid;

/// Problem ID type
pub type ProblemId = Uuid;

/// Submission ID type
pub type SubmissionId = Uuid;

/// Error returned when parsing one of the string-backed enums fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind} '{value}'")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Problem difficulty
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

impl Difficulty {
    pub fn as_str(&self) -> &'static str {
        match self {
            Difficulty::Easy => "Easy",
            Difficulty::Medium => "Medium",
            Difficulty::Hard => "Hard",
        }
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Difficulty {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Easy" => Ok(Difficulty::Easy),
            "Medium" => Ok(Difficulty::Medium),
            "Hard" => Ok(Difficulty::Hard),
            _ => Err(ParseEnumError::new("difficulty", s)),
        }
    }
}

/// Supported language for submissions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    C,
    Cpp,
    Rust,
    Go,
    Python,
}

impl Language {
    /// All languages the pipeline knows a toolchain for.
    pub const ALL: &'static [Language] = &[
        Language::C,
        Language::Cpp,
        Language::Rust,
        Language::Go,
        Language::Python,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::C => "c",
            Language::Cpp => "cpp",
            Language::Rust => "rust",
            Language::Go => "go",
            Language::Python => "python",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "c" => Ok(Language::C),
            "cpp" | "c++" => Ok(Language::Cpp),
            "rust" => Ok(Language::Rust),
            "go" => Ok(Language::Go),
            "python" | "python3" => Ok(Language::Python),
            _ => Err(ParseEnumError::new("language", s)),
        }
    }
}

/// Verdict for a single test case, and the overall verdict of a judged
/// submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    /// Test passed
    Accepted,
    /// Output mismatch
    WrongAnswer,
    /// Exceeded time limit
    TimeLimitExceeded,
    /// Exceeded memory limit
    MemoryLimitExceeded,
    /// Program crashed or exited non-zero
    RuntimeError,
    /// Build step failed, nothing was executed
    CompileError,
}

impl Verdict {
    /// Get short code for verdict
    pub fn code(&self) -> &'static str {
        match self {
            Verdict::Accepted => "AC",
            Verdict::WrongAnswer => "WA",
            Verdict::TimeLimitExceeded => "TLE",
            Verdict::MemoryLimitExceeded => "MLE",
            Verdict::RuntimeError => "RE",
            Verdict::CompileError => "CE",
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(SubmissionStatus::from(*self).as_str())
    }
}

/// Lifecycle status of a submission.
///
/// `PENDING -> RUNNING -> <terminal>`, or `PENDING -> CANCELLED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmissionStatus {
    /// Waiting in queue
    Pending,
    /// Currently being judged
    Running,
    Accepted,
    WrongAnswer,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    RuntimeError,
    CompileError,
    /// Infrastructure failure after all retries; the user should resubmit
    JudgeError,
    /// Withdrawn while still pending
    Cancelled,
}

impl SubmissionStatus {
    pub const ALL: &'static [SubmissionStatus] = &[
        Self::Pending,
        Self::Running,
        Self::Accepted,
        Self::WrongAnswer,
        Self::TimeLimitExceeded,
        Self::MemoryLimitExceeded,
        Self::RuntimeError,
        Self::CompileError,
        Self::JudgeError,
        Self::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Accepted => "ACCEPTED",
            Self::WrongAnswer => "WRONG_ANSWER",
            Self::TimeLimitExceeded => "TIME_LIMIT_EXCEEDED",
            Self::MemoryLimitExceeded => "MEMORY_LIMIT_EXCEEDED",
            Self::RuntimeError => "RUNTIME_ERROR",
            Self::CompileError => "COMPILE_ERROR",
            Self::JudgeError => "JUDGE_ERROR",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Check if the status is terminal (immutable from here on)
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// The judged verdict carried by this status, if any.
    pub fn verdict(&self) -> Option<Verdict> {
        match self {
            Self::Accepted => Some(Verdict::Accepted),
            Self::WrongAnswer => Some(Verdict::WrongAnswer),
            Self::TimeLimitExceeded => Some(Verdict::TimeLimitExceeded),
            Self::MemoryLimitExceeded => Some(Verdict::MemoryLimitExceeded),
            Self::RuntimeError => Some(Verdict::RuntimeError),
            Self::CompileError => Some(Verdict::CompileError),
            Self::Pending | Self::Running | Self::JudgeError | Self::Cancelled => None,
        }
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: SubmissionStatus) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Running | Self::Cancelled),
            Self::Running => next.is_terminal() && next != Self::Cancelled,
            _ => false,
        }
    }
}

impl From<Verdict> for SubmissionStatus {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Accepted => Self::Accepted,
            Verdict::WrongAnswer => Self::WrongAnswer,
            Verdict::TimeLimitExceeded => Self::TimeLimitExceeded,
            Verdict::MemoryLimitExceeded => Self::MemoryLimitExceeded,
            Verdict::RuntimeError => Self::RuntimeError,
            Verdict::CompileError => Self::CompileError,
        }
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubmissionStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseEnumError::new("submission status", s))
    }
}

/// How a problem compares program output against the expected output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonMode {
    /// Ignore trailing whitespace per line and trailing blank lines
    #[default]
    Normalized,
    /// Byte-for-byte equality
    Exact,
}

impl ComparisonMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComparisonMode::Normalized => "normalized",
            ComparisonMode::Exact => "exact",
        }
    }
}

impl FromStr for ComparisonMode {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normalized" => Ok(ComparisonMode::Normalized),
            "exact" => Ok(ComparisonMode::Exact),
            _ => Err(ParseEnumError::new("comparison mode", s)),
        }
    }
}
