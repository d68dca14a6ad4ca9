//! Test case results and submission-level aggregation

use themis_common::{FinalReport, SubmissionStatus, Verdict};

use crate::sandbox::Outcome;

/// Result of running a single test case
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCaseResult {
    /// Position in the problem's declared order (0-indexed)
    pub index: u32,

    /// Verdict for this test case
    pub verdict: Verdict,

    /// Execution time in milliseconds
    pub time_ms: u64,

    /// Peak memory usage in KB
    pub memory_kb: u64,

    /// Exit code (if applicable)
    pub exit_code: Option<i32>,

    /// Diagnostic for failed runs (stderr, compiler log)
    pub message: Option<String>,
}

impl TestCaseResult {
    /// Build a result from a scored outcome
    pub fn from_outcome(index: u32, verdict: Verdict, outcome: &Outcome) -> Self {
        let message = match verdict {
            Verdict::Accepted | Verdict::WrongAnswer => None,
            Verdict::TimeLimitExceeded => Some("Time limit exceeded".to_string()),
            Verdict::MemoryLimitExceeded => Some("Memory limit exceeded".to_string()),
            Verdict::CompileError => Some(outcome.stderr.clone()),
            Verdict::RuntimeError => Some(runtime_message(outcome)),
        };

        Self {
            index,
            verdict,
            time_ms: outcome.elapsed_ms,
            memory_kb: outcome.peak_memory_kb,
            exit_code: outcome.exit_code,
            message,
        }
    }

    /// Create an accepted result
    pub fn accepted(index: u32, time_ms: u64, memory_kb: u64) -> Self {
        Self {
            index,
            verdict: Verdict::Accepted,
            time_ms,
            memory_kb,
            exit_code: Some(0),
            message: None,
        }
    }

    /// Create a failed result with the given verdict
    pub fn failed(index: u32, verdict: Verdict) -> Self {
        Self {
            index,
            verdict,
            time_ms: 0,
            memory_kb: 0,
            exit_code: None,
            message: None,
        }
    }
}

fn runtime_message(outcome: &Outcome) -> String {
    if !outcome.stderr.trim().is_empty() {
        return outcome.stderr.chars().take(500).collect();
    }
    match (outcome.signal, outcome.exit_code) {
        (Some(signal), _) => format!("Killed by signal {}", signal),
        (None, Some(code)) => format!("Process exited with code {}", code),
        (None, None) => "Process terminated abnormally".to_string(),
    }
}

/// Overall verdict and the first failing test in declared order.
///
/// The overall verdict is the verdict of the *first* non-accepted test,
/// not the most severe one. An empty sequence aggregates to `Accepted`;
/// callers must not judge problems without test cases.
pub fn aggregate(verdicts: &[Verdict]) -> (Verdict, Option<u32>) {
    verdicts
        .iter()
        .enumerate()
        .find(|(_, verdict)| !verdict.is_accepted())
        .map(|(index, verdict)| (*verdict, Some(index as u32)))
        .unwrap_or((Verdict::Accepted, None))
}

/// Aggregated result for entire submission
#[derive(Debug, Clone)]
pub struct SubmissionResult {
    /// Overall verdict
    pub verdict: Verdict,

    /// Results for each executed test case, in declared order
    pub testcase_results: Vec<TestCaseResult>,

    /// Number of passed test cases
    pub passed_count: u32,

    /// Total number of test cases of the problem
    pub total_count: u32,

    /// Maximum time across executed test cases (ms)
    pub max_time_ms: u64,

    /// Maximum memory across executed test cases (KB)
    pub max_memory_kb: u64,

    /// Index of the first failing test case (if any)
    pub first_failure: Option<u32>,

    /// Diagnostic of the first failure
    pub message: Option<String>,
}

impl SubmissionResult {
    /// Create submission result from test case results
    pub fn from_testcases(results: Vec<TestCaseResult>, total_count: u32) -> Self {
        let verdicts: Vec<Verdict> = results.iter().map(|r| r.verdict).collect();
        let (verdict, first_failure) = aggregate(&verdicts);

        let passed_count = results.iter().filter(|r| r.verdict.is_accepted()).count() as u32;
        let max_time_ms = results.iter().map(|r| r.time_ms).max().unwrap_or(0);
        let max_memory_kb = results.iter().map(|r| r.memory_kb).max().unwrap_or(0);
        let message = first_failure
            .and_then(|index| results.iter().find(|r| r.index == index))
            .and_then(|r| r.message.clone());

        Self {
            verdict,
            testcase_results: results,
            passed_count,
            total_count,
            max_time_ms,
            max_memory_kb,
            first_failure,
            message,
        }
    }

    /// A build failure: nothing ran.
    pub fn compile_error(log: String, total_count: u32) -> Self {
        Self {
            verdict: Verdict::CompileError,
            testcase_results: Vec::new(),
            passed_count: 0,
            total_count,
            max_time_ms: 0,
            max_memory_kb: 0,
            first_failure: None,
            message: Some(log),
        }
    }

    /// What gets persisted on the submission.
    pub fn report(&self) -> FinalReport {
        FinalReport {
            status: SubmissionStatus::from(self.verdict),
            first_failing_test: self.first_failure,
            max_time_ms: self.max_time_ms,
            peak_memory_kb: self.max_memory_kb,
            judge_message: self.message.clone(),
        }
    }
}
