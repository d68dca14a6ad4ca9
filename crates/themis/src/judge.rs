//! Judging of one submission against its problem's test cases

use std::sync::Arc;

use themis_common::{AppError, AppResult, Problem, Submission};
use tracing::debug;

use crate::aggregator::{SubmissionResult, TestCaseResult};
use crate::comparator;
use crate::languages::Toolchains;
use crate::sandbox::{Prepared, ResourceLimits, Sandbox};

/// Runs the build step and the test cases of a submission
#[derive(Clone)]
pub struct Judge {
    sandbox: Arc<dyn Sandbox>,
    toolchains: Arc<Toolchains>,
    stop_on_first_failure: bool,
}

impl Judge {
    pub fn new(
        sandbox: Arc<dyn Sandbox>,
        toolchains: Arc<Toolchains>,
        stop_on_first_failure: bool,
    ) -> Self {
        Self {
            sandbox,
            toolchains,
            stop_on_first_failure,
        }
    }

    /// Judge a submission.
    ///
    /// Test cases run in declared order. Program misbehaviour ends up in the
    /// returned verdict; `Err` is reserved for failures of the judge itself.
    pub async fn judge(&self, submission: &Submission, problem: &Problem) -> AppResult<SubmissionResult> {
        let (_, toolchain) = self.toolchains.resolve(&submission.language).ok_or_else(|| {
            AppError::ValidationError(format!("Unsupported language: {}", submission.language))
        })?;

        if problem.test_cases.is_empty() {
            return Err(AppError::ValidationError(format!(
                "Problem {} has no test cases",
                problem.id
            )));
        }
        let total = problem.test_cases.len() as u32;

        let program = match self
            .sandbox
            .prepare(submission.id, toolchain, &submission.code)
            .await?
        {
            Prepared::Ready(program) => program,
            Prepared::CompileFailed { log } => {
                return Ok(SubmissionResult::compile_error(log, total));
            }
        };

        let limits = ResourceLimits::new(problem.time_limit, problem.memory_limit);
        let mut results = Vec::with_capacity(problem.test_cases.len());

        for (index, testcase) in problem.test_cases.iter().enumerate() {
            let outcome = self.sandbox.run(&program, &testcase.input, limits).await?;
            let verdict = comparator::score(
                &testcase.expected_output,
                &outcome.stdout,
                &outcome,
                problem.comparison_mode,
            );

            debug!(
                submission_id = %submission.id,
                test = index,
                verdict = %verdict,
                elapsed_ms = outcome.elapsed_ms,
                "Test case judged"
            );

            results.push(TestCaseResult::from_outcome(index as u32, verdict, &outcome));

            if !verdict.is_accepted() && self.stop_on_first_failure {
                break;
            }
        }

        Ok(SubmissionResult::from_testcases(results, total))
    }
}
