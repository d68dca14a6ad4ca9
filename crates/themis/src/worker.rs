//! Judging workers
//!
//! Each worker pops a submission id, claims it (`PENDING -> RUNNING`),
//! judges it with retries for infrastructure failures, commits the terminal
//! status and only then applies statistics.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use themis_common::{
    AppError, AppResult, FinalReport, Problem, Submission, SubmissionId, SubmissionStatus,
    Verdict,
};
use tracing::{debug, error, info, warn};

use crate::aggregator::SubmissionResult;
use crate::constants::JUDGE_ERROR_MESSAGE;
use crate::judge::Judge;
use crate::metrics::{self, ACTIVE_JOBS, JOBS_FAILED, JOBS_PROCESSED, RETRIES};
use crate::queue::SubmissionQueue;
use crate::retry::RetryPolicy;
use crate::stats::StatisticsUpdater;
use crate::store::JudgeStore;

/// How processing one submission ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Terminal verdict committed
    Judged(Verdict),
    /// Gave up; committed as JUDGE_ERROR
    JudgeError,
    /// Not claimable (cancelled or already taken) or not committable
    Skipped,
}

/// Everything a worker needs to drive a submission to a terminal status
pub struct Pipeline {
    store: Arc<dyn JudgeStore>,
    judge: Judge,
    stats: StatisticsUpdater,
    retry: RetryPolicy,
}

impl Pipeline {
    pub fn new(store: Arc<dyn JudgeStore>, judge: Judge, retry: RetryPolicy) -> Self {
        let stats = StatisticsUpdater::new(store.clone());
        Self {
            store,
            judge,
            stats,
            retry,
        }
    }

    pub fn store(&self) -> &Arc<dyn JudgeStore> {
        &self.store
    }

    pub fn stats(&self) -> &StatisticsUpdater {
        &self.stats
    }

    /// Process one queued submission.
    pub async fn process(&self, submission_id: SubmissionId) -> JobOutcome {
        let claimed = self
            .with_retries("claim", submission_id, || {
                self.store.claim_submission(submission_id, Utc::now())
            })
            .await;

        match claimed {
            Ok(true) => {}
            Ok(false) => {
                debug!(submission_id = %submission_id, "Submission no longer pending, skipping");
                return JobOutcome::Skipped;
            }
            Err(e) => {
                // Still PENDING, the poller or recovery will queue it again
                error!(submission_id = %submission_id, "Failed to claim submission: {}", e);
                return JobOutcome::Skipped;
            }
        }

        ACTIVE_JOBS.inc();
        let started = Instant::now();
        let outcome = self.judge_claimed(submission_id).await;
        metrics::record_execution(started.elapsed().as_secs_f64());
        ACTIVE_JOBS.dec();

        outcome
    }

    async fn judge_claimed(&self, submission_id: SubmissionId) -> JobOutcome {
        let judged = self
            .with_retries("judge", submission_id, || self.attempt(submission_id))
            .await;

        let (report, problem) = match &judged {
            Ok((problem, result)) => {
                info!(
                    submission_id = %submission_id,
                    verdict = %result.verdict,
                    passed = result.passed_count,
                    total = result.total_count,
                    "Submission judged"
                );
                (result.report(), Some(problem))
            }
            Err(e) => {
                error!(submission_id = %submission_id, "Judging failed, marking JUDGE_ERROR: {}", e);
                (judge_error_report(), None)
            }
        };

        let committed = self
            .with_retries("commit", submission_id, || {
                self.store.finish_submission(submission_id, &report, Utc::now())
            })
            .await;

        match committed {
            Ok(true) => {}
            Ok(false) => {
                warn!(submission_id = %submission_id, "Submission left RUNNING before commit");
                return JobOutcome::Skipped;
            }
            Err(e) => {
                // Stays RUNNING until the stale sweep fails it
                error!(submission_id = %submission_id, "Failed to commit verdict: {}", e);
                return JobOutcome::Skipped;
            }
        }

        let Some(problem) = problem else {
            JOBS_FAILED.inc();
            return JobOutcome::JudgeError;
        };

        JOBS_PROCESSED.inc();
        let verdict = report.status.verdict().unwrap_or(Verdict::RuntimeError);
        metrics::record_verdict(verdict);

        let applied = self
            .with_retries("stats", submission_id, || self.apply_stats(submission_id, problem))
            .await;
        if let Err(e) = applied {
            // Left with stats_applied = false for the stats sweep
            error!(submission_id = %submission_id, "Failed to apply statistics: {}", e);
        }

        JobOutcome::Judged(verdict)
    }

    /// One judging attempt: reload the records and run the judge.
    async fn attempt(&self, submission_id: SubmissionId) -> AppResult<(Problem, SubmissionResult)> {
        let submission = self.load_submission(submission_id).await?;
        let problem = self
            .store
            .get_problem(submission.problem_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("Problem {} not found", submission.problem_id))
            })?;

        let result = self.judge.judge(&submission, &problem).await?;
        Ok((problem, result))
    }

    async fn apply_stats(&self, submission_id: SubmissionId, problem: &Problem) -> AppResult<()> {
        let submission = self.load_submission(submission_id).await?;
        self.stats.apply_submission(&submission, problem).await?;
        Ok(())
    }

    async fn load_submission(&self, submission_id: SubmissionId) -> AppResult<Submission> {
        self.store
            .get_submission(submission_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Submission {} not found", submission_id)))
    }

    /// Run `op` until it succeeds, fails permanently or the budget is spent.
    async fn with_retries<T, F, Fut>(
        &self,
        step: &str,
        submission_id: SubmissionId,
        mut op: F,
    ) -> AppResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts() => {
                    let delay = self.retry.delay(attempt);
                    warn!(
                        submission_id = %submission_id,
                        step,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying after error: {}",
                        e
                    );
                    RETRIES.inc();
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

pub(crate) fn judge_error_report() -> FinalReport {
    FinalReport {
        status: SubmissionStatus::JudgeError,
        first_failing_test: None,
        max_time_ms: 0,
        peak_memory_kb: 0,
        judge_message: Some(JUDGE_ERROR_MESSAGE.to_string()),
    }
}

/// A worker task pulling from the shared queue
pub struct JudgeWorker {
    id: usize,
    queue: Arc<SubmissionQueue>,
    pipeline: Arc<Pipeline>,
}

impl JudgeWorker {
    pub fn new(id: usize, queue: Arc<SubmissionQueue>, pipeline: Arc<Pipeline>) -> Self {
        Self {
            id,
            queue,
            pipeline,
        }
    }

    /// Run the worker loop until the queue is closed.
    pub async fn run(self) {
        debug!(worker = self.id, "Judge worker started");

        while let Some(submission_id) = self.queue.pop().await {
            let outcome = self.pipeline.process(submission_id).await;
            debug!(worker = self.id, submission_id = %submission_id, ?outcome, "Job finished");
        }

        debug!(worker = self.id, "Judge worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::languages::Toolchains;
    use crate::sandbox::{MockSandbox, Outcome, Prepared, Program};
    use crate::store::testing::{CommitFailure, FailFirstCommit};
    use crate::store::InMemoryStore;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};
    use themis_common::{ComparisonMode, Difficulty, Language, NewSubmission, TestCase};
    use uuid::Uuid;

    struct Fixture {
        store: Arc<InMemoryStore>,
        problem: Problem,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(InMemoryStore::new());
            let problem = Problem {
                id: Uuid::new_v4(),
                title: "Two Sum".to_string(),
                difficulty: Difficulty::Easy,
                tags: vec!["array".to_string()],
                test_cases: vec![TestCase {
                    input: "4\n2 7 11 15\n9".to_string(),
                    expected_output: "0 1".to_string(),
                    is_public: true,
                    explanation: None,
                }],
                time_limit: 1000,
                memory_limit: 256,
                comparison_mode: ComparisonMode::Normalized,
                total_submissions: 0,
                successful_submissions: 0,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            };
            store.insert_problem(problem.clone()).unwrap();
            Self { store, problem }
        }

        async fn submit(&self, problem_id: Uuid) -> SubmissionId {
            let submission = Submission::pending(
                Uuid::new_v4(),
                NewSubmission {
                    user_id: Uuid::new_v4(),
                    problem_id,
                    contest_id: None,
                    language: "python".to_string(),
                    code: "print('0 1')".to_string(),
                },
                Utc::now(),
            );
            self.store.insert_submission(&submission).await.unwrap();
            submission.id
        }

        fn pipeline(&self, sandbox: MockSandbox) -> Pipeline {
            self.pipeline_on(self.store.clone(), sandbox)
        }

        fn pipeline_on(&self, store: Arc<dyn JudgeStore>, sandbox: MockSandbox) -> Pipeline {
            let judge = Judge::new(
                Arc::new(sandbox),
                Arc::new(Toolchains::builtin(&[Language::Python])),
                true,
            );
            let retry = RetryPolicy {
                max_retries: 2,
                base_delay_ms: 1,
                max_delay_ms: 2,
            };
            Pipeline::new(store, judge, retry)
        }

        async fn status(&self, id: SubmissionId) -> Submission {
            self.store.get_submission(id).await.unwrap().unwrap()
        }
    }

    fn sandbox_with_runs<F>(run: F) -> MockSandbox
    where
        F: Fn() -> AppResult<Outcome> + Send + 'static,
    {
        let mut sandbox = MockSandbox::new();
        sandbox.expect_prepare().returning(|id, _, _| {
            Ok(Prepared::Ready(Program::new(
                id,
                Path::new("/nonexistent"),
                vec!["python3".to_string()],
            )))
        });
        sandbox.expect_run().returning(move |_, _, _| run());
        sandbox
    }

    #[tokio::test]
    async fn test_accepted_submission_updates_stats() {
        let fixture = Fixture::new();
        let id = fixture.submit(fixture.problem.id).await;
        let pipeline =
            fixture.pipeline(sandbox_with_runs(|| Ok(Outcome::success("0 1\n", 10, 4096))));

        assert_eq!(pipeline.process(id).await, JobOutcome::Judged(Verdict::Accepted));

        let submission = fixture.status(id).await;
        assert_eq!(submission.status, SubmissionStatus::Accepted);
        assert!(submission.stats_applied);
        assert_eq!(submission.max_time_ms, Some(10));

        let counters = fixture.store.problem_counters(fixture.problem.id).unwrap().unwrap();
        assert_eq!(counters.total_submissions, 1);
        assert_eq!(counters.successful_submissions, 1);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let fixture = Fixture::new();
        let id = fixture.submit(fixture.problem.id).await;
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let pipeline = fixture.pipeline(sandbox_with_runs(move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(AppError::SandboxError("pipe closed".to_string()))
            } else {
                Ok(Outcome::success("0 1", 10, 4096))
            }
        }));

        assert_eq!(pipeline.process(id).await, JobOutcome::Judged(Verdict::Accepted));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_stats_commit_is_retried() {
        let fixture = Fixture::new();
        let id = fixture.submit(fixture.problem.id).await;
        let flaky = Arc::new(FailFirstCommit::new(
            fixture.store.clone(),
            CommitFailure::BeforeWrite,
        ));
        let pipeline = fixture.pipeline_on(
            flaky,
            sandbox_with_runs(|| Ok(Outcome::success("0 1", 10, 4096))),
        );

        assert_eq!(pipeline.process(id).await, JobOutcome::Judged(Verdict::Accepted));
        assert!(fixture.status(id).await.stats_applied);
        let counters = fixture.store.problem_counters(fixture.problem.id).unwrap().unwrap();
        assert_eq!(counters.total_submissions, 1);
    }

    #[tokio::test]
    async fn test_lost_stats_acknowledgement_counts_once() {
        let fixture = Fixture::new();
        let id = fixture.submit(fixture.problem.id).await;
        let user_id = fixture.status(id).await.user_id;
        let flaky = Arc::new(FailFirstCommit::new(
            fixture.store.clone(),
            CommitFailure::AfterWrite,
        ));
        let pipeline = fixture.pipeline_on(
            flaky,
            sandbox_with_runs(|| Ok(Outcome::success("0 1", 10, 4096))),
        );

        assert_eq!(pipeline.process(id).await, JobOutcome::Judged(Verdict::Accepted));
        let counters = fixture.store.problem_counters(fixture.problem.id).unwrap().unwrap();
        assert_eq!(counters.total_submissions, 1);
        assert_eq!(counters.successful_submissions, 1);
        assert_eq!(fixture.store.user_stats(user_id).unwrap().total_solved, 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_end_in_judge_error_without_stats() {
        let fixture = Fixture::new();
        let id = fixture.submit(fixture.problem.id).await;
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let pipeline = fixture.pipeline(sandbox_with_runs(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(AppError::SandboxError("executor crashed".to_string()))
        }));

        assert_eq!(pipeline.process(id).await, JobOutcome::JudgeError);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let submission = fixture.status(id).await;
        assert_eq!(submission.status, SubmissionStatus::JudgeError);
        assert_eq!(submission.judge_message.as_deref(), Some(JUDGE_ERROR_MESSAGE));
        assert!(!submission.stats_applied);

        let counters = fixture.store.problem_counters(fixture.problem.id).unwrap().unwrap();
        assert_eq!(counters.total_submissions, 0);
    }

    #[tokio::test]
    async fn test_missing_problem_fails_without_retry() {
        let fixture = Fixture::new();
        let id = fixture.submit(Uuid::new_v4()).await;
        let mut sandbox = MockSandbox::new();
        sandbox.expect_prepare().never();

        assert_eq!(fixture.pipeline(sandbox).process(id).await, JobOutcome::JudgeError);
        assert_eq!(fixture.status(id).await.status, SubmissionStatus::JudgeError);
    }

    #[tokio::test]
    async fn test_cancelled_submission_is_skipped() {
        let fixture = Fixture::new();
        let id = fixture.submit(fixture.problem.id).await;
        fixture.store.cancel_submission(id, Utc::now()).await.unwrap();
        let mut sandbox = MockSandbox::new();
        sandbox.expect_prepare().never();

        assert_eq!(fixture.pipeline(sandbox).process(id).await, JobOutcome::Skipped);
        assert_eq!(fixture.status(id).await.status, SubmissionStatus::Cancelled);
    }
}
