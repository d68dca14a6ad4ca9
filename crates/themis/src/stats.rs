//! Aggregate statistics updates
//!
//! Problem counters and user stats are only written through an optimistic
//! compare-and-swap loop keyed by the document versions, so concurrent
//! submissions to the same problem (or by the same user) never lose an
//! increment. Each swap also sets the submission's `stats_applied` flag, so
//! re-applying a submission after a partial failure cannot count it twice.

use std::sync::Arc;

use themis_common::{AppError, AppResult, Difficulty, Problem, Submission, UserId, Verdict};
use tracing::{debug, info};

use crate::constants::STATS_CAS_ATTEMPTS;
use crate::metrics;
use crate::store::{CommitOutcome, JudgeStore, SolverUpdate, StatsCommit};

/// What a first accepted solve contributes to the user's stats
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolveRecord {
    pub difficulty: Difficulty,
    /// Judged submissions up to and including the accepted one
    pub attempts: u32,
    /// Seconds from the first submission to the accepted one
    pub seconds: f64,
}

/// Applies the side effects of one terminal submission
#[derive(Clone)]
pub struct StatisticsUpdater {
    store: Arc<dyn JudgeStore>,
    max_attempts: u32,
}

impl StatisticsUpdater {
    pub fn new(store: Arc<dyn JudgeStore>) -> Self {
        Self {
            store,
            max_attempts: STATS_CAS_ATTEMPTS,
        }
    }

    /// Apply one verdict to the problem counters and, for a first accept,
    /// the user's stats.
    ///
    /// The counters, the user's stats and the submission's `stats_applied`
    /// flag are committed together, so a submission is counted at most once
    /// however often this is called for it. Returns false when its
    /// statistics were already applied.
    pub async fn apply(
        &self,
        submission: &Submission,
        verdict: Verdict,
        first_accept: Option<SolveRecord>,
    ) -> AppResult<bool> {
        let accepted = verdict.is_accepted();
        let solve = first_accept.filter(|_| accepted);

        for _ in 0..self.max_attempts {
            let current = self.store.load_problem_counters(submission.problem_id).await?;
            let solver = match solve {
                Some(record) => Some(self.next_user_stats(submission.user_id, record).await?),
                None => None,
            };
            let commit = StatsCommit {
                submission_id: submission.id,
                problem_id: submission.problem_id,
                expected_version: current.version,
                counters: current.value.record(accepted),
                solver,
            };

            match self.store.commit_stats(&commit).await? {
                CommitOutcome::Committed => {
                    debug!(
                        problem_id = %submission.problem_id,
                        total = commit.counters.total_submissions,
                        successful = commit.counters.successful_submissions,
                        "Problem counters updated"
                    );
                    if let Some(update) = &commit.solver {
                        debug!(
                            user_id = %update.user_id,
                            total_solved = update.stats.total_solved,
                            "User stats updated"
                        );
                    }
                    return Ok(true);
                }
                CommitOutcome::AlreadyApplied => return Ok(false),
                CommitOutcome::Stale => {
                    metrics::STATS_CONFLICTS.inc();
                    tokio::task::yield_now().await;
                }
            }
        }

        Err(AppError::Conflict(format!(
            "Statistics of submission {} still contended after {} attempts",
            submission.id, self.max_attempts
        )))
    }

    /// Apply the statistics of a terminal submission.
    ///
    /// Submissions without a verdict (JUDGE_ERROR, CANCELLED) and those
    /// already applied are skipped. Returns whether anything was applied.
    pub async fn apply_submission(&self, submission: &Submission, problem: &Problem) -> AppResult<bool> {
        let Some(verdict) = submission.verdict() else {
            return Ok(false);
        };
        if submission.stats_applied {
            return Ok(false);
        }

        let first_accept = if verdict.is_accepted() {
            self.first_accept(submission, problem.difficulty).await?
        } else {
            None
        };

        let applied = self.apply(submission, verdict, first_accept).await?;
        if applied {
            info!(
                submission_id = %submission.id,
                verdict = %verdict,
                first_solve = first_accept.is_some(),
                "Statistics applied"
            );
        }
        Ok(applied)
    }

    async fn first_accept(
        &self,
        submission: &Submission,
        difficulty: Difficulty,
    ) -> AppResult<Option<SolveRecord>> {
        let first = self
            .store
            .claim_first_solve(submission.user_id, submission.problem_id, submission.id)
            .await?;
        if !first {
            return Ok(None);
        }

        let summary = self.store.attempt_summary(submission).await?;
        Ok(Some(SolveRecord {
            difficulty,
            attempts: summary.attempts,
            seconds: summary.seconds_until(submission.submitted_at),
        }))
    }

    async fn next_user_stats(&self, user_id: UserId, record: SolveRecord) -> AppResult<SolverUpdate> {
        let current = self.store.load_user_stats(user_id).await?;
        let mut stats = current.value;
        stats.record_solve(record.difficulty, record.attempts, record.seconds);
        Ok(SolverUpdate {
            user_id,
            expected_version: current.version,
            stats,
        })
    }
}
