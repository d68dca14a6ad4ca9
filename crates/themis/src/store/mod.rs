//! Persistence seam of the judging pipeline
//!
//! Every status transition is a compare-and-set on the current status, so
//! a submission can only ever be claimed once and finished once. Aggregate
//! documents (problem counters, user stats) carry a version and are only
//! written back against the version they were read at.

mod memory;
mod postgres;
#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use themis_common::{
    AppResult, FinalReport, Problem, ProblemCounters, ProblemId, Submission, SubmissionId,
    SubmissionStatus, UserId, UserStats, Versioned,
};

pub use memory::InMemoryStore;
pub use postgres::PgStore;

/// A user's judged attempts on one problem, up to an accepted submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptSummary {
    /// Judged submissions, the accepted one included
    pub attempts: u32,
    pub first_submitted_at: DateTime<Utc>,
}

impl AttemptSummary {
    /// Seconds from the first attempt until `solved_at`.
    pub fn seconds_until(&self, solved_at: DateTime<Utc>) -> f64 {
        (solved_at - self.first_submitted_at).num_milliseconds().max(0) as f64 / 1000.0
    }
}

/// Next stats of a user whose first solve is being recorded
#[derive(Debug, Clone, PartialEq)]
pub struct SolverUpdate {
    pub user_id: UserId,
    pub expected_version: i64,
    pub stats: UserStats,
}

/// Everything one judged submission changes in the aggregates
#[derive(Debug, Clone, PartialEq)]
pub struct StatsCommit {
    pub submission_id: SubmissionId,
    pub problem_id: ProblemId,
    pub expected_version: i64,
    pub counters: ProblemCounters,
    pub solver: Option<SolverUpdate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// A document moved on since it was read; nothing was written
    Stale,
    /// The submission's statistics were committed earlier
    AlreadyApplied,
}

/// Storage operations the pipeline needs from its collaborators
#[async_trait]
pub trait JudgeStore: Send + Sync {
    /// Problem with its test cases.
    async fn get_problem(&self, id: ProblemId) -> AppResult<Option<Problem>>;

    async fn insert_submission(&self, submission: &Submission) -> AppResult<()>;

    async fn get_submission(&self, id: SubmissionId) -> AppResult<Option<Submission>>;

    /// `PENDING -> RUNNING`. Returns false if the submission was not pending.
    async fn claim_submission(&self, id: SubmissionId, started_at: DateTime<Utc>)
        -> AppResult<bool>;

    /// `RUNNING -> terminal`. Returns false if the submission was not running.
    async fn finish_submission(
        &self,
        id: SubmissionId,
        report: &FinalReport,
        judged_at: DateTime<Utc>,
    ) -> AppResult<bool>;

    /// `PENDING -> CANCELLED`. Returns false if the submission was not pending.
    async fn cancel_submission(&self, id: SubmissionId, at: DateTime<Utc>) -> AppResult<bool>;

    /// Submissions with `status`, oldest first.
    async fn list_by_status(&self, status: SubmissionStatus, limit: usize)
        -> AppResult<Vec<Submission>>;

    /// RUNNING submissions started before `started_before`.
    async fn list_stale_running(&self, started_before: DateTime<Utc>)
        -> AppResult<Vec<Submission>>;

    /// Judged submissions whose statistics were never committed.
    async fn list_unapplied_stats(&self, limit: usize) -> AppResult<Vec<Submission>>;

    /// `NotFound` when the problem does not exist.
    async fn load_problem_counters(&self, id: ProblemId)
        -> AppResult<Versioned<ProblemCounters>>;

    /// Stats of a user without any are the default at version 0.
    async fn load_user_stats(&self, user_id: UserId) -> AppResult<Versioned<UserStats>>;

    /// Write a submission's statistics and set its `stats_applied` flag as
    /// one unit.
    ///
    /// Nothing is written unless the flag is still clear and every document
    /// in the commit is still at the version it was read at.
    async fn commit_stats(&self, commit: &StatsCommit) -> AppResult<CommitOutcome>;

    /// Record that the user solved the problem with `submission_id`.
    ///
    /// True when this submission holds the first solve, whether the record
    /// was created now or by an earlier call for the same submission.
    async fn claim_first_solve(
        &self,
        user_id: UserId,
        problem_id: ProblemId,
        submission_id: SubmissionId,
    ) -> AppResult<bool>;

    /// Judged attempts of the submission's author on its problem, up to and
    /// including the submission itself.
    async fn attempt_summary(&self, accepted: &Submission) -> AppResult<AttemptSummary>;

    /// All submissions to a problem.
    async fn problem_history(&self, problem_id: ProblemId) -> AppResult<Vec<Submission>>;

    /// All submissions of a user.
    async fn user_history(&self, user_id: UserId) -> AppResult<Vec<Submission>>;
}

/// A judged status carries a verdict; JUDGE_ERROR and CANCELLED do not.
pub(crate) fn counts_as_attempt(status: SubmissionStatus) -> bool {
    status.verdict().is_some()
}
