//! Store wrappers that inject failures

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use themis_common::{
    AppError, AppResult, FinalReport, Problem, ProblemCounters, ProblemId, Submission,
    SubmissionId, SubmissionStatus, UserId, UserStats, Versioned,
};

use super::{AttemptSummary, CommitOutcome, InMemoryStore, JudgeStore, StatsCommit};

/// How the wrapped store fails its first stats commit
#[derive(Clone, Copy)]
pub enum CommitFailure {
    /// Error out before anything is written
    BeforeWrite,
    /// Write, then report an error as if the acknowledgement was lost
    AfterWrite,
}

/// Delegates to an [`InMemoryStore`] but fails the first `commit_stats`
pub struct FailFirstCommit {
    inner: Arc<InMemoryStore>,
    failure: CommitFailure,
    failed: AtomicBool,
}

impl FailFirstCommit {
    pub fn new(inner: Arc<InMemoryStore>, failure: CommitFailure) -> Self {
        Self {
            inner,
            failure,
            failed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl JudgeStore for FailFirstCommit {
    async fn get_problem(&self, id: ProblemId) -> AppResult<Option<Problem>> {
        self.inner.get_problem(id).await
    }
    async fn insert_submission(&self, submission: &Submission) -> AppResult<()> {
        self.inner.insert_submission(submission).await
    }
    async fn get_submission(&self, id: SubmissionId) -> AppResult<Option<Submission>> {
        self.inner.get_submission(id).await
    }
    async fn claim_submission(&self, id: SubmissionId, at: DateTime<Utc>) -> AppResult<bool> {
        self.inner.claim_submission(id, at).await
    }
    async fn finish_submission(
        &self,
        id: SubmissionId,
        report: &FinalReport,
        at: DateTime<Utc>,
    ) -> AppResult<bool> {
        self.inner.finish_submission(id, report, at).await
    }
    async fn cancel_submission(&self, id: SubmissionId, at: DateTime<Utc>) -> AppResult<bool> {
        self.inner.cancel_submission(id, at).await
    }
    async fn list_by_status(
        &self,
        status: SubmissionStatus,
        limit: usize,
    ) -> AppResult<Vec<Submission>> {
        self.inner.list_by_status(status, limit).await
    }
    async fn list_stale_running(&self, before: DateTime<Utc>) -> AppResult<Vec<Submission>> {
        self.inner.list_stale_running(before).await
    }
    async fn list_unapplied_stats(&self, limit: usize) -> AppResult<Vec<Submission>> {
        self.inner.list_unapplied_stats(limit).await
    }
    async fn load_problem_counters(
        &self,
        id: ProblemId,
    ) -> AppResult<Versioned<ProblemCounters>> {
        self.inner.load_problem_counters(id).await
    }
    async fn load_user_stats(&self, user_id: UserId) -> AppResult<Versioned<UserStats>> {
        self.inner.load_user_stats(user_id).await
    }
    async fn commit_stats(&self, commit: &StatsCommit) -> AppResult<CommitOutcome> {
        if self.failed.swap(true, Ordering::SeqCst) {
            return self.inner.commit_stats(commit).await;
        }
        if let CommitFailure::AfterWrite = self.failure {
            self.inner.commit_stats(commit).await?;
        }
        Err(AppError::DatabaseError("connection reset".to_string()))
    }
    async fn claim_first_solve(
        &self,
        user_id: UserId,
        problem_id: ProblemId,
        submission_id: SubmissionId,
    ) -> AppResult<bool> {
        self.inner
            .claim_first_solve(user_id, problem_id, submission_id)
            .await
    }
    async fn attempt_summary(&self, accepted: &Submission) -> AppResult<AttemptSummary> {
        self.inner.attempt_summary(accepted).await
    }
    async fn problem_history(&self, problem_id: ProblemId) -> AppResult<Vec<Submission>> {
        self.inner.problem_history(problem_id).await
    }
    async fn user_history(&self, user_id: UserId) -> AppResult<Vec<Submission>> {
        self.inner.user_history(user_id).await
    }
}
