//! In-process store for tests and embedding

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use themis_common::{
    AppError, AppResult, FinalReport, Problem, ProblemCounters, ProblemId, Submission,
    SubmissionId, SubmissionStatus, UserId, UserStats, Versioned,
};

use super::{counts_as_attempt, AttemptSummary, CommitOutcome, JudgeStore, StatsCommit};

#[derive(Debug, Default)]
struct State {
    /// Problem documents and the version of their counters
    problems: HashMap<ProblemId, (Problem, i64)>,
    submissions: HashMap<SubmissionId, Submission>,
    user_stats: HashMap<UserId, Versioned<UserStats>>,
    /// Submission holding each user's first solve of a problem
    solved: HashMap<(UserId, ProblemId), SubmissionId>,
}

/// [`JudgeStore`] held entirely in memory
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a problem in the catalog.
    pub fn insert_problem(&self, problem: Problem) -> AppResult<()> {
        self.lock()?.problems.insert(problem.id, (problem, 0));
        Ok(())
    }

    /// Current counters of a problem.
    pub fn problem_counters(&self, id: ProblemId) -> AppResult<Option<ProblemCounters>> {
        Ok(self.lock()?.problems.get(&id).map(|(p, _)| p.counters()))
    }

    /// Current stats of a user.
    pub fn user_stats(&self, user_id: UserId) -> AppResult<UserStats> {
        Ok(self
            .lock()?
            .user_stats
            .get(&user_id)
            .map(|v| v.value.clone())
            .unwrap_or_default())
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| AppError::InternalError("In-memory store lock poisoned".to_string()))
    }

    /// Apply `update` if the submission is currently in `from`.
    fn transition<F>(&self, id: SubmissionId, from: SubmissionStatus, update: F) -> AppResult<bool>
    where
        F: FnOnce(&mut Submission),
    {
        let mut state = self.lock()?;
        let submission = state
            .submissions
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("Submission {} not found", id)))?;

        if submission.status != from {
            return Ok(false);
        }
        update(submission);
        Ok(true)
    }

    fn select<P>(&self, predicate: P) -> AppResult<Vec<Submission>>
    where
        P: Fn(&Submission) -> bool,
    {
        let state = self.lock()?;
        let mut matching: Vec<Submission> = state
            .submissions
            .values()
            .filter(|s| predicate(s))
            .cloned()
            .collect();
        matching.sort_by_key(|s| s.submitted_at);
        Ok(matching)
    }
}

#[async_trait]
impl JudgeStore for InMemoryStore {
    async fn get_problem(&self, id: ProblemId) -> AppResult<Option<Problem>> {
        Ok(self.lock()?.problems.get(&id).map(|(p, _)| p.clone()))
    }

    async fn insert_submission(&self, submission: &Submission) -> AppResult<()> {
        let mut state = self.lock()?;
        if state.submissions.contains_key(&submission.id) {
            return Err(AppError::Conflict(format!(
                "Submission {} already exists",
                submission.id
            )));
        }
        state.submissions.insert(submission.id, submission.clone());
        Ok(())
    }

    async fn get_submission(&self, id: SubmissionId) -> AppResult<Option<Submission>> {
        Ok(self.lock()?.submissions.get(&id).cloned())
    }

    async fn claim_submission(
        &self,
        id: SubmissionId,
        started_at: DateTime<Utc>,
    ) -> AppResult<bool> {
        self.transition(id, SubmissionStatus::Pending, |s| {
            s.status = SubmissionStatus::Running;
            s.started_at = Some(started_at);
        })
    }

    async fn finish_submission(
        &self,
        id: SubmissionId,
        report: &FinalReport,
        judged_at: DateTime<Utc>,
    ) -> AppResult<bool> {
        if !SubmissionStatus::Running.can_transition_to(report.status) {
            return Err(AppError::ValidationError(format!(
                "Cannot finish a submission as {}",
                report.status
            )));
        }
        self.transition(id, SubmissionStatus::Running, |s| {
            s.status = report.status;
            s.judged_at = Some(judged_at);
            s.first_failing_test = report.first_failing_test;
            s.max_time_ms = Some(report.max_time_ms);
            s.peak_memory_kb = Some(report.peak_memory_kb);
            s.judge_message = report.judge_message.clone();
        })
    }

    async fn cancel_submission(&self, id: SubmissionId, at: DateTime<Utc>) -> AppResult<bool> {
        self.transition(id, SubmissionStatus::Pending, |s| {
            s.status = SubmissionStatus::Cancelled;
            s.judged_at = Some(at);
        })
    }

    async fn list_by_status(
        &self,
        status: SubmissionStatus,
        limit: usize,
    ) -> AppResult<Vec<Submission>> {
        let mut matching = self.select(|s| s.status == status)?;
        matching.truncate(limit);
        Ok(matching)
    }

    async fn list_stale_running(
        &self,
        started_before: DateTime<Utc>,
    ) -> AppResult<Vec<Submission>> {
        self.select(|s| {
            s.status == SubmissionStatus::Running
                && s.started_at.is_none_or(|at| at < started_before)
        })
    }

    async fn list_unapplied_stats(&self, limit: usize) -> AppResult<Vec<Submission>> {
        let mut matching = self.select(|s| counts_as_attempt(s.status) && !s.stats_applied)?;
        matching.truncate(limit);
        Ok(matching)
    }

    async fn load_problem_counters(
        &self,
        id: ProblemId,
    ) -> AppResult<Versioned<ProblemCounters>> {
        self.lock()?
            .problems
            .get(&id)
            .map(|(problem, version)| Versioned {
                value: problem.counters(),
                version: *version,
            })
            .ok_or_else(|| AppError::NotFound(format!("Problem {} not found", id)))
    }

    async fn load_user_stats(&self, user_id: UserId) -> AppResult<Versioned<UserStats>> {
        Ok(self
            .lock()?
            .user_stats
            .get(&user_id)
            .cloned()
            .unwrap_or(Versioned {
                value: UserStats::default(),
                version: 0,
            }))
    }

    async fn commit_stats(&self, commit: &StatsCommit) -> AppResult<CommitOutcome> {
        let mut state = self.lock()?;
        let applied = state
            .submissions
            .get(&commit.submission_id)
            .map(|s| s.stats_applied)
            .ok_or_else(|| {
                AppError::NotFound(format!("Submission {} not found", commit.submission_id))
            })?;
        if applied {
            return Ok(CommitOutcome::AlreadyApplied);
        }

        let problem_version = state
            .problems
            .get(&commit.problem_id)
            .map(|(_, version)| *version)
            .ok_or_else(|| AppError::NotFound(format!("Problem {} not found", commit.problem_id)))?;
        if problem_version != commit.expected_version {
            return Ok(CommitOutcome::Stale);
        }
        if let Some(solver) = &commit.solver {
            let current = state.user_stats.get(&solver.user_id).map_or(0, |v| v.version);
            if current != solver.expected_version {
                return Ok(CommitOutcome::Stale);
            }
        }

        // Every check passed; the writes below cannot fail
        if let Some((problem, version)) = state.problems.get_mut(&commit.problem_id) {
            problem.total_submissions = commit.counters.total_submissions;
            problem.successful_submissions = commit.counters.successful_submissions;
            problem.updated_at = Utc::now();
            *version += 1;
        }
        if let Some(solver) = &commit.solver {
            state.user_stats.insert(
                solver.user_id,
                Versioned {
                    value: solver.stats.clone(),
                    version: solver.expected_version + 1,
                },
            );
        }
        if let Some(submission) = state.submissions.get_mut(&commit.submission_id) {
            submission.stats_applied = true;
        }
        Ok(CommitOutcome::Committed)
    }

    async fn claim_first_solve(
        &self,
        user_id: UserId,
        problem_id: ProblemId,
        submission_id: SubmissionId,
    ) -> AppResult<bool> {
        let mut state = self.lock()?;
        let holder = *state
            .solved
            .entry((user_id, problem_id))
            .or_insert(submission_id);
        Ok(holder == submission_id)
    }

    async fn attempt_summary(&self, accepted: &Submission) -> AppResult<AttemptSummary> {
        let attempts = self.select(|s| {
            s.user_id == accepted.user_id
                && s.problem_id == accepted.problem_id
                && counts_as_attempt(s.status)
                && s.submitted_at <= accepted.submitted_at
        })?;

        Ok(AttemptSummary {
            attempts: (attempts.len() as u32).max(1),
            first_submitted_at: attempts
                .first()
                .map_or(accepted.submitted_at, |s| s.submitted_at),
        })
    }

    async fn problem_history(&self, problem_id: ProblemId) -> AppResult<Vec<Submission>> {
        self.select(|s| s.problem_id == problem_id)
    }

    async fn user_history(&self, user_id: UserId) -> AppResult<Vec<Submission>> {
        self.select(|s| s.user_id == user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use crate::store::SolverUpdate;
    use themis_common::NewSubmission;
    use uuid::Uuid;

    fn submission(user_id: UserId, problem_id: ProblemId, at: DateTime<Utc>) -> Submission {
        Submission::pending(
            Uuid::new_v4(),
            NewSubmission {
                user_id,
                problem_id,
                contest_id: None,
                language: "cpp".to_string(),
                code: "int main() {}".to_string(),
            },
            at,
        )
    }

    fn report(status: SubmissionStatus) -> FinalReport {
        FinalReport {
            status,
            first_failing_test: None,
            max_time_ms: 1,
            peak_memory_kb: 1,
            judge_message: None,
        }
    }

    #[tokio::test]
    async fn test_transitions_are_compare_and_set() {
        let store = InMemoryStore::new();
        let s = submission(Uuid::new_v4(), Uuid::new_v4(), Utc::now());
        store.insert_submission(&s).await.unwrap();

        assert!(store.claim_submission(s.id, Utc::now()).await.unwrap());
        assert!(!store.claim_submission(s.id, Utc::now()).await.unwrap());
        assert!(!store.cancel_submission(s.id, Utc::now()).await.unwrap());

        let done = report(SubmissionStatus::Accepted);
        assert!(store.finish_submission(s.id, &done, Utc::now()).await.unwrap());
        let again = report(SubmissionStatus::WrongAnswer);
        assert!(!store.finish_submission(s.id, &again, Utc::now()).await.unwrap());

        let stored = store.get_submission(s.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SubmissionStatus::Accepted);
        assert!(store.insert_submission(&s).await.is_err());
    }

    #[tokio::test]
    async fn test_stats_commit_is_versioned_and_applied_once() {
        let store = InMemoryStore::new();
        let problem = Problem {
            id: Uuid::new_v4(),
            title: "Echo".to_string(),
            difficulty: themis_common::Difficulty::Easy,
            tags: Vec::new(),
            test_cases: Vec::new(),
            time_limit: 1000,
            memory_limit: 64,
            comparison_mode: themis_common::ComparisonMode::Normalized,
            total_submissions: 0,
            successful_submissions: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.insert_problem(problem.clone()).unwrap();
        let user = Uuid::new_v4();
        let s = submission(user, problem.id, Utc::now());
        store.insert_submission(&s).await.unwrap();

        let stats = UserStats {
            total_solved: 1,
            ..UserStats::default()
        };
        let mut commit = StatsCommit {
            submission_id: s.id,
            problem_id: problem.id,
            expected_version: 1,
            counters: ProblemCounters::default().record(true),
            solver: Some(SolverUpdate {
                user_id: user,
                expected_version: 0,
                stats,
            }),
        };

        // Wrong problem version: nothing is written
        assert_eq!(store.commit_stats(&commit).await.unwrap(), CommitOutcome::Stale);
        assert_eq!(store.load_user_stats(user).await.unwrap().version, 0);
        assert!(!store.get_submission(s.id).await.unwrap().unwrap().stats_applied);

        commit.expected_version = 0;
        assert_eq!(store.commit_stats(&commit).await.unwrap(), CommitOutcome::Committed);
        assert_eq!(
            store.commit_stats(&commit).await.unwrap(),
            CommitOutcome::AlreadyApplied
        );

        let loaded = store.load_user_stats(user).await.unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.value.total_solved, 1);
        assert_eq!(store.load_problem_counters(problem.id).await.unwrap().version, 1);
        assert!(store.get_submission(s.id).await.unwrap().unwrap().stats_applied);
    }

    #[tokio::test]
    async fn test_first_solve_claimed_once() {
        let store = InMemoryStore::new();
        let (user, problem) = (Uuid::new_v4(), Uuid::new_v4());
        let first = Uuid::new_v4();
        assert!(store.claim_first_solve(user, problem, first).await.unwrap());
        assert!(!store.claim_first_solve(user, problem, Uuid::new_v4()).await.unwrap());
        // Re-applying the same submission keeps its claim
        assert!(store.claim_first_solve(user, problem, first).await.unwrap());
    }

    #[tokio::test]
    async fn test_attempt_summary_counts_judged_submissions() {
        let store = InMemoryStore::new();
        let (user, problem) = (Uuid::new_v4(), Uuid::new_v4());
        let start = Utc::now() - Duration::minutes(10);

        let wrong = submission(user, problem, start);
        let errored = submission(user, problem, start + Duration::minutes(1));
        let accepted = submission(user, problem, start + Duration::minutes(5));
        for (s, status) in [
            (&wrong, SubmissionStatus::WrongAnswer),
            (&errored, SubmissionStatus::JudgeError),
            (&accepted, SubmissionStatus::Accepted),
        ] {
            store.insert_submission(s).await.unwrap();
            store.claim_submission(s.id, Utc::now()).await.unwrap();
            store.finish_submission(s.id, &report(status), Utc::now()).await.unwrap();
        }

        let accepted = store.get_submission(accepted.id).await.unwrap().unwrap();
        let summary = store.attempt_summary(&accepted).await.unwrap();
        assert_eq!(summary.attempts, 2);
        assert_eq!(summary.first_submitted_at, start);
        assert!((summary.seconds_until(accepted.submitted_at) - 300.0).abs() < 1e-6);
    }
}
