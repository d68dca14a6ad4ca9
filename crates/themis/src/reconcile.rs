//! Reconciliation of incrementally maintained statistics
//!
//! Re-derives problem counters and user solved counts from submission
//! history and compares them with the stored aggregates. Only submissions
//! whose statistics were applied take part, so judgments in flight do not
//! show up as drift.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use themis_common::{
    AppResult, Difficulty, ProblemCounters, ProblemId, Submission, UserId, UserStats, Verdict,
};
use tracing::warn;

use crate::store::JudgeStore;

/// Stored versus derived counters of one problem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProblemReconciliation {
    pub problem_id: ProblemId,
    pub stored: ProblemCounters,
    pub derived: ProblemCounters,
}

impl ProblemReconciliation {
    pub fn is_consistent(&self) -> bool {
        self.stored == self.derived
    }
}

/// Solved-problem counts of a user
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SolvedCounts {
    pub total: u64,
    pub easy: u64,
    pub medium: u64,
    pub hard: u64,
}

impl SolvedCounts {
    fn of(stats: &UserStats) -> Self {
        Self {
            total: stats.total_solved,
            easy: stats.easy_problems_solved,
            medium: stats.medium_problems_solved,
            hard: stats.hard_problems_solved,
        }
    }

    fn add(&mut self, difficulty: Option<Difficulty>) {
        self.total += 1;
        match difficulty {
            Some(Difficulty::Easy) => self.easy += 1,
            Some(Difficulty::Medium) => self.medium += 1,
            Some(Difficulty::Hard) => self.hard += 1,
            None => {}
        }
    }
}

/// Stored versus derived solved counts of one user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserReconciliation {
    pub user_id: UserId,
    pub stored: SolvedCounts,
    pub derived: SolvedCounts,
}

impl UserReconciliation {
    pub fn is_consistent(&self) -> bool {
        self.stored == self.derived
    }
}

pub struct Reconciler {
    store: Arc<dyn JudgeStore>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn JudgeStore>) -> Self {
        Self { store }
    }

    /// Compare a problem's counters with its applied submission history.
    pub async fn check_problem(&self, problem_id: ProblemId) -> AppResult<ProblemReconciliation> {
        let stored = self.store.load_problem_counters(problem_id).await?.value;
        let derived = self
            .store
            .problem_history(problem_id)
            .await?
            .iter()
            .filter_map(applied_verdict)
            .fold(ProblemCounters::default(), |counters, verdict| {
                counters.record(verdict.is_accepted())
            });

        let report = ProblemReconciliation {
            problem_id,
            stored,
            derived,
        };
        if !report.is_consistent() {
            warn!(
                problem_id = %problem_id,
                stored_total = stored.total_submissions,
                derived_total = derived.total_submissions,
                stored_successful = stored.successful_submissions,
                derived_successful = derived.successful_submissions,
                "Problem counters drifted from history"
            );
        }
        Ok(report)
    }

    /// Compare a user's solved counts with the distinct problems they have
    /// an applied accepted submission for.
    pub async fn check_user(&self, user_id: UserId) -> AppResult<UserReconciliation> {
        let stored = SolvedCounts::of(&self.store.load_user_stats(user_id).await?.value);

        let solved: HashSet<ProblemId> = self
            .store
            .user_history(user_id)
            .await?
            .iter()
            .filter(|s| applied_verdict(s).is_some_and(|v| v.is_accepted()))
            .map(|s| s.problem_id)
            .collect();

        let mut difficulties: HashMap<ProblemId, Option<Difficulty>> = HashMap::new();
        for problem_id in &solved {
            let difficulty = self
                .store
                .get_problem(*problem_id)
                .await?
                .map(|p| p.difficulty);
            if difficulty.is_none() {
                warn!(problem_id = %problem_id, "Solved problem no longer exists");
            }
            difficulties.insert(*problem_id, difficulty);
        }

        let mut derived = SolvedCounts::default();
        for difficulty in difficulties.into_values() {
            derived.add(difficulty);
        }

        let report = UserReconciliation {
            user_id,
            stored,
            derived,
        };
        if !report.is_consistent() {
            warn!(
                user_id = %user_id,
                stored_total = stored.total,
                derived_total = derived.total,
                "User stats drifted from history"
            );
        }
        Ok(report)
    }
}

fn applied_verdict(submission: &Submission) -> Option<Verdict> {
    if submission.stats_applied {
        submission.verdict()
    } else {
        None
    }
}
