//! Documents read and written by the judging pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    ComparisonMode, ContestId, Difficulty, ProblemId, SubmissionId, SubmissionStatus, UserId,
    Verdict,
};

/// One (input, expected output) pair of a problem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    pub input: String,
    pub expected_output: String,
    /// Visible to contestants
    pub is_public: bool,
    pub explanation: Option<String>,
}

/// A problem as the catalog hands it to the judge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Problem {
    pub id: ProblemId,
    pub title: String,
    pub difficulty: Difficulty,
    pub tags: Vec<String>,
    /// Judged in this order
    pub test_cases: Vec<TestCase>,
    /// Milliseconds
    pub time_limit: u64,
    /// Megabytes
    pub memory_limit: u64,
    #[serde(default)]
    pub comparison_mode: ComparisonMode,
    pub total_submissions: u64,
    pub successful_submissions: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Problem {
    /// Snapshot of the denormalized counters.
    pub fn counters(&self) -> ProblemCounters {
        ProblemCounters {
            total_submissions: self.total_submissions,
            successful_submissions: self.successful_submissions,
        }
    }

    pub fn acceptance_rate(&self) -> f64 {
        self.counters().acceptance_rate()
    }
}

/// Aggregate submission counters of one problem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProblemCounters {
    pub total_submissions: u64,
    pub successful_submissions: u64,
}

impl ProblemCounters {
    /// Counters after one more judged submission.
    pub fn record(self, accepted: bool) -> Self {
        Self {
            total_submissions: self.total_submissions + 1,
            successful_submissions: self.successful_submissions + u64::from(accepted),
        }
    }

    /// Always derived from the two counters, 0 when nothing was submitted.
    pub fn acceptance_rate(&self) -> f64 {
        if self.total_submissions == 0 {
            0.0
        } else {
            self.successful_submissions as f64 / self.total_submissions as f64
        }
    }
}

/// Proficiency stats embedded in a user document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStats {
    pub total_solved: u64,
    pub easy_problems_solved: u64,
    pub medium_problems_solved: u64,
    pub hard_problems_solved: u64,
    pub average_attempts: f64,
    /// Seconds
    pub average_time_per_problem: f64,
    pub strong_tags: Vec<String>,
    pub weak_tags: Vec<String>,
}

impl UserStats {
    /// Fold a newly solved problem into the stats.
    ///
    /// Averages are running means over solved problems, so no per-problem
    /// history has to be kept.
    pub fn record_solve(&mut self, difficulty: Difficulty, attempts: u32, seconds_to_solve: f64) {
        self.total_solved += 1;
        match difficulty {
            Difficulty::Easy => self.easy_problems_solved += 1,
            Difficulty::Medium => self.medium_problems_solved += 1,
            Difficulty::Hard => self.hard_problems_solved += 1,
        }

        let n = self.total_solved as f64;
        self.average_attempts += (f64::from(attempts) - self.average_attempts) / n;
        self.average_time_per_problem += (seconds_to_solve - self.average_time_per_problem) / n;
    }

    pub fn solved_for(&self, difficulty: Difficulty) -> u64 {
        match difficulty {
            Difficulty::Easy => self.easy_problems_solved,
            Difficulty::Medium => self.medium_problems_solved,
            Difficulty::Hard => self.hard_problems_solved,
        }
    }
}

/// A value read together with the version it must be written back against.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: i64,
}

/// Submission as received from the API before intake.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSubmission {
    pub user_id: UserId,
    pub problem_id: ProblemId,
    /// Absent for practice submissions
    pub contest_id: Option<ContestId>,
    pub language: String,
    pub code: String,
}

/// A persisted submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub id: SubmissionId,
    pub user_id: UserId,
    pub problem_id: ProblemId,
    pub contest_id: Option<ContestId>,
    pub language: String,
    #[serde(skip_serializing)]
    pub code: String,
    pub status: SubmissionStatus,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub judged_at: Option<DateTime<Utc>>,
    /// Index into the problem's test cases, 0-based
    pub first_failing_test: Option<u32>,
    pub max_time_ms: Option<u64>,
    pub peak_memory_kb: Option<u64>,
    pub judge_message: Option<String>,
    /// Set once the statistics updater has committed for this submission
    pub stats_applied: bool,
}

impl Submission {
    /// Build the `PENDING` record for an accepted intake.
    pub fn pending(id: SubmissionId, new: NewSubmission, submitted_at: DateTime<Utc>) -> Self {
        Self {
            id,
            user_id: new.user_id,
            problem_id: new.problem_id,
            contest_id: new.contest_id,
            language: new.language,
            code: new.code,
            status: SubmissionStatus::Pending,
            submitted_at,
            started_at: None,
            judged_at: None,
            first_failing_test: None,
            max_time_ms: None,
            peak_memory_kb: None,
            judge_message: None,
            stats_applied: false,
        }
    }

    pub fn verdict(&self) -> Option<Verdict> {
        self.status.verdict()
    }

    pub fn is_contest(&self) -> bool {
        self.contest_id.is_some()
    }
}

/// Fields written when a submission reaches its terminal status.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalReport {
    pub status: SubmissionStatus,
    pub first_failing_test: Option<u32>,
    pub max_time_ms: u64,
    pub peak_memory_kb: u64,
    pub judge_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acceptance_rate() {
        let counters = ProblemCounters::default();
        assert_eq!(counters.acceptance_rate(), 0.0);

        let counters = counters.record(true).record(false).record(false).record(true);
        assert_eq!(counters.total_submissions, 4);
        assert_eq!(counters.successful_submissions, 2);
        assert!((counters.acceptance_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_running_means() {
        let mut stats = UserStats::default();
        stats.record_solve(Difficulty::Easy, 1, 60.0);
        stats.record_solve(Difficulty::Hard, 3, 180.0);
        stats.record_solve(Difficulty::Hard, 5, 300.0);

        assert_eq!(stats.total_solved, 3);
        assert_eq!(stats.easy_problems_solved, 1);
        assert_eq!(stats.hard_problems_solved, 2);
        assert!((stats.average_attempts - 3.0).abs() < 1e-9);
        assert!((stats.average_time_per_problem - 180.0).abs() < 1e-9);
    }

    #[test]
    fn test_problem_document_field_names() {
        let json = serde_json::json!({
            "id": "6f1c9c52-2a61-4bfc-9d62-8d8f6b0d2f10",
            "title": "Two Sum",
            "difficulty": "Easy",
            "tags": ["Array", "Hash Table"],
            "testCases": [{
                "input": "4\n2 7 11 15\n9",
                "expectedOutput": "0 1",
                "isPublic": true,
                "explanation": "nums[0] + nums[1] = 2 + 7 = 9"
            }],
            "timeLimit": 1000,
            "memoryLimit": 128,
            "totalSubmissions": 0,
            "successfulSubmissions": 0,
            "createdAt": "2024-01-01T00:00:00Z",
            "updatedAt": "2024-01-01T00:00:00Z"
        });

        let problem: Problem = serde_json::from_value(json).unwrap();
        assert_eq!(problem.comparison_mode, ComparisonMode::Normalized);
        assert_eq!(problem.test_cases[0].expected_output, "0 1");
        assert_eq!(problem.acceptance_rate(), 0.0);
    }
}
