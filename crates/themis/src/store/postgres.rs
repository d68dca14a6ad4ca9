//! PostgreSQL-backed store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, Postgres};
use sqlx::Transaction;
use sqlx::types::Json;
use themis_common::{
    AppError, AppResult, FinalReport, Problem, ProblemCounters, ProblemId, Submission,
    SubmissionId, SubmissionStatus, TestCase, UserId, UserStats, Versioned,
};
use uuid::Uuid;

use super::{
    counts_as_attempt, AttemptSummary, CommitOutcome, JudgeStore, SolverUpdate, StatsCommit,
};

macro_rules! select_submissions {
    ($tail:literal) => {
        concat!(
            "SELECT id, user_id, problem_id, contest_id, language, code, status, ",
            "submitted_at, started_at, judged_at, first_failing_test, max_time_ms, ",
            "peak_memory_kb, judge_message, stats_applied FROM submissions ",
            $tail
        )
    };
}

#[derive(Debug, sqlx::FromRow)]
struct ProblemRow {
    id: Uuid,
    title: String,
    difficulty: String,
    tags: Vec<String>,
    test_cases: Json<Vec<TestCase>>,
    time_limit_ms: i64,
    memory_limit_mb: i64,
    comparison_mode: String,
    total_submissions: i64,
    successful_submissions: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ProblemRow> for Problem {
    type Error = AppError;

    fn try_from(row: ProblemRow) -> Result<Self, Self::Error> {
        Ok(Problem {
            id: row.id,
            title: row.title,
            difficulty: row.difficulty.parse().map_err(corrupt)?,
            tags: row.tags,
            test_cases: row.test_cases.0,
            time_limit: row.time_limit_ms as u64,
            memory_limit: row.memory_limit_mb as u64,
            comparison_mode: row.comparison_mode.parse().map_err(corrupt)?,
            total_submissions: row.total_submissions as u64,
            successful_submissions: row.successful_submissions as u64,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SubmissionRow {
    id: Uuid,
    user_id: Uuid,
    problem_id: Uuid,
    contest_id: Option<Uuid>,
    language: String,
    code: String,
    status: String,
    submitted_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    judged_at: Option<DateTime<Utc>>,
    first_failing_test: Option<i32>,
    max_time_ms: Option<i64>,
    peak_memory_kb: Option<i64>,
    judge_message: Option<String>,
    stats_applied: bool,
}

impl TryFrom<SubmissionRow> for Submission {
    type Error = AppError;

    fn try_from(row: SubmissionRow) -> Result<Self, Self::Error> {
        Ok(Submission {
            id: row.id,
            user_id: row.user_id,
            problem_id: row.problem_id,
            contest_id: row.contest_id,
            language: row.language,
            code: row.code,
            status: row.status.parse().map_err(corrupt)?,
            submitted_at: row.submitted_at,
            started_at: row.started_at,
            judged_at: row.judged_at,
            first_failing_test: row.first_failing_test.map(|i| i as u32),
            max_time_ms: row.max_time_ms.map(|v| v as u64),
            peak_memory_kb: row.peak_memory_kb.map(|v| v as u64),
            judge_message: row.judge_message,
            stats_applied: row.stats_applied,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct UserStatsRow {
    total_solved: i64,
    easy_problems_solved: i64,
    medium_problems_solved: i64,
    hard_problems_solved: i64,
    average_attempts: f64,
    average_time_per_problem: f64,
    strong_tags: Vec<String>,
    weak_tags: Vec<String>,
    version: i64,
}

impl From<UserStatsRow> for Versioned<UserStats> {
    fn from(row: UserStatsRow) -> Self {
        Versioned {
            value: UserStats {
                total_solved: row.total_solved as u64,
                easy_problems_solved: row.easy_problems_solved as u64,
                medium_problems_solved: row.medium_problems_solved as u64,
                hard_problems_solved: row.hard_problems_solved as u64,
                average_attempts: row.average_attempts,
                average_time_per_problem: row.average_time_per_problem,
                strong_tags: row.strong_tags,
                weak_tags: row.weak_tags,
            },
            version: row.version,
        }
    }
}

fn corrupt(e: impl std::fmt::Display) -> AppError {
    AppError::DatabaseError(format!("Corrupt row: {}", e))
}

fn judged_statuses() -> Vec<String> {
    SubmissionStatus::ALL
        .iter()
        .filter(|status| counts_as_attempt(**status))
        .map(|status| status.as_str().to_string())
        .collect()
}

fn into_submissions(rows: Vec<SubmissionRow>) -> AppResult<Vec<Submission>> {
    rows.into_iter().map(Submission::try_from).collect()
}

/// Versioned write of one user's stats inside `tx`; returns rows affected.
async fn write_user_stats(
    tx: &mut Transaction<'_, Postgres>,
    solver: &SolverUpdate,
) -> AppResult<u64> {
    // Version 0 means "no row yet"
    let query = if solver.expected_version == 0 {
        r#"
        INSERT INTO user_stats
            (user_id, total_solved, easy_problems_solved, medium_problems_solved,
             hard_problems_solved, average_attempts, average_time_per_problem,
             strong_tags, weak_tags, version)
        VALUES ($1, $3, $4, $5, $6, $7, $8, $9, $10, $2 + 1)
        ON CONFLICT (user_id) DO NOTHING
        "#
    } else {
        r#"
        UPDATE user_stats
        SET total_solved = $3,
            easy_problems_solved = $4,
            medium_problems_solved = $5,
            hard_problems_solved = $6,
            average_attempts = $7,
            average_time_per_problem = $8,
            strong_tags = $9,
            weak_tags = $10,
            version = version + 1
        WHERE user_id = $1 AND version = $2
        "#
    };

    let stats = &solver.stats;
    let result = sqlx::query(query)
        .bind(solver.user_id)
        .bind(solver.expected_version)
        .bind(stats.total_solved as i64)
        .bind(stats.easy_problems_solved as i64)
        .bind(stats.medium_problems_solved as i64)
        .bind(stats.hard_problems_solved as i64)
        .bind(stats.average_attempts)
        .bind(stats.average_time_per_problem)
        .bind(&stats.strong_tags)
        .bind(&stats.weak_tags)
        .execute(&mut **tx)
        .await?;
    Ok(result.rows_affected())
}

/// [`JudgeStore`] on PostgreSQL
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a pool to `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> AppResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Apply the bundled migrations.
    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JudgeStore for PgStore {
    async fn get_problem(&self, id: ProblemId) -> AppResult<Option<Problem>> {
        let row = sqlx::query_as::<_, ProblemRow>(
            r#"
            SELECT id, title, difficulty, tags, test_cases, time_limit_ms, memory_limit_mb,
                   comparison_mode, total_submissions, successful_submissions,
                   created_at, updated_at
            FROM problems
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Problem::try_from).transpose()
    }

    async fn insert_submission(&self, submission: &Submission) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO submissions
                (id, user_id, problem_id, contest_id, language, code, status, submitted_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(submission.id)
        .bind(submission.user_id)
        .bind(submission.problem_id)
        .bind(submission.contest_id)
        .bind(&submission.language)
        .bind(&submission.code)
        .bind(submission.status.as_str())
        .bind(submission.submitted_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_submission(&self, id: SubmissionId) -> AppResult<Option<Submission>> {
        let row = sqlx::query_as::<_, SubmissionRow>(select_submissions!("WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Submission::try_from).transpose()
    }

    async fn claim_submission(
        &self,
        id: SubmissionId,
        started_at: DateTime<Utc>,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE submissions SET status = 'RUNNING', started_at = $2 \
             WHERE id = $1 AND status = 'PENDING'",
        )
        .bind(id)
        .bind(started_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
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

        let result = sqlx::query(
            r#"
            UPDATE submissions
            SET status = $2,
                judged_at = $3,
                first_failing_test = $4,
                max_time_ms = $5,
                peak_memory_kb = $6,
                judge_message = $7
            WHERE id = $1 AND status = 'RUNNING'
            "#,
        )
        .bind(id)
        .bind(report.status.as_str())
        .bind(judged_at)
        .bind(report.first_failing_test.map(|i| i as i32))
        .bind(report.max_time_ms as i64)
        .bind(report.peak_memory_kb as i64)
        .bind(&report.judge_message)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn cancel_submission(&self, id: SubmissionId, at: DateTime<Utc>) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE submissions SET status = 'CANCELLED', judged_at = $2 \
             WHERE id = $1 AND status = 'PENDING'",
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_by_status(
        &self,
        status: SubmissionStatus,
        limit: usize,
    ) -> AppResult<Vec<Submission>> {
        let rows = sqlx::query_as::<_, SubmissionRow>(select_submissions!(
            "WHERE status = $1 ORDER BY submitted_at ASC LIMIT $2"
        ))
        .bind(status.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        into_submissions(rows)
    }

    async fn list_stale_running(
        &self,
        started_before: DateTime<Utc>,
    ) -> AppResult<Vec<Submission>> {
        let rows = sqlx::query_as::<_, SubmissionRow>(select_submissions!(
            "WHERE status = 'RUNNING' AND (started_at IS NULL OR started_at < $1) \
             ORDER BY submitted_at ASC"
        ))
        .bind(started_before)
        .fetch_all(&self.pool)
        .await?;
        into_submissions(rows)
    }

    async fn list_unapplied_stats(&self, limit: usize) -> AppResult<Vec<Submission>> {
        let rows = sqlx::query_as::<_, SubmissionRow>(select_submissions!(
            "WHERE stats_applied = FALSE AND status = ANY($1) \
             ORDER BY submitted_at ASC LIMIT $2"
        ))
        .bind(judged_statuses())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        into_submissions(rows)
    }

    async fn load_problem_counters(
        &self,
        id: ProblemId,
    ) -> AppResult<Versioned<ProblemCounters>> {
        let (total, successful, version) = sqlx::query_as::<_, (i64, i64, i64)>(
            "SELECT total_submissions, successful_submissions, counters_version \
             FROM problems WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Problem {} not found", id)))?;

        Ok(Versioned {
            value: ProblemCounters {
                total_submissions: total as u64,
                successful_submissions: successful as u64,
            },
            version,
        })
    }

    async fn load_user_stats(&self, user_id: UserId) -> AppResult<Versioned<UserStats>> {
        let row = sqlx::query_as::<_, UserStatsRow>(
            r#"
            SELECT total_solved, easy_problems_solved, medium_problems_solved,
                   hard_problems_solved, average_attempts, average_time_per_problem,
                   strong_tags, weak_tags, version
            FROM user_stats
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Versioned::from).unwrap_or(Versioned {
            value: UserStats::default(),
            version: 0,
        }))
    }

    async fn commit_stats(&self, commit: &StatsCommit) -> AppResult<CommitOutcome> {
        let mut tx = self.pool.begin().await?;

        // Holding the submission row serializes commits of the same submission
        let applied: bool = sqlx::query_scalar(
            "SELECT stats_applied FROM submissions WHERE id = $1 FOR UPDATE",
        )
        .bind(commit.submission_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| {
            AppError::NotFound(format!("Submission {} not found", commit.submission_id))
        })?;
        if applied {
            return Ok(CommitOutcome::AlreadyApplied);
        }

        let counters = sqlx::query(
            r#"
            UPDATE problems
            SET total_submissions = $3,
                successful_submissions = $4,
                acceptance_rate = $5,
                counters_version = counters_version + 1,
                updated_at = NOW()
            WHERE id = $1 AND counters_version = $2
            "#,
        )
        .bind(commit.problem_id)
        .bind(commit.expected_version)
        .bind(commit.counters.total_submissions as i64)
        .bind(commit.counters.successful_submissions as i64)
        .bind(commit.counters.acceptance_rate())
        .execute(&mut *tx)
        .await?;
        if counters.rows_affected() != 1 {
            return Ok(CommitOutcome::Stale);
        }

        if let Some(solver) = &commit.solver {
            if write_user_stats(&mut tx, solver).await? != 1 {
                return Ok(CommitOutcome::Stale);
            }
        }

        sqlx::query("UPDATE submissions SET stats_applied = TRUE WHERE id = $1")
            .bind(commit.submission_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(CommitOutcome::Committed)
    }

    async fn claim_first_solve(
        &self,
        user_id: UserId,
        problem_id: ProblemId,
        submission_id: SubmissionId,
    ) -> AppResult<bool> {
        // The no-op update makes RETURNING yield the existing holder
        let holder: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO user_solved_problems (user_id, problem_id, submission_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id, problem_id)
            DO UPDATE SET submission_id = user_solved_problems.submission_id
            RETURNING submission_id
            "#,
        )
        .bind(user_id)
        .bind(problem_id)
        .bind(submission_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(holder == submission_id)
    }

    async fn attempt_summary(&self, accepted: &Submission) -> AppResult<AttemptSummary> {
        let (attempts, first) = sqlx::query_as::<_, (i64, Option<DateTime<Utc>>)>(
            r#"
            SELECT COUNT(*), MIN(submitted_at)
            FROM submissions
            WHERE user_id = $1 AND problem_id = $2
              AND status = ANY($3) AND submitted_at <= $4
            "#,
        )
        .bind(accepted.user_id)
        .bind(accepted.problem_id)
        .bind(judged_statuses())
        .bind(accepted.submitted_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(AttemptSummary {
            attempts: (attempts.max(1)) as u32,
            first_submitted_at: first.unwrap_or(accepted.submitted_at),
        })
    }

    async fn problem_history(&self, problem_id: ProblemId) -> AppResult<Vec<Submission>> {
        let rows = sqlx::query_as::<_, SubmissionRow>(select_submissions!(
            "WHERE problem_id = $1 ORDER BY submitted_at ASC"
        ))
        .bind(problem_id)
        .fetch_all(&self.pool)
        .await?;
        into_submissions(rows)
    }

    async fn user_history(&self, user_id: UserId) -> AppResult<Vec<Submission>> {
        let rows = sqlx::query_as::<_, SubmissionRow>(select_submissions!(
            "WHERE user_id = $1 ORDER BY submitted_at ASC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        into_submissions(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_judged_statuses_exclude_lifecycle_states() {
        let statuses = judged_statuses();
        assert_eq!(statuses.len(), 6);
        assert!(statuses.contains(&"ACCEPTED".to_string()));
        assert!(!statuses.contains(&"JUDGE_ERROR".to_string()));
        assert!(!statuses.contains(&"CANCELLED".to_string()));
        assert!(!statuses.contains(&"PENDING".to_string()));
    }

    #[test]
    fn test_select_covers_every_column() {
        let query = select_submissions!("WHERE id = $1");
        assert!(query.starts_with("SELECT id, user_id"));
        assert!(query.ends_with("FROM submissions WHERE id = $1"));
        assert!(query.contains("stats_applied"));
    }
}
