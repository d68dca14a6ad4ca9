//! Judge service: intake, dispatch and the worker pool

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use themis_common::{AppResult, NewSubmission, Submission, SubmissionId, SubmissionStatus};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{IntakeConfig, SchedulerConfig};
use crate::intake::{self, RejectReason};
use crate::judge::Judge;
use crate::languages::Toolchains;
use crate::metrics;
use crate::queue::{Lane, PushError, SubmissionQueue};
use crate::retry::RetryPolicy;
use crate::sandbox::Sandbox;
use crate::store::JudgeStore;
use crate::worker::{JudgeWorker, Pipeline};

/// Answer to an enqueue request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum EnqueueResult {
    Accepted { id: SubmissionId },
    Rejected { reason: RejectReason },
}

impl EnqueueResult {
    pub fn id(&self) -> Option<SubmissionId> {
        match self {
            Self::Accepted { id } => Some(*id),
            Self::Rejected { .. } => None,
        }
    }
}

/// What a poller sees of a submission
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub id: SubmissionId,
    pub status: SubmissionStatus,
    pub submitted_at: DateTime<Utc>,
    pub judged_at: Option<DateTime<Utc>>,
    pub first_failing_test: Option<u32>,
    pub max_time_ms: Option<u64>,
    pub peak_memory_kb: Option<u64>,
    pub judge_message: Option<String>,
    /// Still waiting in this instance's queue
    pub queued: bool,
}

impl StatusSnapshot {
    fn of(submission: Submission, queued: bool) -> Self {
        Self {
            id: submission.id,
            status: submission.status,
            submitted_at: submission.submitted_at,
            judged_at: submission.judged_at,
            first_failing_test: submission.first_failing_test,
            max_time_ms: submission.max_time_ms,
            peak_memory_kb: submission.peak_memory_kb,
            judge_message: submission.judge_message,
            queued,
        }
    }
}

/// Inbound façade of the judging pipeline
pub struct JudgeService {
    config: SchedulerConfig,
    intake: IntakeConfig,
    toolchains: Arc<Toolchains>,
    queue: Arc<SubmissionQueue>,
    pipeline: Arc<Pipeline>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl JudgeService {
    /// Create a service with the built-in toolchains of the enabled languages.
    pub fn new(
        config: SchedulerConfig,
        intake: IntakeConfig,
        store: Arc<dyn JudgeStore>,
        sandbox: Arc<dyn Sandbox>,
    ) -> Self {
        let toolchains = Toolchains::builtin(&intake.enabled_languages);
        Self::with_toolchains(config, intake, store, sandbox, toolchains)
    }

    pub fn with_toolchains(
        config: SchedulerConfig,
        intake: IntakeConfig,
        store: Arc<dyn JudgeStore>,
        sandbox: Arc<dyn Sandbox>,
        toolchains: Toolchains,
    ) -> Self {
        let toolchains = Arc::new(toolchains);
        let judge = Judge::new(sandbox, toolchains.clone(), config.stop_on_first_failure);
        let pipeline = Pipeline::new(store, judge, RetryPolicy::from_config(&config));
        let queue = SubmissionQueue::new(config.queue_capacity, config.prioritize_contests);

        Self {
            config,
            intake,
            toolchains,
            queue: Arc::new(queue),
            pipeline: Arc::new(pipeline),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn JudgeStore> {
        self.pipeline.store()
    }

    pub fn queue(&self) -> &Arc<SubmissionQueue> {
        &self.queue
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Validate, persist as PENDING and queue a new submission.
    ///
    /// Rejections are answers, not errors; `Err` means the store failed.
    pub async fn enqueue(&self, new: NewSubmission) -> AppResult<EnqueueResult> {
        if let Err(reason) = self.admit(&new).await? {
            warn!(
                user_id = %new.user_id,
                problem_id = %new.problem_id,
                reason = reason.label(),
                "Submission rejected: {}",
                reason
            );
            metrics::record_rejection(reason.label());
            return Ok(EnqueueResult::Rejected { reason });
        }

        let submission = Submission::pending(Uuid::new_v4(), new, Utc::now());
        self.store().insert_submission(&submission).await?;

        let id = submission.id;
        let lane = Lane::for_contest(submission.is_contest());
        match self.queue.push(id, lane) {
            Ok(()) => {
                info!(submission_id = %id, lane = lane.as_str(), "Submission queued");
            }
            Err(e) => {
                // Persisted as PENDING, the poller picks it up later
                warn!(submission_id = %id, "Submission stored but not queued: {}", e);
            }
        }

        Ok(EnqueueResult::Accepted { id })
    }

    async fn admit(&self, new: &NewSubmission) -> AppResult<Result<(), RejectReason>> {
        if let Err(reason) = intake::validate(new, &self.intake, &self.toolchains) {
            return Ok(Err(reason));
        }

        if self.store().get_problem(new.problem_id).await?.is_none() {
            return Ok(Err(RejectReason::ProblemNotFound(new.problem_id)));
        }

        if self.queue.is_closed() {
            return Ok(Err(RejectReason::ShuttingDown));
        }
        if self.queue.len() >= self.queue.capacity() {
            return Ok(Err(RejectReason::QueueFull));
        }

        Ok(Ok(()))
    }

    /// Queue a submission that is already persisted as PENDING.
    ///
    /// Returns false when it is queued already.
    pub fn requeue(&self, submission: &Submission) -> Result<bool, PushError> {
        match self
            .queue
            .push(submission.id, Lane::for_contest(submission.is_contest()))
        {
            Ok(()) => Ok(true),
            Err(PushError::Duplicate) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn get_status(&self, id: SubmissionId) -> AppResult<Option<StatusSnapshot>> {
        let submission = self.store().get_submission(id).await?;
        Ok(submission.map(|s| StatusSnapshot::of(s, self.queue.contains(id))))
    }

    /// Cancel a submission that has not started. Returns false once it is
    /// running or terminal.
    pub async fn cancel(&self, id: SubmissionId) -> AppResult<bool> {
        let cancelled = self.store().cancel_submission(id, Utc::now()).await?;
        if cancelled {
            self.queue.remove(id);
            info!(submission_id = %id, "Submission cancelled");
        }
        Ok(cancelled)
    }

    /// Spawn the worker pool.
    pub fn start(&self) {
        let mut workers = self.lock_workers();
        if !workers.is_empty() {
            return;
        }

        for id in 0..self.config.worker_count.max(1) {
            let worker = JudgeWorker::new(id, self.queue.clone(), self.pipeline.clone());
            workers.push(tokio::spawn(worker.run()));
        }
        info!(workers = workers.len(), "Judge workers started");
    }

    /// Stop dispatching and wait for in-flight judgments to finish.
    ///
    /// Queued submissions stay PENDING for the next start.
    pub async fn shutdown(&self) {
        self.queue.close();
        let workers: Vec<_> = self.lock_workers().drain(..).collect();
        debug!(workers = workers.len(), "Waiting for judge workers");

        for result in futures::future::join_all(workers).await {
            if let Err(e) = result {
                warn!("Judge worker ended abnormally: {}", e);
            }
        }
        info!("Judge service stopped");
    }

    fn lock_workers(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::MockSandbox;
    use crate::store::InMemoryStore;
    use themis_common::{ComparisonMode, Difficulty, Language, Problem, TestCase};

    fn service(store: Arc<InMemoryStore>, capacity: usize) -> JudgeService {
        let config = SchedulerConfig {
            queue_capacity: capacity,
            ..SchedulerConfig::default()
        };
        let intake = IntakeConfig {
            max_code_bytes: 1024,
            enabled_languages: vec![Language::Python, Language::Cpp],
        };
        JudgeService::new(config, intake, store, Arc::new(MockSandbox::new()))
    }

    fn seeded_store() -> (Arc<InMemoryStore>, Problem) {
        let store = Arc::new(InMemoryStore::new());
        let problem = Problem {
            id: Uuid::new_v4(),
            title: "Two Sum".to_string(),
            difficulty: Difficulty::Easy,
            tags: Vec::new(),
            test_cases: vec![TestCase {
                input: "1".to_string(),
                expected_output: "1".to_string(),
                is_public: false,
                explanation: None,
            }],
            time_limit: 1000,
            memory_limit: 64,
            comparison_mode: ComparisonMode::Normalized,
            total_submissions: 0,
            successful_submissions: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.insert_problem(problem.clone()).unwrap();
        (store, problem)
    }

    fn new_submission(problem_id: Uuid, contest: bool) -> NewSubmission {
        NewSubmission {
            user_id: Uuid::new_v4(),
            problem_id,
            contest_id: contest.then(Uuid::new_v4),
            language: "python".to_string(),
            code: "print(1)".to_string(),
        }
    }

    #[tokio::test]
    async fn test_enqueue_persists_pending_and_queues() {
        let (store, problem) = seeded_store();
        let service = service(store, 10);

        let result = service
            .enqueue(new_submission(problem.id, true))
            .await
            .unwrap();
        let id = result.id().unwrap();

        let snapshot = service.get_status(id).await.unwrap().unwrap();
        assert_eq!(snapshot.status, SubmissionStatus::Pending);
        assert!(snapshot.queued);
        assert_eq!(service.queue().depth(Lane::Contest), 1);
    }

    #[tokio::test]
    async fn test_rejections_never_reach_the_store() {
        let (store, problem) = seeded_store();
        let service = service(store.clone(), 1);

        let mut unsupported = new_submission(problem.id, false);
        unsupported.language = "cobol".to_string();
        assert_eq!(
            service.enqueue(unsupported).await.unwrap(),
            EnqueueResult::Rejected {
                reason: RejectReason::UnsupportedLanguage("cobol".to_string())
            }
        );

        let missing = Uuid::new_v4();
        assert_eq!(
            service.enqueue(new_submission(missing, false)).await.unwrap(),
            EnqueueResult::Rejected {
                reason: RejectReason::ProblemNotFound(missing)
            }
        );

        service
            .enqueue(new_submission(problem.id, false))
            .await
            .unwrap();
        assert_eq!(
            service
                .enqueue(new_submission(problem.id, false))
                .await
                .unwrap(),
            EnqueueResult::Rejected {
                reason: RejectReason::QueueFull
            }
        );

        assert_eq!(store.problem_history(problem.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_only_while_pending() {
        let (store, problem) = seeded_store();
        let service = service(store.clone(), 10);

        let id = service
            .enqueue(new_submission(problem.id, false))
            .await
            .unwrap()
            .id()
            .unwrap();
        assert!(service.cancel(id).await.unwrap());
        assert!(!service.queue().contains(id));
        assert!(!service.cancel(id).await.unwrap());

        let snapshot = service.get_status(id).await.unwrap().unwrap();
        assert_eq!(snapshot.status, SubmissionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let (store, problem) = seeded_store();
        let service = service(store, 10);
        service.start();
        service.shutdown().await;

        assert_eq!(
            service
                .enqueue(new_submission(problem.id, false))
                .await
                .unwrap(),
            EnqueueResult::Rejected {
                reason: RejectReason::ShuttingDown
            }
        );
    }

    #[test]
    fn test_rejection_serializes_with_reason() {
        let result = EnqueueResult::Rejected {
            reason: RejectReason::QueueFull,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["result"], "rejected");
        assert_eq!(json["reason"]["reason"], "queue_full");
    }
}
