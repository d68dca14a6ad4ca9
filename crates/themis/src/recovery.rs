//! Startup recovery and the pending poller
//!
//! A judge that stopped abruptly can leave submissions PENDING (never
//! queued), RUNNING (judged by a dead worker) or terminal with their
//! statistics not yet applied. Recovery brings each back onto its path.
//! While running, the binary keeps polling for pending work and sweeping
//! statistics whose commit failed.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use themis_common::{AppError, AppResult, SubmissionStatus};
use tracing::{debug, error, info, warn};

use crate::constants::RECOVERY_BATCH_SIZE;
use crate::scheduler::JudgeService;
use crate::store::JudgeStore;
use crate::worker::judge_error_report;

/// What one recovery pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub requeued: usize,
    pub failed_stale: usize,
    pub stats_applied: usize,
}

/// Run every recovery step once. Meant for startup, before the workers run.
pub async fn recover(service: &JudgeService, stale_after: Duration) -> AppResult<RecoveryReport> {
    let failed_stale = fail_stale_running(service, stale_after).await?;
    let stats_applied = apply_missing_stats(service).await?;
    let requeued = requeue_pending(service).await?;

    let report = RecoveryReport {
        requeued,
        failed_stale,
        stats_applied,
    };
    info!(
        requeued = report.requeued,
        failed_stale = report.failed_stale,
        stats_applied = report.stats_applied,
        "Recovery finished"
    );
    Ok(report)
}

/// Fail RUNNING submissions whose worker is gone.
pub async fn fail_stale_running(service: &JudgeService, stale_after: Duration) -> AppResult<usize> {
    let age = chrono::Duration::from_std(stale_after)
        .map_err(|_| AppError::ValidationError(format!("Stale age {:?} out of range", stale_after)))?;
    let cutoff = Utc::now() - age;
    let stale = service.store().list_stale_running(cutoff).await?;

    let report = judge_error_report();
    let mut failed = 0;
    for submission in stale {
        if service
            .store()
            .finish_submission(submission.id, &report, Utc::now())
            .await?
        {
            warn!(submission_id = %submission.id, "Stale RUNNING submission marked JUDGE_ERROR");
            failed += 1;
        }
    }
    Ok(failed)
}

/// Apply statistics for judged submissions whose update never committed.
pub async fn apply_missing_stats(service: &JudgeService) -> AppResult<usize> {
    let store = service.store();
    let stats = service.pipeline().stats();
    let mut applied = 0;

    loop {
        let batch = store.list_unapplied_stats(RECOVERY_BATCH_SIZE).await?;
        if batch.is_empty() {
            break;
        }

        let mut progressed = false;
        for submission in batch {
            let Some(problem) = store.get_problem(submission.problem_id).await? else {
                error!(
                    submission_id = %submission.id,
                    problem_id = %submission.problem_id,
                    "Cannot apply statistics, problem is gone"
                );
                continue;
            };
            match stats.apply_submission(&submission, &problem).await {
                Ok(true) => {
                    applied += 1;
                    progressed = true;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(submission_id = %submission.id, "Statistics still not applied: {}", e);
                }
            }
        }

        if !progressed {
            break;
        }
    }
    Ok(applied)
}

/// Queue PENDING submissions that are not queued yet.
pub async fn requeue_pending(service: &JudgeService) -> AppResult<usize> {
    let queue = service.queue();
    let room = queue.capacity().saturating_sub(queue.len());
    if room == 0 {
        return Ok(0);
    }

    let pending = service
        .store()
        .list_by_status(SubmissionStatus::Pending, room)
        .await?;

    let mut requeued = 0;
    for submission in &pending {
        match service.requeue(submission) {
            Ok(true) => requeued += 1,
            Ok(false) => {}
            Err(e) => {
                debug!(submission_id = %submission.id, "Stopped requeueing: {}", e);
                break;
            }
        }
    }
    Ok(requeued)
}

/// Poll the store for PENDING submissions written by other producers until
/// the queue closes.
pub async fn poll_pending(service: Arc<JudgeService>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    while !service.queue().is_closed() {
        ticker.tick().await;
        match requeue_pending(&service).await {
            Ok(0) => {}
            Ok(n) => debug!(requeued = n, "Pending submissions picked up"),
            Err(e) => warn!("Pending poll failed: {}", e),
        }
    }
}

/// Re-apply statistics that never committed, every `interval`, until the
/// queue closes.
pub async fn sweep_stats(service: Arc<JudgeService>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    while !service.queue().is_closed() {
        ticker.tick().await;
        match apply_missing_stats(&service).await {
            Ok(0) => {}
            Ok(n) => info!(applied = n, "Unapplied statistics committed"),
            Err(e) => warn!("Statistics sweep failed: {}", e),
        }
    }
}
