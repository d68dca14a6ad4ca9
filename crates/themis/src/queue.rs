//! Two-lane submission queue
//!
//! Contest submissions are drained before practice submissions when
//! prioritization is enabled; otherwise both lanes are served in arrival
//! order. Each lane is FIFO relative to itself.

use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use themis_common::SubmissionId;
use tokio::sync::Notify;

use crate::metrics;

/// Dispatch lane of a queued submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    Contest,
    Practice,
}

impl Lane {
    pub fn for_contest(contest: bool) -> Self {
        if contest { Lane::Contest } else { Lane::Practice }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::Contest => "contest",
            Lane::Practice => "practice",
        }
    }
}

/// Why a submission could not be queued
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PushError {
    #[error("queue is full")]
    Full,
    #[error("queue is closed")]
    Closed,
    #[error("submission is already queued")]
    Duplicate,
}

#[derive(Debug, Default)]
struct QueueState {
    contest: VecDeque<(u64, SubmissionId)>,
    practice: VecDeque<(u64, SubmissionId)>,
    members: HashSet<SubmissionId>,
    next_seq: u64,
    closed: bool,
}

impl QueueState {
    fn lane_mut(&mut self, lane: Lane) -> &mut VecDeque<(u64, SubmissionId)> {
        match lane {
            Lane::Contest => &mut self.contest,
            Lane::Practice => &mut self.practice,
        }
    }

    fn take(&mut self, prioritize_contests: bool) -> Option<SubmissionId> {
        let lane = match (self.contest.front(), self.practice.front()) {
            (None, None) => return None,
            (Some(_), None) => Lane::Contest,
            (None, Some(_)) => Lane::Practice,
            (Some(_), Some(_)) if prioritize_contests => Lane::Contest,
            (Some((c, _)), Some((p, _))) => {
                if c < p {
                    Lane::Contest
                } else {
                    Lane::Practice
                }
            }
        };
        let (_, id) = self.lane_mut(lane).pop_front()?;
        self.members.remove(&id);
        Some(id)
    }

    fn publish_depth(&self) {
        metrics::set_queue_depth(Lane::Contest.as_str(), self.contest.len());
        metrics::set_queue_depth(Lane::Practice.as_str(), self.practice.len());
    }
}

/// Bounded queue of submission ids awaiting a worker
#[derive(Debug)]
pub struct SubmissionQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
    prioritize_contests: bool,
}

impl SubmissionQueue {
    pub fn new(capacity: usize, prioritize_contests: bool) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            capacity,
            prioritize_contests,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // Every critical section leaves the state consistent
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue a submission at the back of its lane.
    pub fn push(&self, id: SubmissionId, lane: Lane) -> Result<(), PushError> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(PushError::Closed);
            }
            if state.members.contains(&id) {
                return Err(PushError::Duplicate);
            }
            if state.members.len() >= self.capacity {
                return Err(PushError::Full);
            }

            let seq = state.next_seq;
            state.next_seq += 1;
            state.members.insert(id);
            state.lane_mut(lane).push_back((seq, id));
            state.publish_depth();
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Wait for the next submission. `None` once the queue is closed.
    pub async fn pop(&self) -> Option<SubmissionId> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.closed {
                    return None;
                }
                if let Some(id) = state.take(self.prioritize_contests) {
                    state.publish_depth();
                    return Some(id);
                }
            }

            notified.await;
        }
    }

    /// Take the next submission without waiting.
    pub fn try_pop(&self) -> Option<SubmissionId> {
        let mut state = self.lock();
        if state.closed {
            return None;
        }
        let id = state.take(self.prioritize_contests);
        state.publish_depth();
        id
    }

    /// Drop a queued submission. Returns whether it was queued.
    pub fn remove(&self, id: SubmissionId) -> bool {
        let mut state = self.lock();
        if !state.members.remove(&id) {
            return false;
        }
        state.contest.retain(|(_, queued)| *queued != id);
        state.practice.retain(|(_, queued)| *queued != id);
        state.publish_depth();
        true
    }

    /// Stop handing out work and wake every waiting worker.
    ///
    /// Submissions still queued stay PENDING in the store.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn contains(&self, id: SubmissionId) -> bool {
        self.lock().members.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn depth(&self, lane: Lane) -> usize {
        match lane {
            Lane::Contest => self.lock().contest.len(),
            Lane::Practice => self.lock().practice.len(),
        }
    }
}
