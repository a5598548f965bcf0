use std::collections::VecDeque;

use uuid::Uuid;

/// A queued admission waiting for a free slot.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub job_id: Uuid,
    pub script_id: String,
}

/// Bookkeeping for FIFO admission under a fixed concurrency ceiling.
///
/// This struct is pure state: the runner guards it with the supervisor mutex
/// and applies the side effects (spawning, persistence) of each decision.
/// Admission is strictly FIFO; there is no priority and no backfill across
/// script ids.
#[derive(Debug)]
pub struct SchedState {
    max_concurrent: usize,
    running: usize,
    queue: VecDeque<QueueEntry>,
}

impl SchedState {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            running: 0,
            queue: VecDeque::new(),
        }
    }

    pub fn enqueue(&mut self, job_id: Uuid, script_id: String) {
        self.queue.push_back(QueueEntry { job_id, script_id });
    }

    /// Pop the head of the queue if a slot is free. The caller decides
    /// whether the entry actually starts (it may be cancelled) and reports
    /// back via [`job_started`](Self::job_started).
    pub fn next_ready(&mut self) -> Option<QueueEntry> {
        if self.running >= self.max_concurrent {
            return None;
        }
        self.queue.pop_front()
    }

    pub fn job_started(&mut self) {
        self.running += 1;
    }

    pub fn job_finished(&mut self) {
        self.running = self.running.saturating_sub(1);
    }

    pub fn clear_queue(&mut self) {
        self.queue.clear();
    }

    pub fn running(&self) -> usize {
        self.running
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}
