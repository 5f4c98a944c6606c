//! Admission bookkeeping for one batch.
//!
//! [`EngineState`] is plain data owned by the coordinator task. Workers never see
//! it; they only emit events, and the coordinator updates the state in response.

use std::collections::VecDeque;

use crate::types::{EngineSnapshot, Job};

/// Pending queue and counters of the current submission.
#[derive(Debug, Default)]
pub struct EngineState {
    running: bool,
    cancelled: bool,
    pending: VecDeque<Job>,
    active: usize,
    total: usize,
    completed: usize,
    limit: usize,
    peak_active: usize,
}

impl EngineState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Starts a batch. The caller rejects a submission while `is_running`.
    pub fn begin(&mut self, jobs: Vec<Job>, limit: usize) {
        self.running = true;
        self.cancelled = false;
        self.total = jobs.len();
        self.pending = jobs.into();
        self.active = 0;
        self.completed = 0;
        self.limit = limit.max(1);
        self.peak_active = 0;
    }

    /// Moves the next pending job to active if a slot is free and the batch
    /// was not cancelled.
    pub fn admit_next(&mut self) -> Option<Job> {
        if !self.running || self.cancelled || self.active >= self.limit {
            return None;
        }
        let job = self.pending.pop_front()?;
        self.active += 1;
        self.peak_active = self.peak_active.max(self.active);
        Some(job)
    }

    /// Fills every free slot.
    pub fn admit_available(&mut self) -> Vec<Job> {
        std::iter::from_fn(|| self.admit_next()).collect()
    }

    /// Records one `Done`. Failed archives count as completed.
    pub fn complete(&mut self) {
        if self.active == 0 {
            log::warn!("Completion received with no active job");
            return;
        }
        self.active -= 1;
        self.completed += 1;
    }

    /// Drops every pending job; active jobs keep running. Returns how many
    /// jobs were dropped.
    pub fn cancel(&mut self) -> usize {
        if !self.running {
            return 0;
        }
        self.cancelled = true;
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    /// True once a running batch has nothing active and nothing pending.
    pub fn is_drained(&self) -> bool {
        self.running && self.active == 0 && self.pending.is_empty()
    }

    /// Returns to idle, keeping the last counters for the final report.
    pub fn finish(&mut self) -> (usize, usize) {
        let counters = (self.completed, self.total);
        *self = Self::default();
        counters
    }

    pub fn counters(&self) -> (usize, usize) {
        (self.completed, self.total)
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            running: self.running,
            cancelled: self.cancelled,
            pending: self.pending.len(),
            active: self.active,
            completed: self.completed,
            total: self.total,
            limit: self.limit,
            peak_active: self.peak_active,
        }
    }
}
