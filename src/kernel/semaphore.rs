//! Counting semaphores
//!
//! Waiters are suspended in FIFO order and resumed by `signal` or
//! `reset`. New semaphores start with a count of one.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use super::error::SyscallResult;
use super::task::{TaskId, TaskState};
use super::Kernel;

/// Index of a semaphore; the table grows to fit any index used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SemId(pub usize);

impl std::fmt::Display for SemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Semaphore {
    /// Negative counts are the number of waiters
    pub count: i64,
    pub queue: VecDeque<TaskId>,
}

impl Default for Semaphore {
    fn default() -> Self {
        Self {
            count: 1,
            queue: VecDeque::new(),
        }
    }
}

impl Kernel {
    fn grow_semaphores(&mut self, sid: SemId) {
        if sid.0 < self.semaphores.len() {
            return;
        }
        let mut size = self.semaphores.len().max(1);
        while sid.0 >= size {
            size *= 2;
        }
        self.semaphores.resize_with(size, Semaphore::default);
    }

    fn report_caller(&mut self, msg: String) {
        if let Some(caller) = self.hot {
            self.ts_report(caller, msg);
        }
    }

    /// Decrement; when no count was left the caller is queued and
    /// suspended, and true is returned
    pub(crate) fn wait_semaphore(&mut self, sid: SemId) -> SyscallResult<bool> {
        let me = self.me();
        self.grow_semaphores(sid);
        self.report_caller(format!("waiting on semaphore {sid}"));
        self.log_angio_event(&format!("wSemaBlocked {sid}"));

        let sem = &mut self.semaphores[sid.0];
        let available = sem.count;
        sem.count -= 1;
        if available > 0 {
            return Ok(false);
        }
        sem.queue.push_back(me);
        self.ts_report(me, format!("blocked on semaphore {sid}"));
        self.suspend(me)?;
        Ok(true)
    }

    /// Increment, resuming the oldest waiter if there is one
    pub(crate) fn signal_semaphore(&mut self, sid: SemId) -> SyscallResult<()> {
        self.grow_semaphores(sid);
        self.report_caller(format!("signalling semaphore {sid}"));
        self.log_angio_event(&format!("wSemaSignal {sid}"));

        let sem = &mut self.semaphores[sid.0];
        let before = sem.count;
        sem.count += 1;
        if before < 0 {
            if let Some(waiter) = sem.queue.pop_front() {
                self.wake_waiter(waiter)?;
            }
        }
        Ok(())
    }

    /// Set the count and resume every waiter
    pub(crate) fn reset_semaphore(&mut self, sid: SemId, value: i64) -> SyscallResult<()> {
        if value < 0 {
            return Err(self.bad_param("reset_semaphore", "value"));
        }
        self.grow_semaphores(sid);
        self.report_caller(format!("resetting semaphore {sid} to value {value}"));
        self.log_angio_event(&format!("wSemaReset {sid} {value}"));

        let sem = &mut self.semaphores[sid.0];
        sem.count = value;
        let waiters = std::mem::take(&mut sem.queue);
        for waiter in waiters {
            self.wake_waiter(waiter)?;
        }
        Ok(())
    }

    /// A waiter resumed by someone else since it blocked is left alone
    fn wake_waiter(&mut self, waiter: TaskId) -> SyscallResult<()> {
        let still_waiting = self
            .tasks
            .get(waiter)
            .is_some_and(|task| matches!(task.state, TaskState::Suspended | TaskState::SyncSuspend));
        if still_waiting {
            self.resume(waiter)?;
        }
        Ok(())
    }

    /// Forget a dead task's pending waits, returning their counts
    pub(crate) fn purge_semaphore_waiter(&mut self, tid: TaskId) {
        for sem in &mut self.semaphores {
            let before = sem.queue.len();
            sem.queue.retain(|&t| t != tid);
            sem.count += (before - sem.queue.len()) as i64;
        }
    }

    pub fn semaphore_count(&self, sid: SemId) -> i64 {
        self.semaphores.get(sid.0).map_or(1, |sem| sem.count)
    }

    pub fn semaphore_waiters(&self, sid: SemId) -> Vec<TaskId> {
        self.semaphores
            .get(sid.0)
            .map(|sem| sem.queue.iter().copied().collect())
            .unwrap_or_default()
    }
}
