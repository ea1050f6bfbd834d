//! Spin locks
//!
//! A task that finds a lock held spins on it, keeping its processor.
//! When the owner (or an ancestor of the owner) unlocks, one waiter
//! chosen at random becomes the owner and is blocked until the current
//! instant, so it resumes after the unlocking task yields.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use super::calendar::EventKind;
use super::error::SyscallResult;
use super::task::{TaskId, TaskState};
use super::Kernel;

/// Index of a lock; the table grows to fit any index used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockId(pub usize);

impl std::fmt::Display for LockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Default, Clone)]
pub(crate) struct Lock {
    pub owner: Option<TaskId>,
    /// Spinning tasks, most recent first
    pub queue: VecDeque<TaskId>,
}

impl Kernel {
    /// Make sure lock `l` exists, doubling the table as needed
    pub(crate) fn grow_locks(&mut self, l: LockId) {
        if l.0 < self.locks.len() {
            return;
        }
        let mut size = self.locks.len().max(1);
        while l.0 >= size {
            size *= 2;
        }
        self.locks.resize_with(size, Lock::default);
    }

    /// One attempt to take lock `l` for the hot task. Returns false when
    /// the task is left spinning and control has moved elsewhere.
    pub(crate) fn try_lock(&mut self, l: LockId) -> bool {
        let me = self.me();
        self.grow_locks(l);
        match self.locks[l.0].owner {
            Some(owner) if owner == me => true,
            Some(_) => {
                self.locks[l.0].queue.push_front(me);
                let task = self.task_mut(me);
                task.spin_lock = Some(l);
                task.state = TaskState::Spinning;
                self.ts_report(me, format!("spinning on lock {l}"));
                self.sched();
                false
            }
            None => {
                self.dq_lock(me);
                self.locks[l.0].owner = Some(me);
                self.task_mut(me).locks.insert(0, l);
                self.ts_report(me, format!("locking lock {l}"));
                true
            }
        }
    }

    pub(crate) fn unlock(&mut self, l: LockId) -> SyscallResult<()> {
        if l.0 >= self.locks.len() {
            return Err(self.bad_param("unlock", "lock"));
        }
        let Some(owner) = self.locks[l.0].owner else {
            return Ok(());
        };
        if !self.is_ancestor(owner) {
            return Err(self.bad_call("unlock", "Caller is not an ancestor of lock owner"));
        }
        self.task_mut(owner).locks.retain(|&held| held != l);
        if let Some(caller) = self.hot {
            self.ts_report(caller, format!("unlocking lock {l}"));
        }
        self.log_angio_event(&format!("wLockUnlock {l}"));
        self.hand_off_lock(l);
        Ok(())
    }

    /// Give lock `l` to a random spinner, or leave it unlocked
    fn hand_off_lock(&mut self, l: LockId) {
        let count = self.locks[l.0].queue.len();
        if count == 0 {
            self.locks[l.0].owner = None;
            return;
        }
        let nth = self.rng.choice(count);
        let next = self.locks[l.0].queue[nth];
        self.locks[l.0].owner = Some(next);
        self.dq_lock(next);
        self.task_mut(next).locks.insert(0, l);
        let ev = self.add_event(self.now, EventKind::EndBlock(next));
        let task = self.task_mut(next);
        task.state = TaskState::Blocked;
        task.tep = Some(ev);
        self.ts_report(next, format!("locking lock {l}"));
    }

    /// Stop a task spinning on its lock
    pub(crate) fn dq_lock(&mut self, tp: TaskId) {
        let Some(l) = self.task_mut(tp).spin_lock.take() else {
            return;
        };
        self.locks[l.0].queue.retain(|&t| t != tp);
    }

    /// Release every lock a task holds, if the caller may
    pub(crate) fn release_locks(&mut self, tp: TaskId) {
        if !self.is_ancestor(tp) {
            return;
        }
        let held = std::mem::take(&mut self.task_mut(tp).locks);
        for l in held {
            if let Some(caller) = self.hot {
                self.ts_report(caller, format!("unlocking lock {l}"));
            }
            self.hand_off_lock(l);
        }
    }

    pub fn lock_owner(&self, l: LockId) -> Option<TaskId> {
        self.locks.get(l.0).and_then(|lock| lock.owner)
    }

    pub fn lock_waiters(&self, l: LockId) -> usize {
        self.locks.get(l.0).map_or(0, |lock| lock.queue.len())
    }
}
