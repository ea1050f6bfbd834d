//! Task body executor
//!
//! Holds the future of every live task and polls exactly the one the
//! kernel says is hot. There is no ready set and no waking: a body only
//! makes progress when the driver polls it, and a body parked on a switch
//! stays pending until the kernel hands it the processor again.
//!
//! Design:
//! - Bodies are keyed by the kernel's task id
//! - Polling uses a no-op waker; readiness is decided by the kernel
//! - Dropping a body (cancel) is how a killed task's stack unwinds

use std::collections::BTreeMap;
use std::task::{Context, Poll};

use futures::task::noop_waker_ref;

use super::task::{BoxFuture, TaskId};

/// Outcome of polling one body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Polled {
    /// Parked on a switch
    Pending,
    /// The body returned and has been dropped
    Finished,
    /// No body with that id
    Missing,
}

#[derive(Default)]
pub(crate) struct Executor {
    tasks: BTreeMap<TaskId, BoxFuture>,
}

impl Executor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn(&mut self, id: TaskId, future: BoxFuture) {
        self.tasks.insert(id, future);
    }

    /// Run a body until it parks or returns
    pub fn poll(&mut self, id: TaskId) -> Polled {
        let Some(future) = self.tasks.get_mut(&id) else {
            return Polled::Missing;
        };
        let mut cx = Context::from_waker(noop_waker_ref());
        match future.as_mut().poll(&mut cx) {
            Poll::Pending => Polled::Pending,
            Poll::Ready(()) => {
                self.tasks.remove(&id);
                Polled::Finished
            }
        }
    }

    /// Drop a body without running it further
    pub fn cancel(&mut self, id: TaskId) -> bool {
        self.tasks.remove(&id).is_some()
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.tasks.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
