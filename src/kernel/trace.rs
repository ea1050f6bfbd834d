//! Task state tracing
//!
//! When tracing is on, every task state change is reported as one line
//! and kept in a bounded buffer for inspection.
//!
//! Design:
//! - Lines go out through `tracing` on target `parasol::trace`
//! - Ring buffer of recent events (bounded memory)
//! - Kernel helper tasks are never traced

use std::collections::VecDeque;

use super::Kernel;
use super::node::NodeId;
use super::stats::format_g;
use super::task::TaskId;

/// Maximum number of events to keep in the trace buffer
const TRACE_BUFFER_SIZE: usize = 1000;

/// A single task trace event
#[derive(Debug, Clone, PartialEq)]
pub struct TraceEvent {
    pub time: f64,
    pub node: NodeId,
    pub task: TaskId,
    pub name: String,
    pub message: String,
}

impl std::fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let time = format_g(self.time, 8, true);
        if self.name.is_empty() {
            write!(
                f,
                "Time: {time}; Node: {}; Task {} {}.",
                self.node, self.task, self.message
            )
        } else {
            write!(
                f,
                "Time: {time}; Node: {}; Task {} ({}) {}.",
                self.node, self.task, self.name, self.message
            )
        }
    }
}

#[derive(Debug, Default)]
pub struct Tracer {
    enabled: bool,
    events: VecDeque<TraceEvent>,
}

impl Tracer {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            events: VecDeque::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn trace(&mut self, event: TraceEvent) {
        if !self.enabled {
            return;
        }
        tracing::info!(target: "parasol::trace", "{event}");
        if self.events.len() >= TRACE_BUFFER_SIZE {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    /// Recent events, oldest first
    pub fn events(&self) -> &VecDeque<TraceEvent> {
        &self.events
    }

    pub fn events_for(&self, task: TaskId) -> Vec<&TraceEvent> {
        self.events.iter().filter(|e| e.task == task).collect()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

impl Kernel {
    /// Report a state change of `tid`
    pub(crate) fn ts_report(&mut self, tid: TaskId, msg: impl Into<String>) {
        if !self.tracer.is_enabled() {
            return;
        }
        let Some(task) = self.tasks.get(tid) else {
            return;
        };
        if task.role.is_internal() {
            return;
        }
        let event = TraceEvent {
            time: self.now,
            node: task.node,
            task: tid,
            name: task.name.clone(),
            message: msg.into(),
        };
        self.tracer.trace(event);
    }
}
