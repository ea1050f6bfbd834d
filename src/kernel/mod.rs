//! The kernel - tasks, scheduling, messaging and the virtual clock
//!
//! Design:
//! - One `Kernel` value owns every simulated object; task bodies reach it
//!   through a shared handle and never hold a borrow across an await
//! - Exactly one party runs at a time: the driver loop or the hot task
//! - Simulated time only advances when the driver pops an event
//! - Behavior is split by concern: `sched` (dispatching), `cfs` (fair
//!   share), `port`/`medium` (messages), `lock`/`semaphore`, `angio`

pub mod angio;
pub mod calendar;
pub mod cfs;
pub mod config;
pub mod driver;
pub mod error;
pub mod executor;
pub mod lock;
pub mod medium;
pub mod node;
pub mod port;
pub mod process;
pub mod random;
pub mod sched;
pub mod semaphore;
pub mod stats;
pub mod syscall;
pub mod table;
pub mod task;
pub mod trace;

pub use calendar::EventKind;
pub use config::SimConfig;
pub use driver::{Simulation, StepInfo};
pub use error::{SyscallError, SyscallResult};
pub use lock::LockId;
pub use medium::{BusId, LinkId};
pub use node::{Discipline, GroupId, NodeId, StatFlags};
pub use port::{Message, Payload, PortId, ReceiveOrder, Timeout};
pub use semaphore::SemId;
pub use stats::{StatEntry, StatId, StatKind, StatsReport};
pub use syscall::TaskCtx;
pub use task::{TaskId, TaskState};
pub use trace::TraceEvent;

use std::borrow::Cow;

use angio::Angio;
use calendar::{Calendar, EventHandle};
use cfs::{RunQueue, SchedId, SchedInfo};
use lock::Lock;
use medium::{Bus, Link};
use node::{Group, Node};
use port::Port;
use random::SimRng;
use semaphore::Semaphore;
use stats::{BlockStats, Stat};
use table::Table;
use task::{Body, Task};
use trace::Tracer;

/// Highest user priority
pub const MAX_PRIORITY: i32 = 1000;
/// Lowest user priority
pub const MIN_PRIORITY: i32 = 0;
/// Let the scheduler pick any processor of the node
pub const ANY_HOST: Option<usize> = None;

/// Priority of kernel helper tasks that must never wait behind user work
pub(crate) const HELPER_PRIORITY: i32 = MAX_PRIORITY + 4;

/// Message type delivered when a receive times out
pub const ACK_TIMEOUT: i64 = 0x8000_0000;
/// Shared-port request from a receiver to the dispatcher
pub const SP_REQUEST: i64 = 0x8000_0001;
/// Shared-port request withdrawn after a timeout
pub const SP_CANCEL: i64 = 0x8000_0002;

/// The kernel state
pub struct Kernel {
    pub(crate) now: f64,
    pub(crate) run_time: f64,
    /// Task whose body is executing; `None` means the driver
    pub(crate) hot: Option<TaskId>,
    /// Processor queues are ordered by priority only (quantum expiry)
    pub(crate) qxflag: bool,

    pub(crate) tasks: Table<TaskId, Task>,
    pub(crate) ports: Table<PortId, Port>,
    pub(crate) nodes: Vec<Node>,
    pub(crate) groups: Vec<Group>,
    pub(crate) buses: Vec<Bus>,
    pub(crate) links: Vec<Link>,
    pub(crate) stats: Vec<Stat>,
    pub(crate) locks: Vec<Lock>,
    pub(crate) semaphores: Vec<Semaphore>,
    pub(crate) rqs: Vec<RunQueue>,
    pub(crate) sis: Table<SchedId, SchedInfo>,

    pub(crate) calendar: Calendar,
    pub(crate) rng: SimRng,
    pub(crate) tracer: Tracer,
    pub(crate) warnings: bool,
    pub(crate) angio: Option<Angio>,
    pub(crate) block_stats: Option<BlockStats>,
    pub(crate) block_report: Option<String>,

    pub(crate) task_count: u64,
    pub(crate) next_mid: u64,
    /// Bodies of freshly created tasks, bound by the driver
    pub(crate) pending_spawn: Vec<(TaskId, Body)>,
    /// Killed tasks whose bodies still need dropping
    pub(crate) reaped: Vec<TaskId>,
}

impl Kernel {
    pub(crate) fn new(config: &SimConfig) -> Self {
        let mut kernel = Self {
            now: 0.0,
            run_time: 0.0,
            hot: None,
            qxflag: false,
            tasks: Table::new(),
            ports: Table::new(),
            nodes: Vec::new(),
            groups: Vec::new(),
            buses: Vec::new(),
            links: Vec::new(),
            stats: Vec::new(),
            locks: Vec::new(),
            semaphores: Vec::new(),
            rqs: Vec::new(),
            sis: Table::new(),
            calendar: Calendar::new(),
            rng: SimRng::seeded(config.seed),
            tracer: Tracer::new(config.trace),
            warnings: config.warning,
            angio: None,
            block_stats: None,
            block_report: None,
            task_count: 0,
            next_mid: 0,
            pending_spawn: Vec::new(),
            reaped: Vec::new(),
        };
        let built = kernel.build_node(
            &config.node0_name,
            1,
            1.0,
            0.0,
            Discipline::Pr,
            StatFlags::NONE,
        );
        if built.is_err() {
            error::abort("cannot build node 0");
        }
        kernel
    }

    pub fn now(&self) -> f64 {
        self.now
    }

    /// Caller of the current kernel call; only valid in task context
    pub(crate) fn me(&self) -> TaskId {
        match self.hot {
            Some(tid) => tid,
            None => error::abort("task-only call made from the driver"),
        }
    }

    pub(crate) fn task(&self, tid: TaskId) -> &Task {
        match self.tasks.get(tid) {
            Some(task) => task,
            None => error::abort(&format!("task {tid} does not exist")),
        }
    }

    pub(crate) fn task_mut(&mut self, tid: TaskId) -> &mut Task {
        match self.tasks.get_mut(tid) {
            Some(task) => task,
            None => error::abort(&format!("task {tid} does not exist")),
        }
    }

    /// State of a task; `Free` once it is gone
    pub fn task_state(&self, tid: TaskId) -> TaskState {
        self.tasks.get(tid).map_or(TaskState::Free, |task| task.state)
    }

    // ========================================================================
    // Warnings and errors
    // ========================================================================

    fn warnings_enabled(&self) -> bool {
        if !self.warnings {
            return false;
        }
        match self.hot.and_then(|tid| self.tasks.get(tid)) {
            Some(task) => task.priority <= MAX_PRIORITY,
            None => true,
        }
    }

    pub(crate) fn warning(&self, msg: &str) {
        tracing::warn!(
            target: "parasol::warning",
            "{} ***> {}",
            stats::format_g(self.now, 8, true),
            msg
        );
    }

    pub(crate) fn bad_param(&self, call: &'static str, param: &'static str) -> SyscallError {
        let err = SyscallError::bad_param(call, param);
        if self.warnings_enabled() {
            self.warning(&format!("{err}."));
        }
        err
    }

    pub(crate) fn bad_call(
        &self,
        call: &'static str,
        reason: impl Into<Cow<'static, str>>,
    ) -> SyscallError {
        let err = SyscallError::bad_call(call, reason);
        if self.warnings_enabled() {
            self.warning(&format!("{err}."));
        }
        err
    }

    // ========================================================================
    // Events
    // ========================================================================

    pub(crate) fn add_event(&mut self, time: f64, kind: EventKind) -> EventHandle {
        self.calendar.add(time, kind)
    }

    /// Cancel the task's timed event, returning when it was due
    pub(crate) fn cancel_tep(&mut self, tid: TaskId) -> Option<f64> {
        let ev = self.task_mut(tid).tep.take()?;
        let time = self.calendar.time_of(ev);
        self.calendar.remove(ev);
        Some(time)
    }

    pub(crate) fn cancel_qep(&mut self, tid: TaskId) {
        if let Some(ev) = self.task_mut(tid).qep.take() {
            self.calendar.remove(ev);
        }
    }

    pub(crate) fn cancel_rtoep(&mut self, tid: TaskId) {
        if let Some(ev) = self.task_mut(tid).rtoep.take() {
            self.calendar.remove(ev);
        }
    }

    /// Start a quantum for a task that was just given a processor. CFS
    /// tasks get the slice of their last compute.
    pub(crate) fn start_quantum(&mut self, tid: TaskId) {
        let node = &self.nodes[self.task(tid).node.0];
        let slice = match (node.discipline, self.task(tid).si) {
            (node::Discipline::Cfs, Some(si)) => self.sis.get(si).map(|si| si.q),
            _ => None,
        };
        let quantum = slice.unwrap_or(node.quantum);
        if quantum > 0.0 {
            let ev = self.add_event(self.now + quantum, EventKind::EndQuantum(tid));
            self.task_mut(tid).qep = Some(ev);
        }
    }

    // ========================================================================
    // Task tree
    // ========================================================================

    /// Whether the caller is `tid` or one of its ancestors. The driver
    /// is everyone's ancestor.
    pub(crate) fn is_ancestor(&self, tid: TaskId) -> bool {
        let Some(caller) = self.hot else {
            return true;
        };
        let mut cursor = Some(tid);
        while let Some(t) = cursor {
            if t == caller {
                return true;
            }
            cursor = self.tasks.get(t).and_then(|task| task.parent);
        }
        false
    }

    /// Kernel helper task, invisible to traces and statistics
    pub(crate) fn is_internal(&self, tid: TaskId) -> bool {
        self.tasks
            .get(tid)
            .is_some_and(|task| task.role.is_internal())
    }

    // ========================================================================
    // Statistics plumbing
    // ========================================================================

    pub(crate) fn open_internal_stat(&mut self, name: String, kind: StatKind, start: f64) -> StatId {
        let id = StatId(self.stats.len());
        self.stats.push(Stat::new(name, kind, start));
        id
    }

    pub(crate) fn record_internal(&mut self, sid: StatId, value: f64) {
        let now = self.now;
        if let Some(stat) = self.stats.get_mut(sid.0) {
            stat.record(value, now);
        }
    }
}
