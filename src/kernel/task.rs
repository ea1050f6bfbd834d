//! Task abstraction
//!
//! A task is a simulated thread of control. Its body is a future the
//! kernel polls directly; the kernel record below holds everything the
//! scheduler needs to know about it.
//!
//! Design:
//! - Tasks form a tree: each task knows its parent and its sons
//! - A task is Hot while its body runs; every other state is described by
//!   the events it has pending (`tep`, `qep`, `rtoep`)
//! - Ports, locks and spin targets are tracked per task so kill and
//!   suspend can release them

use std::future::Future;
use std::pin::Pin;

use super::angio::Dye;
use super::calendar::EventHandle;
use super::cfs::SchedId;
use super::lock::LockId;
use super::node::{GroupId, NodeId};
use super::port::PortId;
use super::syscall::TaskCtx;
use super::table::handle;

handle!(
    /// Unique identifier for a task
    TaskId
);

/// A boxed future representing a task body
pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + 'static>>;

/// Deferred body constructor, run once the task's context exists
pub(crate) type Body = Box<dyn FnOnce(TaskCtx) -> BoxFuture>;

/// Task execution state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Slot freed; the task no longer exists
    Free,
    /// Not eligible to run until resumed
    Suspended,
    /// Queued waiting for a processor
    Ready,
    /// Body is executing
    Hot,
    /// Waiting for a message on `wport`
    Receiving,
    /// Sleeping until an END_SLEEP event or an awaken
    Sleeping,
    /// Holding its processor for a synchronous interval
    Sync,
    /// Sync interval in progress; suspend once it ends
    SyncSuspend,
    /// Sync interval in progress; free once it ends
    SyncFree,
    /// Busy-waiting on a lock
    Spinning,
    /// Consuming processor time until END_COMPUTE
    Computing,
    /// Holds a processor but waits for an END_BLOCK event
    Blocked,
}

impl TaskState {
    pub fn name(self) -> &'static str {
        match self {
            TaskState::Free => "FREE",
            TaskState::Suspended => "SUSPENDED",
            TaskState::Ready => "READY",
            TaskState::Hot => "HOT",
            TaskState::Receiving => "RECEIVING",
            TaskState::Sleeping => "SLEEPING",
            TaskState::Sync => "SYNC",
            TaskState::SyncSuspend => "SYNC_SUSPEND",
            TaskState::SyncFree => "SYNC_FREE",
            TaskState::Spinning => "SPINNING",
            TaskState::Computing => "COMPUTING",
            TaskState::Blocked => "BLOCKED",
        }
    }

    /// One of the three sync states, which hold their processor
    /// until END_SYNC no matter what else happens
    pub fn is_sync(self) -> bool {
        matches!(
            self,
            TaskState::Sync | TaskState::SyncSuspend | TaskState::SyncFree
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Kernel-created helpers are excluded from traces and reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskRole {
    User,
    /// Root task; its sons outlive its body
    Genesis,
    /// Forwards one port's traffic into a port set
    Surrogate,
    /// Serves a shared port
    Dispatcher,
}

impl TaskRole {
    pub(crate) fn is_internal(self) -> bool {
        matches!(self, TaskRole::Surrogate | TaskRole::Dispatcher)
    }
}

/// Kernel record of one task
#[derive(Debug)]
pub(crate) struct Task {
    pub name: String,
    pub state: TaskState,
    pub role: TaskRole,
    /// Serial number in creation order
    pub tsn: u64,

    pub node: NodeId,
    /// Requested processor (`None` = any)
    pub host: Option<usize>,
    /// Processor requested by the user, restored after migration
    pub uhost: Option<usize>,
    /// Processor currently held
    pub hp: Option<usize>,
    pub priority: i32,
    pub upriority: i32,

    pub parent: Option<TaskId>,
    /// Newest son first
    pub sons: Vec<TaskId>,

    pub std_port: Option<PortId>,
    pub blind_port: Option<PortId>,
    /// Port this task is blocked receiving on
    pub wport: Option<PortId>,
    /// Owned ports, most recently acquired first
    pub ports: Vec<PortId>,

    /// Locks held, most recently acquired first
    pub locks: Vec<LockId>,
    pub spin_lock: Option<LockId>,

    /// Timed event (compute, block, sleep, sync end)
    pub tep: Option<EventHandle>,
    /// Quantum event
    pub qep: Option<EventHandle>,
    /// Receive timeout event
    pub rtoep: Option<EventHandle>,

    /// Remaining compute time carried over a preemption
    pub rct: f64,
    /// Quantum expired during a sync interval
    pub qx: bool,
    pub sched_time: f64,
    pub end_compute_time: f64,

    pub group: Option<GroupId>,
    pub si: Option<SchedId>,
    pub dye: Option<Dye>,
}

impl Task {
    pub fn new(name: String, node: NodeId, host: Option<usize>, priority: i32, tsn: u64) -> Self {
        Self {
            name,
            state: TaskState::Suspended,
            role: TaskRole::User,
            tsn,
            node,
            host,
            uhost: host,
            hp: None,
            priority,
            upriority: priority,
            parent: None,
            sons: Vec::new(),
            std_port: None,
            blind_port: None,
            wport: None,
            ports: Vec::new(),
            locks: Vec::new(),
            spin_lock: None,
            tep: None,
            qep: None,
            rtoep: None,
            rct: 0.0,
            qx: false,
            sched_time: 0.0,
            end_compute_time: 0.0,
            group: None,
            si: None,
            dye: None,
        }
    }
}
