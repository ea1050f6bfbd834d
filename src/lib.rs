//! parasol - A discrete-event operating-system simulation kernel
//!
//! Simulates processors, tasks and the messages between them on a
//! virtual clock, entirely in user space:
//! - Tasks are async bodies driven by the kernel, one at a time
//! - Nodes schedule them FIFO, HOL, PR, RAND, LIFO or fair-share (CFS)
//! - Ports, port sets, shared ports, buses and links carry messages
//! - Locks and semaphores synchronize, statistics measure
//!
//! A run starts from a Genesis task on node 0:
//!
//! ```no_run
//! use parasol::{Discipline, SimConfig, Simulation, StatFlags};
//!
//! let mut sim = Simulation::new(SimConfig::default());
//! let cpu = sim
//!     .build_node("cpu", 1, 1.0, 0.0, Discipline::Fifo, StatFlags::PER_NODE)
//!     .unwrap();
//! sim.run(100.0, move |ctx| async move {
//!     let worker = ctx
//!         .create("worker", cpu, None, 1, |ctx| async move {
//!             loop {
//!                 ctx.compute(1.0).await.unwrap();
//!             }
//!         })
//!         .unwrap();
//!     ctx.resume(worker).await.unwrap();
//! })
//! .unwrap();
//! println!("{}", sim.stats_text());
//! ```

pub mod kernel;

pub use kernel::{
    ACK_TIMEOUT, ANY_HOST, BusId, Discipline, EventKind, GroupId, Kernel, LinkId, LockId,
    MAX_PRIORITY, MIN_PRIORITY, Message, NodeId, Payload, PortId, ReceiveOrder, SP_CANCEL,
    SP_REQUEST, SemId, SimConfig, Simulation, StatEntry, StatFlags, StatId, StatKind, StatsReport,
    StepInfo, SyscallError, SyscallResult, TaskCtx, TaskId, TaskState, Timeout, TraceEvent,
};
