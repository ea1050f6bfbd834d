//! Simulation driver
//!
//! Owns the kernel and the task bodies. The run loop pops the earliest
//! calendar event, advances the clock to it and dispatches it; whenever a
//! handler leaves a task hot, the driver polls that task's body until the
//! processor comes back to the driver.
//!
//! Design:
//! - The driver is the only place that moves time forward
//! - Exactly one body runs at a time; its calls go through `TaskCtx`
//! - Bodies of killed tasks are dropped here, never polled again
//! - A run ends at the first event past the run time; block statistics
//!   due exactly at the run time are still collected

use std::cell::{Ref, RefCell};
use std::future::Future;
use std::rc::Rc;

use super::calendar::EventKind;
use super::config::SimConfig;
use super::error::{abort, SyscallResult};
use super::executor::{Executor, Polled};
use super::medium::{BusId, LinkId};
use super::node::{Discipline, GroupId, NodeId, StatFlags};
use super::stats::StatsReport;
use super::syscall::{boxed_body, TaskCtx};
use super::task::{TaskId, TaskRole};
use super::trace::TraceEvent;
use super::{Kernel, MAX_PRIORITY};

/// What the step hook sees before each event is dispatched
#[derive(Debug, Clone, PartialEq)]
pub struct StepInfo {
    /// Time the event fires at
    pub now: f64,
    pub event: &'static str,
    /// Events still on the calendar, this one included
    pub pending: usize,
}

type StepHook = Box<dyn FnMut(&StepInfo)>;

/// One simulated system
pub struct Simulation {
    kernel: Rc<RefCell<Kernel>>,
    executor: Executor,
    step: Option<StepHook>,
    genesis: Option<TaskId>,
}

impl Simulation {
    pub fn new(config: SimConfig) -> Self {
        Self {
            kernel: Rc::new(RefCell::new(Kernel::new(&config))),
            executor: Executor::new(),
            step: None,
            genesis: None,
        }
    }

    /// Read-only view of the kernel, for inspection between runs
    pub fn kernel(&self) -> Ref<'_, Kernel> {
        self.kernel.borrow()
    }

    /// Call `hook` before every dispatched event
    pub fn on_step(&mut self, hook: impl FnMut(&StepInfo) + 'static) {
        self.step = Some(Box::new(hook));
    }

    // ========================================================================
    // Hardware
    // ========================================================================

    pub fn build_node(
        &mut self,
        name: &str,
        ncpu: usize,
        speed: f64,
        quantum: f64,
        discipline: Discipline,
        sf: StatFlags,
    ) -> SyscallResult<NodeId> {
        self.kernel
            .borrow_mut()
            .build_node(name, ncpu, speed, quantum, discipline, sf)
    }

    pub fn build_bus(
        &mut self,
        name: &str,
        nodes: &[NodeId],
        rate: f64,
        discipline: Discipline,
        sf: StatFlags,
    ) -> SyscallResult<BusId> {
        self.kernel
            .borrow_mut()
            .build_bus(name, nodes, rate, discipline, sf)
    }

    pub fn build_link(
        &mut self,
        name: &str,
        source: NodeId,
        destination: NodeId,
        rate: f64,
        sf: StatFlags,
    ) -> SyscallResult<LinkId> {
        self.kernel
            .borrow_mut()
            .build_link(name, source, destination, rate, sf)
    }

    pub fn build_group(&mut self, name: &str, share: f64, node: NodeId, cap: bool) -> SyscallResult<GroupId> {
        self.kernel.borrow_mut().build_group(name, share, node, cap)
    }

    /// Turn causal tracing on; only before the run starts
    pub fn enable_angio_tracing(&mut self) -> SyscallResult<()> {
        self.kernel.borrow_mut().enable_angio()
    }

    // ========================================================================
    // Running
    // ========================================================================

    /// Run for `duration` units of simulated time. `genesis` is the body
    /// of the first task, on node 0 at the highest user priority.
    pub fn run<F, Fut>(&mut self, duration: f64, genesis: F) -> SyscallResult<StatsReport>
    where
        F: FnOnce(TaskCtx) -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        {
            let mut k = self.kernel.borrow_mut();
            if self.genesis.is_some() {
                return Err(k.bad_call("run", "Simulation has already run"));
            }
            if duration <= 0.0 {
                return Err(k.bad_param("run", "duration"));
            }
            k.run_time = duration;
            let tid = k.spawn_task(
                "Genesis".to_string(),
                NodeId(0),
                Some(0),
                MAX_PRIORITY,
                None,
                TaskRole::Genesis,
                boxed_body(genesis),
            );
            self.genesis = Some(tid);
            k.resume(tid)?;
        }
        tracing::debug!(target: "parasol::driver", duration, "run started");

        loop {
            self.drain();
            let Some(kind) = self.next_event(duration) else {
                break;
            };
            let mut k = self.kernel.borrow_mut();
            match kind {
                EventKind::EndSync(tp) => k.end_sync(tp),
                EventKind::EndCompute(tp) => k.end_compute(tp),
                EventKind::EndQuantum(tp) => k.end_quantum(tp),
                EventKind::EndTrans(medium) => k.end_trans(medium),
                EventKind::EndSleep(tp) => k.end_sleep(tp),
                EventKind::EndReceive(tp) => k.end_receive(tp),
                EventKind::EndBlock(tp) => k.end_block(tp),
                EventKind::StatBlock => k.stat_block(),
            }
        }

        let mut k = self.kernel.borrow_mut();
        k.now = duration;
        let text = k.render_stats();
        tracing::info!(target: "parasol::stats", "{text}");
        tracing::debug!(
            target: "parasol::driver",
            tasks = k.task_count(),
            "run finished"
        );
        Ok(k.stats_report())
    }

    /// Take the next event due within the run and advance the clock to
    /// it
    fn next_event(&mut self, run_time: f64) -> Option<EventKind> {
        let (time, kind, pending) = {
            let k = self.kernel.borrow();
            let Some((time, kind)) = k.calendar.iter().next() else {
                abort("Empty calendar");
            };
            if time < k.now {
                abort("Attempt to move time backwards");
            }
            (time, kind, k.calendar.len())
        };
        let (time, kind) = if time < run_time {
            self.kernel.borrow_mut().calendar.pop();
            (time, kind)
        } else if self
            .kernel
            .borrow_mut()
            .calendar
            .take_at(run_time, EventKind::StatBlock)
        {
            // The last batch of block statistics closes with the run
            (run_time, EventKind::StatBlock)
        } else {
            return None;
        };
        if let Some(hook) = self.step.as_mut() {
            hook(&StepInfo {
                now: time,
                event: kind.name(),
                pending,
            });
        }
        self.kernel.borrow_mut().now = time;
        Some(kind)
    }

    /// Run task bodies until the processor returns to the driver
    fn drain(&mut self) {
        loop {
            self.bind_spawned();
            self.drop_reaped();
            let Some(hot) = self.kernel.borrow().hot else {
                break;
            };
            match self.executor.poll(hot) {
                Polled::Pending => {
                    if self.kernel.borrow().hot == Some(hot) {
                        abort("hot task awaited outside a kernel call");
                    }
                }
                Polled::Finished | Polled::Missing => self.finish(hot),
            }
        }
        self.drop_reaped();
    }

    fn bind_spawned(&mut self) {
        let spawned = std::mem::take(&mut self.kernel.borrow_mut().pending_spawn);
        for (tid, body) in spawned {
            let ctx = TaskCtx::new(self.kernel.clone(), tid);
            self.executor.spawn(tid, body(ctx));
        }
    }

    fn drop_reaped(&mut self) {
        let reaped = std::mem::take(&mut self.kernel.borrow_mut().reaped);
        for tid in reaped {
            self.executor.cancel(tid);
        }
    }

    /// A body returned: Genesis waits suspended, anyone else dies
    fn finish(&mut self, tid: TaskId) {
        let mut k = self.kernel.borrow_mut();
        let Some(role) = k.tasks.get(tid).map(|task| task.role) else {
            return;
        };
        if role == TaskRole::Genesis {
            if let Err(err) = k.suspend(tid) {
                abort(&format!("cannot park Genesis: {err}"));
            }
        } else {
            k.kill_task(tid);
        }
    }

    // ========================================================================
    // Results
    // ========================================================================

    pub fn now(&self) -> f64 {
        self.kernel.borrow().now
    }

    /// The first task of the run
    pub fn genesis(&self) -> Option<TaskId> {
        self.genesis
    }

    /// Statistics table as text
    pub fn stats_text(&self) -> String {
        self.kernel.borrow().render_stats()
    }

    pub fn stats(&self) -> StatsReport {
        self.kernel.borrow().stats_report()
    }

    pub fn block_report(&self) -> Option<String> {
        self.kernel.borrow().block_report().map(str::to_string)
    }

    pub fn trace_events(&self) -> Vec<TraceEvent> {
        self.kernel.borrow().tracer.events().iter().cloned().collect()
    }

    pub fn angio_lines(&self) -> Vec<String> {
        self.kernel.borrow().angio_lines().to_vec()
    }

    /// Bodies still alive
    pub fn live_bodies(&self) -> usize {
        self.executor.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::task::TaskState;
    use std::cell::Cell;

    #[test]
    fn test_genesis_runs_and_is_parked() {
        let mut sim = Simulation::new(SimConfig::default());
        let ran = Rc::new(Cell::new(false));
        let ran_clone = ran.clone();
        sim.run(10.0, move |ctx| async move {
            ctx.compute(2.0).await.unwrap();
            ran_clone.set(ctx.now() == 2.0);
            // Keeps the calendar busy past the end of the run
            let node = ctx.my_node();
            let idler = ctx
                .create("idler", node, None, 1, |ctx| async move {
                    ctx.sleep(100.0).await.unwrap();
                })
                .unwrap();
            ctx.resume(idler).await.unwrap();
        })
        .unwrap();

        assert!(ran.get());
        assert_eq!(sim.now(), 10.0);
        let genesis = sim.genesis().unwrap();
        assert_eq!(sim.kernel().task_state(genesis), TaskState::Suspended);
    }

    #[test]
    fn test_run_twice_is_refused() {
        let mut sim = Simulation::new(SimConfig::default());
        sim.run(1.0, |ctx| async move {
            ctx.sleep(5.0).await.unwrap();
        })
        .unwrap();
        let err = sim.run(1.0, |_ctx| async {}).unwrap_err();
        assert_eq!(err.call(), "run");
    }

    #[test]
    fn test_bad_duration() {
        let mut sim = Simulation::new(SimConfig::default());
        assert!(sim.run(0.0, |_ctx| async {}).is_err());
    }

    #[test]
    #[should_panic(expected = "Empty calendar")]
    fn test_empty_calendar_aborts() {
        let mut sim = Simulation::new(SimConfig::default());
        sim.run(5.0, |ctx| async move {
            let me = ctx.id();
            ctx.suspend(me).await.unwrap();
        })
        .unwrap();
    }

    #[test]
    fn test_finished_body_is_killed() {
        let mut sim = Simulation::new(SimConfig::default());
        let child = Rc::new(Cell::new(None));
        let child_clone = child.clone();
        sim.run(10.0, move |ctx| async move {
            let node = ctx.my_node();
            let tid = ctx
                .create("worker", node, None, 5, |ctx| async move {
                    ctx.compute(1.0).await.unwrap();
                })
                .unwrap();
            child_clone.set(Some(tid));
            ctx.resume(tid).await.unwrap();
            ctx.sleep(3.0).await.unwrap();
            ctx.sleep(100.0).await.unwrap();
        })
        .unwrap();

        let tid = child.get().unwrap();
        assert_eq!(sim.kernel().task_state(tid), TaskState::Free);
        assert_eq!(sim.live_bodies(), 1);
    }

    #[test]
    fn test_step_hook_sees_every_event() {
        let mut sim = Simulation::new(SimConfig::default());
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_clone = seen.clone();
        sim.on_step(move |info| seen_clone.borrow_mut().push((info.now, info.event)));
        sim.run(10.0, |ctx| async move {
            ctx.compute(1.0).await.unwrap();
            ctx.sleep(2.0).await.unwrap();
            ctx.sleep(100.0).await.unwrap();
        })
        .unwrap();

        assert_eq!(
            *seen.borrow(),
            vec![(1.0, "END_COMPUTE"), (3.0, "END_SLEEP")]
        );
    }
}
