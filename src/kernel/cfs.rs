//! Completely fair scheduling
//!
//! Each processor of a CFS node has a run queue ordered by key, where
//! a smaller key means a task owed more processor time. Groups add a
//! second level: the processor queue holds one entry per group, and each
//! group entry owns a queue of that group's tasks on the processor.
//!
//! Design:
//! - `fair` tracks how much service an entity is owed; the running
//!   entity's `fair` drains while every waiting entity's grows
//! - Running tasks stay in their queue; they are re-keyed whenever their
//!   accounting is brought up to date
//! - A running task is only displaced when a waiting task from another
//!   group, or one owed noticeably more (`GRANULARITY`), is at the front
//! - Capped groups that overdraw their share are put to sleep until
//!   their debt is repaid

use std::cmp::Ordering;
use std::collections::BTreeMap;

use super::calendar::EventKind;
use super::error::abort;
use super::node::NodeId;
use super::table::handle;
use super::task::{TaskId, TaskState};
use super::Kernel;

/// Lead in `fair` a waiting task needs before it displaces the running one
const GRANULARITY: f64 = 0.05;

handle!(
    /// Scheduling record of a task or of a group on one processor
    SchedId
);

/// Index of a run queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct RqId(pub usize);

/// Totally ordered queue key
#[derive(Debug, Clone, Copy)]
pub(crate) struct FairKey(pub f64);

impl PartialEq for FairKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FairKey {}

impl PartialOrd for FairKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FairKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct SchedInfo {
    /// Task this record schedules; `None` for a group entry
    pub task: Option<TaskId>,
    /// Queue owned by a group entry
    pub own_rq: Option<RqId>,
    /// Queue this record waits in
    pub rq: RqId,
    /// Group entry above a grouped task
    pub parent: Option<SchedId>,
    pub fair: f64,
    pub key: f64,
    /// Slice granted for the current compute
    pub q: f64,
    pub exec_time: f64,
    pub sched_time: f64,
    pub weight: f64,
    /// Position in `rq`; present exactly while queued
    pub slot: Option<(FairKey, u64)>,
}

impl SchedInfo {
    pub fn new(task: Option<TaskId>, rq: RqId, weight: f64, q: f64) -> Self {
        Self {
            task,
            own_rq: None,
            rq,
            parent: None,
            fair: 0.0,
            key: 0.0,
            q,
            exec_time: 0.0,
            sched_time: 0.0,
            weight,
            slot: None,
        }
    }

    pub fn on_rq(&self) -> bool {
        self.slot.is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct RunQueue {
    pub tree: BTreeMap<(FairKey, u64), SchedId>,
    pub next_seq: u64,
    pub nready: usize,
    pub curr: Option<SchedId>,
    /// Group entry owning this queue
    pub si: Option<SchedId>,
    pub fair: f64,
    pub exec_time: f64,
    pub sched_time: f64,
    pub load: i64,
}

impl RunQueue {
    pub fn new(sched_time: f64, si: Option<SchedId>) -> Self {
        Self {
            sched_time,
            si,
            ..Self::default()
        }
    }

    fn leftmost(&self) -> Option<SchedId> {
        self.tree.values().next().copied()
    }
}

impl Kernel {
    fn si(&self, id: SchedId) -> &SchedInfo {
        match self.sis.get(id) {
            Some(si) => si,
            None => abort("scheduling record does not exist"),
        }
    }

    fn si_mut(&mut self, id: SchedId) -> &mut SchedInfo {
        match self.sis.get_mut(id) {
            Some(si) => si,
            None => abort("scheduling record does not exist"),
        }
    }

    fn task_si(&self, tp: TaskId) -> SchedId {
        match self.task(tp).si {
            Some(si) => si,
            None => abort("CFS task without scheduling record"),
        }
    }

    /// Processor run queue of a CFS node
    pub(crate) fn host_rq(&self, np: NodeId, h: usize) -> RqId {
        match self.nodes[np.0].cpus[h].rq {
            Some(rq) => rq,
            None => abort("CFS processor without run queue"),
        }
    }

    pub(crate) fn new_rq(&mut self, rq: RunQueue) -> RqId {
        self.rqs.push(rq);
        RqId(self.rqs.len() - 1)
    }

    // ========================================================================
    // Accounting
    // ========================================================================

    /// Charge the running entity of `rq` for the time since the queue
    /// was last updated
    fn update_cfs_curr(&mut self, rq: RqId) {
        let now = self.now;
        let delta = now - self.rqs[rq.0].sched_time;
        if delta == 0.0 {
            return;
        }
        let Some(curr) = self.rqs[rq.0].curr else {
            self.rqs[rq.0].sched_time = now;
            return;
        };
        let nready = self.rqs[rq.0].nready;
        if nready > 0 {
            let delta_fair = delta / nready as f64;
            let si = self.si_mut(curr);
            if si.weight != 1.0 {
                si.fair -= delta * (1.0 - si.weight);
            } else {
                si.fair -= delta - delta_fair;
            }
            si.exec_time += delta;
            si.sched_time = now;
            let queue = &mut self.rqs[rq.0];
            queue.fair += delta_fair;
            queue.exec_time += delta;
            queue.sched_time = now;
        } else {
            self.si_mut(curr).sched_time = now;
            self.rqs[rq.0].sched_time = now;
        }
    }

    /// Credit a waiting entity for the service its queue handed out
    fn update_ready(&mut self, id: SchedId) {
        let rq = self.si(id).rq;
        let delta = self.rqs[rq.0].sched_time - self.si(id).sched_time;
        if delta == 0.0 {
            return;
        }
        if self.rqs[rq.0].curr == Some(id) {
            self.update_cfs_curr(rq);
            return;
        }
        let (rq_fair, nready) = (self.rqs[rq.0].fair, self.rqs[rq.0].nready);
        let now = self.now;
        let si = self.si_mut(id);
        let mut delta_fair = rq_fair - si.key - si.fair;
        if delta_fair == 0.0 {
            delta_fair = if nready > 0 {
                delta / nready as f64
            } else {
                delta
            };
        }
        if si.weight != 1.0 {
            si.fair += delta_fair * si.weight * nready as f64;
        } else {
            si.fair += delta_fair;
        }
        si.sched_time = now;
    }

    fn enque_si(&mut self, id: SchedId) {
        let rq = self.si(id).rq;
        self.update_cfs_curr(rq);
        if self.si(id).on_rq() {
            return;
        }
        let now = self.now;
        let rq_fair = self.rqs[rq.0].fair;
        let seq = self.rqs[rq.0].next_seq;
        self.rqs[rq.0].next_seq += 1;

        let si = self.si_mut(id);
        let ahead = si.sched_time - now;
        if ahead > 0.0 {
            si.fair -= ahead * si.weight;
        }
        si.key = rq_fair - si.fair;
        let slot = (FairKey(si.key), seq);
        si.slot = Some(slot);
        si.sched_time = now;

        let queue = &mut self.rqs[rq.0];
        queue.tree.insert(slot, id);
        queue.nready += 1;
    }

    fn dq_si(&mut self, id: SchedId) {
        let Some(slot) = self.si(id).slot else {
            abort("Ready task missing from CFS run queue");
        };
        let rq = self.si(id).rq;
        self.update_cfs_curr(rq);
        if self.rqs[rq.0].curr != Some(id) {
            self.update_ready(id);
        }
        let queue = &mut self.rqs[rq.0];
        queue.tree.remove(&slot);
        queue.nready -= 1;
        self.si_mut(id).slot = None;
    }

    /// Queue a task, and its group entry if the group was empty
    pub(crate) fn enqueue_cfs_task(&mut self, tp: TaskId) {
        let first = self.task_si(tp);
        let mut cursor = Some(first);
        while let Some(id) = cursor {
            if self.si(id).on_rq() {
                break;
            }
            self.enque_si(id);
            cursor = self.si(id).parent;
        }
        self.adjust_load(first, 1);
    }

    /// Remove a task, and any group entry left empty
    pub(crate) fn dq_cfs_task(&mut self, tp: TaskId) {
        let first = self.task_si(tp);
        let mut cursor = Some(first);
        while let Some(id) = cursor {
            self.dq_si(id);
            if self.rqs[self.si(id).rq.0].nready > 0 {
                break;
            }
            cursor = self.si(id).parent;
        }
        self.adjust_load(first, -1);
    }

    fn adjust_load(&mut self, first: SchedId, by: i64) {
        let rq = self.si(first).rq;
        self.rqs[rq.0].load += by;
        if let Some(parent) = self.si(first).parent {
            let parent_rq = self.si(parent).rq;
            self.rqs[parent_rq.0].load += by;
        }
    }

    /// Whether the waiting `ready` task should displace `run`
    fn check_fair(&self, run: TaskId, ready: TaskId) -> bool {
        if run == ready {
            return false;
        }
        if self.task(run).group != self.task(ready).group {
            return true;
        }
        let run_fair = self.si(self.task_si(run)).fair;
        let ready_fair = self.si(self.task_si(ready)).fair;
        run_fair <= ready_fair + GRANULARITY
    }

    /// Bring a running task's accounting up to date and re-key it
    pub(crate) fn update_run_task(&mut self, tp: TaskId) {
        let first = self.task_si(tp);
        let rq = self.si(first).rq;
        if self.rqs[rq.0].curr != Some(first) {
            abort("Not a run task");
        }
        if self.now == self.si(first).sched_time {
            return;
        }
        let mut cursor = Some(first);
        while let Some(id) = cursor {
            self.dq_si(id);
            self.enque_si(id);
            cursor = self.si(id).parent;
        }

        let np = self.task(tp).node;
        let Some(h) = self.task(tp).hp else {
            return;
        };
        let group_rqs = self.nodes[np.0].cpus[h].group_rqs.clone();
        for grq in group_rqs {
            let Some(gsi) = self.rqs[grq.0].si else {
                continue;
            };
            if !self.si(gsi).on_rq() {
                continue;
            }
            let host_rq = self.si(gsi).rq;
            if self.rqs[host_rq.0].curr == Some(gsi) {
                continue;
            }
            self.update_ready(gsi);
            self.dq_si(gsi);
            self.enque_si(gsi);
        }
    }

    fn update_ready_task(&mut self, tp: TaskId) {
        let id = self.task_si(tp);
        let rq = self.si(id).rq;
        if self.rqs[rq.0].sched_time != self.now {
            self.update_cfs_curr(rq);
        }
        self.update_ready(id);
    }

    /// Sleepers are not credited for the time they were away
    pub(crate) fn update_sleep_task(&mut self, tp: TaskId) {
        let now = self.now;
        let id = self.task_si(tp);
        self.si_mut(id).sched_time = now;
    }

    fn set_cfs_task_run(&mut self, tp: TaskId) {
        let id = self.task_si(tp);
        let rq = self.si(id).rq;
        self.rqs[rq.0].curr = Some(id);
        if let Some(parent) = self.si(id).parent {
            let parent_rq = self.si(parent).rq;
            self.rqs[parent_rq.0].curr = Some(parent);
        }
    }

    pub(crate) fn cooling_cfs_task(&mut self, tp: TaskId) {
        let id = self.task_si(tp);
        let rq = self.si(id).rq;
        self.rqs[rq.0].curr = None;
        if let Some(parent) = self.si(id).parent {
            let parent_rq = self.si(parent).rq;
            self.rqs[parent_rq.0].curr = None;
        }
    }

    /// Take a task off its CFS processor queue when it stops running
    pub(crate) fn leave_cfs_cpu(&mut self, tp: TaskId) {
        let Some(id) = self.task(tp).si else {
            return;
        };
        if self.si(id).on_rq() {
            self.dq_cfs_task(tp);
        }
        self.cooling_cfs_task(tp);
    }

    /// Slice for a compute of length `delta` on processor `h`
    pub(crate) fn get_quantum(&self, np: NodeId, h: usize, delta: f64) -> f64 {
        let max = self.nodes[np.0].quantum;
        let min = max / 5.0;
        let load = self.rqs[self.host_rq(np, h).0].load;
        (delta / (load + 1) as f64).clamp(min, max)
    }

    pub(crate) fn set_cfs_slice(&mut self, tp: TaskId, delta: f64) {
        let (np, hp) = (self.task(tp).node, self.task(tp).hp);
        let (Some(h), Some(id)) = (hp, self.task(tp).si) else {
            return;
        };
        let q = self.get_quantum(np, h, delta);
        self.si_mut(id).q = q;
    }

    pub(crate) fn find_min_load_host(&self, np: NodeId, tp: TaskId) -> usize {
        let node = &self.nodes[np.0];
        if node.ncpu == 1 {
            return 0;
        }
        let host_load = |h: usize| node.cpus[h].rq.map_or(0, |rq| self.rqs[rq.0].load);
        match self.task(tp).group.map(|g| self.groups[g.0].ordinal) {
            Some(ordinal) => {
                let group_ready = |h: usize| self.rqs[node.cpus[h].group_rqs[ordinal].0].nready;
                let mut host = 0;
                for h in 1..node.ncpu {
                    let (load, min) = (group_ready(h), group_ready(host));
                    if load < min || (load == min && host_load(h) < host_load(host)) {
                        host = h;
                    }
                }
                host
            }
            None => {
                let mut host = 0;
                for h in 1..node.ncpu {
                    if host_load(h) < host_load(host) {
                        host = h;
                    }
                }
                host
            }
        }
    }

    /// Task owed the most service on a processor queue
    fn find_fair_task(&self, rq: RqId) -> Option<TaskId> {
        let id = self.rqs[rq.0].leftmost()?;
        let si = self.si(id);
        match si.own_rq {
            Some(own) => {
                let inner = self.rqs[own.0].leftmost()?;
                self.si(inner).task
            }
            None => si.task,
        }
    }

    /// Make a task Ready on processor `h` of its CFS node
    pub(crate) fn ready_cfs(&mut self, h: usize, tp: TaskId) {
        let now = self.now;
        let np = self.task(tp).node;
        {
            let task = self.task_mut(tp);
            task.state = TaskState::Ready;
            task.sched_time = now;
            task.hp = Some(h);
        }
        self.ts_report(tp, "ready");

        let id = self.task_si(tp);
        let group = self.task(tp).group.map(|g| self.groups[g.0].ordinal);
        match group {
            Some(ordinal) => {
                let rq = self.nodes[np.0].cpus[h].group_rqs[ordinal];
                let parent = self.rqs[rq.0].si;
                let si = self.si_mut(id);
                si.rq = rq;
                si.parent = parent;
            }
            None => {
                let rq = self.host_rq(np, h);
                self.si_mut(id).rq = rq;
            }
        }
        self.enqueue_cfs_task(tp);
    }

    // ========================================================================
    // Dispatching
    // ========================================================================

    pub(crate) fn find_host_cfs(&mut self, tp: TaskId) {
        self.task_mut(tp).sched_time = self.now;
        let np = self.task(tp).node;
        let h = match self.task(tp).host {
            Some(h) => h,
            None => self.find_min_load_host(np, tp),
        };
        self.qxflag = true;
        self.ready_cfs(h, tp);
        self.qxflag = false;

        if self.nodes[np.0].cpus[h].busy {
            if self.hot == Some(tp) {
                self.sched();
            }
            return;
        }

        self.claim_cpu(np, h);
        self.ts_report(tp, "executing");
        self.set_cfs_task_run(tp);
        self.set_run_task(np, h, Some(tp));
        self.task_mut(tp).hp = Some(h);
        self.start_quantum(tp);

        let rct = self.task(tp).rct;
        if rct > 0.0 {
            let ev = self.add_event(self.now + rct, EventKind::EndCompute(tp));
            let task = self.task_mut(tp);
            task.tep = Some(ev);
            task.rct = 0.0;
            task.state = TaskState::Computing;
        } else if self.hot.is_none() {
            self.hot = Some(tp);
            self.task_mut(tp).state = TaskState::Hot;
        } else if self.hot != Some(tp) {
            let ev = self.add_event(self.now, EventKind::EndBlock(tp));
            let task = self.task_mut(tp);
            task.tep = Some(ev);
            task.state = TaskState::Blocked;
        } else {
            self.task_mut(tp).state = TaskState::Hot;
        }
    }

    pub(crate) fn find_priority_cfs(&mut self, np: NodeId, h: usize) {
        let Some(cur) = self.nodes[np.0].cpus[h].run_task else {
            abort("find_priority on an idle processor");
        };
        self.update_run_task(cur);

        if let Some(gid) = self.task(cur).group {
            let parent = self.si(self.task_si(cur)).parent;
            let overdrawn = parent.is_some_and(|p| self.si(p).fair < 0.0);
            if overdrawn && self.groups[gid.0].cap {
                self.cap_handler(cur);
                return;
            }
        }

        let host_rq = self.host_rq(np, h);
        let mut candidate = None;
        if let Some(ctp) = self.find_fair_task(host_rq) {
            if ctp != cur {
                self.update_ready_task(ctp);
                if self.check_fair(cur, ctp) {
                    candidate = Some(ctp);
                }
            }
        }

        let Some(ctp) = candidate else {
            self.qxflag = false;
            if self.hot.is_none() {
                let quantum = self.nodes[np.0].quantum;
                let qep_due = self
                    .task(cur)
                    .qep
                    .is_none_or(|ev| self.calendar.time_of(ev) <= self.now);
                if quantum > 0.0 && qep_due {
                    self.start_quantum(cur);
                } else {
                    self.hot = Some(cur);
                    self.task_mut(cur).state = TaskState::Hot;
                }
            }
            return;
        };

        if let Some(due) = self.cancel_tep(cur) {
            self.task_mut(cur).rct = due - self.now;
        }
        self.cancel_qep(cur);
        self.dq_lock(cur);
        self.cooling_cfs_task(cur);
        // Still queued: the running task never left its queue
        self.dq_cfs_task(cur);
        self.ready_cfs(h, cur);
        self.qxflag = false;
        self.ts_report(ctp, "executing");
        self.set_cfs_task_run(ctp);
        self.set_run_task(np, h, Some(ctp));
        self.task_mut(ctp).hp = Some(h);
        self.start_quantum(ctp);
        self.hand_over(cur, ctp);
    }

    pub(crate) fn find_ready_cfs(&mut self, np: NodeId, h: usize) {
        let host_rq = self.host_rq(np, h);
        match self.find_fair_task(host_rq) {
            Some(ctp) => {
                self.ts_report(ctp, "executing");
                self.set_cfs_task_run(ctp);
                self.set_run_task(np, h, Some(ctp));
                self.task_mut(ctp).hp = Some(h);
                self.start_quantum(ctp);
                self.take_over(ctp);
            }
            None => {
                self.idle_cpu(np, h);
                if self.hot_is_cooling() {
                    self.sched();
                }
            }
        }
    }

    /// Put every task of an overdrawn capped group on this processor to
    /// sleep until the group's debt is repaid
    fn cap_handler(&mut self, tp: TaskId) {
        let np = self.task(tp).node;
        let Some(h) = self.task(tp).hp else {
            abort("capped task without a processor");
        };
        let si = self.task_si(tp);
        let Some(group_si) = self.si(si).parent else {
            return;
        };
        let rq = self.si(si).rq;
        let fair = -self.si(group_si).fair;
        let delta = 2.0 * fair / self.si(group_si).weight;

        while let Some(id) = self.rqs[rq.0].leftmost() {
            self.dq_si(id);
            let Some(ctp) = self.si(id).task else {
                continue;
            };
            self.task_mut(ctp).state = TaskState::Sleeping;
            self.ts_report(ctp, "sleeping");
            self.log_angio_event_for(ctp, &format!("wDelay {}", super::stats::format_g(delta, 6, false)));
            self.cancel_qep(ctp);
            if let Some(due) = self.cancel_tep(ctp) {
                self.task_mut(ctp).rct = due - self.now;
            }
            let ev = self.add_event(self.now + delta, EventKind::EndSleep(ctp));
            self.task_mut(ctp).tep = Some(ev);
        }

        self.rqs[rq.0].curr = None;
        self.rqs[rq.0].load = 0;
        self.dq_si(group_si);
        let parent_rq = self.si(group_si).rq;
        self.rqs[parent_rq.0].curr = None;
        let now = self.now;
        let gsi = self.si_mut(group_si);
        gsi.fair = fair;
        gsi.sched_time = now + delta;
        self.task_mut(tp).hp = None;
        self.find_ready(np, h);
    }

    pub fn cfs_fair(&self, tp: TaskId) -> Option<f64> {
        let id = self.tasks.get(tp)?.si?;
        self.sis.get(id).map(|si| si.fair)
    }

    pub fn cfs_slice(&self, tp: TaskId) -> Option<f64> {
        let id = self.tasks.get(tp)?.si?;
        self.sis.get(id).map(|si| si.q)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    use super::*;
    use crate::kernel::node::{Discipline, GroupId, StatFlags};
    use crate::kernel::syscall::boxed_body;
    use crate::kernel::task::TaskRole;
    use crate::kernel::{SimConfig, Simulation, TaskCtx};

    fn fair_node(ncpu: usize) -> (Kernel, NodeId) {
        let mut kernel = Kernel::new(&SimConfig::default());
        let np = kernel
            .build_node("fair", ncpu, 1.0, 1.0, Discipline::Cfs, StatFlags::NONE)
            .unwrap();
        (kernel, np)
    }

    fn spawn(kernel: &mut Kernel, np: NodeId, group: Option<GroupId>) -> TaskId {
        let body = boxed_body(|_ctx: TaskCtx| async {});
        kernel.spawn_task("t".to_string(), np, None, 1, group, TaskRole::User, body)
    }

    fn set_fair(kernel: &mut Kernel, tp: TaskId, fair: f64) {
        let si = kernel.task_si(tp);
        kernel.si_mut(si).fair = fair;
    }

    fn quiet() -> Simulation {
        Simulation::new(SimConfig {
            warning: false,
            ..SimConfig::default()
        })
    }

    #[test]
    fn test_check_fair_needs_more_than_granularity() {
        let (mut k, np) = fair_node(1);
        let run = spawn(&mut k, np, None);
        let ready = spawn(&mut k, np, None);
        assert!(!k.check_fair(run, run));

        set_fair(&mut k, run, 0.0);
        set_fair(&mut k, ready, 0.0);
        assert!(k.check_fair(run, ready));

        set_fair(&mut k, run, GRANULARITY / 2.0);
        assert!(k.check_fair(run, ready));

        set_fair(&mut k, run, 1.0);
        assert!(!k.check_fair(run, ready));
    }

    #[test]
    fn test_check_fair_across_groups_always_switches() {
        let (mut k, np) = fair_node(1);
        let g = k.build_group("g", 0.5, np, false).unwrap();
        let run = spawn(&mut k, np, None);
        let ready = spawn(&mut k, np, Some(g));
        set_fair(&mut k, run, 10.0);
        set_fair(&mut k, ready, 0.0);
        assert!(k.check_fair(run, ready));
    }

    #[test]
    fn test_min_load_host_picks_lightest_queue() {
        let (mut k, np) = fair_node(3);
        let tp = spawn(&mut k, np, None);
        for (h, load) in [2, 0, 1].into_iter().enumerate() {
            let rq = k.host_rq(np, h);
            k.rqs[rq.0].load = load;
        }
        assert_eq!(k.find_min_load_host(np, tp), 1);

        for h in 0..3 {
            let rq = k.host_rq(np, h);
            k.rqs[rq.0].load = 1;
        }
        assert_eq!(k.find_min_load_host(np, tp), 0);
    }

    #[test]
    fn test_min_load_host_for_group_breaks_ties_on_host_load() {
        let (mut k, np) = fair_node(3);
        let g = k.build_group("g", 1.0, np, false).unwrap();
        let tp = spawn(&mut k, np, Some(g));
        for (h, (nready, load)) in [(1, 0), (0, 3), (0, 1)].into_iter().enumerate() {
            let group_rq = k.nodes[np.0].cpus[h].group_rqs[0];
            k.rqs[group_rq.0].nready = nready;
            let rq = k.host_rq(np, h);
            k.rqs[rq.0].load = load;
        }
        assert_eq!(k.find_min_load_host(np, tp), 2);
    }

    #[test]
    fn test_new_tasks_spread_over_idle_hosts() {
        let mut sim = quiet();
        let cpu = sim
            .build_node("fair", 2, 1.0, 1.0, Discipline::Cfs, StatFlags::NONE)
            .unwrap();
        let done = Rc::new(RefCell::new(Vec::new()));
        let done_clone = done.clone();

        sim.run(100.0, move |ctx| async move {
            for name in ["a", "b"] {
                let done = done_clone.clone();
                let tid = ctx
                    .create(name, cpu, None, 1, move |ctx| async move {
                        ctx.compute(5.0).await.unwrap();
                        done.borrow_mut().push((name, ctx.now()));
                    })
                    .unwrap();
                ctx.resume(tid).await.unwrap();
            }
            ctx.sleep(1.0e6).await.unwrap();
        })
        .unwrap();

        // Sharing one processor would have pushed the pair out to 10
        assert_eq!(*done.borrow(), vec![("a", 5.0), ("b", 5.0)]);
    }

    #[test]
    fn test_capped_groups_get_their_share() {
        let mut sim = quiet();
        let cpu = sim
            .build_node("fair", 1, 1.0, 1.0, Discipline::Cfs, StatFlags::NONE)
            .unwrap();
        let lite = sim.build_group("lite", 0.25, cpu, true).unwrap();
        let heavy = sim.build_group("heavy", 0.75, cpu, true).unwrap();
        let busy = Rc::new([Cell::new(0.0f64), Cell::new(0.0f64)]);
        let busy_clone = busy.clone();

        let report = sim
            .run(4000.0, move |ctx| async move {
                for (i, group) in [lite, heavy].into_iter().enumerate() {
                    let busy = busy_clone.clone();
                    let tid = ctx
                        .create_in_group(&format!("w{i}"), cpu, None, 1, group, move |ctx| async move {
                            loop {
                                ctx.compute(1.0).await.unwrap();
                                busy[i].set(busy[i].get() + 1.0);
                            }
                        })
                        .unwrap();
                    ctx.resume(tid).await.unwrap();
                }
                ctx.sleep(1.0e6).await.unwrap();
            })
            .unwrap();

        let lite_util = report.get("lite Utilization").unwrap().mean;
        let heavy_util = report.get("heavy Utilization").unwrap().mean;
        assert!((lite_util - 0.25).abs() < 0.05, "lite got {lite_util}");
        assert!((heavy_util - 0.75).abs() < 0.05, "heavy got {heavy_util}");
        let (a, b) = (busy[0].get(), busy[1].get());
        assert!(b > 2.0 * a, "completed work {a} vs {b}");
    }

    #[test]
    fn test_fair_key_total_order() {
        let mut keys = [FairKey(1.0), FairKey(-2.0), FairKey(0.5)];
        keys.sort();
        assert_eq!(keys.map(|k| k.0), [-2.0, 0.5, 1.0]);
    }

    #[test]
    fn test_rq_leftmost_uses_seq_for_ties() {
        use crate::kernel::table::Handle;
        let mut rq = RunQueue::new(0.0, None);
        let a = SchedId::from_parts(0, 0);
        let b = SchedId::from_parts(1, 0);
        rq.tree.insert((FairKey(0.0), 1), b);
        rq.tree.insert((FairKey(0.0), 0), a);
        assert_eq!(rq.leftmost(), Some(a));
    }
}
