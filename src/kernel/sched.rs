//! Processor dispatching
//!
//! Moves tasks between processors and ready queues. Every path that
//! hands out a processor ends the same way: the task computes out its
//! carried-over time, becomes hot directly (when the driver is the
//! caller), or is blocked until an END_BLOCK event at the current time
//! (when another task is hot).
//!
//! Design:
//! - `ready` places a task by discipline; `qxflag` makes the insert
//!   ignore equal priorities so a task whose quantum expired goes behind
//!   its peers
//! - Preemption happens only on PR nodes, and never to a sync task
//! - CFS nodes take the parallel paths in `cfs`

use super::calendar::EventKind;
use super::error::abort;
use super::node::{Discipline, NodeId, StatFlags};
use super::stats::StatKind;
use super::task::{TaskId, TaskState};
use super::{Kernel, MIN_PRIORITY};

impl Kernel {
    pub(crate) fn discipline(&self, np: NodeId) -> Discipline {
        self.nodes[np.0].discipline
    }

    // ========================================================================
    // Processor bookkeeping
    // ========================================================================

    /// Mark a processor busy and record utilization
    pub(crate) fn claim_cpu(&mut self, np: NodeId, h: usize) {
        let node = &mut self.nodes[np.0];
        node.cpus[h].busy = true;
        node.nfree -= 1;
        let busy = (node.ncpu - node.nfree) as f64;
        let (host_stat, node_stat) = (node.cpus[h].stat, node.stat);
        if let Some(sid) = host_stat {
            self.record_internal(sid, 1.0);
        }
        if let Some(sid) = node_stat {
            self.record_internal(sid, busy);
        }
    }

    /// Mark a processor idle and record utilization
    pub(crate) fn idle_cpu(&mut self, np: NodeId, h: usize) {
        let node = &mut self.nodes[np.0];
        node.nfree += 1;
        node.cpus[h].busy = false;
        let busy = (node.ncpu - node.nfree) as f64;
        let (host_stat, node_stat) = (node.cpus[h].stat, node.stat);
        if let Some(sid) = host_stat {
            self.record_internal(sid, 0.0);
        }
        if let Some(sid) = node_stat {
            self.record_internal(sid, busy);
        }
        self.set_run_task(np, h, None);
    }

    /// Change the task running on a processor, keeping per-task
    /// utilization up to date
    pub(crate) fn set_run_task(&mut self, np: NodeId, h: usize, tp: Option<TaskId>) {
        let old = std::mem::replace(&mut self.nodes[np.0].cpus[h].run_task, tp);
        if let Some(old) = old {
            self.record_task_util(np, h, old, 0.0);
            self.record_group_util(old, -1);
        }
        if let Some(tp) = tp {
            self.record_task_util(np, h, tp, 1.0);
            self.record_group_util(tp, 1);
        }
    }

    /// Processors busy with the group's tasks
    fn record_group_util(&mut self, tid: TaskId, by: i64) {
        let Some(gid) = self.tasks.get(tid).and_then(|task| task.group) else {
            return;
        };
        let group = &mut self.groups[gid.0];
        group.running = (group.running as i64 + by).max(0) as usize;
        let (sid, running) = (group.stat, group.running);
        self.record_internal(sid, running as f64);
    }

    fn record_task_util(&mut self, np: NodeId, h: usize, tid: TaskId, value: f64) {
        let sf = self.nodes[np.0].sf;
        let build_time = self.nodes[np.0].build_time;
        // Stats are opened on first run only; dead tasks keep theirs
        let opening = value > 0.0 && !self.is_internal(tid) && self.tasks.contains(tid);

        if sf.contains(StatFlags::PER_TASK_HOST) {
            let existing = self.nodes[np.0].cpus[h].task_stats.get(&tid).copied();
            let sid = match existing {
                Some(sid) => Some(sid),
                None if opening => {
                    let name = format!("{} (cpu {}) task {} Utilization", self.nodes[np.0].name, h, tid);
                    let sid = self.open_internal_stat(name, StatKind::Variable, build_time);
                    self.nodes[np.0].cpus[h].task_stats.insert(tid, sid);
                    Some(sid)
                }
                None => None,
            };
            if let Some(sid) = sid {
                self.record_internal(sid, value);
            }
        }

        if sf.contains(StatFlags::PER_TASK_NODE) {
            let existing = self.nodes[np.0].task_stats.get(&tid).copied();
            let sid = match existing {
                Some(sid) => Some(sid),
                None if opening => {
                    let name = format!("{} task {} Utilization", self.nodes[np.0].name, tid);
                    let sid = self.open_internal_stat(name, StatKind::Variable, build_time);
                    self.nodes[np.0].task_stats.insert(tid, sid);
                    Some(sid)
                }
                None => None,
            };
            if let Some(sid) = sid {
                self.record_internal(sid, value);
            }
        }

        let group = self.tasks.get(tid).and_then(|task| task.group);
        if let Some(gid) = group {
            let existing = self.groups[gid.0].task_stats.get(&tid).copied();
            let sid = match existing {
                Some(sid) => Some(sid),
                None if opening => {
                    let name = format!("{} task {} Utilization", self.groups[gid.0].name, tid);
                    let sid = self.open_internal_stat(name, StatKind::Variable, build_time);
                    self.groups[gid.0].task_stats.insert(tid, sid);
                    Some(sid)
                }
                None => None,
            };
            if let Some(sid) = sid {
                self.record_internal(sid, value);
            }
        }
    }

    /// Give a freshly assigned processor's task something to do: finish
    /// carried-over compute time, run now, or wait for an END_BLOCK
    fn start_on_cpu(&mut self, tp: TaskId) {
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
        }
    }

    // ========================================================================
    // Ready queue
    // ========================================================================

    /// Queue a task for a processor of its node
    pub(crate) fn ready(&mut self, tp: TaskId) {
        let np = self.task(tp).node;
        if self.discipline(np) == Discipline::Cfs {
            let task = self.task(tp);
            let h = match task.hp.or(task.host) {
                Some(h) => h,
                None => self.find_min_load_host(np, tp),
            };
            self.ready_cfs(h, tp);
            return;
        }

        let now = self.now;
        let (np, prio) = {
            let task = self.task_mut(tp);
            task.state = TaskState::Ready;
            task.hp = None;
            task.sched_time = now;
            (task.node, task.priority)
        };
        self.ts_report(tp, "ready");

        let discipline = self.discipline(np);
        let len = self.nodes[np.0].ready.len();
        let pos = match discipline {
            Discipline::Fifo => len,
            Discipline::Lifo => 0,
            Discipline::Rand => self.rng.choice(len + 1),
            // Stop before the first strictly lower priority
            _ if discipline == Discipline::Hol || self.qxflag => {
                self.ready_position(np, |p| p < prio)
            }
            // PR: stop before the first priority not above ours
            _ => self.ready_position(np, |p| p <= prio),
        };
        self.nodes[np.0].ready.insert(pos, tp);
    }

    fn ready_position(&self, np: NodeId, stop: impl Fn(i32) -> bool) -> usize {
        let queue = &self.nodes[np.0].ready;
        queue
            .iter()
            .position(|&t| stop(self.task(t).priority))
            .unwrap_or(queue.len())
    }

    /// Take a Ready task off its node's queue
    pub(crate) fn dq_ready(&mut self, tp: TaskId) {
        let np = self.task(tp).node;
        if self.discipline(np) == Discipline::Cfs {
            self.dq_cfs_task(tp);
            return;
        }
        let queue = &mut self.nodes[np.0].ready;
        match queue.iter().position(|&t| t == tp) {
            Some(pos) => {
                queue.remove(pos);
            }
            None => abort("Ready task missing from ready queue"),
        }
    }

    /// Ready task may run on processor `h`
    fn fits(&self, tp: TaskId, h: usize) -> bool {
        self.task(tp).host.is_none_or(|host| host == h)
    }

    // ========================================================================
    // Dispatching
    // ========================================================================

    /// Find a processor for a task that just became runnable, preempting
    /// a lower priority task on PR nodes. Queues it when none is found.
    pub(crate) fn find_host(&mut self, tp: TaskId) {
        self.task_mut(tp).sched_time = self.now;
        let np = self.task(tp).node;
        if self.discipline(np) == Discipline::Cfs {
            self.find_host_cfs(tp);
            return;
        }

        let want = self.task(tp).host;
        let mut host = None;
        {
            let node = &self.nodes[np.0];
            if node.nfree > 0 {
                host = match want {
                    None => node.first_idle(),
                    Some(h) if !node.cpus[h].busy => Some(h),
                    Some(_) => None,
                };
            }
        }
        if let Some(h) = host {
            self.claim_cpu(np, h);
        } else if self.discipline(np) == Discipline::Pr {
            if let Some(h) = self.preemptable_host(np, tp) {
                if self.preempt(np, h, tp) {
                    return;
                }
                host = Some(h);
            }
        }

        match host {
            Some(h) => {
                self.ts_report(tp, "executing");
                self.set_run_task(np, h, Some(tp));
                self.task_mut(tp).hp = Some(h);
                self.start_quantum(tp);
                self.start_on_cpu(tp);
                if self.hot == Some(tp) {
                    self.task_mut(tp).state = TaskState::Hot;
                }
            }
            None => {
                self.qxflag = true;
                self.ready(tp);
                self.qxflag = false;
                if self.hot == Some(tp) {
                    self.sched();
                }
            }
        }
    }

    /// Processor whose running task `tp` may preempt
    fn preemptable_host(&self, np: NodeId, tp: TaskId) -> Option<usize> {
        let node = &self.nodes[np.0];
        let prio = self.task(tp).priority;
        let victim = |h: usize| {
            node.cpus[h].run_task.and_then(|rt| {
                let task = self.tasks.get(rt)?;
                (task.priority < prio && !task.state.is_sync()).then_some(task.priority)
            })
        };
        match self.task(tp).host {
            Some(h) => victim(h).map(|_| h),
            None => {
                let mut best: Option<(usize, i32)> = None;
                for h in 0..node.ncpu {
                    if let Some(p) = victim(h) {
                        if best.is_none_or(|(_, bp)| p < bp) {
                            best = Some((h, p));
                        }
                    }
                }
                best.map(|(h, _)| h)
            }
        }
    }

    /// Push the running task of processor `h` back to the ready queue.
    /// Returns true when the victim was the hot task and `tp` has already
    /// taken over.
    fn preempt(&mut self, np: NodeId, h: usize, tp: TaskId) -> bool {
        let Some(victim) = self.nodes[np.0].cpus[h].run_task else {
            abort("preempting an idle processor");
        };
        self.cancel_qep(victim);
        match self.task(victim).state {
            TaskState::Computing | TaskState::Blocked => {
                let was_computing = self.task(victim).state == TaskState::Computing;
                if let Some(due) = self.cancel_tep(victim) {
                    if was_computing {
                        self.task_mut(victim).rct = due - self.now;
                    }
                }
                self.dq_lock(victim);
                self.ready(victim);
                false
            }
            TaskState::Spinning => {
                self.dq_lock(victim);
                self.ready(victim);
                false
            }
            TaskState::Hot => {
                self.ready(victim);
                self.hot = Some(tp);
                self.set_run_task(np, h, Some(tp));
                let task = self.task_mut(tp);
                task.state = TaskState::Hot;
                task.hp = Some(h);
                self.ts_report(tp, "executing");
                true
            }
            state => abort(&format!("preempting a task in state {state}")),
        }
    }

    /// Let a ready task with priority above `prio` take processor `h`
    /// from its running task; otherwise the running task carries on.
    pub(crate) fn find_priority(&mut self, np: NodeId, h: usize, prio: i32) {
        if self.discipline(np) == Discipline::Cfs {
            self.find_priority_cfs(np, h);
            return;
        }
        let Some(cur) = self.nodes[np.0].cpus[h].run_task else {
            abort("find_priority on an idle processor");
        };

        let mut found = None;
        for (i, &t) in self.nodes[np.0].ready.iter().enumerate() {
            if self.task(t).priority <= prio {
                break;
            }
            if self.fits(t, h) {
                found = Some(i);
                break;
            }
        }

        let Some(i) = found else {
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

        let Some(ctp) = self.nodes[np.0].ready.remove(i) else {
            return;
        };
        if let Some(due) = self.cancel_tep(cur) {
            self.task_mut(cur).rct = due - self.now;
        }
        self.cancel_qep(cur);
        self.dq_lock(cur);
        self.ready(cur);
        self.qxflag = false;
        self.ts_report(ctp, "executing");
        self.set_run_task(np, h, Some(ctp));
        self.task_mut(ctp).hp = Some(h);
        self.start_quantum(ctp);
        self.hand_over(cur, ctp);
    }

    /// Put `ctp` to work on the processor `cur` just gave up
    pub(crate) fn hand_over(&mut self, cur: TaskId, ctp: TaskId) {
        let rct = self.task(ctp).rct;
        if rct > 0.0 {
            let ev = self.add_event(self.now + rct, EventKind::EndCompute(ctp));
            let task = self.task_mut(ctp);
            task.tep = Some(ev);
            task.rct = 0.0;
            task.state = TaskState::Computing;
            if self.hot == Some(cur) {
                self.hot = None;
            }
        } else if self.hot.is_none() || self.hot == Some(cur) {
            self.hot = Some(ctp);
            self.task_mut(ctp).state = TaskState::Hot;
        } else {
            let ev = self.add_event(self.now, EventKind::EndBlock(ctp));
            let task = self.task_mut(ctp);
            task.tep = Some(ev);
            task.state = TaskState::Blocked;
        }
    }

    /// Hand a processor that was just given up to the next ready task,
    /// or idle it
    pub(crate) fn find_ready(&mut self, np: NodeId, h: usize) {
        if self.discipline(np) == Discipline::Cfs {
            self.find_ready_cfs(np, h);
            return;
        }

        let pos = self.nodes[np.0].ready.iter().position(|&t| self.fits(t, h));
        match pos.and_then(|i| self.nodes[np.0].ready.remove(i)) {
            Some(ctp) => {
                self.ts_report(ctp, "executing");
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

    /// Give up the processor `tp` holds and hand it to the next ready
    /// task. The caller sets the task's new state first.
    pub(crate) fn vacate_cpu(&mut self, tp: TaskId) {
        let np = self.task(tp).node;
        let Some(h) = self.task(tp).hp else {
            return;
        };
        if self.discipline(np) == Discipline::Cfs {
            self.update_run_task(tp);
            self.leave_cfs_cpu(tp);
        }
        self.task_mut(tp).hp = None;
        self.find_ready(np, h);
    }

    /// The hot task has stopped running (its state is no longer Hot)
    pub(crate) fn hot_is_cooling(&self) -> bool {
        self.hot
            .is_some_and(|h| self.task_state(h) != TaskState::Hot)
    }

    /// Start `ctp` on a processor found by `find_ready`
    pub(crate) fn take_over(&mut self, ctp: TaskId) {
        let rct = self.task(ctp).rct;
        let hot_running = self
            .hot
            .is_some_and(|h| self.task_state(h) == TaskState::Hot);
        if rct > 0.0 {
            let ev = self.add_event(self.now + rct, EventKind::EndCompute(ctp));
            let task = self.task_mut(ctp);
            task.tep = Some(ev);
            task.rct = 0.0;
            task.state = TaskState::Computing;
            if self.hot.is_some() && !hot_running {
                self.hot = None;
            }
        } else if hot_running {
            let ev = self.add_event(self.now, EventKind::EndBlock(ctp));
            let task = self.task_mut(ctp);
            task.tep = Some(ev);
            task.state = TaskState::Blocked;
        } else {
            self.hot = Some(ctp);
            self.task_mut(ctp).state = TaskState::Hot;
        }
    }

    /// Switch away from a hot task that stopped: to a task blocked until
    /// now, else to the driver
    pub(crate) fn sched(&mut self) {
        match self.calendar.take_block_due(self.now) {
            Some(tp) => {
                let task = self.task_mut(tp);
                if task.state != TaskState::Blocked {
                    abort("Bad END_BLOCK event");
                }
                task.tep = None;
                task.state = TaskState::Hot;
                self.hot = Some(tp);
            }
            None => self.hot = None,
        }
    }

    // ========================================================================
    // Event handlers
    // ========================================================================

    pub(crate) fn end_block(&mut self, tp: TaskId) {
        if self.task_state(tp) != TaskState::Blocked {
            abort("Bad end block event");
        }
        self.task_mut(tp).tep = None;
        self.hot = Some(tp);
        if self.discipline(self.task(tp).node) == Discipline::Cfs {
            self.update_run_task(tp);
        }
        self.task_mut(tp).state = TaskState::Hot;
    }

    pub(crate) fn end_compute(&mut self, tp: TaskId) {
        if self.task_state(tp) != TaskState::Computing {
            abort("Bad computing timeout event");
        }
        self.task_mut(tp).tep = None;
        self.hot = Some(tp);
        if self.discipline(self.task(tp).node) == Discipline::Cfs {
            self.update_run_task(tp);
        }
        let now = self.now;
        let task = self.task_mut(tp);
        task.state = TaskState::Hot;
        task.end_compute_time = now;
    }

    pub(crate) fn end_quantum(&mut self, tp: TaskId) {
        self.task_mut(tp).qep = None;
        let (np, hp, prio, state) = {
            let task = self.task(tp);
            (task.node, task.hp, task.priority, task.state)
        };
        match state {
            TaskState::Spinning | TaskState::Computing | TaskState::Blocked => {
                let Some(h) = hp else {
                    abort("Bad end of quantum event");
                };
                if self.discipline(np) == Discipline::Fifo {
                    self.find_priority(np, h, MIN_PRIORITY - 1);
                } else {
                    self.qxflag = true;
                    self.find_priority(np, h, prio - 1);
                }
            }
            TaskState::Sync | TaskState::SyncSuspend | TaskState::SyncFree => {
                self.task_mut(tp).qx = true;
            }
            _ => abort("Bad end of quantum event"),
        }
    }

    pub(crate) fn end_sleep(&mut self, tp: TaskId) {
        if self.task_state(tp) != TaskState::Sleeping {
            abort("Bad end sleep event");
        }
        self.task_mut(tp).tep = None;
        if self.discipline(self.task(tp).node) == Discipline::Cfs {
            self.update_sleep_task(tp);
        }
        self.find_host(tp);
    }

    pub(crate) fn end_sync(&mut self, tp: TaskId) {
        self.task_mut(tp).tep = None;
        let (np, hp, prio, state) = {
            let task = self.task(tp);
            (task.node, task.hp, task.priority, task.state)
        };
        if self.discipline(np) == Discipline::Cfs {
            self.update_run_task(tp);
        }
        let Some(h) = hp else {
            abort("Bad sync timeout event");
        };

        match state {
            TaskState::SyncSuspend => {
                {
                    let task = self.task_mut(tp);
                    task.state = TaskState::Suspended;
                    task.hp = None;
                }
                self.leave_cfs_cpu(tp);
                self.ts_report(tp, "suspended");
                self.cancel_qep(tp);
                self.release_locks(tp);
                self.find_ready(np, h);
            }
            TaskState::SyncFree => {
                self.task_mut(tp).state = TaskState::Computing;
                self.kill_task(tp);
            }
            TaskState::Sync => {
                if self.task(tp).qx {
                    self.task_mut(tp).qx = false;
                    self.qxflag = true;
                    self.find_priority(np, h, prio - 1);
                } else if self.discipline(np) == Discipline::Pr {
                    self.find_priority(np, h, prio);
                } else {
                    self.hot = Some(tp);
                    self.task_mut(tp).state = TaskState::Hot;
                }
            }
            _ => abort("Bad sync timeout event"),
        }
    }
}
