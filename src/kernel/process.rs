//! Task lifecycle
//!
//! Creation, suspension, resumption, kill and migration of tasks, and the
//! timed calls that keep a task busy on (or away from) its processor.
//!
//! Design:
//! - A call that may hand the processor to another task does so as its
//!   last step; nothing after it may look at the caller
//! - Kill takes the whole subtree below the victim with it
//! - A task in a sync state keeps its processor no matter what; suspend
//!   and kill only mark it and END_SYNC finishes the job

use super::calendar::EventKind;
use super::cfs::SchedInfo;
use super::error::SyscallResult;
use super::medium::{BusId, LinkId};
use super::node::{Discipline, GroupId, NodeId};
use super::port::PortKind;
use super::stats::format_g;
use super::task::{Body, Task, TaskId, TaskRole, TaskState};
use super::{Kernel, MAX_PRIORITY, MIN_PRIORITY};

impl Kernel {
    // ========================================================================
    // Creation
    // ========================================================================

    /// Make a suspended task whose body the driver binds before it first
    /// runs. The hot task (or the driver) becomes its parent.
    pub(crate) fn spawn_task(
        &mut self,
        name: String,
        node: NodeId,
        host: Option<usize>,
        priority: i32,
        group: Option<GroupId>,
        role: TaskRole,
        body: Body,
    ) -> TaskId {
        let tsn = self.task_count;
        self.task_count += 1;
        let parent = self.hot;

        let mut task = Task::new(name, node, host, priority, tsn);
        task.role = role;
        task.parent = parent;
        task.group = group;
        let tid = self.tasks.insert(task);
        if let Some(parent) = parent {
            self.task_mut(parent).sons.insert(0, tid);
        }

        let port = self.new_port("Broadcast".to_string(), PortKind::Used, tid);
        self.task_mut(tid).std_port = Some(port);

        if self.discipline(node) == Discipline::Cfs {
            let rq = self.host_rq(node, host.unwrap_or(0));
            let quantum = self.nodes[node.0].quantum;
            let si = self.sis.insert(SchedInfo::new(Some(tid), rq, 1.0, quantum));
            self.task_mut(tid).si = Some(si);
        }

        self.ts_report(tid, "created (suspended)");
        self.begin_task_dye(tid);
        self.pending_spawn.push((tid, body));
        tid
    }

    pub(crate) fn create_task(
        &mut self,
        name: &str,
        node: NodeId,
        host: Option<usize>,
        priority: i32,
        group: Option<GroupId>,
        body: Body,
    ) -> SyscallResult<TaskId> {
        let Some(n) = self.nodes.get(node.0) else {
            return Err(self.bad_param("create", "node"));
        };
        if host.is_some_and(|h| h >= n.ncpu) {
            return Err(self.bad_param("create", "host"));
        }
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
            return Err(self.bad_param("create", "priority"));
        }
        if let Some(gid) = group {
            if self.groups.get(gid.0).is_none_or(|g| g.node != node) {
                return Err(self.bad_param("create", "group"));
            }
        }
        Ok(self.spawn_task(name.to_string(), node, host, priority, group, TaskRole::User, body))
    }

    // ========================================================================
    // Timed calls
    // ========================================================================

    /// Busy for `delta` of processor time; preemptable
    pub(crate) fn compute(&mut self, delta: f64) -> SyscallResult<()> {
        if delta < 0.0 {
            return Err(self.bad_param("compute", "delta"));
        }
        let me = self.me();
        let np = self.task(me).node;
        if self.discipline(np) == Discipline::Cfs {
            self.set_cfs_slice(me, delta);
        }
        let due = self.now + delta / self.nodes[np.0].speed;
        let ev = self.add_event(due, EventKind::EndCompute(me));
        let task = self.task_mut(me);
        task.tep = Some(ev);
        task.state = TaskState::Computing;
        self.log_angio_event(&format!("wUse {}", format_g(delta, 6, false)));
        self.sched();
        Ok(())
    }

    /// Keep the processor for `delta`; the task is Blocked meanwhile
    pub(crate) fn hold(&mut self, delta: f64) -> SyscallResult<()> {
        if delta < 0.0 {
            return Err(self.bad_param("hold", "delta"));
        }
        let me = self.me();
        let np = self.task(me).node;
        let due = self.now + delta / self.nodes[np.0].speed;
        let ev = self.add_event(due, EventKind::EndBlock(me));
        let task = self.task_mut(me);
        task.tep = Some(ev);
        task.state = TaskState::Blocked;
        self.log_angio_event(&format!("wUse {}", format_g(delta, 6, false)));
        self.sched();
        Ok(())
    }

    /// Keep the processor for `delta` with preemption and quantum
    /// expiry postponed until it ends
    pub(crate) fn sync(&mut self, delta: f64) -> SyscallResult<()> {
        if delta < 0.0 {
            return Err(self.bad_param("sync", "delta"));
        }
        let me = self.me();
        let np = self.task(me).node;
        if np.0 == 0 {
            return Err(self.bad_call(
                "sync",
                "sync on node 0 not recommended -- block stats may not be reported",
            ));
        }
        let due = self.now + delta / self.nodes[np.0].speed;
        let ev = self.add_event(due, EventKind::EndSync(me));
        let task = self.task_mut(me);
        task.tep = Some(ev);
        task.state = TaskState::Sync;
        self.log_angio_event(&format!("wSync {}", format_g(delta, 6, false)));
        self.sched();
        Ok(())
    }

    /// Give up the processor for `duration`. A zero (or negative) sleep
    /// only yields, and only when a ready task would actually get the
    /// processor.
    pub(crate) fn sleep(&mut self, duration: f64) -> SyscallResult<()> {
        let me = self.me();
        let (np, prio) = (self.task(me).node, self.task(me).priority);
        let mut duration = duration;
        if duration <= 0.0 {
            let head = self.nodes[np.0].ready.front().map(|&t| self.task(t).priority);
            let yields = match (self.discipline(np), head) {
                (_, None) => false,
                (Discipline::Pr, Some(p)) => prio == p,
                (Discipline::Hol, Some(p)) => prio <= p,
                _ => true,
            };
            if !yields {
                return Ok(());
            }
            duration = 0.0;
        }

        self.task_mut(me).state = TaskState::Sleeping;
        self.ts_report(me, "sleeping");
        self.log_angio_event(&format!("wDelay {}", format_g(duration, 6, false)));
        self.cancel_qep(me);
        let ev = self.add_event(self.now + duration, EventKind::EndSleep(me));
        self.task_mut(me).tep = Some(ev);
        self.vacate_cpu(me);
        Ok(())
    }

    // ========================================================================
    // Suspend / resume
    // ========================================================================

    pub(crate) fn suspend(&mut self, tp: TaskId) -> SyscallResult<()> {
        let Some(task) = self.tasks.get(tp) else {
            return Err(self.bad_param("suspend", "task"));
        };
        let old = task.state;
        match old {
            TaskState::Sync => {
                self.task_mut(tp).state = TaskState::SyncSuspend;
                return Ok(());
            }
            TaskState::SyncSuspend | TaskState::Suspended => return Ok(()),
            TaskState::SyncFree | TaskState::Free => {
                return Err(self.bad_param("suspend", "task"));
            }
            _ => {}
        }

        self.task_mut(tp).state = TaskState::Suspended;
        self.ts_report(tp, "suspended");
        self.log_angio_event_for(tp, "wDelay FOREVER");
        self.cancel_qep(tp);
        self.release_locks(tp);

        match old {
            TaskState::Ready => {
                self.dq_ready(tp);
                self.task_mut(tp).hp = None;
            }
            TaskState::Receiving => {
                self.cancel_rtoep(tp);
                self.task_mut(tp).wport = None;
            }
            TaskState::Sleeping => {
                self.cancel_tep(tp);
            }
            TaskState::Spinning => {
                self.dq_lock(tp);
                self.vacate_cpu(tp);
            }
            TaskState::Computing => {
                // The rest of the compute runs once resumed
                if let Some(due) = self.cancel_tep(tp) {
                    self.task_mut(tp).rct = due - self.now;
                }
                self.vacate_cpu(tp);
            }
            TaskState::Blocked => {
                self.cancel_tep(tp);
                self.vacate_cpu(tp);
            }
            TaskState::Hot => self.vacate_cpu(tp),
            _ => {}
        }
        Ok(())
    }

    /// Make a suspended task runnable again; the caller may be preempted
    pub(crate) fn resume(&mut self, tp: TaskId) -> SyscallResult<()> {
        match self.tasks.get(tp).map(|task| task.state) {
            None => Err(self.bad_param("resume", "task")),
            Some(TaskState::Suspended) => {
                self.log_angio_event_for(tp, "wAwaken");
                self.find_host(tp);
                Ok(())
            }
            Some(TaskState::SyncSuspend) => {
                self.log_angio_event_for(tp, "wAwaken");
                self.task_mut(tp).state = TaskState::Sync;
                Ok(())
            }
            Some(_) => Err(self.bad_call("resume", "Task is not suspended")),
        }
    }

    /// Cut a sleep short; tasks that are not sleeping are left alone
    pub(crate) fn awaken(&mut self, tp: TaskId) -> SyscallResult<()> {
        let Some(task) = self.tasks.get(tp) else {
            return Err(self.bad_param("awaken", "task"));
        };
        if task.state != TaskState::Sleeping {
            return Ok(());
        }
        self.log_angio_event_for(tp, "wAwaken");
        self.cancel_tep(tp);
        if self.discipline(self.task(tp).node) == Discipline::Cfs {
            self.update_sleep_task(tp);
        }
        self.find_host(tp);
        Ok(())
    }

    // ========================================================================
    // Kill
    // ========================================================================

    pub(crate) fn kill(&mut self, tp: TaskId) -> SyscallResult<()> {
        match self.tasks.get(tp) {
            Some(task) if task.role != TaskRole::Genesis && self.is_ancestor(tp) => {
                self.kill_task(tp);
                Ok(())
            }
            _ => Err(self.bad_param("kill", "task")),
        }
    }

    /// Destroy a task and its descendants. A syncing task is only
    /// marked; END_SYNC comes back here once its interval is over.
    pub(crate) fn kill_task(&mut self, tp: TaskId) {
        let Some(task) = self.tasks.get(tp) else {
            return;
        };
        let state = task.state;
        if state.is_sync() {
            self.task_mut(tp).state = TaskState::SyncFree;
            return;
        }

        let sons = self.task(tp).sons.clone();
        for son in sons {
            self.kill_task(son);
        }

        self.ts_report(tp, "dead");
        self.end_trace(tp);
        self.cancel_tep(tp);
        self.cancel_qep(tp);
        self.cancel_rtoep(tp);
        self.release_locks(tp);
        self.purge_semaphore_waiter(tp);
        self.task_mut(tp).state = TaskState::Free;
        self.release_ports(tp);

        match state {
            TaskState::Ready => self.dq_ready(tp),
            TaskState::Spinning => self.dq_lock(tp),
            _ => {}
        }

        if let Some(parent) = self.task(tp).parent {
            if let Some(p) = self.tasks.get_mut(parent) {
                p.sons.retain(|&s| s != tp);
            }
        }
        let holds_cpu = matches!(
            state,
            TaskState::Hot | TaskState::Computing | TaskState::Blocked | TaskState::Spinning
        );
        // Last: the processor may go to whoever is next
        if holds_cpu {
            self.vacate_cpu(tp);
        }
        if let Some(task) = self.tasks.remove(tp) {
            if let Some(si) = task.si {
                self.sis.remove(si);
            }
        }
        self.reaped.push(tp);
        if self.hot == Some(tp) {
            self.sched();
        }
    }

    // ========================================================================
    // Migration
    // ========================================================================

    pub(crate) fn migrate(&mut self, tp: TaskId, node: NodeId, host: Option<usize>) -> SyscallResult<()> {
        if !self.tasks.contains(tp) || !self.is_ancestor(tp) {
            return Err(self.bad_param("migrate", "task"));
        }
        let Some(n) = self.nodes.get(node.0) else {
            return Err(self.bad_param("migrate", "node"));
        };
        if host.is_some_and(|h| h >= n.ncpu) {
            return Err(self.bad_param("migrate", "host"));
        }
        let task = self.task(tp);
        if task.state.is_sync() || task.state == TaskState::Free {
            return Err(self.bad_call("migrate", "Task syncing, free, or suspended"));
        }
        if task.node == node && task.host == host {
            return Ok(());
        }
        self.relocate(tp, node, host);
        Ok(())
    }

    /// Move a task, and the surrogates of its port sets, to `node`
    fn relocate(&mut self, tp: TaskId, node: NodeId, host: Option<usize>) {
        self.ts_report(tp, format!("migrating to node {node}"));
        let (old_np, state) = (self.task(tp).node, self.task(tp).state);
        self.cancel_qep(tp);
        self.release_locks(tp);

        // Leave the old node while the task still belongs to it
        let mut holds_cpu = false;
        match state {
            TaskState::Ready => self.dq_ready(tp),
            TaskState::Computing => {
                if let Some(due) = self.cancel_tep(tp) {
                    let ratio = self.nodes[old_np.0].speed / self.nodes[node.0].speed;
                    self.task_mut(tp).rct = (due - self.now) * ratio;
                }
                holds_cpu = true;
            }
            TaskState::Blocked => {
                self.cancel_tep(tp);
                holds_cpu = true;
            }
            TaskState::Spinning => {
                self.dq_lock(tp);
                holds_cpu = true;
            }
            TaskState::Hot => holds_cpu = true,
            _ => {}
        }
        let old_hp = if holds_cpu { self.task(tp).hp } else { None };
        if old_hp.is_some() && self.discipline(old_np) == Discipline::Cfs {
            self.update_run_task(tp);
            self.leave_cfs_cpu(tp);
        }

        if let Some(si) = self.task_mut(tp).si.take() {
            self.sis.remove(si);
        }
        {
            let task = self.task_mut(tp);
            task.node = node;
            task.host = host;
            task.uhost = host;
            task.hp = None;
        }
        if self.task(tp).group.is_some_and(|g| self.groups[g.0].node != node) {
            self.task_mut(tp).group = None;
        }
        if self.discipline(node) == Discipline::Cfs {
            let rq = self.host_rq(node, host.unwrap_or(0));
            let quantum = self.nodes[node.0].quantum;
            let si = self.sis.insert(SchedInfo::new(Some(tp), rq, 1.0, quantum));
            self.task_mut(tp).si = Some(si);
        }

        let surrogates: Vec<TaskId> = self
            .task(tp)
            .ports
            .iter()
            .filter_map(|&port| self.ports.get(port))
            .filter(|p| p.kind == PortKind::Set)
            .flat_map(|p| p.members.iter().map(|&(t, _)| t))
            .collect();
        for surrogate in surrogates {
            if self.tasks.contains(surrogate) && !self.task(surrogate).state.is_sync() {
                self.relocate(surrogate, node, host);
            }
        }

        if let Some(h) = old_hp {
            self.find_ready(old_np, h);
        }
        if matches!(
            state,
            TaskState::Ready
                | TaskState::Hot
                | TaskState::Computing
                | TaskState::Blocked
                | TaskState::Spinning
        ) {
            self.find_host(tp);
        }
    }

    // ========================================================================
    // Priority
    // ========================================================================

    pub(crate) fn adjust_priority(&mut self, tp: TaskId, priority: i32) -> SyscallResult<()> {
        if !self.tasks.contains(tp) || !self.is_ancestor(tp) {
            return Err(self.bad_param("adjust_priority", "task"));
        }
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
            return Err(self.bad_param("adjust_priority", "priority"));
        }
        self.task_mut(tp).upriority = priority;
        self.set_priority(tp, priority);
        Ok(())
    }

    /// Change the running priority and reschedule as the discipline
    /// demands
    fn set_priority(&mut self, tp: TaskId, priority: i32) {
        if self.task(tp).priority == priority {
            return;
        }
        self.task_mut(tp).priority = priority;
        self.ts_report(tp, format!("priority adjusted to {priority}"));

        let (np, hp, state) = {
            let task = self.task(tp);
            (task.node, task.hp, task.state)
        };
        match state {
            TaskState::Ready if self.discipline(np) != Discipline::Fifo => {
                self.dq_ready(tp);
                self.find_host(tp);
            }
            TaskState::Hot | TaskState::Blocked | TaskState::Computing | TaskState::Spinning
                if self.discipline(np) == Discipline::Pr =>
            {
                if let Some(h) = hp {
                    self.find_priority(np, h, priority);
                }
            }
            _ => {}
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Sons of the caller, newest first
    pub fn children(&self, tid: TaskId) -> Vec<TaskId> {
        self.tasks
            .get(tid)
            .map(|task| task.sons.iter().copied().filter(|&s| !self.is_internal(s)).collect())
            .unwrap_or_default()
    }

    /// The other sons of the task's parent
    pub fn siblings(&self, tid: TaskId) -> Vec<TaskId> {
        let Some(parent) = self.tasks.get(tid).and_then(|task| task.parent) else {
            return Vec::new();
        };
        self.children(parent).into_iter().filter(|&s| s != tid).collect()
    }

    pub fn parent(&self, tid: TaskId) -> Option<TaskId> {
        self.tasks.get(tid).and_then(|task| task.parent)
    }

    /// Tasks waiting for a processor of `node`, in service order.
    /// Kernel helpers are left out.
    pub fn ready_queue(&self, node: NodeId) -> Vec<TaskId> {
        let Some(n) = self.nodes.get(node.0) else {
            return Vec::new();
        };
        if n.discipline == Discipline::Cfs {
            return self
                .tasks
                .iter()
                .filter(|(_, task)| task.node == node && task.state == TaskState::Ready)
                .filter(|(_, task)| task.priority <= MAX_PRIORITY)
                .map(|(tid, _)| tid)
                .collect();
        }
        n.ready
            .iter()
            .copied()
            .filter(|&t| self.task(t).priority <= MAX_PRIORITY)
            .collect()
    }

    /// Number of idle processors of `node`
    pub fn free_cpus(&self, node: NodeId) -> usize {
        self.nodes.get(node.0).map_or(0, |n| n.nfree)
    }

    /// Priority of the task running on a processor, `MIN_PRIORITY - 1`
    /// when it is idle
    pub(crate) fn curr_priority(&self, node: NodeId, host: usize) -> SyscallResult<i32> {
        let Some(n) = self.nodes.get(node.0) else {
            return Err(self.bad_param("curr_priority", "node"));
        };
        let Some(cpu) = n.cpus.get(host) else {
            return Err(self.bad_param("curr_priority", "host"));
        };
        Ok(cpu
            .run_task
            .and_then(|t| self.tasks.get(t))
            .map_or(MIN_PRIORITY - 1, |task| task.priority))
    }

    pub fn task_name(&self, tid: TaskId) -> Option<&str> {
        self.tasks.get(tid).map(|task| task.name.as_str())
    }

    pub fn task_node(&self, tid: TaskId) -> Option<NodeId> {
        self.tasks.get(tid).map(|task| task.node)
    }

    /// Processor the task holds, if any
    pub fn task_host(&self, tid: TaskId) -> Option<usize> {
        self.tasks.get(tid).and_then(|task| task.hp)
    }

    pub fn task_priority(&self, tid: TaskId) -> Option<i32> {
        self.tasks.get(tid).map(|task| task.priority)
    }

    pub fn task_group(&self, tid: TaskId) -> Option<GroupId> {
        self.tasks.get(tid).and_then(|task| task.group)
    }

    /// User tasks still alive
    pub fn task_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|(_, task)| !task.role.is_internal())
            .count()
    }

    pub fn node_buses(&self, node: NodeId) -> Vec<BusId> {
        self.nodes.get(node.0).map(|n| n.buses.clone()).unwrap_or_default()
    }

    pub fn node_send_links(&self, node: NodeId) -> Vec<LinkId> {
        self.nodes.get(node.0).map(|n| n.send_links.clone()).unwrap_or_default()
    }

    pub fn node_receive_links(&self, node: NodeId) -> Vec<LinkId> {
        self.nodes.get(node.0).map(|n| n.recv_links.clone()).unwrap_or_default()
    }
}
