//! System call interface
//!
//! `TaskCtx` is the boundary between a task body and the kernel. Every
//! call borrows the kernel for the duration of one synchronous kernel
//! operation; calls that may take the processor away then await a
//! switch, which completes once the kernel makes this task hot again.
//!
//! Design:
//! - A body never holds a kernel borrow across an await
//! - The switch future is ready exactly when the task is hot, so a call
//!   that did not give the processor away continues immediately
//! - Errors come back as `SyscallResult`; the kernel has already logged
//!   a warning when warnings are on

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use super::error::{abort, SyscallResult};
use super::lock::LockId;
use super::medium::{BusId, LinkId};
use super::node::{Discipline, GroupId, NodeId, StatFlags};
use super::port::{CastScope, Message, PortId, Receipt, ReceiveOrder, Timeout};
use super::semaphore::SemId;
use super::stats::{StatId, StatKind};
use super::task::{Body, BoxFuture, TaskId, TaskState};
use super::Kernel;

/// Completes once the kernel hands the processor back to `me`
struct Switch {
    kernel: Rc<RefCell<Kernel>>,
    me: TaskId,
}

impl Future for Switch {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if self.kernel.borrow().hot == Some(self.me) {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

/// Turn a task body closure into the boxed form the kernel stores
pub(crate) fn boxed_body<F, Fut>(body: F) -> Body
where
    F: FnOnce(TaskCtx) -> Fut + 'static,
    Fut: Future<Output = ()> + 'static,
{
    Box::new(move |ctx: TaskCtx| -> BoxFuture { Box::pin(body(ctx)) })
}

/// A task's handle on the kernel
#[derive(Clone)]
pub struct TaskCtx {
    kernel: Rc<RefCell<Kernel>>,
    me: TaskId,
}

impl TaskCtx {
    pub(crate) fn new(kernel: Rc<RefCell<Kernel>>, me: TaskId) -> Self {
        Self { kernel, me }
    }

    /// This task's id
    pub fn id(&self) -> TaskId {
        self.me
    }

    /// Run `f` against the kernel. Only the hot task may call in.
    pub fn with<R>(&self, f: impl FnOnce(&mut Kernel) -> R) -> R {
        let mut kernel = self.kernel.borrow_mut();
        if kernel.hot != Some(self.me) {
            abort("kernel call from a task that is not running");
        }
        f(&mut kernel)
    }

    fn switch(&self) -> Switch {
        Switch {
            kernel: self.kernel.clone(),
            me: self.me,
        }
    }

    /// Kernel call followed by a switch, whatever the outcome
    async fn call<R>(&self, f: impl FnOnce(&mut Kernel) -> SyscallResult<R>) -> SyscallResult<R> {
        let result = self.with(f);
        self.switch().await;
        result
    }

    // ========================================================================
    // Time and processor use
    // ========================================================================

    pub fn now(&self) -> f64 {
        self.with(|k| k.now)
    }

    /// Use `delta` units of processor time, scaled by node speed.
    /// Higher priority work may preempt.
    pub async fn compute(&self, delta: f64) -> SyscallResult<()> {
        self.call(|k| k.compute(delta)).await
    }

    /// Keep the processor for `delta` without computing
    pub async fn hold(&self, delta: f64) -> SyscallResult<()> {
        self.call(|k| k.hold(delta)).await
    }

    /// Keep the processor for `delta`, postponing preemption and quantum
    /// expiry until the interval is over
    pub async fn sync(&self, delta: f64) -> SyscallResult<()> {
        self.call(|k| k.sync(delta)).await
    }

    pub async fn sleep(&self, duration: f64) -> SyscallResult<()> {
        self.call(|k| k.sleep(duration)).await
    }

    // ========================================================================
    // Task management
    // ========================================================================

    /// Create a suspended son of this task
    pub fn create<F, Fut>(
        &self,
        name: &str,
        node: NodeId,
        host: Option<usize>,
        priority: i32,
        body: F,
    ) -> SyscallResult<TaskId>
    where
        F: FnOnce(TaskCtx) -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        self.with(|k| k.create_task(name, node, host, priority, None, boxed_body(body)))
    }

    /// Create a suspended son scheduled as part of a fair-share group
    pub fn create_in_group<F, Fut>(
        &self,
        name: &str,
        node: NodeId,
        host: Option<usize>,
        priority: i32,
        group: GroupId,
        body: F,
    ) -> SyscallResult<TaskId>
    where
        F: FnOnce(TaskCtx) -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        self.with(|k| k.create_task(name, node, host, priority, Some(group), boxed_body(body)))
    }

    pub async fn resume(&self, task: TaskId) -> SyscallResult<()> {
        self.call(|k| k.resume(task)).await
    }

    pub async fn suspend(&self, task: TaskId) -> SyscallResult<()> {
        self.call(|k| k.suspend(task)).await
    }

    pub async fn awaken(&self, task: TaskId) -> SyscallResult<()> {
        self.call(|k| k.awaken(task)).await
    }

    /// Kill `task` and its descendants. Killing oneself does not return.
    pub async fn kill(&self, task: TaskId) -> SyscallResult<()> {
        self.call(|k| k.kill(task)).await
    }

    pub async fn migrate(&self, task: TaskId, node: NodeId, host: Option<usize>) -> SyscallResult<()> {
        self.call(|k| k.migrate(task, node, host)).await
    }

    pub async fn adjust_priority(&self, task: TaskId, priority: i32) -> SyscallResult<()> {
        self.call(|k| k.adjust_priority(task, priority)).await
    }

    // ========================================================================
    // Locks and semaphores
    // ========================================================================

    /// Spin until `lock` is ours
    pub async fn lock(&self, lock: LockId) {
        self.with(|k| k.log_angio_event(&format!("wLockSpinning {lock}")));
        while !self.with(|k| k.try_lock(lock)) {
            self.switch().await;
        }
        self.with(|k| k.log_angio_event(&format!("wLockObtained {lock}")));
    }

    pub async fn unlock(&self, lock: LockId) -> SyscallResult<()> {
        self.call(|k| k.unlock(lock)).await
    }

    pub async fn wait(&self, sem: SemId) -> SyscallResult<()> {
        self.call(|k| k.wait_semaphore(sem)).await?;
        self.with(|k| k.log_angio_event(&format!("wSemaUnblocked {sem}")));
        Ok(())
    }

    pub async fn signal(&self, sem: SemId) -> SyscallResult<()> {
        self.call(|k| k.signal_semaphore(sem)).await
    }

    pub async fn reset_semaphore(&self, sem: SemId, value: i64) -> SyscallResult<()> {
        self.call(|k| k.reset_semaphore(sem, value)).await
    }

    // ========================================================================
    // Ports
    // ========================================================================

    pub fn allocate_port(&self, name: &str) -> SyscallResult<PortId> {
        self.with(|k| k.allocate_port(name, None))
    }

    /// Allocate a port owned by another task
    pub fn allocate_port_for(&self, name: &str, owner: TaskId) -> SyscallResult<PortId> {
        self.with(|k| k.allocate_port(name, Some(owner)))
    }

    pub fn allocate_port_set(&self, name: &str) -> SyscallResult<PortId> {
        self.with(|k| k.allocate_port_set(name))
    }

    /// Shared port served by a new dispatcher task
    pub async fn allocate_shared_port(&self) -> SyscallResult<PortId> {
        self.call(|k| k.allocate_shared_port()).await
    }

    pub async fn release_shared_port(&self, port: PortId) -> SyscallResult<()> {
        self.call(|k| k.release_shared_port(port)).await
    }

    pub async fn release_port(&self, port: PortId) -> SyscallResult<()> {
        self.call(|k| k.release_port(port)).await
    }

    pub async fn pass_port(&self, port: PortId, task: TaskId) -> SyscallResult<()> {
        self.call(|k| k.pass_port(port, task)).await
    }

    pub async fn join_port_set(&self, set: PortId, port: PortId) -> SyscallResult<()> {
        self.call(|k| k.join_port_set(set, port)).await
    }

    pub async fn leave_port_set(&self, set: PortId, port: PortId) -> SyscallResult<()> {
        self.call(|k| k.leave_port_set(set, port)).await
    }

    pub fn std_port(&self) -> Option<PortId> {
        self.with(|k| k.std_port(self.me))
    }

    /// Standard port of another task
    pub fn std_port_of(&self, task: TaskId) -> Option<PortId> {
        self.with(|k| k.std_port(task))
    }

    pub fn my_ports(&self) -> Vec<PortId> {
        self.with(|k| k.owned_ports(self.me))
    }

    pub fn port_owner(&self, port: PortId) -> Option<TaskId> {
        self.with(|k| k.port_owner(port))
    }

    pub fn port_queue_len(&self, port: PortId) -> usize {
        self.with(|k| k.port_queue_len(port))
    }

    // ========================================================================
    // Sending
    // ========================================================================

    pub async fn send(&self, port: PortId, msg: Message) -> SyscallResult<()> {
        self.call(|k| k.post("send", Some(self.me), port, msg, None)).await
    }

    /// Send carrying a priority that `receive_priority` selects on
    pub async fn send_priority(&self, port: PortId, priority: i64, mut msg: Message) -> SyscallResult<()> {
        msg.priority = priority;
        self.call(|k| k.post("send_priority", Some(self.me), port, msg, None)).await
    }

    /// Send keeping the time stamp `ts`, to pass a received message on
    pub async fn resend(&self, port: PortId, ts: f64, msg: Message) -> SyscallResult<()> {
        self.call(|k| k.post("resend", Some(self.me), port, msg, Some(ts))).await
    }

    async fn cast(&self, scope: CastScope, msg: Message) -> SyscallResult<()> {
        self.call(|k| {
            k.cast(scope, msg);
            Ok(())
        })
        .await
    }

    /// Send to every other user task
    pub async fn broadcast(&self, msg: Message) -> SyscallResult<()> {
        self.cast(CastScope::All, msg).await
    }

    /// Send to every other user task on this node
    pub async fn localcast(&self, msg: Message) -> SyscallResult<()> {
        self.cast(CastScope::Node, msg).await
    }

    /// Send to every descendant
    pub async fn multicast(&self, msg: Message) -> SyscallResult<()> {
        self.cast(CastScope::Descendants, msg).await
    }

    /// Queue a message for transmission over a bus
    pub fn bus_send(&self, bus: BusId, port: PortId, msg: Message) -> SyscallResult<()> {
        self.with(|k| k.bus_send(bus, port, msg))
    }

    pub fn link_send(&self, link: LinkId, port: PortId, msg: Message) -> SyscallResult<()> {
        self.with(|k| k.link_send(link, port, msg))
    }

    /// Send keeping every field of the message as is
    pub(crate) async fn forward(&self, port: PortId, msg: Message) -> SyscallResult<()> {
        self.call(|k| k.port_send(port, msg)).await
    }

    /// Forward, handing the message back when the port is gone
    pub(crate) async fn forward_or_return(&self, port: PortId, msg: Message) -> Result<(), Message> {
        let result = self.with(|k| {
            if !k.ports.contains(port) {
                return Err(msg);
            }
            k.deliver(port, msg);
            Ok(())
        });
        self.switch().await;
        result
    }

    // ========================================================================
    // Receiving
    // ========================================================================

    /// Oldest message on `port`; `None` when the timeout expired first
    pub async fn receive(&self, port: PortId, timeout: Timeout) -> SyscallResult<Option<Message>> {
        self.receive_ordered(port, timeout, ReceiveOrder::Fifo).await
    }

    /// Newest message on `port`
    pub async fn receive_last(&self, port: PortId, timeout: Timeout) -> SyscallResult<Option<Message>> {
        self.receive_ordered(port, timeout, ReceiveOrder::Lifo).await
    }

    pub async fn receive_random(&self, port: PortId, timeout: Timeout) -> SyscallResult<Option<Message>> {
        self.receive_ordered(port, timeout, ReceiveOrder::Random).await
    }

    /// Highest priority message on `port`, oldest first among equals
    pub async fn receive_priority(&self, port: PortId, timeout: Timeout) -> SyscallResult<Option<Message>> {
        self.receive_ordered(port, timeout, ReceiveOrder::Priority).await
    }

    pub async fn receive_ordered(
        &self,
        port: PortId,
        timeout: Timeout,
        order: ReceiveOrder,
    ) -> SyscallResult<Option<Message>> {
        match self.with(|k| k.begin_receive(port, timeout))? {
            Receipt::Empty => return Ok(None),
            Receipt::Ready => {}
            Receipt::Wait => loop {
                self.switch().await;
                if !self.with(|k| k.recheck_receive(port))? {
                    break;
                }
            },
        }
        Ok(self.with(|k| k.take_message(port, order)))
    }

    /// Receive from a shared port through its dispatcher
    pub async fn receive_shared(&self, port: PortId, timeout: Timeout) -> SyscallResult<Option<Message>> {
        let blind = self.call(|k| k.request_shared(port)).await?;
        let immediate = timeout == Timeout::Immediate;
        if immediate {
            // Let the dispatcher answer before looking
            self.sleep(0.0).await?;
        }
        match self.receive(blind, timeout).await {
            Ok(Some(msg)) => Ok(Some(msg)),
            other => {
                self.call(|k| k.cancel_shared(port, blind)).await?;
                if immediate {
                    self.sleep(0.0).await?;
                }
                other
            }
        }
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    pub fn open_stat(&self, name: &str, kind: StatKind) -> SyscallResult<StatId> {
        self.with(|k| k.open_stat(name, kind))
    }

    pub fn record_stat(&self, stat: StatId, value: f64) -> SyscallResult<()> {
        self.with(|k| k.record_stat(stat, value))
    }

    pub fn record_stat2(&self, stat: StatId, value: f64, start: f64) -> SyscallResult<()> {
        self.with(|k| k.record_stat2(stat, value, start))
    }

    pub fn record_rate_stat(&self, stat: StatId) -> SyscallResult<()> {
        self.with(|k| k.record_rate_stat(stat))
    }

    pub fn add_stat(&self, stat: StatId, value: f64) -> SyscallResult<()> {
        self.with(|k| k.add_stat(stat, value))
    }

    pub fn get_stat(&self, stat: StatId) -> SyscallResult<(f64, f64)> {
        self.with(|k| k.get_stat(stat))
    }

    pub fn reset_stat(&self, stat: StatId) -> SyscallResult<()> {
        self.with(|k| k.reset_stat(stat))
    }

    pub fn reset_all_stats(&self) {
        self.with(|k| k.reset_all_stats())
    }

    pub fn block_stats(&self, nb: usize, delay: f64) -> SyscallResult<()> {
        self.with(|k| k.block_stats(nb, delay))
    }

    // ========================================================================
    // Hardware
    // ========================================================================

    pub fn build_node(
        &self,
        name: &str,
        ncpu: usize,
        speed: f64,
        quantum: f64,
        discipline: Discipline,
        sf: StatFlags,
    ) -> SyscallResult<NodeId> {
        self.with(|k| k.build_node(name, ncpu, speed, quantum, discipline, sf))
    }

    pub fn build_bus(
        &self,
        name: &str,
        nodes: &[NodeId],
        rate: f64,
        discipline: Discipline,
        sf: StatFlags,
    ) -> SyscallResult<BusId> {
        self.with(|k| k.build_bus(name, nodes, rate, discipline, sf))
    }

    pub fn build_link(
        &self,
        name: &str,
        source: NodeId,
        destination: NodeId,
        rate: f64,
        sf: StatFlags,
    ) -> SyscallResult<LinkId> {
        self.with(|k| k.build_link(name, source, destination, rate, sf))
    }

    pub fn build_group(&self, name: &str, share: f64, node: NodeId, cap: bool) -> SyscallResult<GroupId> {
        self.with(|k| k.build_group(name, share, node, cap))
    }

    // ========================================================================
    // Angio tracing
    // ========================================================================

    pub fn inject_trace_name(&self, name: &str) -> SyscallResult<()> {
        self.with(|k| k.inject_trace_name(name))
    }

    pub fn toggle_angio_output(&self, on: bool) -> SyscallResult<()> {
        self.with(|k| k.toggle_angio_output(on))
    }

    pub fn log_user_event(&self, event: &str) -> SyscallResult<()> {
        self.with(|k| k.log_user_event(event))
    }

    pub fn task_cycle_begin(&self) -> SyscallResult<()> {
        self.with(|k| k.task_cycle_begin())
    }

    // ========================================================================
    // Random variates
    // ========================================================================

    pub fn drand(&self) -> f64 {
        self.with(|k| k.rng.drand())
    }

    pub fn choice(&self, n: usize) -> usize {
        self.with(|k| k.rng.choice(n))
    }

    pub fn uniform(&self, low: f64, high: f64) -> f64 {
        self.with(|k| k.rng.uniform(low, high))
    }

    pub fn exponential(&self, mean: f64) -> f64 {
        self.with(|k| k.rng.exponential(mean))
    }

    pub fn erlang(&self, mean: f64, kstages: u32) -> f64 {
        self.with(|k| k.rng.erlang(mean, kstages))
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn my_name(&self) -> String {
        self.with(|k| k.task(self.me).name.clone())
    }

    pub fn my_node(&self) -> NodeId {
        self.with(|k| k.task(self.me).node)
    }

    /// Processor this task is running on
    pub fn my_host(&self) -> Option<usize> {
        self.with(|k| k.task(self.me).hp)
    }

    pub fn my_priority(&self) -> i32 {
        self.with(|k| k.task(self.me).priority)
    }

    pub fn parent(&self) -> Option<TaskId> {
        self.with(|k| k.parent(self.me))
    }

    pub fn children(&self) -> Vec<TaskId> {
        self.with(|k| k.children(self.me))
    }

    pub fn siblings(&self) -> Vec<TaskId> {
        self.with(|k| k.siblings(self.me))
    }

    pub fn task_state(&self, task: TaskId) -> TaskState {
        self.with(|k| k.task_state(task))
    }

    pub fn task_name(&self, task: TaskId) -> Option<String> {
        self.with(|k| k.task_name(task).map(str::to_string))
    }

    pub fn ready_queue(&self, node: NodeId) -> Vec<TaskId> {
        self.with(|k| k.ready_queue(node))
    }

    pub fn idle_cpus(&self, node: NodeId) -> usize {
        self.with(|k| k.free_cpus(node))
    }

    pub fn curr_priority(&self, node: NodeId, host: usize) -> SyscallResult<i32> {
        self.with(|k| k.curr_priority(node, host))
    }

    /// Buses this task's node is attached to
    pub fn buses(&self) -> Vec<BusId> {
        self.with(|k| k.node_buses(k.task(self.me).node))
    }

    pub fn send_links(&self) -> Vec<LinkId> {
        self.with(|k| k.node_send_links(k.task(self.me).node))
    }

    pub fn receive_links(&self) -> Vec<LinkId> {
        self.with(|k| k.node_receive_links(k.task(self.me).node))
    }
}
