//! Ports and messages
//!
//! Every task owns a standard port plus any ports it allocates. A port
//! set gathers member ports through surrogate helper tasks, a shared
//! port hands each message to exactly one of several receivers through
//! a dispatcher task.
//!
//! Design:
//! - Messages are appended at the tail; the receive order picks which
//!   one is taken
//! - A send wakes the owner only when it is blocked receiving on that
//!   very port
//! - Waking may preempt the sender, so every wake happens last

use std::any::Any;
use std::collections::VecDeque;
use std::rc::Rc;

use super::angio::Dye;
use super::calendar::EventKind;
use super::error::{abort, SyscallResult};
use super::syscall::TaskCtx;
use super::table::handle;
use super::task::{TaskId, TaskRole, TaskState};
use super::{Kernel, ACK_TIMEOUT, HELPER_PRIORITY, MAX_PRIORITY, SP_CANCEL, SP_REQUEST};

handle!(
    /// Unique identifier for a port
    PortId
);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PortKind {
    Used,
    Set,
    Shared,
}

#[derive(Debug)]
pub(crate) struct Port {
    pub name: String,
    pub kind: PortKind,
    pub owner: TaskId,
    pub queue: VecDeque<Message>,
    /// Port set members: (surrogate, member port), newest first
    pub members: Vec<(TaskId, PortId)>,
}

/// Opaque user data carried by a message
#[derive(Clone)]
pub struct Payload(Rc<dyn Any>);

impl Payload {
    pub fn new<T: Any>(value: T) -> Self {
        Payload(Rc::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Payload(..)")
    }
}

/// A message in flight or queued on a port
#[derive(Debug, Clone)]
pub struct Message {
    pub mtype: i64,
    /// Time stamp, normally the send time
    pub ts: f64,
    pub payload: Option<Payload>,
    pub reply: Option<PortId>,
    /// Port the message was originally sent to
    pub origin: Option<PortId>,
    pub mid: u64,
    pub priority: i64,
    /// Logical size in bytes, for buses and links
    pub size: u64,
    pub(crate) dye: Option<Dye>,
}

impl Message {
    pub fn new(mtype: i64) -> Self {
        Self {
            mtype,
            ts: 0.0,
            payload: None,
            reply: None,
            origin: None,
            mid: 0,
            priority: 0,
            size: 0,
            dye: None,
        }
    }

    pub fn with_payload<T: Any>(mut self, value: T) -> Self {
        self.payload = Some(Payload::new(value));
        self
    }

    pub fn with_reply(mut self, port: PortId) -> Self {
        self.reply = Some(port);
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn payload<T: Any>(&self) -> Option<&T> {
        self.payload.as_ref().and_then(|p| p.downcast_ref())
    }
}

/// How long a receive may wait
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Timeout {
    /// Fail at once when no message is queued
    Immediate,
    Forever,
    For(f64),
}

/// Which queued message a receive takes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReceiveOrder {
    #[default]
    Fifo,
    Lifo,
    Random,
    /// Highest priority first, the oldest among equals
    Priority,
}

/// Where a receive stands after its first check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Receipt {
    /// A message is queued
    Ready,
    /// Nothing queued and no waiting allowed
    Empty,
    /// The caller is now blocked
    Wait,
}

/// Which tasks a cast reaches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CastScope {
    All,
    Node,
    Descendants,
}

impl Kernel {
    // ========================================================================
    // Allocation
    // ========================================================================

    pub(crate) fn new_port(&mut self, name: String, kind: PortKind, owner: TaskId) -> PortId {
        let id = self.ports.insert(Port {
            name,
            kind,
            owner,
            queue: VecDeque::new(),
            members: Vec::new(),
        });
        self.task_mut(owner).ports.insert(0, id);
        id
    }

    pub(crate) fn allocate_port(&mut self, name: &str, owner: Option<TaskId>) -> SyscallResult<PortId> {
        let owner = match owner {
            Some(t) if self.tasks.contains(t) => t,
            Some(_) => return Err(self.bad_param("allocate_port", "task")),
            None => self.me(),
        };
        Ok(self.new_port(name.to_string(), PortKind::Used, owner))
    }

    pub(crate) fn allocate_port_set(&mut self, name: &str) -> SyscallResult<PortId> {
        let me = self.me();
        Ok(self.new_port(name.to_string(), PortKind::Set, me))
    }

    /// Start a dispatcher and make its standard port shared. The
    /// dispatcher may preempt the caller.
    pub(crate) fn allocate_shared_port(&mut self) -> SyscallResult<PortId> {
        let me = self.me();
        let (name, node, host) = {
            let task = self.task(me);
            (format!("{} - Shared Port Dispatcher", task.name), task.node, task.host)
        };
        let body = Box::new(|ctx: TaskCtx| -> super::task::BoxFuture { Box::pin(dispatch_shared_port(ctx)) });
        let dispatcher = self.spawn_task(name, node, host, MAX_PRIORITY, None, TaskRole::Dispatcher, body);
        let Some(port) = self.task(dispatcher).std_port else {
            abort("dispatcher without a standard port");
        };
        if let Some(p) = self.ports.get_mut(port) {
            p.kind = PortKind::Shared;
        }
        self.resume(dispatcher)?;
        Ok(port)
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Fill in what every user send stamps on a message
    pub(crate) fn stamp_message(&mut self, mut msg: Message, port: PortId) -> Message {
        msg.ts = self.now;
        msg.origin = Some(port);
        msg.mid = self.next_mid;
        self.next_mid += 1;
        msg.dye = self.message_dye();
        msg
    }

    fn send_report(&mut self, sender: Option<TaskId>, port: PortId, mid: u64) {
        let Some(sender) = sender else {
            return;
        };
        let Some(p) = self.ports.get(port) else {
            return;
        };
        let msg = if p.kind == PortKind::Shared {
            format!("sending message {mid} to shared port {port}")
        } else {
            let owner = p.owner;
            let Some(task) = self.tasks.get(owner) else {
                return;
            };
            let target = match (task.role, task.parent) {
                (TaskRole::Surrogate, Some(parent)) => parent,
                _ => owner,
            };
            format!("sending message {mid} to task {target} via port {port}")
        };
        self.ts_report(sender, msg);
    }

    /// Send from `sender` (the driver when `None`). A `ts` overrides the
    /// time stamp.
    pub(crate) fn post(
        &mut self,
        call: &'static str,
        sender: Option<TaskId>,
        port: PortId,
        msg: Message,
        ts: Option<f64>,
    ) -> SyscallResult<()> {
        if !self.ports.contains(port) {
            return Err(self.bad_param(call, "port"));
        }
        let mut msg = self.stamp_message(msg, port);
        if let Some(ts) = ts {
            msg.ts = ts;
        }
        self.send_report(sender, port, msg.mid);
        self.deliver(port, msg);
        Ok(())
    }

    /// Send a copy of `msg` to every port `scope` reaches. All copies
    /// are stamped before the first delivery, which may preempt the
    /// caller.
    pub(crate) fn cast(&mut self, scope: CastScope, msg: Message) {
        let me = self.me();
        let copies: Vec<(PortId, Message)> = self
            .cast_targets(scope)
            .into_iter()
            .map(|port| (port, self.stamp_message(msg.clone(), port)))
            .collect();
        for (port, copy) in &copies {
            self.send_report(Some(me), *port, copy.mid);
        }
        for (port, copy) in copies {
            self.deliver(port, copy);
        }
    }

    /// Send preserving every field of the message, untraced
    pub(crate) fn port_send(&mut self, port: PortId, msg: Message) -> SyscallResult<()> {
        if !self.ports.contains(port) {
            return Err(self.bad_param("port_send", "port"));
        }
        self.deliver(port, msg);
        Ok(())
    }

    /// Queue a message and wake the owner if it waits on this port
    pub(crate) fn deliver(&mut self, port: PortId, msg: Message) {
        let Some(p) = self.ports.get_mut(port) else {
            return;
        };
        p.queue.push_back(msg);
        self.wake_receiver(port);
    }

    fn wake_receiver(&mut self, port: PortId) {
        let Some(owner) = self.ports.get(port).map(|p| p.owner) else {
            return;
        };
        let Some(task) = self.tasks.get(owner) else {
            return;
        };
        if task.state != TaskState::Receiving || task.wport != Some(port) {
            return;
        }
        self.cancel_rtoep(owner);
        self.task_mut(owner).wport = None;
        self.find_host(owner);
    }

    /// Standard ports of the tasks a cast from the caller reaches
    pub(crate) fn cast_targets(&self, scope: CastScope) -> Vec<PortId> {
        let me = self.me();
        let my_node = self.task(me).node;
        self.tasks
            .iter()
            .filter(|&(tid, task)| {
                tid != me
                    && !task.role.is_internal()
                    && match scope {
                        CastScope::All => true,
                        CastScope::Node => task.node == my_node,
                        CastScope::Descendants => self.is_ancestor(tid),
                    }
            })
            .filter_map(|(_, task)| task.std_port)
            .collect()
    }

    // ========================================================================
    // Receiving
    // ========================================================================

    pub(crate) fn begin_receive(&mut self, port: PortId, timeout: Timeout) -> SyscallResult<Receipt> {
        let me = self.me();
        let Some(p) = self.ports.get(port) else {
            return Err(self.bad_param("receive", "port"));
        };
        if p.owner != me {
            return Err(self.bad_call("receive", "Caller is not owner of port"));
        }
        if !p.queue.is_empty() {
            return Ok(Receipt::Ready);
        }
        match timeout {
            Timeout::Immediate => {
                self.ts_report(me, format!("times out on port {port}"));
                return Ok(Receipt::Empty);
            }
            Timeout::For(t) if t <= 0.0 => return Err(self.bad_param("receive", "time_out")),
            Timeout::For(t) => {
                let ev = self.add_event(self.now + t, EventKind::EndReceive(me));
                self.task_mut(me).rtoep = Some(ev);
            }
            Timeout::Forever => {}
        }
        self.ts_report(me, format!("receiving (blocked) on port {port}"));
        self.block_receive(port);
        Ok(Receipt::Wait)
    }

    /// Give up the processor until a message arrives on `port`
    fn block_receive(&mut self, port: PortId) {
        let me = self.me();
        {
            let task = self.task_mut(me);
            task.state = TaskState::Receiving;
            task.wport = Some(port);
        }
        self.cancel_qep(me);
        if self.task(me).hp.is_none() {
            abort("receiving task without a processor");
        }
        self.vacate_cpu(me);
    }

    /// Back from a wait: true when the caller blocked again
    pub(crate) fn recheck_receive(&mut self, port: PortId) -> SyscallResult<bool> {
        let me = self.me();
        let queued = match self.ports.get(port) {
            Some(p) if p.owner == me => !p.queue.is_empty(),
            _ => return Err(self.bad_call("receive", "Caller is not owner of port")),
        };
        if queued {
            self.cancel_rtoep(me);
            return Ok(false);
        }
        self.block_receive(port);
        Ok(true)
    }

    /// Take one queued message; a timeout yields `None`
    pub(crate) fn take_message(&mut self, port: PortId, order: ReceiveOrder) -> Option<Message> {
        let me = self.me();
        let n = self.ports.get(port).map_or(0, |p| p.queue.len());
        if n == 0 {
            abort("receive on an empty port");
        }
        let index = match order {
            ReceiveOrder::Fifo => 0,
            ReceiveOrder::Lifo => n - 1,
            ReceiveOrder::Random => self.rng.choice(n),
            ReceiveOrder::Priority => {
                // First of the highest priority
                let queue = &self.ports.get(port)?.queue;
                let mut best = (0, queue.front()?.priority);
                for (i, m) in queue.iter().enumerate().skip(1) {
                    if m.priority > best.1 {
                        best = (i, m.priority);
                    }
                }
                best.0
            }
        };
        let p = self.ports.get_mut(port)?;
        let mut msg = p.queue.remove(index)?;
        let kind = p.kind;

        let report = if msg.mtype == ACK_TIMEOUT {
            format!("times out on port {port}")
        } else {
            let origin = msg.origin.unwrap_or(port);
            if Some(port) == self.task(me).blind_port {
                format!("receives message {} on shared port {origin}", msg.mid)
            } else if kind == PortKind::Set {
                format!("receives message {} on port {origin}", msg.mid)
            } else {
                format!("receives message {} on port {port}", msg.mid)
            }
        };
        self.ts_report(me, report);

        if msg.mtype == ACK_TIMEOUT {
            return None;
        }
        if !self.is_internal(me) {
            let dye = msg.dye.take();
            self.adopt_message_dye(me, dye);
        }
        Some(msg)
    }

    pub(crate) fn end_receive(&mut self, tp: TaskId) {
        if self.task_state(tp) != TaskState::Receiving {
            abort("Bad receive timeout event");
        }
        let task = self.task_mut(tp);
        task.rtoep = None;
        let Some(port) = task.wport else {
            abort("Bad receive timeout event");
        };
        let mut msg = Message::new(ACK_TIMEOUT);
        msg.ts = self.now;
        msg.origin = Some(port);
        self.deliver(port, msg);
    }

    // ========================================================================
    // Shared ports
    // ========================================================================

    /// Ask the dispatcher of `port` for a message, to arrive on the
    /// caller's blind port
    pub(crate) fn request_shared(&mut self, port: PortId) -> SyscallResult<PortId> {
        let me = self.me();
        if self.ports.get(port).is_none_or(|p| p.kind != PortKind::Shared) {
            return Err(self.bad_param("receive_shared", "port"));
        }
        let blind = match self.task(me).blind_port {
            Some(b) if self.ports.contains(b) => b,
            _ => {
                let name = format!("{} - Blind Port", self.task(me).name);
                let b = self.new_port(name, PortKind::Used, me);
                self.task_mut(me).blind_port = Some(b);
                b
            }
        };
        let mut msg = Message::new(SP_REQUEST).with_reply(blind);
        msg.ts = self.now;
        msg.origin = Some(port);
        self.port_send(port, msg)?;
        Ok(blind)
    }

    pub(crate) fn cancel_shared(&mut self, port: PortId, blind: PortId) -> SyscallResult<()> {
        let mut msg = Message::new(SP_CANCEL).with_reply(blind);
        msg.ts = self.now;
        msg.origin = Some(port);
        self.port_send(port, msg)
    }

    pub(crate) fn release_shared_port(&mut self, port: PortId) -> SyscallResult<()> {
        let Some(owner) = self
            .ports
            .get(port)
            .filter(|p| p.kind == PortKind::Shared)
            .map(|p| p.owner)
        else {
            return Err(self.bad_param("release_shared_port", "port"));
        };
        self.kill_task(owner);
        Ok(())
    }

    // ========================================================================
    // Ownership
    // ========================================================================

    /// Move `port` to the front of `owner`'s port list
    fn move_port(&mut self, port: PortId, owner: TaskId) -> Option<TaskId> {
        let p = self.ports.get_mut(port)?;
        let old = std::mem::replace(&mut p.owner, owner);
        if let Some(task) = self.tasks.get_mut(old) {
            task.ports.retain(|&q| q != port);
        }
        self.task_mut(owner).ports.insert(0, port);
        Some(old)
    }

    /// Port set a surrogate serves
    fn set_of_surrogate(&self, surrogate: TaskId) -> Option<PortId> {
        let parent = self.tasks.get(surrogate)?.parent?;
        self.task(parent).ports.iter().copied().find(|&s| {
            self.ports
                .get(s)
                .is_some_and(|p| p.kind == PortKind::Set && p.members.iter().any(|&(t, _)| t == surrogate))
        })
    }

    pub(crate) fn pass_port(&mut self, port: PortId, task: TaskId) -> SyscallResult<()> {
        let Some(p) = self.ports.get(port).filter(|p| p.kind == PortKind::Used) else {
            return Err(self.bad_param("pass_port", "port"));
        };
        let old = p.owner;
        if !self.is_ancestor(old) {
            return Err(self.bad_call("pass_port", "Caller is not ancestor of port owner"));
        }
        if self.task(old).std_port == Some(port) {
            return Err(self.bad_call("pass_port", "Port is a standard port"));
        }
        if !self.tasks.contains(task) {
            return Err(self.bad_param("pass_port", "task"));
        }

        if let Some(caller) = self.hot {
            let report = if self.task(old).role == TaskRole::Surrogate {
                self.set_of_surrogate(old)
                    .map(|s| format!("removes port {port} from port set {s}"))
            } else if self.task(task).role == TaskRole::Surrogate {
                self.set_of_surrogate(task)
                    .map(|s| format!("inserts port {port} in port set {s}"))
            } else {
                Some(format!("passes port {port} to task {task}"))
            };
            if let Some(report) = report {
                self.ts_report(caller, report);
            }
        }

        self.move_port(port, task);

        if self.task(old).role == TaskRole::Surrogate {
            if let Some(set) = self.set_of_surrogate(old) {
                if let Some(s) = self.ports.get_mut(set) {
                    s.members.retain(|&(t, _)| t != old);
                }
            }
            self.kill_task(old);
        }
        // Last: the old owner may have been waiting on it
        self.wake_receiver_elsewhere(old, port);
        Ok(())
    }

    /// A task left blocked on a port it no longer owns gets to find out
    fn wake_receiver_elsewhere(&mut self, tid: TaskId, port: PortId) {
        let Some(task) = self.tasks.get(tid) else {
            return;
        };
        if task.state != TaskState::Receiving || task.wport != Some(port) {
            return;
        }
        self.cancel_rtoep(tid);
        self.task_mut(tid).wport = None;
        self.find_host(tid);
    }

    pub(crate) fn join_port_set(&mut self, set: PortId, port: PortId) -> SyscallResult<()> {
        let me = self.me();
        if set == port {
            return Err(self.bad_call("join_port_set", "port == port_set"));
        }
        let Some(s) = self.ports.get(set).filter(|p| p.kind == PortKind::Set) else {
            return Err(self.bad_param("join_port_set", "port_set"));
        };
        let set_owner = s.owner;
        let Some(p) = self.ports.get(port).filter(|p| p.kind == PortKind::Used) else {
            return Err(self.bad_param("join_port_set", "port"));
        };
        if set_owner != me || p.owner != me {
            return Err(self.bad_call("join_port_set", "Caller is not owner"));
        }
        if self.task(me).std_port == Some(port) {
            return Err(self.bad_call("join_port_set", "Port is caller's standard port"));
        }

        let (name, node, host) = {
            let task = self.task(me);
            (format!("{} Surrogate", task.name), task.node, task.host)
        };
        let body = Box::new(move |ctx: TaskCtx| -> super::task::BoxFuture {
            Box::pin(forward_port_set(ctx, port, set))
        });
        let surrogate = self.spawn_task(name, node, host, HELPER_PRIORITY, None, TaskRole::Surrogate, body);
        if let Some(s) = self.ports.get_mut(set) {
            s.members.insert(0, (surrogate, port));
        }
        self.ts_report(me, format!("inserts port {port} in port set {set}"));
        self.move_port(port, surrogate);
        self.resume(surrogate)
    }

    pub(crate) fn leave_port_set(&mut self, set: PortId, port: PortId) -> SyscallResult<()> {
        let me = self.me();
        let Some(s) = self.ports.get(set).filter(|p| p.kind == PortKind::Set) else {
            return Err(self.bad_param("leave_port_set", "port_set"));
        };
        if !self.ports.contains(port) {
            return Err(self.bad_param("leave_port_set", "port"));
        }
        if s.owner != me {
            return Err(self.bad_call("leave_port_set", "Caller is not port set owner"));
        }
        if !s.members.iter().any(|&(_, m)| m == port) {
            return Err(self.bad_call("leave_port_set", "port is not a member of port set"));
        }

        self.pass_port(port, me)?;

        // Messages that came in through the member go back to it
        let Some(s) = self.ports.get_mut(set) else {
            return Ok(());
        };
        let (back, keep): (VecDeque<Message>, VecDeque<Message>) =
            s.queue.drain(..).partition(|m| m.origin == Some(port));
        s.queue = keep;
        if let Some(p) = self.ports.get_mut(port) {
            p.queue.extend(back);
        }
        Ok(())
    }

    // ========================================================================
    // Release
    // ========================================================================

    pub(crate) fn release_port(&mut self, port: PortId) -> SyscallResult<()> {
        let Some(p) = self.ports.get(port) else {
            return Ok(());
        };
        if p.kind == PortKind::Shared {
            return Err(self.bad_call("release_port", "Port is a shared port"));
        }
        let owner = p.owner;
        if !self.is_ancestor(owner) {
            return Err(self.bad_call("release_port", "Caller is not ancestor of port owner"));
        }
        if self.hot == Some(owner) && self.task(owner).std_port == Some(port) {
            return Err(self.bad_call("release_port", "Port is a standard port"));
        }
        self.free_port(port);
        Ok(())
    }

    /// Drop a port with its messages; a set also loses its surrogates
    pub(crate) fn free_port(&mut self, port: PortId) {
        let Some(p) = self.ports.remove(port) else {
            return;
        };
        for (surrogate, _) in p.members {
            if self.tasks.contains(surrogate) {
                self.kill_task(surrogate);
            }
        }
        let owner = p.owner;
        let Some(task) = self.tasks.get_mut(owner) else {
            return;
        };
        task.ports.retain(|&q| q != port);
        if task.std_port == Some(port) {
            task.std_port = None;
        }
        if task.blind_port == Some(port) {
            task.blind_port = None;
        }
        self.wake_receiver_elsewhere(owner, port);
    }

    /// Free every port of a dying task
    pub(crate) fn release_ports(&mut self, tp: TaskId) {
        let ports = std::mem::take(&mut self.task_mut(tp).ports);
        for port in ports {
            self.free_port(port);
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn port_owner(&self, port: PortId) -> Option<TaskId> {
        self.ports.get(port).map(|p| p.owner)
    }

    pub fn port_queue_len(&self, port: PortId) -> usize {
        self.ports.get(port).map_or(0, |p| p.queue.len())
    }

    pub fn port_name(&self, port: PortId) -> Option<&str> {
        self.ports.get(port).map(|p| p.name.as_str())
    }

    pub fn std_port(&self, tid: TaskId) -> Option<PortId> {
        self.tasks.get(tid).and_then(|task| task.std_port)
    }

    pub fn owned_ports(&self, tid: TaskId) -> Vec<PortId> {
        self.tasks
            .get(tid)
            .map(|task| task.ports.clone())
            .unwrap_or_default()
    }
}

// ============================================================================
// Helper task bodies
// ============================================================================

/// Moves everything that arrives on a member port into its port set
async fn forward_port_set(ctx: TaskCtx, member: PortId, set: PortId) {
    loop {
        let Ok(Some(mut msg)) = ctx.receive_ordered(member, Timeout::Forever, ReceiveOrder::Fifo).await else {
            return;
        };
        msg.origin = Some(member);
        if ctx.forward(set, msg).await.is_err() {
            return;
        }
    }
}

/// Matches receivers' requests on a shared port with its messages.
/// `balance` counts waiting requests when positive and waiting
/// messages when negative.
async fn dispatch_shared_port(ctx: TaskCtx) {
    let Some(port) = ctx.with(|k| k.std_port(ctx.id())) else {
        return;
    };
    let mut balance: i64 = 0;
    let mut waiting: VecDeque<Message> = VecDeque::new();

    loop {
        let Ok(Some(msg)) = ctx.receive_ordered(port, Timeout::Forever, ReceiveOrder::Fifo).await else {
            return;
        };
        match msg.mtype {
            SP_REQUEST => {
                let Some(reply) = msg.reply else {
                    continue;
                };
                balance += 1;
                if balance > 0 {
                    waiting.push_back(msg);
                    continue;
                }
                let Some(queued) = waiting.pop_front() else {
                    continue;
                };
                if let Err(queued) = ctx.forward_or_return(reply, queued).await {
                    waiting.push_front(queued);
                    balance -= 1;
                }
            }
            SP_CANCEL if balance > 0 => {
                if let Some(i) = waiting.iter().position(|r| r.reply == msg.reply) {
                    waiting.remove(i);
                    balance -= 1;
                }
            }
            SP_CANCEL => {}
            _ => {
                balance -= 1;
                if balance < 0 {
                    waiting.push_back(msg);
                    continue;
                }
                let mut pending = Some(msg);
                while balance >= 0 {
                    let Some(request) = waiting.pop_front() else {
                        break;
                    };
                    let Some(m) = pending.take() else {
                        break;
                    };
                    let Some(reply) = request.reply else {
                        pending = Some(m);
                        balance -= 1;
                        continue;
                    };
                    match ctx.forward_or_return(reply, m).await {
                        Ok(()) => break,
                        Err(m) => {
                            pending = Some(m);
                            balance -= 1;
                        }
                    }
                }
                // Every receiver had gone away
                if let Some(m) = pending {
                    waiting.push_back(m);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::SimConfig;
    use crate::kernel::node::NodeId;

    #[test]
    fn test_message_builder() {
        let msg = Message::new(7).with_payload(42u32).with_size(128);
        assert_eq!(msg.mtype, 7);
        assert_eq!(msg.payload::<u32>(), Some(&42));
        assert_eq!(msg.payload::<String>(), None);
        assert_eq!(msg.size, 128);
        assert!(msg.reply.is_none());
    }

    #[test]
    fn test_port_send_to_freed_port() {
        let mut kernel = Kernel::new(&SimConfig::default());
        let owner = kernel.spawn_task(
            "t".into(),
            NodeId(0),
            None,
            1,
            None,
            TaskRole::User,
            Box::new(|_ctx: TaskCtx| -> super::super::task::BoxFuture { Box::pin(async {}) }),
        );
        let port = kernel.new_port("p".into(), PortKind::Used, owner);
        assert!(kernel.port_send(port, Message::new(1)).is_ok());
        assert_eq!(kernel.port_queue_len(port), 1);

        kernel.free_port(port);
        assert!(kernel.port_send(port, Message::new(1)).is_err());
        assert!(!kernel.owned_ports(owner).contains(&port));
    }
}
