//! Buses and links
//!
//! A bus connects two or more nodes, a link connects one source node to
//! one destination node. Either medium carries one message at a time:
//! the head of its queue is in transmission for `size / rate` time units,
//! then it is delivered to the target port and the next message starts.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use super::calendar::{EventHandle, EventKind};
use super::error::{abort, SyscallResult};
use super::node::{Discipline, NodeId, StatFlags};
use super::port::{Message, PortId, PortKind};
use super::stats::{StatId, StatKind};
use super::task::TaskRole;
use super::Kernel;

/// Index of a bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BusId(pub usize);

impl std::fmt::Display for BusId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LinkId(pub usize);

impl std::fmt::Display for LinkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A transmission medium
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Medium {
    Bus(BusId),
    Link(LinkId),
}

/// A message on its way to `port`
#[derive(Debug)]
pub(crate) struct InFlight {
    pub port: PortId,
    pub msg: Message,
}

#[derive(Debug)]
pub(crate) struct Bus {
    pub name: String,
    pub nodes: Vec<NodeId>,
    pub rate: f64,
    pub discipline: Discipline,
    /// Head is in transmission
    pub queue: VecDeque<InFlight>,
    pub stat: Option<StatId>,
    pub event: Option<EventHandle>,
}

#[derive(Debug)]
pub(crate) struct Link {
    pub name: String,
    pub source: NodeId,
    pub destination: NodeId,
    pub rate: f64,
    pub queue: VecDeque<InFlight>,
    pub stat: Option<StatId>,
    pub event: Option<EventHandle>,
}

impl Kernel {
    // ========================================================================
    // Construction
    // ========================================================================

    pub(crate) fn build_bus(
        &mut self,
        name: &str,
        nodes: &[NodeId],
        rate: f64,
        discipline: Discipline,
        sf: StatFlags,
    ) -> SyscallResult<BusId> {
        if nodes.len() < 2 {
            return Err(self.bad_param("build_bus", "ncount"));
        }
        if nodes.iter().any(|n| n.0 >= self.nodes.len()) {
            return Err(self.bad_param("build_bus", "node_array"));
        }
        if rate <= 0.0 {
            return Err(self.bad_param("build_bus", "trans_rate"));
        }
        if !matches!(discipline, Discipline::Fifo | Discipline::Rand) {
            return Err(self.bad_param("build_bus", "discipline"));
        }

        let id = BusId(self.buses.len());
        for &np in nodes.iter().rev() {
            self.nodes[np.0].buses.insert(0, id);
        }
        let stat = (!sf.is_empty()).then(|| {
            self.open_internal_stat(format!("{name} Utilization"), StatKind::Variable, self.now)
        });
        self.buses.push(Bus {
            name: name.to_string(),
            nodes: nodes.to_vec(),
            rate,
            discipline,
            queue: VecDeque::new(),
            stat,
            event: None,
        });
        Ok(id)
    }

    pub(crate) fn build_link(
        &mut self,
        name: &str,
        source: NodeId,
        destination: NodeId,
        rate: f64,
        sf: StatFlags,
    ) -> SyscallResult<LinkId> {
        if source.0 >= self.nodes.len() {
            return Err(self.bad_param("build_link", "source"));
        }
        if destination.0 >= self.nodes.len() {
            return Err(self.bad_param("build_link", "destination"));
        }
        if rate <= 0.0 {
            return Err(self.bad_param("build_link", "trans_rate"));
        }
        if source == destination {
            return Err(self.bad_call("build_link", "source == destination"));
        }

        let id = LinkId(self.links.len());
        self.nodes[source.0].send_links.insert(0, id);
        self.nodes[destination.0].recv_links.insert(0, id);
        let stat = (!sf.is_empty()).then(|| {
            self.open_internal_stat(format!("{name} Utilization"), StatKind::Variable, self.now)
        });
        self.links.push(Link {
            name: name.to_string(),
            source,
            destination,
            rate,
            queue: VecDeque::new(),
            stat,
            event: None,
        });
        Ok(id)
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Owner of a live port, looking through surrogates to the port set
    /// owner they serve
    fn visible_owner(&self, port: PortId) -> Option<super::task::TaskId> {
        let owner = self.ports.get(port)?.owner;
        let task = self.tasks.get(owner)?;
        if task.role == TaskRole::Surrogate {
            task.parent
        } else {
            Some(owner)
        }
    }

    fn medium_send_report(&mut self, mid: u64, port: PortId, via: String) {
        let Some(caller) = self.hot else {
            return;
        };
        let shared = self
            .ports
            .get(port)
            .is_some_and(|p| p.kind == PortKind::Shared);
        let msg = if shared {
            format!("sending message {mid} to shared port {port} via {via}")
        } else {
            match self.visible_owner(port) {
                Some(owner) => {
                    format!("sending message {mid} to task {owner} via port {port} and {via}")
                }
                None => return,
            }
        };
        self.ts_report(caller, msg);
    }

    /// Queue a message on a bus for a port whose owner's node the bus
    /// reaches
    pub(crate) fn bus_send(&mut self, bus: BusId, port: PortId, msg: Message) -> SyscallResult<()> {
        if bus.0 >= self.buses.len() {
            return Err(self.bad_param("bus_send", "bus"));
        }
        let Some(owner) = self.ports.get(port).map(|p| p.owner) else {
            return Err(self.bad_param("bus_send", "port"));
        };
        let me = self.me();
        let (src, dst) = (self.task(me).node, self.task(owner).node);
        let nodes = &self.buses[bus.0].nodes;
        let (sf, df) = (nodes.contains(&src), nodes.contains(&dst));
        if !df {
            return Err(self.bad_call("bus_send", "owner of \"port\" not connected to bus"));
        }
        if !sf {
            return Err(self.bad_call("bus_send", "Sender not connected to bus"));
        }

        let msg = self.stamp_message(msg, port);
        let mid = msg.mid;
        let size = msg.size;
        let queued = self.buses[bus.0].queue.len();
        let pos = if self.buses[bus.0].discipline == Discipline::Rand && queued > 0 {
            // Never ahead of the message in transmission
            self.rng.choice(queued) + 1
        } else {
            queued
        };
        self.buses[bus.0].queue.insert(pos, InFlight { port, msg });
        let via = format!("bus {bus} ({})", self.buses[bus.0].name);
        self.medium_send_report(mid, port, via);

        if queued == 0 {
            if let Some(sid) = self.buses[bus.0].stat {
                self.record_internal(sid, 1.0);
            }
            let delay = size as f64 / self.buses[bus.0].rate;
            let ev = self.add_event(self.now + delay, EventKind::EndTrans(Medium::Bus(bus)));
            self.buses[bus.0].event = Some(ev);
        }
        Ok(())
    }

    /// Queue a message on a link from the caller's node to the node of
    /// the port owner
    pub(crate) fn link_send(&mut self, link: LinkId, port: PortId, msg: Message) -> SyscallResult<()> {
        if link.0 >= self.links.len() {
            return Err(self.bad_param("link_send", "link"));
        }
        let Some(owner) = self.ports.get(port).map(|p| p.owner) else {
            return Err(self.bad_param("link_send", "port"));
        };
        let me = self.me();
        if self.links[link.0].source != self.task(me).node {
            return Err(self.bad_call("link_send", "Sender not connected to link"));
        }
        if self.links[link.0].destination != self.task(owner).node {
            return Err(self.bad_call("link_send", "Port owner not connected to link"));
        }

        let msg = self.stamp_message(msg, port);
        let (mid, size) = (msg.mid, msg.size);
        let idle = self.links[link.0].queue.is_empty();
        self.links[link.0].queue.push_back(InFlight { port, msg });
        let via = format!("link {link} ({})", self.links[link.0].name);
        self.medium_send_report(mid, port, via);

        if idle {
            if let Some(sid) = self.links[link.0].stat {
                self.record_internal(sid, 1.0);
            }
            let delay = size as f64 / self.links[link.0].rate;
            let ev = self.add_event(self.now + delay, EventKind::EndTrans(Medium::Link(link)));
            self.links[link.0].event = Some(ev);
        }
        Ok(())
    }

    // ========================================================================
    // Transmission end
    // ========================================================================

    /// Pop the message that finished, starting the next one or marking
    /// the medium idle
    fn advance_medium(&mut self, medium: Medium) -> InFlight {
        let (queue, rate, stat) = match medium {
            Medium::Bus(bus) => {
                let b = &mut self.buses[bus.0];
                b.event = None;
                (&mut b.queue, b.rate, b.stat)
            }
            Medium::Link(link) => {
                let l = &mut self.links[link.0];
                l.event = None;
                (&mut l.queue, l.rate, l.stat)
            }
        };
        let Some(head) = queue.pop_front() else {
            abort("Empty message transmitted");
        };
        let next = queue.front().map(|f| f.msg.size as f64 / rate);

        match next {
            Some(delay) => {
                let ev = self.add_event(self.now + delay, EventKind::EndTrans(medium));
                match medium {
                    Medium::Bus(bus) => self.buses[bus.0].event = Some(ev),
                    Medium::Link(link) => self.links[link.0].event = Some(ev),
                }
            }
            None => {
                if let Some(sid) = stat {
                    self.record_internal(sid, 0.0);
                }
            }
        }
        head
    }

    pub(crate) fn end_trans(&mut self, medium: Medium) {
        let delivered = self.advance_medium(medium);
        let InFlight { port, msg } = delivered;
        let Some(owner) = self.ports.get(port).map(|p| p.owner) else {
            self.warning("Message target port undefined");
            return;
        };
        let dst = self.task(owner).node;
        let reachable = match medium {
            Medium::Bus(bus) => self.buses[bus.0].nodes.contains(&dst),
            Medium::Link(link) => self.links[link.0].destination == dst,
        };
        if !reachable {
            match medium {
                Medium::Bus(_) => self.warning("Message target port not on bus"),
                Medium::Link(_) => self.warning("Message target port not on link"),
            }
            return;
        }
        self.deliver(port, msg);
    }

    pub fn bus_queue_len(&self, bus: BusId) -> usize {
        self.buses.get(bus.0).map_or(0, |b| b.queue.len())
    }

    pub fn link_queue_len(&self, link: LinkId) -> usize {
        self.links.get(link.0).map_or(0, |l| l.queue.len())
    }
}
