//! Nodes, processors and groups
//!
//! A node is a set of identical processors sharing one ready queue and
//! one scheduling discipline. Groups partition a CFS node's tasks for
//! fair-share scheduling.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use super::cfs::{RqId, RunQueue, SchedInfo};
use super::error::SyscallResult;
use super::medium::{BusId, LinkId};
use super::stats::{StatId, StatKind};
use super::task::TaskId;
use super::Kernel;

/// Index of a node; node 0 is built by the kernel itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub usize);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of a fair-share group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(pub usize);

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ready queue discipline of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Discipline {
    /// First come, first served; no preemption
    Fifo,
    /// Head of line: priority order, no preemption
    Hol,
    /// Preemptive priority
    Pr,
    /// Random queue position
    Rand,
    /// Last come, first served
    Lifo,
    /// Completely fair scheduling with optional groups
    Cfs,
}

/// Which utilization statistics a node or medium records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatFlags(pub u32);

impl StatFlags {
    pub const NONE: StatFlags = StatFlags(0);
    /// One stat per processor
    pub const PER_HOST: StatFlags = StatFlags(1);
    /// One stat for the whole node (or medium)
    pub const PER_NODE: StatFlags = StatFlags(2);
    /// One stat per task per processor
    pub const PER_TASK_HOST: StatFlags = StatFlags(4);
    /// One stat per task on the node
    pub const PER_TASK_NODE: StatFlags = StatFlags(8);

    pub fn contains(self, other: StatFlags) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for StatFlags {
    type Output = StatFlags;

    fn bitor(self, rhs: StatFlags) -> StatFlags {
        StatFlags(self.0 | rhs.0)
    }
}

/// One processor of a node
#[derive(Debug, Default)]
pub(crate) struct Cpu {
    pub busy: bool,
    pub run_task: Option<TaskId>,
    pub stat: Option<StatId>,
    /// Per-task utilization on this processor, opened on first run
    pub task_stats: HashMap<TaskId, StatId>,
    /// CFS run queue of the processor
    pub rq: Option<RqId>,
    /// CFS run queue of each group on this processor, by group ordinal
    pub group_rqs: Vec<RqId>,
}

#[derive(Debug)]
pub(crate) struct Node {
    pub name: String,
    pub ncpu: usize,
    pub nfree: usize,
    pub speed: f64,
    pub quantum: f64,
    pub discipline: Discipline,
    pub sf: StatFlags,
    pub build_time: f64,
    pub stat: Option<StatId>,
    pub task_stats: HashMap<TaskId, StatId>,
    pub cpus: Vec<Cpu>,
    /// Ready tasks in service order (unused by CFS)
    pub ready: VecDeque<TaskId>,
    pub buses: Vec<BusId>,
    pub send_links: Vec<LinkId>,
    pub recv_links: Vec<LinkId>,
    pub groups: Vec<GroupId>,
}

impl Node {
    pub fn new(
        name: String,
        ncpu: usize,
        speed: f64,
        quantum: f64,
        discipline: Discipline,
        sf: StatFlags,
        now: f64,
    ) -> Self {
        Self {
            name,
            ncpu,
            nfree: ncpu,
            speed,
            quantum,
            discipline,
            sf,
            build_time: now,
            stat: None,
            task_stats: HashMap::new(),
            cpus: (0..ncpu).map(|_| Cpu::default()).collect(),
            ready: VecDeque::new(),
            buses: Vec::new(),
            send_links: Vec::new(),
            recv_links: Vec::new(),
            groups: Vec::new(),
        }
    }

    pub fn first_idle(&self) -> Option<usize> {
        self.cpus.iter().position(|cpu| !cpu.busy)
    }
}

/// Fair-share group on a CFS node
#[derive(Debug)]
pub(crate) struct Group {
    pub name: String,
    pub node: NodeId,
    /// Share is a hard limit rather than a weight
    pub cap: bool,
    /// Position among the node's groups, indexes `Cpu::group_rqs`
    pub ordinal: usize,
    pub stat: StatId,
    /// Processors currently running one of the group's tasks
    pub running: usize,
    pub task_stats: HashMap<TaskId, StatId>,
}

// ============================================================================
// Construction
// ============================================================================

impl Kernel {
    pub(crate) fn build_node(
        &mut self,
        name: &str,
        ncpu: usize,
        speed: f64,
        quantum: f64,
        discipline: Discipline,
        sf: StatFlags,
    ) -> SyscallResult<NodeId> {
        if ncpu < 1 {
            return Err(self.bad_param("build_node", "ncpu"));
        }
        if speed <= 0.0 {
            return Err(self.bad_param("build_node", "speed"));
        }
        if quantum < 0.0 {
            return Err(self.bad_param("build_node", "quantum"));
        }

        let now = self.now;
        let mut node = Node::new(name.to_string(), ncpu, speed, quantum, discipline, sf, now);
        if sf.contains(StatFlags::PER_NODE) {
            node.stat = Some(self.open_internal_stat(format!("{name} Utilization"), StatKind::Variable, now));
        }
        for (i, cpu) in node.cpus.iter_mut().enumerate() {
            if sf.contains(StatFlags::PER_HOST) {
                let stat_name = format!("{name} (cpu {i}) Utilization");
                cpu.stat = Some(self.open_internal_stat(stat_name, StatKind::Variable, now));
            }
            if discipline == Discipline::Cfs {
                cpu.rq = Some(self.new_rq(RunQueue::new(now, None)));
            }
        }

        self.nodes.push(node);
        Ok(NodeId(self.nodes.len() - 1))
    }

    /// Add a fair-share group to a node. On a CFS node every processor
    /// gets a queue for the group, entered in the processor's queue with
    /// the group's share as weight.
    pub(crate) fn build_group(&mut self, name: &str, share: f64, node: NodeId, cap: bool) -> SyscallResult<GroupId> {
        if node.0 >= self.nodes.len() {
            return Err(self.bad_param("build_group", "node"));
        }
        if share < 0.0 {
            return Err(self.bad_param("build_group", "group share"));
        }

        let now = self.now;
        let gid = GroupId(self.groups.len());
        let ordinal = self.nodes[node.0].groups.len();
        if self.discipline(node) == Discipline::Cfs {
            let quantum = self.nodes[node.0].quantum;
            for h in 0..self.nodes[node.0].ncpu {
                let host_rq = self.host_rq(node, h);
                let si = self.sis.insert(SchedInfo::new(None, host_rq, share, quantum));
                let rq = self.new_rq(RunQueue::new(now, Some(si)));
                if let Some(entry) = self.sis.get_mut(si) {
                    entry.own_rq = Some(rq);
                }
                self.nodes[node.0].cpus[h].group_rqs.push(rq);
            }
        }

        let stat = self.open_internal_stat(format!("{name} Utilization"), StatKind::Variable, now);
        self.groups.push(Group {
            name: name.to_string(),
            node,
            cap,
            ordinal,
            stat,
            running: 0,
            task_stats: HashMap::new(),
        });
        self.nodes[node.0].groups.push(gid);
        Ok(gid)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_name(&self, node: NodeId) -> Option<&str> {
        self.nodes.get(node.0).map(|n| n.name.as_str())
    }

    pub fn node_ncpu(&self, node: NodeId) -> Option<usize> {
        self.nodes.get(node.0).map(|n| n.ncpu)
    }
}
