//! Event calendar
//!
//! Time-ordered list of pending kernel events. The driver loop pops the
//! earliest event and dispatches it; tasks hold handles so that their own
//! pending events (compute end, quantum end, receive timeout) can be
//! cancelled in O(1).
//!
//! Design:
//! - Nodes live in a `Slab`, linked into a doubly linked list by key
//! - Insertion scans from whichever end is closer in time
//! - Events with equal times pop in insertion order
//! - Handles carry a sequence number, so cancelling an event twice is
//!   caught instead of silently removing a newer event in the same slot

use slab::Slab;

use super::medium::Medium;
use super::task::TaskId;
use super::error::abort;

/// What happens when an event fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A sync interval ended
    EndSync(TaskId),
    /// A compute interval ended
    EndCompute(TaskId),
    /// A time slice expired
    EndQuantum(TaskId),
    /// The head message on a bus or link finished transmission
    EndTrans(Medium),
    /// A sleep interval ended
    EndSleep(TaskId),
    /// A receive timeout expired
    EndReceive(TaskId),
    /// A blocked task regains its processor
    EndBlock(TaskId),
    /// A block-statistics boundary was reached
    StatBlock,
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::EndSync(_) => "END_SYNC",
            EventKind::EndCompute(_) => "END_COMPUTE",
            EventKind::EndQuantum(_) => "END_QUANTUM",
            EventKind::EndTrans(_) => "END_TRANS",
            EventKind::EndSleep(_) => "END_SLEEP",
            EventKind::EndReceive(_) => "END_RECEIVE",
            EventKind::EndBlock(_) => "END_BLOCK",
            EventKind::StatBlock => "STAT_BLOCK",
        }
    }
}

/// Reference to a scheduled event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHandle {
    key: usize,
    seq: u64,
}

#[derive(Debug)]
struct Entry {
    time: f64,
    kind: EventKind,
    seq: u64,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Ordered event list
#[derive(Debug, Default)]
pub struct Calendar {
    entries: Slab<Entry>,
    head: Option<usize>,
    tail: Option<usize>,
    next_seq: u64,
}

impl Calendar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Schedule `kind` at `time`
    pub fn add(&mut self, time: f64, kind: EventKind) -> EventHandle {
        let seq = self.next_seq;
        self.next_seq += 1;
        let key = self.entries.insert(Entry {
            time,
            kind,
            seq,
            prev: None,
            next: None,
        });

        let (prev, next) = match (self.head, self.tail) {
            (Some(head), Some(tail)) => {
                let head_time = self.entries[head].time;
                let tail_time = self.entries[tail].time;
                if time + time < head_time + tail_time {
                    // Closer to the head: stop before the first later event
                    let mut cursor = Some(head);
                    let mut prev = None;
                    while let Some(k) = cursor {
                        if self.entries[k].time > time {
                            break;
                        }
                        prev = Some(k);
                        cursor = self.entries[k].next;
                    }
                    (prev, cursor)
                } else {
                    // Closer to the tail: stop after the last event not later
                    let mut cursor = Some(tail);
                    let mut next = None;
                    while let Some(k) = cursor {
                        if self.entries[k].time <= time {
                            break;
                        }
                        next = Some(k);
                        cursor = self.entries[k].prev;
                    }
                    (cursor, next)
                }
            }
            _ => (None, None),
        };

        self.link(key, prev, next);
        EventHandle { key, seq }
    }

    fn link(&mut self, key: usize, prev: Option<usize>, next: Option<usize>) {
        self.entries[key].prev = prev;
        self.entries[key].next = next;
        match prev {
            Some(p) => self.entries[p].next = Some(key),
            None => self.head = Some(key),
        }
        match next {
            Some(n) => self.entries[n].prev = Some(key),
            None => self.tail = Some(key),
        }
    }

    fn unlink(&mut self, key: usize) -> Entry {
        let entry = self.entries.remove(key);
        match entry.prev {
            Some(p) => self.entries[p].next = entry.next,
            None => self.head = entry.next,
        }
        match entry.next {
            Some(n) => self.entries[n].prev = entry.prev,
            None => self.tail = entry.prev,
        }
        entry
    }

    fn resolve(&self, handle: EventHandle) -> Option<&Entry> {
        self.entries
            .get(handle.key)
            .filter(|entry| entry.seq == handle.seq)
    }

    pub fn contains(&self, handle: EventHandle) -> bool {
        self.resolve(handle).is_some()
    }

    /// Scheduled time of a pending event
    pub fn time_of(&self, handle: EventHandle) -> f64 {
        match self.resolve(handle) {
            Some(entry) => entry.time,
            None => abort("event not in the calendar"),
        }
    }

    /// Cancel a pending event
    pub fn remove(&mut self, handle: EventHandle) -> EventKind {
        if self.resolve(handle).is_none() {
            abort("removing an event not in the calendar");
        }
        self.unlink(handle.key).kind
    }

    /// Time of the earliest event
    pub fn peek_time(&self) -> Option<f64> {
        self.head.map(|k| self.entries[k].time)
    }

    /// Remove and return the earliest event
    pub fn pop(&mut self) -> Option<(f64, EventKind)> {
        let head = self.head?;
        let entry = self.unlink(head);
        Some((entry.time, entry.kind))
    }

    /// Remove the first END_BLOCK event due at `now`, returning its task
    pub fn take_block_due(&mut self, now: f64) -> Option<TaskId> {
        let mut cursor = self.head;
        while let Some(k) = cursor {
            let entry = &self.entries[k];
            if entry.time > now {
                return None;
            }
            if let EventKind::EndBlock(task) = entry.kind {
                self.unlink(k);
                return Some(task);
            }
            cursor = entry.next;
        }
        None
    }

    /// Remove the first `kind` event due exactly at `time`
    pub fn take_at(&mut self, time: f64, kind: EventKind) -> bool {
        let mut cursor = self.head;
        while let Some(k) = cursor {
            let entry = &self.entries[k];
            if entry.time > time {
                return false;
            }
            if entry.time == time && entry.kind == kind {
                self.unlink(k);
                return true;
            }
            cursor = entry.next;
        }
        false
    }

    /// Pending events in firing order
    pub fn iter(&self) -> impl Iterator<Item = (f64, EventKind)> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let k = cursor?;
            let entry = &self.entries[k];
            cursor = entry.next;
            Some((entry.time, entry.kind))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn times(cal: &Calendar) -> Vec<f64> {
        cal.iter().map(|(t, _)| t).collect()
    }

    #[test]
    fn test_pop_in_time_order() {
        let mut cal = Calendar::new();
        cal.add(3.0, EventKind::StatBlock);
        cal.add(1.0, EventKind::StatBlock);
        cal.add(2.0, EventKind::StatBlock);
        assert_eq!(times(&cal), vec![1.0, 2.0, 3.0]);
        assert_eq!(cal.pop().map(|(t, _)| t), Some(1.0));
        assert_eq!(cal.len(), 2);
    }

    #[test]
    fn test_equal_times_keep_insertion_order() {
        let mut cal = Calendar::new();
        let kinds = [
            EventKind::EndTrans(Medium::Bus(super::super::medium::BusId(0))),
            EventKind::StatBlock,
            EventKind::EndTrans(Medium::Bus(super::super::medium::BusId(1))),
        ];
        cal.add(0.0, EventKind::StatBlock);
        for kind in kinds {
            cal.add(5.0, kind);
        }
        cal.add(9.0, EventKind::StatBlock);
        // Tail-side insert at a tied time
        cal.add(5.0, EventKind::EndTrans(Medium::Bus(super::super::medium::BusId(2))));

        cal.pop();
        let popped: Vec<EventKind> = std::iter::from_fn(|| cal.pop())
            .take(4)
            .map(|(_, k)| k)
            .collect();
        assert_eq!(popped[..3], kinds);
        assert_eq!(
            popped[3],
            EventKind::EndTrans(Medium::Bus(super::super::medium::BusId(2)))
        );
    }

    #[test]
    fn test_remove_middle() {
        let mut cal = Calendar::new();
        cal.add(1.0, EventKind::StatBlock);
        let mid = cal.add(2.0, EventKind::StatBlock);
        cal.add(3.0, EventKind::StatBlock);
        assert_eq!(cal.time_of(mid), 2.0);
        cal.remove(mid);
        assert!(!cal.contains(mid));
        assert_eq!(times(&cal), vec![1.0, 3.0]);
    }

    #[test]
    #[should_panic(expected = "removing an event not in the calendar")]
    fn test_double_remove_panics() {
        let mut cal = Calendar::new();
        let h = cal.add(1.0, EventKind::StatBlock);
        cal.remove(h);
        // Slot reused by a new event; the old handle must not match it
        cal.add(1.0, EventKind::StatBlock);
        cal.remove(h);
    }

    #[test]
    fn test_take_block_due_only_at_now() {
        use super::super::table::Handle;
        let task = TaskId::from_parts(3, 0);
        let mut cal = Calendar::new();
        cal.add(1.0, EventKind::StatBlock);
        cal.add(1.0, EventKind::EndBlock(task));
        cal.add(2.0, EventKind::EndBlock(TaskId::from_parts(4, 0)));

        assert_eq!(cal.take_block_due(0.5), None);
        assert_eq!(cal.take_block_due(1.0), Some(task));
        assert_eq!(cal.take_block_due(1.0), None);
        assert_eq!(cal.len(), 2);
    }

    #[test]
    fn test_take_at_skips_earlier_events() {
        use super::super::table::Handle;
        let mut cal = Calendar::new();
        cal.add(5.0, EventKind::EndCompute(TaskId::from_parts(1, 0)));
        cal.add(5.0, EventKind::StatBlock);

        assert!(!cal.take_at(4.0, EventKind::StatBlock));
        assert!(cal.take_at(5.0, EventKind::StatBlock));
        assert!(!cal.take_at(5.0, EventKind::StatBlock));
        assert_eq!(cal.len(), 1);
    }

    proptest! {
        #[test]
        fn prop_pops_are_sorted_and_stable(raw in proptest::collection::vec(0u8..20, 1..100)) {
            use super::super::medium::BusId;
            let mut cal = Calendar::new();
            for (n, t) in raw.iter().enumerate() {
                cal.add(f64::from(*t), EventKind::EndTrans(Medium::Bus(BusId(n))));
            }
            let mut last: Option<(f64, usize)> = None;
            while let Some((t, kind)) = cal.pop() {
                let EventKind::EndTrans(Medium::Bus(BusId(n))) = kind else {
                    unreachable!()
                };
                if let Some((lt, ln)) = last {
                    prop_assert!(lt < t || (lt == t && ln < n));
                }
                last = Some((t, n));
            }
        }
    }
}
