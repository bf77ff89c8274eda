use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap};

use crate::core::errors::{Result, XlbError};
use crate::core::layout::Rank;

/// Integer tag a work unit is queued and requested under
pub type WorkType = i32;

/// Priority given to notification units so they overtake ordinary work
pub const NOTIFICATION_PRIORITY: i32 = i32::MAX;

/// A typed, prioritized task payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub payload: Vec<u8>,
    /// Rank that must receive the unit, or `None` for any worker
    pub target: Option<Rank>,
    /// Rank the eventual result should be sent to
    pub answer: Rank,
    pub work_type: WorkType,
    /// Higher is more urgent
    pub priority: i32,
}

impl WorkUnit {
    pub fn new(work_type: WorkType, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            target: None,
            answer: 0,
            work_type,
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_target(mut self, target: Rank) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_answer(mut self, answer: Rank) -> Self {
        self.answer = answer;
        self
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Heap entry: higher priority first, then earlier arrival
#[derive(Debug)]
struct Queued {
    priority: i32,
    seq: u64,
    unit: WorkUnit,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Queued {}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Per-server queue of work units indexed by type and by target rank
#[derive(Debug)]
pub struct WorkQueue {
    untargeted: HashMap<WorkType, BinaryHeap<Queued>>,
    targeted: HashMap<(Rank, WorkType), BinaryHeap<Queued>>,
    len: usize,
    capacity: usize,
    next_seq: u64,
}

impl WorkQueue {
    /// Creates a new WorkQueue holding at most `capacity` units
    pub fn new(capacity: usize) -> Self {
        Self {
            untargeted: HashMap::new(),
            targeted: HashMap::new(),
            len: 0,
            capacity,
            next_seq: 0,
        }
    }

    /// Queue a unit; fails when the server is at capacity
    pub fn push(&mut self, unit: WorkUnit) -> Result<()> {
        if self.len >= self.capacity {
            return Err(XlbError::resource_exhausted(
                "queued_units",
                self.len as u64 + 1,
                self.capacity as u64,
            ));
        }
        let queued = Queued {
            priority: unit.priority,
            seq: self.next_seq,
            unit,
        };
        self.next_seq += 1;
        let heap = match queued.unit.target {
            Some(rank) => self.targeted.entry((rank, queued.unit.work_type)).or_default(),
            None => self.untargeted.entry(queued.unit.work_type).or_default(),
        };
        heap.push(queued);
        self.len += 1;
        Ok(())
    }

    /// Best unit of `work_type` that `rank` may receive.
    ///
    /// Units targeted at `rank` compete with untargeted ones on the same
    /// priority/arrival order.
    pub fn pop_for(&mut self, rank: Rank, work_type: WorkType) -> Option<WorkUnit> {
        let targeted_top = self.targeted.get(&(rank, work_type)).and_then(|h| h.peek());
        let untargeted_top = self.untargeted.get(&work_type).and_then(|h| h.peek());
        let use_targeted = match (targeted_top, untargeted_top) {
            (None, None) => return None,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (Some(t), Some(u)) => t > u,
        };

        let queued = if use_targeted {
            pop_and_prune(&mut self.targeted, &(rank, work_type))
        } else {
            pop_and_prune(&mut self.untargeted, &work_type)
        }?;
        self.len -= 1;
        Some(queued.unit)
    }

    /// Remove up to half (rounded up) of the untargeted units of each wanted
    /// type, highest priority first. Targeted units never leave.
    pub fn steal(&mut self, wanted: &[WorkType]) -> Vec<WorkUnit> {
        let mut stolen = Vec::new();
        for work_type in wanted {
            let Some(heap) = self.untargeted.get_mut(work_type) else {
                continue;
            };
            let take = (heap.len() + 1) / 2;
            for _ in 0..take {
                if let Some(queued) = heap.pop() {
                    stolen.push(queued.unit);
                }
            }
            if heap.is_empty() {
                self.untargeted.remove(work_type);
            }
        }
        self.len -= stolen.len();
        stolen
    }

    /// Stealable depth per type
    pub fn counts_by_type(&self) -> BTreeMap<WorkType, usize> {
        self.untargeted
            .iter()
            .map(|(work_type, heap)| (*work_type, heap.len()))
            .collect()
    }

    /// Returns the current number of queued units
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the capacity of the queue
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Empty the queue, returning what was in it
    pub fn drain(&mut self) -> Vec<WorkUnit> {
        let mut units: Vec<WorkUnit> = self
            .untargeted
            .drain()
            .flat_map(|(_, heap)| heap.into_vec())
            .chain(self.targeted.drain().flat_map(|(_, heap)| heap.into_vec()))
            .map(|queued| queued.unit)
            .collect();
        units.sort_by(|a, b| b.priority.cmp(&a.priority));
        self.len = 0;
        units
    }
}

fn pop_and_prune<K: std::hash::Hash + Eq>(
    heaps: &mut HashMap<K, BinaryHeap<Queued>>,
    key: &K,
) -> Option<Queued> {
    let heap = heaps.get_mut(key)?;
    let queued = heap.pop();
    if heap.is_empty() {
        heaps.remove(key);
    }
    queued
}
