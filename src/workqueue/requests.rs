use std::collections::{HashMap, VecDeque};

use crate::core::layout::Rank;
use crate::workqueue::queue::{WorkType, WorkUnit};

/// A Get that found nothing and waits for a matching Put
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParkedRequest {
    pub rank: Rank,
    /// Request tag the eventual response must carry
    pub tag: u64,
    pub work_type: WorkType,
}

/// Type-indexed table of parked requests, FIFO within each type
#[derive(Debug, Default)]
pub struct RequestQueue {
    by_type: HashMap<WorkType, VecDeque<ParkedRequest>>,
    len: usize,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn park(&mut self, request: ParkedRequest) {
        self.by_type
            .entry(request.work_type)
            .or_default()
            .push_back(request);
        self.len += 1;
    }

    /// Remove and return the request a new unit should be handed to.
    ///
    /// A targeted unit only matches its target's request; an untargeted one
    /// goes to the longest-waiting requester of its type.
    pub fn take_match(&mut self, unit: &WorkUnit) -> Option<ParkedRequest> {
        let waiting = self.by_type.get_mut(&unit.work_type)?;
        let position = match unit.target {
            Some(target) => waiting.iter().position(|r| r.rank == target)?,
            None => 0,
        };
        let request = waiting.remove(position)?;
        if waiting.is_empty() {
            self.by_type.remove(&unit.work_type);
        }
        self.len -= 1;
        Some(request)
    }

    pub fn is_parked(&self, rank: Rank) -> bool {
        self.by_type
            .values()
            .any(|waiting| waiting.iter().any(|r| r.rank == rank))
    }

    /// Types somebody is waiting for, ascending
    pub fn waiting_types(&self) -> Vec<WorkType> {
        let mut types: Vec<WorkType> = self.by_type.keys().copied().collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Cancel every parked request
    pub fn drain(&mut self) -> Vec<ParkedRequest> {
        self.len = 0;
        let mut all: Vec<ParkedRequest> = self
            .by_type
            .drain()
            .flat_map(|(_, waiting)| waiting.into_iter())
            .collect();
        all.sort_by_key(|r| r.rank);
        all
    }
}
