use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::trace;

use crate::core::layout::Rank;
use crate::workqueue::queue::WorkType;

/// Load summary piggybacked on every steal exchange
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadReport {
    /// Stealable queued units per type
    pub counts: BTreeMap<WorkType, usize>,
    /// Parked requests at the reporting server
    pub parked: usize,
}

impl LoadReport {
    pub fn has_any(&self, types: &[WorkType]) -> bool {
        types
            .iter()
            .any(|t| self.counts.get(t).copied().unwrap_or(0) > 0)
    }
}

/// Picks steal victims for one server.
///
/// Peers are probed in ascending rank order, round robin. A peer whose last
/// report shows matching work is preferred over a blind probe. At most one
/// steal is in flight.
#[derive(Debug)]
pub struct Balancer {
    peers: Vec<Rank>,
    cursor: usize,
    loads: HashMap<Rank, LoadReport>,
    in_flight: Option<Rank>,
}

impl Balancer {
    pub fn new(own: Rank, servers: impl IntoIterator<Item = Rank>) -> Self {
        let mut peers: Vec<Rank> = servers.into_iter().filter(|r| *r != own).collect();
        peers.sort_unstable();
        Self {
            peers,
            cursor: 0,
            loads: HashMap::new(),
            in_flight: None,
        }
    }

    /// Victim for a new steal, or `None` when one is already out
    pub fn choose_victim(&mut self, wanted: &[WorkType]) -> Option<Rank> {
        if self.in_flight.is_some() || self.peers.is_empty() {
            return None;
        }
        let n = self.peers.len();
        let offset = (0..n)
            .find(|i| {
                let peer = self.peers[(self.cursor + i) % n];
                self.loads.get(&peer).map_or(false, |l| l.has_any(wanted))
            })
            .unwrap_or(0);
        let index = (self.cursor + offset) % n;
        self.cursor = (index + 1) % n;

        let victim = self.peers[index];
        self.in_flight = Some(victim);
        trace!("Steal probe to {} for types {:?}", victim, wanted);
        Some(victim)
    }

    /// A steal response arrived from `peer`
    pub fn complete(&mut self, peer: Rank, load: LoadReport) {
        if self.in_flight == Some(peer) {
            self.in_flight = None;
        }
        self.record(peer, load);
    }

    pub fn record(&mut self, peer: Rank, load: LoadReport) {
        self.loads.insert(peer, load);
    }

    pub fn in_flight(&self) -> Option<Rank> {
        self.in_flight
    }
}
