use serde::{Deserialize, Serialize};
use std::ops::Range;

use crate::data::DatumId;

/// Process rank inside a run
pub type Rank = usize;

/// Split of ranks between workers and servers.
///
/// Workers occupy ranks `0..nworkers`; servers occupy the last `nservers`
/// ranks. The first server rank is the master that drives termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    pub nworkers: usize,
    pub nservers: usize,
}

impl Layout {
    pub fn new(nworkers: usize, nservers: usize) -> Self {
        Self { nworkers, nservers }
    }

    pub fn size(&self) -> usize {
        self.nworkers + self.nservers
    }

    pub fn contains(&self, rank: Rank) -> bool {
        rank < self.size()
    }

    pub fn is_worker(&self, rank: Rank) -> bool {
        rank < self.nworkers
    }

    pub fn is_server(&self, rank: Rank) -> bool {
        rank >= self.nworkers && rank < self.size()
    }

    pub fn workers(&self) -> Range<Rank> {
        0..self.nworkers
    }

    pub fn servers(&self) -> Range<Rank> {
        self.nworkers..self.size()
    }

    pub fn master(&self) -> Rank {
        self.nworkers
    }

    /// Rank of the server with the given index
    pub fn server_rank(&self, index: usize) -> Rank {
        self.nworkers + index
    }

    /// Index (0-based) of a server rank
    pub fn server_index(&self, rank: Rank) -> usize {
        rank - self.nworkers
    }

    /// Server that parks this worker's requests and tracks its idleness
    pub fn home_server(&self, worker: Rank) -> Rank {
        self.server_rank(worker % self.nservers)
    }

    /// Workers attached to a server
    pub fn workers_of(&self, server: Rank) -> impl Iterator<Item = Rank> + '_ {
        let index = self.server_index(server);
        self.workers().filter(move |w| w % self.nservers == index)
    }

    /// Server owning the shard a datum id hashes to
    pub fn owner(&self, id: DatumId) -> Rank {
        let index = id.rem_euclid(self.nservers as DatumId) as usize;
        self.server_rank(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_roles() {
        let layout = Layout::new(4, 2);
        assert_eq!(layout.size(), 6);
        assert!(layout.is_worker(3));
        assert!(layout.is_server(4));
        assert!(!layout.is_server(6));
        assert_eq!(layout.master(), 4);
        assert_eq!(layout.servers(), 4..6);
    }

    #[test]
    fn test_home_and_owner() {
        let layout = Layout::new(5, 2);
        assert_eq!(layout.home_server(0), 5);
        assert_eq!(layout.home_server(1), 6);
        assert_eq!(layout.home_server(4), 5);
        assert_eq!(layout.workers_of(6).collect::<Vec<_>>(), vec![1, 3]);

        assert_eq!(layout.owner(2), 5);
        assert_eq!(layout.owner(3), 6);
        assert_eq!(layout.owner(-1), 6);
    }
}
