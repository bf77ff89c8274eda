use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::layout::Rank;
use crate::data::StoreCounters;

/// Counters one server reports when it exits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerStats {
    pub rank: Rank,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Puts accepted, including forwarded and notification units
    pub puts: u64,
    /// Gets answered with a work unit
    pub gets_served: u64,
    /// Gets that had to wait
    pub requests_parked: u64,
    /// Units sent to another server's queue
    pub units_forwarded: u64,
    pub stolen_in: u64,
    pub stolen_out: u64,
    pub notifications_sent: u64,
    /// Subscriptions discarded at shutdown
    pub subscriptions_invalidated: u64,
    /// Queued units discarded at shutdown
    pub units_discarded: u64,
    pub datums: StoreCounters,
    pub vote_rounds: u64,
    pub peak_memory_bytes: u64,
}

impl ServerStats {
    pub fn new(rank: Rank) -> Self {
        Self {
            rank,
            started_at: Utc::now(),
            finished_at: None,
            puts: 0,
            gets_served: 0,
            requests_parked: 0,
            units_forwarded: 0,
            stolen_in: 0,
            stolen_out: 0,
            notifications_sent: 0,
            subscriptions_invalidated: 0,
            units_discarded: 0,
            datums: StoreCounters::default(),
            vote_rounds: 0,
            peak_memory_bytes: 0,
        }
    }

    /// Time between start and finish, if finished
    pub fn elapsed(&self) -> Option<chrono::Duration> {
        self.finished_at.map(|end| end - self.started_at)
    }
}
