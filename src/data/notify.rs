use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::core::errors::Result;
use crate::core::layout::Rank;
use crate::data::model::DatumId;

/// What happened to the watched datum or subscript
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    Closed,
    /// The subscript received a member
    Inserted { member: Vec<u8> },
    /// The container closed without the subscript ever being inserted
    Missing,
}

/// Message delivered to a subscriber as a notification work unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: DatumId,
    pub subscript: Option<String>,
    /// Token the subscriber passed when it subscribed
    pub token: u64,
    pub event: Event,
}

impl Notification {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// One registered interest
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Subscriber {
    pub(crate) rank: Rank,
    pub(crate) token: u64,
    /// Container-reference target: the member is also stored into this
    /// datum, and `rank` is still notified
    pub(crate) reference: Option<DatumId>,
}

/// Pending close and subscript subscriptions of one server's shard.
///
/// Entries are removed as soon as they fire, so every subscriber is
/// notified at most once.
#[derive(Debug, Default)]
pub(crate) struct SubscriptionTable {
    on_close: HashMap<DatumId, Vec<Subscriber>>,
    on_subscript: HashMap<DatumId, HashMap<String, Vec<Subscriber>>>,
}

impl SubscriptionTable {
    pub(crate) fn add_close(&mut self, id: DatumId, subscriber: Subscriber) {
        self.on_close.entry(id).or_default().push(subscriber);
    }

    pub(crate) fn add_subscript(&mut self, id: DatumId, subscript: &str, subscriber: Subscriber) {
        self.on_subscript
            .entry(id)
            .or_default()
            .entry(subscript.to_string())
            .or_default()
            .push(subscriber);
    }

    pub(crate) fn take_close(&mut self, id: DatumId) -> Vec<Subscriber> {
        self.on_close.remove(&id).unwrap_or_default()
    }

    pub(crate) fn take_subscript(&mut self, id: DatumId, subscript: &str) -> Vec<Subscriber> {
        let Some(by_subscript) = self.on_subscript.get_mut(&id) else {
            return Vec::new();
        };
        let taken = by_subscript.remove(subscript).unwrap_or_default();
        if by_subscript.is_empty() {
            self.on_subscript.remove(&id);
        }
        taken
    }

    /// Every subscript subscription still waiting on a container
    pub(crate) fn take_all_subscripts(&mut self, id: DatumId) -> Vec<(String, Subscriber)> {
        self.on_subscript
            .remove(&id)
            .into_iter()
            .flat_map(|by_subscript| {
                by_subscript
                    .into_iter()
                    .flat_map(|(sub, subs)| subs.into_iter().map(move |s| (sub.clone(), s)))
            })
            .collect()
    }

    pub(crate) fn has_pending(&self, id: DatumId) -> bool {
        self.on_close.contains_key(&id) || self.on_subscript.contains_key(&id)
    }

    pub(crate) fn pending_count(&self) -> usize {
        let close: usize = self.on_close.values().map(Vec::len).sum();
        let subscript: usize = self
            .on_subscript
            .values()
            .flat_map(|m| m.values())
            .map(Vec::len)
            .sum();
        close + subscript
    }

    /// Drop everything, returning how many subscriptions were discarded
    pub(crate) fn drain(&mut self) -> usize {
        let count = self.pending_count();
        self.on_close.clear();
        self.on_subscript.clear();
        count
    }
}
