use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, trace};

use crate::core::config::{Config, OpenReadPolicy};
use crate::core::errors::{Result, XlbError};
use crate::core::layout::Rank;
use crate::core::limits::{ResourceLimits, ResourceTracker};
use crate::data::ids::IdAllocator;
use crate::data::model::{
    Container, Content, CreateSpec, DataKind, DataValue, Datum, DatumId, Inserted, NULL_ID,
};
use crate::data::notify::{Event, Notification, Subscriber, SubscriptionTable};

/// Answer to a subscribe or container-reference call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscribeStatus {
    /// Condition already true; nothing was registered.
    /// Carries the member for subscript subscriptions.
    AlreadySatisfied { member: Option<Vec<u8>> },
    /// Registered; a notification follows exactly once
    Pending,
}

/// A member that must be stored into a reference datum
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceStore {
    pub target: DatumId,
    pub member: Vec<u8>,
}

/// Side effects produced while handling one request.
///
/// The store never talks to the network; the server drains these before it
/// answers the request that produced them.
#[derive(Debug, Default)]
pub struct Effects {
    pub notifications: Vec<(Rank, Notification)>,
    pub reference_stores: Vec<ReferenceStore>,
}

impl Effects {
    pub fn is_empty(&self) -> bool {
        self.notifications.is_empty() && self.reference_stores.is_empty()
    }
}

/// Lifetime counters of one shard
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreCounters {
    pub created: u64,
    pub closed: u64,
    pub collected: u64,
}

/// The shard of the data store owned by one server
#[derive(Debug)]
pub struct DataStore {
    datums: HashMap<DatumId, Datum>,
    subscriptions: SubscriptionTable,
    ids: IdAllocator,
    locks: HashMap<DatumId, Rank>,
    // collected ids, never handed out or written again
    retired: HashSet<DatumId>,
    resources: ResourceTracker,
    allow_overwrite: bool,
    open_read: OpenReadPolicy,
    counters: StoreCounters,
}

impl DataStore {
    pub fn new(index: usize, config: &Config) -> Self {
        Self {
            datums: HashMap::new(),
            subscriptions: SubscriptionTable::default(),
            ids: IdAllocator::new(index, config.nservers, config.id_limit),
            locks: HashMap::new(),
            retired: HashSet::new(),
            resources: ResourceTracker::new(ResourceLimits::from_config(config)),
            allow_overwrite: config.allow_overwrite,
            open_read: config.open_read,
            counters: StoreCounters::default(),
        }
    }

    fn get(&self, id: DatumId) -> Result<&Datum> {
        self.datums.get(&id).ok_or_else(|| XlbError::unknown_datum(id))
    }

    fn get_mut(&mut self, id: DatumId) -> Result<&mut Datum> {
        if self.retired.contains(&id) {
            return Err(XlbError::Closed { id });
        }
        self.datums
            .get_mut(&id)
            .ok_or_else(|| XlbError::unknown_datum(id))
    }

    /// Allocate a fresh id from this shard
    pub fn unique(&mut self) -> Result<DatumId> {
        self.ids.allocate()
    }

    pub fn create(&mut self, spec: &CreateSpec) -> Result<DatumId> {
        if spec.refcounts.write == 0 {
            return Err(XlbError::user_op(
                "create",
                "a datum needs at least one writer slot",
            ));
        }
        let content = Content::empty(spec)?;
        let id = if spec.id == NULL_ID {
            self.ids.allocate()?
        } else {
            if self.datums.contains_key(&spec.id) {
                return Err(XlbError::user_op(
                    "create",
                    format!("datum <{}> already exists", spec.id),
                ));
            }
            if self.retired.contains(&spec.id) {
                return Err(XlbError::user_op(
                    "create",
                    format!("datum <{}> was already used and collected", spec.id),
                ));
            }
            self.ids.reserve(spec.id);
            spec.id
        };

        let footprint = content.size_bytes();
        self.resources.allocate_memory(footprint)?;
        self.datums.insert(
            id,
            Datum {
                content,
                write_refs: spec.refcounts.write,
                read_refs: spec.refcounts.read,
                closed: false,
                footprint,
            },
        );
        self.counters.created += 1;
        debug!("Created <{}> as {}", id, spec.kind);
        Ok(id)
    }

    /// Whether the datum is live, or whether the subscript holds a member
    pub fn exists(&self, id: DatumId, subscript: Option<&str>) -> Result<bool> {
        let Some(datum) = self.datums.get(&id) else {
            return Ok(false);
        };
        match (subscript, &datum.content) {
            (None, _) => Ok(true),
            (Some(sub), Content::Container(c)) => Ok(c.lookup(sub).is_some()),
            (Some(_), content) => Err(XlbError::user_op(
                "exists",
                format!("<{}> is a {}, not a container", id, content.kind()),
            )),
        }
    }

    pub fn type_of(&self, id: DatumId) -> Result<DataKind> {
        Ok(self.get(id)?.content.kind())
    }

    pub fn container_type_of(&self, id: DatumId) -> Result<DataKind> {
        match &self.get(id)?.content {
            Content::Container(c) => Ok(c.subscript_kind()),
            content => Err(XlbError::user_op(
                "container_typeof",
                format!("<{}> is a {}, not a container", id, content.kind()),
            )),
        }
    }

    /// Set a scalar value and drop `drops` writer slots
    pub fn store(
        &mut self,
        id: DatumId,
        value: DataValue,
        drops: u32,
        effects: &mut Effects,
    ) -> Result<()> {
        let datum = self.get_mut(id)?;
        check_writable(id, datum, drops)?;
        let kind = datum.content.kind();
        if kind == DataKind::Container {
            return Err(XlbError::user_op(
                "store",
                format!("<{}> is a container; use insert", id),
            ));
        }
        if value.kind() != kind {
            return Err(XlbError::user_op(
                "store",
                format!("cannot store {} into {} datum <{}>", value.kind(), kind, id),
            ));
        }

        let old = datum.footprint;
        let new = value.size_bytes();
        self.resources.resize(old, new)?;
        let datum = self.get_mut(id)?;
        datum.content.set(value)?;
        datum.footprint = new;
        trace!("Stored <{}> ({} bytes)", id, new);

        self.drop_writers(id, drops, effects)
    }

    /// Store raw bytes, decoded per the datum's kind
    pub fn store_member(
        &mut self,
        id: DatumId,
        member: &[u8],
        drops: u32,
        effects: &mut Effects,
    ) -> Result<()> {
        let kind = self.type_of(id)?;
        if kind == DataKind::Container {
            return Err(XlbError::user_op(
                "store",
                format!("<{}> is a container; use insert", id),
            ));
        }
        let value = DataValue::from_bytes(kind, member)?;
        self.store(id, value, drops, effects)
    }

    pub fn retrieve(&self, id: DatumId, accept_open: bool) -> Result<DataValue> {
        let datum = self.get(id)?;
        match &datum.content {
            Content::Container(c) => {
                if datum.closed {
                    return Ok(DataValue::Container(c.entries(false)));
                }
                if !accept_open {
                    return Err(XlbError::user_op(
                        "retrieve",
                        format!("container <{}> is still open", id),
                    ));
                }
                let include_reserved = self.open_read == OpenReadPolicy::Live;
                Ok(DataValue::Container(c.entries(include_reserved)))
            }
            content => content.scalar().ok_or_else(|| {
                XlbError::user_op("retrieve", format!("<{}> has no value yet", id))
            }),
        }
    }

    /// Make sure a container exists before an insert, creating it implicitly.
    /// Returns whether it had to be created.
    fn ensure_container(&mut self, id: DatumId) -> Result<bool> {
        if self.datums.contains_key(&id) {
            return Ok(false);
        }
        if self.retired.contains(&id) {
            return Err(XlbError::Closed { id });
        }
        debug!("Implicitly creating container <{}>", id);
        self.create(&CreateSpec::container(id, DataKind::String))?;
        Ok(true)
    }

    /// Undo an implicit creation whose first write failed
    fn discard(&mut self, id: DatumId) {
        if let Some(datum) = self.datums.remove(&id) {
            self.resources.deallocate_memory(datum.footprint);
            self.counters.created -= 1;
            debug!("Discarded implicit container <{}>", id);
        }
    }

    pub fn insert(
        &mut self,
        id: DatumId,
        subscript: &str,
        member: Vec<u8>,
        drops: u32,
        effects: &mut Effects,
    ) -> Result<()> {
        let created = self.ensure_container(id)?;
        let result = self.insert_member(id, subscript, member, drops, effects);
        if created && result.is_err() {
            self.discard(id);
        }
        result
    }

    fn insert_member(
        &mut self,
        id: DatumId,
        subscript: &str,
        member: Vec<u8>,
        drops: u32,
        effects: &mut Effects,
    ) -> Result<()> {
        let allow_overwrite = self.allow_overwrite;
        let datum = self.get_mut(id)?;
        check_writable(id, datum, drops)?;
        let Content::Container(container) = &datum.content else {
            return Err(not_a_container("insert", id, datum.content.kind()));
        };
        container.validate_subscript(subscript)?;
        if !allow_overwrite && container.lookup(subscript).is_some() {
            return Err(XlbError::user_op(
                "insert",
                format!("<{}>[\"{}\"] already present", id, subscript),
            ));
        }

        let added_key = if container.contains(subscript) { 0 } else { subscript.len() };
        let old = datum.footprint;
        let new = old - container.member_len(subscript) as u64
            + (added_key + member.len()) as u64;
        self.resources.resize(old, new)?;

        let datum = self.get_mut(id)?;
        let Content::Container(container) = &mut datum.content else {
            return Err(XlbError::internal("container changed kind"));
        };
        let how = container.insert(subscript, member.clone(), allow_overwrite)?;
        datum.footprint = new;
        trace!("Inserted <{}>[\"{}\"] ({:?})", id, subscript, how);

        if how != Inserted::Replaced {
            for sub in self.subscriptions.take_subscript(id, subscript) {
                if let Some(target) = sub.reference {
                    effects.reference_stores.push(ReferenceStore {
                        target,
                        member: member.clone(),
                    });
                }
                notify(
                    effects,
                    &sub,
                    id,
                    Some(subscript),
                    Event::Inserted {
                        member: member.clone(),
                    },
                );
            }
        }

        self.drop_writers(id, drops, effects)
    }

    /// Reserve `subscript` if it was absent; false when it already existed
    pub fn insert_atomic(&mut self, id: DatumId, subscript: &str) -> Result<bool> {
        let created = self.ensure_container(id)?;
        let result = self.reserve_subscript(id, subscript);
        if created && result.is_err() {
            self.discard(id);
        }
        result
    }

    fn reserve_subscript(&mut self, id: DatumId, subscript: &str) -> Result<bool> {
        let datum = self.get_mut(id)?;
        check_writable(id, datum, 0)?;
        let Content::Container(container) = &datum.content else {
            return Err(not_a_container("insert_atomic", id, datum.content.kind()));
        };
        container.validate_subscript(subscript)?;
        if container.contains(subscript) {
            return Ok(false);
        }

        let old = datum.footprint;
        let new = old + subscript.len() as u64;
        self.resources.resize(old, new)?;
        let datum = self.get_mut(id)?;
        if let Content::Container(container) = &mut datum.content {
            container.reserve(subscript);
        }
        datum.footprint = new;
        Ok(true)
    }

    /// Member at a subscript; `None` when absent or only reserved
    pub fn lookup(&self, id: DatumId, subscript: &str) -> Result<Option<Vec<u8>>> {
        let container = self.container(id, "lookup")?;
        Ok(container.lookup(subscript).map(<[u8]>::to_vec))
    }

    pub fn enumerate(
        &self,
        id: DatumId,
        offset: usize,
        count: Option<usize>,
    ) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self.container(id, "enumerate")?.enumerate(offset, count))
    }

    pub fn container_size(&self, id: DatumId) -> Result<usize> {
        Ok(self.container(id, "container_size")?.size())
    }

    fn container(&self, id: DatumId, operation: &str) -> Result<&Container> {
        match &self.get(id)?.content {
            Content::Container(c) => Ok(c),
            content => Err(not_a_container(operation, id, content.kind())),
        }
    }

    pub fn slot_create(&mut self, id: DatumId, count: u32) -> Result<()> {
        let datum = self.get_mut(id)?;
        if datum.closed {
            return Err(XlbError::Closed { id });
        }
        datum.write_refs += count;
        Ok(())
    }

    pub fn slot_drop(&mut self, id: DatumId, count: u32, effects: &mut Effects) -> Result<()> {
        let datum = self.get_mut(id)?;
        check_writable(id, datum, count)?;
        self.drop_writers(id, count, effects)
    }

    pub fn read_incr(&mut self, id: DatumId, count: u32) -> Result<()> {
        self.get_mut(id)?.read_refs += count;
        Ok(())
    }

    pub fn read_decr(&mut self, id: DatumId, count: u32) -> Result<()> {
        let datum = self.get_mut(id)?;
        if count > datum.read_refs {
            return Err(XlbError::RefcountUnderflow {
                id,
                counter: "read",
                current: datum.read_refs,
                requested: count,
            });
        }
        datum.read_refs -= count;
        self.maybe_collect(id);
        Ok(())
    }

    /// Force-close an open datum, returning the ranks that were waiting on it
    pub fn close(&mut self, id: DatumId, effects: &mut Effects) -> Result<Vec<Rank>> {
        let datum = self.get_mut(id)?;
        if datum.closed {
            return Err(XlbError::Closed { id });
        }
        datum.write_refs = 0;
        Ok(self.close_datum(id, effects))
    }

    pub fn subscribe(
        &mut self,
        id: DatumId,
        subscript: Option<&str>,
        rank: Rank,
        token: u64,
    ) -> Result<SubscribeStatus> {
        let subscriber = Subscriber {
            rank,
            token,
            reference: None,
        };
        let Some(subscript) = subscript else {
            if self.get(id)?.closed {
                return Ok(SubscribeStatus::AlreadySatisfied { member: None });
            }
            self.subscriptions.add_close(id, subscriber);
            return Ok(SubscribeStatus::Pending);
        };
        self.subscribe_subscript(id, subscript, subscriber, "subscribe")
    }

    /// Subscribe to a subscript and, when it appears, copy the member into
    /// `reference`
    pub fn container_reference(
        &mut self,
        id: DatumId,
        subscript: &str,
        reference: Option<DatumId>,
        rank: Rank,
        token: u64,
        effects: &mut Effects,
    ) -> Result<SubscribeStatus> {
        let subscriber = Subscriber {
            rank,
            token,
            reference,
        };
        let status = self.subscribe_subscript(id, subscript, subscriber, "container_reference")?;
        if let (SubscribeStatus::AlreadySatisfied { member: Some(member) }, Some(target)) =
            (&status, reference)
        {
            effects.reference_stores.push(ReferenceStore {
                target,
                member: member.clone(),
            });
        }
        Ok(status)
    }

    fn subscribe_subscript(
        &mut self,
        id: DatumId,
        subscript: &str,
        subscriber: Subscriber,
        operation: &str,
    ) -> Result<SubscribeStatus> {
        let datum = self.get(id)?;
        let closed = datum.closed;
        let Content::Container(container) = &datum.content else {
            return Err(not_a_container(operation, id, datum.content.kind()));
        };
        container.validate_subscript(subscript)?;
        if let Some(member) = container.lookup(subscript) {
            return Ok(SubscribeStatus::AlreadySatisfied {
                member: Some(member.to_vec()),
            });
        }
        if closed {
            return Err(XlbError::not_found(format!(
                "<{}>[\"{}\"] in closed container",
                id, subscript
            )));
        }
        self.subscriptions.add_subscript(id, subscript, subscriber);
        Ok(SubscribeStatus::Pending)
    }

    /// Try to take the advisory lock; false when someone holds it
    pub fn lock(&mut self, id: DatumId, rank: Rank) -> Result<bool> {
        self.get(id)?;
        if self.locks.contains_key(&id) {
            return Ok(false);
        }
        self.locks.insert(id, rank);
        Ok(true)
    }

    pub fn unlock(&mut self, id: DatumId, rank: Rank) -> Result<()> {
        self.get(id)?;
        match self.locks.get(&id) {
            Some(holder) if *holder == rank => {
                self.locks.remove(&id);
                Ok(())
            }
            Some(holder) => Err(XlbError::user_op(
                "unlock",
                format!("<{}> is locked by rank {}, not {}", id, holder, rank),
            )),
            None => Err(XlbError::user_op("unlock", format!("<{}> is not locked", id))),
        }
    }

    fn drop_writers(&mut self, id: DatumId, count: u32, effects: &mut Effects) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let datum = self.get_mut(id)?;
        datum.write_refs -= count;
        if datum.write_refs == 0 {
            self.close_datum(id, effects);
        }
        Ok(())
    }

    /// Mark closed and fire every subscription on the id before returning
    fn close_datum(&mut self, id: DatumId, effects: &mut Effects) -> Vec<Rank> {
        let mut waiting = BTreeSet::new();
        let is_container = match self.datums.get_mut(&id) {
            Some(datum) => {
                datum.closed = true;
                matches!(datum.content, Content::Container(_))
            }
            None => return Vec::new(),
        };
        self.counters.closed += 1;

        for sub in self.subscriptions.take_close(id) {
            waiting.insert(sub.rank);
            notify(effects, &sub, id, None, Event::Closed);
        }
        if is_container {
            for (subscript, sub) in self.subscriptions.take_all_subscripts(id) {
                waiting.insert(sub.rank);
                notify(effects, &sub, id, Some(&subscript), Event::Missing);
            }
        }
        debug!("Closed <{}>, {} waiting ranks notified", id, waiting.len());

        self.maybe_collect(id);
        waiting.into_iter().collect()
    }

    fn maybe_collect(&mut self, id: DatumId) {
        let collectable = self
            .datums
            .get(&id)
            .map_or(false, |d| d.closed && d.read_refs == 0)
            && !self.subscriptions.has_pending(id);
        if !collectable {
            return;
        }
        if let Some(datum) = self.datums.remove(&id) {
            self.resources.deallocate_memory(datum.footprint);
            self.locks.remove(&id);
            self.retired.insert(id);
            self.counters.collected += 1;
            trace!("Collected <{}>", id);
        }
    }

    /// Datums that still have writer slots outstanding
    pub fn open_count(&self) -> usize {
        self.datums.values().filter(|d| !d.closed).count()
    }

    pub fn datum_count(&self) -> usize {
        self.datums.len()
    }

    pub fn pending_subscriptions(&self) -> usize {
        self.subscriptions.pending_count()
    }

    /// Discard every pending subscription; returns how many were dropped
    pub fn invalidate_subscriptions(&mut self) -> usize {
        self.subscriptions.drain()
    }

    pub fn counters(&self) -> StoreCounters {
        self.counters
    }

    pub fn memory_usage(&self) -> u64 {
        self.resources.memory_usage()
    }

    pub fn peak_memory_usage(&self) -> u64 {
        self.resources.peak_memory_usage()
    }
}

fn check_writable(id: DatumId, datum: &Datum, drops: u32) -> Result<()> {
    if datum.closed {
        return Err(XlbError::Closed { id });
    }
    if drops > datum.write_refs {
        return Err(XlbError::RefcountUnderflow {
            id,
            counter: "write",
            current: datum.write_refs,
            requested: drops,
        });
    }
    Ok(())
}

fn not_a_container(operation: &str, id: DatumId, kind: DataKind) -> XlbError {
    XlbError::user_op(operation, format!("<{}> is a {}, not a container", id, kind))
}

fn notify(effects: &mut Effects, sub: &Subscriber, id: DatumId, subscript: Option<&str>, event: Event) {
    effects.notifications.push((
        sub.rank,
        Notification {
            id,
            subscript: subscript.map(str::to_string),
            token: sub.token,
            event,
        },
    ));
}
