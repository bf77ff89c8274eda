use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::core::config::Config;
use crate::core::errors::{Result, WireError, XlbError};
use crate::core::layout::{Layout, Rank};
use crate::data::{DataStore, DatumId, Effects, Notification};
use crate::server::stats::ServerStats;
use crate::server::termination::{TerminationDetector, Verdict};
use crate::transport::{Envelope, IdleReport, Message, Reply, Request};
use crate::workqueue::{
    Balancer, LoadReport, ParkedRequest, RequestQueue, WorkQueue, WorkType, WorkUnit,
    NOTIFICATION_PRIORITY,
};

/// What the event loop should do after a message was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Shutdown finished and every attached worker finalized
    Exit,
    /// Another rank aborted the run
    Abort(i32),
}

/// Activity of a worker as its home server sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Busy,
    /// Waiting in a Get
    Parked,
    Finalized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    ShuttingDown,
}

/// All state owned by one server.
///
/// Handlers are synchronous and run one message to completion. Anything to
/// be sent is appended to the outbox, which the event loop flushes after
/// every step, so notifications leave before the response that caused them.
#[derive(Debug)]
pub struct ServerContext {
    rank: Rank,
    layout: Layout,
    config: Arc<Config>,
    store: DataStore,
    queue: WorkQueue,
    requests: RequestQueue,
    balancer: Balancer,
    termination: TerminationDetector,
    workers: BTreeMap<Rank, WorkerState>,
    phase: Phase,
    next_tag: u64,
    activity: u64,
    sent: u64,
    received: u64,
    outbox: Vec<(Rank, Message)>,
    stats: ServerStats,
}

impl ServerContext {
    pub fn new(rank: Rank, config: Arc<Config>) -> Result<Self> {
        let layout = Layout::new(config.nworkers, config.nservers);
        if !layout.is_server(rank) {
            return Err(XlbError::configuration(format!(
                "rank {} is not a server rank",
                rank
            )));
        }
        let index = layout.server_index(rank);
        let workers = layout
            .workers_of(rank)
            .map(|w| (w, WorkerState::Busy))
            .collect();
        Ok(Self {
            rank,
            layout,
            store: DataStore::new(index, &config),
            queue: WorkQueue::new(config.max_queued_units),
            requests: RequestQueue::new(),
            balancer: Balancer::new(rank, layout.servers()),
            termination: TerminationDetector::new(layout.nservers),
            workers,
            phase: Phase::Running,
            next_tag: 0,
            activity: 0,
            sent: 0,
            received: 0,
            outbox: Vec::new(),
            stats: ServerStats::new(rank),
            config,
        })
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    fn is_master(&self) -> bool {
        self.rank == self.layout.master()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.phase == Phase::ShuttingDown
    }

    pub fn worker_state(&self, worker: Rank) -> Option<WorkerState> {
        self.workers.get(&worker).copied()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn parked(&self) -> usize {
        self.requests.len()
    }

    /// Messages produced since the last call
    pub fn take_outbox(&mut self) -> Vec<(Rank, Message)> {
        std::mem::take(&mut self.outbox)
    }

    /// Handle one inbound message
    pub fn handle(&mut self, envelope: Envelope) -> Flow {
        let Envelope { source, message } = envelope;
        if moves_work(&message) {
            self.activity += 1;
            if self.layout.is_server(source) {
                self.received += 1;
            }
        }

        match message {
            Message::Request { tag, body } => self.on_request(source, tag, body),
            Message::Response { tag, body } => {
                if let Err(e) = body {
                    warn!("Request {} to server {} failed: {}", tag, source, e.message);
                }
            }
            Message::ForwardPut(unit) => {
                if let Err(e) = self.submit(unit) {
                    warn!("Dropping unit forwarded by {}: {}", source, e);
                }
            }
            Message::StealRequest { wanted, load } => self.on_steal_request(source, wanted, load),
            Message::StealResponse { units, load } => self.on_steal_response(source, units, load),
            Message::IdleQuery { round } => {
                let report = self.idle_report();
                self.send(source, Message::IdleReply { round, report });
            }
            Message::IdleReply { round, report } => {
                if self.is_master() && !self.is_shutting_down() {
                    if let Some(verdict) = self.termination.record(source, round, report) {
                        self.act_on(verdict);
                    }
                }
            }
            Message::Shutdown => self.begin_shutdown(),
            Message::ShutdownRequested => {
                if self.is_master() {
                    info!("Shutdown requested through server {}", source);
                    self.initiate_shutdown();
                }
            }
            Message::Abort { code } => {
                error!("Rank {} aborted the run with code {}", source, code);
                return Flow::Abort(code);
            }
        }
        self.exit_check()
    }

    fn exit_check(&self) -> Flow {
        let done = self.is_shutting_down()
            && self.workers.values().all(|s| *s == WorkerState::Finalized);
        if done {
            Flow::Exit
        } else {
            Flow::Continue
        }
    }

    fn send(&mut self, to: Rank, message: Message) {
        if self.layout.is_server(to) && moves_work(&message) {
            self.sent += 1;
        }
        self.outbox.push((to, message));
    }

    fn respond(&mut self, to: Rank, tag: u64, result: Result<Reply>) {
        let body = result.map_err(|e| {
            debug!("Request {} from {} rejected: {}", tag, to, e);
            WireError::from(&e)
        });
        self.send(to, Message::Response { tag, body });
    }

    fn on_request(&mut self, source: Rank, tag: u64, body: Request) {
        debug!("{} from {} (tag {})", body.name(), source, tag);
        if self.is_shutting_down() {
            let result = match body {
                Request::Finalize => self.finalize(source),
                _ => Err(XlbError::Shutdown),
            };
            self.respond(source, tag, result);
            return;
        }

        if let Some(id) = body.datum() {
            let owner = self.layout.owner(id);
            if owner != self.rank {
                let err = XlbError::user_op(
                    body.name(),
                    format!("datum <{}> is owned by server {}, not {}", id, owner, self.rank),
                );
                self.respond(source, tag, Err(err));
                return;
            }
        }

        match body {
            Request::Get { work_type } => {
                if let Err(e) = self.on_get(source, tag, work_type) {
                    self.respond(source, tag, Err(e));
                }
            }
            Request::Put(unit) => {
                let result = self.on_put(unit).map(|_| Reply::Ack);
                self.respond(source, tag, result);
            }
            Request::Finalize => {
                let result = self.finalize(source);
                self.respond(source, tag, result);
            }
            Request::ServerIdle => {
                let idle = self.local_idle();
                self.respond(source, tag, Ok(Reply::Bool(idle)));
            }
            Request::ServerShutdown => {
                if self.is_master() {
                    info!("Shutdown requested by rank {}", source);
                    self.initiate_shutdown();
                } else {
                    let master = self.layout.master();
                    self.send(master, Message::ShutdownRequested);
                }
                self.respond(source, tag, Ok(Reply::Ack));
            }
            other => {
                let mut effects = Effects::default();
                let result = self.on_data(source, other, &mut effects);
                self.apply_effects(effects);
                self.respond(source, tag, result);
            }
        }

        if self.workers.get(&source) == Some(&WorkerState::Finalized) {
            return;
        }
        if let Some(state) = self.workers.get_mut(&source) {
            if !self.requests.is_parked(source) {
                *state = WorkerState::Busy;
            }
        }
    }

    fn finalize(&mut self, source: Rank) -> Result<Reply> {
        match self.workers.get_mut(&source) {
            Some(state) => {
                *state = WorkerState::Finalized;
                debug!("Worker {} finalized", source);
                Ok(Reply::Ack)
            }
            None => Err(XlbError::user_op(
                "finalize",
                format!("rank {} is not attached to server {}", source, self.rank),
            )),
        }
    }

    fn check_type(&self, work_type: WorkType) -> Result<()> {
        if self.config.accepts_type(work_type) {
            Ok(())
        } else {
            Err(XlbError::user(format!("unknown work type {}", work_type)))
        }
    }

    fn on_get(&mut self, source: Rank, tag: u64, work_type: WorkType) -> Result<()> {
        self.check_type(work_type)?;
        if !self.workers.contains_key(&source) {
            return Err(XlbError::user_op(
                "get",
                format!(
                    "rank {} must request work from its home server {}",
                    source,
                    self.layout.home_server(source)
                ),
            ));
        }

        if let Some(unit) = self.queue.pop_for(source, work_type) {
            self.stats.gets_served += 1;
            self.respond(source, tag, Ok(Reply::Work(unit)));
            return Ok(());
        }

        self.requests.park(ParkedRequest {
            rank: source,
            tag,
            work_type,
        });
        self.workers.insert(source, WorkerState::Parked);
        self.stats.requests_parked += 1;
        self.try_steal();
        Ok(())
    }

    fn on_put(&mut self, unit: WorkUnit) -> Result<()> {
        self.check_type(unit.work_type)?;
        if let Some(target) = unit.target {
            if !self.layout.contains(target) {
                return Err(XlbError::user_op(
                    "put",
                    format!("target rank {} is outside the run", target),
                ));
            }
        }
        self.stats.puts += 1;
        self.submit(unit)
    }

    /// Route a unit: forward it to the server that must hold it, hand it to
    /// a parked request, or queue it.
    fn submit(&mut self, mut unit: WorkUnit) -> Result<()> {
        if let Some(target) = unit.target {
            let holder = if self.layout.is_server(target) {
                target
            } else {
                self.layout.home_server(target)
            };
            if holder != self.rank {
                self.stats.units_forwarded += 1;
                self.send(holder, Message::ForwardPut(unit));
                return Ok(());
            }
            if self.layout.is_server(target) {
                unit.target = None;
            }
        }

        if let Some(parked) = self.requests.take_match(&unit) {
            self.workers.insert(parked.rank, WorkerState::Busy);
            self.stats.gets_served += 1;
            self.respond(parked.rank, parked.tag, Ok(Reply::Work(unit)));
            return Ok(());
        }
        self.queue.push(unit)
    }

    fn on_data(&mut self, source: Rank, body: Request, effects: &mut Effects) -> Result<Reply> {
        let store = &mut self.store;
        let reply = match body {
            Request::Create(spec) => Reply::Id(store.create(&spec)?),
            Request::Exists { id, subscript } => Reply::Bool(store.exists(id, subscript.as_deref())?),
            Request::Store { id, value, drops } => {
                store.store(id, value, drops, effects)?;
                Reply::Ack
            }
            Request::StoreMember { id, member, drops } => {
                store.store_member(id, &member, drops, effects)?;
                Reply::Ack
            }
            Request::Retrieve { id, accept_open } => Reply::Value(store.retrieve(id, accept_open)?),
            Request::Enumerate { id, offset, count } => {
                Reply::Records(store.enumerate(id, offset, count)?)
            }
            Request::SlotCreate { id, count } => {
                store.slot_create(id, count)?;
                Reply::Ack
            }
            Request::SlotDrop { id, count } => {
                store.slot_drop(id, count, effects)?;
                Reply::Ack
            }
            Request::ReadIncr { id, count } => {
                store.read_incr(id, count)?;
                Reply::Ack
            }
            Request::ReadDecr { id, count } => {
                store.read_decr(id, count)?;
                Reply::Ack
            }
            Request::Insert {
                id,
                subscript,
                member,
                drops,
            } => {
                store.insert(id, &subscript, member, drops, effects)?;
                Reply::Ack
            }
            Request::InsertAtomic { id, subscript } => {
                Reply::Bool(store.insert_atomic(id, &subscript)?)
            }
            Request::Lookup { id, subscript } => Reply::Member(store.lookup(id, &subscript)?),
            Request::Subscribe {
                id,
                subscript,
                token,
            } => Reply::Subscribed(store.subscribe(id, subscript.as_deref(), source, token)?),
            Request::ContainerReference {
                id,
                subscript,
                reference,
                token,
            } => Reply::Subscribed(store.container_reference(
                id, &subscript, reference, source, token, effects,
            )?),
            Request::Close { id } => Reply::Ranks(store.close(id, effects)?),
            Request::Unique => Reply::Id(store.unique()?),
            Request::Typeof { id } => Reply::Kind(store.type_of(id)?),
            Request::ContainerTypeof { id } => Reply::Kind(store.container_type_of(id)?),
            Request::ContainerSize { id } => Reply::Size(store.container_size(id)?),
            Request::Lock { id } => Reply::Bool(store.lock(id, source)?),
            Request::Unlock { id } => {
                store.unlock(id, source)?;
                Reply::Ack
            }
            Request::Put(_)
            | Request::Get { .. }
            | Request::Finalize
            | Request::ServerIdle
            | Request::ServerShutdown => {
                return Err(XlbError::internal("work request reached the data handler"))
            }
        };
        Ok(reply)
    }

    /// Deliver notifications and reference stores until none are left
    fn apply_effects(&mut self, mut effects: Effects) {
        while !effects.is_empty() {
            for (rank, notification) in std::mem::take(&mut effects.notifications) {
                self.notify(rank, notification);
            }
            for reference in std::mem::take(&mut effects.reference_stores) {
                let owner = self.layout.owner(reference.target);
                if owner == self.rank {
                    if let Err(e) =
                        self.store
                            .store_member(reference.target, &reference.member, 1, &mut effects)
                    {
                        warn!("Reference store into <{}> failed: {}", reference.target, e);
                    }
                } else {
                    self.forward_reference(owner, reference.target, reference.member);
                }
            }
        }
    }

    fn forward_reference(&mut self, owner: Rank, target: DatumId, member: Vec<u8>) {
        let tag = self.next_tag;
        self.next_tag += 1;
        let body = Request::StoreMember {
            id: target,
            member,
            drops: 1,
        };
        self.send(owner, Message::Request { tag, body });
    }

    /// Queue a notification as a unit targeted at the subscriber
    fn notify(&mut self, rank: Rank, notification: Notification) {
        let payload = match notification.encode() {
            Ok(payload) => payload,
            Err(e) => {
                error!("Cannot encode notification for <{}>: {}", notification.id, e);
                return;
            }
        };
        let unit = WorkUnit {
            payload,
            target: Some(rank),
            answer: self.rank,
            work_type: self.config.notification_type,
            priority: NOTIFICATION_PRIORITY,
        };
        self.stats.notifications_sent += 1;
        if let Err(e) = self.submit(unit) {
            warn!("Notification for rank {} lost: {}", rank, e);
        }
    }

    fn load_report(&self) -> LoadReport {
        LoadReport {
            counts: self.queue.counts_by_type(),
            parked: self.requests.len(),
        }
    }

    /// Ask a peer for work when requests wait here with nothing to match
    fn try_steal(&mut self) {
        if self.is_shutting_down() || self.layout.nservers < 2 {
            return;
        }
        let wanted = self.requests.waiting_types();
        if wanted.is_empty() {
            return;
        }
        if let Some(victim) = self.balancer.choose_victim(&wanted) {
            let load = self.load_report();
            self.send(victim, Message::StealRequest { wanted, load });
        }
    }

    fn on_steal_request(&mut self, source: Rank, wanted: Vec<WorkType>, load: LoadReport) {
        self.balancer.record(source, load);
        let units = if self.is_shutting_down() {
            Vec::new()
        } else {
            self.queue.steal(&wanted)
        };
        if !units.is_empty() {
            debug!("Giving {} units to server {}", units.len(), source);
            self.stats.stolen_out += units.len() as u64;
        }
        let load = self.load_report();
        self.send(source, Message::StealResponse { units, load });
    }

    fn on_steal_response(&mut self, source: Rank, units: Vec<WorkUnit>, load: LoadReport) {
        self.balancer.complete(source, load);
        if units.is_empty() {
            return;
        }
        debug!("Received {} units from server {}", units.len(), source);
        self.stats.stolen_in += units.len() as u64;
        for unit in units {
            if let Err(e) = self.submit(unit) {
                warn!("Dropping stolen unit: {}", e);
            }
        }
    }

    /// Nothing queued, no attached worker running, and no open data when
    /// that is required
    pub fn local_idle(&self) -> bool {
        !self.is_shutting_down()
            && self.queue.is_empty()
            && self.workers.values().all(|s| *s != WorkerState::Busy)
            && (!self.config.quiescence_requires_closed_data || self.store.open_count() == 0)
    }

    fn idle_report(&self) -> IdleReport {
        IdleReport {
            idle: self.local_idle(),
            activity: self.activity,
            sent: self.sent,
            received: self.received,
        }
    }

    /// Periodic starvation probe
    pub fn on_steal_tick(&mut self) -> Flow {
        self.try_steal();
        self.exit_check()
    }

    /// Periodic termination check; only the master starts rounds
    pub fn on_idle_tick(&mut self) -> Flow {
        if self.is_master()
            && !self.is_shutting_down()
            && !self.termination.is_voting()
            && self.local_idle()
        {
            self.start_vote();
        }
        self.exit_check()
    }

    fn start_vote(&mut self) {
        let report = self.idle_report();
        let round = self.termination.begin_round(self.rank, report);
        self.stats.vote_rounds += 1;
        if self.layout.nservers == 1 {
            if let Some(verdict) = self.termination.try_conclude() {
                self.act_on(verdict);
            }
            return;
        }
        let me = self.rank;
        for peer in self.layout.servers().filter(|r| *r != me) {
            self.send(peer, Message::IdleQuery { round });
        }
    }

    fn act_on(&mut self, verdict: Verdict) {
        if verdict == Verdict::Terminate {
            info!(
                "Global quiescence after {} vote rounds",
                self.termination.rounds()
            );
            self.initiate_shutdown();
        }
    }

    /// Master only: tell every server to shut down, then do it locally
    fn initiate_shutdown(&mut self) {
        if self.is_shutting_down() {
            return;
        }
        let me = self.rank;
        for peer in self.layout.servers().filter(|r| *r != me) {
            self.send(peer, Message::Shutdown);
        }
        self.begin_shutdown();
    }

    fn begin_shutdown(&mut self) {
        if self.is_shutting_down() {
            return;
        }
        self.phase = Phase::ShuttingDown;
        info!("Shutting down");

        for parked in self.requests.drain() {
            self.respond(parked.rank, parked.tag, Err(XlbError::Shutdown));
        }
        let invalidated = self.store.invalidate_subscriptions();
        if invalidated > 0 {
            warn!("Invalidated {} pending subscriptions", invalidated);
        }
        self.stats.subscriptions_invalidated += invalidated as u64;

        let discarded = self.queue.drain();
        if !discarded.is_empty() {
            warn!("Discarding {} queued units", discarded.len());
        }
        self.stats.units_discarded += discarded.len() as u64;
    }

    /// Final counters for this server
    pub fn finish(&mut self) -> ServerStats {
        self.stats.finished_at = Some(Utc::now());
        self.stats.datums = self.store.counters();
        self.stats.peak_memory_bytes = self.store.peak_memory_usage();
        self.stats.clone()
    }
}

/// Messages that move work or data and therefore take part in the
/// sent/received balance of the termination vote
fn moves_work(message: &Message) -> bool {
    match message {
        Message::Request { .. } | Message::Response { .. } | Message::ForwardPut(_) => true,
        Message::StealResponse { units, .. } => !units.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::Code;
    use crate::data::{CreateSpec, DataKind, DataValue, Event, SubscribeStatus};

    fn context(nworkers: usize, nservers: usize, rank: Rank) -> ServerContext {
        let config = Config::builder()
            .workers(nworkers)
            .servers(nservers)
            .work_types([0, 1, 5])
            .build()
            .unwrap();
        ServerContext::new(rank, Arc::new(config)).unwrap()
    }

    fn request(ctx: &mut ServerContext, source: Rank, tag: u64, body: Request) -> Flow {
        ctx.handle(Envelope {
            source,
            message: Message::Request { tag, body },
        })
    }

    fn response(outbox: &[(Rank, Message)], rank: Rank) -> std::result::Result<Reply, WireError> {
        outbox
            .iter()
            .find_map(|(to, m)| match m {
                Message::Response { body, .. } if *to == rank => Some(body.clone()),
                _ => None,
            })
            .expect("no response for rank")
    }

    fn work(reply: std::result::Result<Reply, WireError>) -> WorkUnit {
        match reply {
            Ok(Reply::Work(unit)) => unit,
            other => panic!("expected work, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_worker_rank() {
        let config = Arc::new(Config::default());
        assert!(ServerContext::new(0, config).is_err());
    }

    #[test]
    fn test_parked_get_receives_later_put() {
        let mut ctx = context(2, 1, 2);
        request(&mut ctx, 0, 1, Request::Get { work_type: 1 });
        assert!(ctx.take_outbox().is_empty());
        assert_eq!(ctx.worker_state(0), Some(WorkerState::Parked));

        request(&mut ctx, 1, 7, Request::Put(WorkUnit::new(1, b"job".to_vec())));
        let outbox = ctx.take_outbox();
        assert_eq!(work(response(&outbox, 0)).payload, b"job");
        assert_eq!(response(&outbox, 1), Ok(Reply::Ack));
        assert_eq!(ctx.worker_state(0), Some(WorkerState::Busy));
        assert_eq!(ctx.queued(), 0);
    }

    #[test]
    fn test_unknown_work_type() {
        let mut ctx = context(2, 1, 2);
        request(&mut ctx, 0, 1, Request::Get { work_type: 42 });
        let err = response(&ctx.take_outbox(), 0).unwrap_err();
        assert_eq!(err.code, Code::UserError);
    }

    #[test]
    fn test_priority_order_through_server() {
        let mut ctx = context(2, 1, 2);
        for (i, priority) in [1, 9, 1].into_iter().enumerate() {
            let unit = WorkUnit::new(5, vec![i as u8]).with_priority(priority);
            request(&mut ctx, 1, i as u64, Request::Put(unit));
        }
        ctx.take_outbox();

        let mut order = Vec::new();
        for tag in 10..13 {
            request(&mut ctx, 0, tag, Request::Get { work_type: 5 });
            order.push(work(response(&ctx.take_outbox(), 0)).payload[0]);
        }
        assert_eq!(order, vec![1, 0, 2]);
    }

    #[test]
    fn test_notification_leaves_before_store_response() {
        let mut ctx = context(2, 1, 2);
        request(
            &mut ctx,
            0,
            1,
            Request::Create(CreateSpec::new(0, DataKind::Integer)),
        );
        let Ok(Reply::Id(id)) = response(&ctx.take_outbox(), 0) else {
            panic!("create failed");
        };

        request(
            &mut ctx,
            1,
            1,
            Request::Subscribe {
                id,
                subscript: None,
                token: 77,
            },
        );
        assert_eq!(
            response(&ctx.take_outbox(), 1),
            Ok(Reply::Subscribed(SubscribeStatus::Pending))
        );
        request(&mut ctx, 1, 2, Request::Get { work_type: 0 });

        request(
            &mut ctx,
            0,
            2,
            Request::Store {
                id,
                value: DataValue::Integer(42),
                drops: 1,
            },
        );
        let outbox = ctx.take_outbox();
        assert_eq!(outbox.len(), 2);
        assert_eq!(outbox[0].0, 1);
        assert_eq!(outbox[1].0, 0);

        let unit = work(response(&outbox, 1));
        assert_eq!(unit.priority, NOTIFICATION_PRIORITY);
        let note = Notification::decode(&unit.payload).unwrap();
        assert_eq!(note.token, 77);
        assert_eq!(note.event, Event::Closed);
    }

    #[test]
    fn test_datum_owned_elsewhere() {
        let mut ctx = context(2, 2, 2);
        // ids congruent to 1 belong to the second server
        request(&mut ctx, 0, 1, Request::Typeof { id: 3 });
        let err = response(&ctx.take_outbox(), 0).unwrap_err();
        assert_eq!(err.code, Code::UserError);
    }

    #[test]
    fn test_targeted_put_forwarded_to_home() {
        let mut ctx = context(2, 2, 2);
        let unit = WorkUnit::new(1, vec![]).with_target(1);
        request(&mut ctx, 0, 1, Request::Put(unit));
        let outbox = ctx.take_outbox();
        assert!(outbox
            .iter()
            .any(|(to, m)| *to == 3 && matches!(m, Message::ForwardPut(u) if u.target == Some(1))));
        assert_eq!(response(&outbox, 0), Ok(Reply::Ack));
    }

    #[test]
    fn test_steal_request_hands_over_half() {
        let mut ctx = context(2, 2, 2);
        for tag in 0..4 {
            request(&mut ctx, 0, tag, Request::Put(WorkUnit::new(1, vec![tag as u8])));
        }
        ctx.take_outbox();

        ctx.handle(Envelope {
            source: 3,
            message: Message::StealRequest {
                wanted: vec![1],
                load: LoadReport::default(),
            },
        });
        let outbox = ctx.take_outbox();
        let Some((to, Message::StealResponse { units, load })) = outbox.first() else {
            panic!("expected a steal response");
        };
        assert_eq!(*to, 3);
        assert_eq!(units.len(), 2);
        assert_eq!(load.counts.get(&1), Some(&2));
        assert_eq!(ctx.queued(), 2);
    }

    #[test]
    fn test_parked_get_triggers_steal_probe() {
        let mut ctx = context(2, 2, 2);
        request(&mut ctx, 0, 1, Request::Get { work_type: 1 });
        let outbox = ctx.take_outbox();
        assert!(matches!(
            outbox.as_slice(),
            [(3, Message::StealRequest { wanted, .. })] if wanted == &vec![1]
        ));

        ctx.handle(Envelope {
            source: 3,
            message: Message::StealResponse {
                units: vec![WorkUnit::new(1, b"stolen".to_vec())],
                load: LoadReport::default(),
            },
        });
        let outbox = ctx.take_outbox();
        assert_eq!(work(response(&outbox, 0)).payload, b"stolen");
    }

    #[test]
    fn test_single_server_vote_and_shutdown() {
        let mut ctx = context(2, 1, 2);
        request(&mut ctx, 0, 1, Request::Get { work_type: 1 });
        assert_eq!(ctx.on_idle_tick(), Flow::Continue);
        assert!(!ctx.is_shutting_down());

        request(&mut ctx, 1, 1, Request::Get { work_type: 1 });
        assert_eq!(ctx.on_idle_tick(), Flow::Continue);
        assert_eq!(ctx.on_idle_tick(), Flow::Continue);
        assert!(ctx.is_shutting_down());

        let outbox = ctx.take_outbox();
        for worker in [0, 1] {
            assert_eq!(response(&outbox, worker).unwrap_err().code, Code::Shutdown);
        }

        request(&mut ctx, 0, 2, Request::Get { work_type: 1 });
        assert_eq!(response(&ctx.take_outbox(), 0).unwrap_err().code, Code::Shutdown);

        assert_eq!(request(&mut ctx, 0, 3, Request::Finalize), Flow::Continue);
        assert_eq!(request(&mut ctx, 1, 2, Request::Finalize), Flow::Exit);
    }

    #[test]
    fn test_open_datum_blocks_quiescence() {
        let mut ctx = context(1, 1, 1);
        request(
            &mut ctx,
            0,
            1,
            Request::Create(CreateSpec::new(0, DataKind::Blob)),
        );
        request(&mut ctx, 0, 2, Request::Get { work_type: 1 });
        assert!(!ctx.local_idle());
        for _ in 0..3 {
            ctx.on_idle_tick();
        }
        assert!(!ctx.is_shutting_down());
    }

    #[test]
    fn test_server_shutdown_from_non_master_relays() {
        let mut ctx = context(2, 2, 3);
        request(&mut ctx, 1, 1, Request::ServerShutdown);
        let outbox = ctx.take_outbox();
        assert!(outbox
            .iter()
            .any(|(to, m)| *to == 2 && *m == Message::ShutdownRequested));
        assert!(!ctx.is_shutting_down());

        ctx.handle(Envelope {
            source: 2,
            message: Message::Shutdown,
        });
        assert!(ctx.is_shutting_down());
    }

    #[test]
    fn test_master_reaches_every_peer() {
        let mut ctx = context(2, 3, 2);
        request(&mut ctx, 0, 1, Request::Get { work_type: 1 });
        ctx.take_outbox();
        assert_eq!(ctx.on_idle_tick(), Flow::Continue);
        let mut queried: Vec<Rank> = ctx
            .take_outbox()
            .into_iter()
            .filter(|(_, m)| matches!(m, Message::IdleQuery { .. }))
            .map(|(to, _)| to)
            .collect();
        queried.sort();
        assert_eq!(queried, vec![3, 4]);

        request(&mut ctx, 0, 2, Request::ServerShutdown);
        let outbox = ctx.take_outbox();
        let mut told: Vec<Rank> = outbox
            .iter()
            .filter(|(_, m)| *m == Message::Shutdown)
            .map(|(to, _)| *to)
            .collect();
        told.sort();
        assert_eq!(told, vec![3, 4]);
        assert!(ctx.is_shutting_down());
    }

    #[test]
    fn test_abort_message() {
        let mut ctx = context(1, 1, 1);
        let flow = ctx.handle(Envelope {
            source: 0,
            message: Message::Abort { code: 3 },
        });
        assert_eq!(flow, Flow::Abort(3));
    }
}
