use std::sync::Arc;
use tracing::{debug, error};

use crate::core::config::Config;
use crate::core::errors::{Result, XlbError};
use crate::core::layout::{Layout, Rank};
use crate::data::{
    CreateSpec, DataKind, DataValue, DatumId, Notification, SubscribeStatus, NULL_ID,
};
use crate::runtime::WorkerGroup;
use crate::transport::{LocalEndpoint, Message, Reply, Request, Transport};
use crate::workqueue::{WorkType, WorkUnit};
use crate::Version;

/// Result of a subscribe or container-reference call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Token echoed by the notification, when one follows
    pub token: u64,
    pub status: SubscribeStatus,
}

impl Subscription {
    pub fn is_satisfied(&self) -> bool {
        matches!(self.status, SubscribeStatus::AlreadySatisfied { .. })
    }
}

/// Worker-side handle to the servers.
///
/// Every call is one request/response exchange; a client never has more
/// than one request outstanding.
pub struct Client<T: Transport = LocalEndpoint> {
    transport: T,
    layout: Layout,
    config: Arc<Config>,
    group: WorkerGroup,
    next_tag: u64,
    next_token: u64,
}

fn unexpected(operation: &str, reply: Reply) -> XlbError {
    XlbError::protocol(format!("unexpected reply to {}: {:?}", operation, reply))
}

impl<T: Transport> Client<T> {
    pub fn new(transport: T, config: Arc<Config>, group: WorkerGroup) -> Self {
        let layout = Layout::new(config.nworkers, config.nservers);
        Self {
            transport,
            layout,
            config,
            group,
            next_tag: 0,
            next_token: 0,
        }
    }

    pub fn rank(&self) -> Rank {
        self.transport.rank()
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Server that parks this worker's Gets
    pub fn home_server(&self) -> Rank {
        self.layout.home_server(self.rank())
    }

    pub fn version(&self) -> Version {
        crate::version()
    }

    async fn call(&mut self, to: Rank, body: Request) -> Result<Reply> {
        let tag = self.next_tag;
        self.next_tag += 1;
        match self.transport.send(to, &Message::Request { tag, body }).await {
            Ok(()) => {}
            // servers only leave once the run is shutting down
            Err(XlbError::Transport { message, .. }) if self.layout.is_server(to) => {
                debug!("Server {} is gone ({}), treating as shutdown", to, message);
                return Err(XlbError::Shutdown);
            }
            Err(e) => return Err(e),
        }
        loop {
            let envelope = self.transport.recv().await?;
            match envelope.message {
                Message::Response { tag: t, body } if t == tag => {
                    return body.map_err(|e| e.into_error());
                }
                Message::Abort { code } => {
                    error!("Rank {} aborted the run with code {}", envelope.source, code);
                    return Err(XlbError::Aborted { code });
                }
                other => debug!("Ignoring {:?} from {}", other, envelope.source),
            }
        }
    }

    async fn ack(&mut self, to: Rank, body: Request) -> Result<()> {
        let name = body.name();
        match self.call(to, body).await? {
            Reply::Ack => Ok(()),
            other => Err(unexpected(name, other)),
        }
    }

    async fn call_bool(&mut self, to: Rank, body: Request) -> Result<bool> {
        let name = body.name();
        match self.call(to, body).await? {
            Reply::Bool(b) => Ok(b),
            other => Err(unexpected(name, other)),
        }
    }

    async fn call_kind(&mut self, to: Rank, body: Request) -> Result<DataKind> {
        let name = body.name();
        match self.call(to, body).await? {
            Reply::Kind(k) => Ok(k),
            other => Err(unexpected(name, other)),
        }
    }

    async fn call_id(&mut self, to: Rank, body: Request) -> Result<DatumId> {
        let name = body.name();
        match self.call(to, body).await? {
            Reply::Id(id) => Ok(id),
            other => Err(unexpected(name, other)),
        }
    }

    fn owner(&self, id: DatumId) -> Rank {
        self.layout.owner(id)
    }

    // Work

    /// Submit a payload of `work_type`; `target` pins it to one rank
    pub async fn put(
        &mut self,
        payload: impl Into<Vec<u8>>,
        work_type: WorkType,
        priority: i32,
        target: Option<Rank>,
    ) -> Result<()> {
        let unit = WorkUnit {
            payload: payload.into(),
            target,
            answer: self.rank(),
            work_type,
            priority,
        };
        self.put_unit(unit).await
    }

    pub async fn put_unit(&mut self, unit: WorkUnit) -> Result<()> {
        let to = match unit.target {
            Some(target) if self.layout.is_server(target) => target,
            Some(target) if self.layout.is_worker(target) => self.layout.home_server(target),
            _ => self.home_server(),
        };
        self.ack(to, Request::Put(unit)).await
    }

    /// Block until a unit of `work_type` is available or the run shuts down
    pub async fn get(&mut self, work_type: WorkType) -> Result<WorkUnit> {
        let home = self.home_server();
        match self.call(home, Request::Get { work_type }).await? {
            Reply::Work(unit) => Ok(unit),
            other => Err(unexpected("get", other)),
        }
    }

    /// Block until the next subscription notification arrives
    pub async fn next_notification(&mut self) -> Result<Notification> {
        let unit = self.get(self.config.notification_type).await?;
        Notification::decode(&unit.payload)
    }

    // Creation

    /// Create a datum; an id of 0 lets the home server allocate one
    pub async fn create(&mut self, spec: CreateSpec) -> Result<DatumId> {
        let to = if spec.id == NULL_ID {
            self.home_server()
        } else {
            self.owner(spec.id)
        };
        self.call_id(to, Request::Create(spec)).await
    }

    pub async fn create_integer(&mut self, id: DatumId) -> Result<DatumId> {
        self.create(CreateSpec::new(id, DataKind::Integer)).await
    }

    pub async fn create_float(&mut self, id: DatumId) -> Result<DatumId> {
        self.create(CreateSpec::new(id, DataKind::Float)).await
    }

    pub async fn create_string(&mut self, id: DatumId) -> Result<DatumId> {
        self.create(CreateSpec::new(id, DataKind::String)).await
    }

    pub async fn create_blob(&mut self, id: DatumId) -> Result<DatumId> {
        self.create(CreateSpec::new(id, DataKind::Blob)).await
    }

    pub async fn create_file(&mut self, id: DatumId, filename: impl Into<String>) -> Result<DatumId> {
        self.create(CreateSpec::file(id, filename)).await
    }

    pub async fn create_container(
        &mut self,
        id: DatumId,
        subscript_kind: DataKind,
    ) -> Result<DatumId> {
        self.create(CreateSpec::container(id, subscript_kind)).await
    }

    pub async fn unique(&mut self) -> Result<DatumId> {
        let home = self.home_server();
        self.call_id(home, Request::Unique).await
    }

    // Inspection

    pub async fn exists(&mut self, id: DatumId) -> Result<bool> {
        let body = Request::Exists {
            id,
            subscript: None,
        };
        self.call_bool(self.owner(id), body).await
    }

    pub async fn exists_subscript(&mut self, id: DatumId, subscript: &str) -> Result<bool> {
        let body = Request::Exists {
            id,
            subscript: Some(subscript.to_string()),
        };
        self.call_bool(self.owner(id), body).await
    }

    pub async fn type_of(&mut self, id: DatumId) -> Result<DataKind> {
        self.call_kind(self.owner(id), Request::Typeof { id }).await
    }

    pub async fn container_type_of(&mut self, id: DatumId) -> Result<DataKind> {
        self.call_kind(self.owner(id), Request::ContainerTypeof { id })
            .await
    }

    pub async fn container_size(&mut self, id: DatumId) -> Result<usize> {
        match self.call(self.owner(id), Request::ContainerSize { id }).await? {
            Reply::Size(n) => Ok(n),
            other => Err(unexpected("container_size", other)),
        }
    }

    // Values

    /// Store a value and release `drops` writer slots in the same step
    pub async fn store(&mut self, id: DatumId, value: DataValue, drops: u32) -> Result<()> {
        self.ack(self.owner(id), Request::Store { id, value, drops })
            .await
    }

    /// Store raw bytes, interpreted by the owner according to the datum's kind
    pub async fn store_bytes(
        &mut self,
        id: DatumId,
        bytes: impl Into<Vec<u8>>,
        drops: u32,
    ) -> Result<()> {
        let body = Request::StoreMember {
            id,
            member: bytes.into(),
            drops,
        };
        self.ack(self.owner(id), body).await
    }

    /// Value of a closed datum, or of a scalar that already has one
    pub async fn retrieve(&mut self, id: DatumId) -> Result<DataValue> {
        self.retrieve_with(id, false).await
    }

    /// Like [`Client::retrieve`], but an open container answers with its
    /// current entries
    pub async fn retrieve_open(&mut self, id: DatumId) -> Result<DataValue> {
        self.retrieve_with(id, true).await
    }

    async fn retrieve_with(&mut self, id: DatumId, accept_open: bool) -> Result<DataValue> {
        let body = Request::Retrieve { id, accept_open };
        match self.call(self.owner(id), body).await? {
            Reply::Value(value) => Ok(value),
            other => Err(unexpected("retrieve", other)),
        }
    }

    /// Kind and raw bytes of a datum
    pub async fn retrieve_bytes(&mut self, id: DatumId) -> Result<(DataKind, Vec<u8>)> {
        let value = self.retrieve(id).await?;
        Ok((value.kind(), value.to_bytes()?))
    }

    // Reference counts

    pub async fn slot_create(&mut self, id: DatumId, count: u32) -> Result<()> {
        self.ack(self.owner(id), Request::SlotCreate { id, count })
            .await
    }

    pub async fn slot_drop(&mut self, id: DatumId, count: u32) -> Result<()> {
        self.ack(self.owner(id), Request::SlotDrop { id, count })
            .await
    }

    pub async fn read_incr(&mut self, id: DatumId, count: u32) -> Result<()> {
        self.ack(self.owner(id), Request::ReadIncr { id, count })
            .await
    }

    pub async fn read_decr(&mut self, id: DatumId, count: u32) -> Result<()> {
        self.ack(self.owner(id), Request::ReadDecr { id, count })
            .await
    }

    /// Force-close a datum; returns the ranks that were waiting on it
    pub async fn close(&mut self, id: DatumId) -> Result<Vec<Rank>> {
        match self.call(self.owner(id), Request::Close { id }).await? {
            Reply::Ranks(ranks) => Ok(ranks),
            other => Err(unexpected("close", other)),
        }
    }

    // Containers

    pub async fn insert(
        &mut self,
        id: DatumId,
        subscript: &str,
        member: impl Into<Vec<u8>>,
        drops: u32,
    ) -> Result<()> {
        let body = Request::Insert {
            id,
            subscript: subscript.to_string(),
            member: member.into(),
            drops,
        };
        self.ack(self.owner(id), body).await
    }

    /// Reserve `subscript`; true only for the first caller
    pub async fn insert_atomic(&mut self, id: DatumId, subscript: &str) -> Result<bool> {
        let body = Request::InsertAtomic {
            id,
            subscript: subscript.to_string(),
        };
        self.call_bool(self.owner(id), body).await
    }

    /// Member at `subscript`, `None` when not (yet) present
    pub async fn lookup(&mut self, id: DatumId, subscript: &str) -> Result<Option<Vec<u8>>> {
        let body = Request::Lookup {
            id,
            subscript: subscript.to_string(),
        };
        match self.call(self.owner(id), body).await? {
            Reply::Member(member) => Ok(member),
            other => Err(unexpected("lookup", other)),
        }
    }

    /// Up to `count` present entries starting at `offset`, in insertion order
    pub async fn enumerate(
        &mut self,
        id: DatumId,
        count: Option<usize>,
        offset: usize,
    ) -> Result<Vec<(String, Vec<u8>)>> {
        let body = Request::Enumerate { id, offset, count };
        match self.call(self.owner(id), body).await? {
            Reply::Records(records) => Ok(records),
            other => Err(unexpected("enumerate", other)),
        }
    }

    // Subscriptions

    fn token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }

    async fn subscribe_with(&mut self, to: Rank, token: u64, body: Request) -> Result<Subscription> {
        let name = body.name();
        match self.call(to, body).await? {
            Reply::Subscribed(status) => Ok(Subscription { token, status }),
            other => Err(unexpected(name, other)),
        }
    }

    /// Be notified once when `id` closes
    pub async fn subscribe(&mut self, id: DatumId) -> Result<Subscription> {
        let token = self.token();
        let body = Request::Subscribe {
            id,
            subscript: None,
            token,
        };
        self.subscribe_with(self.owner(id), token, body).await
    }

    /// Be notified once when `subscript` of container `id` is inserted
    pub async fn subscribe_subscript(&mut self, id: DatumId, subscript: &str) -> Result<Subscription> {
        let token = self.token();
        let body = Request::Subscribe {
            id,
            subscript: Some(subscript.to_string()),
            token,
        };
        self.subscribe_with(self.owner(id), token, body).await
    }

    /// When `subscript` appears in `id`, copy its member into `reference`
    /// (dropping one of its writer slots) and notify this worker
    pub async fn container_reference(
        &mut self,
        id: DatumId,
        subscript: &str,
        reference: Option<DatumId>,
    ) -> Result<Subscription> {
        let token = self.token();
        let body = Request::ContainerReference {
            id,
            subscript: subscript.to_string(),
            reference,
            token,
        };
        self.subscribe_with(self.owner(id), token, body).await
    }

    // Locks

    /// Try to take the advisory lock on `id`; never blocks
    pub async fn lock(&mut self, id: DatumId) -> Result<bool> {
        self.call_bool(self.owner(id), Request::Lock { id }).await
    }

    pub async fn unlock(&mut self, id: DatumId) -> Result<()> {
        self.ack(self.owner(id), Request::Unlock { id }).await
    }

    // Lifecycle

    /// Whether server `server` is locally quiescent right now
    pub async fn server_idle(&mut self, server: Rank) -> Result<bool> {
        if !self.layout.is_server(server) {
            return Err(XlbError::user_op(
                "server_idle",
                format!("rank {} is not a server", server),
            ));
        }
        self.call_bool(server, Request::ServerIdle).await
    }

    /// Ask the run to shut down now, without waiting for quiescence
    pub async fn server_shutdown(&mut self) -> Result<()> {
        let home = self.home_server();
        self.ack(home, Request::ServerShutdown).await
    }

    /// Wait for every worker of the run
    pub async fn barrier(&self) {
        self.group.barrier().await;
    }

    /// Tell the home server this worker is done
    pub async fn finalize(mut self) -> Result<()> {
        let home = self.home_server();
        self.ack(home, Request::Finalize).await
    }

    /// Best-effort broadcast of an abort to every other rank.
    ///
    /// Exits the process with `code` when the configuration says so;
    /// otherwise returns `Aborted`.
    pub async fn abort(&self, code: i32) -> Result<()> {
        error!("Aborting run with code {}", code);
        let me = self.rank();
        for rank in (0..self.layout.size()).filter(|r| *r != me) {
            if let Err(e) = self.transport.send(rank, &Message::Abort { code }).await {
                debug!("Abort notice to rank {} not delivered: {}", rank, e);
            }
        }
        if self.config.exit_on_abort {
            std::process::exit(code);
        }
        Err(XlbError::Aborted { code })
    }
}
