use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, WireError};
use crate::core::layout::Rank;
use crate::data::{CreateSpec, DataKind, DataValue, DatumId, SubscribeStatus};
use crate::workqueue::{LoadReport, WorkType, WorkUnit};

/// Operations a worker (or a peer server) asks a server to perform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Put(WorkUnit),
    Get {
        work_type: WorkType,
    },
    Create(CreateSpec),
    Exists {
        id: DatumId,
        subscript: Option<String>,
    },
    Store {
        id: DatumId,
        value: DataValue,
        drops: u32,
    },
    /// Store raw member bytes, decoded by the owner per the datum's kind
    StoreMember {
        id: DatumId,
        member: Vec<u8>,
        drops: u32,
    },
    Retrieve {
        id: DatumId,
        accept_open: bool,
    },
    Enumerate {
        id: DatumId,
        offset: usize,
        count: Option<usize>,
    },
    SlotCreate {
        id: DatumId,
        count: u32,
    },
    SlotDrop {
        id: DatumId,
        count: u32,
    },
    ReadIncr {
        id: DatumId,
        count: u32,
    },
    ReadDecr {
        id: DatumId,
        count: u32,
    },
    Insert {
        id: DatumId,
        subscript: String,
        member: Vec<u8>,
        drops: u32,
    },
    InsertAtomic {
        id: DatumId,
        subscript: String,
    },
    Lookup {
        id: DatumId,
        subscript: String,
    },
    Subscribe {
        id: DatumId,
        subscript: Option<String>,
        token: u64,
    },
    ContainerReference {
        id: DatumId,
        subscript: String,
        reference: Option<DatumId>,
        token: u64,
    },
    Close {
        id: DatumId,
    },
    Unique,
    Typeof {
        id: DatumId,
    },
    ContainerTypeof {
        id: DatumId,
    },
    ContainerSize {
        id: DatumId,
    },
    Lock {
        id: DatumId,
    },
    Unlock {
        id: DatumId,
    },
    ServerIdle,
    ServerShutdown,
    Finalize,
}

impl Request {
    /// Datum the request addresses, when it must run on that datum's owner
    pub fn datum(&self) -> Option<DatumId> {
        use Request::*;
        match self {
            Create(spec) if spec.id != 0 => Some(spec.id),
            Exists { id, .. }
            | Store { id, .. }
            | StoreMember { id, .. }
            | Retrieve { id, .. }
            | Enumerate { id, .. }
            | SlotCreate { id, .. }
            | SlotDrop { id, .. }
            | ReadIncr { id, .. }
            | ReadDecr { id, .. }
            | Insert { id, .. }
            | InsertAtomic { id, .. }
            | Lookup { id, .. }
            | Subscribe { id, .. }
            | ContainerReference { id, .. }
            | Close { id }
            | Typeof { id }
            | ContainerTypeof { id }
            | ContainerSize { id }
            | Lock { id }
            | Unlock { id } => Some(*id),
            _ => None,
        }
    }

    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        use Request::*;
        match self {
            Put(_) => "put",
            Get { .. } => "get",
            Create(_) => "create",
            Exists { .. } => "exists",
            Store { .. } => "store",
            StoreMember { .. } => "store_member",
            Retrieve { .. } => "retrieve",
            Enumerate { .. } => "enumerate",
            SlotCreate { .. } => "slot_create",
            SlotDrop { .. } => "slot_drop",
            ReadIncr { .. } => "read_incr",
            ReadDecr { .. } => "read_decr",
            Insert { .. } => "insert",
            InsertAtomic { .. } => "insert_atomic",
            Lookup { .. } => "lookup",
            Subscribe { .. } => "subscribe",
            ContainerReference { .. } => "container_reference",
            Close { .. } => "close",
            Unique => "unique",
            Typeof { .. } => "typeof",
            ContainerTypeof { .. } => "container_typeof",
            ContainerSize { .. } => "container_size",
            Lock { .. } => "lock",
            Unlock { .. } => "unlock",
            ServerIdle => "server_idle",
            ServerShutdown => "server_shutdown",
            Finalize => "finalize",
        }
    }
}

/// Successful answers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    Ack,
    Work(WorkUnit),
    Id(DatumId),
    Bool(bool),
    Kind(DataKind),
    Value(DataValue),
    Member(Option<Vec<u8>>),
    Records(Vec<(String, Vec<u8>)>),
    Size(usize),
    Subscribed(SubscribeStatus),
    Ranks(Vec<Rank>),
}

/// One server's answer to an idle query
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdleReport {
    pub idle: bool,
    /// Requests, responses and work moved through this server so far
    pub activity: u64,
    /// Counted server-to-server messages sent
    pub sent: u64,
    /// Counted server-to-server messages received
    pub received: u64,
}

/// Everything that travels between ranks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Request {
        tag: u64,
        body: Request,
    },
    Response {
        tag: u64,
        body: std::result::Result<Reply, WireError>,
    },
    /// A put whose target is homed on another server
    ForwardPut(WorkUnit),
    StealRequest {
        wanted: Vec<WorkType>,
        load: LoadReport,
    },
    StealResponse {
        units: Vec<WorkUnit>,
        load: LoadReport,
    },
    IdleQuery {
        round: u64,
    },
    IdleReply {
        round: u64,
        report: IdleReport,
    },
    Shutdown,
    /// A non-master server relaying a shutdown request to the master
    ShutdownRequested,
    Abort {
        code: i32,
    },
}

impl Message {
    /// Serialize message
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize message
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// A decoded message and the rank that sent it
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub source: Rank,
    pub message: Message,
}
