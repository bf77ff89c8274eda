use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::core::errors::{Result, XlbError};

/// Global datum identifier; 0 is the null id
pub type DatumId = i64;

pub const NULL_ID: DatumId = 0;

/// Closed set of datum kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataKind {
    Integer,
    Float,
    String,
    Blob,
    File,
    Container,
}

impl DataKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataKind::Integer => "integer",
            DataKind::Float => "float",
            DataKind::String => "string",
            DataKind::Blob => "blob",
            DataKind::File => "file",
            DataKind::Container => "container",
        }
    }

    /// Kinds a container may be keyed by
    pub fn is_subscript_kind(&self) -> bool {
        matches!(self, DataKind::Integer | DataKind::String)
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataKind {
    type Err = XlbError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "integer" => Ok(DataKind::Integer),
            "float" => Ok(DataKind::Float),
            "string" => Ok(DataKind::String),
            "blob" => Ok(DataKind::Blob),
            "file" => Ok(DataKind::File),
            "container" => Ok(DataKind::Container),
            other => Err(XlbError::user(format!("unknown data type: {}", other))),
        }
    }
}

/// A container entry as seen by readers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub subscript: String,
    /// `None` for a subscript reserved by an atomic insert but not yet written
    pub member: Option<Vec<u8>>,
}

/// Typed datum value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DataValue {
    Integer(i64),
    Float(f64),
    String(String),
    Blob(Vec<u8>),
    /// File datums hold the file name
    File(String),
    Container(Vec<Entry>),
}

impl DataValue {
    pub fn kind(&self) -> DataKind {
        match self {
            DataValue::Integer(_) => DataKind::Integer,
            DataValue::Float(_) => DataKind::Float,
            DataValue::String(_) => DataKind::String,
            DataValue::Blob(_) => DataKind::Blob,
            DataValue::File(_) => DataKind::File,
            DataValue::Container(_) => DataKind::Container,
        }
    }

    /// Raw byte form: little-endian numbers, UTF-8 text, bincode for containers
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(match self {
            DataValue::Integer(v) => v.to_le_bytes().to_vec(),
            DataValue::Float(v) => v.to_le_bytes().to_vec(),
            DataValue::String(s) | DataValue::File(s) => s.as_bytes().to_vec(),
            DataValue::Blob(b) => b.clone(),
            DataValue::Container(entries) => bincode::serialize(entries)?,
        })
    }

    /// Decode raw bytes written for a datum of `kind`
    pub fn from_bytes(kind: DataKind, bytes: &[u8]) -> Result<Self> {
        let text = || {
            String::from_utf8(bytes.to_vec())
                .map_err(|_| XlbError::user(format!("{} value is not valid UTF-8", kind)))
        };
        Ok(match kind {
            DataKind::Integer => DataValue::Integer(i64::from_le_bytes(fixed8(kind, bytes)?)),
            DataKind::Float => DataValue::Float(f64::from_le_bytes(fixed8(kind, bytes)?)),
            DataKind::String => DataValue::String(text()?),
            DataKind::File => DataValue::File(text()?),
            DataKind::Blob => DataValue::Blob(bytes.to_vec()),
            DataKind::Container => DataValue::Container(bincode::deserialize(bytes)?),
        })
    }

    /// Approximate footprint used for capacity accounting
    pub fn size_bytes(&self) -> u64 {
        let len = match self {
            DataValue::Integer(_) | DataValue::Float(_) => 8,
            DataValue::String(s) | DataValue::File(s) => s.len(),
            DataValue::Blob(b) => b.len(),
            DataValue::Container(entries) => entries
                .iter()
                .map(|e| e.subscript.len() + e.member.as_ref().map_or(0, |m| m.len()))
                .sum(),
        };
        len as u64
    }
}

fn fixed8(kind: DataKind, bytes: &[u8]) -> Result<[u8; 8]> {
    bytes.try_into().map_err(|_| {
        XlbError::user(format!(
            "{} value must be 8 bytes, got {}",
            kind,
            bytes.len()
        ))
    })
}

/// Reference counts a datum is created with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefCounts {
    pub read: u32,
    pub write: u32,
}

impl Default for RefCounts {
    fn default() -> Self {
        Self { read: 1, write: 1 }
    }
}

/// Arguments of a create call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateSpec {
    /// `NULL_ID` asks the owning server to allocate one
    pub id: DatumId,
    pub kind: DataKind,
    /// Subscript kind, containers only
    pub subscript_kind: Option<DataKind>,
    /// File name, file datums only
    pub filename: Option<String>,
    pub refcounts: RefCounts,
}

impl CreateSpec {
    pub fn new(id: DatumId, kind: DataKind) -> Self {
        Self {
            id,
            kind,
            subscript_kind: None,
            filename: None,
            refcounts: RefCounts::default(),
        }
    }

    pub fn container(id: DatumId, subscript_kind: DataKind) -> Self {
        Self {
            subscript_kind: Some(subscript_kind),
            ..Self::new(id, DataKind::Container)
        }
    }

    pub fn file(id: DatumId, filename: impl Into<String>) -> Self {
        Self {
            filename: Some(filename.into()),
            ..Self::new(id, DataKind::File)
        }
    }

    pub fn with_refcounts(mut self, read: u32, write: u32) -> Self {
        self.refcounts = RefCounts { read, write };
        self
    }
}

#[derive(Debug, Clone)]
struct Slot {
    member: Option<Vec<u8>>,
}

/// Container payload: unique subscripts kept in insertion order
#[derive(Debug, Clone)]
pub(crate) struct Container {
    subscript_kind: DataKind,
    slots: HashMap<String, Slot>,
    order: Vec<String>,
}

/// What an insert did to the container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Inserted {
    New,
    /// A reservation made by an atomic insert was filled
    Filled,
    Replaced,
}

impl Container {
    pub(crate) fn new(subscript_kind: DataKind) -> Self {
        Self {
            subscript_kind,
            slots: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub(crate) fn subscript_kind(&self) -> DataKind {
        self.subscript_kind
    }

    pub(crate) fn validate_subscript(&self, subscript: &str) -> Result<()> {
        if self.subscript_kind == DataKind::Integer && subscript.parse::<i64>().is_err() {
            return Err(XlbError::user(format!(
                "subscript \"{}\" is not an integer",
                subscript
            )));
        }
        Ok(())
    }

    /// Write a member; a present entry is replaced only when `allow_overwrite`
    pub(crate) fn insert(
        &mut self,
        subscript: &str,
        member: Vec<u8>,
        allow_overwrite: bool,
    ) -> Result<Inserted> {
        match self.slots.get_mut(subscript) {
            Some(slot) if slot.member.is_some() => {
                if !allow_overwrite {
                    return Err(XlbError::user(format!(
                        "subscript \"{}\" already present",
                        subscript
                    )));
                }
                slot.member = Some(member);
                Ok(Inserted::Replaced)
            }
            Some(slot) => {
                slot.member = Some(member);
                Ok(Inserted::Filled)
            }
            None => {
                self.order.push(subscript.to_string());
                self.slots.insert(subscript.to_string(), Slot { member: Some(member) });
                Ok(Inserted::New)
            }
        }
    }

    /// Test-and-set: true only when the subscript was entirely absent
    pub(crate) fn reserve(&mut self, subscript: &str) -> bool {
        if self.slots.contains_key(subscript) {
            return false;
        }
        self.order.push(subscript.to_string());
        self.slots.insert(subscript.to_string(), Slot { member: None });
        true
    }

    /// True for present and reserved subscripts alike
    pub(crate) fn contains(&self, subscript: &str) -> bool {
        self.slots.contains_key(subscript)
    }

    pub(crate) fn lookup(&self, subscript: &str) -> Option<&[u8]> {
        self.slots.get(subscript)?.member.as_deref()
    }

    pub(crate) fn member_len(&self, subscript: &str) -> usize {
        self.lookup(subscript).map_or(0, |m| m.len())
    }

    /// Number of entries with a written member
    pub(crate) fn size(&self) -> usize {
        self.slots.values().filter(|s| s.member.is_some()).count()
    }

    /// Present entries in insertion order, paged
    pub(crate) fn enumerate(&self, offset: usize, count: Option<usize>) -> Vec<(String, Vec<u8>)> {
        let present = self.order.iter().filter_map(|sub| {
            self.slots
                .get(sub)
                .and_then(|slot| slot.member.clone())
                .map(|m| (sub.clone(), m))
        });
        let paged = present.skip(offset);
        match count {
            Some(n) => paged.take(n).collect(),
            None => paged.collect(),
        }
    }

    pub(crate) fn entries(&self, include_reserved: bool) -> Vec<Entry> {
        self.order
            .iter()
            .filter_map(|sub| {
                let slot = self.slots.get(sub)?;
                if slot.member.is_none() && !include_reserved {
                    return None;
                }
                Some(Entry {
                    subscript: sub.clone(),
                    member: slot.member.clone(),
                })
            })
            .collect()
    }
}

/// Tagged content of a datum; scalars are `None` until first stored
#[derive(Debug, Clone)]
pub(crate) enum Content {
    Integer(Option<i64>),
    Float(Option<f64>),
    String(Option<String>),
    Blob(Option<Vec<u8>>),
    File(Option<String>),
    Container(Container),
}

impl Content {
    pub(crate) fn empty(spec: &CreateSpec) -> Result<Self> {
        Ok(match spec.kind {
            DataKind::Integer => Content::Integer(None),
            DataKind::Float => Content::Float(None),
            DataKind::String => Content::String(None),
            DataKind::Blob => Content::Blob(None),
            DataKind::File => Content::File(spec.filename.clone()),
            DataKind::Container => {
                let subscript_kind = spec.subscript_kind.unwrap_or(DataKind::String);
                if !subscript_kind.is_subscript_kind() {
                    return Err(XlbError::user(format!(
                        "containers cannot be keyed by {}",
                        subscript_kind
                    )));
                }
                Content::Container(Container::new(subscript_kind))
            }
        })
    }

    pub(crate) fn kind(&self) -> DataKind {
        match self {
            Content::Integer(_) => DataKind::Integer,
            Content::Float(_) => DataKind::Float,
            Content::String(_) => DataKind::String,
            Content::Blob(_) => DataKind::Blob,
            Content::File(_) => DataKind::File,
            Content::Container(_) => DataKind::Container,
        }
    }

    /// Set a scalar value; the value kind must match the datum kind
    pub(crate) fn set(&mut self, value: DataValue) -> Result<()> {
        match (self, value) {
            (Content::Integer(slot), DataValue::Integer(v)) => *slot = Some(v),
            (Content::Float(slot), DataValue::Float(v)) => *slot = Some(v),
            (Content::String(slot), DataValue::String(v)) => *slot = Some(v),
            (Content::Blob(slot), DataValue::Blob(v)) => *slot = Some(v),
            (Content::File(slot), DataValue::File(v)) => *slot = Some(v),
            (Content::Container(_), _) => {
                return Err(XlbError::user("containers are written with insert"))
            }
            (content, value) => {
                return Err(XlbError::user(format!(
                    "cannot store {} into {} datum",
                    value.kind(),
                    content.kind()
                )))
            }
        }
        Ok(())
    }

    /// Current scalar value, if any
    pub(crate) fn scalar(&self) -> Option<DataValue> {
        match self {
            Content::Integer(v) => v.map(DataValue::Integer),
            Content::Float(v) => v.map(DataValue::Float),
            Content::String(v) => v.clone().map(DataValue::String),
            Content::Blob(v) => v.clone().map(DataValue::Blob),
            Content::File(v) => v.clone().map(DataValue::File),
            Content::Container(_) => None,
        }
    }

    pub(crate) fn size_bytes(&self) -> u64 {
        match self {
            Content::Container(c) => DataValue::Container(c.entries(true)).size_bytes(),
            other => other.scalar().map_or(0, |v| v.size_bytes()),
        }
    }
}

/// Server-side record of one datum
#[derive(Debug, Clone)]
pub(crate) struct Datum {
    pub(crate) content: Content,
    pub(crate) write_refs: u32,
    pub(crate) read_refs: u32,
    pub(crate) closed: bool,
    /// Bytes currently charged to the resource tracker
    pub(crate) footprint: u64,
}
