// Sharded data store: datums, containers, reference counts and subscriptions

pub mod ids;
pub mod model;
pub mod notify;
pub mod store;

pub use ids::IdAllocator;
pub use model::{CreateSpec, DataKind, DataValue, DatumId, Entry, RefCounts, NULL_ID};
pub use notify::{Event, Notification};
pub use store::{DataStore, Effects, ReferenceStore, StoreCounters, SubscribeStatus};
