// Core infrastructure modules
pub mod core;
pub mod logging;

// Server side: data store, work queue and the event loop tying them together
pub mod data;
pub mod server;
pub mod workqueue;

// Worker side and wiring
pub mod client;
pub mod runtime;
pub mod transport;

// Re-exports for convenience
pub use client::{Client, Subscription};
pub use crate::core::config::{Config, ConfigBuilder, OpenReadPolicy};
pub use crate::core::errors::{Code, Result, XlbError};
pub use crate::core::layout::{Layout, Rank};
pub use data::{CreateSpec, DataKind, DataValue, DatumId, Event, Notification, SubscribeStatus};
pub use runtime::{init, Cluster, Role, WorkerGroup};
pub use server::{Server, ServerStats};
pub use transport::{LocalEndpoint, LocalFabric, Transport};
pub use workqueue::{WorkType, WorkUnit};

use serde::{Deserialize, Serialize};

/// Library version triple
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub revision: u32,
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.revision)
    }
}

fn parse_component(s: &str) -> u32 {
    s.parse().unwrap_or(0)
}

/// Version of this build
pub fn version() -> Version {
    Version {
        major: parse_component(env!("CARGO_PKG_VERSION_MAJOR")),
        minor: parse_component(env!("CARGO_PKG_VERSION_MINOR")),
        revision: parse_component(env!("CARGO_PKG_VERSION_PATCH")),
    }
}
