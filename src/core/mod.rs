// Infrastructure shared by servers and workers

pub mod config;
pub mod errors;
pub mod layout;
pub mod limits;

// Re-export commonly used types
pub use config::{Config, ConfigBuilder, OpenReadPolicy};
pub use errors::{Code, Result, WireError, XlbError};
pub use layout::{Layout, Rank};
pub use limits::{ResourceLimits, ResourceTracker};
