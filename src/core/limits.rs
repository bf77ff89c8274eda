use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::config::Config;
use crate::core::errors::{Result, XlbError};

/// Per-server capacity limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Maximum bytes of datum content held by one server
    pub max_memory_bytes: u64,
}

impl ResourceLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_memory_bytes: config.max_memory_bytes,
        }
    }
}

/// Usage tracker owned by a server's data store.
///
/// The server loop is the only mutator, so plain counters are enough.
#[derive(Debug)]
pub struct ResourceTracker {
    limits: ResourceLimits,
    memory_usage: u64,
    peak_memory_usage: u64,
    limit_violations: u64,
}

impl ResourceTracker {
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            limits,
            memory_usage: 0,
            peak_memory_usage: 0,
            limit_violations: 0,
        }
    }

    /// Account for `bytes` more datum content, failing past the limit
    pub fn allocate_memory(&mut self, bytes: u64) -> Result<()> {
        let new_total = self.memory_usage + bytes;
        if new_total > self.limits.max_memory_bytes {
            self.limit_violations += 1;
            warn!(
                "Memory limit reached: {} + {} > {}",
                self.memory_usage, bytes, self.limits.max_memory_bytes
            );
            return Err(XlbError::resource_exhausted(
                "memory",
                new_total,
                self.limits.max_memory_bytes,
            ));
        }
        self.memory_usage = new_total;
        self.peak_memory_usage = self.peak_memory_usage.max(new_total);
        debug!("Allocated {} bytes, total: {} bytes", bytes, new_total);
        Ok(())
    }

    pub fn deallocate_memory(&mut self, bytes: u64) {
        self.memory_usage = self.memory_usage.saturating_sub(bytes);
    }

    /// Replace an accounted size with a new one
    pub fn resize(&mut self, old: u64, new: u64) -> Result<()> {
        if new > old {
            self.allocate_memory(new - old)
        } else {
            self.deallocate_memory(old - new);
            Ok(())
        }
    }

    pub fn memory_usage(&self) -> u64 {
        self.memory_usage
    }

    pub fn peak_memory_usage(&self) -> u64 {
        self.peak_memory_usage
    }

    pub fn limit_violations(&self) -> u64 {
        self.limit_violations
    }
}
