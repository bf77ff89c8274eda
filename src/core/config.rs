use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::core::errors::{Result, XlbError};
use crate::data::DatumId;
use crate::workqueue::WorkType;

/// How a retrieve of a still-open container is answered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenReadPolicy {
    /// Only entries whose member has been written
    Snapshot,
    /// Committed entries plus reserved subscripts that have no member yet
    Live,
}

/// Runtime configuration shared by every rank of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Layout
    /// Number of server ranks (the last ranks of the run)
    pub nservers: usize,
    /// Number of worker ranks (the first ranks of the run)
    pub nworkers: usize,
    /// Work types accepted by Put/Get
    pub work_types: Vec<WorkType>,
    /// Reserved type that carries subscription notifications
    pub notification_type: WorkType,

    // Scheduling
    /// How often a starved server probes peers for work
    pub steal_interval: Duration,
    /// How often the master server runs a termination vote
    pub idle_check_interval: Duration,
    /// Maximum queued work units per server
    pub max_queued_units: usize,

    // Data store
    /// Maximum bytes of datum content per server
    pub max_memory_bytes: u64,
    /// Largest datum id any server may hand out
    pub id_limit: DatumId,
    /// Whether a plain insert may replace a present container entry
    pub allow_overwrite: bool,
    /// Answer mode for retrieves of open containers
    pub open_read: OpenReadPolicy,

    // Lifecycle
    /// Termination waits until no datum has open writer slots
    pub quiescence_requires_closed_data: bool,
    /// Abort terminates the calling process after broadcasting
    pub exit_on_abort: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nservers: 1,
            nworkers: 1,
            work_types: vec![0, 1],
            notification_type: 0,

            steal_interval: Duration::from_millis(5),
            idle_check_interval: Duration::from_millis(10),
            max_queued_units: 1_000_000,

            max_memory_bytes: 1024 * 1024 * 1024, // 1GB
            id_limit: DatumId::MAX,
            allow_overwrite: true,
            open_read: OpenReadPolicy::Snapshot,

            quiescence_requires_closed_data: true,
            exit_on_abort: true,
        }
    }
}

impl Config {
    /// Create a new builder for Config
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.nservers == 0 {
            return Err(XlbError::configuration_field(
                "at least one server is required",
                "nservers",
            ));
        }
        if self.nworkers == 0 {
            return Err(XlbError::configuration_field(
                "at least one worker is required",
                "nworkers",
            ));
        }
        if self.work_types.is_empty() {
            return Err(XlbError::configuration_field(
                "work_types cannot be empty",
                "work_types",
            ));
        }
        let unique: HashSet<_> = self.work_types.iter().collect();
        if unique.len() != self.work_types.len() {
            return Err(XlbError::configuration_field(
                "work_types contains duplicates",
                "work_types",
            ));
        }
        if !self.work_types.contains(&self.notification_type) {
            return Err(XlbError::configuration_field(
                format!(
                    "notification_type {} is not one of the work types",
                    self.notification_type
                ),
                "notification_type",
            ));
        }
        if self.steal_interval.is_zero() || self.idle_check_interval.is_zero() {
            return Err(XlbError::configuration(
                "steal_interval and idle_check_interval must be non-zero",
            ));
        }
        if self.max_queued_units == 0 {
            return Err(XlbError::configuration_field(
                "max_queued_units must be greater than 0",
                "max_queued_units",
            ));
        }
        if self.max_memory_bytes == 0 {
            return Err(XlbError::configuration_field(
                "max_memory_bytes must be greater than 0",
                "max_memory_bytes",
            ));
        }
        if self.id_limit < self.nservers as DatumId {
            return Err(XlbError::configuration_field(
                "id_limit leaves no ids for some servers",
                "id_limit",
            ));
        }
        Ok(())
    }

    /// Total number of ranks in the run
    pub fn size(&self) -> usize {
        self.nservers + self.nworkers
    }

    pub fn accepts_type(&self, work_type: WorkType) -> bool {
        self.work_types.contains(&work_type)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| XlbError::Io {
            operation: format!("read {}", path.as_ref().display()),
            source: e,
        })?;
        Self::from_yaml_str(&text)
    }

    /// Tight timers, no process exit on abort; suited to tests
    pub fn development() -> Self {
        Self {
            steal_interval: Duration::from_millis(2),
            idle_check_interval: Duration::from_millis(5),
            max_queued_units: 10_000,
            max_memory_bytes: 64 * 1024 * 1024,
            exit_on_abort: false,
            ..Default::default()
        }
    }

    /// Relaxed timers and larger capacities for long runs
    pub fn production() -> Self {
        Self {
            steal_interval: Duration::from_millis(20),
            idle_check_interval: Duration::from_millis(100),
            max_queued_units: 50_000_000,
            max_memory_bytes: 16 * 1024 * 1024 * 1024,
            ..Default::default()
        }
    }
}

/// Builder for Config
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Start from an existing configuration
    pub fn from_config(config: Config) -> Self {
        Self { config }
    }

    pub fn servers(mut self, nservers: usize) -> Self {
        self.config.nservers = nservers;
        self
    }

    pub fn workers(mut self, nworkers: usize) -> Self {
        self.config.nworkers = nworkers;
        self
    }

    /// Set the type vector; the notification type is added when missing
    pub fn work_types(mut self, types: impl IntoIterator<Item = WorkType>) -> Self {
        self.config.work_types = types.into_iter().collect();
        self
    }

    pub fn notification_type(mut self, work_type: WorkType) -> Self {
        self.config.notification_type = work_type;
        self
    }

    pub fn steal_interval(mut self, interval: Duration) -> Self {
        self.config.steal_interval = interval;
        self
    }

    pub fn idle_check_interval(mut self, interval: Duration) -> Self {
        self.config.idle_check_interval = interval;
        self
    }

    pub fn max_queued_units(mut self, units: usize) -> Self {
        self.config.max_queued_units = units;
        self
    }

    pub fn max_memory_bytes(mut self, bytes: u64) -> Self {
        self.config.max_memory_bytes = bytes;
        self
    }

    pub fn id_limit(mut self, limit: DatumId) -> Self {
        self.config.id_limit = limit;
        self
    }

    pub fn allow_overwrite(mut self, allow: bool) -> Self {
        self.config.allow_overwrite = allow;
        self
    }

    pub fn open_read(mut self, policy: OpenReadPolicy) -> Self {
        self.config.open_read = policy;
        self
    }

    pub fn quiescence_requires_closed_data(mut self, required: bool) -> Self {
        self.config.quiescence_requires_closed_data = required;
        self
    }

    pub fn exit_on_abort(mut self, exit: bool) -> Self {
        self.config.exit_on_abort = exit;
        self
    }

    /// Build and validate the configuration
    pub fn build(mut self) -> Result<Config> {
        if !self.config.work_types.contains(&self.config.notification_type) {
            self.config.work_types.push(self.config.notification_type);
        }
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.size(), 2);
    }

    #[test]
    fn test_presets_validate() {
        assert!(Config::development().validate().is_ok());
        assert!(!Config::development().exit_on_abort);
        assert!(Config::production().validate().is_ok());
    }

    #[test]
    fn test_validation_errors() {
        let mut config = Config::default();

        config.nservers = 0;
        assert!(config.validate().is_err());
        config.nservers = 2;

        config.work_types = vec![3, 3];
        assert!(config.validate().is_err());

        config.work_types = vec![1, 2];
        config.notification_type = 9;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, XlbError::Configuration { field: Some(ref f), .. } if f == "notification_type"));

        config.notification_type = 1;
        config.id_limit = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builder_adds_notification_type() {
        let config = Config::builder()
            .servers(3)
            .workers(8)
            .work_types([5, 6])
            .notification_type(99)
            .allow_overwrite(false)
            .build()
            .unwrap();

        assert_eq!(config.nservers, 3);
        assert_eq!(config.nworkers, 8);
        assert_eq!(config.work_types, vec![5, 6, 99]);
        assert!(!config.allow_overwrite);
    }

    #[test]
    fn test_yaml_partial_document() {
        let yaml = "nservers: 2\nnworkers: 6\nwork_types: [0, 5]\nopen_read: live\n";
        let config = Config::from_yaml_str(yaml).unwrap();
        assert_eq!(config.nservers, 2);
        assert_eq!(config.nworkers, 6);
        assert_eq!(config.open_read, OpenReadPolicy::Live);
        // untouched fields fall back to defaults
        assert!(config.allow_overwrite);
    }

    #[test]
    fn test_yaml_invalid_rejected() {
        assert!(Config::from_yaml_str("nservers: 0\n").is_err());
        assert!(Config::from_yaml_str("nservers: [").is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "nworkers: 4\nmax_queued_units: 12").unwrap();
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.nworkers, 4);
        assert_eq!(config.max_queued_units, 12);
    }
}
