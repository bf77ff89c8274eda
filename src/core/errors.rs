use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::data::DatumId;

/// Closed status taxonomy returned by every operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Code {
    Success,
    /// Invalid arguments, writes to closed data, reference count underflow
    UserError,
    /// Unknown datum id or missing subscript
    NotFound,
    /// Transport failure, malformed message, capacity exhaustion
    Error,
    /// Issued after coordinated termination began
    Shutdown,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Code::Success => "SUCCESS",
            Code::UserError => "USER_ERROR",
            Code::NotFound => "NOT_FOUND",
            Code::Error => "ERROR",
            Code::Shutdown => "SHUTDOWN",
        };
        f.write_str(s)
    }
}

/// Unified error type for the whole runtime
#[derive(Debug, Error)]
pub enum XlbError {
    /// Caller mistakes: bad arguments, wrong kind, duplicate create
    #[error("Invalid request: {message}")]
    User {
        message: String,
        operation: Option<String>,
    },

    #[error("Not found: {what}")]
    NotFound { what: String },

    /// Write attempted against a datum whose writer slots are gone
    #[error("Datum <{id}> is closed")]
    Closed { id: DatumId },

    #[error("Reference count underflow on <{id}>: {counter} is {current}, cannot drop {requested}")]
    RefcountUnderflow {
        id: DatumId,
        counter: &'static str,
        current: u32,
        requested: u32,
    },

    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    #[error("Resource exhausted: {resource} (current: {current}, limit: {limit})")]
    ResourceExhaustion {
        resource: String,
        current: u64,
        limit: u64,
    },

    #[error("Transport failure: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// A peer sent something that makes no sense at this point of the protocol
    #[error("Protocol violation: {message}")]
    Protocol { message: String },

    #[error("Shutdown in progress")]
    Shutdown,

    #[error("Run aborted with code {code}")]
    Aborted { code: i32 },

    /// Error produced on another rank and carried back over the wire
    #[error("{code}: {message}")]
    Remote { code: Code, message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl XlbError {
    /// Create a user error
    pub fn user<S: Into<String>>(message: S) -> Self {
        Self::User {
            message: message.into(),
            operation: None,
        }
    }

    /// Create a user error tagged with the operation that rejected it
    pub fn user_op<S: Into<String>, O: Into<String>>(operation: O, message: S) -> Self {
        Self::User {
            message: message.into(),
            operation: Some(operation.into()),
        }
    }

    pub fn not_found<S: Into<String>>(what: S) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn unknown_datum(id: DatumId) -> Self {
        Self::NotFound {
            what: format!("datum <{}>", id),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    /// Create a configuration error naming the offending field
    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a resource exhaustion error
    pub fn resource_exhausted<S: Into<String>>(resource: S, current: u64, limit: u64) -> Self {
        Self::ResourceExhaustion {
            resource: resource.into(),
            current,
            limit,
        }
    }

    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport {
            message: message.into(),
            source: None,
        }
    }

    pub fn transport_with_source<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        message: S,
        source: E,
    ) -> Self {
        Self::Transport {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a serialization error
    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Status code this error is reported as
    pub fn code(&self) -> Code {
        match self {
            Self::User { .. }
            | Self::Closed { .. }
            | Self::RefcountUnderflow { .. }
            | Self::Configuration { .. } => Code::UserError,
            Self::NotFound { .. } => Code::NotFound,
            Self::Shutdown => Code::Shutdown,
            Self::Remote { code, .. } => *code,
            Self::ResourceExhaustion { .. }
            | Self::Transport { .. }
            | Self::Serialization { .. }
            | Self::Io { .. }
            | Self::Protocol { .. }
            | Self::Aborted { .. }
            | Self::Internal { .. } => Code::Error,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::User { .. } => "user",
            Self::NotFound { .. } => "not_found",
            Self::Closed { .. } => "closed",
            Self::RefcountUnderflow { .. } => "refcount",
            Self::Configuration { .. } => "configuration",
            Self::ResourceExhaustion { .. } => "resource",
            Self::Transport { .. } => "transport",
            Self::Serialization { .. } => "serialization",
            Self::Io { .. } => "io",
            Self::Protocol { .. } => "protocol",
            Self::Shutdown => "shutdown",
            Self::Aborted { .. } => "aborted",
            Self::Remote { .. } => "remote",
            Self::Internal { .. } => "internal",
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.code() == Code::Shutdown
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, XlbError>;

/// Error as it travels inside a response frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub code: Code,
    pub message: String,
}

impl From<&XlbError> for WireError {
    fn from(err: &XlbError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl WireError {
    /// Rebuild the caller-side error; shutdown keeps its dedicated variant
    pub fn into_error(self) -> XlbError {
        match self.code {
            Code::Shutdown => XlbError::Shutdown,
            code => XlbError::Remote {
                code,
                message: self.message,
            },
        }
    }
}

impl From<std::io::Error> for XlbError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            operation: "io_operation".to_string(),
            source: err,
        }
    }
}

impl From<bincode::Error> for XlbError {
    fn from(err: bincode::Error) -> Self {
        Self::serialization("bincode", err)
    }
}

impl From<serde_yaml::Error> for XlbError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}

impl From<serde_json::Error> for XlbError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_mapping() {
        assert_eq!(XlbError::user("bad").code(), Code::UserError);
        assert_eq!(XlbError::Closed { id: 4 }.code(), Code::UserError);
        assert_eq!(XlbError::unknown_datum(9).code(), Code::NotFound);
        assert_eq!(XlbError::Shutdown.code(), Code::Shutdown);
        assert_eq!(XlbError::resource_exhausted("memory", 10, 5).code(), Code::Error);
        assert_eq!(XlbError::Aborted { code: 2 }.code(), Code::Error);
    }

    #[test]
    fn test_wire_roundtrip_keeps_code() {
        let err = XlbError::RefcountUnderflow {
            id: 7,
            counter: "write",
            current: 0,
            requested: 1,
        };
        let wire = WireError::from(&err);
        assert_eq!(wire.code, Code::UserError);
        assert!(wire.message.contains("<7>"));

        let back = wire.into_error();
        assert_eq!(back.code(), Code::UserError);
        assert_eq!(back.category(), "remote");
    }

    #[test]
    fn test_shutdown_survives_wire() {
        let wire = WireError::from(&XlbError::Shutdown);
        assert!(wire.into_error().is_shutdown());
    }

    #[test]
    fn test_code_display() {
        assert_eq!(Code::UserError.to_string(), "USER_ERROR");
        assert_eq!(Code::NotFound.to_string(), "NOT_FOUND");
    }
}
