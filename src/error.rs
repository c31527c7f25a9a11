//! Unified error type for the control boundary.
//!
//! `CoreError` is the single error type returned by every control-adapter
//! command. It serializes as `{ "kind": "...", "message": "..." }` so an
//! external control surface can programmatically distinguish error
//! categories and map them onto HTTP status codes.

use serde::ser::SerializeStruct;

/// Control-boundary error covering the full failure taxonomy.
///
/// Each variant maps to a distinct failure domain. Callers receive a JSON
/// object with `kind` (variant name) and `message` (human-readable
/// description).
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Malformed profile descriptor, out-of-range fields, invalid protocol tag.
    #[error("{0}")]
    Validation(String),

    /// Unknown port or profile name.
    #[error("{0}")]
    NotFound(String),

    /// Profile name already exists.
    #[error("{0}")]
    Duplicate(String),

    /// Update touches a field that is immutable while the profile runs.
    #[error("{0}")]
    ImmutableWhileRunning(String),

    /// The port's link is down or the port cannot be resolved for sending.
    #[error("{0}")]
    PortUnavailable(String),

    /// The transmitter's scheduling queue is saturated.
    #[error("{0}")]
    Overflow(String),

    /// Frame exceeds the port MTU plus VLAN allowance.
    #[error("{0}")]
    Oversize(String),

    /// The descriptor cannot be encoded as an on-wire frame.
    #[error("{0}")]
    Unencodable(String),

    /// A control command exceeded its deadline; partial mutations were
    /// rolled back.
    #[error("{0}")]
    Timeout(String),

    /// I/O and OS-level errors (raw sockets, persistence, shell-outs).
    #[error("{0}")]
    Io(String),
}

impl CoreError {
    /// Returns the error kind as a string matching the variant name.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "Validation",
            CoreError::NotFound(_) => "NotFound",
            CoreError::Duplicate(_) => "Duplicate",
            CoreError::ImmutableWhileRunning(_) => "ImmutableWhileRunning",
            CoreError::PortUnavailable(_) => "PortUnavailable",
            CoreError::Overflow(_) => "Overflow",
            CoreError::Oversize(_) => "Oversize",
            CoreError::Unencodable(_) => "Unencodable",
            CoreError::Timeout(_) => "Timeout",
            CoreError::Io(_) => "Io",
        }
    }
}

/// Custom Serialize: produces `{ "kind": "Variant", "message": "..." }`.
impl serde::Serialize for CoreError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut s = serializer.serialize_struct("CoreError", 2)?;
        s.serialize_field("kind", self.kind())?;
        s.serialize_field("message", &self.to_string())?;
        s.end()
    }
}

// ---- From implementations for ergonomic error conversion ----

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Io(err.to_string())
    }
}

impl From<anyhow::Error> for CoreError {
    fn from(err: anyhow::Error) -> Self {
        CoreError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Validation(err.to_string())
    }
}
