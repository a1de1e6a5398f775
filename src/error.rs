//! Error taxonomy for the fleet control plane.
//!
//! Every component-level operation returns `Result<T, FleetError>`. The five
//! variants mirror the propagation policy: `Validation` and `Capacity` are
//! reported straight back to the caller with no state mutated; `External`
//! wraps a failed `VMDriver` call with the operation that failed; `Integrity`
//! covers persistence hiccups that the in-memory state survives; `Transport`
//! covers WebSocket read/write/parse failures that end a client connection.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("no warm slot available")]
    Capacity,

    #[error("{context}: {source}")]
    External {
        context: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("persistence error: {0}")]
    Integrity(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl FleetError {
    pub fn external(context: impl Into<String>, source: anyhow::Error) -> Self {
        FleetError::External {
            context: context.into(),
            source,
        }
    }

    /// HTTP/WS-facing classification used by handlers to pick a status code.
    pub fn kind(&self) -> &'static str {
        match self {
            FleetError::Validation(_) => "validation",
            FleetError::Capacity => "capacity",
            FleetError::External { .. } => "external",
            FleetError::Integrity(_) => "integrity",
            FleetError::Transport(_) => "transport",
            FleetError::NotFound(_) => "not_found",
        }
    }
}

pub type FleetResult<T> = Result<T, FleetError>;
