//! Error types for the action engine
//!
//! Library-level operations return [`EngineError`]. Application edges (config
//! loading, CLI, actor handle) wrap these in `anyhow` with context.

use thiserror::Error;

/// Errors produced by the action engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Missing or malformed button/set configuration
    ///
    /// Inside the engine these are logged at debug level and treated as no-ops.
    /// They only surface when parsing user input at the console edge.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// No live module handle for an instance id
    #[error("unknown instance: {0}")]
    UnknownInstance(String),

    /// A module rejected a run/update/delete call
    #[error("dispatch to '{instance}' failed: {source}")]
    Dispatch {
        instance: String,
        #[source]
        source: anyhow::Error,
    },

    /// The embedded database failed
    #[error("persistence error: {0}")]
    Persistence(#[from] sled::Error),

    /// Stored data could not be (de)serialized
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The engine actor is no longer running
    #[error("engine actor shut down")]
    ActorClosed,
}

pub type Result<T> = std::result::Result<T, EngineError>;
