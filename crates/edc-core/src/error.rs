//! Error handling for the edge data center simulator
//!
//! Provides a unified error type and result type shared by the core types and
//! the simulation models.

/// Result type alias for simulator operations
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the simulator
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration detected before the simulation starts
    #[error("Configuration error: {0}")]
    InvalidConfiguration(String),

    /// The speculative view of a processing unit drifted from its real state
    #[error("Protocol desynchronization: {0}")]
    Desync(String),

    /// A message was addressed to a destination with no routing entry
    #[error("Routing error: {0}")]
    Routing(String),

    /// Engine contract violation (causality, unexpected scheduling)
    #[error("Internal error: {0}")]
    Internal(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Create a protocol desynchronization error
    pub fn desync(msg: impl Into<String>) -> Self {
        Self::Desync(msg.into())
    }

    /// Create a routing error
    pub fn routing(msg: impl Into<String>) -> Self {
        Self::Routing(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the error invalidates the running simulation.
    ///
    /// Configuration errors surface at construction time, before any simulated
    /// time has elapsed. A message addressed to an unmapped index can arrive at
    /// any instant and aborts the run like a desync.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Desync(_) | Error::Routing(_) | Error::Internal(_))
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Error::InvalidConfiguration(_) => "configuration",
            Error::Desync(_) => "desync",
            Error::Routing(_) => "routing",
            Error::Internal(_) => "internal",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Yaml(_) => "yaml",
            Error::Other(_) => "other",
        }
    }
}

/// Extension trait for adding context to Results
pub trait ErrorContext<T> {
    /// Add context to an error
    fn with_context(self, context: impl Into<String>) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: Into<Error>,
{
    fn with_context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let original_error = e.into();
            Error::Other(anyhow::anyhow!("{}: {}", context.into(), original_error))
        })
    }
}
