use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowError {
    // Raised by user code inside a lifecycle phase
    #[error("Node error: {0}")]
    Node(String),

    #[error("Fallback failed for node '{node}': {source}")]
    Fallback {
        node: String,
        #[source]
        source: Box<FlowError>,
    },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    #[error("Invalid retry policy: {0}")]
    InvalidRetry(String),

    #[error("Duplicate successor on node '{node}' for action '{action}'")]
    DuplicateSuccessor { node: String, action: String },

    #[error("Node not found: {0}")]
    UnknownNode(String),

    #[error("Flow '{0}' cannot be computed directly")]
    NotComputable(String),

    // Run errors
    #[error("Flow exceeded max steps ({limit})")]
    StepLimit { limit: usize },

    #[error("Flow run timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("Parallel branch failed: {0}")]
    Join(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // TOML errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl FlowError {
    /// Shorthand for a failure raised by node code.
    pub fn node(message: impl Into<String>) -> Self {
        Self::Node(message.into())
    }

    /// Whether a compute-phase failure of this kind feeds the retry loop.
    ///
    /// Other kinds skip the remaining attempts and go straight to the fallback.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Node(_) | Self::Io(_) | Self::Json(_))
    }

    /// Errors raised while building or validating a graph, as opposed to running it.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::ConfigNotFound(_)
                | Self::InvalidRetry(_)
                | Self::DuplicateSuccessor { .. }
                | Self::UnknownNode(_)
                | Self::NotComputable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;
