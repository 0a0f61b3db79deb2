use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum HailstormError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("An execution cycle is already started for project '{0}'")]
    ExecutionCycleExists(String),

    #[error("No started execution cycle for project '{0}'")]
    ExecutionCycleNotExists(String),

    #[error("More than one active master agent for plan '{0}'")]
    MasterSlaveConflict(String),

    #[error("Transient failure on host '{host}': {reason}")]
    TransientHost { host: String, reason: String },

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Setup failed: {0}")]
    Setup(String),

    #[error("Identity file conflict: {0}")]
    IdentityFileConflict(String),

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Incorrect command usage: {0}")]
    IncorrectCommand(String),
}

impl HailstormError {
    /// Whether the retry layer may re-attempt the failed operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, HailstormError::TransientHost { .. })
    }

    /// Shorthand for a transient host failure.
    pub fn transient(host: impl Into<String>, reason: impl Into<String>) -> Self {
        HailstormError::TransientHost {
            host: host.into(),
            reason: reason.into(),
        }
    }
}

impl Serialize for HailstormError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
