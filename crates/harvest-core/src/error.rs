use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("not initialized: run 'harvest init'")]
    NotInitialized,

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("invalid schedule '{expr}': {reason}")]
    InvalidSchedule { expr: String, reason: String },

    #[error("unknown timezone '{0}'")]
    UnknownTimezone(String),

    #[error("invalid branch name '{0}'")]
    InvalidBranch(String),

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("runtime '{0}' not found on PATH")]
    RuntimeNotFound(String),

    #[error("runtime version mismatch: expected {expected}, found '{found}'")]
    RuntimeVersionMismatch { expected: String, found: String },

    #[error("dependency manifest not found: {0}")]
    ManifestMissing(String),

    #[error("failed to spawn '{program}': {reason}")]
    SpawnFailed { program: String, reason: String },

    #[error("'{command}' failed ({status}): {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("crawl script exited with {status}")]
    ScriptFailed { status: String },

    #[error("crawl script timed out after {0}s")]
    ScriptTimedOut(u64),

    #[error("push rejected by remote: {0}")]
    PushRejected(String),

    #[error("run lock '{key}' still held after waiting {waited_secs}s")]
    LockTimeout { key: String, waited_secs: u64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl HarvestError {
    /// Whether a retry loop may try the failed operation again.
    ///
    /// Only transport-level failures of external commands qualify. A rejected
    /// push, a crashed crawl script, or a bad environment will fail the same
    /// way on the next attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HarvestError::CommandFailed { .. } | HarvestError::SpawnFailed { .. } | HarvestError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, HarvestError>;
