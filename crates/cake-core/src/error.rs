//! Error types for cake-core

use thiserror::Error;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for cake-core
#[derive(Error, Debug)]
pub enum Error {
    /// Recall store errors
    #[error("Recall store error: {0}")]
    Recall(#[from] RecallError),

    /// Voice gate errors
    #[error("Voice gate error: {0}")]
    Voice(#[from] VoiceError),

    /// Command interception errors
    #[error("Intercept error: {0}")]
    Intercept(#[from] InterceptError),

    /// Snapshot errors
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Adapter boundary errors
    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Runtime errors (task wiring, channel failures, shutdown races)
    #[error("Runtime error: {0}")]
    Runtime(String),
}

/// Recall store errors
#[derive(Error, Debug)]
pub enum RecallError {
    /// Underlying SQLite failure
    #[error("database error: {0}")]
    Database(String),

    /// Store file could not be opened
    #[error("store unavailable at {path}: {cause}")]
    Unavailable { path: String, cause: String },

    /// Blocking task was cancelled or panicked
    #[error("store task failed: {0}")]
    TaskJoin(String),
}

/// Voice gate errors
#[derive(Error, Debug)]
pub enum VoiceError {
    /// Reference corpus file missing or unreadable
    #[error("corpus unavailable at {path}: {cause}")]
    CorpusUnavailable { path: String, cause: String },

    /// Corpus parsed to zero usable entries
    #[error("corpus is empty")]
    EmptyCorpus,
}

/// Command interceptor errors
#[derive(Error, Debug)]
pub enum InterceptError {
    /// Audit log could not be opened or written
    #[error("audit write failed: {0}")]
    Audit(String),
}

/// Snapshot manager errors
#[derive(Error, Debug)]
pub enum SnapshotError {
    /// Snapshot id not present in the index
    #[error("snapshot not found: {0}")]
    NotFound(String),

    /// Another capture is already running
    #[error("snapshot already in progress")]
    InProgress,

    /// Git subprocess failed
    #[error("git {operation} failed: {stderr}")]
    Git { operation: String, stderr: String },

    /// Capture exceeded its time budget
    #[error("snapshot capture timed out after {0} ms")]
    Timeout(u64),

    /// Snapshot payload could not be read or written
    #[error("snapshot storage error: {0}")]
    Storage(String),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file missing or unreadable
    #[error("config unreadable at {path}: {cause}")]
    Unreadable { path: String, cause: String },

    /// TOML syntax or shape error
    #[error("config parse error: {0}")]
    Parse(String),

    /// Schema version not supported
    #[error("unsupported config version: {0}")]
    Version(String),

    /// One or more values out of their allowed range
    #[error("invalid config: {}", violations.join("; "))]
    Invalid { violations: Vec<String> },
}

/// Adapter boundary errors
#[derive(Error, Debug)]
pub enum AdapterError {
    /// Injection did not complete within its budget
    #[error("inject timed out after {0} ms")]
    InjectTimeout(u64),

    /// Adapter rejected or failed the injection
    #[error("inject failed via {adapter}: {cause}")]
    InjectFailed { adapter: String, cause: String },

    /// Every registered adapter failed
    #[error("all adapters failed; last: {0}")]
    AllFailed(String),

    /// A pre_execute hook vetoed the command
    #[error("execution vetoed by hook: {0}")]
    Vetoed(String),
}
