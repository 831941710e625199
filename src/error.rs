//! Error taxonomy for snapshot reconstruction.
//!
//! Each collaborator fails with its own `thiserror` enum; [`SnapshotError`]
//! is the request-level error every pipeline stage converts into, and
//! [`SnapshotError::status`] classifies it for the caller.

use std::io;

use thiserror::Error;

use crate::request::Status;

/// Result type alias for request-level operations.
pub type Result<T> = std::result::Result<T, SnapshotError>;

/// Malformed or truncated capture records.
#[derive(Error, Debug)]
pub enum ParseError {
    /// End of stream reached in the middle of a record.
    #[error("record truncated while reading {field}")]
    Truncated { field: &'static str },

    /// A field ended with the wrong delimiter.
    #[error("malformed {tag} record: {reason}")]
    Malformed { tag: &'static str, reason: &'static str },

    /// Timestamp field is not a decimal integer.
    #[error("invalid timestamp {0:?}")]
    Timestamp(String),

    /// Channel or source URL is not UTF-8.
    #[error("{field} is not valid UTF-8")]
    Utf8 { field: &'static str },

    /// Body requested before a record head was read.
    #[error("no pending record")]
    NoPendingRecord,

    /// The underlying (decompressing) reader failed.
    #[error("read failed: {0}")]
    Read(#[source] io::Error),
}

/// Failures of the discovery, fetch and decompression collaborators.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("fetch {key}: {source}")]
    Fetch { key: String, #[source] source: io::Error },

    #[error("read segment: {0}")]
    Read(#[source] io::Error),

    #[error("close {key}: {source}")]
    Close { key: String, #[source] source: io::Error },

    #[error("write {key}: {source}")]
    Write { key: String, #[source] source: io::Error },

    #[error("invalid segment key {0:?}")]
    InvalidKey(String),

    #[error("manifest {path}: {reason}")]
    Manifest { path: String, reason: String },

    #[error("prefetch worker: {0}")]
    Prefetch(String),

    /// A close failure observed while another storage error was pending.
    #[error("{close}, original error was: {primary}")]
    Compound { close: Box<StorageError>, primary: Box<StorageError> },
}

impl StorageError {
    /// Combine a close failure with the error that was already pending.
    pub fn compound(close: StorageError, primary: StorageError) -> Self {
        StorageError::Compound { close: Box::new(close), primary: Box::new(primary) }
    }
}

/// Semantic rejections from a state engine.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("no state engine for exchange {0:?}")]
    UnsupportedExchange(String),

    #[error("channel {channel}: malformed payload: {reason}")]
    Payload { channel: String, reason: String },
}

/// Formatter construction or rendering failures.
#[derive(Error, Debug)]
pub enum FormatterError {
    #[error("format {format:?} is not supported for exchange {exchange:?}")]
    Unsupported { exchange: String, format: String },

    #[error("channel {channel}: {reason}")]
    Render { channel: String, reason: String },
}

/// Request-level error.
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("{0}")]
    Validation(String),

    #[error("authorization failed: {0}")]
    Auth(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("corrupt capture: {0}")]
    Parse(ParseError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Formatter(#[from] FormatterError),

    #[error("request cancelled")]
    Cancelled,

    /// The usage meter could not record the charge.
    #[error("usage accounting failed: {0}")]
    Usage(String),

    /// Releasing a stream failed; `primary` holds the error that was already
    /// pending when the close happened, if any.
    #[error("{close}{}", describe_primary(.primary))]
    Close { close: StorageError, primary: Option<Box<SnapshotError>> },
}

fn describe_primary(primary: &Option<Box<SnapshotError>>) -> String {
    match primary {
        Some(p) => format!(", original error was: {p}"),
        None => String::new(),
    }
}

impl From<ParseError> for SnapshotError {
    fn from(err: ParseError) -> Self {
        match err {
            // decompression failures surface as reader errors
            ParseError::Read(source) => SnapshotError::Storage(StorageError::Read(source)),
            other => SnapshotError::Parse(other),
        }
    }
}

impl SnapshotError {
    pub fn validation(msg: impl Into<String>) -> Self {
        SnapshotError::Validation(msg.into())
    }

    /// Classify this error for the caller.
    pub fn status(&self) -> Status {
        match self {
            SnapshotError::Validation(_) => Status::Validation,
            SnapshotError::Auth(_) => Status::Auth,
            // unsupported exchange/format is detected at setup, before any replay
            SnapshotError::Engine(EngineError::UnsupportedExchange(_))
            | SnapshotError::Formatter(FormatterError::Unsupported { .. }) => Status::Validation,
            SnapshotError::Close { primary: Some(p), .. } => p.status(),
            _ => Status::Internal,
        }
    }
}

/// Merge the outcome of releasing a resource into the primary result.
///
/// A close failure never replaces a pending error silently: both are kept.
pub fn merge_close<T>(primary: Result<T>, close: std::result::Result<(), StorageError>) -> Result<T> {
    match (primary, close) {
        (result, Ok(())) => result,
        (Ok(_), Err(close)) => Err(SnapshotError::Close { close, primary: None }),
        (Err(primary), Err(close)) => {
            Err(SnapshotError::Close { close, primary: Some(Box::new(primary)) })
        }
    }
}
