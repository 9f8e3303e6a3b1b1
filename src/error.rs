//! Error taxonomy for redcache operations.
//!
//! Every fallible operation returns an explicit [`Result`]; no panics cross
//! module boundaries. Categories map to where a failure originates: caller
//! input, the path index, the external archive tool, the persistent store,
//! plain filesystem I/O, or the binary decoders.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Caller passed something unusable (empty key, empty payload, bad size).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The path (or archive id) has no entry in the file map.
    #[error("not indexed: {0}")]
    NotIndexed(String),

    /// The archive tool failed: non-zero exit, stderr output, or timeout.
    #[error("archive tool failed: {0}")]
    ExternalTool(String),

    /// The persistent store rejected an operation.
    #[error("storage failure: {0}")]
    Storage(#[from] heed::Error),

    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    /// A structurally required field is missing or out of range.
    #[error("decode failed: {0}")]
    Decode(String),
}

impl Error {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn tool(msg: impl Into<String>) -> Self {
        Self::ExternalTool(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
