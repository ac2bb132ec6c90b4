// src/core/errors.rs

//! The primary error type for the Herd: transient network errors, protocol
//! mismatches, MDB violations, and admin rejections are all ordinary
//! `Result` values; invariant breaks and resource exhaustion are fatal and
//! are raised via [`abort_with_stack`] instead of this enum.

use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum HerdError {
    /// A transient failure talking to a sub, image server, or object server.
    /// Recovered by the next scan cycle; never surfaced to an admin caller.
    #[error("transient error: {0}")]
    Transient(String),

    /// The peer returned something the Herd doesn't understand: an unknown
    /// sub status string, a malformed manifest, an unexpected RPC shape.
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// A generation of the MDB contained a problem (e.g. a duplicate
    /// hostname). The first occurrence wins; the error is still returned
    /// to the caller even though partial state was published.
    #[error("mdb violation: {0}")]
    MdbViolation(String),

    /// An administrative RPC was rejected; Herd state is unchanged.
    #[error("{0}")]
    AdminRejected(String),

    #[error("unknown sub: {0}")]
    UnknownSub(String),

    #[error("unknown image: {0}")]
    UnknownImage(String),

    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("http client error: {0}")]
    HttpClient(String),
}

impl From<std::io::Error> for HerdError {
    fn from(e: std::io::Error) -> Self {
        HerdError::Io(Arc::new(e))
    }
}

impl From<reqwest::Error> for HerdError {
    fn from(e: reqwest::Error) -> Self {
        HerdError::HttpClient(e.to_string())
    }
}

impl From<serde_json::Error> for HerdError {
    fn from(e: serde_json::Error) -> Self {
        HerdError::ProtocolMismatch(format!("json: {e}"))
    }
}

pub type HerdResult<T> = Result<T, HerdError>;
