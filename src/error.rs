//! Typed error taxonomy for the envelope pipeline.
//!
//! This enum exists because the Processor needs to *branch* on error kind
//! (retry vs. short-circuit vs. pause) and the CLI needs to map error kind
//! to an exit code (spec.md §6); an opaque error-chain type can't do either
//! cheaply. `thiserror` gives every variant a `Display` impl for the audit
//! log and CLI's `eprintln!`-style reporting without a separate message enum.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Kms(#[from] KmsError),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("format error: {0}")]
    Format(String),

    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("bounds error: {0}")]
    Bounds(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline exceeded waiting for {0}")]
    Deadline(String),
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error kind should drive a queue requeue-with-backoff
    /// (as opposed to short-circuiting straight to the failed directory, or
    /// pausing without consuming a retry attempt).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Kms(_) | Error::Io { .. } | Error::Integrity(_))
    }

    /// Whether this error kind should pause the item without bumping the
    /// attempt counter (the file may become processable again on its own).
    pub fn is_pausing(&self) -> bool {
        matches!(self, Error::Cancelled | Error::Deadline(_))
    }
}

#[derive(Error, Debug)]
pub enum KmsError {
    #[error("kms unreachable: {0}")]
    Unreachable(String),

    #[error("kms authentication denied: {0}")]
    AuthDenied(String),

    #[error("kms returned an empty response")]
    EmptyResponse,

    #[error("kms returned a malformed response: {0}")]
    MalformedResponse(String),

    #[error("kms response missing field '{0}'")]
    MissingField(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
