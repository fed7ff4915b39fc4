//! Error types shared by the registry, the backend clients and the CSI adapters.

use thiserror::Error;
use tonic::Status;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{kind} not found: {name}")]
    NotFound { kind: String, name: String },

    #[error("{kind} already exists: {name}")]
    AlreadyExists { kind: String, name: String },

    #[error("uuid {uuid} is already bound to {existing}")]
    AlreadyBound { uuid: String, existing: String },

    /// The object is in a state that forbids the operation (e.g. deleting an attached volume).
    #[error("Conflict on {name}: {reason}")]
    Conflict { name: String, reason: String },

    /// A write lost an optimistic-concurrency race.
    #[error("Stale resource version for {0}")]
    VersionConflict(String),

    #[error("Gave up updating {0} after repeated version conflicts")]
    RetriesExhausted(String),

    #[error("Not ready: {0}")]
    NotReady(String),

    #[error("Volume {volume} is attached to node {node}")]
    Occupied { volume: String, node: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("HTTP request error: {0}")]
    Http(reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::NotFound { kind: kind.into(), name: name.into() }
    }

    pub fn already_exists(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::AlreadyExists { kind: kind.into(), name: name.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Errors a reconcile loop should requeue on.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::Conflict { .. }
                | Error::VersionConflict(_)
                | Error::RetriesExhausted(_)
                | Error::NotReady(_)
                | Error::Backend(_)
                | Error::DeadlineExceeded(_)
                | Error::Kube(_)
                | Error::Http(_)
                | Error::Io(_)
        )
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() { Error::DeadlineExceeded(err.to_string()) } else { Error::Http(err) }
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        let message = err.to_string();
        match err {
            Error::NotFound { .. } => Status::not_found(message),
            Error::AlreadyExists { .. } | Error::AlreadyBound { .. } => {
                Status::already_exists(message)
            }
            Error::Conflict { .. } | Error::VersionConflict(_) => Status::aborted(message),
            Error::NotReady(_) | Error::Occupied { .. } => Status::unavailable(message),
            Error::InvalidArgument(_) => Status::invalid_argument(message),
            Error::DeadlineExceeded(_) => Status::deadline_exceeded(message),
            _ => Status::internal(message),
        }
    }
}
