use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MapredError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Attempt not found: {0}")]
    AttemptNotFound(String),

    #[error("Worker not found: {0}")]
    WorkerNotFound(String),

    #[error("User code error: {0}")]
    UserCode(String),

    #[error("Worker unavailable: {0}")]
    WorkerUnavailable(String),

    #[error("Deadline exceeded: {0}")]
    Timeout(String),

    #[error("Blob store error on '{path}': {source}")]
    BlobStore {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MapredError {
    /// Map to the gRPC status surfaced to clients.
    pub fn into_status(self) -> tonic::Status {
        match self {
            MapredError::BadRequest(msg) => tonic::Status::invalid_argument(msg),
            MapredError::JobNotFound(msg)
            | MapredError::AttemptNotFound(msg)
            | MapredError::WorkerNotFound(msg) => tonic::Status::not_found(msg),
            MapredError::WorkerUnavailable(msg) => tonic::Status::unavailable(msg),
            MapredError::Timeout(msg) => tonic::Status::deadline_exceeded(msg),
            MapredError::Grpc(status) => status,
            other => tonic::Status::internal(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, MapredError>;
