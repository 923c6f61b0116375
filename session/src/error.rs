use crate::ScheduleError;
use common::ParseSizeError;
use protocol::ProtocolError;
use store::DataStoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("cannot create {needed} replicas, only {available} depots enabled")]
    InsufficientDepots { needed: usize, available: usize },

    #[error("no depots found for session, unable to continue")]
    NoDepots,

    #[error("block size must be greater than zero")]
    InvalidBlockSize,

    #[error("not a regular file: {0}")]
    NotAFile(String),

    #[error("no such directory: {0}")]
    PathNotFound(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("registry error: {0}")]
    Registry(#[from] DataStoreError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("size error: {0}")]
    Size(#[from] ParseSizeError),

    #[error("worker task failed: {0}")]
    Worker(String),
}
