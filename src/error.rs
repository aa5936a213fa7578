//! Error types for dispatchq.

use std::time::Duration;

use thiserror::Error;

use crate::model::WorkerId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("dispatcher is closed")]
    Closed,

    #[error("timed out after {0:?} waiting for a result")]
    Timeout(Duration),

    #[error("work item was cancelled before a result was delivered")]
    Cancelled,

    #[error("worker {worker} inbound queue is full")]
    Saturated { worker: WorkerId },

    #[error("operation failed: {0:#}")]
    Operation(anyhow::Error),

    #[error("operation panicked: {0}")]
    Panicked(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the failure came from the operation itself rather than the pool.
    pub fn is_operation_failure(&self) -> bool {
        matches!(self, Error::Operation(_) | Error::Panicked(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
