//! Scheduler error types.

use buildit_core::ResourceId;
use buildit_db::DbError;
use thiserror::Error;

/// Errors raised by locks and lock configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("lock '{0}' is defined more than once with different settings")]
    DuplicateName(String),

    #[error("unknown lock: {0}")]
    UnknownLock(String),

    #[error("invalid access to lock '{lock}': {message}")]
    InvalidAccess { lock: String, message: String },

    #[error("lock '{0}' appears more than once in the same lock set")]
    DuplicateAccess(String),

    #[error("{consumer} already holds lock '{lock}'")]
    AlreadyHeld { lock: String, consumer: ResourceId },

    #[error("{consumer} does not hold lock '{lock}'")]
    NotHeld { lock: String, consumer: ResourceId },
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("store error: {0}")]
    Store(#[from] DbError),

    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    #[error(transparent)]
    Core(#[from] buildit_core::Error),

    #[error("unknown build: {0}")]
    UnknownBuild(ResourceId),
}

pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
