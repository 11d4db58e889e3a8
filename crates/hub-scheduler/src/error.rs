//! Scheduler errors

use hub_storage::StorageError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
