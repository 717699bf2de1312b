//! Transfer methods: client-side jobs that turn metric updates and cron
//! ticks into new samples.

pub mod cron;
mod index;
mod runtime;
mod schedule;
mod transaction;
mod transfer_method;

use telemetra_core::ValidationError;
use telemetra_store::StoreError;
use thiserror::Error;

pub use cron::{parse_field, CronSchedule, LocalTime};
pub use index::{IndexConfig, JobStatus, TransferMethodsIndex};
pub use runtime::{samples_to_messages, send_samples};
pub use schedule::{OnUpdateSchedule, Schedule};
pub use transaction::Transaction;
pub use transfer_method::{JobArg, JobContext, JobFn, JobFuture, TransferMethod};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("malformed cron expression: {0:?}")]
    Syntax(String),
    #[error("cron field {0:?} never matches")]
    EmptyField(String),
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("job failed: {0}")]
    Failed(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
