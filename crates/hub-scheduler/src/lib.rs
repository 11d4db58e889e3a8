//! Hub Scheduler
//!
//! Durable one-time (`runIn`) and recurring (`schedule`) invocations of
//! entity methods, persisted through a [`hub_storage::Repository`] and
//! reloaded at startup.

mod clock;
mod cron;
mod error;
mod recurrence;
mod scheduler;

pub use clock::{Clock, SystemClock, TokioClock};
pub use cron::CronExpression;
pub use error::{SchedulerError, SchedulerResult};
pub use recurrence::Recurrence;
pub use scheduler::{JobError, JobOptions, JobRunner, Scheduler};
