//! Timer-driven passes feeding the job manager.
//!
//! - [`DailySync`] works through the persistent pending queue once a day, slowly
//! - [`PeriodicSync`] re-queues every unfinished book on a fixed cadence

mod daily;
mod periodic;
mod schedule;

pub use daily::{DailyQueueStats, DailyReport, DailySettings, DailySync};
pub use periodic::{PeriodicReport, PeriodicSettings, PeriodicStats, PeriodicSync};
pub use schedule::is_due;

use std::sync::{Mutex, MutexGuard};

/// Priority given to unfinished books by the daily pass.
pub const UNFINISHED_PRIORITY: i32 = 1;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
