//! Keeping the snapshot fresh: task bookkeeping, the shared rate budget,
//! the tick-based scheduler and its background driver.

pub mod budget;
pub mod driver;
pub mod scheduler;
pub mod task;

pub use driver::{DriverEvent, SyncDriver};
pub use scheduler::{SyncEvent, SyncScheduler, TickReport};
pub use task::{SyncTask, TaskKind, TaskStatus};
