//! Trigger scheduling for the valet runtime: the wake-at-earliest loop,
//! retry policy, and the durable SQLite trigger store.

pub mod retry;
pub mod scheduler;
pub mod store;

pub use retry::RetryPolicy;
pub use scheduler::{SchedulerConfig, SchedulerHandle, SchedulerSignal, TriggerScheduler};
pub use store::SqliteTriggerStore;
