//! Dispatch pipeline: intake, scheduling, per-device processing, delivery
//! ledger and retries, plus the storage and queue backends they run on.

pub mod directory;
pub mod intake;
pub mod ledger;
pub mod memory;
pub mod policy;
pub mod processor;
pub mod queue;
pub mod quiet_hours;
pub mod retry;
pub mod scheduler;
pub mod store;
