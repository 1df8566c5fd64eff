//! Priority policy: fixed mapping from notification priority to queueing
//! behaviour.
//!
//! | priority | rank | max attempts | base delay |
//! |----------|------|--------------|------------|
//! | critical | 1    | 10           | 10 s       |
//! | high     | 2    | 8            | 30 s       |
//! | medium   | 3    | 5            | 2 min      |
//! | low      | 4    | 3            | 5 min      |
//! | unknown  | 3    | 5            | 1 min      |
//!
//! Lower rank is served first.

use beacon_common::types::Priority;

use crate::queue::{BackoffPolicy, EnqueueOptions};

/// Queueing parameters for one priority tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchPolicy {
    pub rank: u8,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl DispatchPolicy {
    /// Policy applied to priority labels that do not name a known tier.
    pub const FALLBACK: DispatchPolicy = DispatchPolicy {
        rank: 3,
        max_attempts: 5,
        base_delay_ms: 60_000,
    };

    pub const fn for_priority(priority: Priority) -> Self {
        match priority {
            Priority::Critical => DispatchPolicy {
                rank: 1,
                max_attempts: 10,
                base_delay_ms: 10_000,
            },
            Priority::High => DispatchPolicy {
                rank: 2,
                max_attempts: 8,
                base_delay_ms: 30_000,
            },
            Priority::Medium => DispatchPolicy {
                rank: 3,
                max_attempts: 5,
                base_delay_ms: 120_000,
            },
            Priority::Low => DispatchPolicy {
                rank: 4,
                max_attempts: 3,
                base_delay_ms: 300_000,
            },
        }
    }

    /// Look up a raw priority label, falling back to [`Self::FALLBACK`].
    pub fn for_label(label: &str) -> Self {
        label
            .parse::<Priority>()
            .map(Self::for_priority)
            .unwrap_or(Self::FALLBACK)
    }

    /// Queue options for a job of this tier, optionally delayed.
    pub fn enqueue_options(&self, delay_ms: Option<u64>) -> EnqueueOptions {
        EnqueueOptions {
            delay_ms,
            priority_rank: self.rank,
            max_attempts: self.max_attempts,
            backoff: BackoffPolicy::exponential(self.base_delay_ms),
        }
    }
}

impl From<Priority> for DispatchPolicy {
    fn from(priority: Priority) -> Self {
        Self::for_priority(priority)
    }
}
