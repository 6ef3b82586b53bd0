//! Per-context bookkeeping.
//!
//! Contexts are labels, not state: every execution starts from scratch no
//! matter which context id it carries. The registry only records when a
//! context was first and last used and how many executions it has seen.

mod registry;

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

pub use registry::{ContextMetadata, ContextRegistry};

/// A `SystemTime` that serializes as `{secs_since_epoch, nanos_since_epoch}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    /// Seconds since the Unix epoch.
    pub secs_since_epoch: u64,
    /// Nanoseconds within the second.
    pub nanos_since_epoch: u32,
}

impl Timestamp {
    /// The current time.
    #[must_use]
    pub fn now() -> Self {
        SystemTime::now().into()
    }
}

impl From<SystemTime> for Timestamp {
    fn from(time: SystemTime) -> Self {
        let since_epoch = time
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            secs_since_epoch: since_epoch.as_secs(),
            nanos_since_epoch: since_epoch.subsec_nanos(),
        }
    }
}

impl From<Timestamp> for SystemTime {
    fn from(time: Timestamp) -> Self {
        Self::UNIX_EPOCH + std::time::Duration::new(time.secs_since_epoch, time.nanos_since_epoch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_both_ways() {
        let now = SystemTime::now();
        let back: SystemTime = Timestamp::from(now).into();
        assert_eq!(back, now);
    }

    #[test]
    fn orders_by_time() {
        let early = Timestamp {
            secs_since_epoch: 10,
            nanos_since_epoch: 999,
        };
        let late = Timestamp {
            secs_since_epoch: 11,
            nanos_since_epoch: 0,
        };
        assert!(early < late);
    }
}
