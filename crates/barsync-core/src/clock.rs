//! Market-time source.
//!
//! Planning and gap computation read "now" through [`Clock`] so catch-up and
//! keep-alive decisions can be replayed deterministically.

use std::fmt::Debug;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::UtcDateTime;

pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> UtcDateTime;
}

/// Wall-clock UTC.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> UtcDateTime {
        UtcDateTime::now()
    }
}

/// Manually advanced clock shared between clones.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<UtcDateTime>>,
}

impl ManualClock {
    pub fn new(start: UtcDateTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, now: UtcDateTime) {
        *self.now.lock() = now;
    }

    pub fn advance_seconds(&self, seconds: i64) {
        let mut now = self.now.lock();
        *now = now.add_seconds(seconds);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> UtcDateTime {
        *self.now.lock()
    }
}
