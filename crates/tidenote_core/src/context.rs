//! Explicit per-instance context passed into every store operation.

use std::sync::Arc;

use crate::clock::{LamportClock, Stamp};

/// Identity and logical clock of the running instance.
///
/// Stores never read ambient "current instance" state; callers pass a
/// context, so tests can run several instances side by side in one process.
#[derive(Debug, Clone)]
pub struct StoreContext {
    instance_id: Arc<str>,
    clock: Arc<LamportClock>,
}

impl StoreContext {
    /// Create a context for `instance_id` with a fresh clock.
    pub fn new(instance_id: impl Into<String>) -> Self {
        let id: String = instance_id.into();
        Self {
            instance_id: Arc::from(id),
            clock: Arc::new(LamportClock::new()),
        }
    }

    /// Create a context with a random instance id.
    pub fn generate() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string())
    }

    /// The instance id.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// The instance's Lamport clock.
    pub fn clock(&self) -> &LamportClock {
        &self.clock
    }

    /// Advance the clock and stamp a local write.
    pub fn next_stamp(&self) -> Stamp {
        Stamp::new(self.clock.tick(), self.instance_id.to_string())
    }
}
