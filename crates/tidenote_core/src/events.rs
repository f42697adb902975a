//! Change notifications for subscribers.
//!
//! Local mutations and merged remote changes are both announced as
//! [`ChangeEvent`]s through an [`EventRegistry`], so a UI reacts to them the
//! same way.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::sync::SyncStatus;

/// Where a change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(rename_all = "snake_case")]
pub enum ChangeOrigin {
    /// Made by this instance.
    Local,
    /// Merged from another instance's logs.
    Remote,
}

/// Events emitted when notes, folders or sync state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(tag = "type")]
pub enum ChangeEvent {
    /// A note was created.
    NoteCreated {
        sd_id: String,
        note_id: String,
        origin: ChangeOrigin,
    },

    /// Note content, comments or metadata changed.
    NoteUpdated {
        sd_id: String,
        note_id: String,
        origin: ChangeOrigin,
    },

    /// A note was soft-deleted (`permanent: false`) or tombstoned.
    NoteDeleted {
        sd_id: String,
        note_id: String,
        permanent: bool,
    },

    /// A note moved between storage directories.
    NoteMoved {
        note_id: String,
        from_sd: String,
        to_sd: String,
    },

    /// The folder tree of an SD changed.
    FolderUpdated {
        sd_id: String,
        #[serde(default)]
        folder_id: Option<String>,
        origin: ChangeOrigin,
    },

    /// Sync health changed.
    SyncStatusChanged { status: SyncStatus },
}

impl ChangeEvent {
    /// The storage directory this event concerns, if any.
    pub fn sd_id(&self) -> Option<&str> {
        match self {
            ChangeEvent::NoteCreated { sd_id, .. }
            | ChangeEvent::NoteUpdated { sd_id, .. }
            | ChangeEvent::NoteDeleted { sd_id, .. }
            | ChangeEvent::FolderUpdated { sd_id, .. } => Some(sd_id),
            ChangeEvent::NoteMoved { to_sd, .. } => Some(to_sd),
            ChangeEvent::SyncStatusChanged { .. } => None,
        }
    }
}

/// A unique identifier for a subscription.
pub type SubscriptionId = u64;

/// Callback function type for change events.
///
/// Callbacks should not block; they run on whichever thread produced the change.
pub type EventCallback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Thread-safe registry of change subscribers.
pub struct EventRegistry {
    callbacks: RwLock<HashMap<SubscriptionId, EventCallback>>,
    next_id: AtomicU64,
}

impl EventRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            callbacks: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe to change events. Returns an id for [`Self::unsubscribe`].
    pub fn subscribe(&self, callback: EventCallback) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut callbacks = self.callbacks.write().unwrap_or_else(|e| e.into_inner());
        callbacks.insert(id, callback);
        id
    }

    /// Returns `true` if the subscription was found and removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut callbacks = self.callbacks.write().unwrap_or_else(|e| e.into_inner());
        callbacks.remove(&id).is_some()
    }

    /// Deliver an event to every subscriber.
    ///
    /// A panicking callback does not affect the others.
    pub fn emit(&self, event: &ChangeEvent) {
        let callbacks: Vec<EventCallback> = {
            let callbacks = self.callbacks.read().unwrap_or_else(|e| e.into_inner());
            callbacks.values().cloned().collect()
        };
        for callback in callbacks {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback(event);
            }));
            if result.is_err() {
                log::warn!("Change subscriber panicked while handling {:?}", event);
            }
        }
    }

    /// Number of active subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.callbacks
            .read()
            .map(|callbacks| callbacks.len())
            .unwrap_or(0)
    }
}

impl Default for EventRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRegistry")
            .field("subscriber_count", &self.subscriber_count())
            .field("next_id", &self.next_id.load(Ordering::SeqCst))
            .finish()
    }
}
