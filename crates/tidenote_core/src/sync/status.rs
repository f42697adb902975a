//! Sync health reported to the host application.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// Where an SD is in its sync cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum SyncPhase {
    #[default]
    Idle,
    /// Reading deletion, move and activity logs.
    Scanning,
    /// Re-merging the notes the scan found.
    Merging,
}

/// Snapshot of the orchestrator's state.
///
/// Only meant for health indicators; nothing should block on it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct SyncStatus {
    /// Activity entries still waiting for their record to become visible.
    pub pending_merge_count: usize,
    /// SD id → note ids with pending entries.
    pub pending: BTreeMap<String, Vec<String>>,
    /// A pass is running.
    pub in_progress: bool,
    /// SDs whose root could not be reached on the last pass. Configured SDs
    /// that were never opened appear by root path instead of id.
    pub degraded_sds: Vec<String>,
}

impl SyncStatus {
    /// Nothing pending and every SD reachable.
    pub fn is_healthy(&self) -> bool {
        self.pending_merge_count == 0 && self.degraded_sds.is_empty()
    }
}
