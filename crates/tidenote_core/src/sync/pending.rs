//! Activity entries whose records are not visible yet.
//!
//! An activity line can arrive before the log bytes it points at (sync
//! tools deliver files independently). Such entries are parked here and
//! retried with a doubling delay; nothing ever waits on them.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use crate::config::SyncConfig;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PendingKey {
    pub sd_id: String,
    pub note_id: String,
    pub instance_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    /// Highest sequence announced for this (note, instance).
    pub seq: u64,
    /// Merges attempted so far without the sequence becoming visible.
    pub attempts: u32,
    pub next_attempt: Instant,
}

/// Outcome of re-checking one pending entry after a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingCheck {
    Resolved,
    Deferred(Duration),
    GaveUp,
}

#[derive(Debug, Default)]
pub struct PendingSet {
    entries: BTreeMap<PendingKey, PendingEntry>,
}

impl PendingSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record that `instance` announced `seq` for a note. The note becomes
    /// due immediately.
    pub fn observe(&mut self, sd_id: &str, note_id: &str, instance_id: &str, seq: u64, now: Instant) {
        let key = PendingKey {
            sd_id: sd_id.to_string(),
            note_id: note_id.to_string(),
            instance_id: instance_id.to_string(),
        };
        let entry = self.entries.entry(key).or_insert(PendingEntry {
            seq,
            attempts: 0,
            next_attempt: now,
        });
        if seq > entry.seq {
            entry.seq = seq;
        }
        entry.next_attempt = now;
    }

    /// Notes with at least one entry due at `now`, as (sd, note) pairs.
    pub fn due_notes(&self, now: Instant) -> Vec<(String, String)> {
        let due: BTreeSet<(String, String)> = self
            .entries
            .iter()
            .filter(|(_, e)| e.next_attempt <= now)
            .map(|(k, _)| (k.sd_id.clone(), k.note_id.clone()))
            .collect();
        due.into_iter().collect()
    }

    /// Entries of one note.
    pub fn for_note(&self, sd_id: &str, note_id: &str) -> Vec<(PendingKey, u64)> {
        self.entries
            .iter()
            .filter(|(k, _)| k.sd_id == sd_id && k.note_id == note_id)
            .map(|(k, e)| (k.clone(), e.seq))
            .collect()
    }

    /// Compare an entry with what the merge made visible.
    pub fn check(
        &mut self,
        key: &PendingKey,
        visible_seq: u64,
        config: &SyncConfig,
        now: Instant,
    ) -> PendingCheck {
        let Some(entry) = self.entries.get_mut(key) else {
            return PendingCheck::Resolved;
        };
        if visible_seq >= entry.seq {
            self.entries.remove(key);
            return PendingCheck::Resolved;
        }
        entry.attempts += 1;
        if entry.attempts >= config.pending_max_attempts {
            self.entries.remove(key);
            return PendingCheck::GaveUp;
        }
        let delay = config.retry_delay(entry.attempts);
        entry.next_attempt = now + delay;
        PendingCheck::Deferred(delay)
    }

    /// Push every entry of a note back, e.g. after a transient read error.
    pub fn defer_note(&mut self, sd_id: &str, note_id: &str, config: &SyncConfig, now: Instant) {
        for (key, entry) in self.entries.iter_mut() {
            if key.sd_id == sd_id && key.note_id == note_id {
                entry.attempts += 1;
                entry.next_attempt = now + config.retry_delay(entry.attempts);
            }
        }
    }

    /// Forget every entry of a note.
    pub fn remove_note(&mut self, sd_id: &str, note_id: &str) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|k, _| !(k.sd_id == sd_id && k.note_id == note_id));
        before - self.entries.len()
    }

    pub fn remove_sd(&mut self, sd_id: &str) {
        self.entries.retain(|k, _| k.sd_id != sd_id);
    }

    /// Earliest time an entry becomes due.
    pub fn next_due(&self) -> Option<Instant> {
        self.entries.values().map(|e| e.next_attempt).min()
    }

    /// SD id → note ids with pending entries.
    pub fn by_sd(&self) -> BTreeMap<String, Vec<String>> {
        let mut map: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for key in self.entries.keys() {
            map.entry(key.sd_id.clone())
                .or_default()
                .insert(key.note_id.clone());
        }
        map.into_iter()
            .map(|(sd, notes)| (sd, notes.into_iter().collect()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(note: &str, instance: &str) -> PendingKey {
        PendingKey {
            sd_id: "sd".into(),
            note_id: note.into(),
            instance_id: instance.into(),
        }
    }

    #[test]
    fn test_observe_keeps_highest_seq() {
        let now = Instant::now();
        let mut set = PendingSet::new();
        set.observe("sd", "n1", "peer", 3, now);
        set.observe("sd", "n1", "peer", 2, now);
        assert_eq!(set.for_note("sd", "n1"), vec![(key("n1", "peer"), 3)]);
    }

    #[test]
    fn test_deferral_backs_off_then_gives_up() {
        let config = SyncConfig {
            pending_max_attempts: 3,
            ..SyncConfig::default()
        };
        let now = Instant::now();
        let mut set = PendingSet::new();
        set.observe("sd", "n1", "peer", 5, now);
        let k = key("n1", "peer");

        assert_eq!(
            set.check(&k, 4, &config, now),
            PendingCheck::Deferred(Duration::from_millis(200))
        );
        assert!(set.due_notes(now).is_empty());
        assert_eq!(set.next_due(), Some(now + Duration::from_millis(200)));

        assert_eq!(
            set.check(&k, 4, &config, now),
            PendingCheck::Deferred(Duration::from_millis(400))
        );
        assert_eq!(set.check(&k, 4, &config, now), PendingCheck::GaveUp);
        assert!(set.is_empty());
    }

    #[test]
    fn test_resolved_when_visible() {
        let now = Instant::now();
        let mut set = PendingSet::new();
        set.observe("sd", "n1", "peer", 5, now);
        assert_eq!(
            set.check(&key("n1", "peer"), 5, &SyncConfig::default(), now),
            PendingCheck::Resolved
        );
        assert!(set.is_empty());
    }

    #[test]
    fn test_by_sd_groups_notes() {
        let now = Instant::now();
        let mut set = PendingSet::new();
        set.observe("sd", "n2", "a", 1, now);
        set.observe("sd", "n1", "a", 1, now);
        set.observe("sd", "n1", "b", 1, now);
        set.observe("other", "n9", "a", 1, now);

        let map = set.by_sd();
        assert_eq!(map["sd"], vec!["n1".to_string(), "n2".to_string()]);
        assert_eq!(map["other"], vec!["n9".to_string()]);
        assert_eq!(set.remove_note("sd", "n1"), 2);
        assert_eq!(set.len(), 2);
    }
}
