//! The merged per-note document.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use ts_rs::TS;
use yrs::types::Attrs;
use yrs::types::text::YChange;
use yrs::updates::decoder::Decode;
use yrs::{Any, Doc, GetString, Map, MapRef, ReadTxn, StateVector, Text, TextRef, Transact, Update};

use crate::clock::Stamp;
use crate::crdt_log::LogRecord;
use crate::crdt_log::record::base64_bytes;
use crate::error::{Result, TideError};
use crate::register::LwwRegister;

/// Name of the Y.Text holding the rich note content.
pub(crate) const CONTENT_TEXT_NAME: &str = "content";

/// Name of the Y.Map holding comment threads, keyed by thread id.
pub(crate) const COMMENTS_MAP_NAME: &str = "comments";

/// Name of the Y.Map holding replies, keyed by `thread:reply`.
pub(crate) const REPLIES_MAP_NAME: &str = "replies";

/// Characters of body text shown in a preview.
pub const PREVIEW_CHARS: usize = 200;

/// Title shown for a note with no title and no text.
pub const UNTITLED: &str = "Untitled";

/// A single-valued note field written by LWW.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "field", content = "value", rename_all = "snake_case")]
pub enum NoteField {
    Title(Option<String>),
    FolderId(Option<String>),
    /// Soft-delete time; `None` restores the note.
    DeletedAt(Option<i64>),
    Pinned(bool),
}

/// The payload of one record in a note log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NoteOp {
    /// A yrs v1 update for content and comments.
    Content {
        #[serde(with = "base64_bytes")]
        update: Vec<u8>,
    },
    /// An LWW register write, stamped by the record's clock and instance.
    Set { field: NoteField },
}

/// LWW fields of a note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteRegisters {
    pub title: LwwRegister<Option<String>>,
    pub folder_id: LwwRegister<Option<String>>,
    pub deleted_at: LwwRegister<Option<i64>>,
    pub pinned: LwwRegister<bool>,
}

impl Default for NoteRegisters {
    fn default() -> Self {
        Self {
            title: LwwRegister::new(None),
            folder_id: LwwRegister::new(None),
            deleted_at: LwwRegister::new(None),
            pinned: LwwRegister::new(false),
        }
    }
}

impl NoteRegisters {
    /// Apply one stamped write. Returns `true` if it won.
    pub fn apply(&mut self, field: &NoteField, stamp: Stamp) -> bool {
        match field {
            NoteField::Title(v) => self.title.set(v.clone(), stamp),
            NoteField::FolderId(v) => self.folder_id.set(v.clone(), stamp),
            NoteField::DeletedAt(v) => self.deleted_at.set(*v, stamp),
            NoteField::Pinned(v) => self.pinned.set(*v, stamp),
        }
    }

    /// Merge another replica's registers.
    pub fn merge(&mut self, other: &NoteRegisters) -> bool {
        let title = self.title.merge(&other.title);
        let folder = self.folder_id.merge(&other.folder_id);
        let deleted = self.deleted_at.merge(&other.deleted_at);
        let pinned = self.pinned.merge(&other.pinned);
        title || folder || deleted || pinned
    }

    /// Highest Lamport clock among the register stamps.
    pub fn max_clock(&self) -> u64 {
        [
            self.title.stamp(),
            self.folder_id.stamp(),
            self.deleted_at.stamp(),
            self.pinned.stamp(),
        ]
        .into_iter()
        .flatten()
        .map(|s| s.clock)
        .max()
        .unwrap_or(0)
    }
}

/// Summary of a note for listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct NoteSummary {
    pub id: String,
    pub sd_id: String,
    pub title: String,
    pub preview: String,
    pub folder_id: Option<String>,
    pub pinned: bool,
    /// Set while the note is in "recently deleted".
    pub deleted_at: Option<i64>,
    pub created_at: i64,
    pub modified_at: i64,
    pub comment_count: u32,
    pub open_comment_count: u32,
}

/// A run of content text sharing the same formatting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct TextRun {
    pub text: String,
    /// Names of the formatting attributes set on this run, sorted.
    pub marks: Vec<String>,
}

/// Everything a subscriber can observe, for change detection.
#[derive(Debug, PartialEq)]
struct Observed {
    state_vector: StateVector,
    content: String,
    comments: Vec<(String, String)>,
    replies: Vec<(String, String)>,
    registers: NoteRegisters,
}

/// A note's merged state: a yrs document plus LWW registers.
///
/// The yrs document holds:
/// - `content`: a Y.Text with formatting attributes
/// - `comments`: a Y.Map of thread id to JSON thread record
/// - `replies`: a Y.Map of `thread:reply` to JSON reply record
///
/// Text positions in this API count Unicode scalar values.
pub struct NoteDoc {
    note_id: String,
    pub(crate) doc: Doc,
    pub(crate) content: TextRef,
    pub(crate) comments: MapRef,
    pub(crate) replies: MapRef,
    registers: NoteRegisters,
    created_at: i64,
    modified_at: i64,
}

impl NoteDoc {
    /// Create an empty document.
    pub fn new(note_id: impl Into<String>) -> Self {
        let doc = Doc::new();
        let content = doc.get_or_insert_text(CONTENT_TEXT_NAME);
        let comments = doc.get_or_insert_map(COMMENTS_MAP_NAME);
        let replies = doc.get_or_insert_map(REPLIES_MAP_NAME);
        Self {
            note_id: note_id.into(),
            doc,
            content,
            comments,
            replies,
            registers: NoteRegisters::default(),
            created_at: 0,
            modified_at: 0,
        }
    }

    pub fn note_id(&self) -> &str {
        &self.note_id
    }

    pub fn registers(&self) -> &NoteRegisters {
        &self.registers
    }

    /// Earliest record time seen (ms), 0 if unknown.
    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    /// Latest record time seen (ms).
    pub fn modified_at(&self) -> i64 {
        self.modified_at
    }

    pub(crate) fn observe_times(&mut self, created_at: i64, modified_at: i64) {
        if created_at > 0 && (self.created_at == 0 || created_at < self.created_at) {
            self.created_at = created_at;
        }
        self.modified_at = self.modified_at.max(modified_at);
    }

    // ==================== Replay ====================

    /// Apply one record from any instance's log.
    pub fn apply_record(&mut self, record: &LogRecord<NoteOp>) -> Result<()> {
        match &record.op {
            NoteOp::Content { update } => self.apply_update(update)?,
            NoteOp::Set { field } => {
                self.registers
                    .apply(field, Stamp::new(record.clock, record.instance.as_str()));
            }
        }
        self.observe_times(record.timestamp, record.timestamp);
        Ok(())
    }

    /// Apply a yrs v1 update.
    pub fn apply_update(&self, update: &[u8]) -> Result<()> {
        let decoded = Update::decode_v1(update)
            .map_err(|e| TideError::Crdt(format!("Failed to decode update: {}", e)))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(decoded)
            .map_err(|e| TideError::Crdt(format!("Failed to apply update: {}", e)))
    }

    /// Apply a local register write.
    pub(crate) fn apply_field(&mut self, field: &NoteField, stamp: Stamp) -> bool {
        self.registers.apply(field, stamp)
    }

    /// Merge registers from a snapshot or another replica.
    pub(crate) fn merge_registers(&mut self, registers: &NoteRegisters) -> bool {
        self.registers.merge(registers)
    }

    /// Fold another replica of the same note into this one.
    ///
    /// Returns `true` if anything observable changed.
    pub fn merge_from(&mut self, other: &NoteDoc) -> Result<bool> {
        let before = self.observed();
        let diff = {
            let sv = self.doc.transact().state_vector();
            other.doc.transact().encode_state_as_update_v1(&sv)
        };
        self.apply_update(&diff)?;
        self.registers.merge(&other.registers);
        self.observe_times(other.created_at, other.modified_at);
        Ok(self.observed() != before)
    }

    fn observed(&self) -> Observed {
        let txn = self.doc.transact();
        let mut comments: Vec<(String, String)> = self
            .comments
            .iter(&txn)
            .map(|(k, v)| (k.to_string(), v.to_string(&txn)))
            .collect();
        comments.sort();
        let mut replies: Vec<(String, String)> = self
            .replies
            .iter(&txn)
            .map(|(k, v)| (k.to_string(), v.to_string(&txn)))
            .collect();
        replies.sort();
        Observed {
            state_vector: txn.state_vector(),
            content: self.content.get_string(&txn),
            comments,
            replies,
            registers: self.registers.clone(),
        }
    }

    // ==================== Encoding ====================

    /// Encode the full yrs state as one update.
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Run a local mutation and return the yrs update it produced.
    pub(crate) fn record_update<F>(&self, mutate: F) -> Vec<u8>
    where
        F: FnOnce(&mut yrs::TransactionMut, &Self),
    {
        let sv_before = self.doc.transact().state_vector();
        {
            let mut txn = self.doc.transact_mut();
            mutate(&mut txn, self);
        }
        self.doc.transact().encode_state_as_update_v1(&sv_before)
    }

    // ==================== Content ====================

    /// The plain text content.
    pub fn content(&self) -> String {
        let txn = self.doc.transact();
        self.content.get_string(&txn)
    }

    /// Content length in characters.
    pub fn content_len(&self) -> u32 {
        self.content().chars().count() as u32
    }

    /// Replace the content using a minimal prefix/suffix diff.
    ///
    /// Returns `None` if the content is unchanged.
    pub fn set_content(&self, new_content: &str) -> Option<Vec<u8>> {
        let current = self.content();
        if current == new_content {
            return None;
        }

        let common_prefix = current
            .chars()
            .zip(new_content.chars())
            .take_while(|(a, b)| a == b)
            .count();
        let current_tail: Vec<char> = current.chars().skip(common_prefix).collect();
        let new_tail: Vec<char> = new_content.chars().skip(common_prefix).collect();
        let common_suffix = current_tail
            .iter()
            .rev()
            .zip(new_tail.iter().rev())
            .take_while(|(a, b)| a == b)
            .count()
            .min(current_tail.len())
            .min(new_tail.len());

        let removed: String = current_tail[..current_tail.len() - common_suffix]
            .iter()
            .collect();
        let inserted: String = new_tail[..new_tail.len() - common_suffix].iter().collect();
        let start = byte_offset(&current, common_prefix as u32);

        Some(self.record_update(|txn, doc| {
            if !removed.is_empty() {
                doc.content.remove_range(txn, start, removed.len() as u32);
            }
            if !inserted.is_empty() {
                doc.content.insert(txn, start, &inserted);
            }
        }))
    }

    /// Insert `text` at character `index` (clamped to the end).
    pub fn insert_text(&self, index: u32, text: &str) -> Option<Vec<u8>> {
        if text.is_empty() {
            return None;
        }
        let at = byte_offset(&self.content(), index);
        Some(self.record_update(|txn, doc| doc.content.insert(txn, at, text)))
    }

    /// Delete `len` characters starting at `index`.
    pub fn delete_text(&self, index: u32, len: u32) -> Option<Vec<u8>> {
        let (start, byte_len) = byte_range(&self.content(), index, len);
        if byte_len == 0 {
            return None;
        }
        Some(self.record_update(|txn, doc| doc.content.remove_range(txn, start, byte_len)))
    }

    /// Set (`on`) or clear a formatting attribute over a character range.
    pub fn format_text(&self, index: u32, len: u32, mark: &str, on: bool) -> Option<Vec<u8>> {
        let (start, byte_len) = byte_range(&self.content(), index, len);
        if byte_len == 0 {
            return None;
        }
        let value = if on { Any::Bool(true) } else { Any::Null };
        let attrs: Attrs = HashMap::from([(Arc::<str>::from(mark), value)]);
        Some(self.record_update(|txn, doc| doc.content.format(txn, start, byte_len, attrs)))
    }

    /// Content split into runs of uniform formatting.
    pub fn formatted_runs(&self) -> Vec<TextRun> {
        let txn = self.doc.transact();
        self.content
            .diff(&txn, YChange::identity)
            .into_iter()
            .map(|d| {
                let mut marks: Vec<String> = d
                    .attributes
                    .map(|attrs| {
                        attrs
                            .iter()
                            .filter(|(_, v)| !matches!(v, Any::Null | Any::Bool(false)))
                            .map(|(k, _)| k.to_string())
                            .collect()
                    })
                    .unwrap_or_default();
                marks.sort();
                TextRun {
                    text: d.insert.to_string(&txn),
                    marks,
                }
            })
            .collect()
    }

    // ==================== Derived metadata ====================

    /// Title register if set, else the first non-empty line of content.
    pub fn title(&self) -> String {
        if let Some(title) = self.registers.title.get()
            && !title.trim().is_empty()
        {
            return title.trim().to_string();
        }
        self.content()
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| UNTITLED.to_string())
    }

    /// Body text after the title line, whitespace-collapsed and truncated.
    pub fn preview(&self) -> String {
        let content = self.content();
        let explicit_title = self
            .registers
            .title
            .get()
            .as_ref()
            .is_some_and(|t| !t.trim().is_empty());

        let mut lines = content.lines().map(str::trim).filter(|l| !l.is_empty());
        if !explicit_title {
            lines.next();
        }
        let body = lines.collect::<Vec<_>>().join(" ");
        body.split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .chars()
            .take(PREVIEW_CHARS)
            .collect()
    }

    /// Listing summary of this note.
    pub fn summary(&self, sd_id: &str) -> NoteSummary {
        let threads = self.comment_threads();
        let open = threads.iter().filter(|t| !t.resolved).count();
        NoteSummary {
            id: self.note_id.clone(),
            sd_id: sd_id.to_string(),
            title: self.title(),
            preview: self.preview(),
            folder_id: self.registers.folder_id.get().clone(),
            pinned: *self.registers.pinned.get(),
            deleted_at: *self.registers.deleted_at.get(),
            created_at: self.created_at,
            modified_at: self.modified_at,
            comment_count: threads.len() as u32,
            open_comment_count: open as u32,
        }
    }
}

impl std::fmt::Debug for NoteDoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoteDoc")
            .field("note_id", &self.note_id)
            .field("registers", &self.registers)
            .finish_non_exhaustive()
    }
}

/// Byte offset of character `index` in `s`, clamped to the end.
pub(crate) fn byte_offset(s: &str, index: u32) -> u32 {
    s.char_indices()
        .nth(index as usize)
        .map(|(b, _)| b)
        .unwrap_or(s.len()) as u32
}

/// Byte (start, len) of a character range, clamped to `s`.
pub(crate) fn byte_range(s: &str, index: u32, len: u32) -> (u32, u32) {
    let start = byte_offset(s, index);
    let end = byte_offset(s, index.saturating_add(len));
    (start, end - start)
}

/// Character index of byte offset `byte` in `s`.
pub(crate) fn char_index(s: &str, byte: u32) -> u32 {
    let byte = (byte as usize).min(s.len());
    s.char_indices().take_while(|(b, _)| *b < byte).count() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(instance: &str, seq: u64, clock: u64, op: NoteOp) -> LogRecord<NoteOp> {
        LogRecord::new(instance, seq, clock, op)
    }

    fn content_op(update: Vec<u8>) -> NoteOp {
        NoteOp::Content { update }
    }

    #[test]
    fn test_set_content_minimal_diff() {
        let doc = NoteDoc::new("n1");
        doc.set_content("Hello World").unwrap();
        doc.set_content("Hello Brave World").unwrap();
        assert_eq!(doc.content(), "Hello Brave World");
        assert!(doc.set_content("Hello Brave World").is_none());
    }

    #[test]
    fn test_multibyte_positions_count_characters() {
        let doc = NoteDoc::new("n1");
        doc.set_content("héllo wörld").unwrap();
        doc.insert_text(6, "big ").unwrap();
        assert_eq!(doc.content(), "héllo big wörld");
        doc.delete_text(0, 6).unwrap();
        assert_eq!(doc.content(), "big wörld");
        assert_eq!(doc.content_len(), 9);
    }

    #[test]
    fn test_concurrent_disjoint_edits_both_survive() {
        let base = NoteDoc::new("n1");
        let init = base.set_content("Hello World").unwrap();

        let a = NoteDoc::new("n1");
        a.apply_update(&init).unwrap();
        let b = NoteDoc::new("n1");
        b.apply_update(&init).unwrap();

        let ua = a.insert_text(0, ">> ").unwrap();
        let ub = b.insert_text(11, "!").unwrap();

        a.apply_update(&ub).unwrap();
        b.apply_update(&ua).unwrap();
        assert_eq!(a.content(), ">> Hello World!");
        assert_eq!(a.content(), b.content());
    }

    #[test]
    fn test_register_records_resolve_by_stamp() {
        let mut a = NoteDoc::new("n1");
        let mut b = NoteDoc::new("n1");
        let r1 = record("a", 1, 5, NoteOp::Set { field: NoteField::Title(Some("From A".into())) });
        let r2 = record("b", 1, 5, NoteOp::Set { field: NoteField::Title(Some("From B".into())) });

        a.apply_record(&r1).unwrap();
        a.apply_record(&r2).unwrap();
        b.apply_record(&r2).unwrap();
        b.apply_record(&r1).unwrap();

        // Equal clocks: the lexicographically greater instance wins.
        assert_eq!(a.title(), "From B");
        assert_eq!(b.title(), "From B");
    }

    #[test]
    fn test_derived_title_and_preview() {
        let doc = NoteDoc::new("n1");
        doc.set_content("\n  Shopping list \n- eggs\n- milk\n").unwrap();
        assert_eq!(doc.title(), "Shopping list");
        assert_eq!(doc.preview(), "- eggs - milk");

        let empty = NoteDoc::new("n2");
        assert_eq!(empty.title(), UNTITLED);
        assert_eq!(empty.preview(), "");
    }

    #[test]
    fn test_preview_truncated() {
        let doc = NoteDoc::new("n1");
        let body = "x".repeat(500);
        doc.set_content(&format!("Title\n{}", body)).unwrap();
        assert_eq!(doc.preview().chars().count(), PREVIEW_CHARS);
    }

    #[test]
    fn test_formatting_runs() {
        let doc = NoteDoc::new("n1");
        doc.set_content("plain bold plain").unwrap();
        doc.format_text(6, 4, "bold", true).unwrap();
        let runs = doc.formatted_runs();
        let bold: Vec<&TextRun> = runs.iter().filter(|r| r.marks == vec!["bold"]).collect();
        assert_eq!(bold.len(), 1);
        assert_eq!(bold[0].text, "bold");
    }

    #[test]
    fn test_merge_from_reports_change() {
        let mut a = NoteDoc::new("n1");
        let b = NoteDoc::new("n1");
        let u = b.set_content("text").unwrap();
        let mut r = record("b", 1, 1, content_op(u));
        r.timestamp = 1000;
        let mut c = NoteDoc::new("n1");
        c.apply_record(&r).unwrap();

        assert!(a.merge_from(&c).unwrap());
        assert_eq!(a.content(), "text");
        assert!(!a.merge_from(&c).unwrap());
        assert_eq!(a.modified_at(), 1000);
    }

    #[test]
    fn test_op_json_shape() {
        let op = NoteOp::Set {
            field: NoteField::FolderId(Some("f1".into())),
        };
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["kind"], "set");
        assert_eq!(json["field"]["field"], "folder_id");
        assert_eq!(json["field"]["value"], "f1");
    }
}
