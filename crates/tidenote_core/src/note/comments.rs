//! Comment threads anchored to note content.
//!
//! Threads live in the `comments` Y.Map and replies in the `replies` Y.Map,
//! both as JSON strings. A thread's anchor is a pair of yrs sticky indexes,
//! so it keeps pointing at the same text while other instances edit around it.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use ts_rs::TS;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Assoc, GetString, IndexedSequence, Map, StickyIndex, Transact};

use super::doc::{NoteDoc, byte_offset, char_index};
use crate::error::{Result, TideError};

/// Stored form of a thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ThreadRecord {
    id: String,
    author: String,
    body: String,
    created_at: i64,
    /// Base64 sticky index of the anchor start.
    start: Option<String>,
    /// Base64 sticky index of the anchor end.
    end: Option<String>,
    #[serde(default)]
    resolved: bool,
}

/// Stored form of a reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReplyRecord {
    id: String,
    thread_id: String,
    author: String,
    body: String,
    created_at: i64,
}

/// A resolved anchor range in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct CommentAnchor {
    pub start: u32,
    pub end: u32,
}

/// A reply within a thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct CommentReply {
    pub id: String,
    pub author: String,
    pub body: String,
    pub created_at: i64,
}

/// A comment thread as seen by a reader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct CommentThread {
    pub id: String,
    pub author: String,
    pub body: String,
    pub created_at: i64,
    /// `None` when the anchored text no longer exists.
    pub anchor: Option<CommentAnchor>,
    /// The text currently covered by the anchor.
    pub quoted_text: String,
    pub resolved: bool,
    pub replies: Vec<CommentReply>,
}

fn reply_key(thread_id: &str, reply_id: &str) -> String {
    format!("{}:{}", thread_id, reply_id)
}

impl NoteDoc {
    fn thread_record(&self, thread_id: &str) -> Option<ThreadRecord> {
        let txn = self.doc.transact();
        self.comments
            .get(&txn, thread_id)
            .and_then(|v| serde_json::from_str(&v.to_string(&txn)).ok())
    }

    /// Start a thread over characters `start..end`.
    pub fn add_comment(
        &self,
        thread_id: &str,
        author: &str,
        body: &str,
        start: u32,
        end: u32,
        created_at: i64,
    ) -> Result<Vec<u8>> {
        let text = self.content();
        let (start, end) = (start.min(end), start.max(end));
        let start_byte = byte_offset(&text, start);
        let end_byte = byte_offset(&text, end);

        let update = self.record_update(|txn, doc| {
            let encode = |sticky: Option<StickyIndex>| sticky.map(|s| STANDARD.encode(s.encode_v1()));
            let record = ThreadRecord {
                id: thread_id.to_string(),
                author: author.to_string(),
                body: body.to_string(),
                created_at,
                start: encode(doc.content.sticky_index(txn, start_byte, Assoc::After)),
                end: encode(doc.content.sticky_index(txn, end_byte, Assoc::Before)),
                resolved: false,
            };
            if let Ok(json) = serde_json::to_string(&record) {
                doc.comments.insert(txn, thread_id, json);
            }
        });
        Ok(update)
    }

    /// Add a reply to an existing thread.
    pub fn reply_to_comment(
        &self,
        thread_id: &str,
        reply_id: &str,
        author: &str,
        body: &str,
        created_at: i64,
    ) -> Result<Vec<u8>> {
        if self.thread_record(thread_id).is_none() {
            return Err(TideError::CommentNotFound(thread_id.to_string()));
        }
        let record = ReplyRecord {
            id: reply_id.to_string(),
            thread_id: thread_id.to_string(),
            author: author.to_string(),
            body: body.to_string(),
            created_at,
        };
        let json = serde_json::to_string(&record)?;
        let key = reply_key(thread_id, reply_id);
        Ok(self.record_update(|txn, doc| {
            doc.replies.insert(txn, key, json);
        }))
    }

    /// Mark a thread resolved or reopen it.
    pub fn resolve_comment(&self, thread_id: &str, resolved: bool) -> Result<Option<Vec<u8>>> {
        let mut record = self
            .thread_record(thread_id)
            .ok_or_else(|| TideError::CommentNotFound(thread_id.to_string()))?;
        if record.resolved == resolved {
            return Ok(None);
        }
        record.resolved = resolved;
        let json = serde_json::to_string(&record)?;
        Ok(Some(self.record_update(|txn, doc| {
            doc.comments.insert(txn, thread_id, json);
        })))
    }

    /// Remove a thread and its replies.
    pub fn delete_comment(&self, thread_id: &str) -> Result<Vec<u8>> {
        if self.thread_record(thread_id).is_none() {
            return Err(TideError::CommentNotFound(thread_id.to_string()));
        }
        let prefix = format!("{}:", thread_id);
        let reply_keys: Vec<String> = {
            let txn = self.doc.transact();
            self.replies
                .keys(&txn)
                .filter(|k| k.starts_with(&prefix))
                .map(str::to_string)
                .collect()
        };
        Ok(self.record_update(|txn, doc| {
            doc.comments.remove(txn, thread_id);
            for key in &reply_keys {
                doc.replies.remove(txn, key);
            }
        }))
    }

    /// Every thread with its current anchor, ordered by creation time.
    ///
    /// Replies whose thread was deleted are not shown.
    pub fn comment_threads(&self) -> Vec<CommentThread> {
        let txn = self.doc.transact();
        let text = self.content.get_string(&txn);

        let mut replies: Vec<ReplyRecord> = self
            .replies
            .iter(&txn)
            .filter_map(|(_, v)| serde_json::from_str(&v.to_string(&txn)).ok())
            .collect();
        replies.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let resolve = |encoded: &Option<String>| -> Option<u32> {
            let bytes = STANDARD.decode(encoded.as_ref()?).ok()?;
            let sticky = StickyIndex::decode_v1(&bytes).ok()?;
            let offset = sticky.get_offset(&txn)?;
            Some(char_index(&text, offset.index))
        };

        let mut threads: Vec<CommentThread> = self
            .comments
            .iter(&txn)
            .filter_map(|(_, v)| serde_json::from_str::<ThreadRecord>(&v.to_string(&txn)).ok())
            .map(|record| {
                let anchor = match (resolve(&record.start), resolve(&record.end)) {
                    (Some(start), Some(end)) if start < end => Some(CommentAnchor { start, end }),
                    _ => None,
                };
                let quoted_text = anchor
                    .map(|a| {
                        text.chars()
                            .skip(a.start as usize)
                            .take((a.end - a.start) as usize)
                            .collect()
                    })
                    .unwrap_or_default();
                let thread_replies = replies
                    .iter()
                    .filter(|r| r.thread_id == record.id)
                    .map(|r| CommentReply {
                        id: r.id.clone(),
                        author: r.author.clone(),
                        body: r.body.clone(),
                        created_at: r.created_at,
                    })
                    .collect();
                CommentThread {
                    id: record.id,
                    author: record.author,
                    body: record.body,
                    created_at: record.created_at,
                    anchor,
                    quoted_text,
                    resolved: record.resolved,
                    replies: thread_replies,
                }
            })
            .collect();
        threads.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        threads
    }
}
