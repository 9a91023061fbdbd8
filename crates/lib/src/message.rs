//! Message model and the optimistic/confirmed reconciliation log.
//!
//! Locally sent messages are appended immediately (optimistic, `sent_at` only);
//! the realtime feed later echoes them back with a server id and `created_at`.
//! `MessageLog::apply` merges both provenances into one ordered list.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who authored a message. `type` is a frontend-only field; the server does
/// not send it, so it stays optional on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Bot,
    Agent,
    Customer,
}

/// A chat message. Optimistic entries have `sent_at` but no `id`/`created_at`;
/// confirmed entries carry both from the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub body: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<MessageKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    /// Set on agent messages only (dashboard user id).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seen_at: Option<DateTime<Utc>>,
}

impl Message {
    /// Synthetic greeting shown before any real history exists. Stamped as
    /// already seen so it never triggers unseen notifications.
    pub fn bot(body: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            id: None,
            body: body.into(),
            kind: Some(MessageKind::Bot),
            customer_id: Some("bot".to_string()),
            user_id: None,
            sent_at: None,
            created_at: Some(at),
            seen_at: Some(at),
        }
    }

    /// Confirmed by the server (has a `created_at` timestamp).
    pub fn is_confirmed(&self) -> bool {
        self.created_at.is_some()
    }

    /// Agent-authored (has a dashboard user id).
    pub fn from_agent(&self) -> bool {
        self.user_id.is_some()
    }
}

/// Compare two optional timestamps at second granularity. Optimistic sends and
/// their server echoes are not sub-second synchronized, so anything finer
/// would never match.
pub fn sent_at_matches(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.timestamp() == b.timestamp(),
        _ => false,
    }
}

/// Sort confirmed history ascending by `created_at` (backend returns a
/// conversation's messages unsorted).
pub fn sort_by_created_at(mut messages: Vec<Message>) -> Vec<Message> {
    messages.sort_by_key(|m| m.created_at);
    messages
}

/// Truncate at the last word boundary before `max` characters, appending an
/// ellipsis. Used for unread-preview bodies.
pub fn shorten(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let prefix: String = s.chars().take(max + 1).collect();
    // No word boundary at all leaves just the ellipsis.
    let cut = prefix.rfind(' ').unwrap_or(0);
    format!("{}...", prefix[..cut].trim_end())
}

const PREVIEW_MAX_CHARS: usize = 140;
const PREVIEW_COMBINED_LIMIT: usize = 100;

/// Ordered, deduplicated message list with optimistic/confirmed merging.
#[derive(Debug, Default)]
pub struct MessageLog {
    messages: Vec<Message>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Replace the whole list (initial history load).
    pub fn replace(&mut self, messages: Vec<Message>) {
        self.messages = messages;
    }

    /// Append a locally sent message before any network confirmation. The
    /// returned clone carries the `sent_at` stamp used for later matching.
    pub fn append_optimistic(
        &mut self,
        body: impl Into<String>,
        customer_id: Option<String>,
        sent_at: DateTime<Utc>,
    ) -> Message {
        let message = Message {
            id: None,
            body: body.into(),
            kind: Some(MessageKind::Customer),
            customer_id,
            user_id: None,
            sent_at: Some(sent_at),
            created_at: None,
            seen_at: None,
        };
        self.messages.push(message.clone());
        message
    }

    /// Merge a message delivered by the realtime feed.
    ///
    /// A confirmed message whose id is already present replaces that entry
    /// (re-delivery is a no-op in effect). Otherwise an unconfirmed entry with
    /// the same body and a `sent_at` within the same second is replaced in
    /// place, preserving list order; with no match the message is appended.
    /// Returns true when an existing entry was replaced.
    pub fn apply(&mut self, incoming: Message) -> bool {
        if let Some(id) = incoming.id.as_deref() {
            if let Some(existing) = self
                .messages
                .iter_mut()
                .find(|m| m.id.as_deref() == Some(id))
            {
                *existing = incoming;
                return true;
            }
        }
        let slot = self.messages.iter_mut().find(|m| {
            !m.is_confirmed()
                && sent_at_matches(m.sent_at, incoming.sent_at)
                && m.body == incoming.body
        });
        match slot {
            Some(existing) => {
                *existing = incoming;
                true
            }
            None => {
                self.messages.push(incoming);
                false
            }
        }
    }

    /// Stamp `seen_at` on every message that lacks one. Existing stamps are
    /// never altered. Returns how many messages were stamped.
    pub fn mark_all_seen(&mut self, at: DateTime<Utc>) -> usize {
        let mut stamped = 0;
        for m in &mut self.messages {
            if m.seen_at.is_none() {
                m.seen_at = Some(at);
                stamped += 1;
            }
        }
        stamped
    }

    /// First agent message without a `seen_at` stamp, if any.
    pub fn first_unseen_agent_message(&self) -> Option<&Message> {
        self.messages
            .iter()
            .find(|m| m.seen_at.is_none() && m.from_agent())
    }

    /// True when some agent message is still unseen.
    pub fn has_unseen_agent_messages(&self) -> bool {
        self.first_unseen_agent_message().is_some()
    }

    /// Unseen messages an embedder badge would preview: skip seen messages and
    /// the customer's own (by id match, or optimistic customer sends), take the
    /// first two with shortened bodies, and drop to one when the combined
    /// preview runs past the combined character limit.
    pub fn unread_preview(&self, customer_id: Option<&str>) -> Vec<Message> {
        let unread: Vec<Message> = self
            .messages
            .iter()
            .filter(|m| {
                if m.seen_at.is_some() {
                    return false;
                }
                let is_me = (m.customer_id.is_some() && m.customer_id.as_deref() == customer_id)
                    || (m.sent_at.is_some() && m.kind == Some(MessageKind::Customer));
                !is_me
            })
            .take(2)
            .map(|m| Message {
                body: shorten(&m.body, PREVIEW_MAX_CHARS),
                ..m.clone()
            })
            .collect();
        let chars: usize = unread.iter().map(|m| m.body.len()).sum();
        if chars > PREVIEW_COMBINED_LIMIT {
            unread.into_iter().take(1).collect()
        } else {
            unread
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn agent_message(id: &str, body: &str, created: i64) -> Message {
        Message {
            id: Some(id.to_string()),
            body: body.to_string(),
            kind: None,
            customer_id: None,
            user_id: Some(1),
            sent_at: None,
            created_at: Some(ts(created)),
            seen_at: None,
        }
    }

    #[test]
    fn echo_replaces_optimistic_entry_in_place() {
        let mut log = MessageLog::new();
        log.replace(vec![agent_message("m0", "hello", 0)]);
        let sent = log.append_optimistic("hi", Some("cust-1".to_string()), ts(10));
        assert_eq!(log.len(), 2);

        // Server echo carries sub-second skew but lands in the same second.
        let echo = Message {
            id: Some("m1".to_string()),
            created_at: Some(ts(11)),
            sent_at: Some(ts(10)),
            ..sent.clone()
        };
        let replaced = log.apply(echo);
        assert!(replaced);
        assert_eq!(log.len(), 2);
        assert_eq!(log.messages()[1].id.as_deref(), Some("m1"));
        assert!(log.messages()[1].is_confirmed());
    }

    #[test]
    fn apply_is_idempotent_for_confirmed_messages() {
        let mut log = MessageLog::new();
        let msg = agent_message("m1", "hey", 0);
        log.apply(msg.clone());
        log.apply(msg);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn unmatched_message_is_appended() {
        let mut log = MessageLog::new();
        log.append_optimistic("hi", None, ts(0));
        // Same second, different body: must not be treated as the echo.
        let other = Message {
            sent_at: Some(ts(0)),
            ..agent_message("m2", "different", 1)
        };
        assert!(!log.apply(other));
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn sort_orders_history_ascending() {
        let sorted = sort_by_created_at(vec![
            agent_message("b", "2", 5),
            agent_message("a", "1", 1),
            agent_message("c", "3", 9),
        ]);
        let ids: Vec<_> = sorted.iter().map(|m| m.id.as_deref().unwrap()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn mark_all_seen_never_restamps() {
        let mut log = MessageLog::new();
        let mut seen = agent_message("m1", "old", 0);
        seen.seen_at = Some(ts(1));
        log.replace(vec![seen, agent_message("m2", "new", 2)]);

        assert_eq!(log.mark_all_seen(ts(50)), 1);
        assert_eq!(log.messages()[0].seen_at, Some(ts(1)));
        assert_eq!(log.messages()[1].seen_at, Some(ts(50)));
        assert_eq!(log.mark_all_seen(ts(99)), 0);
    }

    #[test]
    fn unread_preview_skips_own_and_seen_messages() {
        let mut log = MessageLog::new();
        log.replace(vec![agent_message("m1", "are you there?", 0)]);
        log.append_optimistic("yes", Some("cust-1".to_string()), ts(1));
        let preview = log.unread_preview(Some("cust-1"));
        assert_eq!(preview.len(), 1);
        assert_eq!(preview[0].body, "are you there?");
    }

    #[test]
    fn unread_preview_collapses_to_one_when_long() {
        let long = "word ".repeat(30);
        let mut log = MessageLog::new();
        log.replace(vec![
            agent_message("m1", long.trim(), 0),
            agent_message("m2", "short", 1),
        ]);
        let preview = log.unread_preview(None);
        assert_eq!(preview.len(), 1);
    }

    #[test]
    fn shorten_cuts_at_word_boundary() {
        assert_eq!(shorten("hello world", 20), "hello world");
        assert_eq!(shorten("hello wide world", 9), "hello...");
        // A single unbroken token collapses to the ellipsis alone.
        assert_eq!(shorten("abcdefghij", 5), "...");
    }
}
