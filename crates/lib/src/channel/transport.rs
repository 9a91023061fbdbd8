//! Transport trait and topic naming for the realtime feed.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Inbound event name carrying a new message. The legacy name is kept for
/// compatibility with deployed backends (`message:created` never shipped).
pub const EVENT_NEW_MESSAGE: &str = "shout";
/// Outbound push acknowledging that all messages have been seen.
pub const EVENT_MESSAGES_SEEN: &str = "messages:seen";
/// Wholesale presence state on the account room.
pub const EVENT_PRESENCE_STATE: &str = "presence_state";
/// Lobby notification that a conversation was created from another surface.
pub const EVENT_CONVERSATION_CREATED: &str = "conversation:created";

/// Presence topic for an account.
pub fn room_topic(account_id: &str) -> String {
    format!("room:{}", account_id)
}

/// Message stream topic for a conversation.
pub fn conversation_topic(conversation_id: &str) -> String {
    format!("conversation:{}", conversation_id)
}

/// Per-customer lobby topic, watched while no conversation exists yet.
pub fn lobby_topic(customer_id: &str) -> String {
    format!("conversation:lobby:{}", customer_id)
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("socket error: {0}")]
    Socket(String),
    #[error("join refused for {topic}: {reason}")]
    JoinRefused { topic: String, reason: String },
    #[error("not connected")]
    NotConnected,
}

/// An event delivered on a joined topic.
#[derive(Debug, Clone)]
pub struct TopicEvent {
    pub topic: String,
    pub event: String,
    pub payload: Value,
}

/// Handle to a joined topic: push events out, leave when done.
#[async_trait]
pub trait TopicHandle: Send + Sync {
    fn topic(&self) -> &str;

    /// Push an event to the topic (fire and forget).
    async fn push(&self, event: &str, payload: Value) -> Result<(), ChannelError>;

    /// Leave the topic; events stop flowing afterwards.
    async fn leave(&self);
}

/// A realtime pub/sub connection that can open named topics. Events for every
/// joined topic are delivered through the `events` sender passed to `join`,
/// tagged with their topic name.
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    async fn connect(&self) -> Result<(), ChannelError>;

    async fn join(
        &self,
        topic: &str,
        params: Value,
        events: mpsc::Sender<TopicEvent>,
    ) -> Result<Arc<dyn TopicHandle>, ChannelError>;
}
