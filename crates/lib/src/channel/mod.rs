//! Realtime pub/sub layer.
//!
//! `ChannelTransport`/`TopicHandle` abstract the connection so the session
//! core can run against in-memory stubs in tests; `PhoenixTransport` is the
//! production websocket implementation.

mod phoenix;
mod transport;

pub use phoenix::PhoenixTransport;
pub use transport::{
    conversation_topic, lobby_topic, room_topic, ChannelError, ChannelTransport, TopicEvent,
    TopicHandle, EVENT_CONVERSATION_CREATED, EVENT_MESSAGES_SEEN, EVENT_NEW_MESSAGE,
    EVENT_PRESENCE_STATE,
};
