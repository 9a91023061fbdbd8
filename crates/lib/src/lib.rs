//! Chat widget session core: customer identity, conversation lifecycle,
//! message reconciliation, presence, and the cross-frame protocol used by
//! the embedding surface.

pub mod api;
pub mod channel;
pub mod config;
pub mod conversation;
pub mod customer;
pub mod frame;
pub mod message;
pub mod presence;
pub mod visibility;
pub mod widget;
