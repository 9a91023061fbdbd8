//! Cross-frame protocol between the widget iframe and its embedding page.
//!
//! Inbound control commands and outbound lifecycle events are both
//! `{"event", "payload"}` frames; `bus` holds the open/transitioning/closed
//! state machine and the injected outbound sink.

mod bus;
mod protocol;

pub use bus::{DisplayState, FrameBus, FrameSink};
pub use protocol::{InboundCommand, OutboundEvent};
