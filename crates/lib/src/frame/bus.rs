use super::protocol::OutboundEvent;
use serde_json::Value;

/// Outbound side of the cross-frame channel. The embedding layer injects a
/// concrete sink (postMessage bridge, stdout printer, test collector).
pub trait FrameSink: Send + Sync {
    fn emit(&self, frame: Value);
}

/// Display state of the widget surface. Opening is asynchronous: the
/// request goes out, the embedder animates, and `papercups:toggle` confirms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayState {
    Closed,
    /// An open request was sent; waiting for the embedder's toggle.
    Transitioning,
    Open,
}

pub struct FrameBus {
    sink: Box<dyn FrameSink>,
    state: DisplayState,
}

impl FrameBus {
    pub fn new(sink: Box<dyn FrameSink>) -> Self {
        Self {
            sink,
            state: DisplayState::Closed,
        }
    }

    pub fn state(&self) -> DisplayState {
        self.state
    }

    /// Widget-open from the chat session's point of view. Transitioning does
    /// not count: messages arriving mid-animation stay unseen.
    pub fn is_open(&self) -> bool {
        self.state == DisplayState::Open
    }

    pub fn emit(&self, event: OutboundEvent) {
        self.sink.emit(event.to_frame());
    }

    /// Ask the embedder to open the widget. Only valid from `Closed`;
    /// repeated requests while a transition is pending are dropped.
    pub fn request_open(&mut self) {
        if self.state != DisplayState::Closed {
            return;
        }
        self.emit(OutboundEvent::OpenRequested);
        self.state = DisplayState::Transitioning;
    }

    /// Announce a close request. The event always goes out and the state is
    /// left untouched; only the embedder's toggle actually closes.
    pub fn request_close(&self) {
        self.emit(OutboundEvent::CloseRequested);
    }

    /// Apply the embedder's toggle confirmation. Returns true when the
    /// widget just became open.
    pub fn apply_toggle(&mut self, is_open: bool) -> bool {
        let was_open = self.is_open();
        self.state = if is_open {
            DisplayState::Open
        } else {
            DisplayState::Closed
        };
        is_open && !was_open
    }
}
