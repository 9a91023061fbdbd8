//! Read-receipt eligibility driven by page visibility and widget-open state.
//!
//! The page's visibility signal is injected by the embedding layer (the core
//! never touches a real document), and marking is batched: one "all seen"
//! action per visibility restoration, not one per message.

use crate::message::Message;

pub struct VisibilityReadReceiptController {
    page_visible: bool,
}

impl VisibilityReadReceiptController {
    pub fn new(initially_visible: bool) -> Self {
        Self {
            page_visible: initially_visible,
        }
    }

    pub fn page_visible(&self) -> bool {
        self.page_visible
    }

    /// Record a visibility change. Returns true on the hidden-to-visible
    /// transition, the moment a batched mark-seen scan should run.
    pub fn set_page_visible(&mut self, visible: bool) -> bool {
        let restored = visible && !self.page_visible;
        self.page_visible = visible;
        restored
    }

    /// A message may be marked seen only when it is an unseen agent message
    /// and the widget is both open and on a visible page.
    pub fn should_mark_seen(&self, message: &Message, widget_open: bool) -> bool {
        if message.seen_at.is_some() || !self.page_visible {
            return false;
        }
        message.from_agent() && widget_open
    }

    /// Whether any message in the list is currently eligible.
    pub fn has_markable(&self, messages: &[Message], widget_open: bool) -> bool {
        messages.iter().any(|m| self.should_mark_seen(m, widget_open))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn agent_message(seen: bool) -> Message {
        Message {
            id: Some("m1".to_string()),
            body: "hello".to_string(),
            kind: None,
            customer_id: None,
            user_id: Some(1),
            sent_at: None,
            created_at: Some(Utc::now()),
            seen_at: seen.then(Utc::now),
        }
    }

    #[test]
    fn eligibility_requires_all_four_conditions() {
        let controller = VisibilityReadReceiptController::new(true);
        let msg = agent_message(false);

        assert!(controller.should_mark_seen(&msg, true));
        assert!(!controller.should_mark_seen(&msg, false)); // widget closed
        assert!(!controller.should_mark_seen(&agent_message(true), true)); // already seen

        let mut own = agent_message(false);
        own.user_id = None;
        assert!(!controller.should_mark_seen(&own, true)); // not from an agent

        let hidden = VisibilityReadReceiptController::new(false);
        assert!(!hidden.should_mark_seen(&msg, true)); // page hidden
    }

    #[test]
    fn restoration_fires_only_on_hidden_to_visible() {
        let mut controller = VisibilityReadReceiptController::new(true);
        assert!(!controller.set_page_visible(true));
        assert!(!controller.set_page_visible(false));
        assert!(controller.set_page_visible(true));
        assert!(!controller.set_page_visible(true));
    }

    #[test]
    fn has_markable_scans_the_list() {
        let controller = VisibilityReadReceiptController::new(true);
        assert!(!controller.has_markable(&[agent_message(true)], true));
        assert!(controller.has_markable(&[agent_message(true), agent_message(false)], true));
    }
}
