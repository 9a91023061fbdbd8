//! Session orchestration: one `ChatWidget` owns the message log, the
//! identity/conversation managers, presence, visibility, and the cross-frame
//! bus, and drives them from three inputs: embedder commands, realtime topic
//! events, and local sends.

use crate::api::WidgetApi;
use crate::channel::{
    room_topic, ChannelTransport, TopicEvent, TopicHandle, EVENT_CONVERSATION_CREATED,
    EVENT_MESSAGES_SEEN, EVENT_NEW_MESSAGE, EVENT_PRESENCE_STATE,
};
use crate::config::WidgetConfig;
use crate::conversation::ConversationLifecycleManager;
use crate::customer::{CustomerResolver, Resolution};
use crate::frame::{FrameBus, FrameSink, InboundCommand, OutboundEvent};
use crate::message::{Message, MessageLog};
use crate::presence::PresenceTracker;
use crate::visibility::VisibilityReadReceiptController;
use anyhow::Context;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;

const EVENT_CHANNEL_CAPACITY: usize = 64;

pub struct ChatWidget {
    config: WidgetConfig,
    transport: Arc<dyn ChannelTransport>,
    bus: FrameBus,
    resolver: CustomerResolver,
    conversations: ConversationLifecycleManager,
    log: MessageLog,
    presence: PresenceTracker,
    visibility: VisibilityReadReceiptController,
    customer_id: Option<String>,
    should_display_notifications: bool,
    pop_up_initial_message: bool,
    show_branding: bool,
    room: Option<Arc<dyn TopicHandle>>,
    events: mpsc::Sender<TopicEvent>,
    torn_down: bool,
}

impl ChatWidget {
    /// Build a widget session. The returned receiver carries every realtime
    /// topic event; the embedding layer feeds each one back through
    /// [`handle_topic_event`](Self::handle_topic_event).
    pub fn new(
        config: WidgetConfig,
        api: Arc<dyn WidgetApi>,
        transport: Arc<dyn ChannelTransport>,
        sink: Box<dyn FrameSink>,
    ) -> (Self, mpsc::Receiver<TopicEvent>) {
        let (events, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let resolver = CustomerResolver::new(api.clone(), config.account_id.clone());
        let conversations = ConversationLifecycleManager::new(
            api,
            transport.clone(),
            config.account_id.clone(),
            events.clone(),
        );
        let widget = Self {
            config,
            transport,
            bus: FrameBus::new(sink),
            resolver,
            conversations,
            log: MessageLog::new(),
            presence: PresenceTracker::new(),
            visibility: VisibilityReadReceiptController::new(true),
            customer_id: None,
            should_display_notifications: false,
            pop_up_initial_message: false,
            show_branding: false,
            room: None,
            events,
            torn_down: false,
        };
        (widget, rx)
    }

    /// Bring the session up: connect the realtime feed, join the account
    /// room for presence, resolve the visitor's identity, and load (or
    /// defer) the active conversation. Ends with `chat:loaded`.
    pub async fn boot(&mut self) -> anyhow::Result<()> {
        self.transport
            .connect()
            .await
            .context("connecting realtime feed")?;

        let topic = room_topic(&self.config.account_id);
        match self
            .transport
            .join(&topic, json!({}), self.events.clone())
            .await
        {
            Ok(handle) => self.room = Some(handle),
            // Presence is best-effort; the session works without it.
            Err(e) => log::warn!("unable to join {}: {}", topic, e),
        }

        let cached = self.config.customer_id.clone();
        self.refresh_identity(cached).await;
        self.load_conversation_state().await;

        if let Some(customer_id) = self.customer_id.clone() {
            if !self.config.customer.is_empty() {
                if let Err(e) = self
                    .resolver
                    .create_or_update(Some(&customer_id), &self.config.customer)
                    .await
                {
                    log::warn!("refreshing customer metadata failed: {}", e);
                }
            }
        }

        self.bus.emit(OutboundEvent::ChatLoaded);
        Ok(())
    }

    /// Dispatch one embedder command.
    pub async fn handle_command(&mut self, command: InboundCommand) {
        match command {
            InboundCommand::SetCustomerId { customer_id } => {
                if customer_id == self.customer_id {
                    return;
                }
                self.refresh_identity(customer_id).await;
                if self.conversations.conversation_id().await.is_none() {
                    self.load_conversation_state().await;
                }
            }
            InboundCommand::UpdateCustomer {
                customer_id,
                metadata,
            } => {
                let existing = customer_id.or_else(|| self.customer_id.clone());
                match self
                    .resolver
                    .create_or_update(existing.as_deref(), &metadata)
                    .await
                {
                    Ok(outcome) => {
                        self.customer_id = Some(outcome.customer_id.clone());
                        let event = if outcome.created {
                            OutboundEvent::CustomerCreated {
                                customer_id: outcome.customer_id,
                            }
                        } else {
                            OutboundEvent::CustomerUpdated {
                                customer_id: outcome.customer_id,
                            }
                        };
                        self.bus.emit(event);
                    }
                    Err(e) => log::warn!("customer update failed: {}", e),
                }
            }
            InboundCommand::DisplayNotifications {
                should_display_notifications,
                pop_up_initial_message,
            } => {
                self.should_display_notifications = should_display_notifications;
                self.pop_up_initial_message = pop_up_initial_message;
            }
            InboundCommand::UpdateConfig(payload) => self.config.apply_update(&payload),
            InboundCommand::Toggle { is_open } => {
                let just_opened = self.bus.apply_toggle(is_open);
                if just_opened && self.visibility.has_markable(self.log.messages(), true) {
                    self.mark_messages_as_seen().await;
                }
            }
            InboundCommand::Plan { plan } => {
                // Free-tier accounts show the vendor branding; no plan means
                // no branding.
                self.show_branding = plan
                    .as_deref()
                    .map_or(false, |p| p.eq_ignore_ascii_case("starter"));
            }
            InboundCommand::Ping => log::debug!("ping received, session alive"),
        }
    }

    /// Dispatch one realtime topic event.
    pub async fn handle_topic_event(&mut self, event: TopicEvent) {
        match event.event.as_str() {
            EVENT_PRESENCE_STATE => {
                self.presence.sync(&event.payload);
            }
            EVENT_NEW_MESSAGE => self.handle_new_message(event.payload).await,
            EVENT_CONVERSATION_CREATED => self.handle_conversation_created(event.payload).await,
            // Our own seen-push echoed back; the log is already stamped.
            EVENT_MESSAGES_SEEN => {}
            other => log::trace!("ignoring {} on {}", other, event.topic),
        }
    }

    /// Send a message typed by the visitor. On the very first send the
    /// customer and conversation are created lazily; the message itself goes
    /// into the log optimistically either way.
    pub async fn send_message(&mut self, body: &str, email: Option<&str>) -> anyhow::Result<()> {
        let body = body.trim();
        if body.is_empty() || self.torn_down {
            return Ok(());
        }

        let optimistic = self
            .log
            .append_optimistic(body, self.customer_id.clone(), Utc::now());

        if self.conversations.conversation_id().await.is_none() {
            let metadata = self.config.customer.with_email(email);
            let outcome = self
                .conversations
                .initialize_new_conversation(&self.resolver, self.customer_id.as_deref(), &metadata)
                .await
                .context("initializing conversation on first send")?;
            self.customer_id = Some(outcome.customer_id.clone());
            if outcome.created_customer {
                self.bus.emit(OutboundEvent::CustomerCreated {
                    customer_id: outcome.customer_id.clone(),
                });
            }
            if !outcome.already_existed {
                self.bus.emit(OutboundEvent::ConversationJoin {
                    conversation_id: outcome.conversation_id,
                    customer_id: Some(outcome.customer_id),
                });
            }
        }

        let payload = json!({
            "body": &optimistic.body,
            "customer_id": &optimistic.customer_id,
            "sent_at": &optimistic.sent_at,
        });
        if let Err(e) = self.conversations.push(EVENT_NEW_MESSAGE, payload).await {
            // The optimistic entry stays; the server echo will reconcile it
            // if the message made it through another path.
            log::warn!("message push failed: {}", e);
        }

        let conversation_id = self.conversations.conversation_id().await;
        self.bus.emit(OutboundEvent::MessageSent {
            message: optimistic,
            conversation_id,
        });
        Ok(())
    }

    /// Record a page visibility change; restoration triggers the batched
    /// mark-seen scan when anything is eligible.
    pub async fn handle_visibility_change(&mut self, visible: bool) {
        let restored = self.visibility.set_page_visible(visible);
        if restored && self.visibility.has_markable(self.log.messages(), self.bus.is_open()) {
            self.mark_messages_as_seen().await;
        }
    }

    /// Ask the embedder to open the widget surface.
    pub fn open(&mut self) {
        self.bus.request_open();
    }

    /// Announce a close request to the embedder.
    pub fn close(&self) {
        self.bus.request_close();
    }

    pub fn is_open(&self) -> bool {
        self.bus.is_open()
    }

    /// Whether the email gate applies: email required upfront and the visitor
    /// is still completely anonymous.
    pub fn should_ask_for_email(&self) -> bool {
        self.config.require_email_upfront
            && self.customer_id.is_none()
            && self.config.customer.email.is_none()
    }

    pub fn config(&self) -> &WidgetConfig {
        &self.config
    }

    pub fn customer_id(&self) -> Option<&str> {
        self.customer_id.as_deref()
    }

    pub fn messages(&self) -> &[Message] {
        self.log.messages()
    }

    pub fn has_available_agents(&self) -> bool {
        self.presence.has_available_agents()
    }

    /// Availability line for the widget header, per the configured copy.
    pub fn availability_text(&self) -> &str {
        if self.presence.has_available_agents() {
            &self.config.agent_available_text
        } else {
            &self.config.agent_unavailable_text
        }
    }

    pub fn show_branding(&self) -> bool {
        self.show_branding
    }

    pub fn notifications_enabled(&self) -> bool {
        self.should_display_notifications
    }

    pub fn pop_up_initial_message(&self) -> bool {
        self.pop_up_initial_message
    }

    /// Messages an external notification badge would preview.
    pub fn unread_preview(&self) -> Vec<Message> {
        self.log.unread_preview(self.customer_id.as_deref())
    }

    /// Release every subscription. Idempotent; the session is unusable
    /// afterwards.
    pub async fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.conversations.teardown().await;
        if let Some(room) = self.room.take() {
            room.leave().await;
        }
        log::debug!("widget session torn down");
    }

    /// Re-run identity resolution against a (possibly new) cached id and the
    /// configured metadata. Emits `customer:updated` when the effective id
    /// changes so the embedder refreshes its cache.
    async fn refresh_identity(&mut self, cached: Option<String>) {
        match self
            .resolver
            .resolve(cached.as_deref(), &self.config.customer)
            .await
        {
            Resolution::Known {
                customer_id,
                changed,
            } => {
                if changed {
                    self.bus.emit(OutboundEvent::CustomerUpdated {
                        customer_id: customer_id.clone(),
                    });
                }
                self.customer_id = Some(customer_id);
            }
            Resolution::Unknown => self.customer_id = None,
        }
    }

    /// Load the latest conversation for the current identity (or defer with
    /// just the greeting) and surface the result on the bus.
    async fn load_conversation_state(&mut self) {
        let greeting = self
            .config
            .greeting
            .as_deref()
            .map(|g| Message::bot(g, Utc::now()));
        let start = self
            .conversations
            .fetch_latest_or_defer(self.customer_id.as_deref(), greeting)
            .await;
        self.log.replace(start.messages);
        if let Some(conversation_id) = start.conversation_id {
            self.bus.emit(OutboundEvent::ConversationJoin {
                conversation_id,
                customer_id: self.customer_id.clone(),
            });
        }
        if let Some(message) = start.first_unseen {
            self.bus.emit(OutboundEvent::MessagesUnseen { message });
        }
    }

    async fn handle_new_message(&mut self, payload: serde_json::Value) {
        let message: Message = match serde_json::from_value(payload) {
            Ok(m) => m,
            Err(e) => {
                log::warn!("undecodable message payload: {}", e);
                return;
            }
        };
        self.bus.emit(OutboundEvent::MessageReceived(message.clone()));
        self.log.apply(message.clone());
        if self.visibility.should_mark_seen(&message, self.bus.is_open()) {
            self.mark_messages_as_seen().await;
        } else {
            self.bus.emit(OutboundEvent::MessagesUnseen { message });
        }
    }

    /// A conversation was started from another surface (dashboard, email
    /// reply) while we were watching the lobby.
    async fn handle_conversation_created(&mut self, payload: serde_json::Value) {
        if self.conversations.conversation_id().await.is_some() {
            return;
        }
        let conversation_id = payload
            .get("conversation_id")
            .or_else(|| payload.get("id"))
            .and_then(|v| v.as_str());
        let Some(conversation_id) = conversation_id else {
            log::warn!("conversation:created without a conversation id");
            return;
        };
        self.conversations
            .join_conversation_channel(conversation_id, self.customer_id.as_deref())
            .await;
        self.bus.emit(OutboundEvent::ConversationJoin {
            conversation_id: conversation_id.to_string(),
            customer_id: self.customer_id.clone(),
        });
    }

    /// Push the seen acknowledgement, announce it, and stamp the log.
    async fn mark_messages_as_seen(&mut self) {
        if let Err(e) = self
            .conversations
            .push(EVENT_MESSAGES_SEEN, json!({}))
            .await
        {
            log::debug!("seen push skipped: {}", e);
        }
        self.bus.emit(OutboundEvent::MessagesSeen);
        let stamped = self.log.mark_all_seen(Utc::now());
        log::debug!("marked {} message(s) seen", stamped);
    }
}
