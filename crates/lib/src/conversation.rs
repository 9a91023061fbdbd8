//! Conversation lifecycle: find or create the active conversation and own its
//! realtime topic.
//!
//! At most one conversation topic is joined at a time, and only this manager
//! may join or leave it. While no conversation exists the manager watches the
//! per-customer lobby topic so a conversation started from another surface
//! (email, dashboard) is picked up without user action. The first-send path
//! is serialized so rapid sends cannot create two conversations.

use crate::api::{ApiError, CustomerMetadata, WidgetApi};
use crate::channel::{
    conversation_topic, lobby_topic, ChannelError, ChannelTransport, TopicEvent, TopicHandle,
};
use crate::customer::CustomerResolver;
use crate::message::{sort_by_created_at, Message};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Result of the initial history fetch (or its deferred fallback).
#[derive(Debug)]
pub struct ConversationStart {
    pub conversation_id: Option<String>,
    /// Greeting (if configured) followed by history ascending by `created_at`.
    pub messages: Vec<Message>,
    /// First agent message that has not been seen yet, surfaced to the
    /// embedder as a notification.
    pub first_unseen: Option<Message>,
    /// Whether the conversation topic was joined successfully.
    pub joined: bool,
}

/// Result of creating the first conversation on a customer's first send.
#[derive(Debug, Clone)]
pub struct NewConversation {
    pub customer_id: String,
    pub conversation_id: String,
    /// A brand-new customer was created (vs. an existing one reused).
    pub created_customer: bool,
    /// Another in-flight send already initialized the conversation.
    pub already_existed: bool,
}

#[derive(Default)]
struct ActiveTopics {
    conversation_id: Option<String>,
    customer_id: Option<String>,
    conversation: Option<Arc<dyn TopicHandle>>,
    lobby: Option<Arc<dyn TopicHandle>>,
}

pub struct ConversationLifecycleManager {
    api: Arc<dyn WidgetApi>,
    transport: Arc<dyn ChannelTransport>,
    account_id: String,
    events: mpsc::Sender<TopicEvent>,
    /// Held across the whole first-send initialization, which is what makes
    /// that path single-flight.
    active: Mutex<ActiveTopics>,
    closed: AtomicBool,
}

impl ConversationLifecycleManager {
    pub fn new(
        api: Arc<dyn WidgetApi>,
        transport: Arc<dyn ChannelTransport>,
        account_id: impl Into<String>,
        events: mpsc::Sender<TopicEvent>,
    ) -> Self {
        Self {
            api,
            transport,
            account_id: account_id.into(),
            events,
            active: Mutex::new(ActiveTopics::default()),
            closed: AtomicBool::new(false),
        }
    }

    pub async fn conversation_id(&self) -> Option<String> {
        self.active.lock().await.conversation_id.clone()
    }

    /// Load the most recent conversation for a known customer, or defer.
    ///
    /// With no customer (or no prior conversations, or a failed fetch) only
    /// the greeting is returned and no network-visible state is created;
    /// creation waits for the first send. A known customer without a
    /// conversation gets the lobby subscription instead.
    pub async fn fetch_latest_or_defer(
        &self,
        customer_id: Option<&str>,
        greeting: Option<Message>,
    ) -> ConversationStart {
        let deferred = |messages: Vec<Message>| ConversationStart {
            conversation_id: None,
            messages,
            first_unseen: None,
            joined: false,
        };
        let greeting_only: Vec<Message> = greeting.clone().into_iter().collect();

        let Some(customer_id) = customer_id else {
            return deferred(greeting_only);
        };

        let conversations = match self
            .api
            .fetch_customer_conversations(customer_id, &self.account_id)
            .await
        {
            Ok(conversations) => conversations,
            Err(e) => {
                log::warn!("fetching conversations failed: {}", e);
                self.subscribe_lobby(customer_id).await;
                return deferred(greeting_only);
            }
        };

        // Backend returns most-recent-first; the head is the active one.
        let Some(latest) = conversations.into_iter().next() else {
            self.subscribe_lobby(customer_id).await;
            return deferred(greeting_only);
        };

        let history = sort_by_created_at(latest.messages);
        let first_unseen = history
            .iter()
            .find(|m| m.seen_at.is_none() && m.from_agent())
            .cloned();
        let mut messages = greeting_only;
        messages.extend(history);

        let mut state = self.active.lock().await;
        let joined = self
            .join_locked(&mut state, &latest.id, Some(customer_id))
            .await;

        ConversationStart {
            conversation_id: Some(latest.id),
            messages,
            first_unseen,
            joined,
        }
    }

    /// First-send path: resolve/create the customer, create a conversation,
    /// and join its topic, exactly once even under concurrent sends. The
    /// internal lock is held across every await, so a second caller blocks
    /// and then observes the already-created conversation.
    pub async fn initialize_new_conversation(
        &self,
        resolver: &CustomerResolver,
        existing_customer_id: Option<&str>,
        metadata: &CustomerMetadata,
    ) -> Result<NewConversation, ApiError> {
        let mut state = self.active.lock().await;
        if let Some(conversation_id) = state.conversation_id.clone() {
            let customer_id = state
                .customer_id
                .clone()
                .or_else(|| existing_customer_id.map(str::to_string))
                .unwrap_or_default();
            return Ok(NewConversation {
                customer_id,
                conversation_id,
                created_customer: false,
                already_existed: true,
            });
        }

        let outcome = resolver
            .create_or_update(existing_customer_id, metadata)
            .await?;
        let conversation_id = self
            .api
            .create_conversation(&self.account_id, &outcome.customer_id)
            .await?;
        log::info!("created conversation {}", conversation_id);

        self.join_locked(&mut state, &conversation_id, Some(&outcome.customer_id))
            .await;

        Ok(NewConversation {
            customer_id: outcome.customer_id,
            conversation_id,
            created_customer: outcome.created,
            already_existed: false,
        })
    }

    /// Join a conversation topic (leaving any previous one first). Used when
    /// the lobby announces a conversation created from another surface.
    pub async fn join_conversation_channel(
        &self,
        conversation_id: &str,
        customer_id: Option<&str>,
    ) -> bool {
        let mut state = self.active.lock().await;
        self.join_locked(&mut state, conversation_id, customer_id).await
    }

    /// Watch the per-customer lobby while no conversation exists.
    pub async fn subscribe_lobby(&self, customer_id: &str) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut state = self.active.lock().await;
        if state.conversation.is_some() || state.lobby.is_some() {
            return;
        }
        let topic = lobby_topic(customer_id);
        match self
            .transport
            .join(&topic, json!({}), self.events.clone())
            .await
        {
            Ok(handle) => {
                log::debug!("watching lobby {}", topic);
                state.lobby = Some(handle);
                state.customer_id = Some(customer_id.to_string());
            }
            Err(e) => log::warn!("unable to join {}: {}", topic, e),
        }
    }

    /// Push an event on the active conversation topic.
    pub async fn push(&self, event: &str, payload: serde_json::Value) -> Result<(), ChannelError> {
        let state = self.active.lock().await;
        match &state.conversation {
            Some(handle) => handle.push(event, payload).await,
            None => Err(ChannelError::NotConnected),
        }
    }

    /// Release every topic subscription. Any resolution still in flight
    /// becomes a no-op once this has run.
    pub async fn teardown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut state = self.active.lock().await;
        if let Some(handle) = state.conversation.take() {
            handle.leave().await;
        }
        if let Some(handle) = state.lobby.take() {
            handle.leave().await;
        }
        state.conversation_id = None;
    }

    /// Leave the previous topics and join `conversation:{id}`. Records the
    /// conversation id even when the join fails: sends then stay
    /// optimistic-only until a later successful join, but the conversation is
    /// not re-created. Returns whether the topic was joined.
    async fn join_locked(
        &self,
        state: &mut ActiveTopics,
        conversation_id: &str,
        customer_id: Option<&str>,
    ) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            log::debug!("ignoring join after teardown");
            return false;
        }
        if let Some(previous) = state.conversation.take() {
            previous.leave().await;
        }
        if let Some(lobby) = state.lobby.take() {
            lobby.leave().await;
        }
        state.conversation_id = Some(conversation_id.to_string());
        state.customer_id = customer_id.map(str::to_string);

        let topic = conversation_topic(conversation_id);
        match self
            .transport
            .join(&topic, json!({ "customer_id": customer_id }), self.events.clone())
            .await
        {
            Ok(handle) => {
                log::debug!("joined {}", topic);
                state.conversation = Some(handle);
                true
            }
            Err(e) => {
                log::warn!("unable to join {}: {}", topic, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Conversation;
    use crate::channel::TopicHandle;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use serde_json::Value;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct StubApi {
        conversations: Vec<Conversation>,
        fetch_fails: bool,
        create_conversation_calls: AtomicUsize,
        create_customer_calls: AtomicUsize,
    }

    #[async_trait]
    impl WidgetApi for StubApi {
        async fn create_customer(
            &self,
            _account_id: &str,
            _metadata: &CustomerMetadata,
        ) -> Result<String, ApiError> {
            self.create_customer_calls.fetch_add(1, Ordering::SeqCst);
            // Slow enough that a racing second send overlaps this await.
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok("cust-new".to_string())
        }

        async fn customer_exists(
            &self,
            _customer_id: &str,
            _account_id: &str,
        ) -> Result<bool, ApiError> {
            Ok(true)
        }

        async fn update_customer_metadata(
            &self,
            _customer_id: &str,
            _metadata: &CustomerMetadata,
        ) -> Result<(), ApiError> {
            Ok(())
        }

        async fn find_customer_by_external_id(
            &self,
            _external_id: &str,
            _account_id: &str,
        ) -> Result<Option<String>, ApiError> {
            Ok(None)
        }

        async fn create_conversation(
            &self,
            _account_id: &str,
            _customer_id: &str,
        ) -> Result<String, ApiError> {
            let n = self.create_conversation_calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("conv-{}", n + 1))
        }

        async fn fetch_customer_conversations(
            &self,
            _customer_id: &str,
            _account_id: &str,
        ) -> Result<Vec<Conversation>, ApiError> {
            if self.fetch_fails {
                return Err(ApiError::Status {
                    status: 500,
                    body: "boom".to_string(),
                });
            }
            Ok(self.conversations.clone())
        }
    }

    #[derive(Default)]
    struct StubTransport {
        joins: std::sync::Mutex<Vec<String>>,
        leaves: Arc<std::sync::Mutex<Vec<String>>>,
    }

    struct StubTopic {
        topic: String,
        leaves: Arc<std::sync::Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl TopicHandle for StubTopic {
        fn topic(&self) -> &str {
            &self.topic
        }

        async fn push(&self, _event: &str, _payload: Value) -> Result<(), ChannelError> {
            Ok(())
        }

        async fn leave(&self) {
            self.leaves.lock().unwrap().push(self.topic.clone());
        }
    }

    #[async_trait]
    impl ChannelTransport for StubTransport {
        async fn connect(&self) -> Result<(), ChannelError> {
            Ok(())
        }

        async fn join(
            &self,
            topic: &str,
            _params: Value,
            _events: mpsc::Sender<TopicEvent>,
        ) -> Result<Arc<dyn TopicHandle>, ChannelError> {
            self.joins.lock().unwrap().push(topic.to_string());
            Ok(Arc::new(StubTopic {
                topic: topic.to_string(),
                leaves: self.leaves.clone(),
            }))
        }
    }

    fn message(id: &str, created: i64, seen: bool, agent: bool) -> Message {
        Message {
            id: Some(id.to_string()),
            body: id.to_string(),
            kind: None,
            customer_id: None,
            user_id: agent.then_some(1),
            sent_at: None,
            created_at: Some(Utc.timestamp_opt(created, 0).unwrap()),
            seen_at: seen.then(|| Utc.timestamp_opt(created + 1, 0).unwrap()),
        }
    }

    fn manager(
        api: StubApi,
        transport: Arc<StubTransport>,
    ) -> Arc<ConversationLifecycleManager> {
        let (tx, _rx) = mpsc::channel(16);
        Arc::new(ConversationLifecycleManager::new(
            Arc::new(api),
            transport,
            "acct-1",
            tx,
        ))
    }

    #[tokio::test]
    async fn no_customer_defers_with_greeting_only() {
        let transport = Arc::new(StubTransport::default());
        let m = manager(StubApi::default(), transport.clone());
        let greeting = Message::bot("Hi!", Utc::now());
        let start = m.fetch_latest_or_defer(None, Some(greeting)).await;
        assert!(start.conversation_id.is_none());
        assert_eq!(start.messages.len(), 1);
        assert!(transport.joins.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn customer_without_conversations_watches_lobby() {
        let transport = Arc::new(StubTransport::default());
        let m = manager(StubApi::default(), transport.clone());
        let start = m.fetch_latest_or_defer(Some("cust-1"), None).await;
        assert!(start.conversation_id.is_none());
        assert_eq!(
            transport.joins.lock().unwrap().as_slice(),
            ["conversation:lobby:cust-1"]
        );
    }

    #[tokio::test]
    async fn fetch_failure_degrades_to_deferred() {
        let transport = Arc::new(StubTransport::default());
        let m = manager(
            StubApi {
                fetch_fails: true,
                ..Default::default()
            },
            transport.clone(),
        );
        let start = m.fetch_latest_or_defer(Some("cust-1"), None).await;
        assert!(start.conversation_id.is_none());
        assert!(start.messages.is_empty());
    }

    #[tokio::test]
    async fn latest_conversation_is_sorted_and_joined() {
        let api = StubApi {
            conversations: vec![Conversation {
                id: "conv-9".to_string(),
                customer_id: Some("cust-1".to_string()),
                messages: vec![
                    message("m2", 200, false, true),
                    message("m1", 100, true, true),
                ],
            }],
            ..Default::default()
        };
        let transport = Arc::new(StubTransport::default());
        let m = manager(api, transport.clone());
        let greeting = Message::bot("Hi!", Utc.timestamp_opt(0, 0).unwrap());
        let start = m.fetch_latest_or_defer(Some("cust-1"), Some(greeting)).await;

        assert_eq!(start.conversation_id.as_deref(), Some("conv-9"));
        assert!(start.joined);
        let ids: Vec<_> = start
            .messages
            .iter()
            .map(|m| m.id.as_deref().unwrap_or("greeting"))
            .collect();
        assert_eq!(ids, vec!["greeting", "m1", "m2"]);
        assert_eq!(start.first_unseen.unwrap().id.as_deref(), Some("m2"));
        assert_eq!(
            transport.joins.lock().unwrap().as_slice(),
            ["conversation:conv-9"]
        );
    }

    #[tokio::test]
    async fn racing_first_sends_create_one_conversation() {
        let transport = Arc::new(StubTransport::default());
        let api = Arc::new(StubApi::default());
        let (tx, _rx) = mpsc::channel(16);
        let m = Arc::new(ConversationLifecycleManager::new(
            api.clone(),
            transport.clone(),
            "acct-1",
            tx,
        ));
        let resolver = Arc::new(CustomerResolver::new(api.clone(), "acct-1"));

        let (m1, r1) = (m.clone(), resolver.clone());
        let first = tokio::spawn(async move {
            m1.initialize_new_conversation(&r1, None, &CustomerMetadata::default())
                .await
                .unwrap()
        });
        let (m2, r2) = (m.clone(), resolver.clone());
        let second = tokio::spawn(async move {
            m2.initialize_new_conversation(&r2, None, &CustomerMetadata::default())
                .await
                .unwrap()
        });

        let (a, b) = (first.await.unwrap(), second.await.unwrap());
        assert_eq!(api.create_conversation_calls.load(Ordering::SeqCst), 1);
        assert_eq!(api.create_customer_calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.conversation_id, b.conversation_id);
        assert!(a.already_existed != b.already_existed);
    }

    #[tokio::test]
    async fn joining_leaves_previous_topics() {
        let transport = Arc::new(StubTransport::default());
        let m = manager(StubApi::default(), transport.clone());
        m.subscribe_lobby("cust-1").await;
        assert!(m.join_conversation_channel("conv-1", Some("cust-1")).await);
        assert!(m.join_conversation_channel("conv-2", Some("cust-1")).await);
        assert_eq!(
            transport.leaves.lock().unwrap().as_slice(),
            ["conversation:lobby:cust-1", "conversation:conv-1"]
        );
        assert_eq!(m.conversation_id().await.as_deref(), Some("conv-2"));
    }

    #[tokio::test]
    async fn teardown_releases_topics_and_blocks_new_joins() {
        let transport = Arc::new(StubTransport::default());
        let m = manager(StubApi::default(), transport.clone());
        m.join_conversation_channel("conv-1", Some("cust-1")).await;
        m.teardown().await;
        assert_eq!(
            transport.leaves.lock().unwrap().as_slice(),
            ["conversation:conv-1"]
        );
        assert!(!m.join_conversation_channel("conv-2", None).await);
        assert!(m.push("shout", json!({})).await.is_err());
    }
}
