//! Phoenix-channels websocket transport.
//!
//! Speaks the V2 array framing (`[join_ref, ref, topic, event, payload]`)
//! over a single websocket, with a periodic heartbeat on the reserved
//! `phoenix` topic. Joins await their `phx_reply`; pushes are fire and
//! forget. Events are routed to per-topic senders registered at join time.

use crate::channel::transport::{ChannelError, ChannelTransport, TopicEvent, TopicHandle};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

struct Shared {
    writer: mpsc::Sender<String>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Value, Value>>>>,
    routes: RwLock<HashMap<String, mpsc::Sender<TopicEvent>>>,
    next_ref: AtomicU64,
}

impl Shared {
    fn next_ref(&self) -> u64 {
        self.next_ref.fetch_add(1, Ordering::SeqCst)
    }

    async fn send_frame(
        &self,
        join_ref: Option<&str>,
        msg_ref: u64,
        topic: &str,
        event: &str,
        payload: Value,
    ) -> Result<(), ChannelError> {
        let frame = json!([join_ref, msg_ref.to_string(), topic, event, payload]);
        let text = frame.to_string();
        log::debug!("ws send: {}", text);
        self.writer
            .send(text)
            .await
            .map_err(|_| ChannelError::Socket("writer closed".to_string()))
    }
}

/// Websocket transport for a Phoenix endpoint.
pub struct PhoenixTransport {
    url: String,
    shared: Mutex<Option<Arc<Shared>>>,
}

impl PhoenixTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            shared: Mutex::new(None),
        }
    }

    async fn shared(&self) -> Result<Arc<Shared>, ChannelError> {
        self.shared
            .lock()
            .await
            .clone()
            .ok_or(ChannelError::NotConnected)
    }
}

#[async_trait]
impl ChannelTransport for PhoenixTransport {
    async fn connect(&self) -> Result<(), ChannelError> {
        let mut guard = self.shared.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let (stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| ChannelError::Socket(e.to_string()))?;
        log::info!("connected to {}", self.url);
        let (mut sink, mut source) = stream.split();

        let (writer_tx, mut writer_rx) = mpsc::channel::<String>(64);
        tokio::spawn(async move {
            while let Some(text) = writer_rx.recv().await {
                if let Err(e) = sink.send(WsMessage::Text(text)).await {
                    log::warn!("websocket write failed: {}", e);
                    break;
                }
            }
        });

        let shared = Arc::new(Shared {
            writer: writer_tx,
            pending: Mutex::new(HashMap::new()),
            routes: RwLock::new(HashMap::new()),
            next_ref: AtomicU64::new(1),
        });

        let reader_shared = shared.clone();
        tokio::spawn(async move {
            while let Some(msg) = source.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => handle_frame(&reader_shared, &text).await,
                    Ok(WsMessage::Close(_)) => {
                        log::info!("websocket closed by server");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("websocket read failed: {}", e);
                        break;
                    }
                }
            }
            // Realtime is gone; joined topics stop receiving. The widget
            // stays usable for composing (sends queue as optimistic-only).
            reader_shared.routes.write().await.clear();
        });

        let heartbeat_shared = shared.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let msg_ref = heartbeat_shared.next_ref();
                if heartbeat_shared
                    .send_frame(None, msg_ref, "phoenix", "heartbeat", json!({}))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        *guard = Some(shared);
        Ok(())
    }

    async fn join(
        &self,
        topic: &str,
        params: Value,
        events: mpsc::Sender<TopicEvent>,
    ) -> Result<Arc<dyn TopicHandle>, ChannelError> {
        let shared = self.shared().await?;
        let msg_ref = shared.next_ref();
        let join_ref = msg_ref.to_string();

        let (reply_tx, reply_rx) = oneshot::channel();
        shared.pending.lock().await.insert(msg_ref, reply_tx);
        shared
            .routes
            .write()
            .await
            .insert(topic.to_string(), events);

        shared
            .send_frame(Some(&join_ref), msg_ref, topic, "phx_join", params)
            .await?;

        let outcome = tokio::time::timeout(JOIN_TIMEOUT, reply_rx).await;
        match outcome {
            Ok(Ok(Ok(_response))) => {
                log::debug!("joined topic {}", topic);
                Ok(Arc::new(PhoenixTopic {
                    shared,
                    topic: topic.to_string(),
                    join_ref,
                }))
            }
            Ok(Ok(Err(response))) => {
                shared.routes.write().await.remove(topic);
                Err(ChannelError::JoinRefused {
                    topic: topic.to_string(),
                    reason: response.to_string(),
                })
            }
            _ => {
                shared.pending.lock().await.remove(&msg_ref);
                shared.routes.write().await.remove(topic);
                Err(ChannelError::Socket(format!("join timed out for {}", topic)))
            }
        }
    }
}

async fn handle_frame(shared: &Arc<Shared>, text: &str) {
    let frame: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            log::debug!("ignoring unparseable frame: {}", e);
            return;
        }
    };
    let parts = match frame.as_array() {
        Some(parts) if parts.len() == 5 => parts,
        _ => {
            log::debug!("ignoring non-V2 frame: {}", text);
            return;
        }
    };
    let msg_ref = parts[1].as_str().and_then(|s| s.parse::<u64>().ok());
    let topic = parts[2].as_str().unwrap_or_default();
    let event = parts[3].as_str().unwrap_or_default();
    let payload = parts[4].clone();

    if event == "phx_reply" {
        let Some(msg_ref) = msg_ref else { return };
        if let Some(reply_tx) = shared.pending.lock().await.remove(&msg_ref) {
            let status = payload.get("status").and_then(Value::as_str);
            let response = payload.get("response").cloned().unwrap_or(Value::Null);
            let result = if status == Some("ok") {
                Ok(response)
            } else {
                Err(response)
            };
            let _ = reply_tx.send(result);
        }
        return;
    }

    let route = shared.routes.read().await.get(topic).cloned();
    if let Some(route) = route {
        let delivered = route
            .send(TopicEvent {
                topic: topic.to_string(),
                event: event.to_string(),
                payload,
            })
            .await;
        if delivered.is_err() {
            shared.routes.write().await.remove(topic);
        }
    } else {
        log::debug!("event for unjoined topic {}: {}", topic, event);
    }
}

struct PhoenixTopic {
    shared: Arc<Shared>,
    topic: String,
    join_ref: String,
}

#[async_trait]
impl TopicHandle for PhoenixTopic {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn push(&self, event: &str, payload: Value) -> Result<(), ChannelError> {
        let msg_ref = self.shared.next_ref();
        self.shared
            .send_frame(Some(&self.join_ref), msg_ref, &self.topic, event, payload)
            .await
    }

    async fn leave(&self) {
        let msg_ref = self.shared.next_ref();
        if let Err(e) = self
            .shared
            .send_frame(Some(&self.join_ref), msg_ref, &self.topic, "phx_leave", json!({}))
            .await
        {
            log::debug!("leave push failed for {}: {}", self.topic, e);
        }
        self.shared.routes.write().await.remove(&self.topic);
    }
}
