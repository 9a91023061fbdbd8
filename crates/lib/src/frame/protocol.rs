//! Cross-frame wire types: `{"event": "<name>", "payload": {...}}` with
//! camelCase payload keys (the embedder script's JS conventions).

use crate::api::CustomerMetadata;
use crate::message::Message;
use serde::Deserialize;
use serde_json::{json, Value};

/// Control commands from the embedding page. Parsed through a single
/// dispatch so the inbound protocol is exhaustively checkable.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundCommand {
    /// `customer:set:id`: the embedder announces its cached customer id.
    SetCustomerId { customer_id: Option<String> },
    /// `customer:update`: update identifying metadata.
    UpdateCustomer {
        customer_id: Option<String>,
        metadata: CustomerMetadata,
    },
    /// `notifications:display`: enable/disable the external notification UI.
    DisplayNotifications {
        should_display_notifications: bool,
        pop_up_initial_message: bool,
    },
    /// `config:update`: merge a sanitized config subset at runtime.
    UpdateConfig(Value),
    /// `papercups:toggle`: the embedder finished its open/close animation.
    Toggle { is_open: bool },
    /// `papercups:plan`: subscription plan, drives the branding flag.
    Plan { plan: Option<String> },
    /// `papercups:ping`: liveness probe.
    Ping,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetCustomerIdPayload {
    customer_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateCustomerPayload {
    customer_id: Option<String>,
    #[serde(default)]
    metadata: CustomerMetadata,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DisplayNotificationsPayload {
    #[serde(default)]
    should_display_notifications: bool,
    #[serde(default)]
    pop_up_initial_message: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TogglePayload {
    #[serde(default)]
    is_open: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlanPayload {
    plan: Option<String>,
}

impl InboundCommand {
    /// Parse a raw frame. Unknown events and malformed payloads yield `None`;
    /// the caller logs and ignores them (foreign frames share the same
    /// postMessage channel).
    pub fn parse(frame: &Value) -> Option<Self> {
        let event = frame.get("event")?.as_str()?;
        let payload = frame.get("payload").cloned().unwrap_or_else(|| json!({}));
        match event {
            "customer:set:id" => {
                let p: SetCustomerIdPayload = serde_json::from_value(payload).ok()?;
                Some(Self::SetCustomerId {
                    customer_id: p.customer_id,
                })
            }
            "customer:update" => {
                let p: UpdateCustomerPayload = serde_json::from_value(payload).ok()?;
                Some(Self::UpdateCustomer {
                    customer_id: p.customer_id,
                    metadata: p.metadata,
                })
            }
            "notifications:display" => {
                let p: DisplayNotificationsPayload = serde_json::from_value(payload).ok()?;
                Some(Self::DisplayNotifications {
                    should_display_notifications: p.should_display_notifications,
                    pop_up_initial_message: p.pop_up_initial_message,
                })
            }
            "config:update" => Some(Self::UpdateConfig(payload)),
            "papercups:toggle" => {
                let p: TogglePayload = serde_json::from_value(payload).ok()?;
                Some(Self::Toggle { is_open: p.is_open })
            }
            "papercups:plan" => {
                let p: PlanPayload = serde_json::from_value(payload).ok()?;
                Some(Self::Plan { plan: p.plan })
            }
            "papercups:ping" => Some(Self::Ping),
            _ => None,
        }
    }
}

/// Lifecycle and telemetry events emitted to the embedding page.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundEvent {
    ChatLoaded,
    CustomerCreated {
        customer_id: String,
    },
    CustomerUpdated {
        customer_id: String,
    },
    ConversationJoin {
        conversation_id: String,
        customer_id: Option<String>,
    },
    MessageSent {
        message: Message,
        conversation_id: Option<String>,
    },
    MessageReceived(Message),
    MessagesUnseen {
        message: Message,
    },
    MessagesSeen,
    /// `papercups:open`: asks the embedder to play its open animation.
    OpenRequested,
    /// `papercups:close`: informational; closing happens via toggle.
    CloseRequested,
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ChatLoaded => "chat:loaded",
            Self::CustomerCreated { .. } => "customer:created",
            Self::CustomerUpdated { .. } => "customer:updated",
            Self::ConversationJoin { .. } => "conversation:join",
            Self::MessageSent { .. } => "message:sent",
            Self::MessageReceived(_) => "message:received",
            Self::MessagesUnseen { .. } => "messages:unseen",
            Self::MessagesSeen => "messages:seen",
            Self::OpenRequested => "papercups:open",
            Self::CloseRequested => "papercups:close",
        }
    }

    /// Render as a `{"event", "payload"}` frame. Message bodies keep their
    /// snake_case wire fields; identifier payloads use camelCase keys.
    pub fn to_frame(&self) -> Value {
        let payload = match self {
            Self::ChatLoaded | Self::MessagesSeen | Self::OpenRequested | Self::CloseRequested => {
                json!({})
            }
            Self::CustomerCreated { customer_id } | Self::CustomerUpdated { customer_id } => {
                json!({ "customerId": customer_id })
            }
            Self::ConversationJoin {
                conversation_id,
                customer_id,
            } => json!({
                "conversationId": conversation_id,
                "customerId": customer_id,
            }),
            Self::MessageSent {
                message,
                conversation_id,
            } => {
                let mut payload = serde_json::to_value(message).unwrap_or_else(|_| json!({}));
                if let Some(obj) = payload.as_object_mut() {
                    obj.insert("conversation_id".to_string(), json!(conversation_id));
                }
                payload
            }
            Self::MessageReceived(message) => {
                serde_json::to_value(message).unwrap_or_else(|_| json!({}))
            }
            Self::MessagesUnseen { message } => json!({ "message": message }),
        };
        json!({ "event": self.name(), "payload": payload })
    }
}
