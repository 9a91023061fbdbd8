//! Widget configuration parsing.
//!
//! Embedding pages pass config through a query string, so every boolean-ish
//! field arrives as a `"0"`/`"1"` string and customer metadata arrives as a
//! stringified JSON blob. `RawWidgetConfig` mirrors that wire shape;
//! `WidgetConfig` is the parsed form with defaults applied.

use crate::api::CustomerMetadata;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_BASE_URL: &str = "https://app.papercups.io";

/// Config as received from the embedder (query string or `config:update`
/// payload): strings everywhere.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawWidgetConfig {
    pub account_id: Option<String>,
    pub customer_id: Option<String>,
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub primary_color: Option<String>,
    pub base_url: Option<String>,
    pub greeting: Option<String>,
    pub company_name: Option<String>,
    pub new_message_placeholder: Option<String>,
    pub email_input_placeholder: Option<String>,
    pub new_messages_notification_text: Option<String>,
    pub agent_available_text: Option<String>,
    pub agent_unavailable_text: Option<String>,
    pub show_agent_availability: Option<String>,
    pub require_email_upfront: Option<String>,
    pub closeable: Option<String>,
    pub mobile: Option<String>,
    /// Stringified CustomerMetadata JSON.
    pub metadata: Option<String>,
    pub version: Option<String>,
}

/// Parsed widget configuration.
#[derive(Debug, Clone)]
pub struct WidgetConfig {
    pub account_id: String,
    /// Customer id cached by the embedding page across page loads.
    pub customer_id: Option<String>,
    pub title: String,
    pub subtitle: String,
    pub primary_color: String,
    pub base_url: String,
    pub greeting: Option<String>,
    pub company_name: Option<String>,
    pub new_message_placeholder: String,
    pub email_input_placeholder: String,
    pub new_messages_notification_text: String,
    pub agent_available_text: String,
    pub agent_unavailable_text: String,
    pub show_agent_availability: bool,
    pub require_email_upfront: bool,
    pub closeable: bool,
    pub mobile: bool,
    pub customer: CustomerMetadata,
    /// Embedder script version, used for the deprecated-client gate.
    pub version: String,
}

/// `!!Number(x)` semantics from the embedder script: any string parsing to a
/// nonzero number is true, everything else (including garbage) is false.
fn flag(value: Option<&str>, default: bool) -> bool {
    match value {
        Some(s) => s.trim().parse::<f64>().map(|n| n != 0.0).unwrap_or(false),
        None => default,
    }
}

fn or_default(value: Option<String>, default: &str) -> String {
    value.filter(|s| !s.is_empty()).unwrap_or_else(|| default.to_string())
}

impl RawWidgetConfig {
    /// Apply defaults and decode stringified fields. `account_id` is the only
    /// required field.
    pub fn parse(self) -> anyhow::Result<WidgetConfig> {
        let account_id = self
            .account_id
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow::anyhow!("missing accountId in widget config"))?;
        let customer = self
            .metadata
            .as_deref()
            .map(CustomerMetadata::from_json_str)
            .unwrap_or_default();
        Ok(WidgetConfig {
            account_id,
            customer_id: self.customer_id.filter(|s| !s.is_empty()),
            title: or_default(self.title, "Welcome!"),
            subtitle: or_default(self.subtitle, "How can we help you?"),
            primary_color: or_default(self.primary_color, "1890ff"),
            base_url: or_default(self.base_url, DEFAULT_BASE_URL),
            greeting: self.greeting.filter(|s| !s.is_empty()),
            company_name: self.company_name.filter(|s| !s.is_empty()),
            new_message_placeholder: or_default(self.new_message_placeholder, "Start typing..."),
            email_input_placeholder: or_default(self.email_input_placeholder, "Enter your email"),
            new_messages_notification_text: or_default(
                self.new_messages_notification_text,
                "View new messages",
            ),
            agent_available_text: or_default(
                self.agent_available_text,
                "We're online right now!",
            ),
            agent_unavailable_text: or_default(
                self.agent_unavailable_text,
                "We're away at the moment.",
            ),
            show_agent_availability: flag(self.show_agent_availability.as_deref(), false),
            require_email_upfront: flag(self.require_email_upfront.as_deref(), false),
            closeable: flag(self.closeable.as_deref(), true),
            mobile: flag(self.mobile.as_deref(), false),
            customer,
            version: or_default(self.version, "1.0.0"),
        })
    }
}

impl WidgetConfig {
    /// Merge a sanitized subset of fields from a `config:update` payload.
    /// Customer identity fields (customerId, metadata) are deliberately not
    /// merged through this path.
    pub fn apply_update(&mut self, payload: &Value) {
        let updates: RawWidgetConfig = match serde_json::from_value(payload.clone()) {
            Ok(u) => u,
            Err(err) => {
                log::debug!("ignoring malformed config:update payload: {}", err);
                return;
            }
        };
        if let Some(v) = updates.account_id.filter(|s| !s.is_empty()) {
            self.account_id = v;
        }
        if let Some(v) = updates.base_url.filter(|s| !s.is_empty()) {
            self.base_url = v;
        }
        if let Some(v) = updates.title {
            self.title = v;
        }
        if let Some(v) = updates.subtitle {
            self.subtitle = v;
        }
        if let Some(v) = updates.primary_color {
            self.primary_color = v;
        }
        if let Some(v) = updates.greeting {
            self.greeting = Some(v).filter(|s| !s.is_empty());
        }
        if let Some(v) = updates.company_name {
            self.company_name = Some(v);
        }
        if let Some(v) = updates.new_message_placeholder {
            self.new_message_placeholder = v;
        }
        if let Some(v) = updates.email_input_placeholder {
            self.email_input_placeholder = v;
        }
        if let Some(v) = updates.new_messages_notification_text {
            self.new_messages_notification_text = v;
        }
        if let Some(v) = updates.agent_available_text {
            self.agent_available_text = v;
        }
        if let Some(v) = updates.agent_unavailable_text {
            self.agent_unavailable_text = v;
        }
        if updates.show_agent_availability.is_some() {
            self.show_agent_availability = flag(updates.show_agent_availability.as_deref(), false);
        }
        if updates.closeable.is_some() {
            self.closeable = flag(updates.closeable.as_deref(), true);
        }
        if let Some(v) = updates.version.filter(|s| !s.is_empty()) {
            self.version = v;
        }
    }

    /// Phoenix websocket endpoint derived from the REST base URL.
    pub fn websocket_url(&self) -> String {
        let (scheme, host) = match self.base_url.split_once("://") {
            Some((s, h)) => (s, h),
            None => ("https", self.base_url.as_str()),
        };
        let ws = if scheme == "https" { "wss" } else { "ws" };
        format!("{}://{}/socket/websocket?vsn=2.0.0", ws, host)
    }

    /// Legacy embed scripts predate the notification pop-up flow and need the
    /// fallback rendering path. The comparison is field-wise on the version
    /// string, kept exactly as the embedder shipped it (`1.0.3` escapes the
    /// gate while the newer `1.1.2` does not; not true semver ordering).
    pub fn is_deprecated_embed(&self) -> bool {
        let mut parts = self.version.split('.').map(|p| p.trim().parse::<u32>());
        let (major, minor, patch) = match (parts.next(), parts.next(), parts.next()) {
            (Some(Ok(a)), Some(Ok(b)), Some(Ok(c))) => (a, b, c),
            _ => return false,
        };
        major <= 1 && minor <= 1 && patch <= 2
    }
}
