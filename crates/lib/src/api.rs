//! REST backend client for customer and conversation operations.
//!
//! Every endpoint wraps its result in a `{"data": ...}` envelope. The
//! `WidgetApi` trait is the seam used by the session core; `HttpApi` is the
//! production implementation.

use crate::message::Message;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected response shape: {0}")]
    Decode(String),
}

/// Identifying fields the embedder attaches to the visitor (`name`, `email`,
/// `external_id`, plus arbitrary extras passed through as-is).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomerMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl CustomerMetadata {
    /// Decode a stringified metadata blob; malformed JSON degrades to empty.
    pub fn from_json_str(s: &str) -> Self {
        serde_json::from_str(s).unwrap_or_default()
    }

    /// True when no identifying field is set.
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.email.is_none()
            && self.external_id.is_none()
            && self.extra.is_empty()
    }

    /// Metadata with the email filled in (captured at first send).
    pub fn with_email(&self, email: Option<&str>) -> Self {
        let mut metadata = self.clone();
        if let Some(email) = email {
            metadata.email = Some(email.to_string());
        }
        metadata
    }
}

/// One conversation as returned by the backend, with its raw message history.
#[derive(Debug, Clone, Deserialize)]
pub struct Conversation {
    pub id: String,
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

#[derive(Debug, Deserialize)]
struct DataEnvelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct IdPayload {
    id: String,
}

#[derive(Debug, Deserialize)]
struct IdentifyPayload {
    #[serde(default)]
    customer_id: Option<String>,
}

/// Backend operations the widget consumes. Implemented by `HttpApi` in
/// production and by in-memory stubs in tests.
#[async_trait]
pub trait WidgetApi: Send + Sync {
    /// Create a customer; returns the new customer id.
    async fn create_customer(
        &self,
        account_id: &str,
        metadata: &CustomerMetadata,
    ) -> Result<String, ApiError>;

    /// Check whether a cached customer id still exists under the account.
    async fn customer_exists(&self, customer_id: &str, account_id: &str)
        -> Result<bool, ApiError>;

    /// Update identifying metadata on an existing customer.
    async fn update_customer_metadata(
        &self,
        customer_id: &str,
        metadata: &CustomerMetadata,
    ) -> Result<(), ApiError>;

    /// Find a customer by the embedder-provided external id.
    async fn find_customer_by_external_id(
        &self,
        external_id: &str,
        account_id: &str,
    ) -> Result<Option<String>, ApiError>;

    /// Create a conversation for a customer; returns the conversation id.
    async fn create_conversation(
        &self,
        account_id: &str,
        customer_id: &str,
    ) -> Result<String, ApiError>;

    /// Fetch a customer's conversations, most recent first.
    async fn fetch_customer_conversations(
        &self,
        customer_id: &str,
        account_id: &str,
    ) -> Result<Vec<Conversation>, ApiError>;
}

/// `WidgetApi` over HTTP (reqwest).
pub struct HttpApi {
    base_url: String,
    client: reqwest::Client,
}

impl HttpApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        res: reqwest::Response,
    ) -> Result<T, ApiError> {
        if !res.status().is_success() {
            let status = res.status().as_u16();
            let body = res.text().await.unwrap_or_default();
            return Err(ApiError::Status { status, body });
        }
        let envelope: DataEnvelope<T> = res
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))?;
        Ok(envelope.data)
    }
}

#[async_trait]
impl WidgetApi for HttpApi {
    async fn create_customer(
        &self,
        account_id: &str,
        metadata: &CustomerMetadata,
    ) -> Result<String, ApiError> {
        let url = format!("{}/api/customers", self.base_url);
        let mut customer = serde_json::to_value(metadata)
            .map_err(|e| ApiError::Decode(e.to_string()))?;
        if let Some(obj) = customer.as_object_mut() {
            let now = Utc::now();
            obj.insert("account_id".to_string(), json!(account_id));
            obj.insert("first_seen".to_string(), json!(now));
            obj.insert("last_seen".to_string(), json!(now));
        }
        let res = self
            .client
            .post(&url)
            .json(&json!({ "customer": customer }))
            .send()
            .await?;
        let payload: IdPayload = Self::decode(res).await?;
        Ok(payload.id)
    }

    async fn customer_exists(
        &self,
        customer_id: &str,
        account_id: &str,
    ) -> Result<bool, ApiError> {
        let url = format!("{}/api/customers/{}/exists", self.base_url, customer_id);
        let res = self
            .client
            .get(&url)
            .query(&[("account_id", account_id)])
            .send()
            .await?;
        Self::decode(res).await
    }

    async fn update_customer_metadata(
        &self,
        customer_id: &str,
        metadata: &CustomerMetadata,
    ) -> Result<(), ApiError> {
        let url = format!("{}/api/customers/{}/metadata", self.base_url, customer_id);
        let res = self
            .client
            .put(&url)
            .json(&json!({ "metadata": metadata }))
            .send()
            .await?;
        let _: serde_json::Value = Self::decode(res).await?;
        Ok(())
    }

    async fn find_customer_by_external_id(
        &self,
        external_id: &str,
        account_id: &str,
    ) -> Result<Option<String>, ApiError> {
        let url = format!("{}/api/customers/identify", self.base_url);
        let res = self
            .client
            .get(&url)
            .query(&[("external_id", external_id), ("account_id", account_id)])
            .send()
            .await?;
        let payload: IdentifyPayload = Self::decode(res).await?;
        Ok(payload.customer_id)
    }

    async fn create_conversation(
        &self,
        account_id: &str,
        customer_id: &str,
    ) -> Result<String, ApiError> {
        let url = format!("{}/api/conversations", self.base_url);
        let res = self
            .client
            .post(&url)
            .json(&json!({
                "conversation": {
                    "account_id": account_id,
                    "customer_id": customer_id,
                }
            }))
            .send()
            .await?;
        let payload: IdPayload = Self::decode(res).await?;
        Ok(payload.id)
    }

    async fn fetch_customer_conversations(
        &self,
        customer_id: &str,
        account_id: &str,
    ) -> Result<Vec<Conversation>, ApiError> {
        let url = format!("{}/api/conversations/customer", self.base_url);
        let res = self
            .client
            .get(&url)
            .query(&[("customer_id", customer_id), ("account_id", account_id)])
            .send()
            .await?;
        Self::decode(res).await
    }
}
