//! Customer identity resolution.
//!
//! A returning visitor is identified either by the embedder-provided
//! `external_id` (authoritative) or by the customer id the embedding page
//! cached across page loads. Validation failures degrade to "no known
//! customer" so a stale or foreign cached value never breaks the widget.

use crate::api::{ApiError, CustomerMetadata, WidgetApi};
use std::sync::Arc;
use uuid::Uuid;

/// Outcome of identity resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// A customer was identified. `changed` is set when the id differs from
    /// the cached one, so the embedder can refresh its cache.
    Known { customer_id: String, changed: bool },
    /// No customer yet; creation is deferred until the first send.
    Unknown,
}

/// Result of `create_or_update`: the effective customer id and whether a
/// brand-new customer was created (vs. an existing one updated).
#[derive(Debug, Clone, PartialEq)]
pub struct CreateOrUpdate {
    pub customer_id: String,
    pub created: bool,
}

pub struct CustomerResolver {
    api: Arc<dyn WidgetApi>,
    account_id: String,
}

impl CustomerResolver {
    pub fn new(api: Arc<dyn WidgetApi>, account_id: impl Into<String>) -> Self {
        Self {
            api,
            account_id: account_id.into(),
        }
    }

    /// Resolve the visitor's identity from the cached id and metadata.
    ///
    /// When metadata carries an `external_id` it takes precedence: the match
    /// from the backend wins over the cached id, and no match means no
    /// customer (even when a cached id exists). Without an `external_id` the
    /// cached id is used, subject to a format check and a backend existence
    /// check.
    pub async fn resolve(
        &self,
        cached_id: Option<&str>,
        metadata: &CustomerMetadata,
    ) -> Resolution {
        if let Some(external_id) = metadata.external_id.as_deref() {
            return match self
                .api
                .find_customer_by_external_id(external_id, &self.account_id)
                .await
            {
                Ok(Some(customer_id)) => {
                    let changed = cached_id != Some(customer_id.as_str());
                    Resolution::Known {
                        customer_id,
                        changed,
                    }
                }
                Ok(None) => Resolution::Unknown,
                Err(e) => {
                    log::debug!("external id lookup failed: {}", e);
                    Resolution::Unknown
                }
            };
        }

        let Some(cached_id) = cached_id else {
            return Resolution::Unknown;
        };
        if Uuid::parse_str(cached_id).is_err() {
            // Older embed scripts cached non-UUID tokens; treat as absent.
            log::debug!("cached customer id is not a valid uuid, ignoring");
            return Resolution::Unknown;
        }
        match self.api.customer_exists(cached_id, &self.account_id).await {
            Ok(true) => Resolution::Known {
                customer_id: cached_id.to_string(),
                changed: false,
            },
            Ok(false) => Resolution::Unknown,
            Err(e) => {
                // A request failure (as opposed to a negative result) is
                // treated as valid so deployments without the existence
                // endpoint keep working.
                log::debug!("customer existence check failed, assuming valid: {}", e);
                Resolution::Known {
                    customer_id: cached_id.to_string(),
                    changed: false,
                }
            }
        }
    }

    /// Ensure a customer exists, updating metadata on an existing one or
    /// creating a new one. An update failure falls back to outright creation;
    /// a creation failure propagates to the caller.
    pub async fn create_or_update(
        &self,
        existing_id: Option<&str>,
        metadata: &CustomerMetadata,
    ) -> Result<CreateOrUpdate, ApiError> {
        if let Some(customer_id) = existing_id {
            match self
                .api
                .update_customer_metadata(customer_id, metadata)
                .await
            {
                Ok(()) => {
                    return Ok(CreateOrUpdate {
                        customer_id: customer_id.to_string(),
                        created: false,
                    })
                }
                Err(e) => {
                    log::warn!(
                        "metadata update for {} failed, creating a new customer: {}",
                        customer_id,
                        e
                    );
                }
            }
        }
        let customer_id = self
            .api
            .create_customer(&self.account_id, metadata)
            .await?;
        log::info!("created customer {}", customer_id);
        Ok(CreateOrUpdate {
            customer_id,
            created: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Conversation;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const VALID_UUID: &str = "6b29fc40-ca47-1067-b31d-00dd010662da";

    #[derive(Default)]
    struct StubApi {
        identify_result: Option<String>,
        identify_fails: bool,
        exists: bool,
        exists_fails: bool,
        update_fails: bool,
        create_fails: bool,
        create_calls: AtomicUsize,
        update_calls: AtomicUsize,
    }

    fn err() -> ApiError {
        ApiError::Status {
            status: 500,
            body: "boom".to_string(),
        }
    }

    #[async_trait]
    impl WidgetApi for StubApi {
        async fn create_customer(
            &self,
            _account_id: &str,
            _metadata: &CustomerMetadata,
        ) -> Result<String, ApiError> {
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            if self.create_fails {
                return Err(err());
            }
            Ok("cust-new".to_string())
        }

        async fn customer_exists(
            &self,
            _customer_id: &str,
            _account_id: &str,
        ) -> Result<bool, ApiError> {
            if self.exists_fails {
                return Err(err());
            }
            Ok(self.exists)
        }

        async fn update_customer_metadata(
            &self,
            _customer_id: &str,
            _metadata: &CustomerMetadata,
        ) -> Result<(), ApiError> {
            self.update_calls.fetch_add(1, Ordering::SeqCst);
            if self.update_fails {
                return Err(err());
            }
            Ok(())
        }

        async fn find_customer_by_external_id(
            &self,
            _external_id: &str,
            _account_id: &str,
        ) -> Result<Option<String>, ApiError> {
            if self.identify_fails {
                return Err(err());
            }
            Ok(self.identify_result.clone())
        }

        async fn create_conversation(
            &self,
            _account_id: &str,
            _customer_id: &str,
        ) -> Result<String, ApiError> {
            unimplemented!("not used by resolver tests")
        }

        async fn fetch_customer_conversations(
            &self,
            _customer_id: &str,
            _account_id: &str,
        ) -> Result<Vec<Conversation>, ApiError> {
            unimplemented!("not used by resolver tests")
        }
    }

    fn resolver(api: StubApi) -> CustomerResolver {
        CustomerResolver::new(Arc::new(api), "acct-1")
    }

    fn external(id: &str) -> CustomerMetadata {
        CustomerMetadata {
            external_id: Some(id.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn external_id_match_overrides_cached_id() {
        let r = resolver(StubApi {
            identify_result: Some("cust-2".to_string()),
            ..Default::default()
        });
        let resolution = r.resolve(Some("cust-1"), &external("abc")).await;
        assert_eq!(
            resolution,
            Resolution::Known {
                customer_id: "cust-2".to_string(),
                changed: true,
            }
        );
    }

    #[tokio::test]
    async fn external_id_without_match_means_no_customer() {
        // Cached id exists, but the external id is authoritative.
        let r = resolver(StubApi::default());
        let resolution = r.resolve(Some("cust-1"), &external("abc")).await;
        assert_eq!(resolution, Resolution::Unknown);
    }

    #[tokio::test]
    async fn malformed_cached_id_is_ignored() {
        let r = resolver(StubApi {
            exists: true,
            ..Default::default()
        });
        let resolution = r.resolve(Some("not-a-uuid"), &CustomerMetadata::default()).await;
        assert_eq!(resolution, Resolution::Unknown);
    }

    #[tokio::test]
    async fn cached_id_validated_against_backend() {
        let r = resolver(StubApi {
            exists: true,
            ..Default::default()
        });
        let resolution = r.resolve(Some(VALID_UUID), &CustomerMetadata::default()).await;
        assert_eq!(
            resolution,
            Resolution::Known {
                customer_id: VALID_UUID.to_string(),
                changed: false,
            }
        );
    }

    #[tokio::test]
    async fn existence_request_failure_is_treated_as_valid() {
        let r = resolver(StubApi {
            exists_fails: true,
            ..Default::default()
        });
        let resolution = r.resolve(Some(VALID_UUID), &CustomerMetadata::default()).await;
        assert!(matches!(resolution, Resolution::Known { changed: false, .. }));
    }

    #[tokio::test]
    async fn update_failure_falls_back_to_creation() {
        let api = StubApi {
            update_fails: true,
            ..Default::default()
        };
        let r = resolver(api);
        let outcome = r
            .create_or_update(Some("cust-1"), &CustomerMetadata::default())
            .await
            .unwrap();
        assert_eq!(outcome.customer_id, "cust-new");
        assert!(outcome.created);
    }

    #[tokio::test]
    async fn update_success_does_not_create() {
        let r = resolver(StubApi::default());
        let outcome = r
            .create_or_update(Some("cust-1"), &CustomerMetadata::default())
            .await
            .unwrap();
        assert_eq!(outcome.customer_id, "cust-1");
        assert!(!outcome.created);
    }

    #[tokio::test]
    async fn create_failure_propagates() {
        let r = resolver(StubApi {
            create_fails: true,
            ..Default::default()
        });
        assert!(r
            .create_or_update(None, &CustomerMetadata::default())
            .await
            .is_err());
    }
}
