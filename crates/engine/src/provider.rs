//! Provider read API.
//!
//! Used only by the reconciliation job. The provider list endpoint is
//! treated as eventually consistent and rate limited; callers are expected
//! to back off on [`SyncError::RateLimited`].

use async_trait::async_trait;
use serde::Deserialize;
use uuid::Uuid;

use crate::config::ProviderConfig;
use crate::error::{SyncError, SyncResult};
use crate::event::{PlanTier, SubscriptionStatus};

/// One subscription as reported by the provider's list endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSubscription {
    pub id: String,
    #[serde(default)]
    pub account_id: Option<Uuid>,
    #[serde(default)]
    pub customer_id: Option<String>,
    pub status: SubscriptionStatus,
    #[serde(default)]
    pub plan_tier: Option<PlanTier>,
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub trial_end: Option<i64>,
    #[serde(default)]
    pub cancel_at_period_end: Option<bool>,
    #[serde(default)]
    pub amount_cents: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub billing_interval: Option<String>,
    /// Provider-side last-modified time (unix seconds). Used as the
    /// `source_event_timestamp` for reconciliation writes.
    pub updated_at: i64,
}

/// One page of the provider's subscription list.
#[derive(Debug, Clone)]
pub struct ProviderPage {
    pub records: Vec<ProviderSubscription>,
    pub next_cursor: Option<String>,
}

/// Read access to the provider's authoritative subscription list.
#[async_trait]
pub trait ProviderApi: Send + Sync {
    async fn list_subscriptions(&self, cursor: Option<&str>) -> SyncResult<ProviderPage>;
}

/// HTTP implementation of the provider read API.
pub struct HttpProviderApi {
    client: reqwest::Client,
    config: ProviderConfig,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    data: Vec<ProviderSubscription>,
    #[serde(default)]
    has_more: bool,
}

impl HttpProviderApi {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl ProviderApi for HttpProviderApi {
    async fn list_subscriptions(&self, cursor: Option<&str>) -> SyncResult<ProviderPage> {
        let url = format!(
            "{}/v1/subscriptions",
            self.config.base_url.trim_end_matches('/')
        );

        let mut request = self
            .client
            .get(&url)
            .bearer_auth(&self.config.api_key)
            .query(&[("limit", self.config.page_limit.to_string())]);
        if let Some(cursor) = cursor {
            request = request.query(&[("starting_after", cursor)]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SyncError::Provider(e.to_string()))?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            return Err(SyncError::RateLimited { retry_after_secs });
        }

        if !response.status().is_success() {
            return Err(SyncError::Provider(format!(
                "list subscriptions returned {}",
                response.status()
            )));
        }

        let body: ListResponse = response
            .json()
            .await
            .map_err(|e| SyncError::Provider(e.to_string()))?;

        let next_cursor = if body.has_more {
            body.data.last().map(|r| r.id.clone())
        } else {
            None
        };

        Ok(ProviderPage {
            records: body.data,
            next_cursor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base_url: String) -> ProviderConfig {
        ProviderConfig {
            base_url,
            api_key: "sk_test_xxx".to_string(),
            page_limit: 2,
        }
    }

    fn page_body(ids: &[&str], has_more: bool) -> String {
        let data: Vec<serde_json::Value> = ids
            .iter()
            .map(|id| {
                serde_json::json!({
                    "id": id,
                    "customer_id": "cus_1",
                    "status": "active",
                    "plan_tier": "pro",
                    "updated_at": 1000,
                })
            })
            .collect();
        serde_json::json!({ "data": data, "has_more": has_more }).to_string()
    }

    #[tokio::test]
    async fn first_page_reports_next_cursor() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/subscriptions")
            .match_query(mockito::Matcher::UrlEncoded("limit".into(), "2".into()))
            .with_status(200)
            .with_body(page_body(&["sub_1", "sub_2"], true))
            .create_async()
            .await;

        let api = HttpProviderApi::new(config(server.url()));
        let page = api.list_subscriptions(None).await.unwrap();

        assert_eq!(page.records.len(), 2);
        assert_eq!(page.next_cursor.as_deref(), Some("sub_2"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn cursor_is_forwarded_and_final_page_ends_pagination() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/subscriptions")
            .match_query(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("limit".into(), "2".into()),
                mockito::Matcher::UrlEncoded("starting_after".into(), "sub_2".into()),
            ]))
            .with_status(200)
            .with_body(page_body(&["sub_3"], false))
            .create_async()
            .await;

        let api = HttpProviderApi::new(config(server.url()));
        let page = api.list_subscriptions(Some("sub_2")).await.unwrap();

        assert_eq!(page.records.len(), 1);
        assert!(page.next_cursor.is_none());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn rate_limit_surfaces_retry_after() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/subscriptions")
            .match_query(mockito::Matcher::Any)
            .with_status(429)
            .with_header("retry-after", "30")
            .create_async()
            .await;

        let api = HttpProviderApi::new(config(server.url()));
        match api.list_subscriptions(None).await {
            Err(SyncError::RateLimited { retry_after_secs }) => {
                assert_eq!(retry_after_secs, Some(30));
            }
            other => panic!("expected RateLimited, got {:?}", other.map(|p| p.records.len())),
        }
    }

    #[tokio::test]
    async fn server_error_is_a_provider_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/subscriptions")
            .match_query(mockito::Matcher::Any)
            .with_status(500)
            .create_async()
            .await;

        let api = HttpProviderApi::new(config(server.url()));
        assert!(matches!(
            api.list_subscriptions(None).await,
            Err(SyncError::Provider(_))
        ));
    }
}
