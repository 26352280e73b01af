//! Wildberries card and detail endpoints

use std::sync::Arc;
use tracing::debug;

use crate::domain::listing::{ProductSummary, WbCard, WbDetail};
use crate::domain::shard::{self, ShardAddress};
use crate::infrastructure::http_client::{FetchError, MarketplaceClient};

const DETAIL_QUERY: &str = "appType=1&curr=rub&dest=-1257786&spp=30&hide_vflags=4294967296&hide_dtype=9;11&ab_testing=false&lang=ru";

/// Where the Wildberries endpoints live
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WbEndpoints {
    /// Page visited to collect session cookies
    pub home: String,
    pub detail_base: String,
    /// Replaces the sharded CDN host, e.g. for a local responder
    pub card_base_override: Option<String>,
}

impl Default for WbEndpoints {
    fn default() -> Self {
        Self {
            home: "https://www.wildberries.ru/".to_string(),
            detail_base: "https://www.wildberries.ru".to_string(),
            card_base_override: None,
        }
    }
}

impl WbEndpoints {
    #[must_use]
    pub fn card_url(&self, address: &ShardAddress, nm_id: &str) -> String {
        match &self.card_base_override {
            Some(base) => format!(
                "{}/vol{}/part{}/{}/info/ru/card.json",
                base.trim_end_matches('/'),
                address.volume_id,
                address.id_prefix,
                nm_id
            ),
            None => address.card_url(nm_id),
        }
    }

    #[must_use]
    pub fn detail_url(&self, nm_id: &str) -> String {
        format!(
            "{}/__internal/u-card/cards/v4/detail?{}&nm={}",
            self.detail_base.trim_end_matches('/'),
            DETAIL_QUERY,
            nm_id
        )
    }
}

pub struct WildberriesClient {
    http: Arc<MarketplaceClient>,
    endpoints: WbEndpoints,
}

impl WildberriesClient {
    #[must_use]
    pub fn new(http: Arc<MarketplaceClient>, endpoints: WbEndpoints) -> Self {
        Self { http, endpoints }
    }

    #[must_use]
    pub fn endpoints(&self) -> &WbEndpoints {
        &self.endpoints
    }

    #[must_use]
    pub fn http(&self) -> &MarketplaceClient {
        &self.http
    }

    /// Card document from the item's CDN shard
    pub async fn fetch_card(&self, nm_id: &str) -> Result<WbCard, FetchError> {
        let address = shard::resolve(nm_id)
            .map_err(|_| FetchError::InvalidIdentifier(nm_id.to_string()))?;
        debug!("Card {} lives on basket-{}", nm_id, address.shard_id);
        let url = self.endpoints.card_url(&address, nm_id);
        self.http.get_json(&url, &[]).await
    }

    pub async fn fetch_detail(&self, nm_id: &str) -> Result<WbDetail, FetchError> {
        if nm_id.is_empty() || !nm_id.bytes().all(|b| b.is_ascii_digit()) {
            return Err(FetchError::InvalidIdentifier(nm_id.to_string()));
        }
        let url = self.endpoints.detail_url(nm_id);
        self.http
            .get_json(&url, &MarketplaceClient::xhr_headers())
            .await
    }

    /// Card and detail combined into cell values
    pub async fn product_summary(&self, nm_id: &str) -> Result<ProductSummary, FetchError> {
        let card = self.fetch_card(nm_id).await?;
        let detail = self.fetch_detail(nm_id).await?;
        Ok(ProductSummary::from_documents(&card, &detail))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::http_client::{MarketplaceClientConfig, SessionContext};
    use crate::infrastructure::retry_manager::RetryPolicy;
    use crate::test_utils::{StubHttpServer, StubResponse};
    use std::time::Duration;
    use url::Url;

    fn client_for(server: &StubHttpServer) -> WildberriesClient {
        let config = MarketplaceClientConfig {
            max_requests_per_second: 1_000,
            random_delay_ms: (0, 0),
            retry: RetryPolicy {
                base_delay: Duration::from_millis(5),
                ..RetryPolicy::default()
            },
            ..MarketplaceClientConfig::default()
        };
        let session = SessionContext::new(Url::parse(&server.url("/")).unwrap());
        let http = Arc::new(MarketplaceClient::new(config, session).unwrap());
        WildberriesClient::new(
            http,
            WbEndpoints {
                home: server.url("/"),
                detail_base: server.url(""),
                card_base_override: Some(server.url("")),
            },
        )
    }

    #[test]
    fn builds_production_urls() {
        let endpoints = WbEndpoints::default();
        let address = shard::resolve("123456789").unwrap();
        assert_eq!(
            endpoints.card_url(&address, "123456789"),
            "https://basket-09.wbbasket.ru/vol1234/part123456/123456789/info/ru/card.json"
        );
        let detail = endpoints.detail_url("123456789");
        assert!(detail.starts_with("https://www.wildberries.ru/__internal/u-card/cards/v4/detail?appType=1"));
        assert!(detail.ends_with("&nm=123456789"));
    }

    #[tokio::test]
    async fn summary_combines_card_and_detail() {
        let server = StubHttpServer::start(|request| {
            if request.target.ends_with("/card.json") {
                StubResponse::json(200, r#"{"options":[{"name":"Тип экрана","value":"IPS"}]}"#)
            } else {
                StubResponse::json(
                    200,
                    r#"{"products":[{"sizes":[{"price":{"basic":250000,"product":199900}}],"rating":4.7,"feedbacks":12,"brand":"Acme"}]}"#,
                )
            }
        })
        .await;
        let client = client_for(&server);

        let summary = client.product_summary("123456789").await.unwrap();
        assert_eq!(summary.price, "1999");
        assert_eq!(summary.rating_reviews, "4.7 / 12");
        assert_eq!(summary.display_or_battery(), "IPS");
        assert!(summary.has_promo);

        let requests = server.requests();
        assert_eq!(requests[0].target, "/vol1234/part123456/123456789/info/ru/card.json");
        assert_eq!(requests[1].header("x-requested-with"), Some("XMLHttpRequest"));
    }

    #[tokio::test]
    async fn rejects_non_numeric_ids_without_network() {
        let server = StubHttpServer::sequence(vec![]).await;
        let client = client_for(&server);

        assert!(matches!(
            client.product_summary("12ab").await,
            Err(FetchError::InvalidIdentifier(_))
        ));
        assert!(server.requests().is_empty());
    }
}
