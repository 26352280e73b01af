//! Ozon composer API price lookup

use std::sync::Arc;
use tracing::debug;

use crate::domain::listing::{OzonPage, OzonPriceOutcome};
use crate::infrastructure::http_client::{FetchError, MarketplaceClient};
use crate::infrastructure::retry_manager::execute_with_policy;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OzonEndpoints {
    pub home: String,
    pub api_base: String,
}

impl Default for OzonEndpoints {
    fn default() -> Self {
        Self {
            home: "https://www.ozon.ru/".to_string(),
            api_base: "https://www.ozon.ru".to_string(),
        }
    }
}

impl OzonEndpoints {
    #[must_use]
    pub fn price_url(&self, article: &str) -> String {
        format!(
            "{}/api/composer-api.bx/page/json/v2?url=/product/{}",
            self.api_base.trim_end_matches('/'),
            article
        )
    }
}

pub struct OzonClient {
    http: Arc<MarketplaceClient>,
    endpoints: OzonEndpoints,
}

impl OzonClient {
    #[must_use]
    pub fn new(http: Arc<MarketplaceClient>, endpoints: OzonEndpoints) -> Self {
        Self { http, endpoints }
    }

    #[must_use]
    pub fn endpoints(&self) -> &OzonEndpoints {
        &self.endpoints
    }

    #[must_use]
    pub fn http(&self) -> &MarketplaceClient {
        &self.http
    }

    /// Current price digits of an article.
    ///
    /// The price widget is decoded inside the retried operation, so a
    /// garbled widget payload is retried like any other malformed body.
    pub async fn fetch_price(&self, article: &str) -> Result<String, FetchError> {
        if article.is_empty() || !article.bytes().all(|b| b.is_ascii_digit()) {
            return Err(FetchError::InvalidIdentifier(article.to_string()));
        }

        let url = self.endpoints.price_url(article);
        let headers = MarketplaceClient::xhr_headers();
        let policy = *self.http.retry_policy();

        let outcome = execute_with_policy(&url, &policy, || async {
            let page: OzonPage = self.http.get_json_once(&url, &headers).await?;
            page.price()
                .map_err(|e| FetchError::MalformedBody(format!("webPrice widget: {e}")))
        })
        .await?;

        match outcome {
            OzonPriceOutcome::Price(price) => Ok(price),
            OzonPriceOutcome::Unavailable => {
                debug!("Article {} is unavailable", article);
                Err(FetchError::ItemUnavailable)
            }
            OzonPriceOutcome::Missing => {
                debug!("No price widget for article {}", article);
                Err(FetchError::NoData)
            }
        }
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

    fn client_for(server: &StubHttpServer) -> OzonClient {
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
        OzonClient::new(
            http,
            OzonEndpoints {
                home: server.url("/"),
                api_base: server.url(""),
            },
        )
    }

    #[tokio::test]
    async fn garbled_widget_is_retried() {
        let server = StubHttpServer::sequence(vec![
            StubResponse::json(200, r#"{"widgetStates":{"webPrice-1":"{broken"}}"#),
            StubResponse::json(
                200,
                r#"{"widgetStates":{"webPrice-1":"{\"isAvailable\":true,\"price\":\"1 490 ₽\"}"}}"#,
            ),
        ])
        .await;
        let client = client_for(&server);

        assert_eq!(client.fetch_price("987654").await.unwrap(), "1490");
        let requests = server.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(
            requests[0].target,
            "/api/composer-api.bx/page/json/v2?url=/product/987654"
        );
    }

    #[tokio::test]
    async fn unavailable_and_missing_are_terminal() {
        let server = StubHttpServer::sequence(vec![
            StubResponse::json(200, r#"{"widgetStates":{"webPrice-1":{"isAvailable":false}}}"#),
            StubResponse::json(200, r#"{"widgetStates":{}}"#),
        ])
        .await;
        let client = client_for(&server);

        assert_eq!(client.fetch_price("1").await, Err(FetchError::ItemUnavailable));
        assert_eq!(client.fetch_price("2").await, Err(FetchError::NoData));
        assert_eq!(server.requests().len(), 2);
    }
}
