//! HTTP client for marketplace endpoints
//!
//! One [`MarketplaceClient`] serves one job: it reuses the job's cookie jar
//! for every call, optionally routes through the tunnel's local forwarding
//! address, paces requests with a token bucket and rotates the user agent
//! per request.

use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::{InMemoryState, direct::NotKeyed},
};
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{ACCEPT, HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use anyhow::Context;

use crate::infrastructure::config::{FetchConfig, defaults};
use crate::infrastructure::retry_manager::{RetryPolicy, Retryable, execute_with_policy};

/// Failure of one marketplace call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),

    #[error("HTTP {status} from {url}")]
    TransientStatus { status: u16, url: String },

    #[error("malformed response body: {0}")]
    MalformedBody(String),

    #[error("authentication rejected with HTTP {status}")]
    Authentication { status: u16 },

    #[error("item unavailable")]
    ItemUnavailable,

    #[error("no data in response")]
    NoData,

    #[error("invalid identifier {0:?}")]
    InvalidIdentifier(String),

    #[error("HTTP {status} from {url}")]
    HttpStatus { status: u16, url: String },
}

impl Retryable for FetchError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::TransientStatus { .. } | Self::MalformedBody(_)
        )
    }
}

impl FetchError {
    /// Ends the whole job rather than one item
    #[must_use]
    pub const fn is_fatal_for_job(&self) -> bool {
        matches!(self, Self::Authentication { .. })
    }

    /// Classify a non-success status
    #[must_use]
    pub fn from_status(status: StatusCode, url: &str) -> Self {
        let code = status.as_u16();
        match code {
            401 | 403 => Self::Authentication { status: code },
            404 => Self::ItemUnavailable,
            408 | 429 => Self::TransientStatus {
                status: code,
                url: url.to_string(),
            },
            _ if status.is_server_error() => Self::TransientStatus {
                status: code,
                url: url.to_string(),
            },
            _ => Self::HttpStatus {
                status: code,
                url: url.to_string(),
            },
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            Self::MalformedBody(error.to_string())
        } else {
            Self::Network(error.to_string())
        }
    }
}

/// Authenticated context of one job: a cookie jar scoped to an origin
#[derive(Clone)]
pub struct SessionContext {
    jar: Arc<Jar>,
    origin: Url,
}

impl SessionContext {
    #[must_use]
    pub fn new(origin: Url) -> Self {
        Self {
            jar: Arc::new(Jar::default()),
            origin,
        }
    }

    /// Seed the jar with cookies obtained elsewhere, e.g. from a browser
    pub fn from_cookies<I, K, V>(origin: &str, cookies: I) -> Result<Self, FetchError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let origin =
            Url::parse(origin).map_err(|_| FetchError::InvalidIdentifier(origin.to_string()))?;
        let context = Self::new(origin);
        for (name, value) in cookies {
            context.add_cookie(name.as_ref(), value.as_ref());
        }
        Ok(context)
    }

    pub fn add_cookie(&self, name: &str, value: &str) {
        self.jar
            .add_cookie_str(&format!("{name}={value}; Path=/"), &self.origin);
    }

    /// Cookies the jar would send to the origin
    #[must_use]
    pub fn cookie_count(&self) -> usize {
        self.jar
            .cookies(&self.origin)
            .and_then(|header| header.to_str().map(|s| s.split("; ").count()).ok())
            .unwrap_or(0)
    }

    #[must_use]
    pub fn origin(&self) -> &Url {
        &self.origin
    }

    /// GET the origin once so the server can set its cookies
    pub async fn warm_up(&self, client: &MarketplaceClient) -> Result<usize, FetchError> {
        let url = self.origin.to_string();
        info!("🍪 Warming up session at {}", url);
        client.get_status(&url).await?;
        let count = self.cookie_count();
        info!("🍪 Session holds {} cookies", count);
        Ok(count)
    }
}

/// Client settings derived from [`FetchConfig`]
#[derive(Debug, Clone)]
pub struct MarketplaceClientConfig {
    pub timeout: Duration,
    pub max_requests_per_second: u32,
    pub user_agents: Vec<String>,
    pub random_delay_ms: (u64, u64),
    pub retry: RetryPolicy,
    /// Local tunnel forwarder to route through
    pub forward_proxy: Option<SocketAddr>,
}

impl Default for MarketplaceClientConfig {
    fn default() -> Self {
        Self::from_fetch_config(&FetchConfig::default(), None)
    }
}

impl MarketplaceClientConfig {
    #[must_use]
    pub fn from_fetch_config(config: &FetchConfig, forward_proxy: Option<SocketAddr>) -> Self {
        Self {
            timeout: Duration::from_secs(config.request_timeout_seconds),
            max_requests_per_second: config.max_requests_per_second,
            user_agents: config.user_agents.clone(),
            random_delay_ms: (config.random_delay_min_ms, config.random_delay_max_ms),
            retry: RetryPolicy::from_config(config),
            forward_proxy,
        }
    }
}

/// Paced, cookie-aware JSON client for one job
pub struct MarketplaceClient {
    client: Client,
    rate_limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    session: SessionContext,
    config: MarketplaceClientConfig,
}

impl MarketplaceClient {
    pub fn new(config: MarketplaceClientConfig, session: SessionContext) -> anyhow::Result<Self> {
        let mut builder = Client::builder()
            .cookie_provider(Arc::clone(&session.jar))
            .timeout(config.timeout)
            .gzip(true)
            .brotli(true);

        if let Some(addr) = config.forward_proxy {
            let proxy = reqwest::Proxy::all(format!("http://{addr}"))
                .context("Invalid forwarding proxy address")?;
            builder = builder.proxy(proxy);
        }

        let client = builder.build().context("Failed to create HTTP client")?;

        let per_second =
            NonZeroU32::new(config.max_requests_per_second).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = RateLimiter::direct(Quota::per_second(per_second));

        Ok(Self {
            client,
            rate_limiter,
            session,
            config,
        })
    }

    #[must_use]
    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.config.retry
    }

    fn pick_user_agent(&self) -> &str {
        let agents = &self.config.user_agents;
        if agents.is_empty() {
            return defaults::USER_AGENTS[0];
        }
        &agents[fastrand::usize(..agents.len())]
    }

    async fn send(
        &self,
        url: &str,
        extra_headers: &[(HeaderName, &str)],
    ) -> Result<reqwest::Response, FetchError> {
        self.rate_limiter.until_ready().await;

        let mut headers = HeaderMap::new();
        if let Ok(agent) = HeaderValue::from_str(self.pick_user_agent()) {
            headers.insert(USER_AGENT, agent);
        }
        for (name, value) in extra_headers {
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.insert(name.clone(), value);
            }
        }

        debug!("Fetching URL: {}", url);
        let response = self.client.get(url).headers(headers).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::from_status(status, url));
        }
        Ok(response)
    }

    async fn get_status(&self, url: &str) -> Result<StatusCode, FetchError> {
        let policy = self.config.retry;
        execute_with_policy(url, &policy, || async move {
            let response = self.send(url, &[]).await?;
            Ok(response.status())
        })
        .await
    }

    /// One GET decoded as JSON, without retries
    pub async fn get_json_once<T: DeserializeOwned>(
        &self,
        url: &str,
        extra_headers: &[(HeaderName, &str)],
    ) -> Result<T, FetchError> {
        let response = self.send(url, extra_headers).await?;
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| FetchError::MalformedBody(e.to_string()))
    }

    /// GET decoded as JSON under the client's retry policy
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        extra_headers: &[(HeaderName, &str)],
    ) -> Result<T, FetchError> {
        let policy = self.config.retry;
        execute_with_policy(url, &policy, || self.get_json_once(url, extra_headers)).await
    }

    /// `Accept: application/json` plus the XHR marker some endpoints require
    #[must_use]
    pub fn xhr_headers() -> [(HeaderName, &'static str); 2] {
        [
            (ACCEPT, "application/json"),
            (HeaderName::from_static("x-requested-with"), "XMLHttpRequest"),
        ]
    }

    /// Human-like pause between items
    pub async fn pause_between_items(&self) {
        let (min, max) = self.config.random_delay_ms;
        if max == 0 {
            return;
        }
        let millis = if min >= max { max } else { fastrand::u64(min..=max) };
        tokio::time::sleep(Duration::from_millis(millis)).await;
    }
}
