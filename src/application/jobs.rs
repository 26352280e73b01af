//! Job driver
//!
//! A job owns one tunnel session, one HTTP client with its cookie jar, and
//! one update batch. [`JobRunner::run`] ties them together and always closes
//! the session and commits what was collected.

pub mod ozon;
pub mod wildberries;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Local};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::application::tasks::{LinkKind, collect_tasks};
use crate::domain::proxy::ProxyDescriptor;
use crate::domain::sync_intents::UpdateBatch;
use crate::infrastructure::config::{AppConfig, defaults};
use crate::infrastructure::http_client::{MarketplaceClient, MarketplaceClientConfig, SessionContext};
use crate::infrastructure::marketplace::{OzonClient, OzonEndpoints, WbEndpoints, WildberriesClient};
use crate::infrastructure::proxy_pool::ProxyPool;
use crate::infrastructure::sheets::{SheetStore, column_letter_to_index};
use crate::infrastructure::sync_engine::{CommitOutcome, SyncEngine};
use crate::infrastructure::tunnel::{TunnelManager, TunnelSession};

use self::ozon::OzonColumns;
use self::wildberries::WbColumns;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    Wildberries,
    Ozon,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wildberries => f.write_str("Wildberries"),
            Self::Ozon => f.write_str("Ozon"),
        }
    }
}

/// Per-item counts of one job
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobTally {
    pub processed: usize,
    pub errored: usize,
    /// Set when a job-level failure ended the item loop early
    pub aborted: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub job: JobKind,
    pub run_id: Uuid,
    pub started_at: DateTime<Local>,
    pub processed: usize,
    pub errored: usize,
    pub aborted: Option<String>,
    pub outcome: CommitOutcome,
}

/// Marketplace URLs, production by default
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarketplaceEndpoints {
    pub wildberries: WbEndpoints,
    pub ozon: OzonEndpoints,
}

pub(crate) fn resolve_column(name: &str, letters: &str) -> Result<u32> {
    column_letter_to_index(letters)
        .with_context(|| format!("columns.{name} = {letters:?} is not a column letter"))
}

pub struct JobRunner {
    config: AppConfig,
    tunnels: TunnelManager,
    store: Arc<dyn SheetStore>,
    endpoints: MarketplaceEndpoints,
    interrupt_backstop: bool,
}

impl JobRunner {
    #[must_use]
    pub fn new(config: AppConfig, tunnels: TunnelManager, store: Arc<dyn SheetStore>) -> Self {
        Self {
            config,
            tunnels,
            store,
            endpoints: MarketplaceEndpoints::default(),
            interrupt_backstop: false,
        }
    }

    #[must_use]
    pub fn with_endpoints(mut self, endpoints: MarketplaceEndpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    /// Close the session and exit on Ctrl-C while a job runs
    #[must_use]
    pub fn with_interrupt_backstop(mut self) -> Self {
        self.interrupt_backstop = true;
        self
    }

    fn upstream_proxy(&self) -> Option<ProxyDescriptor> {
        if !self.config.proxy.enabled {
            return None;
        }
        let pool = ProxyPool::load(&self.config.proxy.pool_file);
        let proxy = pool.first().cloned();
        match &proxy {
            Some(p) => info!("🔀 Using upstream proxy {} ({} in pool)", p.redacted(), pool.len()),
            None => warn!("⚠️ Proxy enabled but the pool is empty, connecting directly"),
        }
        proxy
    }

    fn profile_dir(&self, kind: JobKind) -> &Path {
        match kind {
            JobKind::Wildberries => &self.config.browser.profiles.wildberries,
            JobKind::Ozon => &self.config.browser.profiles.ozon,
        }
    }

    fn home_url(&self, kind: JobKind) -> &str {
        match kind {
            JobKind::Wildberries => &self.endpoints.wildberries.home,
            JobKind::Ozon => &self.endpoints.ozon.home,
        }
    }

    /// Run one job end to end. The tunnel session is closed on every path.
    pub async fn run(&self, kind: JobKind) -> Result<JobReport> {
        let run_id = Uuid::new_v4();
        let started_at = Local::now();
        info!("🚀 Starting {} job (run {})", kind, run_id);

        let mut session = self.tunnels.session();
        let backstop = self
            .interrupt_backstop
            .then(|| session.install_interrupt_backstop());

        let result = self.run_in_session(kind, &mut session).await;
        session.close();
        if let Some(task) = backstop {
            task.abort();
        }

        let (tally, outcome) = result.with_context(|| format!("{kind} job failed"))?;
        info!(
            "🏁 {} job done: {} processed, {} errors, outcome {:?}",
            kind, tally.processed, tally.errored, outcome
        );
        Ok(JobReport {
            job: kind,
            run_id,
            started_at,
            processed: tally.processed,
            errored: tally.errored,
            aborted: tally.aborted,
            outcome,
        })
    }

    /// Load the home page in the browser until it hands out cookies
    async fn browser_cookies(&self, session: &TunnelSession, home: &str) -> Vec<(String, String)> {
        let pause = Duration::from_millis(self.config.fetch.base_delay_ms);
        for attempt in 1..=defaults::COOKIE_ATTEMPTS {
            info!("🍪 Loading {} in the browser (attempt {})", home, attempt);
            let loaded = match session.navigate(home).await {
                Ok(()) => session.cookies().await,
                Err(e) => Err(e),
            };
            match loaded {
                Ok(cookies) if !cookies.is_empty() => {
                    info!("🍪 Browser holds {} cookies", cookies.len());
                    return cookies;
                }
                Ok(_) => warn!("⚠️ No cookies after loading {}", home),
                Err(e) => warn!("⚠️ Browser could not load {}: {}", home, e),
            }
            if attempt < defaults::COOKIE_ATTEMPTS {
                tokio::time::sleep(pause).await;
            }
        }
        Vec::new()
    }

    async fn run_in_session(
        &self,
        kind: JobKind,
        session: &mut TunnelSession,
    ) -> Result<(JobTally, CommitOutcome)> {
        let addr = session
            .open(self.upstream_proxy(), self.profile_dir(kind))
            .await
            .context("Failed to open tunnel session")?;

        let home = self.home_url(kind);
        let cookies = self.browser_cookies(session, home).await;
        let context =
            SessionContext::from_cookies(home, cookies).context("Invalid marketplace home URL")?;
        let http = Arc::new(MarketplaceClient::new(
            MarketplaceClientConfig::from_fetch_config(&self.config.fetch, Some(addr)),
            context,
        )?);
        if let Err(e) = http.session().warm_up(&http).await {
            warn!("⚠️ HTTP warm-up of {} failed: {}", home, e);
        }
        if http.session().cookie_count() == 0 {
            bail!("No session cookies from {home}");
        }

        let grid = self
            .store
            .read_all_values()
            .await
            .context("Failed to read the sheet")?;

        let mut batch = UpdateBatch::new();
        let tally = match kind {
            JobKind::Wildberries => {
                let columns = WbColumns::resolve(&self.config.columns)?;
                let tasks = collect_tasks(&grid, &columns.inputs, LinkKind::Wildberries);
                let client = WildberriesClient::new(http, self.endpoints.wildberries.clone());
                wildberries::process(&client, &tasks, &columns, &mut batch).await
            }
            JobKind::Ozon => {
                let columns = OzonColumns::resolve(&self.config.columns)?;
                let tasks = collect_tasks(&grid, &columns.inputs, LinkKind::Ozon);
                let client = OzonClient::new(http, self.endpoints.ozon.clone());
                ozon::process(&client, &tasks, &columns, &mut batch).await
            }
        };

        let engine = SyncEngine::from_config(Arc::clone(&self.store), &self.config.sheets, &self.config.export);
        let outcome = engine.commit(&mut batch).await;
        Ok((tally, outcome))
    }
}
