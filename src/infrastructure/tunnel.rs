//! Tunnel session management
//!
//! A [`TunnelSession`] owns a local forwarding endpoint and a browser routed
//! through it. State only moves forward (Idle, Active, Closed) and release is
//! guaranteed on every exit path: explicit [`TunnelSession::close`], `Drop`
//! during normal scope exit or unwinding, and an optional Ctrl-C backstop.

pub mod browser;
pub mod forwarder;
pub mod profile;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::domain::proxy::ProxyDescriptor;
use crate::infrastructure::config::BrowserConfig;
use browser::{BrowserError, BrowserHandle, BrowserLauncher, ChromeLauncher, LaunchOptions, PagePolicy};
use forwarder::ForwarderHandle;
use profile::{LaunchPreferences, ProfileHealth};

/// Exit status used when the interrupt backstop terminates the process
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Active,
    Closed,
}

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("tunnel session is already closed")]
    Closed,

    #[error("tunnel session is not active")]
    NotActive,

    #[error("forwarding endpoint failed: {0}")]
    Forwarder(#[from] std::io::Error),

    #[error("profile preparation failed: {0}")]
    Profile(String),

    #[error(transparent)]
    Browser(#[from] BrowserError),
}

/// Browser settings shared by every session a manager creates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSettings {
    pub binary: Option<PathBuf>,
    pub driver_binary: Option<PathBuf>,
    pub version_main: Option<u32>,
    pub headless: bool,
    pub startup_timeout: Duration,
    pub page_policy: PagePolicy,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self::from_browser_config(&BrowserConfig::default())
    }
}

impl TunnelSettings {
    #[must_use]
    pub fn from_browser_config(config: &BrowserConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            driver_binary: config.driver_binary.clone(),
            version_main: config.version_main,
            headless: config.headless,
            startup_timeout: Duration::from_secs(config.startup_timeout_seconds),
            page_policy: PagePolicy {
                download_dir: Some(config.download_dir.clone()),
                page_load_timeout: Duration::from_secs(config.page_load_timeout_seconds),
                implicit_wait: Duration::from_secs(config.implicit_wait_seconds),
            },
        }
    }
}

struct SessionInner {
    state: SessionState,
    forwarder: Option<ForwarderHandle>,
    browser: Option<Arc<dyn BrowserHandle>>,
    proxy: Option<ProxyDescriptor>,
}

fn lock(inner: &Mutex<SessionInner>) -> MutexGuard<'_, SessionInner> {
    // A panic while holding the lock must not prevent release
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Stop a browser, logging instead of propagating a failure
fn shutdown_browser(browser: &dyn BrowserHandle) {
    if let Err(e) = browser.shutdown() {
        warn!("⚠️ Browser shutdown failed: {}", e);
    }
}

fn close_inner(inner: &Mutex<SessionInner>) {
    let mut guard = lock(inner);
    if guard.state == SessionState::Closed {
        return;
    }
    let was_active = guard.state == SessionState::Active;
    guard.state = SessionState::Closed;

    if let Some(browser) = guard.browser.take() {
        shutdown_browser(browser.as_ref());
    }
    if let Some(mut forwarder) = guard.forwarder.take() {
        forwarder.shutdown();
    }
    if was_active {
        info!("🔒 Tunnel session closed");
    }
}

/// Cloneable release trigger for exit hooks
#[derive(Clone)]
pub struct CloseHandle {
    inner: Arc<Mutex<SessionInner>>,
}

impl CloseHandle {
    pub fn close(&self) {
        close_inner(&self.inner);
    }
}

/// One job's proxy-tunneled browser session
pub struct TunnelSession {
    launcher: Arc<dyn BrowserLauncher>,
    settings: TunnelSettings,
    inner: Arc<Mutex<SessionInner>>,
}

impl TunnelSession {
    #[must_use]
    pub fn new(launcher: Arc<dyn BrowserLauncher>, settings: TunnelSettings) -> Self {
        Self {
            launcher,
            settings,
            inner: Arc::new(Mutex::new(SessionInner {
                state: SessionState::Idle,
                forwarder: None,
                browser: None,
                proxy: None,
            })),
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        lock(&self.inner).state
    }

    /// Address of the forwarding endpoint while the session is active
    #[must_use]
    pub fn local_address(&self) -> Option<SocketAddr> {
        lock(&self.inner).forwarder.as_ref().map(ForwarderHandle::addr)
    }

    #[must_use]
    pub fn proxy(&self) -> Option<ProxyDescriptor> {
        lock(&self.inner).proxy.clone()
    }

    /// Bring the session up and return the local forwarding address.
    ///
    /// Calling this on an active session returns the existing address.
    /// A launch failure closes the session before the error is returned.
    pub async fn open(
        &mut self,
        proxy: Option<ProxyDescriptor>,
        profile_dir: &Path,
    ) -> Result<SocketAddr, TunnelError> {
        {
            let guard = lock(&self.inner);
            match guard.state {
                SessionState::Closed => return Err(TunnelError::Closed),
                SessionState::Active => {
                    if let Some(addr) = guard.forwarder.as_ref().map(ForwarderHandle::addr) {
                        return Ok(addr);
                    }
                }
                SessionState::Idle => {}
            }
        }

        match self.bring_up(proxy.as_ref(), profile_dir).await {
            Ok((forwarder, browser)) => {
                let addr = forwarder.addr();
                let mut guard = lock(&self.inner);
                if guard.state == SessionState::Closed {
                    // Closed by the close handle while launching
                    drop(guard);
                    shutdown_browser(browser.as_ref());
                    return Err(TunnelError::Closed);
                }
                guard.state = SessionState::Active;
                guard.forwarder = Some(forwarder);
                guard.browser = Some(browser);
                guard.proxy = proxy;
                info!("✅ Tunnel session active on {}", addr);
                Ok(addr)
            }
            Err(e) => {
                warn!("❌ Tunnel session failed to open: {}", e);
                close_inner(&self.inner);
                Err(e)
            }
        }
    }

    async fn bring_up(
        &self,
        proxy: Option<&ProxyDescriptor>,
        profile_dir: &Path,
    ) -> Result<(ForwarderHandle, Arc<dyn BrowserHandle>), TunnelError> {
        match profile::sanitize_profile(profile_dir).map_err(|e| TunnelError::Profile(e.to_string()))? {
            ProfileHealth::Recovered { .. } => info!("🩹 Profile {} recovered", profile_dir.display()),
            ProfileHealth::Missing | ProfileHealth::Healthy => {}
        }
        profile::apply_preferences(
            profile_dir,
            &LaunchPreferences {
                download_dir: self.settings.page_policy.download_dir.clone(),
            },
        )
        .map_err(|e| TunnelError::Profile(e.to_string()))?;

        // Dropping the handle on any later failure stops the forwarder
        let forwarder = forwarder::start(proxy.cloned()).await?;

        let binary = self.launcher.resolve_binary(self.settings.binary.as_deref())?;
        let detected = self.launcher.detect_major_version(&binary).await;
        let major_version = browser::negotiate_version(self.settings.version_main, detected)?;

        let options = LaunchOptions {
            binary,
            driver_binary: self.settings.driver_binary.clone(),
            major_version,
            forward_addr: forwarder.addr(),
            profile_dir: profile_dir.to_path_buf(),
            headless: self.settings.headless,
            startup_timeout: self.settings.startup_timeout,
        };
        let mut handle = self.launcher.launch(&options).await?;
        if let Err(e) = handle.configure(&self.settings.page_policy).await {
            shutdown_browser(handle.as_ref());
            return Err(e.into());
        }
        Ok((forwarder, Arc::from(handle)))
    }

    fn active_browser(&self) -> Result<Arc<dyn BrowserHandle>, TunnelError> {
        let guard = lock(&self.inner);
        match guard.state {
            SessionState::Active => guard.browser.clone().ok_or(TunnelError::NotActive),
            SessionState::Closed => Err(TunnelError::Closed),
            SessionState::Idle => Err(TunnelError::NotActive),
        }
    }

    /// Load a page in the session's browser
    pub async fn navigate(&self, url: &str) -> Result<(), TunnelError> {
        self.active_browser()?.navigate(url).await?;
        Ok(())
    }

    /// Cookies the browser holds for the page it is on
    pub async fn cookies(&self) -> Result<Vec<(String, String)>, TunnelError> {
        Ok(self.active_browser()?.cookies().await?)
    }

    /// Release everything. Safe to call any number of times.
    pub fn close(&self) {
        close_inner(&self.inner);
    }

    #[must_use]
    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Close the session and exit with status 130 on Ctrl-C.
    ///
    /// Abort the returned task once the session is released normally.
    #[must_use]
    pub fn install_interrupt_backstop(&self) -> JoinHandle<()> {
        let handle = self.close_handle();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("🛑 Interrupted, closing tunnel session");
                handle.close();
                std::process::exit(INTERRUPTED_EXIT_CODE);
            }
        })
    }
}

impl Drop for TunnelSession {
    fn drop(&mut self) {
        close_inner(&self.inner);
    }
}

/// Creates a fresh session per job; holds no sessions itself
#[derive(Clone)]
pub struct TunnelManager {
    launcher: Arc<dyn BrowserLauncher>,
    settings: TunnelSettings,
}

impl TunnelManager {
    #[must_use]
    pub fn new(launcher: Arc<dyn BrowserLauncher>, settings: TunnelSettings) -> Self {
        Self { launcher, settings }
    }

    #[must_use]
    pub fn chrome(config: &BrowserConfig) -> Self {
        Self::new(
            Arc::new(ChromeLauncher),
            TunnelSettings::from_browser_config(config),
        )
    }

    #[must_use]
    pub fn settings(&self) -> &TunnelSettings {
        &self.settings
    }

    #[must_use]
    pub fn session(&self) -> TunnelSession {
        TunnelSession::new(Arc::clone(&self.launcher), self.settings.clone())
    }
}
