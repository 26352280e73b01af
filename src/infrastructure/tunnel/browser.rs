//! Browser process launch and control
//!
//! [`BrowserLauncher`] is the seam between the tunnel session and a concrete
//! browser. [`ChromeLauncher`] starts Chrome with a DevTools port, attaches a
//! chromedriver to it and drives the page through a `fantoccini` client.

use async_trait::async_trait;
use fantoccini::wd::{Capabilities, TimeoutConfiguration};
use fantoccini::{Client, ClientBuilder};
use regex::Regex;
use serde_json::json;
use std::net::{SocketAddr, TcpListener};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

/// Binaries searched for on `PATH` when none is configured
const CHROME_CANDIDATES: &[&str] = &[
    "google-chrome",
    "google-chrome-stable",
    "chromium",
    "chromium-browser",
    "chrome",
];

const DRIVER_CANDIDATES: &[&str] = &["chromedriver"];

const DEVTOOLS_PORT_FILE: &str = "DevToolsActivePort";
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Return from navigation once the DOM is ready, without waiting for subresources
pub const PAGE_LOAD_STRATEGY: &str = "eager";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrowserError {
    #[error("browser binary not found: {0}")]
    BinaryNotFound(String),

    #[error("browser major version {found} does not match required {expected}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("cannot determine browser version: {0}")]
    VersionUnknown(String),

    #[error("browser launch failed: {0}")]
    LaunchFailed(String),

    #[error("DevTools endpoint error: {0}")]
    DevTools(String),

    #[error("WebDriver command failed: {0}")]
    WebDriver(String),
}

/// Everything needed to start one browser process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOptions {
    pub binary: PathBuf,
    pub driver_binary: Option<PathBuf>,
    pub major_version: u32,
    pub forward_addr: SocketAddr,
    pub profile_dir: PathBuf,
    pub headless: bool,
    pub startup_timeout: Duration,
}

impl LaunchOptions {
    /// Command line for a hardened, tunnel-routed browser
    #[must_use]
    pub fn arguments(&self) -> Vec<String> {
        let mut args = vec![
            format!("--proxy-server=http://{}", self.forward_addr),
            "--disable-blink-features=AutomationControlled".to_string(),
            "--ignore-certificate-errors".to_string(),
            "--disable-dev-shm-usage".to_string(),
            "--no-sandbox".to_string(),
            "--disable-gpu".to_string(),
            "--log-level=3".to_string(),
            "--no-first-run".to_string(),
            "--no-default-browser-check".to_string(),
            format!("--user-data-dir={}", self.profile_dir.display()),
            "--remote-debugging-port=0".to_string(),
        ];
        if self.headless {
            args.push("--headless=new".to_string());
        } else {
            args.push("--start-minimized".to_string());
        }
        args.push("about:blank".to_string());
        args
    }
}

/// WebDriver capabilities attaching chromedriver to an already running browser
#[must_use]
pub fn attach_capabilities(devtools: SocketAddr) -> Capabilities {
    let mut caps = Capabilities::new();
    caps.insert("browserName".to_string(), json!("chrome"));
    caps.insert("pageLoadStrategy".to_string(), json!(PAGE_LOAD_STRATEGY));
    caps.insert(
        "goog:chromeOptions".to_string(),
        json!({ "debuggerAddress": devtools.to_string() }),
    );
    caps
}

/// Per-session page settings applied after launch.
///
/// The download directory is written into the profile preferences before the
/// browser starts; the timeouts become WebDriver session timeouts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagePolicy {
    pub download_dir: Option<PathBuf>,
    pub page_load_timeout: Duration,
    pub implicit_wait: Duration,
}

impl Default for PagePolicy {
    fn default() -> Self {
        Self {
            download_dir: None,
            page_load_timeout: Duration::from_secs(30),
            implicit_wait: Duration::from_secs(10),
        }
    }
}

impl PagePolicy {
    #[must_use]
    pub fn timeouts(&self) -> TimeoutConfiguration {
        TimeoutConfiguration::new(None, Some(self.page_load_timeout), Some(self.implicit_wait))
    }
}

/// A running browser owned by one tunnel session
#[async_trait]
pub trait BrowserHandle: Send + Sync {
    async fn configure(&mut self, policy: &PagePolicy) -> Result<(), BrowserError>;

    async fn navigate(&self, url: &str) -> Result<(), BrowserError>;

    /// Name and value of every cookie visible to the current page
    async fn cookies(&self) -> Result<Vec<(String, String)>, BrowserError>;

    /// Terminate the process. Must tolerate being called after the browser exited.
    fn shutdown(&self) -> Result<(), BrowserError>;
}

#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    /// Binary to launch, from configuration or discovery
    fn resolve_binary(&self, configured: Option<&Path>) -> Result<PathBuf, BrowserError>;

    async fn detect_major_version(&self, binary: &Path) -> Result<u32, BrowserError>;

    async fn launch(&self, options: &LaunchOptions) -> Result<Box<dyn BrowserHandle>, BrowserError>;
}

/// Major version from `--version` output such as `Google Chrome 126.0.6478.126`
#[must_use]
pub fn parse_major_version(output: &str) -> Option<u32> {
    let re = Regex::new(r"(\d+)\.\d+(?:\.\d+)*").ok()?;
    re.captures(output)?.get(1)?.as_str().parse().ok()
}

/// Pick the version to run: the configured one must agree with what is installed
pub fn negotiate_version(
    configured: Option<u32>,
    detected: Result<u32, BrowserError>,
) -> Result<u32, BrowserError> {
    match (configured, detected) {
        (Some(expected), Ok(found)) if expected != found => {
            Err(BrowserError::VersionMismatch { expected, found })
        }
        (_, Ok(found)) => Ok(found),
        (Some(expected), Err(e)) => {
            warn!("⚠️ Version detection failed ({}), trusting configured {}", e, expected);
            Ok(expected)
        }
        (None, Err(e)) => Err(e),
    }
}

/// Launcher for Chrome and Chromium controlled through chromedriver
#[derive(Debug, Clone, Default)]
pub struct ChromeLauncher;

impl ChromeLauncher {
    fn find_on_path(name: &str) -> Option<PathBuf> {
        let paths = std::env::var_os("PATH")?;
        std::env::split_paths(&paths)
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.is_file())
    }

    fn resolve(configured: Option<&Path>, candidates: &[&str]) -> Result<PathBuf, BrowserError> {
        if let Some(path) = configured {
            if path.is_file() {
                return Ok(path.to_path_buf());
            }
            if let Some(found) = path.to_str().and_then(Self::find_on_path) {
                return Ok(found);
            }
            return Err(BrowserError::BinaryNotFound(path.display().to_string()));
        }
        candidates
            .iter()
            .find_map(|name| Self::find_on_path(name))
            .ok_or_else(|| BrowserError::BinaryNotFound(candidates.join(", ")))
    }

    async fn version_of(binary: &Path) -> Result<u32, BrowserError> {
        let output = Command::new(binary)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| BrowserError::VersionUnknown(e.to_string()))?;
        let text = String::from_utf8_lossy(&output.stdout);
        parse_major_version(&text)
            .ok_or_else(|| BrowserError::VersionUnknown(format!("unrecognised output {:?}", text.trim())))
    }

    async fn read_devtools_port(profile_dir: &Path) -> Option<u16> {
        let content = tokio::fs::read_to_string(profile_dir.join(DEVTOOLS_PORT_FILE))
            .await
            .ok()?;
        content.lines().next()?.trim().parse().ok()
    }

    fn free_port() -> Result<u16, BrowserError> {
        TcpListener::bind(("127.0.0.1", 0))
            .and_then(|listener| listener.local_addr())
            .map(|addr| addr.port())
            .map_err(|e| BrowserError::LaunchFailed(format!("no free driver port: {e}")))
    }

    fn spawn(binary: &Path, args: &[String]) -> Result<Child, BrowserError> {
        Command::new(binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BrowserError::LaunchFailed(format!("{}: {e}", binary.display())))
    }

    /// Start Chrome and wait for it to publish its DevTools port
    async fn start_browser(options: &LaunchOptions, deadline: Instant) -> Result<(Child, SocketAddr), BrowserError> {
        let mut child = Self::spawn(&options.binary, &options.arguments())?;
        loop {
            if let Ok(Some(status)) = child.try_wait() {
                return Err(BrowserError::LaunchFailed(format!("browser exited early with {status}")));
            }
            if let Some(port) = Self::read_devtools_port(&options.profile_dir).await {
                let devtools = SocketAddr::from(([127, 0, 0, 1], port));
                debug!("DevTools listening on {}", devtools);
                return Ok((child, devtools));
            }
            if Instant::now() >= deadline {
                let _ = child.start_kill();
                return Err(BrowserError::DevTools(format!(
                    "no DevTools port within {:?}",
                    options.startup_timeout
                )));
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Start chromedriver and open a WebDriver session attached to `devtools`
    async fn attach_driver(
        options: &LaunchOptions,
        devtools: SocketAddr,
        deadline: Instant,
    ) -> Result<(Child, Client), BrowserError> {
        let driver_binary = Self::resolve(options.driver_binary.as_deref(), DRIVER_CANDIDATES)?;
        match Self::version_of(&driver_binary).await {
            Ok(found) if found != options.major_version => {
                return Err(BrowserError::VersionMismatch {
                    expected: options.major_version,
                    found,
                });
            }
            Ok(_) => {}
            Err(e) => warn!("⚠️ Cannot read chromedriver version: {}", e),
        }

        let port = Self::free_port()?;
        let mut driver = Self::spawn(&driver_binary, &[format!("--port={port}")])?;
        let endpoint = format!("http://127.0.0.1:{port}");
        let capabilities = attach_capabilities(devtools);

        loop {
            if let Ok(Some(status)) = driver.try_wait() {
                return Err(BrowserError::LaunchFailed(format!("chromedriver exited early with {status}")));
            }
            let mut builder = ClientBuilder::native();
            builder.capabilities(capabilities.clone());
            match builder.connect(&endpoint).await {
                Ok(client) => return Ok((driver, client)),
                Err(e) if Instant::now() >= deadline => {
                    let _ = driver.start_kill();
                    return Err(BrowserError::WebDriver(format!("no WebDriver session: {e}")));
                }
                Err(e) => debug!("chromedriver not ready: {}", e),
            }
            sleep(POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl BrowserLauncher for ChromeLauncher {
    fn resolve_binary(&self, configured: Option<&Path>) -> Result<PathBuf, BrowserError> {
        Self::resolve(configured, CHROME_CANDIDATES)
    }

    async fn detect_major_version(&self, binary: &Path) -> Result<u32, BrowserError> {
        Self::version_of(binary).await
    }

    async fn launch(&self, options: &LaunchOptions) -> Result<Box<dyn BrowserHandle>, BrowserError> {
        tokio::fs::create_dir_all(&options.profile_dir)
            .await
            .map_err(|e| BrowserError::LaunchFailed(format!("profile directory: {e}")))?;
        // A stale port file from a previous run would point at a dead process
        let _ = tokio::fs::remove_file(options.profile_dir.join(DEVTOOLS_PORT_FILE)).await;

        info!(
            "🌐 Launching {} (v{}) through {}",
            options.binary.display(),
            options.major_version,
            options.forward_addr
        );
        let deadline = Instant::now() + options.startup_timeout;
        let (mut browser, devtools) = Self::start_browser(options, deadline).await?;
        let (driver, client) = match Self::attach_driver(options, devtools, deadline).await {
            Ok(attached) => attached,
            Err(e) => {
                let _ = browser.start_kill();
                return Err(e);
            }
        };

        if !options.headless {
            if let Err(e) = client.minimize_window().await {
                debug!("Could not minimize browser window: {}", e);
            }
        }
        info!("🤖 WebDriver session attached to {}", devtools);
        Ok(Box::new(ChromeHandle {
            browser: Mutex::new(browser),
            driver: Mutex::new(driver),
            client,
        }))
    }
}

/// Running Chrome process and the chromedriver session attached to it
pub struct ChromeHandle {
    browser: Mutex<Child>,
    driver: Mutex<Child>,
    client: Client,
}

fn kill(process: &Mutex<Child>, name: &str) -> Result<(), BrowserError> {
    let mut child = process.lock().unwrap_or_else(PoisonError::into_inner);
    match child.try_wait() {
        Ok(Some(_)) => Ok(()),
        _ => child
            .start_kill()
            .map_err(|e| BrowserError::LaunchFailed(format!("kill {name} failed: {e}"))),
    }
}

#[async_trait]
impl BrowserHandle for ChromeHandle {
    async fn configure(&mut self, policy: &PagePolicy) -> Result<(), BrowserError> {
        self.client
            .update_timeouts(policy.timeouts())
            .await
            .map_err(|e| BrowserError::WebDriver(e.to_string()))?;
        debug!(
            "Page load timeout {:?}, implicit wait {:?}",
            policy.page_load_timeout, policy.implicit_wait
        );
        Ok(())
    }

    async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        self.client
            .goto(url)
            .await
            .map_err(|e| BrowserError::WebDriver(format!("{url}: {e}")))?;
        debug!("Opened {} in browser", url);
        Ok(())
    }

    async fn cookies(&self) -> Result<Vec<(String, String)>, BrowserError> {
        let cookies = self
            .client
            .get_all_cookies()
            .await
            .map_err(|e| BrowserError::WebDriver(e.to_string()))?;
        Ok(cookies
            .iter()
            .map(|c| (c.name().to_string(), c.value().to_string()))
            .collect())
    }

    fn shutdown(&self) -> Result<(), BrowserError> {
        let browser = kill(&self.browser, "browser");
        let driver = kill(&self.driver, "chromedriver");
        browser.and(driver)
    }
}
