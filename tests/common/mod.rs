//! Shared fixtures for integration tests: a loopback HTTP responder, an
//! in-memory sheet store, and a browser launcher that starts nothing.

#![allow(dead_code)]

use async_trait::async_trait;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use marketplace_pricing_sync::infrastructure::config::AppConfig;
use marketplace_pricing_sync::infrastructure::sheets::{CellBackground, CellWrite, SheetStore, StoreError};
use marketplace_pricing_sync::infrastructure::tunnel::browser::{
    BrowserError, BrowserHandle, BrowserLauncher, LaunchOptions, PagePolicy,
};

/// Request line target and raw head as seen by the responder
#[derive(Debug, Clone)]
pub struct Seen {
    pub target: String,
    pub head: String,
}

pub struct Reply {
    pub status: u16,
    pub body: String,
    pub headers: Vec<(String, String)>,
}

impl Reply {
    pub fn json(status: u16, body: &str) -> Self {
        Self {
            status,
            body: body.to_string(),
            headers: vec![("Content-Type".into(), "application/json".into())],
        }
    }

    pub fn with_cookie(mut self, cookie: &str) -> Self {
        self.headers.push(("Set-Cookie".into(), cookie.into()));
        self
    }
}

/// Loopback HTTP/1.1 responder answering one request per connection
pub struct Responder {
    pub addr: SocketAddr,
    seen: Arc<Mutex<Vec<Seen>>>,
    task: JoinHandle<()>,
}

impl Responder {
    pub async fn start<F>(route: F) -> Self
    where
        F: Fn(&str) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let route = Arc::new(route);

        let log = Arc::clone(&seen);
        let task = tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let route = Arc::clone(&route);
                let log = Arc::clone(&log);
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 4096];
                    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                        match stream.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => buf.extend_from_slice(&chunk[..n]),
                        }
                    }
                    let head = String::from_utf8_lossy(&buf).to_string();
                    let target = head.split_whitespace().nth(1).unwrap_or_default().to_string();
                    let reply = route(&target);
                    log.lock().unwrap().push(Seen { target, head });

                    let mut out = format!(
                        "HTTP/1.1 {} Test\r\nContent-Length: {}\r\nConnection: close\r\n",
                        reply.status,
                        reply.body.len()
                    );
                    for (name, value) in &reply.headers {
                        out.push_str(&format!("{name}: {value}\r\n"));
                    }
                    out.push_str("\r\n");
                    out.push_str(&reply.body);
                    let _ = stream.write_all(out.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        Self { addr, seen, task }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Sheet store backed by a fixed grid, recording everything written
#[derive(Default)]
pub struct MemoryStore {
    pub grid: Vec<Vec<String>>,
    pub fail_writes_with: Option<StoreError>,
    pub writes: Mutex<Vec<Vec<CellWrite>>>,
    pub backgrounds: Mutex<Vec<Vec<CellBackground>>>,
}

impl MemoryStore {
    pub fn with_grid(rows: &[&[&str]]) -> Self {
        Self {
            grid: rows
                .iter()
                .map(|row| row.iter().map(|c| (*c).to_string()).collect())
                .collect(),
            ..Self::default()
        }
    }

    /// Final value written to an A1 range, if any
    pub fn cell(&self, range: &str) -> Option<String> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .filter(|c| c.range == range)
            .last()
            .map(|c| c.value.clone())
    }
}

#[async_trait]
impl SheetStore for MemoryStore {
    async fn read_all_values(&self) -> Result<Vec<Vec<String>>, StoreError> {
        Ok(self.grid.clone())
    }

    async fn batch_write_cells(&self, cells: &[CellWrite]) -> Result<(), StoreError> {
        self.writes.lock().unwrap().push(cells.to_vec());
        match &self.fail_writes_with {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    async fn batch_set_background(&self, cells: &[CellBackground]) -> Result<(), StoreError> {
        self.backgrounds.lock().unwrap().push(cells.to_vec());
        Ok(())
    }
}

/// What the fake browser was asked to do
#[derive(Debug, Default)]
pub struct BrowserLog {
    pub launches: Vec<LaunchOptions>,
    pub visited: Vec<String>,
    pub shutdowns: usize,
    pub fail_shutdown: Option<BrowserError>,
}

pub struct FakeBrowser {
    log: Arc<Mutex<BrowserLog>>,
    cookies: Vec<(String, String)>,
}

#[async_trait]
impl BrowserHandle for FakeBrowser {
    async fn configure(&mut self, _policy: &PagePolicy) -> Result<(), BrowserError> {
        Ok(())
    }

    async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        self.log.lock().unwrap().visited.push(url.to_string());
        Ok(())
    }

    async fn cookies(&self) -> Result<Vec<(String, String)>, BrowserError> {
        Ok(self.cookies.clone())
    }

    fn shutdown(&self) -> Result<(), BrowserError> {
        let mut log = self.log.lock().unwrap();
        log.shutdowns += 1;
        match &log.fail_shutdown {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

/// Launcher that records its calls; `fail_with` makes every launch fail.
/// Its browsers report `cookies` for every page.
#[derive(Default)]
pub struct FakeLauncher {
    pub log: Arc<Mutex<BrowserLog>>,
    pub fail_with: Option<BrowserError>,
    pub cookies: Vec<(String, String)>,
}

impl FakeLauncher {
    pub fn with_cookies(cookies: &[(&str, &str)]) -> Self {
        Self {
            cookies: cookies
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            ..Self::default()
        }
    }
}

#[async_trait]
impl BrowserLauncher for FakeLauncher {
    fn resolve_binary(&self, configured: Option<&Path>) -> Result<PathBuf, BrowserError> {
        Ok(configured.map_or_else(|| PathBuf::from("fake-chrome"), Path::to_path_buf))
    }

    async fn detect_major_version(&self, _binary: &Path) -> Result<u32, BrowserError> {
        Ok(126)
    }

    async fn launch(&self, options: &LaunchOptions) -> Result<Box<dyn BrowserHandle>, BrowserError> {
        if let Some(e) = &self.fail_with {
            return Err(e.clone());
        }
        self.log.lock().unwrap().launches.push(options.clone());
        Ok(Box::new(FakeBrowser {
            log: Arc::clone(&self.log),
            cookies: self.cookies.clone(),
        }))
    }
}

/// Configuration with every path under `root` and no artificial delays
pub fn test_config(root: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.proxy.enabled = false;
    config.proxy.pool_file = root.join("proxies.txt");
    config.browser.download_dir = root.join("downloads");
    config.browser.profiles.wildberries = root.join("profile_wb");
    config.browser.profiles.ozon = root.join("profile_ozon");
    config.fetch.max_requests_per_second = 1_000;
    config.fetch.base_delay_ms = 10;
    config.fetch.max_delay_ms = 20;
    config.fetch.random_delay_min_ms = 0;
    config.fetch.random_delay_max_ms = 0;
    config.sheets.backoff_unit_ms = 10;
    config.export.dir = root.join("exports");
    config.logging.file_output = false;
    config
}
