//! Test utilities for the pricing sync crate
//!
//! In-process stand-ins for the network collaborators so tests never leave
//! the loopback interface: a scripted HTTP responder and a scripted sheet
//! store.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::infrastructure::sheets::{CellBackground, CellWrite, SheetStore, StoreError};

/// Request line and headers as the responder saw them
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
}

impl RecordedRequest {
    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct StubResponse {
    pub status: u16,
    pub body: String,
    pub headers: Vec<(String, String)>,
}

impl StubResponse {
    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: String::new(),
            headers: Vec::new(),
        }
    }

    pub fn json(status: u16, body: &str) -> Self {
        Self {
            status,
            body: body.to_string(),
            headers: vec![("Content-Type".into(), "application/json".into())],
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

type Router = Arc<dyn Fn(&RecordedRequest) -> StubResponse + Send + Sync>;

/// One-request-per-connection HTTP/1.1 responder on 127.0.0.1
pub struct StubHttpServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    task: JoinHandle<()>,
}

impl StubHttpServer {
    pub async fn start<F>(router: F) -> Self
    where
        F: Fn(&RecordedRequest) -> StubResponse + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let router: Router = Arc::new(router);

        let recorded = Arc::clone(&requests);
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let router = Arc::clone(&router);
                let recorded = Arc::clone(&recorded);
                tokio::spawn(async move {
                    let _ = serve_one(stream, router, recorded).await;
                });
            }
        });

        Self {
            addr,
            requests,
            task,
        }
    }

    /// Answer requests with `responses` in order, then with 500s
    pub async fn sequence(responses: Vec<StubResponse>) -> Self {
        let queue = Mutex::new(VecDeque::from(responses));
        Self::start(move |_| {
            queue
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| StubResponse::json(500, r#"{"error":"script exhausted"}"#))
        })
        .await
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for StubHttpServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_one(
    mut stream: TcpStream,
    router: Router,
    recorded: Arc<Mutex<Vec<RecordedRequest>>>,
) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let head = String::from_utf8_lossy(&buf);
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next().unwrap_or_default().split_whitespace();
    let request = RecordedRequest {
        method: request_line.next().unwrap_or_default().to_string(),
        target: request_line.next().unwrap_or_default().to_string(),
        headers: lines
            .take_while(|l| !l.is_empty())
            .filter_map(|l| l.split_once(':'))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect(),
    };

    let response = router(&request);
    recorded.lock().unwrap().push(request);

    let mut out = format!(
        "HTTP/1.1 {} Stub\r\nContent-Length: {}\r\nConnection: close\r\n",
        response.status,
        response.body.len()
    );
    for (name, value) in &response.headers {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str("\r\n");
    out.push_str(&response.body);
    stream.write_all(out.as_bytes()).await?;
    stream.shutdown().await
}

/// Calls the scripted store has received
#[derive(Debug, Clone, PartialEq)]
pub enum StoreCall {
    Read,
    Write(Vec<CellWrite>),
    Background(Vec<CellBackground>),
}

/// Sheet store answering from a script; an empty script means success
#[derive(Default)]
pub struct ScriptedSheetStore {
    pub grid: Vec<Vec<String>>,
    write_script: Mutex<VecDeque<Result<(), StoreError>>>,
    background_script: Mutex<VecDeque<Result<(), StoreError>>>,
    calls: Mutex<Vec<StoreCall>>,
}

impl ScriptedSheetStore {
    pub fn with_grid(grid: Vec<Vec<&str>>) -> Self {
        Self {
            grid: grid
                .into_iter()
                .map(|row| row.into_iter().map(String::from).collect())
                .collect(),
            ..Self::default()
        }
    }

    pub fn script_writes(self, script: Vec<Result<(), StoreError>>) -> Self {
        *self.write_script.lock().unwrap() = script.into();
        self
    }

    pub fn script_backgrounds(self, script: Vec<Result<(), StoreError>>) -> Self {
        *self.background_script.lock().unwrap() = script.into();
        self
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn write_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, StoreCall::Write(_)))
            .count()
    }
}

#[async_trait]
impl SheetStore for ScriptedSheetStore {
    async fn read_all_values(&self) -> Result<Vec<Vec<String>>, StoreError> {
        self.calls.lock().unwrap().push(StoreCall::Read);
        Ok(self.grid.clone())
    }

    async fn batch_write_cells(&self, cells: &[CellWrite]) -> Result<(), StoreError> {
        self.calls.lock().unwrap().push(StoreCall::Write(cells.to_vec()));
        self.write_script.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }

    async fn batch_set_background(&self, cells: &[CellBackground]) -> Result<(), StoreError> {
        self.calls
            .lock()
            .unwrap()
            .push(StoreCall::Background(cells.to_vec()));
        self.background_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()))
    }
}
