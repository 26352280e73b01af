//! Local forwarding endpoint
//!
//! Listens on an ephemeral loopback port and speaks plain HTTP proxy to the
//! browser (CONNECT and absolute-form requests). Each connection is either
//! dialled directly, handed to an upstream HTTP proxy with
//! `Proxy-Authorization` injected, or opened through a SOCKS5 upstream.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, copy_bidirectional};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::domain::proxy::{ProxyDescriptor, ProxyProtocol};

const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_HEADERS: usize = 96;

/// Running forwarder; shut down explicitly or on drop
#[derive(Debug)]
pub struct ForwarderHandle {
    addr: SocketAddr,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ForwarderHandle {
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop accepting and drop every open connection
    pub fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("Forwarder on {} stopped", self.addr);
        }
    }
}

impl Drop for ForwarderHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Bind `127.0.0.1:0` and start forwarding, directly when `upstream` is `None`
pub async fn start(upstream: Option<ProxyDescriptor>) -> io::Result<ForwarderHandle> {
    let listener = TcpListener::bind((IpAddr::from([127, 0, 0, 1]), 0)).await?;
    let addr = listener.local_addr()?;
    let cancel = CancellationToken::new();

    match &upstream {
        Some(proxy) => info!("🔌 Forwarder on {} via {}", addr, proxy.redacted()),
        None => info!("🔌 Forwarder on {} (direct)", addr),
    }

    let upstream = Arc::new(upstream);
    let token = cancel.clone();
    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let upstream = Arc::clone(&upstream);
                        let conn_token = token.child_token();
                        tokio::spawn(async move {
                            tokio::select! {
                                () = conn_token.cancelled() => {}
                                result = handle_connection(stream, upstream.as_ref().as_ref()) => {
                                    if let Err(e) = result {
                                        debug!("Forwarded connection from {} ended: {}", peer, e);
                                    }
                                }
                            }
                        });
                    }
                    Err(e) => warn!("Forwarder accept failed: {}", e),
                },
            }
        }
    });

    Ok(ForwarderHandle {
        addr,
        cancel,
        task: Some(task),
    })
}

/// Parsed proxy request head
#[derive(Debug, Clone, PartialEq, Eq)]
struct RequestHead {
    method: String,
    target: String,
    version: String,
    headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Parse a head at the start of `bytes` and return it with its length.
    /// `None` means more bytes are needed.
    fn parse(bytes: &[u8]) -> io::Result<Option<(Self, usize)>> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut headers);
        let consumed = match request.parse(bytes) {
            Ok(httparse::Status::Complete(consumed)) => consumed,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(e) => return Err(invalid(&format!("malformed request head: {e}"))),
        };
        let (Some(method), Some(target)) = (request.method, request.path) else {
            return Err(invalid("incomplete request line"));
        };
        let head = Self {
            method: method.to_string(),
            target: target.to_string(),
            version: format!("HTTP/1.{}", request.version.unwrap_or(1)),
            headers: request
                .headers
                .iter()
                .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
                .collect(),
        };
        Ok(Some((head, consumed)))
    }

    fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    fn remove_headers(&mut self, predicate: impl Fn(&str) -> bool) {
        self.headers.retain(|(k, _)| !predicate(k));
    }

    fn set_header(&mut self, name: &str, value: String) {
        self.remove_headers(|k| k.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value));
    }

    /// `host:port` this request wants to reach
    fn destination(&self) -> io::Result<(String, u16)> {
        if self.is_connect() {
            let (host, port) = self
                .target
                .rsplit_once(':')
                .ok_or_else(|| invalid("CONNECT target without port"))?;
            let port = port.parse().map_err(|_| invalid("CONNECT target port"))?;
            return Ok((host.trim_matches(['[', ']']).to_string(), port));
        }
        let url = Url::parse(&self.target).map_err(|_| invalid("request target is not absolute"))?;
        let host = url.host_str().ok_or_else(|| invalid("request target without host"))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| invalid("request target without port"))?;
        Ok((host.trim_matches(['[', ']']).to_string(), port))
    }

    /// Rewrite an absolute-form request for the origin server
    fn into_origin_form(mut self) -> io::Result<Self> {
        let url = Url::parse(&self.target).map_err(|_| invalid("request target is not absolute"))?;
        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }
        self.target = path;
        self.remove_headers(|k| {
            k.to_ascii_lowercase().starts_with("proxy-") || k.eq_ignore_ascii_case("connection")
        });
        self.set_header("Connection", "close".to_string());
        Ok(self)
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!("{} {} {}\r\n", self.method, self.target, self.version);
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.into_bytes()
    }
}

fn invalid(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.to_string())
}

/// Read until a complete request head; returns it with any bytes after it
async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> io::Result<(RequestHead, Vec<u8>)> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "client closed before head"));
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some((head, consumed)) = RequestHead::parse(&buf)? {
            return Ok((head, buf.split_off(consumed)));
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(invalid("request head too large"));
        }
    }
}

async fn handle_connection(mut client: TcpStream, upstream: Option<&ProxyDescriptor>) -> io::Result<()> {
    let (head, rest) = match read_head(&mut client).await {
        Ok(read) => read,
        Err(e) if e.kind() == io::ErrorKind::InvalidData => {
            client.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await?;
            return Err(e);
        }
        Err(e) => return Err(e),
    };

    let server = match upstream {
        Some(proxy) if proxy.protocol != ProxyProtocol::Socks5 => {
            return relay_via_http_proxy(client, head, &rest, proxy).await;
        }
        Some(proxy) => {
            let (host, port) = head.destination()?;
            socks5_connect(proxy, &host, port).await
        }
        None => {
            let (host, port) = head.destination()?;
            TcpStream::connect((host.as_str(), port)).await
        }
    };

    let mut server = match server {
        Ok(server) => server,
        Err(e) => {
            client.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await?;
            return Err(e);
        }
    };

    if head.is_connect() {
        client
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await?;
    } else {
        server.write_all(&head.into_origin_form()?.to_bytes()).await?;
    }
    if !rest.is_empty() {
        server.write_all(&rest).await?;
    }

    copy_bidirectional(&mut client, &mut server).await?;
    Ok(())
}

/// Hand the request to an HTTP proxy as-is, adding credentials
async fn relay_via_http_proxy(
    mut client: TcpStream,
    mut head: RequestHead,
    rest: &[u8],
    proxy: &ProxyDescriptor,
) -> io::Result<()> {
    let mut server = match TcpStream::connect(proxy.authority()).await {
        Ok(server) => server,
        Err(e) => {
            client.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await?;
            return Err(e);
        }
    };

    head.remove_headers(|k| k.eq_ignore_ascii_case("proxy-authorization"));
    if let Some(credentials) = &proxy.credentials {
        let token = STANDARD.encode(format!("{}:{}", credentials.username, credentials.password));
        head.set_header("Proxy-Authorization", format!("Basic {token}"));
    }

    server.write_all(&head.to_bytes()).await?;
    if !rest.is_empty() {
        server.write_all(rest).await?;
    }
    copy_bidirectional(&mut client, &mut server).await?;
    Ok(())
}

/// Open a stream to `host:port` through a SOCKS5 proxy (RFC 1928 / RFC 1929)
async fn socks5_connect(proxy: &ProxyDescriptor, host: &str, port: u16) -> io::Result<TcpStream> {
    let mut stream = TcpStream::connect(proxy.authority()).await?;
    socks5_handshake(&mut stream, proxy, host, port).await?;
    Ok(stream)
}

async fn socks5_handshake<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    proxy: &ProxyDescriptor,
    host: &str,
    port: u16,
) -> io::Result<()> {
    let greeting: &[u8] = if proxy.credentials.is_some() {
        &[0x05, 0x02, 0x00, 0x02]
    } else {
        &[0x05, 0x01, 0x00]
    };
    stream.write_all(greeting).await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    match (choice, &proxy.credentials) {
        ([0x05, 0x00], _) => {}
        ([0x05, 0x02], Some(credentials)) => {
            let user = credentials.username.as_bytes();
            let pass = credentials.password.as_bytes();
            let (Ok(user_len), Ok(pass_len)) = (u8::try_from(user.len()), u8::try_from(pass.len()))
            else {
                return Err(invalid("SOCKS5 credentials longer than 255 bytes"));
            };
            let mut auth = vec![0x01, user_len];
            auth.extend_from_slice(user);
            auth.push(pass_len);
            auth.extend_from_slice(pass);
            stream.write_all(&auth).await?;

            let mut status = [0u8; 2];
            stream.read_exact(&mut status).await?;
            if status[1] != 0x00 {
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "SOCKS5 authentication rejected",
                ));
            }
        }
        _ => return Err(invalid("SOCKS5 proxy offered no acceptable method")),
    }

    let mut request = vec![0x05, 0x01, 0x00];
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.push(0x01);
            request.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            request.push(0x04);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let name = host.as_bytes();
            let len = u8::try_from(name.len()).map_err(|_| invalid("host name too long"))?;
            request.push(0x03);
            request.push(len);
            request.extend_from_slice(name);
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[1] != 0x00 {
        return Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("SOCKS5 connect failed with code {}", reply[1]),
        ));
    }
    let bound_len = match reply[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            usize::from(len[0])
        }
        _ => return Err(invalid("SOCKS5 reply with unknown address type")),
    };
    let mut bound = vec![0u8; bound_len + 2];
    stream.read_exact(&mut bound).await?;
    Ok(())
}
