//! Connections to a pack peer.
//!
//! Supported URL schemes:
//! - `ssh://[user@]host[:port]/path`: runs the remote program through the
//!   configured ssh command and speaks over its stdio
//! - `tcp://host:port/path`: raw socket, request line sent first
//! - `http://` / `https://`: smart HTTP via `reqwest`
//!
//! `DuplexTransport` runs a peer in-process over `tokio::io::duplex`.

use crate::error::{Result, SyncError};
use crate::peer;
use crate::pktline::{self, Packet, PacketIo, PacketStream};
use crate::protocol::Service;
use crate::storage::TargetStore;
use crate::sync::SyncConfig;
use async_trait::async_trait;
use bytes::Bytes;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use url::Url;

/// Opens a packet channel to a peer service
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, service: Service) -> Result<Box<dyn PacketIo>>;

    /// Human readable endpoint, for logs
    fn describe(&self) -> String;
}

fn transport_error(context: &str, e: impl std::fmt::Display) -> SyncError {
    SyncError::Transport(format!("{}: {}", context, e))
}

/// Build a transport for `url` using the program names and timeout in `config`
pub fn from_url(url: &str, config: &SyncConfig) -> Result<Box<dyn Transport>> {
    let parsed = Url::parse(url).map_err(|e| SyncError::Transport(format!("invalid remote URL {:?}: {}", url, e)))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| SyncError::Transport(format!("remote URL {:?} has no host", url)))?;
    match parsed.scheme() {
        "ssh" => {
            let mut destination = host.to_string();
            if !parsed.username().is_empty() {
                destination = format!("{}@{}", parsed.username(), host);
            }
            Ok(Box::new(SshTransport {
                command: config.ssh_command.clone(),
                destination,
                port: parsed.port(),
                path: parsed.path().to_string(),
                upload_pack: config.upload_pack.clone(),
                receive_pack: config.receive_pack.clone(),
            }))
        }
        "tcp" => {
            let port = parsed
                .port()
                .ok_or_else(|| SyncError::Transport(format!("tcp remote {:?} needs a port", url)))?;
            Ok(Box::new(TcpTransport::new(format!("{}:{}", host, port), parsed.path())))
        }
        "http" | "https" => Ok(Box::new(HttpTransport::new(url, Duration::from_secs(config.timeout_secs))?)),
        other => Err(SyncError::Transport(format!("unsupported URL scheme {:?}", other))),
    }
}

/// Runs `<ssh_command> [-p port] <host> <program> '<path>'`
pub struct SshTransport {
    pub command: String,
    pub destination: String,
    pub port: Option<u16>,
    pub path: String,
    pub upload_pack: String,
    pub receive_pack: String,
}

impl SshTransport {
    fn program(&self, service: Service) -> &str {
        match service {
            Service::UploadPack => &self.upload_pack,
            Service::ReceivePack => &self.receive_pack,
        }
    }
}

/// Single-quote `s` for the remote shell
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Packet channel over a child process' stdio. The child is killed when
/// the connection is dropped.
pub struct ChildConnection {
    stream: PacketStream<ChildStdout, ChildStdin>,
    _child: Child,
}

#[async_trait]
impl PacketIo for ChildConnection {
    async fn read_packet(&mut self) -> Result<Packet> {
        self.stream.read_packet().await
    }

    async fn write_packet(&mut self, packet: &Packet) -> Result<()> {
        self.stream.write_packet(packet).await
    }

    async fn flush(&mut self) -> Result<()> {
        self.stream.flush().await
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn connect(&self, service: Service) -> Result<Box<dyn PacketIo>> {
        let mut words = self.command.split_whitespace();
        let program = words
            .next()
            .ok_or_else(|| SyncError::Transport("empty ssh command".to_string()))?;
        let mut command = Command::new(program);
        command.args(words);
        if let Some(port) = self.port {
            command.arg("-p").arg(port.to_string());
        }
        command
            .arg(&self.destination)
            .arg(format!("{} {}", self.program(service), shell_quote(&self.path)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        debug!(destination = %self.destination, service = service.as_str(), "spawning ssh");

        let mut child = command.spawn().map_err(|e| transport_error("failed to spawn ssh", e))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SyncError::Transport("ssh stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SyncError::Transport("ssh stdout unavailable".to_string()))?;
        Ok(Box::new(ChildConnection {
            stream: PacketStream::new(stdout, stdin),
            _child: child,
        }))
    }

    fn describe(&self) -> String {
        format!("ssh://{}{}", self.destination, self.path)
    }
}

/// Raw streaming socket
pub struct TcpTransport {
    addr: String,
    path: String,
}

impl TcpTransport {
    pub fn new(addr: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            path: path.into(),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, service: Service) -> Result<Box<dyn PacketIo>> {
        let socket = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| transport_error(&format!("failed to connect to {}", self.addr), e))?;
        let (reader, writer) = socket.into_split();
        let mut stream = PacketStream::new(reader, writer);
        stream
            .write_lines(&[format!("{} {}", service.as_str(), self.path)])
            .await?;
        stream.flush().await?;
        Ok(Box::new(stream))
    }

    fn describe(&self) -> String {
        format!("tcp://{}{}", self.addr, self.path)
    }
}

/// Smart HTTP: the advertisement comes from `GET info/refs`, every later
/// round is one `POST` carrying the buffered request packets.
pub struct HttpTransport {
    base_url: String,
    http: reqwest::Client,
}

impl HttpTransport {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| transport_error("failed to create HTTP client", e))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn connect(&self, service: Service) -> Result<Box<dyn PacketIo>> {
        let url = format!("{}/info/refs?service={}", self.base_url, service.as_str());
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| transport_error(&format!("GET {} failed", url), e))?;
        let inbound = read_body(resp, &url).await?;
        Ok(Box::new(HttpConnection {
            http: self.http.clone(),
            post_url: format!("{}/{}", self.base_url, service.as_str()),
            content_type: format!("application/x-{}-request", service.as_str()),
            inbound,
            pos: 0,
            outbound: Vec::new(),
        }))
    }

    fn describe(&self) -> String {
        self.base_url.clone()
    }
}

async fn read_body(resp: reqwest::Response, url: &str) -> Result<Bytes> {
    if !resp.status().is_success() {
        return Err(SyncError::Transport(format!("{} returned {}", url, resp.status())));
    }
    resp.bytes()
        .await
        .map_err(|e| transport_error(&format!("reading {} failed", url), e))
}

pub struct HttpConnection {
    http: reqwest::Client,
    post_url: String,
    content_type: String,
    inbound: Bytes,
    pos: usize,
    outbound: Vec<u8>,
}

#[async_trait]
impl PacketIo for HttpConnection {
    async fn read_packet(&mut self) -> Result<Packet> {
        if self.pos >= self.inbound.len() {
            if self.outbound.is_empty() {
                return Err(SyncError::Transport("HTTP response ended early".to_string()));
            }
            let body = std::mem::take(&mut self.outbound);
            let resp = self
                .http
                .post(&self.post_url)
                .header(reqwest::header::CONTENT_TYPE, self.content_type.as_str())
                .body(body)
                .send()
                .await
                .map_err(|e| transport_error(&format!("POST {} failed", self.post_url), e))?;
            self.inbound = read_body(resp, &self.post_url).await?;
            self.pos = 0;
        }
        match pktline::decode(&self.inbound[self.pos..])? {
            Some((packet, used)) => {
                self.pos += used;
                Ok(packet)
            }
            None => Err(SyncError::protocol("truncated packet in HTTP response")),
        }
    }

    async fn write_packet(&mut self, packet: &Packet) -> Result<()> {
        self.outbound.extend_from_slice(&packet.encode()?);
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Serves an in-process store over a duplex pipe, one task per connection
pub struct DuplexTransport<S> {
    store: Arc<Mutex<S>>,
}

impl<S> DuplexTransport<S> {
    pub fn new(store: Arc<Mutex<S>>) -> Self {
        Self { store }
    }
}

const DUPLEX_BUFFER: usize = 256 * 1024;

#[async_trait]
impl<S> Transport for DuplexTransport<S>
where
    S: TargetStore + Sync + 'static,
{
    async fn connect(&self, service: Service) -> Result<Box<dyn PacketIo>> {
        let (client, server) = tokio::io::duplex(DUPLEX_BUFFER);
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            let (reader, writer) = tokio::io::split(server);
            let mut io = PacketStream::new(reader, writer);
            let mut store = store.lock().await;
            let result = match service {
                Service::UploadPack => peer::serve_upload_pack(&mut io, &*store).await.map(|_| ()),
                Service::ReceivePack => peer::serve_receive_pack(&mut io, &mut *store).await.map(|_| ()),
            };
            if let Err(e) = result {
                warn!(error = %e, service = service.as_str(), "in-process peer failed");
            }
        });
        let (reader, writer) = tokio::io::split(client);
        Ok(Box::new(PacketStream::new(reader, writer)))
    }

    fn describe(&self) -> String {
        "duplex".to_string()
    }
}
