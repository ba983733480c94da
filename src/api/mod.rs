//! HTTP surface: `/api/stats`, `/video_feed`, `/health`.
//!
//! Plain `std::net` server. The accept loop is non-blocking so it notices
//! shutdown; every accepted connection gets its own thread because video
//! viewers hold their socket open indefinitely. Only `/video_feed` is
//! capped; stats and health polls are always served.

use anyhow::{anyhow, Context, Result};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::broadcast::{self, StreamBroadcaster};
use crate::stats::StatsEndpoint;

const MAX_REQUEST_BYTES: usize = 8192;
const ACCEPT_POLL: Duration = Duration::from_millis(50);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    /// Concurrent `/video_feed` viewers before new ones get 503.
    pub max_viewers: usize,
    /// A viewer that cannot take a frame for this long is dropped.
    pub write_timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:5000".to_string(),
            max_viewers: 64,
            write_timeout: Duration::from_secs(10),
        }
    }
}

/// What the handlers serve.
#[derive(Clone)]
pub struct ApiState {
    pub stats: StatsEndpoint,
    pub broadcaster: StreamBroadcaster,
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    connections: Arc<AtomicUsize>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    /// Stop accepting, then give open connections a moment to finish.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while self.connections.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        Ok(())
    }

    pub fn open_connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    state: ApiState,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, state: ApiState) -> Self {
        Self { cfg, state }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .with_context(|| format!("invalid api address '{}'", self.cfg.addr))?;
        let listener = TcpListener::bind(configured_addr)
            .with_context(|| format!("bind api listener on {}", configured_addr))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let connections = Arc::new(AtomicUsize::new(0));
        let server = Server {
            cfg: self.cfg,
            state: self.state,
            shutdown: shutdown.clone(),
            connections: connections.clone(),
            viewers: Arc::new(AtomicUsize::new(0)),
        };
        let join = std::thread::Builder::new()
            .name("api-accept".into())
            .spawn(move || {
                if let Err(err) = server.run(listener) {
                    log::error!("api server stopped: {:#}", err);
                }
            })
            .context("spawn api thread")?;
        log::info!("api listening on http://{}", addr);

        Ok(ApiHandle {
            addr,
            shutdown,
            connections,
            join: Some(join),
        })
    }
}

#[derive(Clone)]
struct Server {
    cfg: ApiConfig,
    state: ApiState,
    shutdown: Arc<AtomicBool>,
    connections: Arc<AtomicUsize>,
    viewers: Arc<AtomicUsize>,
}

/// Holds one unit of a shared counter until dropped.
struct Slot(Arc<AtomicUsize>);

impl Slot {
    fn take(counter: &Arc<AtomicUsize>) -> (Self, usize) {
        let held = counter.fetch_add(1, Ordering::SeqCst) + 1;
        (Self(Arc::clone(counter)), held)
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Server {
    fn run(&self, listener: TcpListener) -> Result<()> {
        while !self.shutdown.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, peer)) => self.dispatch(stream, peer),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_POLL);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    // Descriptor exhaustion and friends are transient.
                    log::warn!("api accept failed: {}", err);
                    std::thread::sleep(ACCEPT_POLL);
                }
            }
        }
        Ok(())
    }

    /// Hand the connection to its own thread; the accept loop never reads.
    fn dispatch(&self, stream: TcpStream, peer: SocketAddr) {
        let (slot, _) = Slot::take(&self.connections);
        let server = self.clone();
        let spawned = std::thread::Builder::new()
            .name("api-conn".into())
            .spawn(move || {
                let _slot = slot;
                if let Err(err) = server.handle_connection(stream) {
                    log::debug!("api connection {} closed: {:#}", peer, err);
                }
            });
        if let Err(err) = spawned {
            log::warn!("could not spawn handler for {}: {}", peer, err);
        }
    }

    fn handle_connection(&self, mut stream: TcpStream) -> Result<()> {
        // Accepted sockets inherit non-blocking mode on some platforms.
        stream.set_nonblocking(false)?;
        let request = read_request(&mut stream)?;
        if request.method != "GET" {
            return write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#);
        }
        match request.path.as_str() {
            "/health" => write_json_response(&mut stream, 200, r#"{"status":"ok"}"#),
            "/api/stats" => {
                let body = self.state.stats.to_json()?;
                write_json_response(&mut stream, 200, &body)
            }
            "/video_feed" => self.stream_video(stream),
            _ => write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#),
        }
    }

    fn stream_video(&self, mut stream: TcpStream) -> Result<()> {
        let (_viewer, watching) = Slot::take(&self.viewers);
        if watching > self.cfg.max_viewers {
            log::warn!("rejecting viewer: {} already streaming", watching - 1);
            return write_json_response(&mut stream, 503, r#"{"error":"busy"}"#);
        }
        stream.set_write_timeout(Some(self.cfg.write_timeout))?;
        let header = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nCache-Control: no-cache, no-store\r\nPragma: no-cache\r\nConnection: close\r\n\r\n",
            broadcast::content_type()
        );
        stream.write_all(header.as_bytes())?;

        // Dropping the viewer stream on any exit releases the viewer slot.
        for frame in self.state.broadcaster.connect() {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            broadcast::write_part(&mut stream, &frame).context("viewer write failed")?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&data);
    let request_line = text
        .split("\r\n")
        .next()
        .filter(|line| !line.is_empty())
        .ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
    })
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}
