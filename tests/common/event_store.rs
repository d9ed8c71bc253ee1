//! In-process mock event store.
//!
//! Speaks just enough HTTP/1.1 over a tokio `TcpListener`:
//!
//! - `POST /event/{topic}` records the body and answers `201`, after first
//!   answering any scripted failure statuses. Accepted bodies are appended
//!   to the stream (the echo every writer relies on).
//! - `GET /eventstream/{topic}` records `Last-Event-ID` and streams every
//!   event after it as `id:`/`event:`/`data:` blocks, then waits for more.
//!
//! Both record the full request header map. A scripted raw body replaces
//! the next stream response verbatim, which lets tests cut a line in half.
//!
//! Every response carries `Connection: close`. Event ids are 1-based
//! sequence numbers, so `Last-Event-ID: 2` resumes at the third event.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// How often an open stream re-checks for new events if not woken.
const STREAM_POLL: Duration = Duration::from_millis(50);

#[derive(Default)]
struct StoreState {
    /// Stream contents, in order. Index `i` has id `i + 1`.
    events: Mutex<Vec<String>>,
    /// Wakes open streams when `events` grows.
    appended: Notify,
    /// Every POST body received, accepted or not.
    post_bodies: Mutex<Vec<Vec<u8>>>,
    /// Statuses to answer the next POSTs with instead of 201.
    post_script: Mutex<VecDeque<u16>>,
    /// Statuses to answer the next GETs with instead of 200.
    stream_script: Mutex<VecDeque<u16>>,
    /// `Last-Event-ID` of every GET, in arrival order.
    stream_requests: Mutex<Vec<String>>,
    /// Full header map of every GET, in arrival order.
    stream_headers: Mutex<Vec<HashMap<String, String>>>,
    /// Full header map of every POST, in arrival order.
    post_headers: Mutex<Vec<HashMap<String, String>>>,
    /// Bodies to send verbatim on the next GETs before closing.
    raw_streams: Mutex<VecDeque<String>>,
    /// One-shot: close the next stream after sending this many events.
    drop_after: Mutex<Option<usize>>,
    /// Whether accepted POSTs are appended to the stream.
    echo_disabled: std::sync::atomic::AtomicBool,
    connections: AtomicUsize,
}

/// Mock event store bound to `127.0.0.1:<random>`.
pub struct MockEventStore {
    addr: SocketAddr,
    state: Arc<StoreState>,
    accept_loop: JoinHandle<()>,
}

impl MockEventStore {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(StoreState::default());

        let accept_state = Arc::clone(&state);
        let accept_loop = tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                accept_state.connections.fetch_add(1, Ordering::SeqCst);
                let state = Arc::clone(&accept_state);
                tokio::spawn(async move {
                    let _ = handle_connection(socket, state).await;
                });
            }
        });

        Self {
            addr,
            state,
            accept_loop,
        }
    }

    /// `http://127.0.0.1:<port>`
    pub fn uri(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Append a raw `data:` value to the stream. Returns its id.
    pub fn push_raw(&self, data: &str) -> String {
        append(&self.state, data.to_string())
    }

    /// Answer the next POSTs with these statuses, in order.
    pub fn script_post_statuses(&self, statuses: &[u16]) {
        self.state.post_script.lock().unwrap().extend(statuses);
    }

    /// Answer the next stream GETs with these statuses, in order.
    pub fn script_stream_statuses(&self, statuses: &[u16]) {
        self.state.stream_script.lock().unwrap().extend(statuses);
    }

    /// Answer the next stream GET with a 200 whose body is exactly `body`,
    /// then close the connection. Queued bodies are used in order.
    pub fn script_raw_stream(&self, body: &str) {
        self.state.raw_streams.lock().unwrap().push_back(body.to_string());
    }

    /// Close the next stream connection after `events` events.
    pub fn drop_next_stream_after(&self, events: usize) {
        *self.state.drop_after.lock().unwrap() = Some(events);
    }

    /// Stop appending accepted POSTs to the stream.
    pub fn disable_echo(&self) {
        self.state.echo_disabled.store(true, Ordering::SeqCst);
    }

    pub fn post_bodies(&self) -> Vec<Vec<u8>> {
        self.state.post_bodies.lock().unwrap().clone()
    }

    pub fn post_count(&self) -> usize {
        self.state.post_bodies.lock().unwrap().len()
    }

    /// `Last-Event-ID` header of each stream connection, in order.
    pub fn stream_requests(&self) -> Vec<String> {
        self.state.stream_requests.lock().unwrap().clone()
    }

    /// Headers of each stream connection, names lowercased.
    pub fn stream_request_headers(&self) -> Vec<HashMap<String, String>> {
        self.state.stream_headers.lock().unwrap().clone()
    }

    /// Headers of each POST, names lowercased.
    pub fn post_request_headers(&self) -> Vec<HashMap<String, String>> {
        self.state.post_headers.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<String> {
        self.state.events.lock().unwrap().clone()
    }

    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }
}

impl Drop for MockEventStore {
    fn drop(&mut self) {
        self.accept_loop.abort();
    }
}

fn append(state: &StoreState, data: String) -> String {
    let id = {
        let mut events = state.events.lock().unwrap();
        events.push(data);
        events.len().to_string()
    };
    state.appended.notify_waiters();
    id
}

struct Request {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

async fn read_request(socket: &mut TcpStream) -> std::io::Result<Option<Request>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let head_end = loop {
        if let Some(pos) = find(&buf, b"\r\n\r\n") {
            break pos;
        }
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default().to_string();
    let path = request_line.next().unwrap_or_default().to_string();
    let headers: HashMap<String, String> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_string()))
        .collect();

    let content_length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let mut body = buf[head_end + 4..].to_vec();
    while body.len() < content_length {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    Ok(Some(Request {
        method,
        path,
        headers,
        body,
    }))
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        400 => "Bad Request",
        404 => "Not Found",
        409 => "Conflict",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

async fn respond_empty(socket: &mut TcpStream, status: u16) -> std::io::Result<()> {
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        status,
        reason(status)
    );
    socket.write_all(response.as_bytes()).await?;
    socket.shutdown().await
}

async fn handle_connection(mut socket: TcpStream, state: Arc<StoreState>) -> std::io::Result<()> {
    let Some(request) = read_request(&mut socket).await? else {
        return Ok(());
    };

    match (request.method.as_str(), request.path.as_str()) {
        ("POST", path) if path.starts_with("/event/") => handle_post(socket, &state, request).await,
        ("GET", path) if path.starts_with("/eventstream/") => handle_stream(socket, &state, request).await,
        _ => respond_empty(&mut socket, 404).await,
    }
}

async fn handle_post(mut socket: TcpStream, state: &StoreState, request: Request) -> std::io::Result<()> {
    state.post_bodies.lock().unwrap().push(request.body.clone());
    state.post_headers.lock().unwrap().push(request.headers.clone());

    let scripted = state.post_script.lock().unwrap().pop_front();
    if let Some(status) = scripted {
        return respond_empty(&mut socket, status).await;
    }

    if !state.echo_disabled.load(Ordering::SeqCst) {
        append(state, String::from_utf8_lossy(&request.body).into_owned());
    }
    respond_empty(&mut socket, 201).await
}

async fn handle_stream(mut socket: TcpStream, state: &StoreState, request: Request) -> std::io::Result<()> {
    let last_event_id = request.headers.get("last-event-id").cloned().unwrap_or_default();
    state.stream_requests.lock().unwrap().push(last_event_id.clone());
    state.stream_headers.lock().unwrap().push(request.headers.clone());

    let scripted = state.stream_script.lock().unwrap().pop_front();
    if let Some(status) = scripted {
        return respond_empty(&mut socket, status).await;
    }

    socket
        .write_all(
            b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\nConnection: close\r\n\r\n",
        )
        .await?;

    let raw = state.raw_streams.lock().unwrap().pop_front();
    if let Some(body) = raw {
        socket.write_all(body.as_bytes()).await?;
        socket.flush().await?;
        return socket.shutdown().await;
    }

    socket.write_all(b": connected\n\n").await?;

    let mut next: usize = last_event_id.parse().unwrap_or(0);
    let drop_after = state.drop_after.lock().unwrap().take();
    let mut sent = 0usize;

    loop {
        let pending: Vec<String> = {
            let events = state.events.lock().unwrap();
            events.get(next..).map(<[String]>::to_vec).unwrap_or_default()
        };

        for data in pending {
            next += 1;
            let block = format!("id: {next}\nevent: message\ndata: {data}\n\n");
            socket.write_all(block.as_bytes()).await?;
            sent += 1;

            if drop_after == Some(sent) {
                socket.flush().await?;
                return socket.shutdown().await;
            }
        }
        socket.flush().await?;

        tokio::select! {
            _ = state.appended.notified() => {}
            _ = tokio::time::sleep(STREAM_POLL) => {}
        }
    }
}
