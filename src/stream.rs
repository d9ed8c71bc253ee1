// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Server-sent event stream consumer.
//!
//! Opens `GET {source}/eventstream/{topic}` and republishes every `data:`
//! value on a channel, for as long as the shutdown signal stays low.
//!
//! # Connection Lifecycle
//!
//! ```text
//!            ┌──────────────────────────────────────────┐
//!            ▼                                          │
//!      Connecting ──200──▶ Streaming ──EOF / error──────┤
//!            │                 │                        │
//!            └──non-200 / transport error───────────────┘
//!
//!      (any state) ──shutdown──▶ Stopped
//! ```
//!
//! Every connect goes through the resilient transport, so a flapping
//! source is retried with backoff per attempt. Nothing else slows the
//! reconnect loop unless a `reconnect_delay` is configured.
//!
//! # Line Protocol
//!
//! | Line | Effect |
//! |------|--------|
//! | `id: X` | resume cursor := X |
//! | `event: X` | logged; the type travels inside the JSON payload |
//! | `data: X` | `X` sent on the output channel |
//! | `: ...` | comment / heartbeat, ignored |
//! | blank | end of an event block, ignored |
//! | anything else | logged as unrecognized, ignored |
//!
//! End of body is treated as connection loss and triggers a reconnect
//! carrying `Last-Event-ID: <cursor>`. A line cut off by the disconnect is
//! discarded, so neither the cursor nor the channel sees partial input. A
//! line longer than [`MAX_LINE_BYTES`] also ends the session.
//!
//! # Backpressure
//!
//! The output channel has capacity 1, so the reader stalls until the
//! consumer takes the previous value. A slow apply loop slows the reader.

use crate::cursor::ResumeCursor;
use crate::metrics;
use crate::transport::{HttpRequest, RetryingClient};
use reqwest::{Response, StatusCode};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn, Instrument};

/// Capacity of the channel between the stream reader and its consumer.
pub const OUTPUT_CHANNEL_CAPACITY: usize = 1;

/// Longest line the reader buffers before giving up on the connection.
pub const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// One classified line of the event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamLine {
    Id(String),
    Event(String),
    Data(String),
    Comment(String),
    Blank,
    Unrecognized(String),
}

/// Value of `field:` (with one optional leading space removed).
fn field_value<'a>(line: &'a str, field: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(field)?.strip_prefix(':')?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

/// Classify one line (without its `\n`; a trailing `\r` is tolerated).
pub fn parse_line(line: &str) -> StreamLine {
    let line = line.strip_suffix('\r').unwrap_or(line);

    if line.is_empty() {
        return StreamLine::Blank;
    }
    if let Some(comment) = line.strip_prefix(':') {
        return StreamLine::Comment(comment.trim_start().to_string());
    }
    if let Some(id) = field_value(line, "id") {
        return StreamLine::Id(id.to_string());
    }
    if let Some(event) = field_value(line, "event") {
        return StreamLine::Event(event.to_string());
    }
    if let Some(data) = field_value(line, "data") {
        return StreamLine::Data(data.to_string());
    }
    StreamLine::Unrecognized(line.to_string())
}

/// Splits a chunked byte stream into lines.
///
/// Chunks can end mid-line (or mid-character); bytes are held until the
/// terminating `\n` arrives. Bytes already searched for a newline are not
/// searched again.
#[derive(Debug)]
pub struct LineBuffer {
    pending: Vec<u8>,
    scanned: usize,
    max_line: usize,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer that reports overflow past `max_line` unterminated bytes.
    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            pending: Vec::new(),
            scanned: 0,
            max_line,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
    }

    /// Next complete line, without its terminator.
    pub fn next_line(&mut self) -> Option<String> {
        let Some(offset) = self.pending[self.scanned..].iter().position(|&b| b == b'\n') else {
            self.scanned = self.pending.len();
            return None;
        };
        let newline = self.scanned + offset;
        self.scanned = 0;

        let mut line: Vec<u8> = self.pending.drain(..=newline).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// Whether the unterminated tail has grown past the line limit.
    pub fn overflowed(&self) -> bool {
        self.pending.len() > self.max_line
    }

    /// Drop the unterminated tail left when the body ends.
    ///
    /// Returns how many bytes were discarded. A partial line is never
    /// handed out as if it were complete.
    pub fn discard_partial(&mut self) -> usize {
        self.scanned = 0;
        std::mem::take(&mut self.pending).len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Resolves once shutdown is signaled (or the signal's sender is gone).
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Why a streaming session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// Body ended or failed; reconnect.
    Disconnected,
    /// Shutdown was signaled.
    Shutdown,
    /// Nobody is listening on the output channel anymore.
    ReceiverGone,
}

/// Long-running consumer of one topic's event stream.
#[derive(Debug, Clone)]
pub struct EventStream {
    client: RetryingClient,
    url: String,
    topic: String,
    cursor: ResumeCursor,
    reconnect_delay: Duration,
}

impl EventStream {
    /// Stream `{source_uri}/eventstream/{topic}` through `client`.
    pub fn new(client: RetryingClient, source_uri: &str, topic: &str) -> Self {
        Self {
            client,
            url: format!("{}/eventstream/{}", source_uri.trim_end_matches('/'), topic),
            topic: topic.to_string(),
            cursor: ResumeCursor::new(),
            reconnect_delay: Duration::ZERO,
        }
    }

    /// Resume from an existing cursor instead of an empty one.
    pub fn with_cursor(mut self, cursor: ResumeCursor) -> Self {
        self.cursor = cursor;
        self
    }

    /// Pause between a lost connection and the next connect.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Shared handle to the resume cursor.
    pub fn cursor(&self) -> ResumeCursor {
        self.cursor.clone()
    }

    /// Start reading on a new task.
    ///
    /// The returned receiver yields `data:` values; it closes when the task
    /// stops.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> (mpsc::Receiver<String>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let handle = tokio::spawn(self.run(tx, shutdown));
        (rx, handle)
    }

    /// Read until shutdown, reconnecting whenever the stream ends.
    ///
    /// Dropping `tx` on return closes the channel for the consumer.
    pub async fn run(self, tx: mpsc::Sender<String>, mut shutdown: watch::Receiver<bool>) {
        let span = tracing::info_span!("event_stream", topic = %self.topic);

        async move {
            info!(url = %self.url, "Starting event stream");
            let mut connects: u64 = 0;

            loop {
                if *shutdown.borrow() {
                    break;
                }
                if connects > 0 && !self.reconnect_delay.is_zero() {
                    tokio::select! {
                        biased;
                        _ = wait_for_shutdown(&mut shutdown) => break,
                        _ = tokio::time::sleep(self.reconnect_delay) => {}
                    }
                }
                connects += 1;

                let cursor = self.cursor.get().await;
                let request = HttpRequest::get(self.url.as_str())
                    .header("Accept", "text/event-stream")
                    .header("Cache-Control", "no-cache")
                    .header("Last-Event-ID", cursor.as_str());

                let outcome = tokio::select! {
                    biased;
                    _ = wait_for_shutdown(&mut shutdown) => break,
                    outcome = self.client.execute(&request) => outcome,
                };

                let response = match outcome {
                    Ok(response) if response.status() == StatusCode::OK => response,
                    Ok(response) => {
                        warn!(status = response.status().as_u16(), "Event stream refused connection");
                        metrics::record_stream_connection(&self.topic, "status");
                        tokio::task::yield_now().await;
                        continue;
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to connect to event stream");
                        metrics::record_stream_connection(&self.topic, "error");
                        tokio::task::yield_now().await;
                        continue;
                    }
                };

                info!(cursor = %cursor, "Connected to event stream");
                metrics::record_stream_connection(&self.topic, "connected");

                match self.consume(response, &tx, &mut shutdown).await {
                    SessionEnd::Disconnected => {
                        let cursor = self.cursor.get().await;
                        info!(cursor = %cursor, "Event stream disconnected, reconnecting");
                    }
                    SessionEnd::Shutdown => break,
                    SessionEnd::ReceiverGone => {
                        warn!("Event consumer went away, stopping stream");
                        break;
                    }
                }
            }

            info!("Event stream stopped");
        }
        .instrument(span)
        .await
    }

    /// Read one connection's body line by line.
    async fn consume(
        &self,
        mut response: Response,
        tx: &mpsc::Sender<String>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let mut buffer = LineBuffer::new();

        loop {
            let chunk = tokio::select! {
                biased;
                _ = wait_for_shutdown(shutdown) => return SessionEnd::Shutdown,
                chunk = response.chunk() => chunk,
            };

            let at_eof = match chunk {
                Ok(Some(bytes)) => {
                    buffer.push(&bytes);
                    false
                }
                Ok(None) => true,
                Err(e) => {
                    warn!(error = %e, "Event stream read failed");
                    metrics::record_stream_disconnect(&self.topic, "read_error");
                    return SessionEnd::Disconnected;
                }
            };

            while let Some(line) = buffer.next_line() {
                if let Some(end) = self.handle_line(&line, tx, shutdown).await {
                    return end;
                }
            }

            if at_eof {
                let dropped = buffer.discard_partial();
                if dropped > 0 {
                    debug!(bytes = dropped, "Discarding unterminated line at end of stream");
                }
                metrics::record_stream_disconnect(&self.topic, "eof");
                return SessionEnd::Disconnected;
            }

            if buffer.overflowed() {
                warn!(max_bytes = MAX_LINE_BYTES, "Event stream line too long, reconnecting");
                buffer.discard_partial();
                metrics::record_stream_disconnect(&self.topic, "line_too_long");
                return SessionEnd::Disconnected;
            }
        }
    }

    /// Act on one line. Returns `Some` if the session must end.
    async fn handle_line(
        &self,
        line: &str,
        tx: &mpsc::Sender<String>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<SessionEnd> {
        match parse_line(line) {
            StreamLine::Id(id) => {
                self.cursor.advance(&id).await;
                metrics::set_resume_cursor_present(&self.topic, !id.is_empty());
            }
            StreamLine::Event(event) => {
                debug!(event = %event, "Event block");
            }
            StreamLine::Data(data) => {
                metrics::record_stream_data_line(&self.topic);
                tokio::select! {
                    biased;
                    _ = wait_for_shutdown(shutdown) => return Some(SessionEnd::Shutdown),
                    sent = tx.send(data) => {
                        if sent.is_err() {
                            return Some(SessionEnd::ReceiverGone);
                        }
                    }
                }
            }
            StreamLine::Comment(comment) => {
                trace!(comment = %comment, "Stream comment");
            }
            StreamLine::Blank => {}
            StreamLine::Unrecognized(other) => {
                warn!(line = %other, "Unrecognized event stream line");
                metrics::record_stream_unrecognized_line(&self.topic);
            }
        }
        None
    }
}
