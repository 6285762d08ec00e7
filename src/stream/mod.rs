//! Streaming session abstraction shared by all SSE endpoints.
//!
//! Every streaming route used to build its own `Sse` response by hand; this
//! module replaces that with a single tagged-event channel with an explicit
//! lifecycle: `Pending -> Streaming -> {Completed, Errored, Cancelled}`.
//! A session emits exactly one terminal event (`done` or `error`); anything
//! sent after that is dropped. Client disconnects cancel the session token,
//! which producers check between steps and pass to outbound calls.

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Interval for the keep-alive comment; chosen to survive proxy idle timeouts.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Artificial delay between simulated token chunks. Cosmetic pacing for
/// providers that return a full completion rather than an incremental stream.
pub const TOKEN_PACING_DELAY: Duration = Duration::from_millis(12);

/// Channel capacity for buffered session events
const SESSION_BUFFER: usize = 64;

/// Lifecycle state of a streaming session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Pending = 0,
    Streaming = 1,
    Completed = 2,
    Errored = 3,
    Cancelled = 4,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Streaming,
            2 => Self::Completed,
            3 => Self::Errored,
            4 => Self::Cancelled,
            _ => Self::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Errored | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Errored => "errored",
            Self::Cancelled => "cancelled",
        }
    }
}

/// A tagged event relayed to the client as a named SSE event with a JSON body
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Init(Value),
    Ping(Value),
    Progress(Value),
    Token(Value),
    Paper(Value),
    Sources(Value),
    Metrics(Value),
    Clusters(Value),
    Insights(Value),
    Report(Value),
    Done(Value),
    Error(Value),
    /// A per-source failure during a fan-out. Shares the `error` event name
    /// on the wire but does NOT close the session.
    SourceError(Value),
}

impl StreamEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Init(_) => "init",
            Self::Ping(_) => "ping",
            Self::Progress(_) => "progress",
            Self::Token(_) => "token",
            Self::Paper(_) => "paper",
            Self::Sources(_) => "sources",
            Self::Metrics(_) => "metrics",
            Self::Clusters(_) => "clusters",
            Self::Insights(_) => "insights",
            Self::Report(_) => "report",
            Self::Done(_) => "done",
            Self::Error(_) | Self::SourceError(_) => "error",
        }
    }

    pub fn payload(&self) -> &Value {
        match self {
            Self::Init(v)
            | Self::Ping(v)
            | Self::Progress(v)
            | Self::Token(v)
            | Self::Paper(v)
            | Self::Sources(v)
            | Self::Metrics(v)
            | Self::Clusters(v)
            | Self::Insights(v)
            | Self::Report(v)
            | Self::Done(v)
            | Self::Error(v)
            | Self::SourceError(v) => v,
        }
    }

    /// `done` and `error` close the session
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done(_) | Self::Error(_))
    }
}

/// Producer-side handle for a streaming session
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<StreamEvent>,
    state: Arc<AtomicU8>,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Send an event, enforcing the session lifecycle. Returns false when the
    /// event was dropped (session already terminal, or client disconnected).
    pub async fn send(&self, event: StreamEvent) -> bool {
        let current = self.state();
        if current.is_terminal() {
            return false;
        }

        let next = if event.is_terminal() {
            match event {
                StreamEvent::Done(_) => SessionState::Completed,
                _ => SessionState::Errored,
            }
        } else {
            SessionState::Streaming
        };

        if self.tx.send(event).await.is_err() {
            // Receiver dropped: the client went away
            self.state
                .store(SessionState::Cancelled as u8, Ordering::SeqCst);
            self.cancel.cancel();
            return false;
        }

        self.state.store(next as u8, Ordering::SeqCst);
        true
    }

    pub async fn progress(&self, message: impl Into<String>) -> bool {
        self.send(StreamEvent::Progress(json!({ "message": message.into() })))
            .await
    }

    pub async fn progress_pct(&self, message: impl Into<String>, percentage: u32) -> bool {
        self.send(StreamEvent::Progress(json!({
            "message": message.into(),
            "percentage": percentage,
        })))
        .await
    }

    pub async fn done(&self, payload: Value) -> bool {
        self.send(StreamEvent::Done(payload)).await
    }

    pub async fn error(&self, message: impl Into<String>) -> bool {
        self.send(StreamEvent::Error(json!({ "error": message.into() })))
            .await
    }

    /// Report a single upstream source failing without closing the session.
    pub async fn source_error(&self, source: &str, error: impl Into<String>) -> bool {
        self.send(StreamEvent::SourceError(json!({
            "source": source,
            "error": error.into(),
        })))
        .await
    }
}

/// A streaming session: spawn a producer, get back an SSE response.
pub struct StreamSession;

impl StreamSession {
    /// Create a detached handle/receiver pair. Most callers want [`spawn`];
    /// this exists for tests and for producers with custom wiring.
    pub fn channel() -> (SessionHandle, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(SESSION_BUFFER);
        let handle = SessionHandle {
            tx,
            state: Arc::new(AtomicU8::new(SessionState::Pending as u8)),
            cancel: CancellationToken::new(),
        };
        (handle, rx)
    }

    /// Run `producer` on a background task and return the SSE response that
    /// relays its events. When the producer returns `Err` before emitting a
    /// terminal event, an `error` event is emitted on its behalf; when it
    /// returns `Ok` without one, a bare `done` is emitted. Either way the
    /// terminal-event invariant holds.
    pub fn spawn<F, Fut>(
        name: &'static str,
        producer: F,
    ) -> Sse<impl Stream<Item = Result<Event, Infallible>>>
    where
        F: FnOnce(SessionHandle) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let (handle, rx) = Self::channel();

        // Cancel the session when the client disconnects
        let watch_tx = handle.tx.clone();
        let watch_cancel = handle.cancel.clone();
        let watch_state = handle.state.clone();
        tokio::spawn(async move {
            watch_tx.closed().await;
            let state = SessionState::from_u8(watch_state.load(Ordering::SeqCst));
            if !state.is_terminal() {
                watch_state.store(SessionState::Cancelled as u8, Ordering::SeqCst);
            }
            watch_cancel.cancel();
        });

        let task_handle = handle.clone();
        let fut = producer(handle);
        tokio::spawn(async move {
            let result = fut.await;
            let state = task_handle.state();
            if !state.is_terminal() {
                match result {
                    Ok(()) => {
                        task_handle.done(json!({})).await;
                    }
                    Err(e) => {
                        tracing::warn!(session = name, error = %e, "Stream producer failed");
                        task_handle.error(e.to_string()).await;
                    }
                }
            } else if let Err(e) = result {
                tracing::debug!(session = name, error = %e, "Producer error after terminal event");
            }
            metrics::counter!(
                "atheneum_stream_sessions_total",
                "session" => name,
                "outcome" => task_handle.state().as_str(),
            )
            .increment(1);
        });

        Self::relay(rx)
    }

    /// Wrap a session receiver in an axum SSE response with keep-alive.
    pub fn relay(
        mut rx: mpsc::Receiver<StreamEvent>,
    ) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
        let stream = async_stream::stream! {
            while let Some(event) = rx.recv().await {
                let terminal = event.is_terminal();
                let sse = Event::default()
                    .event(event.name())
                    .data(event.payload().to_string());
                yield Ok::<_, Infallible>(sse);
                if terminal {
                    break;
                }
            }
        };

        Sse::new(stream).keep_alive(
            KeepAlive::new()
                .interval(HEARTBEAT_INTERVAL)
                .text("ping"),
        )
    }
}

/// Emit a full completion as paced `token` events: whitespace-preserving
/// chunks with a fixed artificial delay and a progress signal every 20
/// chunks. Returns the number of token events emitted.
pub async fn emit_paced_tokens(handle: &SessionHandle, content: &str) -> usize {
    let chunks = split_keeping_whitespace(content);
    let total = chunks.len().max(1);
    let mut emitted = 0;

    for (i, chunk) in chunks.iter().enumerate() {
        if handle.is_cancelled() {
            break;
        }
        if !chunk.is_empty() {
            if !handle
                .send(StreamEvent::Token(json!({ "content": chunk })))
                .await
            {
                break;
            }
            emitted += 1;
        }
        if i % 20 == 0 {
            let pct = (i * 100 / total) as u32;
            handle
                .send(StreamEvent::Progress(json!({ "percentage": pct })))
                .await;
        }
        tokio::time::sleep(TOKEN_PACING_DELAY).await;
    }
    emitted
}

/// Emit a document as fixed-size paced `report` chunks (used by the report
/// pipeline, which assembles the full markdown before relaying it).
pub async fn emit_paced_chunks(handle: &SessionHandle, content: &str, chunk_size: usize) -> usize {
    let mut emitted = 0;
    let chars: Vec<char> = content.chars().collect();
    for chunk in chars.chunks(chunk_size.max(1)) {
        if handle.is_cancelled() {
            break;
        }
        let text: String = chunk.iter().collect();
        if !handle
            .send(StreamEvent::Report(json!({ "content": text })))
            .await
        {
            break;
        }
        emitted += 1;
        tokio::time::sleep(TOKEN_PACING_DELAY).await;
    }
    emitted
}

/// Split text into alternating word/whitespace runs so that re-joining the
/// chunks reproduces the input exactly.
fn split_keeping_whitespace(text: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut in_whitespace = None::<bool>;

    for c in text.chars() {
        let ws = c.is_whitespace();
        if in_whitespace != Some(ws) && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        in_whitespace = Some(ws);
        current.push(c);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exactly_one_terminal_event() {
        let (handle, mut rx) = StreamSession::channel();

        assert!(handle.send(StreamEvent::Init(json!({"ok": true}))).await);
        assert!(handle.done(json!({"count": 3})).await);
        // Post-terminal sends are dropped
        assert!(!handle.error("late").await);
        assert!(!handle.done(json!({})).await);
        assert_eq!(handle.state(), SessionState::Completed);

        assert_eq!(rx.recv().await.unwrap().name(), "init");
        assert_eq!(rx.recv().await.unwrap().name(), "done");
        drop(handle);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_error_is_terminal() {
        let (handle, mut rx) = StreamSession::channel();
        assert!(handle.error("upstream failed").await);
        assert_eq!(handle.state(), SessionState::Errored);
        assert!(!handle.progress("ignored").await);

        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.name(), "error");
        assert_eq!(ev.payload()["error"], "upstream failed");
    }

    #[tokio::test]
    async fn test_source_error_is_not_terminal() {
        let (handle, mut rx) = StreamSession::channel();
        assert!(handle.source_error("arxiv", "timed out").await);
        assert_eq!(handle.state(), SessionState::Streaming);
        assert!(handle.done(json!({"count": 0})).await);

        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.name(), "error");
        assert!(!ev.is_terminal());
        assert_eq!(ev.payload()["source"], "arxiv");
        assert_eq!(rx.recv().await.unwrap().name(), "done");
    }

    #[tokio::test]
    async fn test_disconnect_cancels_session() {
        let (handle, rx) = StreamSession::channel();
        drop(rx);

        assert!(!handle.progress("anyone there?").await);
        assert_eq!(handle.state(), SessionState::Cancelled);
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn test_first_event_moves_to_streaming() {
        let (handle, mut rx) = StreamSession::channel();
        assert_eq!(handle.state(), SessionState::Pending);
        handle.send(StreamEvent::Init(json!({}))).await;
        assert_eq!(handle.state(), SessionState::Streaming);
        rx.recv().await.unwrap();
    }

    #[test]
    fn test_split_keeping_whitespace_roundtrip() {
        let text = "the  quick\nbrown fox ";
        let chunks = split_keeping_whitespace(text);
        assert_eq!(chunks.join(""), text);
        // Alternating word / whitespace runs
        assert_eq!(chunks[0], "the");
        assert_eq!(chunks[1], "  ");
    }

    #[tokio::test]
    async fn test_paced_tokens_emit_and_complete() {
        tokio::time::pause();
        let (handle, mut rx) = StreamSession::channel();

        let producer = {
            let handle = handle.clone();
            tokio::spawn(async move {
                let n = emit_paced_tokens(&handle, "a b c").await;
                handle.done(json!({ "tokens": n })).await;
            })
        };

        let mut tokens = 0;
        let mut saw_done = false;
        loop {
            tokio::select! {
                ev = rx.recv() => match ev {
                    Some(StreamEvent::Token(_)) => tokens += 1,
                    Some(StreamEvent::Done(_)) => { saw_done = true; break; }
                    Some(_) => {}
                    None => break,
                },
                _ = tokio::time::advance(Duration::from_millis(20)) => {}
            }
        }
        producer.await.unwrap();
        // "a b c" has 3 word chunks and 2 whitespace chunks
        assert_eq!(tokens, 5);
        assert!(saw_done);
    }
}
