//! The stream reader: connection lifecycle, idle watchdog and resume cursor.
//!
//! The reader is an explicit state machine:
//!
//! ```text
//! Connecting ──ok──▶ Streaming ──chunk──▶ Streaming
//!     │                  │
//!     └──err──▶ Backoff ◀┘ (error, idle timeout, end of body)
//!                  │
//!                  └──delay──▶ Connecting
//! ```
//!
//! Missing configuration is the only way out of the loop. Every other error
//! is logged and followed by a fixed delay and a fresh connection attempt.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderValue, InvalidHeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::keepalive::{trace_hook, KeepAlive, KeepAliveHook};
use crate::retry::{backoff, with_timeout, ReconnectPolicy};
use crate::settings::{ConfigurationError, SettingsError, SettingsProvider};
use crate::sink::MessageSink;
use crate::stream::framing::{decode_frame, FrameDecoder, FrameError};

const ERROR_BODY_SNIPPET_LEN: usize = 220;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReaderDefaults;

impl ReaderDefaults {
    /// Longest silence tolerated on an open stream before reconnecting.
    pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
    pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);
    pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
}

/// Tuning knobs for [`StreamReader`].
#[derive(Clone, Debug)]
pub struct StreamReaderOptions {
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    /// Heartbeat period while the reader runs. `None` disables it.
    pub keepalive_interval: Option<Duration>,
    /// Honour `HTTP(S)_PROXY` from the environment.
    pub use_system_proxy: bool,
}

impl Default for StreamReaderOptions {
    fn default() -> Self {
        Self {
            idle_timeout: ReaderDefaults::IDLE_TIMEOUT,
            connect_timeout: ReaderDefaults::CONNECT_TIMEOUT,
            reconnect: ReconnectPolicy::fixed(ReaderDefaults::RECONNECT_DELAY),
            keepalive_interval: Some(ReaderDefaults::KEEPALIVE_INTERVAL),
            use_system_proxy: true,
        }
    }
}

/// Errors produced while establishing or consuming the subscription.
#[derive(Debug, Error)]
pub enum StreamReaderError {
    /// Endpoint or topics missing. Stops the reader.
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),

    /// Credentials could not be turned into a header value.
    #[error("invalid authorization header: {0}")]
    InvalidAuthHeader(#[from] InvalidHeaderValue),

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    /// The idle watchdog fired.
    #[error("no data received for {0:?}")]
    ReadTimeout(Duration),

    #[error("stream ended by server")]
    StreamEnded,

    /// The body stopped producing frame delimiters.
    #[error("stream framing failed: {0}")]
    Framing(#[from] FrameError),
}

impl StreamReaderError {
    /// Everything except missing configuration is retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Configuration(_))
    }
}

/// Observable phase of the reader state machine.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReaderPhase {
    Connecting,
    Streaming,
    Backoff,
    /// Stopped on a configuration error.
    Stopped,
}

struct ActiveStream {
    response: Response,
    decoder: FrameDecoder,
}

enum ReaderState {
    Connecting,
    Streaming(ActiveStream),
    Backoff(StreamReaderError),
}

impl ReaderState {
    fn phase(&self) -> ReaderPhase {
        match self {
            Self::Connecting => ReaderPhase::Connecting,
            Self::Streaming(_) => ReaderPhase::Streaming,
            Self::Backoff(_) => ReaderPhase::Backoff,
        }
    }
}

/// Long-lived consumer of one subscription.
///
/// Owns at most one open response and one frame buffer at a time. Messages
/// are handed to the sink one by one in stream order; the resume cursor is
/// written only after the sink acknowledged a message.
pub struct StreamReader<P, S> {
    provider: Arc<P>,
    sink: Arc<S>,
    http: Client,
    options: StreamReaderOptions,
    keepalive_hook: KeepAliveHook,
    keepalive: Option<KeepAlive>,
    state: ReaderState,
    failures: u64,
    watermark: Option<u64>,
    phase_tx: watch::Sender<ReaderPhase>,
}

impl<P, S> StreamReader<P, S>
where
    P: SettingsProvider,
    S: MessageSink,
{
    /// Creates a reader with default options.
    pub fn new(provider: Arc<P>, sink: Arc<S>) -> Result<Self, StreamReaderError> {
        Self::with_options(provider, sink, StreamReaderOptions::default())
    }

    pub fn with_options(
        provider: Arc<P>,
        sink: Arc<S>,
        options: StreamReaderOptions,
    ) -> Result<Self, StreamReaderError> {
        let mut builder = Client::builder().connect_timeout(options.connect_timeout);
        if !options.use_system_proxy {
            builder = builder.no_proxy();
        }
        let http = builder.build()?;
        let (phase_tx, _) = watch::channel(ReaderPhase::Connecting);

        Ok(Self {
            provider,
            sink,
            http,
            options,
            keepalive_hook: trace_hook(),
            keepalive: None,
            state: ReaderState::Connecting,
            failures: 0,
            watermark: None,
            phase_tx,
        })
    }

    /// Replaces the callback fired on every keepalive tick.
    pub fn with_keepalive_hook(mut self, hook: KeepAliveHook) -> Self {
        self.keepalive_hook = hook;
        self
    }

    pub fn phase(&self) -> ReaderPhase {
        *self.phase_tx.borrow()
    }

    /// Receiver that observes every phase transition.
    pub fn subscribe_phase(&self) -> watch::Receiver<ReaderPhase> {
        self.phase_tx.subscribe()
    }

    /// Highest cursor this reader has read or committed.
    pub fn watermark(&self) -> Option<u64> {
        self.watermark
    }

    /// Runs until configuration is missing.
    pub async fn run(mut self) -> Result<Infallible, StreamReaderError> {
        loop {
            self.step().await?;
        }
    }

    /// Moves the reader to a dedicated task.
    pub fn spawn(self) -> ReaderHandle
    where
        P: 'static,
        S: 'static,
    {
        let phase = self.subscribe_phase();
        let task = tokio::spawn(self.run());
        ReaderHandle { task, phase }
    }

    /// Performs exactly one state transition and returns the new phase.
    ///
    /// Only a configuration error is returned as `Err`; it also stops the
    /// keepalive and moves the reader to [`ReaderPhase::Stopped`].
    pub async fn step(&mut self) -> Result<ReaderPhase, StreamReaderError> {
        let state = std::mem::replace(&mut self.state, ReaderState::Connecting);

        let next = match state {
            ReaderState::Connecting => {
                self.arm_keepalive();
                match self.connect().await {
                    Ok(active) => {
                        self.failures = 0;
                        ReaderState::Streaming(active)
                    }
                    Err(StreamReaderError::Configuration(err)) => {
                        warn!(event = "stream_not_configured", error = %err);
                        self.keepalive = None;
                        self.phase_tx.send_replace(ReaderPhase::Stopped);
                        return Err(StreamReaderError::Configuration(err));
                    }
                    Err(err) => self.fail(err),
                }
            }
            ReaderState::Streaming(mut active) => match self.read_chunk(&mut active).await {
                Ok(()) => ReaderState::Streaming(active),
                // Dropping `active` releases the connection.
                Err(err) => self.fail(err),
            },
            ReaderState::Backoff(err) => {
                debug!(event = "stream_backoff", reason = %err);
                backoff(&self.options.reconnect, self.failures).await;
                ReaderState::Connecting
            }
        };

        let phase = next.phase();
        self.state = next;
        self.phase_tx.send_replace(phase);
        Ok(phase)
    }

    fn fail(&mut self, err: StreamReaderError) -> ReaderState {
        self.failures = self.failures.saturating_add(1);
        warn!(
            event = "stream_attempt_failed",
            failures = self.failures,
            retryable = err.is_retryable(),
            error = %err
        );
        ReaderState::Backoff(err)
    }

    fn arm_keepalive(&mut self) {
        if self.keepalive.is_some() {
            return;
        }
        if let Some(period) = self.options.keepalive_interval {
            self.keepalive = Some(KeepAlive::start(period, Arc::clone(&self.keepalive_hook)));
        }
    }

    async fn connect(&mut self) -> Result<ActiveStream, StreamReaderError> {
        let config = self.provider.settings().await?.connection_config()?;
        let stored = self.provider.cursor().await?;
        let since = match (stored, self.watermark) {
            (Some(stored), Some(seen)) => Some(stored.max(seen)),
            (stored, seen) => stored.or(seen),
        };
        self.watermark = since;

        let url = config.subscription_url(since);
        info!(event = "stream_connecting", url = %url);

        let mut request = self
            .http
            .get(&url)
            .header(ACCEPT, HeaderValue::from_static("application/json"));
        if let Some(value) = config.auth().header_value() {
            let mut header = HeaderValue::from_str(&value)?;
            header.set_sensitive(true);
            request = request.header(AUTHORIZATION, header);
        }

        // connect_timeout only covers the handshake; a server that accepts and
        // never answers is caught here.
        let idle_timeout = self.options.idle_timeout;
        let response = with_timeout(idle_timeout, request.send())
            .await
            .map_err(|_| StreamReaderError::ReadTimeout(idle_timeout))??;
        let status = response.status();
        if !status.is_success() {
            let body = with_timeout(self.options.idle_timeout, response.text())
                .await
                .ok()
                .and_then(Result::ok)
                .unwrap_or_default();
            return Err(StreamReaderError::HttpStatus {
                status,
                body: summarize_error_body(&body),
            });
        }

        info!(event = "stream_connected", status = status.as_u16());
        Ok(ActiveStream {
            response,
            decoder: FrameDecoder::new(),
        })
    }

    async fn read_chunk(&mut self, active: &mut ActiveStream) -> Result<(), StreamReaderError> {
        let idle_timeout = self.options.idle_timeout;
        let chunk = with_timeout(idle_timeout, active.response.chunk())
            .await
            .map_err(|_| StreamReaderError::ReadTimeout(idle_timeout))??;
        let Some(chunk) = chunk else {
            return Err(StreamReaderError::StreamEnded);
        };

        trace!(event = "stream_chunk", bytes = chunk.len());
        for frame in active.decoder.push(&chunk)? {
            self.dispatch_frame(&frame).await;
        }
        Ok(())
    }

    async fn dispatch_frame(&mut self, frame: &str) {
        let message = match decode_frame(frame) {
            None => {
                trace!(event = "frame_ignored", bytes = frame.len());
                return;
            }
            Some(Err(err)) => {
                warn!(event = "frame_decode_failed", error = %err);
                return;
            }
            Some(Ok(message)) => message,
        };

        if let Err(err) = self.sink.handle(&message).await {
            warn!(
                event = "sink_rejected",
                topic = %message.topic,
                time = message.time,
                error = %err
            );
            return;
        }

        self.commit_cursor(message.next_cursor()).await;
    }

    async fn commit_cursor(&mut self, candidate: u64) {
        if self.watermark.is_some_and(|current| current >= candidate) {
            return;
        }
        self.watermark = Some(candidate);
        if let Err(err) = self.provider.set_cursor(candidate).await {
            warn!(event = "cursor_write_failed", cursor = candidate, error = %err);
        }
    }
}

/// Owner of a spawned reader task. Dropping the handle aborts the reader.
#[derive(Debug)]
pub struct ReaderHandle {
    task: JoinHandle<Result<Infallible, StreamReaderError>>,
    phase: watch::Receiver<ReaderPhase>,
}

impl ReaderHandle {
    pub fn phase(&self) -> ReaderPhase {
        *self.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<ReaderPhase> {
        self.phase.clone()
    }

    /// Waits for the reader to stop.
    ///
    /// Returns the configuration error that stopped it, or `None` if the task
    /// was aborted or panicked.
    pub async fn wait(mut self) -> Option<StreamReaderError> {
        match (&mut self.task).await {
            Ok(Err(err)) => Some(err),
            Ok(Ok(never)) => match never {},
            Err(_) => None,
        }
    }

    /// Aborts the reader, dropping any open connection.
    pub fn shutdown(self) {
        self.task.abort();
    }
}

impl Drop for ReaderHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.error.or(parsed.message) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::{
        summarize_error_body, ReaderPhase, StreamReader, StreamReaderError, StreamReaderOptions,
    };
    use crate::settings::{
        ConfigurationError, MemorySettingsProvider, Settings, SettingsError, SettingsProvider,
    };
    use crate::sink::{MessageSink, SinkError};
    use crate::stream::proto::NotificationMessage;

    #[derive(Default)]
    struct RecordingSink {
        seen: Mutex<Vec<NotificationMessage>>,
        reject_topic: Option<String>,
    }

    #[async_trait]
    impl MessageSink for RecordingSink {
        async fn handle(&self, message: &NotificationMessage) -> Result<(), SinkError> {
            if self.reject_topic.as_deref() == Some(message.topic.as_str()) {
                return Err(SinkError::Rejected("blocked topic".to_string()));
            }
            self.seen.lock().expect("seen").push(message.clone());
            Ok(())
        }
    }

    /// Provider whose settings reads are counted and cursor writes fail.
    struct FlakyCursorProvider {
        inner: MemorySettingsProvider,
        settings_reads: AtomicUsize,
    }

    #[async_trait]
    impl SettingsProvider for FlakyCursorProvider {
        async fn settings(&self) -> Result<Settings, SettingsError> {
            self.settings_reads.fetch_add(1, Ordering::SeqCst);
            self.inner.settings().await
        }

        async fn cursor(&self) -> Result<Option<u64>, SettingsError> {
            self.inner.cursor().await
        }

        async fn set_cursor(&self, _cursor: u64) -> Result<(), SettingsError> {
            Err(SettingsError::Unavailable("read-only store".to_string()))
        }
    }

    fn test_options() -> StreamReaderOptions {
        StreamReaderOptions {
            keepalive_interval: None,
            use_system_proxy: false,
            ..StreamReaderOptions::default()
        }
    }

    fn configured() -> Settings {
        Settings {
            url: "http://127.0.0.1:9".to_string(),
            topics: "t1".to_string(),
            ..Settings::default()
        }
    }

    fn frame(topic: &str, time: u64) -> String {
        format!(
            "data: {{\"event\":\"message\",\"topic\":\"{topic}\",\"message\":\"m\",\"time\":{time}}}"
        )
    }

    #[tokio::test]
    async fn missing_configuration_stops_without_connecting() {
        let provider = Arc::new(MemorySettingsProvider::new(Settings::default()));
        let sink = Arc::new(RecordingSink::default());
        let mut reader =
            StreamReader::with_options(provider, sink, test_options()).expect("reader");

        let error = reader.step().await.expect_err("configuration error");
        assert!(matches!(
            error,
            StreamReaderError::Configuration(ConfigurationError::MissingUrl)
        ));
        assert!(!error.is_retryable());
        assert_eq!(reader.phase(), ReaderPhase::Stopped);
    }

    #[tokio::test]
    async fn refused_connection_moves_to_backoff() {
        let provider = Arc::new(MemorySettingsProvider::new(configured()));
        let sink = Arc::new(RecordingSink::default());
        let mut reader =
            StreamReader::with_options(provider, sink, test_options()).expect("reader");

        let phase = reader.step().await.expect("retryable failure");
        assert_eq!(phase, ReaderPhase::Backoff);
    }

    #[tokio::test]
    async fn acknowledged_frames_advance_cursor_monotonically() {
        let provider = Arc::new(MemorySettingsProvider::new(configured()));
        let sink = Arc::new(RecordingSink::default());
        let mut reader = StreamReader::with_options(
            Arc::clone(&provider),
            Arc::clone(&sink),
            test_options(),
        )
        .expect("reader");

        reader.dispatch_frame(&frame("t1", 100)).await;
        reader.dispatch_frame(&frame("t1", 101)).await;
        reader.dispatch_frame(&frame("t1", 50)).await;

        assert_eq!(sink.seen.lock().expect("seen").len(), 3);
        assert_eq!(provider.current_cursor(), Some(102));
        assert_eq!(reader.watermark(), Some(102));
    }

    #[tokio::test]
    async fn ignored_and_malformed_frames_touch_nothing() {
        let provider = Arc::new(MemorySettingsProvider::new(configured()));
        let sink = Arc::new(RecordingSink::default());
        let mut reader = StreamReader::with_options(
            Arc::clone(&provider),
            Arc::clone(&sink),
            test_options(),
        )
        .expect("reader");

        reader.dispatch_frame("event: keepalive").await;
        reader.dispatch_frame("data: {broken").await;

        assert!(sink.seen.lock().expect("seen").is_empty());
        assert_eq!(provider.current_cursor(), None);
    }

    #[tokio::test]
    async fn rejected_messages_do_not_advance_cursor() {
        let provider = Arc::new(MemorySettingsProvider::new(configured()));
        let sink = Arc::new(RecordingSink {
            reject_topic: Some("blocked".to_string()),
            ..RecordingSink::default()
        });
        let mut reader = StreamReader::with_options(
            Arc::clone(&provider),
            Arc::clone(&sink),
            test_options(),
        )
        .expect("reader");

        reader.dispatch_frame(&frame("blocked", 100)).await;
        assert_eq!(provider.current_cursor(), None);

        reader.dispatch_frame(&frame("t1", 101)).await;
        assert_eq!(provider.current_cursor(), Some(102));
    }

    #[tokio::test]
    async fn failed_cursor_write_keeps_in_memory_watermark() {
        let provider = Arc::new(FlakyCursorProvider {
            inner: MemorySettingsProvider::new(configured()).with_cursor(10),
            settings_reads: AtomicUsize::new(0),
        });
        let sink = Arc::new(RecordingSink::default());
        let mut reader = StreamReader::with_options(
            Arc::clone(&provider),
            Arc::clone(&sink),
            test_options(),
        )
        .expect("reader");

        reader.dispatch_frame(&frame("t1", 200)).await;
        assert_eq!(reader.watermark(), Some(201));

        // The next attempt resumes from the watermark, not the stale store.
        let _ = reader.step().await;
        assert_eq!(provider.settings_reads.load(Ordering::SeqCst), 1);
        assert_eq!(reader.watermark(), Some(201));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_waits_the_reconnect_delay() {
        let provider = Arc::new(MemorySettingsProvider::new(configured()));
        let sink = Arc::new(RecordingSink::default());
        let mut reader =
            StreamReader::with_options(provider, sink, test_options()).expect("reader");

        assert_eq!(reader.step().await.expect("connect"), ReaderPhase::Backoff);
        let started = tokio::time::Instant::now();
        assert_eq!(reader.step().await.expect("backoff"), ReaderPhase::Connecting);
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[test]
    fn error_body_summary_prefers_json_error_field() {
        assert_eq!(
            summarize_error_body(r#"{"code":40101,"http":401,"error":"unauthorized"}"#),
            "unauthorized"
        );
        assert_eq!(summarize_error_body("plain"), "plain");
        assert_eq!(summarize_error_body(&"x".repeat(500)).len(), 220);
    }
}
