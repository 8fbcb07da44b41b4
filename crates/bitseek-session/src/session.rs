use crate::accumulator::{Accumulator, StreamSink};
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::reconnect::{ReconnectDecision, ReconnectPolicy, NO_STATUS_CLOSE_CODE};
use bitseek_core::{decode_frame, encode_frame, OutboundFrame, ResponseCleaner};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const OUTBOUND_QUEUE: usize = 64;
const CLOSE_GRACE: Duration = Duration::from_secs(2);
/// Abandoned streams tolerated on one link before it is replaced.
const MAX_DRAINING_STREAMS: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
    pub pending_exchange: bool,
    pub heartbeat_interval_ms: u64,
    pub message_timeout_ms: u64,
}

/// One logical client of the generation service.
///
/// At most one live connection and one in-flight exchange exist per session.
/// Clones share the same connection.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

struct Shared {
    config: StdMutex<SessionConfig>,
    state: watch::Sender<ConnectionState>,
    link: AsyncMutex<Option<Link>>,
    exchange: StdMutex<Accumulator>,
    reconnect: StdMutex<ReconnectPolicy>,
    reconnect_task: StdMutex<Option<JoinHandle<()>>>,
    generation: AtomicU64,
    connect_seq: AtomicU64,
    last_connect_error: StdMutex<Option<SessionError>>,
}

struct Link {
    generation: u64,
    outbound: mpsc::Sender<Message>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
}

impl Link {
    fn is_alive(&self) -> bool {
        !self.outbound.is_closed() && !self.reader.is_finished()
    }

    fn stop_background(&self) {
        self.heartbeat.abort();
        self.writer.abort();
    }

    fn abort(&self) {
        self.stop_background();
        self.reader.abort();
    }

    async fn close_gracefully(mut self) {
        self.heartbeat.abort();
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        };
        let queued = self.outbound.send(Message::Close(Some(frame))).await.is_ok();
        if queued && tokio::time::timeout(CLOSE_GRACE, &mut self.writer).await.is_err() {
            debug!(event = "session_close_grace_elapsed");
        }
        self.abort();
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        Self::with_cleaner(config, ResponseCleaner::default())
    }

    pub fn with_cleaner(config: SessionConfig, cleaner: ResponseCleaner) -> Self {
        let accumulator = Accumulator::new(
            cleaner,
            config.stop_markers.clone(),
            config.max_response_chars,
            config.verbose,
        );
        let reconnect =
            ReconnectPolicy::new(config.max_reconnect_attempts, config.reconnect_interval);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                config: StdMutex::new(config),
                state,
                link: AsyncMutex::new(None),
                exchange: StdMutex::new(accumulator),
                reconnect: StdMutex::new(reconnect),
                reconnect_task: StdMutex::new(None),
                generation: AtomicU64::new(0),
                connect_seq: AtomicU64::new(0),
                last_connect_error: StdMutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn has_pending_exchange(&self) -> bool {
        lock(&self.shared.exchange).is_pending()
    }

    pub fn status(&self) -> SessionStatus {
        let (heartbeat, timeout) = {
            let config = lock(&self.shared.config);
            (config.heartbeat_interval, config.message_timeout)
        };
        SessionStatus {
            state: self.state(),
            reconnect_attempts: lock(&self.shared.reconnect).attempts(),
            pending_exchange: self.has_pending_exchange(),
            heartbeat_interval_ms: heartbeat.as_millis() as u64,
            message_timeout_ms: timeout.as_millis() as u64,
        }
    }

    pub fn set_verbose(&self, verbose: bool) {
        lock(&self.shared.config).verbose = verbose;
        lock(&self.shared.exchange).set_verbose(verbose);
    }

    pub fn set_message_timeout(&self, timeout: Duration) {
        lock(&self.shared.config).message_timeout = timeout;
    }

    /// Applies a new heartbeat interval, restarting the emitter of a live link.
    pub async fn set_heartbeat_interval(&self, interval: Duration) {
        lock(&self.shared.config).heartbeat_interval = interval;
        let mut slot = self.shared.link.lock().await;
        if let Some(link) = slot.as_mut() {
            link.heartbeat.abort();
            link.heartbeat = spawn_heartbeat(link.outbound.clone(), interval);
            info!(
                event = "heartbeat_restarted",
                interval_ms = interval.as_millis() as u64
            );
        }
    }

    /// Connects unless already connected. Resets the reconnect counter, so a
    /// session marked failed becomes usable again.
    pub async fn ensure_connected(&self) -> Result<(), SessionError> {
        self.shared.cancel_reconnect();
        lock(&self.shared.reconnect).on_connected();
        self.shared.connect().await
    }

    pub async fn send(
        &self,
        message: &str,
        sink: Option<Box<dyn StreamSink>>,
    ) -> Result<String, SessionError> {
        self.send_cancellable(message, sink, &CancellationToken::new())
            .await
    }

    /// Sends one generate request and waits for its completed response.
    ///
    /// Timeout and cancellation abandon the wait; the connection stays up and
    /// the rest of the abandoned stream is discarded as it arrives.
    pub async fn send_cancellable(
        &self,
        message: &str,
        sink: Option<Box<dyn StreamSink>>,
        cancel: &CancellationToken,
    ) -> Result<String, SessionError> {
        if self.state() == ConnectionState::Failed {
            return Err(SessionError::ReconnectExhausted {
                attempts: lock(&self.shared.reconnect).attempts(),
            });
        }
        self.shared.connect().await?;

        let (frame, timeout) = {
            let config = lock(&self.shared.config);
            (
                config.generation.frame(message, &config.stop_markers),
                config.message_timeout,
            )
        };
        let payload = encode_frame(&frame)?;
        let (id, done) = lock(&self.shared.exchange).begin(sink)?;
        debug!(event = "exchange_start", exchange_id = %id, input_chars = message.chars().count());

        if let Err(err) = self.shared.write(Message::Text(payload)).await {
            lock(&self.shared.exchange).abandon(id, false);
            return Err(err);
        }

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(SessionError::Aborted),
            waited = tokio::time::timeout(timeout, done) => match waited {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => Err(SessionError::Connectivity("exchange dropped".to_string())),
                Err(_) => Err(SessionError::Timeout(timeout)),
            },
        };
        if let Err(err) = &outcome {
            let draining = {
                let mut exchange = lock(&self.shared.exchange);
                exchange.abandon(id, true).then(|| exchange.draining())
            };
            if let Some(draining) = draining {
                warn!(event = "exchange_abandoned", exchange_id = %id, error = %err);
                if draining > MAX_DRAINING_STREAMS {
                    self.shared.recycle_link().await;
                }
            }
        }
        outcome
    }

    /// Closes the connection with a normal close frame and cancels any
    /// scheduled reconnect. A pending exchange fails with a connectivity error.
    pub async fn close(&self) {
        let shared = &self.shared;
        shared.cancel_reconnect();
        shared.generation.fetch_add(1, Ordering::SeqCst);
        let link = shared.link.lock().await.take();
        let was_open = link.is_some();
        if let Some(link) = link {
            link.close_gracefully().await;
        }
        {
            let mut exchange = lock(&shared.exchange);
            exchange.fail_pending(SessionError::Connectivity("session closed".to_string()));
            exchange.reset_stream();
        }
        lock(&shared.reconnect).on_connected();
        shared.set_state(ConnectionState::Disconnected);
        if was_open {
            info!(event = "session_close");
        }
    }
}

impl Shared {
    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(event = "session_state", from = %previous, to = %next);
        }
    }

    fn cancel_reconnect(&self) {
        if let Some(task) = lock(&self.reconnect_task).take() {
            task.abort();
        }
    }

    async fn write(&self, message: Message) -> Result<(), SessionError> {
        let outbound = {
            let slot = self.link.lock().await;
            slot.as_ref().map(|link| link.outbound.clone())
        };
        let Some(outbound) = outbound else {
            return Err(SessionError::Connectivity("not connected".to_string()));
        };
        outbound
            .send(message)
            .await
            .map_err(|_| SessionError::Connectivity("connection closed".to_string()))
    }

    /// Single connect path. Callers that queued behind a failed attempt get
    /// that attempt's error instead of starting another one.
    async fn connect(self: &Arc<Self>) -> Result<(), SessionError> {
        let observed = self.connect_seq.load(Ordering::SeqCst);
        let mut slot = self.link.lock().await;
        if slot.as_ref().map(Link::is_alive).unwrap_or(false) {
            return Ok(());
        }
        if self.connect_seq.load(Ordering::SeqCst) != observed {
            if let Some(err) = lock(&self.last_connect_error).clone() {
                return Err(err);
            }
        }
        if let Some(stale) = slot.take() {
            stale.abort();
            lock(&self.exchange)
                .fail_pending(SessionError::Connectivity("connection lost".to_string()));
        }
        lock(&self.exchange).reset_stream();

        self.set_state(ConnectionState::Connecting);
        let result = self.open_link().await;
        self.connect_seq.fetch_add(1, Ordering::SeqCst);
        match result {
            Ok(link) => {
                *slot = Some(link);
                *lock(&self.last_connect_error) = None;
                lock(&self.reconnect).on_connected();
                self.set_state(ConnectionState::Connected);
                info!(event = "session_connect");
                Ok(())
            }
            Err(err) => {
                *lock(&self.last_connect_error) = Some(err.clone());
                self.set_state(ConnectionState::Disconnected);
                warn!(event = "session_connect_error", error = %err);
                Err(err)
            }
        }
    }

    async fn open_link(self: &Arc<Self>) -> Result<Link, SessionError> {
        let config = lock(&self.config).clone();
        let url =
            Url::parse(&config.url).map_err(|err| SessionError::InvalidUrl(err.to_string()))?;
        let (ws, _) = tokio::time::timeout(config.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| {
                SessionError::Connectivity(format!(
                    "connect timed out after {}s",
                    config.connect_timeout.as_secs_f64()
                ))
            })?
            .map_err(|err| SessionError::Connectivity(err.to_string()))?;
        let (mut sink, stream) = ws.split();

        let init = encode_frame(&OutboundFrame::open_session(
            config.model.clone(),
            config.session_max_length,
        ))?;
        sink.send(Message::Text(init))
            .await
            .map_err(|err| SessionError::Connectivity(err.to_string()))?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let writer = tokio::spawn(write_loop(sink, outbound_rx));
        let reader = tokio::spawn(read_loop(
            Arc::downgrade(self),
            generation,
            stream,
            config.max_frame_bytes,
        ));
        let heartbeat = spawn_heartbeat(outbound.clone(), config.heartbeat_interval);
        Ok(Link {
            generation,
            outbound,
            writer,
            reader,
            heartbeat,
        })
    }

    /// Replaces a link whose inbound stream can no longer be attributed to
    /// exchanges. The next send opens a fresh one.
    async fn recycle_link(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let link = self.link.lock().await.take();
        if let Some(link) = link {
            link.close_gracefully().await;
        }
        lock(&self.exchange).reset_stream();
        self.set_state(ConnectionState::Disconnected);
        warn!(event = "session_link_recycled");
    }

    async fn on_link_closed(self: &Arc<Self>, generation: u64, code: Option<u16>) {
        {
            let mut slot = self.link.lock().await;
            if self.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            if slot.as_ref().map(|link| link.generation) == Some(generation) {
                if let Some(link) = slot.take() {
                    link.stop_background();
                }
            }
        }
        let reason = match code {
            Some(code) => format!("connection closed with code {code}"),
            None => "connection lost".to_string(),
        };
        warn!(event = "session_disconnected", close_code = ?code);
        lock(&self.exchange).fail_pending(SessionError::Connectivity(reason));
        self.set_state(ConnectionState::Disconnected);
        self.after_close(code);
    }

    fn after_close(self: &Arc<Self>, code: Option<u16>) {
        let decision = lock(&self.reconnect).on_close(code);
        match decision {
            ReconnectDecision::NotNeeded => {}
            ReconnectDecision::AlreadyScheduled => {
                debug!(event = "reconnect_already_scheduled");
            }
            ReconnectDecision::Schedule { attempt, delay } => {
                info!(
                    event = "reconnect_scheduled",
                    attempt,
                    delay_ms = delay.as_millis() as u64
                );
                self.spawn_reconnect(delay);
            }
            ReconnectDecision::Exhausted { attempts } => {
                warn!(event = "reconnect_exhausted", attempts);
                self.set_state(ConnectionState::Failed);
            }
        }
    }

    fn spawn_reconnect(self: &Arc<Self>, delay: Duration) {
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            lock(&shared.reconnect).on_attempt_started();
            if let Err(err) = shared.connect().await {
                warn!(event = "reconnect_failed", error = %err);
                shared.after_close(None);
            }
        });
        // The previous handle is finished or is the task running this call.
        *lock(&self.reconnect_task) = Some(task);
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(link) = self.link.get_mut().take() {
            link.abort();
        }
        if let Ok(task) = self.reconnect_task.get_mut() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

async fn write_loop(mut sink: SplitSink<WsStream, Message>, mut rx: mpsc::Receiver<Message>) {
    while let Some(message) = rx.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(err) = sink.send(message).await {
            warn!(event = "session_write_error", error = %err);
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(
    shared: Weak<Shared>,
    generation: u64,
    mut stream: SplitStream<WsStream>,
    max_frame_bytes: usize,
) {
    let mut close_code = None;
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let Some(strong) = shared.upgrade() else {
                    return;
                };
                match decode_frame(&text, max_frame_bytes) {
                    Ok(frame) => lock(&strong.exchange).handle(frame),
                    Err(err) => warn!(event = "frame_decode_error", error = %err),
                }
            }
            Ok(Message::Close(frame)) => {
                close_code = Some(
                    frame
                        .map(|frame| u16::from(frame.code))
                        .unwrap_or(NO_STATUS_CLOSE_CODE),
                );
                break;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(event = "session_read_error", error = %err);
                break;
            }
        }
    }
    if let Some(strong) = shared.upgrade() {
        strong.on_link_closed(generation, close_code).await;
    }
}

fn spawn_heartbeat(outbound: mpsc::Sender<Message>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        if interval.is_zero() {
            return;
        }
        let ping = match encode_frame(&OutboundFrame::Ping) {
            Ok(ping) => ping,
            Err(err) => {
                warn!(event = "heartbeat_encode_error", error = %err);
                return;
            }
        };
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if outbound.send(Message::Text(ping.clone())).await.is_err() {
                break;
            }
        }
    })
}
