use crate::error::SessionError;
use bitseek_core::{
    contains_stop_marker, partial_stop_marker_len, InboundFrame, ResponseCleaner,
};
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type ExchangeOutcome = Result<String, SessionError>;

/// Receives cleaned increments of a streamed response, in arrival order.
pub trait StreamSink: Send {
    fn on_chunk(&mut self, chunk: &str);
}

impl<F> StreamSink for F
where
    F: FnMut(&str) + Send,
{
    fn on_chunk(&mut self, chunk: &str) {
        self(chunk)
    }
}

pub struct PendingExchange {
    id: Uuid,
    started_at: Instant,
    raw: String,
    carry: String,
    text: String,
    text_chars: usize,
    sink: Option<Box<dyn StreamSink>>,
    done: Option<oneshot::Sender<ExchangeOutcome>>,
}

impl PendingExchange {
    fn new(sink: Option<Box<dyn StreamSink>>, done: oneshot::Sender<ExchangeOutcome>) -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Instant::now(),
            raw: String::new(),
            carry: String::new(),
            text: String::new(),
            text_chars: 0,
            sink,
            done: Some(done),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    fn push_increment(&mut self, increment: &str, verbose: bool) {
        if increment.is_empty() {
            return;
        }
        self.text.push_str(increment);
        self.text_chars += increment.chars().count();
        if verbose {
            debug!(
                event = "exchange_chunk",
                exchange_id = %self.id,
                chars = self.text_chars
            );
        }
        if let Some(sink) = self.sink.as_mut() {
            sink.on_chunk(increment);
        }
    }

    fn complete(mut self, outcome: ExchangeOutcome) {
        if let Some(done) = self.done.take() {
            // Receiver is gone when the waiter already timed out.
            let _ = done.send(outcome);
        }
    }
}

/// Leftovers of abandoned exchanges whose request already reached the server.
/// Their frames precede those of any later exchange on the same socket.
#[derive(Debug, Default)]
struct Drain {
    streams: u32,
    dropped_chars: usize,
    tail: String,
}

impl Drain {
    fn end_stream(&mut self) {
        self.streams = self.streams.saturating_sub(1);
        self.dropped_chars = 0;
        self.tail.clear();
    }
}

pub struct Accumulator {
    cleaner: ResponseCleaner,
    stop_markers: Vec<String>,
    max_chars: usize,
    verbose: bool,
    pending: Option<PendingExchange>,
    drain: Drain,
}

impl Accumulator {
    pub fn new(
        cleaner: ResponseCleaner,
        stop_markers: Vec<String>,
        max_chars: usize,
        verbose: bool,
    ) -> Self {
        Self {
            cleaner,
            stop_markers,
            max_chars,
            verbose,
            pending: None,
            drain: Drain::default(),
        }
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn pending_id(&self) -> Option<Uuid> {
        self.pending.as_ref().map(PendingExchange::id)
    }

    /// Number of abandoned streams still expected on the current link.
    pub fn draining(&self) -> u32 {
        self.drain.streams
    }

    /// Registers a new exchange; rejected while another one is active.
    pub fn begin(
        &mut self,
        sink: Option<Box<dyn StreamSink>>,
    ) -> Result<(Uuid, oneshot::Receiver<ExchangeOutcome>), SessionError> {
        if self.pending.is_some() {
            return Err(SessionError::Concurrency);
        }
        let (tx, rx) = oneshot::channel();
        let exchange = PendingExchange::new(sink, tx);
        let id = exchange.id;
        self.pending = Some(exchange);
        Ok((id, rx))
    }

    /// Drops the exchange `id` if it is still registered. When its request was
    /// already written, the rest of its stream is discarded as it arrives.
    pub fn abandon(&mut self, id: Uuid, written: bool) -> bool {
        if self.pending_id() != Some(id) {
            return false;
        }
        if let Some(exchange) = self.pending.take() {
            if written {
                self.drain.streams += 1;
            }
            debug!(
                event = "exchange_abandoned",
                exchange_id = %exchange.id,
                elapsed_ms = exchange.started_at.elapsed().as_millis() as u64,
                partial_chars = exchange.text_chars,
                draining = self.drain.streams
            );
        }
        true
    }

    /// Forgets abandoned streams; called whenever the underlying link changes.
    pub fn reset_stream(&mut self) {
        if self.drain.streams > 0 {
            debug!(event = "drain_reset", streams = self.drain.streams);
        }
        self.drain = Drain::default();
    }

    pub fn fail_pending(&mut self, err: SessionError) -> bool {
        match self.pending.take() {
            Some(exchange) => {
                warn!(event = "exchange_failed", exchange_id = %exchange.id, error = %err);
                exchange.complete(Err(err));
                true
            }
            None => false,
        }
    }

    pub fn handle(&mut self, frame: InboundFrame) {
        if self.verbose {
            debug!(event = "frame_received", frame_kind = frame.kind_name());
        }
        if self.drain.streams > 0 && self.drain_frame(&frame) {
            return;
        }
        match frame {
            InboundFrame::Chunk { text, stop } => self.on_chunk(&text, stop),
            InboundFrame::Error { message } => {
                if !self.fail_pending(SessionError::Server(message.clone())) {
                    warn!(event = "server_error_unsolicited", message = %message);
                }
            }
            InboundFrame::HeartbeatAck => debug!(event = "heartbeat_ack"),
            InboundFrame::Ack => debug!(event = "server_ack"),
            InboundFrame::Other { kind } => {
                let has_content = self
                    .pending
                    .as_ref()
                    .map(|exchange| !exchange.text.is_empty())
                    .unwrap_or(false);
                if has_content {
                    debug!(event = "exchange_implicit_complete", frame_type = ?kind);
                    self.finish();
                } else {
                    debug!(event = "frame_ignored", frame_type = ?kind);
                }
            }
        }
    }

    /// Consumes frames that belong to an abandoned stream. Returns false for
    /// frames that carry no exchange content.
    fn drain_frame(&mut self, frame: &InboundFrame) -> bool {
        let ended = match frame {
            InboundFrame::Chunk { text, stop } => {
                let mut window = std::mem::take(&mut self.drain.tail);
                window.push_str(text);
                self.drain.dropped_chars += text.chars().count();
                let ended = *stop
                    || contains_stop_marker(&window, &self.stop_markers)
                    || self.drain.dropped_chars > self.max_chars;
                if !ended {
                    let keep = partial_stop_marker_len(&window, &self.stop_markers);
                    self.drain.tail = window.split_off(window.len() - keep);
                }
                debug!(event = "stale_frame_dropped", bytes = text.len());
                ended
            }
            InboundFrame::Error { message } => {
                debug!(event = "stale_error_dropped", message = %message);
                true
            }
            InboundFrame::Other { .. } => true,
            InboundFrame::HeartbeatAck | InboundFrame::Ack => return false,
        };
        if ended {
            self.drain.end_stream();
            debug!(event = "drain_stream_ended", remaining = self.drain.streams);
        }
        true
    }

    fn on_chunk(&mut self, raw: &str, stop_flag: bool) {
        let Some(exchange) = self.pending.as_mut() else {
            debug!(event = "frame_without_exchange", bytes = raw.len());
            return;
        };
        exchange.raw.push_str(raw);
        let mut window = std::mem::take(&mut exchange.carry);
        window.push_str(raw);
        let marker_seen = contains_stop_marker(&window, &self.stop_markers);
        if !marker_seen && !stop_flag {
            let keep = partial_stop_marker_len(&window, &self.stop_markers);
            exchange.carry = window.split_off(window.len() - keep);
        }
        let increment = self.cleaner.clean(&window);
        exchange.push_increment(&increment, self.verbose);
        let stop = stop_flag || marker_seen || exchange.text_chars > self.max_chars;
        if stop {
            self.finish();
        }
    }

    fn finish(&mut self) {
        if let Some(mut exchange) = self.pending.take() {
            let carry = std::mem::take(&mut exchange.carry);
            let increment = self.cleaner.clean(&carry);
            exchange.push_increment(&increment, self.verbose);
            let text = std::mem::take(&mut exchange.text);
            info!(
                event = "exchange_complete",
                exchange_id = %exchange.id,
                elapsed_ms = exchange.started_at.elapsed().as_millis() as u64,
                chars = exchange.text_chars,
                raw_bytes = exchange.raw.len()
            );
            exchange.complete(Ok(text));
        }
    }
}
