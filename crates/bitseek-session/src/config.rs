use bitseek_core::{
    GenerationParams, DEFAULT_MAX_FRAME_BYTES, DEFAULT_MODEL, DEFAULT_SESSION_MAX_LENGTH,
    DEFAULT_STOP_MARKERS,
};
use std::time::Duration;

pub const DEFAULT_URL: &str = "wss://chat.bitseek.ai/api/v2/generate";
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_MESSAGE_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_RESPONSE_CHARS: usize = 15_000;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub url: String,
    pub model: String,
    pub session_max_length: u32,
    pub generation: GenerationParams,
    pub stop_markers: Vec<String>,
    pub max_response_chars: usize,
    pub max_frame_bytes: usize,
    pub heartbeat_interval: Duration,
    pub message_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_reconnect_attempts: u32,
    pub reconnect_interval: Duration,
    /// Emit a debug event per streamed chunk.
    pub verbose: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            session_max_length: DEFAULT_SESSION_MAX_LENGTH,
            generation: GenerationParams::default(),
            stop_markers: DEFAULT_STOP_MARKERS.iter().map(|m| m.to_string()).collect(),
            max_response_chars: DEFAULT_MAX_RESPONSE_CHARS,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            message_timeout: DEFAULT_MESSAGE_TIMEOUT,
            connect_timeout: Duration::from_secs(15),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            verbose: false,
        }
    }
}

impl SessionConfig {
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}
