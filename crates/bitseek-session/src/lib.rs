pub mod accumulator;
pub mod config;
pub mod error;
pub mod idle;
pub mod reconnect;
pub mod retry;
pub mod session;

pub use accumulator::{Accumulator, ExchangeOutcome, StreamSink};
pub use config::SessionConfig;
pub use error::SessionError;
pub use idle::{IdleSupervisor, DEFAULT_IDLE_TIMEOUT};
pub use reconnect::{ReconnectDecision, ReconnectPolicy, NORMAL_CLOSE_CODE, NO_STATUS_CLOSE_CODE};
pub use retry::{retry, retry_if, Aborted, RetryPolicy};
pub use session::{ConnectionState, Session, SessionStatus};
pub use tokio_util::sync::CancellationToken;
