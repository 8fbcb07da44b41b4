use std::time::Duration;

pub const NORMAL_CLOSE_CODE: u16 = 1000;
/// Reported for a close frame without a status code.
pub const NO_STATUS_CLOSE_CODE: u16 = 1005;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    NotNeeded,
    AlreadyScheduled,
    Schedule { attempt: u32, delay: Duration },
    Exhausted { attempts: u32 },
}

/// Bounded, fixed-interval reconnect bookkeeping for one session.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    max_attempts: u32,
    interval: Duration,
    attempts: u32,
    scheduled: bool,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
            attempts: 0,
            scheduled: false,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduled
    }

    /// `code` is `None` when the link dropped without a close frame or a
    /// reconnect attempt failed; both count as abnormal. A close frame without
    /// a status is an orderly shutdown by the server.
    pub fn on_close(&mut self, code: Option<u16>) -> ReconnectDecision {
        if matches!(code, Some(NORMAL_CLOSE_CODE | NO_STATUS_CLOSE_CODE)) {
            return ReconnectDecision::NotNeeded;
        }
        if self.scheduled {
            return ReconnectDecision::AlreadyScheduled;
        }
        if self.attempts >= self.max_attempts {
            return ReconnectDecision::Exhausted {
                attempts: self.attempts,
            };
        }
        self.attempts += 1;
        self.scheduled = true;
        ReconnectDecision::Schedule {
            attempt: self.attempts,
            delay: self.interval,
        }
    }

    pub fn on_attempt_started(&mut self) {
        self.scheduled = false;
    }

    /// Clears the attempt counter after a successful open or an explicit
    /// connect or close by the caller.
    pub fn on_connected(&mut self) {
        self.attempts = 0;
        self.scheduled = false;
    }
}
