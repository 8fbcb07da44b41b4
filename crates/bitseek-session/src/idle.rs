use crate::error::SessionError;
use crate::session::Session;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(20 * 60);

#[derive(Debug, Clone, Copy)]
struct Activity {
    at: Instant,
    wall: DateTime<Utc>,
}

impl Activity {
    fn now() -> Self {
        Self {
            at: Instant::now(),
            wall: Utc::now(),
        }
    }
}

struct IdleState {
    activity: Mutex<Activity>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Hands out a connected session and closes it after a quiet period.
#[derive(Clone)]
pub struct IdleSupervisor {
    session: Session,
    idle_timeout: Duration,
    state: Arc<IdleState>,
}

impl IdleSupervisor {
    pub fn new(session: Session, idle_timeout: Duration) -> Self {
        Self {
            session,
            idle_timeout,
            state: Arc::new(IdleState {
                activity: Mutex::new(Activity::now()),
                timer: Mutex::new(None),
            }),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        lock(&self.state.activity).wall
    }

    /// Connects if needed, records activity, and arms the idle timer.
    pub async fn acquire(&self) -> Result<&Session, SessionError> {
        self.session.ensure_connected().await?;
        self.touch();
        self.arm();
        Ok(&self.session)
    }

    pub fn touch(&self) {
        *lock(&self.state.activity) = Activity::now();
    }

    pub async fn shutdown(&self) {
        if let Some(timer) = lock(&self.state.timer).take() {
            timer.abort();
        }
        self.session.close().await;
    }

    fn arm(&self) {
        let mut timer = lock(&self.state.timer);
        if timer.as_ref().map(|task| !task.is_finished()).unwrap_or(false) {
            return;
        }
        let session = self.session.clone();
        let state = self.state.clone();
        let idle_timeout = self.idle_timeout;
        *timer = Some(tokio::spawn(async move {
            loop {
                let deadline = lock(&state.activity).at + idle_timeout;
                tokio::time::sleep_until(deadline).await;
                let last = lock(&state.activity).at;
                if last.elapsed() < idle_timeout {
                    continue;
                }
                if session.has_pending_exchange() {
                    debug!(event = "idle_timer_rearmed");
                    *lock(&state.activity) = Activity::now();
                    continue;
                }
                info!(
                    event = "idle_disconnect",
                    idle_secs = idle_timeout.as_secs()
                );
                session.close().await;
                break;
            }
        }));
    }
}
