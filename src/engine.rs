//! The "watch an ad" countdown.
//!
//! An engine runs at most one countdown at a time. Each second it publishes
//! the remaining time; when the countdown reaches zero it records exactly one
//! completed task on the ledger and goes back to [`Countdown::Idle`]. Signing
//! out or dropping the engine cancels a running countdown without credit.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::ledger::Ledger;
use crate::session::Session;
use crate::types::Task;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Countdown {
    Idle,
    Watching { remaining: u32 },
}

#[derive(Debug, Clone)]
pub enum TaskEvent {
    /// The reward was credited; views should reload tasks and stats.
    Completed(Task),
    /// The countdown finished but the ledger rejected the credit.
    Failed { user_id: Uuid, reason: String },
    /// The countdown was abandoned before it finished.
    Cancelled { user_id: Uuid },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("a task is already in progress")]
    AlreadyWatching,
    #[error("session is signed out")]
    SignedOut,
}

pub struct RewardTaskEngine {
    ledger: Arc<dyn Ledger>,
    duration_secs: u32,
    reward: Decimal,
    state: watch::Sender<Countdown>,
    events: broadcast::Sender<TaskEvent>,
    running: Mutex<Option<JoinHandle<()>>>,
}

impl RewardTaskEngine {
    pub fn new(ledger: Arc<dyn Ledger>, duration_secs: u32, reward: Decimal) -> Self {
        let (state, _) = watch::channel(Countdown::Idle);
        let (events, _) = broadcast::channel(16);
        Self {
            ledger,
            duration_secs: duration_secs.max(1),
            reward,
            state,
            events,
            running: Mutex::new(None),
        }
    }

    pub fn countdown(&self) -> Countdown {
        *self.state.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<Countdown> {
        self.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Starts a countdown for the session's user.
    pub fn start_task(&self, session: Session) -> Result<Countdown, EngineError> {
        if session.is_signed_out() {
            return Err(EngineError::SignedOut);
        }

        let duration = self.duration_secs;
        let started = self.state.send_if_modified(|state| match state {
            Countdown::Idle => {
                *state = Countdown::Watching {
                    remaining: duration,
                };
                true
            }
            Countdown::Watching { .. } => false,
        });
        if !started {
            return Err(EngineError::AlreadyWatching);
        }

        info!(user_id = %session.user_id(), duration, "countdown started");
        let handle = tokio::spawn(run_countdown(
            self.ledger.clone(),
            session,
            duration,
            self.reward,
            self.state.clone(),
            self.events.clone(),
        ));
        *self.running.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);

        Ok(self.countdown())
    }
}

impl Drop for RewardTaskEngine {
    fn drop(&mut self) {
        let running = self.running.get_mut().unwrap_or_else(|p| p.into_inner());
        if let Some(handle) = running.take() {
            handle.abort();
        }
    }
}

async fn run_countdown(
    ledger: Arc<dyn Ledger>,
    session: Session,
    duration: u32,
    reward: Decimal,
    state: watch::Sender<Countdown>,
    events: broadcast::Sender<TaskEvent>,
) {
    let user_id = session.user_id();
    let period = Duration::from_secs(1);
    let mut ticks = interval_at(Instant::now() + period, period);

    let mut remaining = duration;
    while remaining > 0 {
        tokio::select! {
            _ = ticks.tick() => {}
            _ = session.signed_out() => {
                warn!(%user_id, remaining, "countdown cancelled by sign-out");
                state.send_replace(Countdown::Idle);
                let _ = events.send(TaskEvent::Cancelled { user_id });
                return;
            }
        }
        remaining -= 1;
        state.send_replace(Countdown::Watching { remaining });
    }

    let outcome = ledger.complete_task(user_id, reward).await;
    state.send_replace(Countdown::Idle);

    // Nobody listening is fine; the ledger is the source of truth.
    let _ = match outcome {
        Ok(task) => {
            info!(%user_id, task_id = %task.id, %reward, "task completed");
            events.send(TaskEvent::Completed(task))
        }
        Err(e) => {
            error!(%user_id, "failed to complete task: {e}");
            events.send(TaskEvent::Failed {
                user_id,
                reason: "Failed to complete task".into(),
            })
        }
    };
}

/// One engine per user, created on first use.
pub struct EngineRegistry {
    ledger: Arc<dyn Ledger>,
    duration_secs: u32,
    reward: Decimal,
    engines: Mutex<HashMap<Uuid, Arc<RewardTaskEngine>>>,
}

impl EngineRegistry {
    pub fn new(ledger: Arc<dyn Ledger>, duration_secs: u32, reward: Decimal) -> Self {
        Self {
            ledger,
            duration_secs,
            reward,
            engines: Mutex::new(HashMap::new()),
        }
    }

    pub fn engine_for(&self, user_id: Uuid) -> Arc<RewardTaskEngine> {
        let mut engines = self.engines.lock().unwrap_or_else(|p| p.into_inner());
        engines
            .entry(user_id)
            .or_insert_with(|| {
                Arc::new(RewardTaskEngine::new(
                    self.ledger.clone(),
                    self.duration_secs,
                    self.reward,
                ))
            })
            .clone()
    }

    pub fn countdown(&self, user_id: Uuid) -> Countdown {
        let engines = self.engines.lock().unwrap_or_else(|p| p.into_inner());
        engines
            .get(&user_id)
            .map(|e| e.countdown())
            .unwrap_or(Countdown::Idle)
    }

    /// Forgets the user's engine, aborting its countdown if no one else
    /// holds it.
    pub fn remove(&self, user_id: Uuid) {
        let mut engines = self.engines.lock().unwrap_or_else(|p| p.into_inner());
        engines.remove(&user_id);
    }
}
