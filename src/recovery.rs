// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Audio engine recovery.
//!
//! Recovery only starts from an explicit failure report. The periodic health check
//! publishes what it sees and nothing more.

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, span, warn, Level};

use crate::cancel::{CancelHandle, LoopHandle};
use crate::clock::Clock;
use crate::engine::{AudioEngine, EngineSettings};
use crate::error::EngineFailure;

const RECOVERY_INSTRUCTIONS: &str = "The audio engine could not be restarted. Close other apps \
that may be using audio output, then restart the app.";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryPhase {
    Idle,
    Recovering,
    Success,
    Failed,
}

impl fmt::Display for RecoveryPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecoveryPhase::Idle => "idle",
            RecoveryPhase::Recovering => "recovering",
            RecoveryPhase::Success => "success",
            RecoveryPhase::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RecoveryState {
    pub phase: RecoveryPhase,
    pub attempt: u32,
    pub last_error: Option<String>,
    /// What the user should do next. Only set once recovery has given up.
    pub instructions: Option<String>,
}

impl Default for RecoveryState {
    fn default() -> Self {
        RecoveryState {
            phase: RecoveryPhase::Idle,
            attempt: 0,
            last_error: None,
            instructions: None,
        }
    }
}

/// Result of the most recent health checks.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct EngineHealth {
    pub consecutive_failures: u32,
    pub last_ok_micros: Option<i64>,
    pub last_error: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RecoverySettings {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_factor: f64,
    pub health_interval: Duration,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        RecoverySettings {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            health_interval: Duration::from_secs(5),
        }
    }
}

impl RecoverySettings {
    /// The wait before the given (1-based) attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        self.base_delay
            .mul_f64(self.backoff_factor.powi(exponent).min(1e6))
    }
}

/// Components holding state that depends on the engine.
pub trait RecoveryListener: Send + Sync {
    /// The engine has been shut down and has lost everything loaded into it.
    fn engine_lost(&self) {}

    /// The engine was successfully re-initialized.
    fn engine_recovered(&self);
}

type Sleeper = Box<dyn Fn(Duration) + Send + Sync>;

pub struct RecoveryCoordinator {
    settings: RecoverySettings,
    engine_settings: EngineSettings,
    engine: Arc<dyn AudioEngine>,
    clock: Arc<dyn Clock>,
    listeners: RwLock<Vec<Arc<dyn RecoveryListener>>>,
    sleeper: Sleeper,
    /// Held for the duration of a recovery so that only one runs at a time.
    recovering: Mutex<()>,
    state_tx: watch::Sender<RecoveryState>,
    health_tx: watch::Sender<EngineHealth>,
}

impl RecoveryCoordinator {
    pub fn new(
        settings: RecoverySettings,
        engine_settings: EngineSettings,
        engine: Arc<dyn AudioEngine>,
        clock: Arc<dyn Clock>,
    ) -> RecoveryCoordinator {
        let (state_tx, _) = watch::channel(RecoveryState::default());
        let (health_tx, _) = watch::channel(EngineHealth::default());
        RecoveryCoordinator {
            settings,
            engine_settings,
            engine,
            clock,
            listeners: RwLock::new(Vec::new()),
            sleeper: Box::new(thread::sleep),
            recovering: Mutex::new(()),
            state_tx,
            health_tx,
        }
    }

    /// Replaces how backoff delays are waited out.
    pub fn with_sleeper(mut self, sleeper: impl Fn(Duration) + Send + Sync + 'static) -> Self {
        self.sleeper = Box::new(sleeper);
        self
    }

    pub fn register(&self, listener: Arc<dyn RecoveryListener>) {
        self.listeners.write().push(listener);
    }

    pub fn state(&self) -> RecoveryState {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<RecoveryState> {
        self.state_tx.subscribe()
    }

    pub fn health(&self) -> EngineHealth {
        self.health_tx.borrow().clone()
    }

    pub fn subscribe_health(&self) -> watch::Receiver<EngineHealth> {
        self.health_tx.subscribe()
    }

    pub fn settings(&self) -> &RecoverySettings {
        &self.settings
    }

    fn publish(&self, phase: RecoveryPhase, attempt: u32, last_error: Option<String>) {
        let instructions =
            (phase == RecoveryPhase::Failed).then(|| RECOVERY_INSTRUCTIONS.to_string());
        self.state_tx.send_replace(RecoveryState {
            phase,
            attempt,
            last_error,
            instructions,
        });
    }

    /// Restarts the engine after a failure: shuts it down, then retries initialization with
    /// exponential backoff. Returns true if the engine came back.
    pub fn recover(&self, failure: &EngineFailure) -> bool {
        let _guard = self.recovering.lock();
        let span = span!(Level::INFO, "recovery");
        let _enter = span.enter();

        warn!(failure = %failure, "Starting audio engine recovery");
        self.publish(RecoveryPhase::Recovering, 0, None);
        self.engine.shutdown();
        for listener in self.listeners.read().iter() {
            listener.engine_lost();
        }

        let mut last_error = failure.to_string();
        for attempt in 1..=self.settings.max_attempts {
            let delay = self.settings.delay_for(attempt);
            self.publish(RecoveryPhase::Recovering, attempt, Some(last_error.clone()));
            info!(attempt, delay_ms = delay.as_millis(), "Waiting before re-initializing engine");
            (self.sleeper)(delay);

            let settings = self.engine_settings;
            match self.engine.initialize(
                settings.sample_rate,
                settings.buffer_size,
                settings.low_latency,
            ) {
                Ok(()) => {
                    info!(attempt, "Audio engine recovered");
                    self.publish(RecoveryPhase::Success, attempt, None);
                    for listener in self.listeners.read().iter() {
                        listener.engine_recovered();
                    }
                    return true;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Engine re-initialization failed");
                    last_error = EngineFailure::InitFailed(e.to_string()).to_string();
                    // Leave it down between attempts.
                    self.engine.shutdown();
                }
            }
        }

        error!(
            attempts = self.settings.max_attempts,
            error = %last_error,
            "Audio engine recovery failed"
        );
        self.publish(
            RecoveryPhase::Failed,
            self.settings.max_attempts,
            Some(last_error),
        );
        false
    }

    /// Resets a finished recovery back to idle once the user has seen it.
    pub fn acknowledge(&self) {
        let phase = self.state().phase;
        if matches!(phase, RecoveryPhase::Success | RecoveryPhase::Failed) {
            self.publish(RecoveryPhase::Idle, 0, None);
        }
    }

    /// Pings the engine and publishes the result. Skipped while a recovery is running.
    pub fn health_check(&self) -> EngineHealth {
        let Some(_guard) = self.recovering.try_lock() else {
            return self.health();
        };

        let mut health = self.health();
        match self.engine.ping() {
            Ok(()) => {
                health.consecutive_failures = 0;
                health.last_ok_micros = Some(self.clock.now_micros());
                health.last_error = None;
            }
            Err(e) => {
                health.consecutive_failures += 1;
                health.last_error = Some(e.to_string());
                warn!(
                    failures = health.consecutive_failures,
                    error = %e,
                    "Engine health check failed"
                );
            }
        }
        self.health_tx.send_replace(health.clone());
        health
    }

    /// Starts the periodic health check.
    pub fn start_health_check(self: &Arc<Self>) -> LoopHandle {
        let cancel = CancelHandle::new();
        let coordinator = self.clone();
        let join = {
            let cancel = cancel.clone();
            thread::spawn(move || {
                let span = span!(Level::INFO, "health check");
                let _enter = span.enter();
                info!(interval = ?coordinator.settings.health_interval, "Health check started.");
                while !cancel.wait_timeout(coordinator.settings.health_interval) {
                    coordinator.health_check();
                }
                info!("Health check stopped.");
            })
        };
        LoopHandle::new("health check", cancel, join)
    }
}
