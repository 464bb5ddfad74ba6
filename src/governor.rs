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

//! Performance governor.
//!
//! Each monitoring tick takes one [`PerformanceSample`], recomputes the full set of
//! mitigations it calls for, and publishes the result. Mitigations that are no longer
//! called for are held for a cool-down before they are retracted, so a signal hovering
//! around a threshold doesn't flap the set.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, span, warn, Level};

use crate::cancel::{CancelHandle, LoopHandle};
use crate::clock::{micros, Clock};
use crate::recovery::RecoveryListener;

mod frame_rate;
mod telemetry;

pub use frame_rate::FrameRateMeter;
pub use telemetry::{ManualTelemetry, SystemTelemetry, TelemetrySource};

/// Point-in-time telemetry.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct PerformanceSample {
    pub frame_rate: f32,
    pub cpu_usage_percent: f32,
    pub memory_usage_percent: f32,
    pub audio_latency_micros: i64,
    pub timestamp_micros: i64,
}

impl Default for PerformanceSample {
    fn default() -> Self {
        PerformanceSample {
            frame_rate: 60.0,
            cpu_usage_percent: 0.0,
            memory_usage_percent: 0.0,
            audio_latency_micros: 0,
            timestamp_micros: 0,
        }
    }
}

/// A single mitigation the governor can switch on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OptimizationKind {
    DisableAnimations,
    ReduceVisualEffects,
    LazyLoadPanels,
    ReduceUpdateFrequency,
    AggressiveMemoryCleanup,
    UnloadInactiveCaches,
    ReduceCacheSize,
    PrioritizeAudioThread,
}

/// Coarse classification of how the device is coping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PerformanceLevel {
    Optimal,
    Good,
    Degraded,
    Critical,
}

impl fmt::Display for PerformanceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PerformanceLevel::Optimal => "optimal",
            PerformanceLevel::Good => "good",
            PerformanceLevel::Degraded => "degraded",
            PerformanceLevel::Critical => "critical",
        };
        write!(f, "{}", name)
    }
}

/// The governor's published decision. Only the governor writes it.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OptimizationState {
    pub active: BTreeSet<OptimizationKind>,
    pub level: PerformanceLevel,
    pub last_change_micros: i64,
}

impl OptimizationState {
    pub fn is_active(&self, kind: OptimizationKind) -> bool {
        self.active.contains(&kind)
    }
}

impl Default for OptimizationState {
    fn default() -> Self {
        OptimizationState {
            active: BTreeSet::new(),
            level: PerformanceLevel::Optimal,
            last_change_micros: 0,
        }
    }
}

/// Thresholds and timing for the governor.
#[derive(Clone, Debug, PartialEq)]
pub struct GovernorSettings {
    pub interval: Duration,
    /// How long a mitigation must be unneeded before it is retracted.
    pub cooldown: Duration,
    pub fps_severe: f32,
    pub fps_moderate: f32,
    pub memory_severe_percent: f32,
    pub memory_moderate_percent: f32,
    pub latency_threshold: Duration,
    /// Memory usage is reported relative to this ceiling.
    pub memory_ceiling_bytes: u64,
}

impl Default for GovernorSettings {
    fn default() -> Self {
        GovernorSettings {
            interval: Duration::from_secs(1),
            cooldown: Duration::from_secs(3),
            fps_severe: 30.0,
            fps_moderate: 60.0,
            memory_severe_percent: 90.0,
            memory_moderate_percent: 75.0,
            latency_threshold: Duration::from_millis(20),
            memory_ceiling_bytes: 512 * 1024 * 1024,
        }
    }
}

/// Something the governor can act on. Components implement the parts they care about.
pub trait Mitigation: Send + Sync {
    /// Called after every monitoring tick with the current active set.
    fn apply(&self, _active: &BTreeSet<OptimizationKind>, _now_micros: i64) {}

    /// Called on a manual cleanup request.
    fn force_cleanup(&self) {}
}

/// Derives the mitigations and level called for by a single sample, without hysteresis.
pub fn evaluate(
    sample: &PerformanceSample,
    settings: &GovernorSettings,
    panicked: bool,
) -> (BTreeSet<OptimizationKind>, PerformanceLevel) {
    use OptimizationKind::*;

    let mut active = BTreeSet::new();
    let mut severe = panicked;
    let mut moderate = 0;

    if sample.frame_rate < settings.fps_severe {
        active.extend([
            DisableAnimations,
            ReduceVisualEffects,
            LazyLoadPanels,
            ReduceUpdateFrequency,
        ]);
        severe = true;
    } else if sample.frame_rate < settings.fps_moderate {
        active.extend([ReduceVisualEffects, LazyLoadPanels]);
        moderate += 1;
    }

    if sample.memory_usage_percent > settings.memory_severe_percent {
        active.extend([AggressiveMemoryCleanup, UnloadInactiveCaches, ReduceCacheSize]);
        severe = true;
    } else if sample.memory_usage_percent > settings.memory_moderate_percent {
        active.extend([UnloadInactiveCaches, ReduceCacheSize]);
        moderate += 1;
    }

    if sample.audio_latency_micros > micros(settings.latency_threshold) {
        active.insert(PrioritizeAudioThread);
        moderate += 1;
    }

    let level = if severe {
        PerformanceLevel::Critical
    } else if moderate >= 2 {
        PerformanceLevel::Degraded
    } else if moderate == 1 {
        PerformanceLevel::Good
    } else {
        PerformanceLevel::Optimal
    };

    (active, level)
}

/// Cool-down bookkeeping: when each held mitigation (and a lower level) was first seen as
/// no longer needed.
#[derive(Default)]
struct Hysteresis {
    cleared_since: HashMap<OptimizationKind, i64>,
    lower_level_since: Option<i64>,
}

pub struct Governor {
    settings: GovernorSettings,
    clock: Arc<dyn Clock>,
    telemetry: Arc<dyn TelemetrySource>,
    mitigations: RwLock<Vec<Arc<dyn Mitigation>>>,
    hysteresis: Mutex<Hysteresis>,
    panicked: AtomicBool,
    state_tx: watch::Sender<OptimizationState>,
    sample_tx: watch::Sender<PerformanceSample>,
}

impl Governor {
    pub fn new(
        settings: GovernorSettings,
        clock: Arc<dyn Clock>,
        telemetry: Arc<dyn TelemetrySource>,
    ) -> Governor {
        let (state_tx, _) = watch::channel(OptimizationState::default());
        let (sample_tx, _) = watch::channel(PerformanceSample::default());
        Governor {
            settings,
            clock,
            telemetry,
            mitigations: RwLock::new(Vec::new()),
            hysteresis: Mutex::new(Hysteresis::default()),
            panicked: AtomicBool::new(false),
            state_tx,
            sample_tx,
        }
    }

    /// Registers a component the governor acts on.
    pub fn register(&self, mitigation: Arc<dyn Mitigation>) {
        self.mitigations.write().push(mitigation);
    }

    /// Returns the current optimization state. Never blocks on the monitoring loop.
    pub fn state(&self) -> OptimizationState {
        self.state_tx.borrow().clone()
    }

    /// Returns the last published sample.
    pub fn latest_sample(&self) -> PerformanceSample {
        *self.sample_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<OptimizationState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_samples(&self) -> watch::Receiver<PerformanceSample> {
        self.sample_tx.subscribe()
    }

    pub fn settings(&self) -> &GovernorSettings {
        &self.settings
    }

    /// Records that the audio engine has failed. The level is held at critical until
    /// the panic is cleared by a successful recovery.
    pub fn report_engine_failure(&self) {
        if !self.panicked.swap(true, Ordering::SeqCst) {
            warn!("Audio engine failure reported, governor entering panic state");
        }
    }

    pub fn clear_panic(&self) {
        if self.panicked.swap(false, Ordering::SeqCst) {
            info!("Governor panic state cleared");
        }
    }

    pub fn is_panicked(&self) -> bool {
        self.panicked.load(Ordering::SeqCst)
    }

    /// Runs one monitoring tick: samples telemetry, recomputes the optimization state and
    /// lets every registered component act on it.
    pub fn tick(&self) -> OptimizationState {
        let now = self.clock.now_micros();
        let sample = match self.telemetry.sample(now) {
            Ok(sample) => sample,
            Err(e) => {
                warn!(error = %e, "Failed to sample telemetry");
                return self.state();
            }
        };
        self.sample_tx.send_replace(sample);

        let state = self.observe(&sample, now);

        let mitigations = self.mitigations.read().clone();
        for mitigation in mitigations {
            mitigation.apply(&state.active, now);
        }

        state
    }

    /// Feeds one sample through the decision logic and publishes the result.
    fn observe(&self, sample: &PerformanceSample, now: i64) -> OptimizationState {
        let (wanted, wanted_level) = evaluate(sample, &self.settings, self.is_panicked());
        let cooldown = micros(self.settings.cooldown);
        let current = self.state();

        let mut hysteresis = self.hysteresis.lock();
        let mut active = wanted.clone();
        for kind in current.active.iter() {
            if wanted.contains(kind) {
                hysteresis.cleared_since.remove(kind);
                continue;
            }
            let since = *hysteresis.cleared_since.entry(*kind).or_insert(now);
            if now - since < cooldown {
                active.insert(*kind);
            } else {
                hysteresis.cleared_since.remove(kind);
            }
        }
        hysteresis.cleared_since.retain(|kind, _| active.contains(kind));

        let level = if wanted_level >= current.level {
            hysteresis.lower_level_since = None;
            wanted_level
        } else {
            let since = *hysteresis.lower_level_since.get_or_insert(now);
            if now - since < cooldown {
                current.level
            } else {
                hysteresis.lower_level_since = None;
                wanted_level
            }
        };
        drop(hysteresis);

        if active == current.active && level == current.level {
            return current;
        }

        let state = OptimizationState {
            active,
            level,
            last_change_micros: now,
        };
        info!(
            level = %state.level,
            previous = %current.level,
            active = ?state.active,
            fps = sample.frame_rate,
            memory_percent = sample.memory_usage_percent,
            latency_us = sample.audio_latency_micros,
            "Optimization state changed"
        );
        self.state_tx.send_replace(state.clone());
        state
    }

    /// Runs every registered cleanup immediately, outside the monitoring schedule.
    pub fn force_cleanup(&self) {
        info!("Forced cleanup requested");
        let mitigations = self.mitigations.read().clone();
        for mitigation in mitigations {
            mitigation.force_cleanup();
        }
    }

    /// Starts the monitoring loop.
    pub fn start_monitor(self: &Arc<Self>) -> LoopHandle {
        let cancel = CancelHandle::new();
        let governor = self.clone();
        let join = {
            let cancel = cancel.clone();
            thread::spawn(move || {
                let span = span!(Level::INFO, "governor");
                let _enter = span.enter();
                info!(interval = ?governor.settings.interval, "Performance monitor started.");
                while !cancel.wait_timeout(governor.settings.interval) {
                    governor.tick();
                }
                info!("Performance monitor stopped.");
            })
        };
        LoopHandle::new("governor", cancel, join)
    }
}

impl RecoveryListener for Governor {
    fn engine_recovered(&self) {
        self.clear_panic();
    }
}
