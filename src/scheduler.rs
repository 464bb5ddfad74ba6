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

//! Trigger scheduler.
//!
//! Step events are converted into engine-clock timestamps as soon as they are scheduled:
//!
//! ```text
//! timestamp = step time - reported latency + lookahead
//! ```
//!
//! A trigger whose timestamp has already passed is dropped and counted, never retried. The
//! rest wait in a queue until they fall within the dispatch horizon, at which point they
//! are handed to the engine, which holds them until their timestamp.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, span, trace, warn, Level};

use crate::cache::SampleCache;
use crate::cancel::{CancelHandle, LoopHandle};
use crate::clock::micros;
use crate::engine::AudioEngine;
use crate::error::{EngineError, EngineFailure, SchedulingError};
use crate::governor::{Mitigation, OptimizationKind};
use crate::recovery::RecoveryListener;

mod pattern;

pub use pattern::{Pattern, Track};

/// An active step in a pattern, relative to the scheduling call.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StepEvent {
    pub pad: usize,
    pub velocity: f32,
    /// Steps after the current transport position.
    pub offset_steps: u32,
}

/// A trigger waiting to be dispatched. Immutable once scheduled.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct StepTrigger {
    pub pad: usize,
    pub velocity: f32,
    pub timestamp_micros: i64,
}

/// Why a trigger was dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MissReason {
    /// The compensated timestamp had already passed.
    Late,
    SampleNotReady,
    EngineCallFailed,
    /// No sample is assigned to the pad.
    Unassigned,
}

impl fmt::Display for MissReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MissReason::Late => "late",
            MissReason::SampleNotReady => "sample not ready",
            MissReason::EngineCallFailed => "engine call failed",
            MissReason::Unassigned => "unassigned",
        };
        write!(f, "{}", name)
    }
}

/// Outcome of a scheduling call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ScheduledCount {
    pub scheduled: usize,
    pub missed: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerMetrics {
    pub scheduled: u64,
    pub dispatched: u64,
    /// Triggers moved later to keep a pad's triggers in order.
    pub clamped: u64,
    pub missed_late: u64,
    pub missed_sample_not_ready: u64,
    pub missed_engine_call_failed: u64,
    pub missed_unassigned: u64,
    pub pending: usize,
}

impl SchedulerMetrics {
    pub fn missed(&self) -> u64 {
        self.missed_late
            + self.missed_sample_not_ready
            + self.missed_engine_call_failed
            + self.missed_unassigned
    }

    fn record_miss(&mut self, reason: MissReason) {
        match reason {
            MissReason::Late => self.missed_late += 1,
            MissReason::SampleNotReady => self.missed_sample_not_ready += 1,
            MissReason::EngineCallFailed => self.missed_engine_call_failed += 1,
            MissReason::Unassigned => self.missed_unassigned += 1,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SchedulerSettings {
    pub lookahead: Duration,
    /// A sample that isn't resident must be expected to load this long before its trigger.
    pub safety_margin: Duration,
    /// Triggers this close to now are handed to the engine.
    pub dispatch_horizon: Duration,
    pub dispatch_interval: Duration,
    pub default_bpm: f64,
    pub steps_per_beat: u32,
    /// Lookahead multiplier while the audio thread is prioritized.
    pub prioritized_lookahead_factor: f64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        SchedulerSettings {
            lookahead: Duration::from_millis(10),
            safety_margin: Duration::from_millis(2),
            dispatch_horizon: Duration::from_millis(20),
            dispatch_interval: Duration::from_millis(1),
            default_bpm: 120.0,
            steps_per_beat: 4,
            prioritized_lookahead_factor: 2.0,
        }
    }
}

/// Queue entry. Ordered by timestamp, then by the order it was scheduled in.
struct Pending {
    trigger: StepTrigger,
    seq: u64,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.trigger.timestamp_micros, self.seq).cmp(&(other.trigger.timestamp_micros, other.seq))
    }
}

#[derive(Default)]
struct Queue {
    heap: BinaryHeap<Reverse<Pending>>,
    /// Latest timestamp scheduled for each pad since the last clear.
    last_by_pad: HashMap<usize, i64>,
    next_seq: u64,
}

impl Queue {
    fn push(&mut self, trigger: StepTrigger) {
        self.next_seq += 1;
        self.heap.push(Reverse(Pending {
            trigger,
            seq: self.next_seq,
        }));
    }

    fn clear(&mut self) -> usize {
        let cancelled = self.heap.len();
        self.heap.clear();
        self.last_by_pad.clear();
        cancelled
    }
}

pub struct Scheduler {
    settings: SchedulerSettings,
    engine: Arc<dyn AudioEngine>,
    cache: Arc<SampleCache>,
    pads: RwLock<HashMap<usize, String>>,
    queue: Mutex<Queue>,
    /// Held from pop to engine call so a pad's triggers reach the engine in order.
    dispatch: Mutex<()>,
    metrics: Mutex<SchedulerMetrics>,
    bpm_bits: AtomicU64,
    prioritized: AtomicBool,
    failures: Mutex<Option<Sender<EngineFailure>>>,
}

impl Scheduler {
    pub fn new(
        settings: SchedulerSettings,
        engine: Arc<dyn AudioEngine>,
        cache: Arc<SampleCache>,
    ) -> Scheduler {
        let bpm_bits = AtomicU64::new(settings.default_bpm.to_bits());
        Scheduler {
            settings,
            engine,
            cache,
            pads: RwLock::new(HashMap::new()),
            queue: Mutex::new(Queue::default()),
            dispatch: Mutex::new(()),
            metrics: Mutex::new(SchedulerMetrics::default()),
            bpm_bits,
            prioritized: AtomicBool::new(false),
            failures: Mutex::new(None),
        }
    }

    /// Engine call failures are reported here for recovery.
    pub fn set_failure_sink(&self, sink: Sender<EngineFailure>) {
        *self.failures.lock() = Some(sink);
    }

    pub fn assign_pad(&self, pad: usize, sample_id: &str) {
        info!(pad, sample = sample_id, "Pad assigned");
        self.pads.write().insert(pad, sample_id.to_string());
    }

    pub fn unassign_pad(&self, pad: usize) -> Option<String> {
        self.pads.write().remove(&pad)
    }

    pub fn pad_sample(&self, pad: usize) -> Option<String> {
        self.pads.read().get(&pad).cloned()
    }

    pub fn tempo(&self) -> f64 {
        f64::from_bits(self.bpm_bits.load(Ordering::Relaxed))
    }

    /// Changes the tempo for subsequent scheduling. Triggers already queued keep their
    /// timestamps.
    pub fn set_tempo(&self, bpm: f64) {
        if !bpm.is_finite() || bpm <= 0.0 {
            warn!(bpm, "Ignoring invalid tempo");
            return;
        }
        self.bpm_bits.store(bpm.to_bits(), Ordering::Relaxed);
        info!(bpm, step_us = self.step_period_micros(), "Tempo changed");
    }

    /// Length of one step at the current tempo.
    pub fn step_period_micros(&self) -> i64 {
        let steps_per_minute = self.tempo() * f64::from(self.settings.steps_per_beat.max(1));
        (60_000_000.0 / steps_per_minute).round() as i64
    }

    pub fn lookahead_micros(&self) -> i64 {
        let lookahead = micros(self.settings.lookahead);
        if self.is_prioritized() {
            (lookahead as f64 * self.settings.prioritized_lookahead_factor).round() as i64
        } else {
            lookahead
        }
    }

    pub fn is_prioritized(&self) -> bool {
        self.prioritized.load(Ordering::Relaxed)
    }

    /// Converts steps into triggers and queues them. Triggers that are already due are
    /// dispatched before returning; an engine failure while doing so is returned as an error
    /// after the rest have been dispatched.
    pub fn schedule_triggers(
        &self,
        steps: &[StepEvent],
        step_period_micros: i64,
        audio_clock_now: i64,
    ) -> Result<ScheduledCount, SchedulingError> {
        let count = {
            let mut queue = self.queue.lock();
            self.enqueue(&mut queue, steps, step_period_micros, audio_clock_now)
        };
        self.dispatch_due(audio_clock_now)?;
        Ok(count)
    }

    /// Schedules `count` steps of the pattern starting at absolute step `start_step`, at the
    /// current tempo.
    pub fn schedule_pattern(
        &self,
        pattern: &Pattern,
        start_step: u64,
        count: u32,
        audio_clock_now: i64,
    ) -> Result<ScheduledCount, SchedulingError> {
        let steps = pattern.steps(start_step, count);
        self.schedule_triggers(&steps, self.step_period_micros(), audio_clock_now)
    }

    /// Replaces everything pending with the given steps. No stale trigger can interleave with
    /// the new ones.
    pub fn reschedule(
        &self,
        steps: &[StepEvent],
        step_period_micros: i64,
        audio_clock_now: i64,
    ) -> Result<ScheduledCount, SchedulingError> {
        let count = {
            let mut queue = self.queue.lock();
            let cancelled = queue.clear();
            debug!(cancelled, "Cleared pending triggers for reschedule");
            self.enqueue(&mut queue, steps, step_period_micros, audio_clock_now)
        };
        self.dispatch_due(audio_clock_now)?;
        Ok(count)
    }

    /// Cancels every trigger that hasn't been handed to the engine yet. Returns how many were
    /// cancelled.
    pub fn clear_scheduled(&self) -> usize {
        let cancelled = self.queue.lock().clear();
        if cancelled > 0 {
            debug!(cancelled, "Cleared pending triggers");
        }
        cancelled
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().heap.len()
    }

    fn enqueue(
        &self,
        queue: &mut Queue,
        steps: &[StepEvent],
        step_period_micros: i64,
        now: i64,
    ) -> ScheduledCount {
        let latency = self.engine.reported_latency_micros();
        let lookahead = self.lookahead_micros();
        let safety_margin = micros(self.settings.safety_margin);

        let mut count = ScheduledCount::default();
        let mut clamped = 0;
        for step in steps {
            let step_time =
                now.saturating_add(i64::from(step.offset_steps).saturating_mul(step_period_micros));
            let mut timestamp = step_time.saturating_sub(latency).saturating_add(lookahead);
            if timestamp < now {
                self.record_miss(step.pad, MissReason::Late);
                count.missed += 1;
                continue;
            }

            let Some(sample_id) = self.pad_sample(step.pad) else {
                self.record_miss(step.pad, MissReason::Unassigned);
                count.missed += 1;
                continue;
            };
            if !self.cache.is_resident(&sample_id) {
                self.cache.request_preload(&sample_id);
                let ready_at = now + self.cache.expected_load_micros(&sample_id);
                if ready_at > timestamp - safety_margin {
                    self.record_miss(step.pad, MissReason::SampleNotReady);
                    count.missed += 1;
                    continue;
                }
            }

            let last = queue.last_by_pad.entry(step.pad).or_insert(i64::MIN);
            if timestamp < *last {
                timestamp = *last;
                clamped += 1;
            }
            *last = timestamp;

            queue.push(StepTrigger {
                pad: step.pad,
                velocity: step.velocity.clamp(0.0, 1.0),
                timestamp_micros: timestamp,
            });
            count.scheduled += 1;
        }

        let mut metrics = self.metrics.lock();
        metrics.scheduled += count.scheduled as u64;
        metrics.clamped += clamped;
        count
    }

    /// Hands every trigger within the dispatch horizon to the engine. Returns how many were
    /// fired.
    pub fn dispatch_due(&self, now: i64) -> Result<usize, SchedulingError> {
        let horizon = now.saturating_add(micros(self.settings.dispatch_horizon));
        let _dispatch = self.dispatch.lock();
        let due = {
            let mut queue = self.queue.lock();
            let mut due = Vec::new();
            while queue
                .heap
                .peek()
                .is_some_and(|Reverse(pending)| pending.trigger.timestamp_micros <= horizon)
            {
                if let Some(Reverse(pending)) = queue.heap.pop() {
                    due.push(pending.trigger);
                }
            }
            due
        };

        let mut fired = 0;
        let mut first_error = None;
        for trigger in due {
            match self.fire(&trigger, now) {
                Ok(true) => fired += 1,
                Ok(false) => {}
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(fired),
        }
    }

    /// Sends one trigger to the engine. Returns false if it was dropped.
    fn fire(&self, trigger: &StepTrigger, now: i64) -> Result<bool, SchedulingError> {
        if trigger.timestamp_micros < now {
            self.record_miss(trigger.pad, MissReason::Late);
            return Ok(false);
        }
        let Some(sample_id) = self.pad_sample(trigger.pad) else {
            self.record_miss(trigger.pad, MissReason::Unassigned);
            return Ok(false);
        };
        if !self.cache.touch(&sample_id) {
            self.record_miss(trigger.pad, MissReason::SampleNotReady);
            return Ok(false);
        }

        match self
            .engine
            .trigger(trigger.pad, trigger.velocity, trigger.timestamp_micros)
        {
            Ok(()) => {
                trace!(
                    pad = trigger.pad,
                    timestamp = trigger.timestamp_micros,
                    "Trigger dispatched"
                );
                self.metrics.lock().dispatched += 1;
                Ok(true)
            }
            Err(e) => {
                self.record_miss(trigger.pad, MissReason::EngineCallFailed);
                self.report_failure(&e);
                Err(e.into())
            }
        }
    }

    /// Fires a pad right away, for live playing.
    pub fn trigger_now(&self, pad: usize, velocity: f32) -> Result<(), SchedulingError> {
        let Some(sample_id) = self.pad_sample(pad) else {
            self.record_miss(pad, MissReason::Unassigned);
            return Err(SchedulingError::SampleNotReady { pad });
        };
        if !self.cache.is_resident(&sample_id) {
            self.cache.request_preload(&sample_id);
            self.record_miss(pad, MissReason::SampleNotReady);
            return Err(SchedulingError::SampleNotReady { pad });
        }

        let trigger = StepTrigger {
            pad,
            velocity: velocity.clamp(0.0, 1.0),
            timestamp_micros: self.engine.current_audio_clock_micros(),
        };
        let now = trigger.timestamp_micros;
        let fired = {
            let _dispatch = self.dispatch.lock();
            self.fire(&trigger, now)?
        };
        if fired {
            Ok(())
        } else {
            Err(SchedulingError::SampleNotReady { pad })
        }
    }

    fn record_miss(&self, pad: usize, reason: MissReason) {
        debug!(pad, reason = %reason, "Missed trigger");
        self.metrics.lock().record_miss(reason);
    }

    fn report_failure(&self, error: &EngineError) {
        // Nothing to recover: the sample is missing, or a recovery already took the engine down.
        if matches!(
            error,
            EngineError::SampleNotLoaded(_) | EngineError::NotInitialized
        ) {
            return;
        }
        if let Some(sink) = self.failures.lock().as_ref() {
            // A failure already waiting covers this one.
            let _ = sink.try_send(EngineFailure::Unresponsive(error.to_string()));
        }
    }

    pub fn metrics(&self) -> SchedulerMetrics {
        let pending = self.pending();
        SchedulerMetrics {
            pending,
            ..*self.metrics.lock()
        }
    }

    /// Starts the dispatcher loop, which runs against the engine's audio clock.
    pub fn start_dispatcher(self: &Arc<Self>) -> LoopHandle {
        let cancel = CancelHandle::new();
        let scheduler = self.clone();
        let join = {
            let cancel = cancel.clone();
            thread::spawn(move || {
                let span = span!(Level::INFO, "dispatcher");
                let _enter = span.enter();
                let tick = scheduler.settings.dispatch_interval;
                info!(interval = ?tick, "Trigger dispatcher started.");

                // Priority is raised at most once per thread; it is never lowered again.
                let mut elevation_attempted = false;
                let mut next = Instant::now();
                while !cancel.is_cancelled() {
                    if !elevation_attempted && scheduler.is_prioritized() {
                        elevation_attempted = true;
                        crate::thread_priority::elevate_current_thread(
                            crate::thread_priority::dispatch_thread_priority(),
                            crate::thread_priority::rt_dispatch_enabled(),
                        );
                    }

                    let now = scheduler.engine.current_audio_clock_micros();
                    if let Err(e) = scheduler.dispatch_due(now) {
                        debug!(error = %e, "Dispatch failed");
                    }

                    let wall = Instant::now();
                    next = (next + tick).max(wall);
                    spin_sleep::sleep(next - wall);
                }
                info!("Trigger dispatcher stopped.");
            })
        };
        LoopHandle::new("dispatcher", cancel, join)
    }
}

impl Mitigation for Scheduler {
    fn apply(&self, active: &BTreeSet<OptimizationKind>, _now_micros: i64) {
        let wanted = active.contains(&OptimizationKind::PrioritizeAudioThread);
        if self.prioritized.swap(wanted, Ordering::Relaxed) != wanted {
            info!(
                prioritized = wanted,
                lookahead_us = self.lookahead_micros(),
                "Audio thread priority changed"
            );
        }
    }
}

impl RecoveryListener for Scheduler {
    fn engine_lost(&self) {
        self.clear_scheduled();
    }

    fn engine_recovered(&self) {
        self.clear_scheduled();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheSettings;
    use crate::clock::ManualClock;
    use crate::engine::mock;
    use crate::repository::StaticRepository;

    const NOW: i64 = 1_000_000;
    const PERIOD: i64 = 125_000;

    struct Fixture {
        scheduler: Arc<Scheduler>,
        cache: Arc<SampleCache>,
        engine: mock::Engine,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(NOW));
        let engine = mock::Engine::new("mock", clock.clone());
        let repository = Arc::new(StaticRepository::new());
        for id in ["kick", "snare", "hat", "clap"] {
            repository.insert_synthetic(id);
        }
        let cache = Arc::new(SampleCache::new(
            CacheSettings::default(),
            clock.clone(),
            Arc::new(engine.clone()),
            repository,
        ));
        let scheduler = Arc::new(Scheduler::new(
            SchedulerSettings::default(),
            Arc::new(engine.clone()),
            cache.clone(),
        ));
        scheduler.assign_pad(0, "kick");
        scheduler.assign_pad(1, "snare");
        scheduler.assign_pad(2, "hat");
        scheduler.assign_pad(3, "clap");
        cache.ensure_loaded("kick").unwrap();
        cache.ensure_loaded("snare").unwrap();
        Fixture {
            scheduler,
            cache,
            engine,
            clock,
        }
    }

    fn step(pad: usize, offset_steps: u32) -> StepEvent {
        StepEvent {
            pad,
            velocity: 0.8,
            offset_steps,
        }
    }

    #[test]
    fn test_timestamps_compensate_for_latency() {
        let f = fixture();
        let count = f
            .scheduler
            .schedule_triggers(&[step(0, 0), step(0, 1)], PERIOD, NOW)
            .unwrap();
        assert_eq!(count, ScheduledCount { scheduled: 2, missed: 0 });

        // 5ms reported latency, 10ms lookahead. The first is within the horizon.
        let triggers = f.engine.triggers();
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].timestamp_micros, NOW + 5_000);
        assert_eq!(triggers[0].velocity, 0.8);
        assert_eq!(f.scheduler.pending(), 1);

        f.scheduler.dispatch_due(NOW + PERIOD - 10_000).unwrap();
        assert_eq!(f.engine.triggers()[1].timestamp_micros, NOW + PERIOD + 5_000);
    }

    #[test]
    fn test_late_trigger_is_missed_without_engine_call() {
        let f = fixture();
        f.engine.set_latency_micros(30_000);

        let count = f.scheduler.schedule_triggers(&[step(0, 0)], PERIOD, NOW).unwrap();

        assert_eq!(count, ScheduledCount { scheduled: 0, missed: 1 });
        assert!(f.engine.triggers().is_empty());
        let metrics = f.scheduler.metrics();
        assert_eq!(metrics.missed_late, 1);
        assert_eq!(metrics.missed(), 1);
        assert_eq!(metrics.pending, 0);
    }

    #[test]
    fn test_triggers_for_a_pad_stay_in_order() {
        let f = fixture();
        f.scheduler
            .schedule_triggers(&[step(0, 1), step(1, 1), step(0, 2)], PERIOD, NOW)
            .unwrap();
        // Latency jumps; the same step now computes earlier than what is queued.
        f.engine.set_latency_micros(9_000);
        f.scheduler
            .schedule_triggers(&[step(0, 1), step(1, 3)], PERIOD, NOW)
            .unwrap();
        assert_eq!(f.scheduler.metrics().clamped, 1);

        for ms in 0..500 {
            f.scheduler.dispatch_due(NOW + ms * 1000).unwrap();
        }

        let triggers = f.engine.triggers();
        assert_eq!(triggers.len(), 5);
        for pad in [0, 1] {
            let timestamps: Vec<i64> = triggers
                .iter()
                .filter(|t| t.pad == pad)
                .map(|t| t.timestamp_micros)
                .collect();
            assert!(timestamps.windows(2).all(|w| w[0] <= w[1]), "{:?}", timestamps);
        }
    }

    #[test]
    fn test_clear_scheduled_is_idempotent() {
        let f = fixture();
        f.scheduler
            .schedule_triggers(&[step(0, 1), step(0, 2), step(1, 3)], PERIOD, NOW)
            .unwrap();
        assert_eq!(f.scheduler.clear_scheduled(), 3);
        assert_eq!(f.scheduler.clear_scheduled(), 0);
        assert_eq!(f.scheduler.pending(), 0);

        f.scheduler.dispatch_due(NOW + 10 * PERIOD).unwrap();
        assert!(f.engine.triggers().is_empty());
    }

    #[test]
    fn test_reschedule_replaces_pending() {
        let f = fixture();
        f.scheduler
            .schedule_triggers(&[step(0, 1), step(0, 2)], PERIOD, NOW)
            .unwrap();
        let count = f.scheduler.reschedule(&[step(1, 4)], PERIOD, NOW).unwrap();
        assert_eq!(count.scheduled, 1);
        assert_eq!(f.scheduler.pending(), 1);
    }

    #[test]
    fn test_unassigned_pad_is_missed() {
        let f = fixture();
        let count = f.scheduler.schedule_triggers(&[step(9, 1)], PERIOD, NOW).unwrap();
        assert_eq!(count.missed, 1);
        assert_eq!(f.scheduler.metrics().missed_unassigned, 1);
    }

    #[test]
    fn test_sample_not_ready() {
        let f = fixture();

        // Due in 5ms, but a load is expected to take 15ms.
        let count = f.scheduler.schedule_triggers(&[step(2, 0)], PERIOD, NOW).unwrap();
        assert_eq!(count.missed, 1);
        assert_eq!(f.scheduler.metrics().missed_sample_not_ready, 1);
        assert!(f.engine.triggers().is_empty());

        // Far enough out to preload in the background.
        let count = f.scheduler.schedule_triggers(&[step(3, 1)], PERIOD, NOW).unwrap();
        assert_eq!(count.scheduled, 1);
        assert_eq!(f.cache.run_pending_preloads(), 2);
        assert!(f.cache.is_resident("hat"));

        assert_eq!(f.scheduler.dispatch_due(NOW + PERIOD - 10_000).unwrap(), 1);
        assert_eq!(f.engine.triggers()[0].pad, 3);
    }

    #[test]
    fn test_trigger_dropped_if_sample_evicted_before_dispatch() {
        let f = fixture();
        f.scheduler.schedule_triggers(&[step(0, 2)], PERIOD, NOW).unwrap();
        f.cache.release("kick").unwrap();

        assert_eq!(f.scheduler.dispatch_due(NOW + 2 * PERIOD).unwrap(), 0);
        assert_eq!(f.scheduler.metrics().missed_sample_not_ready, 1);
        assert!(f.engine.triggers().is_empty());
    }

    #[test]
    fn test_engine_failure_surfaces_and_is_reported() {
        let f = fixture();
        let (tx, rx) = crossbeam_channel::bounded(1);
        f.scheduler.set_failure_sink(tx);
        f.engine.set_failing_triggers(true);

        let result = f.scheduler.schedule_triggers(&[step(0, 0)], PERIOD, NOW);

        assert!(matches!(result, Err(SchedulingError::EngineCallFailed(_))));
        assert_eq!(f.scheduler.metrics().missed_engine_call_failed, 1);
        assert!(matches!(rx.try_recv(), Ok(EngineFailure::Unresponsive(_))));
    }

    #[test]
    fn test_engine_down_is_not_reported() {
        let f = fixture();
        let (tx, rx) = crossbeam_channel::bounded(1);
        f.scheduler.set_failure_sink(tx);
        f.engine.shutdown();

        assert!(matches!(
            f.scheduler.trigger_now(0, 1.0),
            Err(SchedulingError::EngineCallFailed(EngineError::NotInitialized))
        ));
        assert_eq!(f.scheduler.metrics().missed_engine_call_failed, 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_concurrent_dispatch_keeps_pad_order() {
        let f = fixture();
        f.scheduler.schedule_triggers(&[step(0, 1)], PERIOD, NOW).unwrap();
        f.engine.set_trigger_delay(Duration::from_millis(200));

        let dispatcher = {
            let scheduler = f.scheduler.clone();
            thread::spawn(move || scheduler.dispatch_due(NOW + PERIOD).unwrap())
        };
        // The dispatcher has taken the first trigger and is stalled in the engine.
        let scheduler = f.scheduler.clone();
        crate::testutil::eventually(|| scheduler.pending() == 0, "Trigger was never taken");

        f.scheduler
            .schedule_triggers(&[step(0, 0)], PERIOD, NOW + PERIOD + 5_000)
            .unwrap();
        assert_eq!(dispatcher.join().unwrap(), 1);

        let timestamps: Vec<i64> = f
            .engine
            .triggers()
            .iter()
            .map(|t| t.timestamp_micros)
            .collect();
        assert_eq!(timestamps, vec![NOW + PERIOD + 5_000, NOW + PERIOD + 10_000]);
    }

    #[test]
    fn test_huge_step_period_does_not_overflow() {
        let f = fixture();
        let count = f
            .scheduler
            .schedule_triggers(&[step(0, 2)], i64::MAX / 2, NOW)
            .unwrap();
        assert_eq!(count.scheduled, 1);
        assert_eq!(f.scheduler.pending(), 1);
        assert_eq!(f.scheduler.dispatch_due(NOW).unwrap(), 0);
    }

    #[test]
    fn test_set_tempo() {
        let f = fixture();
        assert_eq!(f.scheduler.step_period_micros(), 125_000);
        f.scheduler.set_tempo(150.0);
        assert_eq!(f.scheduler.step_period_micros(), 100_000);
        f.scheduler.set_tempo(0.0);
        f.scheduler.set_tempo(f64::NAN);
        assert_eq!(f.scheduler.tempo(), 150.0);
    }

    #[test]
    fn test_tempo_change_does_not_retime_queued_triggers() {
        let f = fixture();
        let period = f.scheduler.step_period_micros();
        f.scheduler.schedule_triggers(&[step(0, 4)], period, NOW).unwrap();
        f.scheduler.set_tempo(60.0);

        f.scheduler.dispatch_due(NOW + 4 * period).unwrap();
        assert_eq!(
            f.engine.triggers()[0].timestamp_micros,
            NOW + 4 * period + 5_000
        );
    }

    #[test]
    fn test_prioritized_lookahead() {
        let f = fixture();
        f.engine.set_latency_micros(15_000);
        f.scheduler.schedule_triggers(&[step(0, 0)], PERIOD, NOW).unwrap();
        assert_eq!(f.scheduler.metrics().missed_late, 1);

        f.scheduler
            .apply(&BTreeSet::from([OptimizationKind::PrioritizeAudioThread]), NOW);
        assert_eq!(f.scheduler.lookahead_micros(), 20_000);
        f.scheduler.schedule_triggers(&[step(0, 0)], PERIOD, NOW).unwrap();
        assert_eq!(f.engine.triggers()[0].timestamp_micros, NOW + 5_000);
    }

    #[test]
    fn test_schedule_pattern() {
        let f = fixture();
        let pattern = Pattern::parse("kick:x...x...,snare:....x...").unwrap();
        let count = f.scheduler.schedule_pattern(&pattern, 0, 8, NOW).unwrap();
        assert_eq!(count.scheduled, 3);
    }

    #[test]
    fn test_trigger_now() {
        let f = fixture();
        f.scheduler.trigger_now(1, 2.0).unwrap();
        let triggers = f.engine.triggers();
        assert_eq!(triggers[0].timestamp_micros, NOW);
        assert_eq!(triggers[0].velocity, 1.0);

        assert_eq!(
            f.scheduler.trigger_now(2, 1.0),
            Err(SchedulingError::SampleNotReady { pad: 2 })
        );
    }

    #[test]
    fn test_engine_loss_clears_queue() {
        let f = fixture();
        f.scheduler.schedule_triggers(&[step(0, 3)], PERIOD, NOW).unwrap();
        f.scheduler.engine_lost();
        assert_eq!(f.scheduler.pending(), 0);
    }

    #[test]
    fn test_dispatcher_thread() {
        let f = fixture();
        f.scheduler.schedule_triggers(&[step(0, 1)], PERIOD, NOW).unwrap();
        let handle = f.scheduler.start_dispatcher();

        f.clock.set(NOW + PERIOD - 10_000);
        let engine = f.engine.clone();
        crate::testutil::eventually(
            || engine.triggers().len() == 1,
            "Trigger was never dispatched",
        );
        handle.stop();
    }
}
