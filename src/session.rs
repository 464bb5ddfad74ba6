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

//! The surface the UI layer talks to.
//!
//! A [`Session`] wires the scheduler, sample cache, buffer pool, governor and recovery
//! coordinator together around one audio engine and owns their background loops.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, span, warn, Level};

use crate::cache::{CacheMetrics, CacheSettings, SampleCache};
use crate::cancel::{CancelHandle, LoopHandle};
use crate::clock::Clock;
use crate::engine::{AudioEngine, EngineSettings};
use crate::error::{AllocationError, EngineFailure, SchedulingError};
use crate::governor::{
    FrameRateMeter, Governor, GovernorSettings, OptimizationState, PerformanceLevel,
    PerformanceSample, SystemTelemetry, TelemetrySource,
};
use crate::pool::{BufferInfo, BufferPool, PoolMetrics, PoolSettings};
use crate::recovery::{
    EngineHealth, RecoveryCoordinator, RecoveryListener, RecoverySettings, RecoveryState,
};
use crate::repository::SampleRepository;
use crate::scheduler::{
    Pattern, ScheduledCount, Scheduler, SchedulerMetrics, SchedulerSettings, StepEvent,
};

/// How often the failure watcher checks for cancellation while idle.
const FAILURE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Settings for every component of a session.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Settings {
    pub engine: EngineSettings,
    pub scheduler: SchedulerSettings,
    pub cache: CacheSettings,
    pub pool: PoolSettings,
    pub governor: GovernorSettings,
    pub recovery: RecoverySettings,
}

/// A snapshot of every component's counters.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SessionMetrics {
    pub scheduler: SchedulerMetrics,
    pub cache: CacheMetrics,
    pub pool: PoolMetrics,
    pub performance: PerformanceSample,
    pub optimization: OptimizationState,
    pub recovery: RecoveryState,
}

/// The last reason a recording couldn't start. Cleared once the engine recovers.
struct RecordingStatus {
    error_tx: watch::Sender<Option<String>>,
}

impl RecoveryListener for RecordingStatus {
    fn engine_recovered(&self) {
        self.error_tx.send_replace(None);
    }
}

pub struct Session {
    settings: Settings,
    clock: Arc<dyn Clock>,
    engine: Arc<dyn AudioEngine>,
    cache: Arc<SampleCache>,
    pool: Arc<BufferPool>,
    scheduler: Arc<Scheduler>,
    governor: Arc<Governor>,
    recovery: Arc<RecoveryCoordinator>,
    frame_meter: Arc<FrameRateMeter>,
    recording: Arc<RecordingStatus>,
    failure_tx: Sender<EngineFailure>,
    failure_rx: Receiver<EngineFailure>,
    loops: Mutex<Vec<LoopHandle>>,
}

impl Session {
    /// Builds a session that samples telemetry from the running process.
    pub fn new(
        settings: Settings,
        clock: Arc<dyn Clock>,
        engine: Arc<dyn AudioEngine>,
        repository: Arc<dyn SampleRepository>,
    ) -> Session {
        let frame_meter = Arc::new(FrameRateMeter::new());
        let telemetry = Arc::new(SystemTelemetry::new(
            frame_meter.clone(),
            engine.clone(),
            settings.governor.memory_ceiling_bytes,
        ));
        Self::build(settings, clock, engine, repository, frame_meter, telemetry)
    }

    /// Builds a session with the given telemetry source.
    pub fn with_telemetry(
        settings: Settings,
        clock: Arc<dyn Clock>,
        engine: Arc<dyn AudioEngine>,
        repository: Arc<dyn SampleRepository>,
        telemetry: Arc<dyn TelemetrySource>,
    ) -> Session {
        let frame_meter = Arc::new(FrameRateMeter::new());
        Self::build(settings, clock, engine, repository, frame_meter, telemetry)
    }

    fn build(
        settings: Settings,
        clock: Arc<dyn Clock>,
        engine: Arc<dyn AudioEngine>,
        repository: Arc<dyn SampleRepository>,
        frame_meter: Arc<FrameRateMeter>,
        telemetry: Arc<dyn TelemetrySource>,
    ) -> Session {
        let cache = Arc::new(SampleCache::new(
            settings.cache.clone(),
            clock.clone(),
            engine.clone(),
            repository,
        ));
        let governor = Arc::new(Governor::new(
            settings.governor.clone(),
            clock.clone(),
            telemetry,
        ));
        let pool = Arc::new(BufferPool::new(
            settings.pool.clone(),
            clock.clone(),
            governor.subscribe_samples(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            settings.scheduler.clone(),
            engine.clone(),
            cache.clone(),
        ));
        let recovery = Arc::new(RecoveryCoordinator::new(
            settings.recovery.clone(),
            settings.engine,
            engine.clone(),
            clock.clone(),
        ));
        let (error_tx, _) = watch::channel(None);
        let recording = Arc::new(RecordingStatus { error_tx });

        governor.register(cache.clone());
        governor.register(pool.clone());
        governor.register(scheduler.clone());

        recovery.register(cache.clone());
        recovery.register(scheduler.clone());
        recovery.register(governor.clone());
        recovery.register(recording.clone());

        // One queued failure is enough to start a recovery.
        let (failure_tx, failure_rx): (Sender<EngineFailure>, _) = crossbeam_channel::bounded(1);
        scheduler.set_failure_sink(failure_tx.clone());

        Session {
            settings,
            clock,
            engine,
            cache,
            pool,
            scheduler,
            governor,
            recovery,
            frame_meter,
            recording,
            failure_tx,
            failure_rx,
            loops: Mutex::new(Vec::new()),
        }
    }

    /// Initializes the engine and starts every background loop.
    pub fn start(&self) -> Result<(), EngineFailure> {
        let mut loops = self.loops.lock();
        if !loops.is_empty() {
            warn!("Session already started");
            return Ok(());
        }

        let engine = self.settings.engine;
        self.engine
            .initialize(engine.sample_rate, engine.buffer_size, engine.low_latency)
            .map_err(|e| EngineFailure::InitFailed(e.to_string()))?;
        info!(engine = %self.engine, sample_rate = engine.sample_rate, "Session starting");

        loops.push(self.cache.start_preloader());
        loops.push(self.scheduler.start_dispatcher());
        loops.push(self.governor.start_monitor());
        loops.push(self.pool.start_sweeper());
        loops.push(self.recovery.start_health_check());
        loops.push(self.start_failure_watcher());
        Ok(())
    }

    /// Starts recovery whenever an engine failure is reported.
    fn start_failure_watcher(&self) -> LoopHandle {
        let cancel = CancelHandle::new();
        let failures = self.failure_rx.clone();
        let governor = self.governor.clone();
        let recovery = self.recovery.clone();
        let join = {
            let cancel = cancel.clone();
            thread::spawn(move || {
                let span = span!(Level::INFO, "failure watcher");
                let _enter = span.enter();
                while !cancel.is_cancelled() {
                    match failures.recv_timeout(FAILURE_POLL_INTERVAL) {
                        Ok(failure) => {
                            governor.report_engine_failure();
                            recovery.recover(&failure);
                            // Reported while the engine was being restarted.
                            let stale = failures.try_iter().count();
                            if stale > 0 {
                                debug!(stale, "Discarded failures reported during recovery");
                            }
                        }
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
        };
        LoopHandle::new("failure watcher", cancel, join)
    }

    /// Stops every background loop and shuts the engine down.
    pub fn stop(&self) {
        let loops: Vec<LoopHandle> = self.loops.lock().drain(..).collect();
        if loops.is_empty() {
            return;
        }
        for handle in loops.into_iter().rev() {
            handle.stop();
        }
        self.scheduler.clear_scheduled();
        self.engine.shutdown();
        self.cache.invalidate_residency();
        info!("Session stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.loops.lock().is_empty()
    }

    /// Assigns a sample to a pad and starts loading it in the background.
    pub fn assign_pad(&self, pad: usize, sample_id: &str) {
        self.scheduler.assign_pad(pad, sample_id);
        self.cache.request_preload(sample_id);
    }

    /// Plays a pad now.
    pub fn trigger_step(&self, pad: usize, velocity: f32) -> Result<(), SchedulingError> {
        self.scheduler.trigger_now(pad, velocity)
    }

    /// Schedules steps relative to the engine's current audio clock at the current tempo.
    pub fn schedule_steps(&self, steps: &[StepEvent]) -> Result<ScheduledCount, SchedulingError> {
        self.scheduler.schedule_triggers(
            steps,
            self.scheduler.step_period_micros(),
            self.engine.current_audio_clock_micros(),
        )
    }

    pub fn schedule_pattern(
        &self,
        pattern: &Pattern,
        start_step: u64,
        count: u32,
    ) -> Result<ScheduledCount, SchedulingError> {
        self.scheduler.schedule_pattern(
            pattern,
            start_step,
            count,
            self.engine.current_audio_clock_micros(),
        )
    }

    /// Cancels pending triggers, for transport stop or a pattern switch.
    pub fn clear_scheduled(&self) -> usize {
        self.scheduler.clear_scheduled()
    }

    pub fn set_tempo(&self, bpm: f64) {
        self.scheduler.set_tempo(bpm);
    }

    /// Asks for a recording buffer. On failure the reason is published as the recording
    /// status; callers should treat it as "cannot record right now".
    pub fn request_recording_buffer(
        &self,
        id: &str,
        size_bytes: u64,
        sample_rate: u32,
        channels: u16,
    ) -> Result<BufferInfo, AllocationError> {
        match self.pool.allocate(id, size_bytes, sample_rate, channels) {
            Ok(info) => {
                self.recording.error_tx.send_replace(None);
                Ok(info)
            }
            Err(e) => {
                self.recording.error_tx.send_replace(Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// Appends recorded samples. Returns how many fit, or None if the buffer isn't active.
    pub fn write_recording(&self, id: &str, samples: &[f32]) -> Option<usize> {
        self.pool.write(id, samples)
    }

    /// Ends a recording and returns its samples.
    pub fn finish_recording(&self, id: &str) -> Option<Vec<f32>> {
        self.pool.take(id)
    }

    /// Abandons a recording, returning its buffer to the pool.
    pub fn discard_recording(&self, id: &str) -> bool {
        self.pool.release(id)
    }

    pub fn recording_error(&self) -> Option<String> {
        self.recording.error_tx.borrow().clone()
    }

    /// Reports an engine failure detected outside the scheduler, such as an interrupted audio
    /// session. Recovery starts in the background if the session is running.
    pub fn report_engine_failure(&self, failure: EngineFailure) {
        warn!(failure = %failure, "Engine failure reported");
        // A failure already waiting covers this one.
        let _ = self.failure_tx.try_send(failure);
    }

    pub fn force_cleanup(&self) {
        self.governor.force_cleanup();
    }

    /// Restarts the engine on request. Blocks through the backoff delays.
    pub fn recover_engine(&self) -> bool {
        self.governor.report_engine_failure();
        self.recovery
            .recover(&EngineFailure::Unresponsive("recovery requested".to_string()))
    }

    /// Restarts the engine on a blocking worker.
    pub async fn recover_engine_async(&self) -> bool {
        let governor = self.governor.clone();
        let recovery = self.recovery.clone();
        let result = tokio::task::spawn_blocking(move || {
            governor.report_engine_failure();
            recovery.recover(&EngineFailure::Unresponsive("recovery requested".to_string()))
        })
        .await;
        match result {
            Ok(recovered) => recovered,
            Err(e) => {
                error!(error = %e, "Recovery task failed");
                false
            }
        }
    }

    /// Resets a finished recovery back to idle.
    pub fn acknowledge_recovery(&self) {
        self.recovery.acknowledge();
    }

    /// Called by the UI once per rendered frame.
    pub fn record_frame(&self) {
        self.frame_meter.record_frame(self.clock.now_micros());
    }

    pub fn performance_level(&self) -> PerformanceLevel {
        self.governor.state().level
    }

    pub fn optimization_state(&self) -> OptimizationState {
        self.governor.state()
    }

    pub fn subscribe_performance(&self) -> watch::Receiver<PerformanceSample> {
        self.governor.subscribe_samples()
    }

    pub fn subscribe_optimization(&self) -> watch::Receiver<OptimizationState> {
        self.governor.subscribe_state()
    }

    pub fn subscribe_recovery(&self) -> watch::Receiver<RecoveryState> {
        self.recovery.subscribe_state()
    }

    pub fn subscribe_health(&self) -> watch::Receiver<EngineHealth> {
        self.recovery.subscribe_health()
    }

    pub fn subscribe_recording_error(&self) -> watch::Receiver<Option<String>> {
        self.recording.error_tx.subscribe()
    }

    pub fn metrics(&self) -> SessionMetrics {
        SessionMetrics {
            scheduler: self.scheduler.metrics(),
            cache: self.cache.metrics(),
            pool: self.pool.metrics(),
            performance: self.governor.latest_sample(),
            optimization: self.governor.state(),
            recovery: self.recovery.state(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn cache(&self) -> &Arc<SampleCache> {
        &self.cache
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn governor(&self) -> &Arc<Governor> {
        &self.governor
    }

    pub fn recovery(&self) -> &Arc<RecoveryCoordinator> {
        &self.recovery
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::engine::mock;
    use crate::governor::ManualTelemetry;
    use crate::recovery::RecoveryPhase;
    use crate::repository::StaticRepository;
    use crate::testutil::eventually;

    struct Fixture {
        session: Session,
        engine: mock::Engine,
        telemetry: Arc<ManualTelemetry>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let engine = mock::Engine::new("mock", clock.clone());
        let repository = Arc::new(StaticRepository::new());
        repository.insert_synthetic("kick");
        repository.insert_synthetic("snare");
        let telemetry = Arc::new(ManualTelemetry::new(PerformanceSample::default()));
        let settings = Settings {
            recovery: RecoverySettings {
                base_delay: Duration::from_millis(1),
                ..Default::default()
            },
            ..Default::default()
        };
        let session = Session::with_telemetry(
            settings,
            clock,
            Arc::new(engine.clone()),
            repository,
            telemetry.clone(),
        );
        Fixture {
            session,
            engine,
            telemetry,
        }
    }

    #[test]
    fn test_start_and_stop() {
        let f = fixture();
        f.session.start().unwrap();
        assert!(f.session.is_running());
        assert_eq!(f.engine.init_calls(), 1);

        // Starting twice is harmless.
        f.session.start().unwrap();
        assert_eq!(f.engine.init_calls(), 1);

        f.session.stop();
        assert!(!f.session.is_running());
    }

    #[test]
    fn test_start_reports_init_failure() {
        let f = fixture();
        f.engine.fail_next_inits(1);
        assert!(matches!(f.session.start(), Err(EngineFailure::InitFailed(_))));
        assert!(!f.session.is_running());
    }

    #[test]
    fn test_trigger_step() {
        let f = fixture();
        f.session.assign_pad(0, "kick");
        f.session.cache().run_pending_preloads();

        f.session.trigger_step(0, 0.7).unwrap();
        assert_eq!(f.engine.triggers().len(), 1);
        assert_eq!(
            f.session.trigger_step(5, 0.7),
            Err(SchedulingError::SampleNotReady { pad: 5 })
        );
    }

    #[test]
    fn test_recording_declined_under_memory_pressure() {
        let f = fixture();
        f.telemetry.set(PerformanceSample {
            memory_usage_percent: 95.0,
            ..Default::default()
        });
        f.session.governor().tick();

        let result = f.session.request_recording_buffer("take-1", 1024, 48000, 2);
        assert!(result.is_err());
        assert_eq!(
            f.session.recording_error().as_deref(),
            Some("cannot record, low memory (95% used)")
        );

        f.telemetry.set(PerformanceSample::default());
        f.session.governor().tick();
        let info = f.session.request_recording_buffer("take-1", 1024, 48000, 2).unwrap();
        assert_eq!(info.id, "take-1");
        assert_eq!(f.session.recording_error(), None);
        assert_eq!(f.session.write_recording("take-1", &[0.5; 4]), Some(4));
        assert_eq!(f.session.finish_recording("take-1"), Some(vec![0.5; 4]));
    }

    #[test]
    fn test_manual_recovery_clears_dependent_state() {
        let f = fixture();
        f.session.assign_pad(0, "kick");
        f.session.cache().run_pending_preloads();
        f.telemetry.set(PerformanceSample {
            memory_usage_percent: 95.0,
            ..Default::default()
        });
        f.session.governor().tick();
        let _ = f.session.request_recording_buffer("take-1", 1024, 48000, 2);
        assert!(f.session.recording_error().is_some());

        assert!(f.session.recover_engine());

        assert!(!f.session.governor().is_panicked());
        assert_eq!(f.session.recording_error(), None);
        assert!(!f.session.cache().is_resident("kick"));
        assert_eq!(f.session.metrics().recovery.phase, RecoveryPhase::Success);

        f.session.acknowledge_recovery();
        assert_eq!(f.session.metrics().recovery.phase, RecoveryPhase::Idle);
    }

    #[test]
    fn test_engine_failure_starts_recovery() {
        let f = fixture();
        f.session.start().unwrap();
        f.session.assign_pad(0, "kick");
        let cache = f.session.cache().clone();
        eventually(|| cache.is_resident("kick"), "Sample never preloaded");

        f.engine.set_unresponsive(true);
        assert!(matches!(
            f.session.trigger_step(0, 1.0),
            Err(SchedulingError::EngineCallFailed(_))
        ));

        let recovery = f.session.recovery().clone();
        eventually(
            || recovery.state().phase == RecoveryPhase::Success,
            "Engine was never recovered",
        );
        assert_eq!(f.engine.init_calls(), 2);
        f.session.stop();
    }

    struct FailsDuringRecovery {
        failures: Sender<EngineFailure>,
    }

    impl RecoveryListener for FailsDuringRecovery {
        fn engine_lost(&self) {
            let _ = self
                .failures
                .try_send(EngineFailure::Unresponsive("trigger while down".to_string()));
        }

        fn engine_recovered(&self) {}
    }

    #[test]
    fn test_failure_during_recovery_does_not_recover_twice() {
        let f = fixture();
        f.session.recovery().register(Arc::new(FailsDuringRecovery {
            failures: f.session.failure_tx.clone(),
        }));
        f.session.start().unwrap();

        f.session
            .report_engine_failure(EngineFailure::Unresponsive("interrupted".to_string()));

        let recovery = f.session.recovery().clone();
        eventually(
            || recovery.state().phase == RecoveryPhase::Success,
            "Engine was never recovered",
        );
        // Give the watcher time to pick up anything left in the channel.
        thread::sleep(FAILURE_POLL_INTERVAL * 3);
        assert_eq!(f.engine.init_calls(), 2);
        assert!(f.session.failure_rx.is_empty());
        f.session.stop();
    }

    #[test]
    fn test_force_cleanup_reaches_every_component() {
        let f = fixture();
        f.session.assign_pad(0, "kick");
        f.session.cache().run_pending_preloads();
        f.session.request_recording_buffer("a", 64, 48000, 1).unwrap();
        f.session.discard_recording("a");

        f.session.force_cleanup();

        // Preloaded but never played, so it goes.
        assert!(!f.session.cache().is_resident("kick"));
        assert_eq!(f.session.pool().metrics().free_buffers, 0);
    }

    #[tokio::test]
    async fn test_recover_engine_async() {
        let f = fixture();
        f.engine.fail_next_inits(1);
        assert!(f.session.recover_engine_async().await);
        assert_eq!(f.engine.init_calls(), 2);
    }
}
