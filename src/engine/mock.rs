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
use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::{clock::Clock, error::EngineError};

const DEFAULT_LATENCY_MICROS: i64 = 5_000;

/// A trigger received by the mock engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReceivedTrigger {
    pub pad: usize,
    pub velocity: f32,
    pub timestamp_micros: i64,
}

/// A mock engine. Doesn't make any sound, but records every call and can be told to fail.
#[derive(Clone)]
pub struct Engine {
    name: String,
    clock: Arc<dyn Clock>,
    initialized: Arc<AtomicBool>,
    init_calls: Arc<AtomicUsize>,
    failing_inits: Arc<AtomicU32>,
    loaded: Arc<Mutex<HashMap<String, PathBuf>>>,
    load_calls: Arc<AtomicUsize>,
    /// Loads beyond this many resident samples fail with out-of-memory.
    memory_limit: Arc<AtomicUsize>,
    triggers: Arc<Mutex<Vec<ReceivedTrigger>>>,
    failing_triggers: Arc<AtomicBool>,
    /// How long each trigger call blocks before it is accepted.
    trigger_delay: Arc<Mutex<Duration>>,
    load_delay: Arc<Mutex<Duration>>,
    unresponsive: Arc<AtomicBool>,
    latency_micros: Arc<AtomicI64>,
}

impl Engine {
    /// Creates a mock engine whose audio clock follows the given clock. The engine starts
    /// initialized.
    pub fn new(name: &str, clock: Arc<dyn Clock>) -> Engine {
        Engine {
            name: name.to_string(),
            clock,
            initialized: Arc::new(AtomicBool::new(true)),
            init_calls: Arc::new(AtomicUsize::new(0)),
            failing_inits: Arc::new(AtomicU32::new(0)),
            loaded: Arc::new(Mutex::new(HashMap::new())),
            load_calls: Arc::new(AtomicUsize::new(0)),
            memory_limit: Arc::new(AtomicUsize::new(usize::MAX)),
            triggers: Arc::new(Mutex::new(Vec::new())),
            failing_triggers: Arc::new(AtomicBool::new(false)),
            trigger_delay: Arc::new(Mutex::new(Duration::ZERO)),
            load_delay: Arc::new(Mutex::new(Duration::ZERO)),
            unresponsive: Arc::new(AtomicBool::new(false)),
            latency_micros: Arc::new(AtomicI64::new(DEFAULT_LATENCY_MICROS)),
        }
    }

    /// Sets the latency the engine reports.
    pub fn set_latency_micros(&self, latency: i64) {
        self.latency_micros.store(latency, Ordering::Relaxed);
    }

    /// The next `count` calls to initialize will fail.
    pub fn fail_next_inits(&self, count: u32) {
        self.failing_inits.store(count, Ordering::Relaxed);
    }

    /// Limits the number of samples that can be resident at once.
    pub fn set_memory_limit(&self, limit: usize) {
        self.memory_limit.store(limit, Ordering::Relaxed);
    }

    /// Makes every trigger call fail.
    pub fn set_failing_triggers(&self, failing: bool) {
        self.failing_triggers.store(failing, Ordering::Relaxed);
    }

    /// Makes every trigger call block for the given time, like a busy audio thread.
    pub fn set_trigger_delay(&self, delay: Duration) {
        *self.trigger_delay.lock() = delay;
    }

    /// Makes every sample load take at least the given time.
    pub fn set_load_delay(&self, delay: Duration) {
        *self.load_delay.lock() = delay;
    }

    /// Makes every call behave as if the engine had stopped responding.
    pub fn set_unresponsive(&self, unresponsive: bool) {
        self.unresponsive.store(unresponsive, Ordering::Relaxed);
    }

    /// Returns the number of initialize calls made so far.
    pub fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::Relaxed)
    }

    /// Returns the number of load calls made so far, successful or not.
    pub fn load_calls(&self) -> usize {
        self.load_calls.load(Ordering::Relaxed)
    }

    /// Returns true if the given sample is loaded.
    pub fn is_loaded(&self, sample_id: &str) -> bool {
        self.loaded.lock().contains_key(sample_id)
    }

    /// Returns the number of loaded samples.
    pub fn loaded_count(&self) -> usize {
        self.loaded.lock().len()
    }

    /// Returns every trigger received so far, in arrival order.
    pub fn triggers(&self) -> Vec<ReceivedTrigger> {
        self.triggers.lock().clone()
    }

    fn check_responsive(&self) -> Result<(), EngineError> {
        if self.unresponsive.load(Ordering::Relaxed) {
            return Err(EngineError::Native("engine did not respond".to_string()));
        }
        if !self.initialized.load(Ordering::Relaxed) {
            return Err(EngineError::NotInitialized);
        }
        Ok(())
    }
}

impl crate::engine::AudioEngine for Engine {
    fn initialize(
        &self,
        sample_rate: u32,
        buffer_size: usize,
        low_latency: bool,
    ) -> Result<(), EngineError> {
        self.init_calls.fetch_add(1, Ordering::Relaxed);
        let failing = self
            .failing_inits
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(EngineError::Native("device busy".to_string()));
        }

        self.unresponsive.store(false, Ordering::Relaxed);
        self.initialized.store(true, Ordering::Relaxed);
        info!(
            engine = self.name,
            sample_rate, buffer_size, low_latency, "Mock engine initialized."
        );
        Ok(())
    }

    fn load_sample(&self, sample_id: &str, path: &Path) -> Result<(), EngineError> {
        self.load_calls.fetch_add(1, Ordering::Relaxed);
        self.check_responsive()?;
        let delay = *self.load_delay.lock();
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        let mut loaded = self.loaded.lock();
        if !loaded.contains_key(sample_id)
            && loaded.len() >= self.memory_limit.load(Ordering::Relaxed)
        {
            return Err(EngineError::OutOfMemory(sample_id.to_string()));
        }
        loaded.insert(sample_id.to_string(), path.to_path_buf());
        debug!(engine = self.name, sample = sample_id, "Mock sample loaded.");
        Ok(())
    }

    fn unload_sample(&self, sample_id: &str) -> Result<(), EngineError> {
        self.check_responsive()?;
        self.loaded.lock().remove(sample_id);
        Ok(())
    }

    fn trigger(&self, pad: usize, velocity: f32, timestamp_micros: i64) -> Result<(), EngineError> {
        self.check_responsive()?;
        if self.failing_triggers.load(Ordering::Relaxed) {
            return Err(EngineError::Native("trigger queue full".to_string()));
        }
        let delay = *self.trigger_delay.lock();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        self.triggers.lock().push(ReceivedTrigger {
            pad,
            velocity,
            timestamp_micros,
        });
        Ok(())
    }

    fn reported_latency_micros(&self) -> i64 {
        self.latency_micros.load(Ordering::Relaxed)
    }

    fn current_audio_clock_micros(&self) -> i64 {
        self.clock.now_micros()
    }

    fn ping(&self) -> Result<(), EngineError> {
        self.check_responsive()
    }

    fn shutdown(&self) {
        self.initialized.store(false, Ordering::Relaxed);
        self.loaded.lock().clear();
        info!(engine = self.name, "Mock engine shut down.");
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (Mock)", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::engine::AudioEngine;

    fn engine() -> Engine {
        Engine::new("mock", Arc::new(ManualClock::new(0)))
    }

    #[test]
    fn test_fail_next_inits_counts_down() {
        let engine = engine();
        engine.fail_next_inits(2);
        assert!(engine.initialize(48000, 256, true).is_err());
        assert!(engine.initialize(48000, 256, true).is_err());
        assert!(engine.initialize(48000, 256, true).is_ok());
        assert_eq!(engine.init_calls(), 3);
    }

    #[test]
    fn test_memory_limit() {
        let engine = engine();
        engine.set_memory_limit(1);
        assert!(engine.load_sample("kick", Path::new("kick.wav")).is_ok());
        assert_eq!(
            engine.load_sample("snare", Path::new("snare.wav")),
            Err(EngineError::OutOfMemory("snare".to_string()))
        );
        // Reloading a resident sample doesn't need more memory.
        assert!(engine.load_sample("kick", Path::new("kick.wav")).is_ok());
    }

    #[test]
    fn test_shutdown_drops_samples() {
        let engine = engine();
        engine.load_sample("kick", Path::new("kick.wav")).unwrap();
        engine.shutdown();
        assert_eq!(engine.loaded_count(), 0);
        assert_eq!(engine.trigger(0, 1.0, 0), Err(EngineError::NotInitialized));
    }
}
