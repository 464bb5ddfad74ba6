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

//! Sample cache manager.
//!
//! Keeps a bounded set of samples resident in the audio engine and evicts the least
//! recently used entry when a new sample needs a slot. Engine and repository calls are
//! made without holding the cache lock, so residency checks from the dispatcher never
//! wait on a load. A slot is reserved for a sample while it loads, which keeps the
//! resident count plus in-flight loads within capacity.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, info, span, warn, Level};

use crate::cancel::{CancelHandle, LoopHandle};
use crate::clock::{micros, Clock};
use crate::engine::AudioEngine;
use crate::error::{CacheError, EngineError};
use crate::governor::{Mitigation, OptimizationKind};
use crate::recovery::RecoveryListener;
use crate::repository::{SampleMetadata, SampleRepository};

/// How often the preload worker checks for cancellation while idle.
const PRELOAD_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone, Debug, PartialEq)]
pub struct CacheSettings {
    pub max_entries: usize,
    /// Capacity while the governor asks for a smaller cache.
    pub reduced_max_entries: usize,
    /// Entries not accessed for this long are unloaded when inactive caches are dropped.
    pub inactive_after: Duration,
    /// Assumed load time for samples that have never been loaded.
    pub load_estimate: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            max_entries: 32,
            reduced_max_entries: 16,
            inactive_after: Duration::from_secs(30),
            load_estimate: Duration::from_millis(15),
        }
    }
}

/// A sample tracked by the cache. Every entry in the cache is resident in the engine.
#[derive(Clone, Debug, Serialize)]
pub struct CacheEntry {
    pub sample_id: String,
    pub metadata: SampleMetadata,
    pub path: PathBuf,
    pub resident: bool,
    pub last_access_micros: i64,
    pub load_duration_micros: i64,
    /// Accesses since the entry was loaded or last survived an emergency cleanup.
    pub recent_accesses: u32,
    /// Orders entries whose access timestamps are equal.
    touch_seq: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheMetrics {
    pub resident: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub load_failures: u64,
    pub emergency_cleanups: u64,
}

struct State {
    entries: HashMap<String, CacheEntry>,
    loading: HashSet<String>,
    queued: HashSet<String>,
    load_history: HashMap<String, i64>,
    capacity: usize,
    next_seq: u64,
    /// Bumped whenever the engine loses its samples. Loads that straddle a bump are discarded.
    generation: u64,
    metrics: CacheMetrics,
}

impl State {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn lru(&self) -> Option<String> {
        self.entries
            .values()
            .min_by_key(|entry| (entry.last_access_micros, entry.touch_seq))
            .map(|entry| entry.sample_id.clone())
    }

    fn touch(&mut self, sample_id: &str, now: i64) -> bool {
        let seq = self.next_seq();
        match self.entries.get_mut(sample_id) {
            Some(entry) => {
                entry.last_access_micros = now;
                entry.touch_seq = seq;
                entry.recent_accesses = entry.recent_accesses.saturating_add(1);
                true
            }
            None => false,
        }
    }

    /// Removes least recently used entries until at most `capacity` remain.
    fn shrink_to(&mut self, capacity: usize) -> Vec<String> {
        let mut victims = Vec::new();
        while self.entries.len() > capacity {
            let Some(victim) = self.lru() else {
                break;
            };
            self.entries.remove(&victim);
            self.metrics.evictions += 1;
            victims.push(victim);
        }
        victims
    }
}

pub struct SampleCache {
    settings: CacheSettings,
    clock: Arc<dyn Clock>,
    engine: Arc<dyn AudioEngine>,
    repository: Arc<dyn SampleRepository>,
    state: Mutex<State>,
    load_finished: Condvar,
    preload_tx: Sender<String>,
    preload_rx: Receiver<String>,
}

impl SampleCache {
    pub fn new(
        settings: CacheSettings,
        clock: Arc<dyn Clock>,
        engine: Arc<dyn AudioEngine>,
        repository: Arc<dyn SampleRepository>,
    ) -> SampleCache {
        let (preload_tx, preload_rx) = crossbeam_channel::unbounded();
        let capacity = settings.max_entries.max(1);
        SampleCache {
            settings,
            clock,
            engine,
            repository,
            state: Mutex::new(State {
                entries: HashMap::new(),
                loading: HashSet::new(),
                queued: HashSet::new(),
                load_history: HashMap::new(),
                capacity,
                next_seq: 0,
                generation: 0,
                metrics: CacheMetrics {
                    capacity,
                    ..Default::default()
                },
            }),
            load_finished: Condvar::new(),
            preload_tx,
            preload_rx,
        }
    }

    /// Makes sure the sample is resident, loading it synchronously if it isn't, and marks
    /// it as used.
    pub fn ensure_loaded(&self, sample_id: &str) -> Result<(), CacheError> {
        {
            let mut state = self.state.lock();
            if state.touch(sample_id, self.clock.now_micros()) {
                state.metrics.hits += 1;
                return Ok(());
            }
            state.metrics.misses += 1;
        }

        self.preload(sample_id)?;
        self.state.lock().touch(sample_id, self.clock.now_micros());
        Ok(())
    }

    /// Loads the sample into the engine without marking it as used. Evicts the least
    /// recently used sample first if the cache is full.
    pub fn preload(&self, sample_id: &str) -> Result<(), CacheError> {
        let (victim, generation) = {
            let mut state = self.state.lock();
            while state.loading.contains(sample_id) {
                self.load_finished.wait(&mut state);
            }
            if state.entries.contains_key(sample_id) {
                return Ok(());
            }

            let victim = if state.entries.len() + state.loading.len() >= state.capacity {
                match state.lru() {
                    Some(victim) => {
                        state.entries.remove(&victim);
                        state.metrics.evictions += 1;
                        Some(victim)
                    }
                    None => {
                        state.metrics.load_failures += 1;
                        return Err(CacheError::LoadFailed {
                            sample_id: sample_id.to_string(),
                            reason: "every cache slot is busy loading".to_string(),
                        });
                    }
                }
            } else {
                None
            };
            state.loading.insert(sample_id.to_string());
            (victim, state.generation)
        };

        let outcome = match victim {
            Some(victim) => self
                .unload(&victim)
                .and_then(|_| self.load(sample_id)),
            None => self.load(sample_id),
        };

        let mut state = self.state.lock();
        state.loading.remove(sample_id);
        let result = match outcome {
            Ok((metadata, path, load_micros)) if state.generation == generation => {
                let seq = state.next_seq();
                state.load_history.insert(sample_id.to_string(), load_micros);
                state.entries.insert(
                    sample_id.to_string(),
                    CacheEntry {
                        sample_id: sample_id.to_string(),
                        metadata,
                        path,
                        resident: true,
                        last_access_micros: self.clock.now_micros(),
                        load_duration_micros: load_micros,
                        recent_accesses: 0,
                        touch_seq: seq,
                    },
                );
                Ok(())
            }
            Ok(_) => Err(CacheError::LoadFailed {
                sample_id: sample_id.to_string(),
                reason: "engine was reset during the load".to_string(),
            }),
            Err(e) => Err(e),
        };
        if result.is_err() {
            state.metrics.load_failures += 1;
        }
        self.load_finished.notify_all();
        result
    }

    /// Resolves and loads a sample. Called without the cache lock held.
    fn load(&self, sample_id: &str) -> Result<(SampleMetadata, PathBuf, i64), CacheError> {
        let (metadata, path) = self.repository.resolve(sample_id)?;

        let start = Instant::now();
        match self.engine.load_sample(sample_id, &path) {
            Ok(()) => {
                let load_micros = micros(start.elapsed());
                info!(
                    sample = sample_id,
                    load_us = load_micros,
                    size_kb = metadata.size_bytes / 1024,
                    "Sample loaded"
                );
                Ok((metadata, path, load_micros))
            }
            Err(EngineError::OutOfMemory(reason)) => {
                warn!(sample = sample_id, "Engine out of memory, running emergency cleanup");
                self.emergency_cleanup();
                Err(CacheError::LoadFailed {
                    sample_id: sample_id.to_string(),
                    reason: format!("out of memory: {}", reason),
                })
            }
            Err(e) => {
                warn!(sample = sample_id, error = %e, "Failed to load sample");
                Err(CacheError::LoadFailed {
                    sample_id: sample_id.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    fn unload(&self, sample_id: &str) -> Result<(), CacheError> {
        match self.engine.unload_sample(sample_id) {
            Ok(()) => {
                debug!(sample = sample_id, "Sample unloaded");
                Ok(())
            }
            Err(e) => {
                warn!(sample = sample_id, error = %e, "Failed to unload sample");
                Err(CacheError::EvictionFailed {
                    sample_id: sample_id.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    fn unload_all(&self, victims: Vec<String>) -> usize {
        let count = victims.len();
        for victim in victims {
            // Failures are logged by unload; the entry is gone either way.
            let _ = self.unload(&victim);
        }
        count
    }

    /// Unloads the sample and forgets it. Releasing a sample that isn't cached is a no-op. A
    /// load in flight is waited for first so the sample doesn't come back after the release.
    pub fn release(&self, sample_id: &str) -> Result<(), CacheError> {
        let removed = {
            let mut state = self.state.lock();
            while state.loading.contains(sample_id) {
                self.load_finished.wait(&mut state);
            }
            state.entries.remove(sample_id).is_some()
        };
        if !removed {
            return Ok(());
        }
        self.unload(sample_id)
    }

    /// Marks the sample as used. Returns false if it isn't resident.
    pub fn touch(&self, sample_id: &str) -> bool {
        self.state.lock().touch(sample_id, self.clock.now_micros())
    }

    pub fn is_resident(&self, sample_id: &str) -> bool {
        self.state
            .lock()
            .entries
            .get(sample_id)
            .is_some_and(|entry| entry.resident)
    }

    /// How long loading the sample is expected to take, from its last load if there was one.
    pub fn expected_load_micros(&self, sample_id: &str) -> i64 {
        self.state
            .lock()
            .load_history
            .get(sample_id)
            .copied()
            .unwrap_or_else(|| micros(self.settings.load_estimate))
    }

    /// Queues a best-effort background load. Returns false if the sample is already
    /// resident, loading or queued.
    pub fn request_preload(&self, sample_id: &str) -> bool {
        let mut state = self.state.lock();
        if state.entries.contains_key(sample_id)
            || state.loading.contains(sample_id)
            || !state.queued.insert(sample_id.to_string())
        {
            return false;
        }
        // The receiver lives as long as the cache.
        let _ = self.preload_tx.send(sample_id.to_string());
        true
    }

    /// Runs every queued preload on the calling thread. Returns how many were processed.
    pub fn run_pending_preloads(&self) -> usize {
        let mut processed = 0;
        while let Ok(sample_id) = self.preload_rx.try_recv() {
            self.handle_preload(&sample_id);
            processed += 1;
        }
        processed
    }

    fn handle_preload(&self, sample_id: &str) {
        self.state.lock().queued.remove(sample_id);
        if let Err(e) = self.preload(sample_id) {
            warn!(sample = sample_id, error = %e, "Background preload failed");
        }
    }

    /// Starts the background preload worker.
    pub fn start_preloader(self: &Arc<Self>) -> LoopHandle {
        let cancel = CancelHandle::new();
        let cache = self.clone();
        let join = {
            let cancel = cancel.clone();
            thread::spawn(move || {
                let span = span!(Level::INFO, "preloader");
                let _enter = span.enter();
                info!("Preload worker started.");
                while !cancel.is_cancelled() {
                    match cache.preload_rx.recv_timeout(PRELOAD_POLL_INTERVAL) {
                        Ok(sample_id) => cache.handle_preload(&sample_id),
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!("Preload worker stopped.");
            })
        };
        LoopHandle::new("preloader", cancel, join)
    }

    /// Unloads entries that haven't been accessed within the inactivity window.
    pub fn unload_inactive(&self, now_micros: i64) -> usize {
        let cutoff = now_micros - micros(self.settings.inactive_after);
        let victims: Vec<String> = {
            let mut state = self.state.lock();
            let victims: Vec<String> = state
                .entries
                .values()
                .filter(|entry| entry.last_access_micros < cutoff)
                .map(|entry| entry.sample_id.clone())
                .collect();
            for victim in victims.iter() {
                state.entries.remove(victim);
                state.metrics.evictions += 1;
            }
            victims
        };
        if !victims.is_empty() {
            info!(count = victims.len(), "Unloaded inactive samples");
        }
        self.unload_all(victims)
    }

    /// Changes the capacity, evicting least recently used entries if the cache is over it.
    pub fn set_capacity(&self, capacity: usize) {
        let capacity = capacity.max(1);
        let victims = {
            let mut state = self.state.lock();
            if state.capacity == capacity {
                return;
            }
            info!(from = state.capacity, to = capacity, "Cache capacity changed");
            state.capacity = capacity;
            state.metrics.capacity = capacity;
            state.shrink_to(capacity)
        };
        self.unload_all(victims);
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    /// Drops every entry that hasn't been accessed since the last cleanup.
    pub fn emergency_cleanup(&self) -> usize {
        let victims = {
            let mut state = self.state.lock();
            let victims: Vec<String> = state
                .entries
                .values()
                .filter(|entry| entry.recent_accesses == 0)
                .map(|entry| entry.sample_id.clone())
                .collect();
            for victim in victims.iter() {
                state.entries.remove(victim);
                state.metrics.evictions += 1;
            }
            for entry in state.entries.values_mut() {
                entry.recent_accesses = 0;
            }
            state.metrics.emergency_cleanups += 1;
            victims
        };
        warn!(count = victims.len(), "Emergency cache cleanup");
        self.unload_all(victims)
    }

    /// Forgets every entry without unloading. Used when the engine has lost its samples.
    pub fn invalidate_residency(&self) {
        let mut state = self.state.lock();
        state.generation += 1;
        let dropped = state.entries.len();
        state.entries.clear();
        info!(dropped, "Sample residency invalidated");
    }

    pub fn metrics(&self) -> CacheMetrics {
        let state = self.state.lock();
        CacheMetrics {
            resident: state.entries.len(),
            ..state.metrics
        }
    }

    /// Returns every entry, least recently used first.
    pub fn entries(&self) -> Vec<CacheEntry> {
        let mut entries: Vec<CacheEntry> = self.state.lock().entries.values().cloned().collect();
        entries.sort_by_key(|entry| (entry.last_access_micros, entry.touch_seq));
        entries
    }
}

impl Mitigation for SampleCache {
    fn apply(&self, active: &BTreeSet<OptimizationKind>, now_micros: i64) {
        if active.contains(&OptimizationKind::ReduceCacheSize) {
            self.set_capacity(self.settings.reduced_max_entries);
        } else {
            self.set_capacity(self.settings.max_entries);
        }
        if active.contains(&OptimizationKind::UnloadInactiveCaches) {
            self.unload_inactive(now_micros);
        }
        if active.contains(&OptimizationKind::AggressiveMemoryCleanup) {
            self.emergency_cleanup();
        }
    }

    fn force_cleanup(&self) {
        self.emergency_cleanup();
    }
}

impl RecoveryListener for SampleCache {
    fn engine_lost(&self) {
        self.invalidate_residency();
    }

    fn engine_recovered(&self) {
        self.invalidate_residency();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::engine::mock;
    use crate::repository::StaticRepository;

    struct Fixture {
        cache: Arc<SampleCache>,
        clock: Arc<ManualClock>,
        engine: mock::Engine,
    }

    fn fixture(max_entries: usize) -> Fixture {
        let clock = Arc::new(ManualClock::new(0));
        let engine = mock::Engine::new("mock", clock.clone());
        let repository = Arc::new(StaticRepository::new());
        for id in ["a", "b", "c", "d", "e", "f"] {
            repository.insert_synthetic(id);
        }
        let settings = CacheSettings {
            max_entries,
            reduced_max_entries: 2,
            ..Default::default()
        };
        let cache = Arc::new(SampleCache::new(
            settings,
            clock.clone(),
            Arc::new(engine.clone()),
            repository,
        ));
        Fixture {
            cache,
            clock,
            engine,
        }
    }

    #[test]
    fn test_lru_evicts_least_recently_used() {
        let f = fixture(3);
        for id in ["a", "b", "c", "a"] {
            f.clock.advance(Duration::from_millis(1));
            f.cache.ensure_loaded(id).unwrap();
        }

        f.clock.advance(Duration::from_millis(1));
        f.cache.ensure_loaded("d").unwrap();

        assert!(f.cache.is_resident("a"));
        assert!(!f.cache.is_resident("b"));
        assert!(f.cache.is_resident("c"));
        assert!(f.cache.is_resident("d"));
        assert!(!f.engine.is_loaded("b"));
    }

    #[test]
    fn test_equal_timestamps_evict_oldest_first() {
        let f = fixture(2);
        f.cache.preload("a").unwrap();
        f.cache.preload("b").unwrap();
        f.cache.preload("c").unwrap();

        assert!(!f.cache.is_resident("a"));
        assert!(f.cache.is_resident("b"));
        assert!(f.cache.is_resident("c"));
    }

    #[test]
    fn test_occupancy_never_exceeds_capacity() {
        let f = fixture(3);
        for (i, id) in ["a", "b", "c", "d", "e", "f", "b", "a", "e"]
            .iter()
            .enumerate()
        {
            f.clock.set(i as i64 * 1000);
            f.cache.ensure_loaded(id).unwrap();
            assert!(f.cache.metrics().resident <= 3);
            assert!(f.engine.loaded_count() <= 3);
        }
        assert_eq!(f.cache.metrics().evictions, 6);
    }

    #[test]
    fn test_ensure_loaded_counts_hits_and_misses() {
        let f = fixture(4);
        f.cache.ensure_loaded("a").unwrap();
        f.cache.ensure_loaded("a").unwrap();
        let metrics = f.cache.metrics();
        assert_eq!(metrics.misses, 1);
        assert_eq!(metrics.hits, 1);
        assert_eq!(f.engine.load_calls(), 1);
    }

    #[test]
    fn test_unknown_sample_fails_to_resolve() {
        let f = fixture(4);
        assert!(matches!(
            f.cache.ensure_loaded("missing"),
            Err(CacheError::Resolve(_))
        ));
        assert_eq!(f.cache.metrics().load_failures, 1);
    }

    #[test]
    fn test_out_of_memory_triggers_emergency_cleanup() {
        let f = fixture(8);
        f.engine.set_memory_limit(2);
        f.cache.ensure_loaded("a").unwrap();
        f.cache.preload("b").unwrap();

        let result = f.cache.preload("c");
        assert!(matches!(result, Err(CacheError::LoadFailed { .. })));
        // "b" was never used and is dropped; "a" survives.
        assert!(f.cache.is_resident("a"));
        assert!(!f.cache.is_resident("b"));
        assert_eq!(f.cache.metrics().emergency_cleanups, 1);

        // Not retried automatically, but there is room now.
        f.cache.preload("c").unwrap();
    }

    #[test]
    fn test_release_is_idempotent() {
        let f = fixture(4);
        f.cache.ensure_loaded("a").unwrap();
        f.cache.release("a").unwrap();
        f.cache.release("a").unwrap();
        assert!(!f.engine.is_loaded("a"));
        assert_eq!(f.cache.metrics().resident, 0);
    }

    #[test]
    fn test_release_waits_for_load_in_flight() {
        let f = fixture(4);
        f.engine.set_load_delay(Duration::from_millis(200));
        let loader = {
            let cache = f.cache.clone();
            thread::spawn(move || cache.preload("a"))
        };
        let engine = f.engine.clone();
        crate::testutil::eventually(|| engine.load_calls() == 1, "Load never started");

        f.cache.release("a").unwrap();

        assert!(loader.join().unwrap().is_ok());
        assert!(!f.cache.is_resident("a"));
        assert!(!f.engine.is_loaded("a"));
    }

    #[test]
    fn test_reduce_cache_size_mitigation() {
        let f = fixture(4);
        for id in ["a", "b", "c", "d"] {
            f.clock.advance(Duration::from_millis(1));
            f.cache.ensure_loaded(id).unwrap();
        }

        f.cache.apply(&BTreeSet::from([OptimizationKind::ReduceCacheSize]), 0);
        assert_eq!(f.cache.capacity(), 2);
        assert!(f.cache.is_resident("c"));
        assert!(f.cache.is_resident("d"));
        assert_eq!(f.engine.loaded_count(), 2);

        f.cache.apply(&BTreeSet::new(), 0);
        assert_eq!(f.cache.capacity(), 4);
    }

    #[test]
    fn test_unload_inactive() {
        let f = fixture(4);
        f.cache.ensure_loaded("a").unwrap();
        f.clock.advance(Duration::from_secs(20));
        f.cache.ensure_loaded("b").unwrap();
        f.clock.advance(Duration::from_secs(15));

        let now = f.clock.now_micros();
        assert_eq!(f.cache.unload_inactive(now), 1);
        assert!(!f.cache.is_resident("a"));
        assert!(f.cache.is_resident("b"));
    }

    #[test]
    fn test_background_preload() {
        let f = fixture(4);
        assert!(f.cache.request_preload("a"));
        assert!(!f.cache.request_preload("a"));
        assert_eq!(f.cache.run_pending_preloads(), 1);
        assert!(f.cache.is_resident("a"));
        assert!(!f.cache.request_preload("a"));
    }

    #[test]
    fn test_preload_worker_thread() {
        let f = fixture(4);
        let handle = f.cache.start_preloader();
        f.cache.request_preload("e");
        let cache = f.cache.clone();
        crate::testutil::eventually(|| cache.is_resident("e"), "Sample never preloaded");
        handle.stop();
    }

    #[test]
    fn test_invalidate_residency() {
        let f = fixture(4);
        f.cache.ensure_loaded("a").unwrap();
        f.cache.engine_lost();
        assert!(!f.cache.is_resident("a"));
        assert!(f.cache.entries().is_empty());
    }

    #[test]
    fn test_expected_load_uses_history() {
        let f = fixture(4);
        assert_eq!(f.cache.expected_load_micros("a"), 15_000);
        f.cache.preload("a").unwrap();
        assert!(f.cache.expected_load_micros("a") < 15_000);
    }
}
