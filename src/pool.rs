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

//! Recording buffer pool.
//!
//! Hands out sample buffers for in-progress recordings and keeps released ones around for
//! reuse. Allocation never waits: under memory pressure it declines immediately.

use std::collections::HashMap;
use std::mem;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, span, warn, Level};

use crate::cancel::{CancelHandle, LoopHandle};
use crate::clock::{micros, Clock};
use crate::error::AllocationError;
use crate::governor::{Mitigation, PerformanceSample};

const BYTES_PER_SAMPLE: u64 = mem::size_of::<f32>() as u64;

#[derive(Clone, Debug, PartialEq)]
pub struct PoolSettings {
    pub max_free_buffers: usize,
    /// Upper bound on the bytes held by buffers that haven't been released.
    pub ceiling_bytes: u64,
    pub critical_memory_percent: f32,
    pub sweep_interval: Duration,
    /// Active buffers untouched for longer than this are reclaimed.
    pub idle_timeout: Duration,
    /// Sweeps in a row under critical memory pressure before the free list is dropped.
    pub sustained_pressure_ticks: u32,
}

impl Default for PoolSettings {
    fn default() -> Self {
        PoolSettings {
            max_free_buffers: 10,
            ceiling_bytes: 256 * 1024 * 1024,
            critical_memory_percent: 90.0,
            sweep_interval: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(30),
            sustained_pressure_ticks: 3,
        }
    }
}

/// Describes an active recording buffer.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BufferInfo {
    pub id: String,
    pub size_bytes: u64,
    pub sample_rate: u32,
    pub channels: u16,
    pub allocated_at_micros: i64,
    pub last_access_micros: i64,
    pub samples_written: usize,
    /// True if the memory came from the free list.
    pub reused: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolMetrics {
    pub active_buffers: usize,
    pub free_buffers: usize,
    pub bytes_in_use: u64,
    pub allocations: u64,
    pub reused: u64,
    pub declined_pressure: u64,
    pub declined_exhausted: u64,
    pub force_released: u64,
    pub discarded: u64,
    pub free_list_clears: u64,
}

/// A block of sample memory with the format it was allocated for.
struct Block {
    samples: Vec<f32>,
    capacity_bytes: u64,
    sample_rate: u32,
    channels: u16,
}

impl Block {
    fn fits(&self, size_bytes: u64, sample_rate: u32, channels: u16) -> bool {
        self.capacity_bytes >= size_bytes
            && self.sample_rate == sample_rate
            && self.channels == channels
    }
}

struct RecordingBuffer {
    info: BufferInfo,
    block: Block,
}

#[derive(Default)]
struct State {
    active: HashMap<String, RecordingBuffer>,
    free: Vec<Block>,
    pressure_ticks: u32,
    metrics: PoolMetrics,
}

impl State {
    fn bytes_in_use(&self) -> u64 {
        self.active.values().map(|buffer| buffer.info.size_bytes).sum()
    }

    /// Returns a block to the free list, or drops it if the list is full.
    fn recycle(&mut self, mut block: Block, max_free: usize) {
        if self.free.len() < max_free {
            block.samples.clear();
            self.free.push(block);
        } else {
            self.metrics.discarded += 1;
        }
    }
}

pub struct BufferPool {
    settings: PoolSettings,
    clock: Arc<dyn Clock>,
    pressure: watch::Receiver<PerformanceSample>,
    state: Mutex<State>,
}

impl BufferPool {
    /// Creates a pool that reads memory pressure from the given telemetry stream.
    pub fn new(
        settings: PoolSettings,
        clock: Arc<dyn Clock>,
        pressure: watch::Receiver<PerformanceSample>,
    ) -> BufferPool {
        BufferPool {
            settings,
            clock,
            pressure,
            state: Mutex::new(State::default()),
        }
    }

    fn memory_usage_percent(&self) -> f32 {
        self.pressure.borrow().memory_usage_percent
    }

    /// Hands out a buffer for a new recording, reusing a released block with the same format
    /// if one is big enough.
    pub fn allocate(
        &self,
        id: &str,
        size_bytes: u64,
        sample_rate: u32,
        channels: u16,
    ) -> Result<BufferInfo, AllocationError> {
        let percent = self.memory_usage_percent();
        if percent >= self.settings.critical_memory_percent {
            self.state.lock().metrics.declined_pressure += 1;
            warn!(id, percent, "Declined recording buffer under memory pressure");
            return Err(AllocationError::MemoryPressure { percent });
        }

        let now = self.clock.now_micros();
        let mut state = self.state.lock();
        if state.active.contains_key(id) {
            return Err(AllocationError::DuplicateId(id.to_string()));
        }

        let in_use = state.bytes_in_use();
        // Usage stays strictly below the ceiling.
        if in_use.saturating_add(size_bytes) >= self.settings.ceiling_bytes {
            state.metrics.declined_exhausted += 1;
            warn!(id, requested = size_bytes, in_use, "Recording pool ceiling reached");
            return Err(AllocationError::PoolExhausted {
                requested: size_bytes,
                in_use,
                ceiling: self.settings.ceiling_bytes,
            });
        }

        let reusable = state
            .free
            .iter()
            .enumerate()
            .filter(|(_, block)| block.fits(size_bytes, sample_rate, channels))
            .min_by_key(|(_, block)| block.capacity_bytes)
            .map(|(idx, _)| idx);

        let (block, reused) = match reusable {
            Some(idx) => (state.free.swap_remove(idx), true),
            None => {
                let mut samples = Vec::new();
                let len = usize::try_from(size_bytes.div_ceil(BYTES_PER_SAMPLE)).unwrap_or(usize::MAX);
                if samples.try_reserve_exact(len).is_err() {
                    state.metrics.declined_exhausted += 1;
                    warn!(id, requested = size_bytes, "Recording buffer allocation failed");
                    return Err(AllocationError::PoolExhausted {
                        requested: size_bytes,
                        in_use,
                        ceiling: self.settings.ceiling_bytes,
                    });
                }
                let block = Block {
                    samples,
                    capacity_bytes: size_bytes,
                    sample_rate,
                    channels,
                };
                (block, false)
            }
        };

        let info = BufferInfo {
            id: id.to_string(),
            size_bytes,
            sample_rate,
            channels,
            allocated_at_micros: now,
            last_access_micros: now,
            samples_written: 0,
            reused,
        };
        state.metrics.allocations += 1;
        if reused {
            state.metrics.reused += 1;
        }
        state.active.insert(
            id.to_string(),
            RecordingBuffer {
                info: info.clone(),
                block,
            },
        );
        debug!(id, size_bytes, reused, "Recording buffer allocated");
        Ok(info)
    }

    /// Appends samples to an active buffer. Returns how many fit, or None if the buffer
    /// isn't active.
    pub fn write(&self, id: &str, samples: &[f32]) -> Option<usize> {
        let now = self.clock.now_micros();
        let mut state = self.state.lock();
        let buffer = state.active.get_mut(id)?;
        let limit = usize::try_from(buffer.info.size_bytes / BYTES_PER_SAMPLE).unwrap_or(usize::MAX);
        let room = limit.saturating_sub(buffer.block.samples.len());
        let written = room.min(samples.len());
        buffer.block.samples.extend_from_slice(&samples[..written]);
        buffer.info.samples_written += written;
        buffer.info.last_access_micros = now;
        Some(written)
    }

    /// Marks a buffer as in use. Returns false if it isn't active.
    pub fn touch(&self, id: &str) -> bool {
        let now = self.clock.now_micros();
        match self.state.lock().active.get_mut(id) {
            Some(buffer) => {
                buffer.info.last_access_micros = now;
                true
            }
            None => false,
        }
    }

    /// Returns the buffer to the pool. Returns false if it wasn't active.
    pub fn release(&self, id: &str) -> bool {
        let mut state = self.state.lock();
        let Some(buffer) = state.active.remove(id) else {
            return false;
        };
        state.recycle(buffer.block, self.settings.max_free_buffers);
        debug!(id, free = state.free.len(), "Recording buffer released");
        true
    }

    /// Removes a buffer from the pool and hands its recorded samples to the caller.
    pub fn take(&self, id: &str) -> Option<Vec<f32>> {
        self.state
            .lock()
            .active
            .remove(id)
            .map(|buffer| buffer.block.samples)
    }

    pub fn info(&self, id: &str) -> Option<BufferInfo> {
        self.state
            .lock()
            .active
            .get(id)
            .map(|buffer| buffer.info.clone())
    }

    /// Periodic maintenance: reclaims abandoned buffers, trims the free list and drops it
    /// entirely once memory pressure has persisted.
    pub fn sweep(&self, now_micros: i64) {
        let idle_cutoff = now_micros - micros(self.settings.idle_timeout);
        let under_pressure = self.memory_usage_percent() >= self.settings.critical_memory_percent;

        let mut state = self.state.lock();
        let abandoned: Vec<String> = state
            .active
            .values()
            .filter(|buffer| buffer.info.last_access_micros < idle_cutoff)
            .map(|buffer| buffer.info.id.clone())
            .collect();
        for id in abandoned {
            if let Some(buffer) = state.active.remove(&id) {
                warn!(id = %id, "Reclaiming abandoned recording buffer");
                state.metrics.force_released += 1;
                state.recycle(buffer.block, self.settings.max_free_buffers);
            }
        }

        let max_free = self.settings.max_free_buffers;
        if state.free.len() > max_free {
            let excess = (state.free.len() - max_free) as u64;
            state.free.truncate(max_free);
            state.metrics.discarded += excess;
        }

        if under_pressure {
            state.pressure_ticks += 1;
        } else {
            state.pressure_ticks = 0;
        }
        if state.pressure_ticks >= self.settings.sustained_pressure_ticks && !state.free.is_empty()
        {
            info!(
                ticks = state.pressure_ticks,
                "Sustained memory pressure, dropping free recording buffers"
            );
            Self::drop_free_list(&mut state);
        }
    }

    fn drop_free_list(state: &mut State) -> usize {
        let dropped = state.free.len();
        state.free = Vec::new();
        state.metrics.free_list_clears += 1;
        dropped
    }

    /// Drops every pooled block. Active buffers are untouched.
    pub fn clear_free_list(&self) -> usize {
        let dropped = Self::drop_free_list(&mut self.state.lock());
        info!(dropped, "Recording free list cleared");
        dropped
    }

    /// Starts the periodic sweep.
    pub fn start_sweeper(self: &Arc<Self>) -> LoopHandle {
        let cancel = CancelHandle::new();
        let pool = self.clone();
        let join = {
            let cancel = cancel.clone();
            thread::spawn(move || {
                let span = span!(Level::INFO, "buffer sweep");
                let _enter = span.enter();
                info!(interval = ?pool.settings.sweep_interval, "Buffer sweep started.");
                while !cancel.wait_timeout(pool.settings.sweep_interval) {
                    pool.sweep(pool.clock.now_micros());
                }
                info!("Buffer sweep stopped.");
            })
        };
        LoopHandle::new("buffer sweep", cancel, join)
    }

    pub fn metrics(&self) -> PoolMetrics {
        let state = self.state.lock();
        PoolMetrics {
            active_buffers: state.active.len(),
            free_buffers: state.free.len(),
            bytes_in_use: state.bytes_in_use(),
            ..state.metrics
        }
    }
}

impl Mitigation for BufferPool {
    fn force_cleanup(&self) {
        self.clear_free_list();
    }
}
