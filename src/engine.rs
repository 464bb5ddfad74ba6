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

//! The boundary to the low-latency audio engine.
//!
//! The engine itself runs on its own real-time thread. Nothing in this crate calls into it
//! from that thread; every call here is made from background bookkeeping threads.

use std::error::Error;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::clock::Clock;
use crate::error::EngineError;

pub mod mock;

/// Parameters the engine is (re)initialized with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineSettings {
    pub sample_rate: u32,
    pub buffer_size: usize,
    pub low_latency: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            sample_rate: 48000,
            buffer_size: 256,
            low_latency: true,
        }
    }
}

pub trait AudioEngine: fmt::Display + Send + Sync {
    /// Brings the engine up. Called once at startup and again by recovery.
    fn initialize(
        &self,
        sample_rate: u32,
        buffer_size: usize,
        low_latency: bool,
    ) -> Result<(), EngineError>;

    /// Loads a sample's audio data so it becomes playable.
    fn load_sample(&self, sample_id: &str, path: &Path) -> Result<(), EngineError>;

    /// Removes a sample from the engine's playable memory.
    fn unload_sample(&self, sample_id: &str) -> Result<(), EngineError>;

    /// Queues a pad hit at the given engine-clock timestamp.
    fn trigger(&self, pad: usize, velocity: f32, timestamp_micros: i64) -> Result<(), EngineError>;

    /// The output latency last measured by the engine.
    fn reported_latency_micros(&self) -> i64;

    /// The engine's audio clock, in the same timebase as trigger timestamps.
    fn current_audio_clock_micros(&self) -> i64;

    /// A cheap round trip used for health checks.
    fn ping(&self) -> Result<(), EngineError>;

    /// Tears the engine down. Loaded samples are lost.
    fn shutdown(&self);
}

/// Gets an engine with the given name. Only the in-process mock engine ships with this crate;
/// native engines are provided by the embedding application.
pub fn get_engine(name: &str, clock: Arc<dyn Clock>) -> Result<Arc<dyn AudioEngine>, Box<dyn Error>> {
    if name.starts_with("mock") {
        return Ok(Arc::new(mock::Engine::new(name, clock)));
    }

    Err(format!("no audio engine named {} is available", name).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn test_get_mock_engine() {
        let engine = get_engine("mock-engine", Arc::new(ManualClock::new(0))).unwrap();
        assert_eq!(engine.to_string(), "mock-engine (Mock)");
    }

    #[test]
    fn test_get_unknown_engine() {
        assert!(get_engine("oboe", Arc::new(ManualClock::new(0))).is_err());
    }
}
