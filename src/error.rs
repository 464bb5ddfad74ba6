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

//! Error types shared across the scheduler, caches and recovery paths.
//!
//! Scheduling and allocation errors are local and non-fatal: they are counted and
//! surfaced as metrics. Only [`EngineFailure`] escalates to the recovery coordinator.

/// Errors returned by calls across the audio engine boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("engine is not initialized")]
    NotInitialized,

    #[error("engine ran out of memory while loading {0}")]
    OutOfMemory(String),

    #[error("sample {0} is not loaded in the engine")]
    SampleNotLoaded(String),

    #[error("native engine error: {0}")]
    Native(String),

    #[error("engine I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Io(e.to_string())
    }
}

/// Errors produced while converting steps into hardware triggers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulingError {
    #[error("sample for pad {pad} is not resident")]
    SampleNotReady { pad: usize },

    #[error("engine call failed: {0}")]
    EngineCallFailed(#[from] EngineError),
}

/// Errors produced by the recording buffer pool. None are retried by the pool.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AllocationError {
    #[error("recording pool exhausted: requested {requested} bytes with {in_use} of {ceiling} in use")]
    PoolExhausted {
        requested: u64,
        in_use: u64,
        ceiling: u64,
    },

    #[error("cannot record, low memory ({percent:.0}% used)")]
    MemoryPressure { percent: f32 },

    #[error("recording buffer {0} is already active")]
    DuplicateId(String),
}

/// Errors produced by the sample repository.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("sample {0} not found")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid WAV file: {0}")]
    Wav(#[from] hound::Error),
}

/// Errors produced by the sample cache.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("failed to load sample {sample_id}: {reason}")]
    LoadFailed { sample_id: String, reason: String },

    #[error("failed to evict sample {sample_id}: {reason}")]
    EvictionFailed { sample_id: String, reason: String },

    #[error("failed to resolve sample: {0}")]
    Resolve(#[from] RepositoryError),
}

/// A failure of the audio engine itself, handled by the recovery coordinator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineFailure {
    #[error("audio engine is unresponsive: {0}")]
    Unresponsive(String),

    #[error("audio engine failed to initialize: {0}")]
    InitFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_pressure_message_is_actionable() {
        let err = AllocationError::MemoryPressure { percent: 93.4 };
        assert_eq!(err.to_string(), "cannot record, low memory (93% used)");
    }

    #[test]
    fn test_engine_error_converts_into_scheduling_error() {
        let err: SchedulingError = EngineError::Native("xrun".to_string()).into();
        assert_eq!(
            err,
            SchedulingError::EngineCallFailed(EngineError::Native("xrun".to_string()))
        );
    }
}
