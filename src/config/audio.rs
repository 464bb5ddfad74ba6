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
use serde::Deserialize;

use super::error::ConfigError;
use crate::engine::EngineSettings;

/// A YAML representation of the audio engine configuration.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct Audio {
    /// Output sample rate in Hz (default: 48000).
    sample_rate: Option<u32>,

    /// Engine buffer size in frames (default: 256).
    buffer_size: Option<usize>,

    /// Ask the engine for its low-latency path (default: true).
    low_latency: Option<bool>,
}

impl Audio {
    pub fn settings(&self) -> Result<EngineSettings, ConfigError> {
        let defaults = EngineSettings::default();
        let settings = EngineSettings {
            sample_rate: self.sample_rate.unwrap_or(defaults.sample_rate),
            buffer_size: self.buffer_size.unwrap_or(defaults.buffer_size),
            low_latency: self.low_latency.unwrap_or(defaults.low_latency),
        };
        if settings.sample_rate == 0 {
            return Err(ConfigError::invalid("audio.sample_rate", "must be positive"));
        }
        if settings.buffer_size == 0 {
            return Err(ConfigError::invalid("audio.buffer_size", "must be positive"));
        }
        Ok(settings)
    }
}
