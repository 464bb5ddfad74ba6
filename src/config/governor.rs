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
use super::parse_duration;
use crate::governor::GovernorSettings;

/// A YAML representation of the performance governor configuration.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct Governor {
    interval: Option<String>,
    cooldown: Option<String>,
    fps_severe: Option<f32>,
    fps_moderate: Option<f32>,
    memory_severe_percent: Option<f32>,
    memory_moderate_percent: Option<f32>,
    latency_threshold: Option<String>,
    memory_ceiling_bytes: Option<u64>,
}

impl Governor {
    pub fn settings(&self) -> Result<GovernorSettings, ConfigError> {
        let defaults = GovernorSettings::default();
        let settings = GovernorSettings {
            interval: parse_duration("governor.interval", &self.interval, defaults.interval)?,
            cooldown: parse_duration("governor.cooldown", &self.cooldown, defaults.cooldown)?,
            fps_severe: self.fps_severe.unwrap_or(defaults.fps_severe),
            fps_moderate: self.fps_moderate.unwrap_or(defaults.fps_moderate),
            memory_severe_percent: self
                .memory_severe_percent
                .unwrap_or(defaults.memory_severe_percent),
            memory_moderate_percent: self
                .memory_moderate_percent
                .unwrap_or(defaults.memory_moderate_percent),
            latency_threshold: parse_duration(
                "governor.latency_threshold",
                &self.latency_threshold,
                defaults.latency_threshold,
            )?,
            memory_ceiling_bytes: self
                .memory_ceiling_bytes
                .unwrap_or(defaults.memory_ceiling_bytes),
        };

        if settings.interval.is_zero() {
            return Err(ConfigError::invalid("governor.interval", "must be positive"));
        }
        if settings.fps_moderate < settings.fps_severe {
            return Err(ConfigError::invalid(
                "governor.fps_moderate",
                format!("must be at least fps_severe ({})", settings.fps_severe),
            ));
        }
        if settings.memory_moderate_percent > settings.memory_severe_percent {
            return Err(ConfigError::invalid(
                "governor.memory_moderate_percent",
                format!(
                    "must not exceed memory_severe_percent ({})",
                    settings.memory_severe_percent
                ),
            ));
        }
        if settings.memory_ceiling_bytes == 0 {
            return Err(ConfigError::invalid(
                "governor.memory_ceiling_bytes",
                "must be positive",
            ));
        }
        Ok(settings)
    }
}
