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
use crate::pool::PoolSettings;

/// A YAML representation of the recording buffer pool configuration.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct Pool {
    /// Released buffers kept around for reuse (default: 10).
    max_free_buffers: Option<usize>,

    /// Bytes that active buffers may hold in total (default: 256MiB).
    ceiling_bytes: Option<u64>,

    /// Memory usage at which new buffers are declined (default: 90).
    critical_memory_percent: Option<f32>,

    sweep_interval: Option<String>,
    idle_timeout: Option<String>,
    sustained_pressure_ticks: Option<u32>,
}

impl Pool {
    pub fn settings(&self) -> Result<PoolSettings, ConfigError> {
        let defaults = PoolSettings::default();
        let settings = PoolSettings {
            max_free_buffers: self.max_free_buffers.unwrap_or(defaults.max_free_buffers),
            ceiling_bytes: self.ceiling_bytes.unwrap_or(defaults.ceiling_bytes),
            critical_memory_percent: self
                .critical_memory_percent
                .unwrap_or(defaults.critical_memory_percent),
            sweep_interval: parse_duration(
                "pool.sweep_interval",
                &self.sweep_interval,
                defaults.sweep_interval,
            )?,
            idle_timeout: parse_duration(
                "pool.idle_timeout",
                &self.idle_timeout,
                defaults.idle_timeout,
            )?,
            sustained_pressure_ticks: self
                .sustained_pressure_ticks
                .unwrap_or(defaults.sustained_pressure_ticks),
        };

        if settings.ceiling_bytes == 0 {
            return Err(ConfigError::invalid("pool.ceiling_bytes", "must be positive"));
        }
        if !(0.0..=100.0).contains(&settings.critical_memory_percent) {
            return Err(ConfigError::invalid(
                "pool.critical_memory_percent",
                "must be between 0 and 100",
            ));
        }
        if settings.sweep_interval.is_zero() {
            return Err(ConfigError::invalid("pool.sweep_interval", "must be positive"));
        }
        if settings.sustained_pressure_ticks == 0 {
            return Err(ConfigError::invalid(
                "pool.sustained_pressure_ticks",
                "must be positive",
            ));
        }
        Ok(settings)
    }
}
