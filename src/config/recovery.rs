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
use crate::recovery::RecoverySettings;

/// A YAML representation of the engine recovery configuration.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct Recovery {
    /// Initialization attempts before recovery gives up (default: 3).
    max_attempts: Option<u32>,

    /// Wait before the first attempt (default: 1s).
    base_delay: Option<String>,

    /// Each later attempt waits this much longer than the one before (default: 2).
    backoff_factor: Option<f64>,

    /// How often engine health is polled (default: 5s).
    health_interval: Option<String>,
}

impl Recovery {
    pub fn settings(&self) -> Result<RecoverySettings, ConfigError> {
        let defaults = RecoverySettings::default();
        let settings = RecoverySettings {
            max_attempts: self.max_attempts.unwrap_or(defaults.max_attempts),
            base_delay: parse_duration(
                "recovery.base_delay",
                &self.base_delay,
                defaults.base_delay,
            )?,
            backoff_factor: self.backoff_factor.unwrap_or(defaults.backoff_factor),
            health_interval: parse_duration(
                "recovery.health_interval",
                &self.health_interval,
                defaults.health_interval,
            )?,
        };

        if settings.max_attempts == 0 {
            return Err(ConfigError::invalid("recovery.max_attempts", "must be positive"));
        }
        if !settings.backoff_factor.is_finite() || settings.backoff_factor < 1.0 {
            return Err(ConfigError::invalid(
                "recovery.backoff_factor",
                "must be at least 1",
            ));
        }
        if settings.health_interval.is_zero() {
            return Err(ConfigError::invalid(
                "recovery.health_interval",
                "must be positive",
            ));
        }
        Ok(settings)
    }
}
