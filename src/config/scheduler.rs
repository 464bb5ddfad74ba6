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
use crate::scheduler::SchedulerSettings;

/// A YAML representation of the trigger scheduler configuration.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct Scheduler {
    /// How far ahead of the step time triggers are stamped (default: 10ms).
    lookahead: Option<String>,

    /// Minimum slack between an expected sample load and its trigger (default: 2ms).
    safety_margin: Option<String>,

    /// Triggers this close to now are handed to the engine (default: 20ms).
    dispatch_horizon: Option<String>,

    /// How often the dispatcher runs (default: 1ms).
    dispatch_interval: Option<String>,

    /// Tempo until one is set (default: 120).
    default_bpm: Option<f64>,

    /// Steps per beat (default: 4).
    steps_per_beat: Option<u32>,

    /// Lookahead multiplier while the audio thread is prioritized (default: 2).
    prioritized_lookahead_factor: Option<f64>,
}

impl Scheduler {
    pub fn settings(&self) -> Result<SchedulerSettings, ConfigError> {
        let defaults = SchedulerSettings::default();
        let settings = SchedulerSettings {
            lookahead: parse_duration("scheduler.lookahead", &self.lookahead, defaults.lookahead)?,
            safety_margin: parse_duration(
                "scheduler.safety_margin",
                &self.safety_margin,
                defaults.safety_margin,
            )?,
            dispatch_horizon: parse_duration(
                "scheduler.dispatch_horizon",
                &self.dispatch_horizon,
                defaults.dispatch_horizon,
            )?,
            dispatch_interval: parse_duration(
                "scheduler.dispatch_interval",
                &self.dispatch_interval,
                defaults.dispatch_interval,
            )?,
            default_bpm: self.default_bpm.unwrap_or(defaults.default_bpm),
            steps_per_beat: self.steps_per_beat.unwrap_or(defaults.steps_per_beat),
            prioritized_lookahead_factor: self
                .prioritized_lookahead_factor
                .unwrap_or(defaults.prioritized_lookahead_factor),
        };

        if settings.dispatch_interval.is_zero() {
            return Err(ConfigError::invalid(
                "scheduler.dispatch_interval",
                "must be positive",
            ));
        }
        if !settings.default_bpm.is_finite() || settings.default_bpm <= 0.0 {
            return Err(ConfigError::invalid("scheduler.default_bpm", "must be positive"));
        }
        if settings.steps_per_beat == 0 {
            return Err(ConfigError::invalid("scheduler.steps_per_beat", "must be positive"));
        }
        if settings.prioritized_lookahead_factor < 1.0 {
            return Err(ConfigError::invalid(
                "scheduler.prioritized_lookahead_factor",
                "must be at least 1",
            ));
        }
        Ok(settings)
    }
}
