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
use crate::cache::CacheSettings;

/// A YAML representation of the sample cache configuration.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct Cache {
    max_entries: Option<usize>,
    reduced_max_entries: Option<usize>,
    inactive_after: Option<String>,
    load_estimate: Option<String>,
}

impl Cache {
    pub fn settings(&self) -> Result<CacheSettings, ConfigError> {
        let defaults = CacheSettings::default();
        let settings = CacheSettings {
            max_entries: self.max_entries.unwrap_or(defaults.max_entries),
            reduced_max_entries: self
                .reduced_max_entries
                .unwrap_or(defaults.reduced_max_entries),
            inactive_after: parse_duration(
                "cache.inactive_after",
                &self.inactive_after,
                defaults.inactive_after,
            )?,
            load_estimate: parse_duration(
                "cache.load_estimate",
                &self.load_estimate,
                defaults.load_estimate,
            )?,
        };

        if settings.max_entries == 0 {
            return Err(ConfigError::invalid("cache.max_entries", "must be positive"));
        }
        if settings.reduced_max_entries == 0 {
            return Err(ConfigError::invalid(
                "cache.reduced_max_entries",
                "must be positive",
            ));
        }
        if settings.reduced_max_entries > settings.max_entries {
            return Err(ConfigError::invalid(
                "cache.reduced_max_entries",
                format!("must not exceed max_entries ({})", settings.max_entries),
            ));
        }
        Ok(settings)
    }
}
