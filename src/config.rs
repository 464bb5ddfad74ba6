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
use std::path::Path;
use std::time::Duration;

use config::{Config, File, FileFormat};
use duration_string::DurationString;
use serde::Deserialize;
use serde_json::json;

pub use self::error::ConfigError;

mod audio;
mod cache;
mod error;
mod governor;
mod pool;
mod recovery;
mod scheduler;

/// The top level session configuration. Every section is optional; missing sections and
/// fields fall back to their defaults.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct Session {
    #[serde(default)]
    audio: Option<audio::Audio>,
    #[serde(default)]
    scheduler: Option<scheduler::Scheduler>,
    #[serde(default)]
    cache: Option<cache::Cache>,
    #[serde(default)]
    pool: Option<pool::Pool>,
    #[serde(default)]
    governor: Option<governor::Governor>,
    #[serde(default)]
    recovery: Option<recovery::Recovery>,
}

impl Session {
    /// Parses a session configuration from a YAML file.
    pub fn deserialize(path: &Path) -> Result<Session, ConfigError> {
        Ok(Config::builder()
            .add_source(File::from(path))
            .build()?
            .try_deserialize::<Session>()?)
    }

    /// Parses a session configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Session, ConfigError> {
        Ok(Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?
            .try_deserialize::<Session>()?)
    }

    /// Resolves the configuration into validated settings.
    pub fn settings(&self) -> Result<crate::session::Settings, ConfigError> {
        let settings = crate::session::Settings {
            engine: self.audio.clone().unwrap_or_default().settings()?,
            scheduler: self.scheduler.clone().unwrap_or_default().settings()?,
            cache: self.cache.clone().unwrap_or_default().settings()?,
            pool: self.pool.clone().unwrap_or_default().settings()?,
            governor: self.governor.clone().unwrap_or_default().settings()?,
            recovery: self.recovery.clone().unwrap_or_default().settings()?,
        };

        if settings.pool.ceiling_bytes > settings.governor.memory_ceiling_bytes {
            return Err(ConfigError::invalid(
                "pool.ceiling_bytes",
                format!(
                    "must not exceed governor.memory_ceiling_bytes ({})",
                    settings.governor.memory_ceiling_bytes
                ),
            ));
        }
        Ok(settings)
    }
}

/// Parses an optional duration field, falling back to the given default.
fn parse_duration(
    field: &str,
    value: &Option<String>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match value {
        Some(value) => DurationString::from_string(value.clone())
            .map(Into::into)
            .map_err(|e| ConfigError::invalid(field, e.to_string())),
        None => Ok(default),
    }
}

fn format_duration(duration: Duration) -> String {
    DurationString::from(duration).to_string()
}

/// Renders resolved settings in the same shape as the YAML configuration.
pub fn describe(settings: &crate::session::Settings) -> serde_json::Value {
    json!({
        "audio": {
            "sample_rate": settings.engine.sample_rate,
            "buffer_size": settings.engine.buffer_size,
            "low_latency": settings.engine.low_latency,
        },
        "scheduler": {
            "lookahead": format_duration(settings.scheduler.lookahead),
            "safety_margin": format_duration(settings.scheduler.safety_margin),
            "dispatch_horizon": format_duration(settings.scheduler.dispatch_horizon),
            "dispatch_interval": format_duration(settings.scheduler.dispatch_interval),
            "default_bpm": settings.scheduler.default_bpm,
            "steps_per_beat": settings.scheduler.steps_per_beat,
            "prioritized_lookahead_factor": settings.scheduler.prioritized_lookahead_factor,
        },
        "cache": {
            "max_entries": settings.cache.max_entries,
            "reduced_max_entries": settings.cache.reduced_max_entries,
            "inactive_after": format_duration(settings.cache.inactive_after),
            "load_estimate": format_duration(settings.cache.load_estimate),
        },
        "pool": {
            "max_free_buffers": settings.pool.max_free_buffers,
            "ceiling_bytes": settings.pool.ceiling_bytes,
            "critical_memory_percent": settings.pool.critical_memory_percent,
            "sweep_interval": format_duration(settings.pool.sweep_interval),
            "idle_timeout": format_duration(settings.pool.idle_timeout),
            "sustained_pressure_ticks": settings.pool.sustained_pressure_ticks,
        },
        "governor": {
            "interval": format_duration(settings.governor.interval),
            "cooldown": format_duration(settings.governor.cooldown),
            "fps_severe": settings.governor.fps_severe,
            "fps_moderate": settings.governor.fps_moderate,
            "memory_severe_percent": settings.governor.memory_severe_percent,
            "memory_moderate_percent": settings.governor.memory_moderate_percent,
            "latency_threshold": format_duration(settings.governor.latency_threshold),
            "memory_ceiling_bytes": settings.governor.memory_ceiling_bytes,
        },
        "recovery": {
            "max_attempts": settings.recovery.max_attempts,
            "base_delay": format_duration(settings.recovery.base_delay),
            "backoff_factor": settings.recovery.backoff_factor,
            "health_interval": format_duration(settings.recovery.health_interval),
        },
    })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let settings = Session::default().settings().unwrap();
        assert_eq!(settings.scheduler.lookahead, Duration::from_millis(10));
        assert_eq!(settings.cache.max_entries, 32);
        assert_eq!(settings.pool.max_free_buffers, 10);
        assert_eq!(settings.governor.cooldown, Duration::from_secs(3));
        assert_eq!(settings.recovery.max_attempts, 3);
        assert_eq!(settings.engine.sample_rate, 48000);
    }

    #[test]
    fn test_deserialize_file() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("padtime.yaml");
        fs::write(
            &path,
            r#"
scheduler:
  lookahead: 15ms
  default_bpm: 96
cache:
  max_entries: 8
  reduced_max_entries: 4
recovery:
  base_delay: 500ms
  max_attempts: 5
"#,
        )?;

        let settings = Session::deserialize(&path)?.settings()?;
        assert_eq!(settings.scheduler.lookahead, Duration::from_millis(15));
        assert_eq!(settings.scheduler.default_bpm, 96.0);
        assert_eq!(settings.scheduler.safety_margin, Duration::from_millis(2));
        assert_eq!(settings.cache.max_entries, 8);
        assert_eq!(settings.cache.reduced_max_entries, 4);
        assert_eq!(settings.recovery.base_delay, Duration::from_millis(500));
        assert_eq!(settings.recovery.max_attempts, 5);
        Ok(())
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = Session::deserialize(&dir.path().join("nope.yaml"));
        assert!(matches!(result, Err(ConfigError::Load(_))));
    }

    #[test]
    fn test_bad_duration() {
        let session = Session::from_yaml("governor:\n  interval: soon\n").unwrap();
        match session.settings() {
            Err(ConfigError::Invalid { field, .. }) => assert_eq!(field, "governor.interval"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_validation() {
        let cases = [
            ("cache:\n  max_entries: 0\n", "cache.max_entries"),
            (
                "cache:\n  max_entries: 4\n  reduced_max_entries: 8\n",
                "cache.reduced_max_entries",
            ),
            (
                "governor:\n  fps_severe: 50\n  fps_moderate: 40\n",
                "governor.fps_moderate",
            ),
            (
                "governor:\n  memory_severe_percent: 70\n",
                "governor.memory_moderate_percent",
            ),
            ("recovery:\n  backoff_factor: 0.5\n", "recovery.backoff_factor"),
            ("recovery:\n  max_attempts: 0\n", "recovery.max_attempts"),
            ("scheduler:\n  default_bpm: 0\n", "scheduler.default_bpm"),
            ("scheduler:\n  steps_per_beat: 0\n", "scheduler.steps_per_beat"),
            ("audio:\n  buffer_size: 0\n", "audio.buffer_size"),
            ("pool:\n  sweep_interval: 0s\n", "pool.sweep_interval"),
            (
                "pool:\n  ceiling_bytes: 1073741824\n",
                "pool.ceiling_bytes",
            ),
        ];

        for (yaml, expected) in cases {
            let session = Session::from_yaml(yaml).unwrap();
            match session.settings() {
                Err(ConfigError::Invalid { field, .. }) => {
                    assert_eq!(field, expected, "config: {}", yaml)
                }
                other => panic!("expected {} to be rejected, got {:?}", expected, other),
            }
        }
    }

    #[test]
    fn test_describe() {
        let settings = Session::default().settings().unwrap();
        let described = describe(&settings);
        assert_eq!(described["scheduler"]["lookahead"], "10ms");
        assert_eq!(described["recovery"]["base_delay"], "1s");
        assert_eq!(described["cache"]["max_entries"], 32);

        // The rendered form parses back to the same settings.
        let yaml = serde_json::to_string(&described).unwrap();
        let session = Config::builder()
            .add_source(File::from_str(&yaml, FileFormat::Json))
            .build()
            .unwrap()
            .try_deserialize::<Session>()
            .unwrap();
        let reparsed = session.settings().unwrap();
        assert_eq!(reparsed.scheduler.lookahead, settings.scheduler.lookahead);
        assert_eq!(reparsed.recovery.health_interval, settings.recovery.health_interval);
    }
}
