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

//! Telemetry sources feeding the governor.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::{FrameRateMeter, PerformanceSample};
use crate::engine::AudioEngine;

/// USER_HZ on Linux. Used if the tick rate can't be read from the system.
const DEFAULT_CLOCK_TICKS_PER_SEC: f64 = 100.0;

/// Reported when the UI hasn't drawn anything recently. An idle UI isn't dropping frames.
const IDLE_FRAME_RATE: f32 = 60.0;

pub trait TelemetrySource: Send + Sync {
    fn sample(&self, now_micros: i64) -> io::Result<PerformanceSample>;
}

/// Telemetry gathered from the running process, the UI frame meter and the audio engine.
pub struct SystemTelemetry {
    frame_meter: Arc<FrameRateMeter>,
    engine: Arc<dyn AudioEngine>,
    memory_ceiling_bytes: u64,
    proc_dir: PathBuf,
    last_cpu: Mutex<Option<(u64, i64)>>,
    cpus: usize,
    /// The unit of /proc/self/stat CPU times.
    clock_ticks_per_sec: f64,
}

impl SystemTelemetry {
    pub fn new(
        frame_meter: Arc<FrameRateMeter>,
        engine: Arc<dyn AudioEngine>,
        memory_ceiling_bytes: u64,
    ) -> SystemTelemetry {
        SystemTelemetry {
            frame_meter,
            engine,
            memory_ceiling_bytes,
            proc_dir: PathBuf::from("/proc/self"),
            last_cpu: Mutex::new(None),
            cpus: num_cpus::get().max(1),
            clock_ticks_per_sec: clock_ticks_per_sec(),
        }
    }

    fn memory_usage_percent(&self) -> f32 {
        match read_rss_bytes(&self.proc_dir.join("status")) {
            Ok(rss) if self.memory_ceiling_bytes > 0 => {
                (rss as f64 / self.memory_ceiling_bytes as f64 * 100.0) as f32
            }
            Ok(_) => 0.0,
            Err(e) => {
                debug!(error = %e, "Memory telemetry unavailable");
                0.0
            }
        }
    }

    fn cpu_usage_percent(&self, now_micros: i64) -> f32 {
        let ticks = match read_cpu_ticks(&self.proc_dir.join("stat")) {
            Ok(ticks) => ticks,
            Err(e) => {
                debug!(error = %e, "CPU telemetry unavailable");
                return 0.0;
            }
        };

        let mut last = self.last_cpu.lock();
        let usage = match *last {
            Some((last_ticks, last_at)) if now_micros > last_at => {
                let cpu_secs = ticks.saturating_sub(last_ticks) as f64 / self.clock_ticks_per_sec;
                let wall_secs = (now_micros - last_at) as f64 / 1_000_000.0;
                (cpu_secs / wall_secs / self.cpus as f64 * 100.0).min(100.0) as f32
            }
            _ => 0.0,
        };
        *last = Some((ticks, now_micros));
        usage
    }
}

impl TelemetrySource for SystemTelemetry {
    fn sample(&self, now_micros: i64) -> io::Result<PerformanceSample> {
        Ok(PerformanceSample {
            frame_rate: self
                .frame_meter
                .frame_rate(now_micros)
                .unwrap_or(IDLE_FRAME_RATE),
            cpu_usage_percent: self.cpu_usage_percent(now_micros),
            memory_usage_percent: self.memory_usage_percent(),
            audio_latency_micros: self.engine.reported_latency_micros(),
            timestamp_micros: now_micros,
        })
    }
}

/// Telemetry set by hand, for simulations and tests.
pub struct ManualTelemetry {
    sample: Mutex<PerformanceSample>,
}

impl ManualTelemetry {
    pub fn new(sample: PerformanceSample) -> ManualTelemetry {
        ManualTelemetry {
            sample: Mutex::new(sample),
        }
    }

    pub fn set(&self, sample: PerformanceSample) {
        *self.sample.lock() = sample;
    }
}

impl TelemetrySource for ManualTelemetry {
    fn sample(&self, now_micros: i64) -> io::Result<PerformanceSample> {
        let mut sample = *self.sample.lock();
        sample.timestamp_micros = now_micros;
        Ok(sample)
    }
}

fn clock_ticks_per_sec() -> f64 {
    #[cfg(unix)]
    {
        // SAFETY: sysconf only reads a system constant.
        let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        if ticks > 0 {
            return ticks as f64;
        }
    }
    DEFAULT_CLOCK_TICKS_PER_SEC
}

fn read_rss_bytes(path: &Path) -> io::Result<u64> {
    parse_rss_bytes(&fs::read_to_string(path)?)
}

fn parse_rss_bytes(contents: &str) -> io::Result<u64> {
    let line = contents
        .lines()
        .find(|line| line.starts_with("VmRSS:"))
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "VmRSS field missing"))?;
    let kb = line
        .split_whitespace()
        .nth(1)
        .and_then(|value| value.parse::<u64>().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "VmRSS value malformed"))?;
    Ok(kb * 1024)
}

fn read_cpu_ticks(path: &Path) -> io::Result<u64> {
    parse_cpu_ticks(&fs::read_to_string(path)?)
}

/// Sums utime and stime from /proc/self/stat. The command name may contain spaces, so fields
/// are counted from the closing parenthesis.
fn parse_cpu_ticks(contents: &str) -> io::Result<u64> {
    let malformed = || io::Error::new(io::ErrorKind::InvalidData, "stat line malformed");
    let rest = contents
        .rfind(')')
        .map(|idx| &contents[idx + 1..])
        .ok_or_else(malformed)?;
    // After the command: state is field 3, utime is 14 and stime is 15.
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let utime = fields
        .get(11)
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(malformed)?;
    let stime = fields
        .get(12)
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(malformed)?;
    Ok(utime + stime)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::engine::mock;

    #[test]
    fn test_parse_rss() {
        let status = "Name:\tpadtime\nVmPeak:\t  9000 kB\nVmRSS:\t  2048 kB\nThreads:\t4\n";
        assert_eq!(parse_rss_bytes(status).unwrap(), 2048 * 1024);
        assert!(parse_rss_bytes("Name:\tpadtime\n").is_err());
    }

    #[test]
    fn test_parse_cpu_ticks() {
        let stat = "1234 (pad time) S 1 1234 1234 0 -1 4194560 100 0 0 0 250 50 0 0 20 0 4 0";
        assert_eq!(parse_cpu_ticks(stat).unwrap(), 300);
        assert!(parse_cpu_ticks("1234 (short) S 1").is_err());
    }

    #[test]
    fn test_system_telemetry_uses_idle_frame_rate_and_engine_latency() {
        let clock = Arc::new(ManualClock::new(0));
        let engine = Arc::new(mock::Engine::new("mock", clock));
        engine.set_latency_micros(12_000);
        let telemetry = SystemTelemetry::new(Arc::new(FrameRateMeter::new()), engine, 1 << 30);

        let sample = telemetry.sample(5_000_000).unwrap();
        assert_eq!(sample.frame_rate, IDLE_FRAME_RATE);
        assert_eq!(sample.audio_latency_micros, 12_000);
        assert_eq!(sample.timestamp_micros, 5_000_000);
    }

    #[test]
    fn test_cpu_usage_uses_clock_tick_rate() {
        let dir = tempfile::tempdir().unwrap();
        let stat = |ticks: u64| {
            format!("1234 (padtime) S 1 1234 1234 0 -1 4194560 100 0 0 0 {} 0 0 0 20 0 4 0", ticks)
        };
        let clock = Arc::new(ManualClock::new(0));
        let telemetry = SystemTelemetry {
            frame_meter: Arc::new(FrameRateMeter::new()),
            engine: Arc::new(mock::Engine::new("mock", clock)),
            memory_ceiling_bytes: 1 << 30,
            proc_dir: dir.path().to_path_buf(),
            last_cpu: Mutex::new(None),
            cpus: 2,
            clock_ticks_per_sec: 250.0,
        };

        fs::write(dir.path().join("stat"), stat(1000)).unwrap();
        assert_eq!(telemetry.cpu_usage_percent(1_000_000), 0.0);
        // 250 ticks over one second on two cores.
        fs::write(dir.path().join("stat"), stat(1250)).unwrap();
        assert_eq!(telemetry.cpu_usage_percent(2_000_000), 50.0);

        assert!(clock_ticks_per_sec() > 0.0);
    }

    #[test]
    fn test_manual_telemetry_stamps_time() {
        let telemetry = ManualTelemetry::new(PerformanceSample::default());
        assert_eq!(telemetry.sample(77).unwrap().timestamp_micros, 77);
    }
}
