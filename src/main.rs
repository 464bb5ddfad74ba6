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
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::{crate_version, Parser, Subcommand};
use rand::Rng;
use tracing::info;
use tracing_subscriber::EnvFilter;

use padtime::clock::{Clock, SystemClock};
use padtime::config;
use padtime::engine;
use padtime::repository::{DirectoryRepository, SampleRepository, StaticRepository};
use padtime::scheduler::{Pattern, StepEvent};
use padtime::session::{Session, Settings};

/// How long to wait for the last scheduled triggers to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[clap(
    author = "Michael Wilson",
    version = crate_version!(),
    about = "A real-time pad sampler core."
)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plays a pattern through an audio engine and prints the session metrics.
    Simulate {
        /// The path to the session config.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// The pattern to play, in the form <SAMPLE>:<STEPS>,... For example,
        /// kick:x...x...,snare:....x...,hat:x.x.x.x.
        pattern: String,
        /// The number of times to loop the pattern.
        #[arg(short, long, default_value_t = 4)]
        bars: u32,
        /// The tempo. Defaults to the configured tempo.
        #[arg(long)]
        bpm: Option<f64>,
        /// The audio engine to play through.
        #[arg(short, long, default_value = "mock")]
        engine: String,
        /// A directory of <SAMPLE>.wav files. Synthetic samples are used if not given.
        #[arg(short, long)]
        samples: Option<PathBuf>,
        /// Randomly vary hit velocities by up to this amount.
        #[arg(long, default_value_t = 0.0)]
        humanize: f32,
    },
    /// Verifies a session config and prints the resolved settings.
    CheckConfig {
        /// The path to the session config.
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            config,
            pattern,
            bars,
            bpm,
            engine,
            samples,
            humanize,
        } => {
            let settings = match config {
                Some(path) => config::Session::deserialize(&path)?.settings()?,
                None => Settings::default(),
            };
            let pattern = Pattern::parse(&pattern)?;

            let repository: Arc<dyn SampleRepository> = match samples {
                Some(path) => Arc::new(DirectoryRepository::new(&path)),
                None => {
                    let repository = StaticRepository::new();
                    for track in pattern.tracks() {
                        repository.insert_synthetic(&track.sample_id);
                    }
                    Arc::new(repository)
                }
            };

            let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
            let engine = engine::get_engine(&engine, clock.clone())?;
            let session = Session::new(settings, clock, engine, repository);
            session.start()?;

            if let Some(bpm) = bpm {
                session.set_tempo(bpm);
            }
            for (pad, track) in pattern.tracks().iter().enumerate() {
                session.assign_pad(pad, &track.sample_id);
            }
            for track in pattern.tracks() {
                session.cache().ensure_loaded(&track.sample_id)?;
            }

            let steps_per_bar = u32::try_from(pattern.len())?;
            let bar_length =
                Duration::from_micros(session.scheduler().step_period_micros() as u64)
                    * steps_per_bar;
            info!(
                bars,
                steps_per_bar,
                bar_ms = bar_length.as_millis(),
                "Starting simulation"
            );

            let mut rng = rand::thread_rng();
            for bar in 0..bars {
                let start = Instant::now();
                let mut steps = pattern.steps(u64::from(bar) * u64::from(steps_per_bar), steps_per_bar);
                if humanize > 0.0 {
                    steps = steps
                        .into_iter()
                        .map(|step| StepEvent {
                            velocity: (step.velocity - rng.gen_range(0.0..humanize)).clamp(0.0, 1.0),
                            ..step
                        })
                        .collect();
                }
                let count = session.schedule_steps(&steps)?;
                info!(
                    bar,
                    scheduled = count.scheduled,
                    missed = count.missed,
                    "Scheduled bar"
                );

                let elapsed = start.elapsed();
                if elapsed < bar_length {
                    thread::sleep(bar_length - elapsed);
                }
            }

            let drain_start = Instant::now();
            while session.scheduler().pending() > 0 && drain_start.elapsed() < DRAIN_TIMEOUT {
                thread::sleep(Duration::from_millis(10));
            }

            let metrics = session.metrics();
            session.stop();
            println!("{}", serde_json::to_string_pretty(&metrics)?);
        }
        Commands::CheckConfig { path } => {
            let settings = config::Session::deserialize(&path)?.settings()?;
            println!("{}", serde_json::to_string_pretty(&config::describe(&settings))?);
        }
    }

    Ok(())
}
