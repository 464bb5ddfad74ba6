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

//! Resolution of sample ids to audio files and their metadata.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

use crate::error::RepositoryError;

/// Describes a sample's audio data.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SampleMetadata {
    pub sample_id: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub frames: u64,
    pub size_bytes: u64,
}

impl SampleMetadata {
    /// Returns the playing time of the sample.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frames as f64 / self.sample_rate as f64)
    }
}

/// Looks up where a sample lives. Resolution may touch the disk and must not be called from a
/// latency-sensitive path.
pub trait SampleRepository: Send + Sync {
    fn resolve(&self, sample_id: &str) -> Result<(SampleMetadata, PathBuf), RepositoryError>;
}

/// A repository backed by a directory of `<sample id>.wav` files.
pub struct DirectoryRepository {
    root: PathBuf,
}

impl DirectoryRepository {
    pub fn new(root: &Path) -> DirectoryRepository {
        DirectoryRepository {
            root: root.to_path_buf(),
        }
    }
}

impl SampleRepository for DirectoryRepository {
    fn resolve(&self, sample_id: &str) -> Result<(SampleMetadata, PathBuf), RepositoryError> {
        let path = self.root.join(format!("{}.wav", sample_id));
        if !path.is_file() {
            return Err(RepositoryError::NotFound(sample_id.to_string()));
        }

        let reader = hound::WavReader::open(&path)?;
        let spec = reader.spec();
        let frames = u64::from(reader.duration());
        let metadata = SampleMetadata {
            sample_id: sample_id.to_string(),
            sample_rate: spec.sample_rate,
            channels: spec.channels,
            frames,
            size_bytes: frames * u64::from(spec.channels) * u64::from(spec.bits_per_sample / 8),
        };
        debug!(
            sample = sample_id,
            path = ?path,
            duration_ms = metadata.duration().as_millis(),
            "Resolved sample"
        );

        Ok((metadata, path))
    }
}

/// An in-memory repository, used by the simulator and tests.
#[derive(Default)]
pub struct StaticRepository {
    samples: RwLock<HashMap<String, (SampleMetadata, PathBuf)>>,
}

impl StaticRepository {
    pub fn new() -> StaticRepository {
        StaticRepository::default()
    }

    /// Registers a sample under the given path.
    pub fn insert(&self, sample_id: &str, path: &Path, metadata: SampleMetadata) {
        self.samples
            .write()
            .insert(sample_id.to_string(), (metadata, path.to_path_buf()));
    }

    /// Registers a one-second mono sample with a synthetic path.
    pub fn insert_synthetic(&self, sample_id: &str) {
        let metadata = SampleMetadata {
            sample_id: sample_id.to_string(),
            sample_rate: 48000,
            channels: 1,
            frames: 48000,
            size_bytes: 48000 * 4,
        };
        self.insert(sample_id, &PathBuf::from(format!("{}.wav", sample_id)), metadata);
    }
}

impl SampleRepository for StaticRepository {
    fn resolve(&self, sample_id: &str) -> Result<(SampleMetadata, PathBuf), RepositoryError> {
        self.samples
            .read()
            .get(sample_id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(sample_id.to_string()))
    }
}
