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

use super::StepEvent;

const FULL_VELOCITY: f32 = 1.0;
const GHOST_VELOCITY: f32 = 0.5;

/// One row of a pattern: the sample a pad plays and a velocity per step.
#[derive(Clone, Debug, PartialEq)]
pub struct Track {
    pub sample_id: String,
    pub steps: Vec<Option<f32>>,
}

/// A looping step pattern. Track `n` plays on pad `n`.
#[derive(Clone, Debug, PartialEq)]
pub struct Pattern {
    tracks: Vec<Track>,
    length: usize,
}

impl Pattern {
    /// Parses a compact pattern such as `kick:x...x...,snare:....x...`. `x` is a full hit,
    /// `o` a ghost note, and `.` or `-` a rest. Tracks may differ in length; shorter ones loop.
    pub fn parse(text: &str) -> Result<Pattern, Box<dyn Error>> {
        let mut tracks = Vec::new();
        for part in text.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (sample_id, steps) = part
                .split_once(':')
                .ok_or_else(|| format!("track \"{}\" is missing a sample id", part))?;
            let sample_id = sample_id.trim();
            if sample_id.is_empty() {
                return Err(format!("track \"{}\" has an empty sample id", part).into());
            }

            let steps = steps
                .trim()
                .chars()
                .map(|c| match c {
                    'x' | 'X' => Ok(Some(FULL_VELOCITY)),
                    'o' | 'O' => Ok(Some(GHOST_VELOCITY)),
                    '.' | '-' => Ok(None),
                    other => Err(format!("invalid step \"{}\" in track {}", other, sample_id)),
                })
                .collect::<Result<Vec<_>, _>>()?;
            if steps.is_empty() {
                return Err(format!("track {} has no steps", sample_id).into());
            }

            tracks.push(Track {
                sample_id: sample_id.to_string(),
                steps,
            });
        }

        if tracks.is_empty() {
            return Err("pattern has no tracks".into());
        }
        let length = tracks.iter().map(|t| t.steps.len()).max().unwrap_or(0);
        Ok(Pattern { tracks, length })
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    /// Steps in one loop of the pattern.
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Returns the hits from `count` steps starting at absolute step `start`, with offsets
    /// relative to `start`.
    pub fn steps(&self, start: u64, count: u32) -> Vec<StepEvent> {
        let mut events = Vec::new();
        for offset in 0..count {
            let step = start + u64::from(offset);
            for (pad, track) in self.tracks.iter().enumerate() {
                let idx = (step % track.steps.len() as u64) as usize;
                if let Some(velocity) = track.steps[idx] {
                    events.push(StepEvent {
                        pad,
                        velocity,
                        offset_steps: offset,
                    });
                }
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let pattern = Pattern::parse("kick:x...x...,snare:....o...").unwrap();
        assert_eq!(pattern.len(), 8);
        assert_eq!(pattern.tracks()[0].sample_id, "kick");
        assert_eq!(pattern.tracks()[1].steps[4], Some(GHOST_VELOCITY));
    }

    #[test]
    fn test_parse_errors() {
        assert!(Pattern::parse("").is_err());
        assert!(Pattern::parse("kick").is_err());
        assert!(Pattern::parse(":x...").is_err());
        assert!(Pattern::parse("kick:x..z").is_err());
        assert!(Pattern::parse("kick:").is_err());
    }

    #[test]
    fn test_steps_loop_short_tracks() {
        let pattern = Pattern::parse("kick:x...,hat:x.").unwrap();
        let events = pattern.steps(2, 3);
        assert_eq!(
            events,
            vec![
                StepEvent {
                    pad: 1,
                    velocity: 1.0,
                    offset_steps: 0
                },
                StepEvent {
                    pad: 0,
                    velocity: 1.0,
                    offset_steps: 2
                },
                StepEvent {
                    pad: 1,
                    velocity: 1.0,
                    offset_steps: 2
                },
            ]
        );
    }
}
