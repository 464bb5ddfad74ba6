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
use std::collections::VecDeque;

use parking_lot::Mutex;

const WINDOW_MICROS: i64 = 1_000_000;

/// Frames retained beyond this are dropped; no display refreshes this fast.
const MAX_FRAMES: usize = 480;

/// Measures the UI frame rate over a one second sliding window. The UI layer calls
/// [`FrameRateMeter::record_frame`] once per rendered frame.
#[derive(Default)]
pub struct FrameRateMeter {
    frames: Mutex<VecDeque<i64>>,
}

impl FrameRateMeter {
    pub fn new() -> FrameRateMeter {
        FrameRateMeter::default()
    }

    pub fn record_frame(&self, now_micros: i64) {
        let mut frames = self.frames.lock();
        frames.push_back(now_micros);
        if frames.len() > MAX_FRAMES {
            frames.pop_front();
        }
    }

    /// Frames per second over the last window, or None if nothing was drawn in it.
    pub fn frame_rate(&self, now_micros: i64) -> Option<f32> {
        let mut frames = self.frames.lock();
        while frames
            .front()
            .is_some_and(|&frame| frame <= now_micros - WINDOW_MICROS)
        {
            frames.pop_front();
        }
        if frames.is_empty() {
            return None;
        }
        Some(frames.len() as f32 * 1_000_000.0 / WINDOW_MICROS as f32)
    }
}
