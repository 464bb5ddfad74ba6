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
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::error;

/// Represents the current cancel state.
#[derive(PartialEq)]
enum CancelState {
    Running,
    Cancelled,
}

/// A cancel handle is shared between a background loop and its owner. The loop sleeps on the
/// handle between ticks so that cancellation wakes it immediately.
#[derive(Clone)]
pub struct CancelHandle {
    state: Arc<Mutex<CancelState>>,
    condvar: Arc<Condvar>,
}

impl CancelHandle {
    /// Creates a new cancel handle.
    pub fn new() -> CancelHandle {
        CancelHandle {
            state: Arc::new(Mutex::new(CancelState::Running)),
            condvar: Arc::new(Condvar::new()),
        }
    }

    /// Returns true if the loop has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        *self.state.lock() == CancelState::Cancelled
    }

    /// Sleeps for up to the given duration. Returns true if the handle was cancelled before or
    /// during the wait.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        self.condvar
            .wait_while_for(&mut state, |state| *state == CancelState::Running, timeout);
        *state == CancelState::Cancelled
    }

    /// Cancels the loop.
    pub fn cancel(&self) {
        let mut state = self.state.lock();
        if *state == CancelState::Running {
            *state = CancelState::Cancelled;
            self.condvar.notify_all();
        }
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// A running background loop: its cancel handle and thread.
pub struct LoopHandle {
    name: &'static str,
    cancel: CancelHandle,
    join: Option<JoinHandle<()>>,
}

impl LoopHandle {
    pub fn new(name: &'static str, cancel: CancelHandle, join: JoinHandle<()>) -> LoopHandle {
        LoopHandle {
            name,
            cancel,
            join: Some(join),
        }
    }

    /// Cancels the loop and waits for its thread to exit.
    pub fn stop(mut self) {
        self.cancel.cancel();
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                error!(task = self.name, "Background loop panicked");
            }
        }
    }
}

impl Drop for LoopHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
