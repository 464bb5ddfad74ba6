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
//! Trigger scheduling and adaptive resource management for a pad sampler.

pub mod cache;
pub mod cancel;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod governor;
pub mod pool;
pub mod recovery;
pub mod repository;
pub mod scheduler;
pub mod session;
pub mod thread_priority;
#[cfg(test)]
mod testutil;
