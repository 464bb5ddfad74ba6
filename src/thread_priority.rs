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
use thread_priority::{set_current_thread_priority, ThreadPriority, ThreadPriorityValue};
use tracing::{info, warn};

/// Default priority for the trigger dispatch thread when PADTIME_THREAD_PRIORITY is unset.
const DEFAULT_DISPATCH_THREAD_PRIORITY: u8 = 70;

/// Reads PADTIME_THREAD_PRIORITY (0-99). Out of range or unparseable values fall back to the
/// default.
pub fn dispatch_thread_priority() -> ThreadPriority {
    let value = std::env::var("PADTIME_THREAD_PRIORITY")
        .ok()
        .and_then(|v| v.parse::<u8>().ok())
        .filter(|n| *n < 100)
        .unwrap_or(DEFAULT_DISPATCH_THREAD_PRIORITY);
    ThreadPriorityValue::try_from(value)
        .map(ThreadPriority::Crossplatform)
        .unwrap_or(ThreadPriority::Max)
}

pub(crate) fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .ok()
        .map(|v| {
            v == "1"
                || v.eq_ignore_ascii_case("true")
                || v.eq_ignore_ascii_case("yes")
                || v.eq_ignore_ascii_case("on")
        })
        .unwrap_or(false)
}

/// Returns whether we should attempt RT (SCHED_FIFO) scheduling for the dispatch thread.
/// Default: enabled. Opt out with PADTIME_DISABLE_RT_DISPATCH=1.
pub fn rt_dispatch_enabled() -> bool {
    !env_flag("PADTIME_DISABLE_RT_DISPATCH")
}

/// Raises the priority of the calling thread. Best effort: returns false if the OS refused.
pub fn elevate_current_thread(priority: ThreadPriority, rt: bool) -> bool {
    let mut elevated = match set_current_thread_priority(priority) {
        Ok(()) => true,
        Err(e) => {
            warn!(error = ?e, "Failed to raise dispatch thread priority");
            false
        }
    };

    #[cfg(unix)]
    if rt {
        use thread_priority::unix::{
            set_thread_priority_and_policy, thread_native_id, RealtimeThreadSchedulePolicy,
            ThreadSchedulePolicy,
        };
        let tid = thread_native_id();
        match set_thread_priority_and_policy(
            tid,
            priority,
            ThreadSchedulePolicy::Realtime(RealtimeThreadSchedulePolicy::Fifo),
        ) {
            Ok(()) => {
                info!("Enabled RT SCHED_FIFO for dispatch thread");
                elevated = true;
            }
            Err(e) => {
                warn!(error = %e, "Failed to set RT SCHED_FIFO for dispatch thread");
            }
        }
    }
    #[cfg(not(unix))]
    let _ = rt;

    elevated
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    #[test]
    #[serial]
    fn test_priority_from_env() {
        std::env::set_var("PADTIME_THREAD_PRIORITY", "40");
        let expected = ThreadPriority::Crossplatform(ThreadPriorityValue::try_from(40u8).unwrap());
        assert_eq!(dispatch_thread_priority(), expected);
        std::env::remove_var("PADTIME_THREAD_PRIORITY");
    }

    #[test]
    #[serial]
    fn test_priority_out_of_range_uses_default() {
        std::env::set_var("PADTIME_THREAD_PRIORITY", "150");
        let expected = ThreadPriority::Crossplatform(
            ThreadPriorityValue::try_from(DEFAULT_DISPATCH_THREAD_PRIORITY).unwrap(),
        );
        assert_eq!(dispatch_thread_priority(), expected);
        std::env::remove_var("PADTIME_THREAD_PRIORITY");
    }

    #[test]
    #[serial]
    fn test_rt_dispatch_flag() {
        std::env::remove_var("PADTIME_DISABLE_RT_DISPATCH");
        assert!(rt_dispatch_enabled());
        std::env::set_var("PADTIME_DISABLE_RT_DISPATCH", "yes");
        assert!(!rt_dispatch_enabled());
        std::env::remove_var("PADTIME_DISABLE_RT_DISPATCH");
    }
}
