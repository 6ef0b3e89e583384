//! Shared machinery for the resource family (`SPEC_FULL.md` §4.5, §4.6),
//! grounded on `examples/original_source/src/fw_iso_resource_private.c`.

use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::ctx::Speed;
use crate::err::{ResourceError, ResourceResult};
use crate::sys;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);

/// Opens the character device read-only, preserving any other flag bits the
/// caller passes (`SPEC_FULL.md` §4.5 `open`).
pub fn open(path: &str, extra_flags: libc::c_int) -> ResourceResult<RawFd> {
    let c_path =
        CString::new(path).map_err(|e| {
            ResourceError::failed("open", std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
        })?;
    sys::open(&c_path, libc::O_RDONLY | extra_flags).map_err(|e| ResourceError::failed("open", e))
}

pub fn channel_mask(candidates: &[u8]) -> u64 {
    candidates
        .iter()
        .filter(|&&c| c < 64)
        .fold(0u64, |acc, &c| acc | (1u64 << c))
}

/// `calc_bandwidth` from `SPEC_FULL.md` §4.5.
pub fn calc_bandwidth(bytes_per_payload: u32, speed: Speed) -> u32 {
    let bytes_per_packet = 12 + align4(bytes_per_payload);
    let speed = speed as i32;
    let s400 = Speed::S400 as i32;
    if speed <= s400 {
        bytes_per_packet * (1 << (s400 - speed))
    } else {
        bytes_per_packet / (1 << (speed - s400))
    }
}

fn align4(n: u32) -> u32 {
    (n + 3) & !3
}

/// `(mutex, condvar, handled-flag, error)` tuple backing the `_sync`/`_wait`
/// calls (`SPEC_FULL.md` §4.5 `_sync` variants, §5).
#[derive(Default)]
struct WaiterState {
    handled: bool,
    channel: u32,
    bandwidth: u32,
    event_code: i32,
}

pub struct Waiter {
    state: Mutex<WaiterState>,
    cond: Condvar,
}

impl Waiter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(WaiterState::default()),
            cond: Condvar::new(),
        }
    }

    pub fn signal(&self, channel: u32, bandwidth: u32, event_code: i32) {
        let mut state = self.state.lock().unwrap();
        state.handled = true;
        state.channel = channel;
        state.bandwidth = bandwidth;
        state.event_code = event_code;
        self.cond.notify_all();
    }

    /// Blocks until `signal` is called or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> ResourceResult<(u32, u32)> {
        let state = self.state.lock().unwrap();
        let (state, result) = self
            .cond
            .wait_timeout_while(state, timeout, |s| !s.handled)
            .unwrap();
        if result.timed_out() {
            return Err(ResourceError::Timeout);
        }
        if state.event_code != 0 {
            return Err(ResourceError::Event {
                code: state.event_code,
            });
        }
        Ok((state.channel, state.bandwidth))
    }
}

impl Default for Waiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bandwidth_formula_matches_worked_examples() {
        assert_eq!(calc_bandwidth(0, Speed::S400), 12);
        assert_eq!(calc_bandwidth(4, Speed::S400), 16);
        assert_eq!(calc_bandwidth(0, Speed::S200), 24);
        assert_eq!(calc_bandwidth(0, Speed::S1600), 3);
    }

    #[test]
    fn channel_mask_drops_values_at_or_above_64() {
        assert_eq!(channel_mask(&[0, 1, 64, 200]), 0b11);
    }

    #[test]
    fn waiter_times_out_without_a_signal() {
        let waiter = Waiter::new();
        let err = waiter.wait(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, ResourceError::Timeout));
    }

    #[test]
    fn waiter_surfaces_kernel_event_code() {
        let waiter = Waiter::new();
        waiter.signal(0, 0, 5);
        let err = waiter.wait(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, ResourceError::Event { code: 5 }));
    }
}
