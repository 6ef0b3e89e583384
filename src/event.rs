//! Event-loop integration surface (`SPEC_FULL.md` §4.1 event-loop integration, §9).
//!
//! The core never polls or spawns threads; it exposes a small `Source` trait
//! with readiness/dispatch/finalize hooks, and a generic reader that turns
//! one `read(2)` on the character device into a parsed raw event.

use std::os::unix::io::RawFd;

use log::trace;

use crate::sys;

/// What a host event loop should do after `Source::dispatch` returns.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DispatchResult {
    /// Keep the source registered.
    Continue,
    /// Drop the source; an error or EOF occurred.
    Remove,
}

/// One opaque dispatch source per context or resource instance.
///
/// Readiness is level-triggered on `fd()` being readable; a spurious error
/// or hangup tears the source down via `Remove`.
pub trait Source {
    fn fd(&self) -> RawFd;

    /// Called once the host observes `fd()` readable. Implementations read
    /// exactly one event union from the device and dispatch it.
    fn dispatch(&mut self) -> DispatchResult;

    /// Called when the source is being torn down.
    fn finalize(&mut self) {}
}

/// One page of scratch space, sized once per process the way the original
/// `GSource`-based reader does (`sysconf(_SC_PAGESIZE)`).
pub fn page_size() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if n > 0 {
        n as usize
    } else {
        4096
    }
}

/// Read one event union from `fd` into `buf`. `Ok(None)` means EAGAIN
/// (transient, absorbed per §7); `Ok(Some(n))` is the number of valid bytes.
pub fn read_event(fd: RawFd, buf: &mut [u8]) -> std::io::Result<Option<usize>> {
    match sys::read(fd, buf) {
        Ok(n) if n > 0 => Ok(Some(n)),
        Ok(_) => Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
            trace!("read_event: EAGAIN, absorbed");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}
