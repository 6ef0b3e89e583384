//! Kernel-managed isochronous resource bound to the file descriptor
//! (`SPEC_FULL.md` §4.6), grounded on
//! `examples/original_source/src/fw_iso_resource_auto.c`.

use std::os::unix::io::RawFd;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use log::debug;

use crate::err::{ResourceError, ResourceResult};
use crate::resource;
use crate::sys;

#[derive(Debug, Default, Clone, Copy)]
struct State {
    allocated: bool,
    channel: u32,
    bandwidth: u32,
    handle: u32,
    generation: u32,
}

/// One `HinokoFwIsoResourceAuto`-equivalent handle: `(allocated, channel,
/// bandwidth, handle)` guarded by a single mutex, plus the bus-reset
/// generation counter (`SPEC_FULL.md` §3 IsoResource, §5).
pub struct ResourceAuto {
    fd: RawFd,
    state: Mutex<State>,
    cond: Condvar,
}

impl ResourceAuto {
    pub fn open(path: &str) -> ResourceResult<Self> {
        let fd = resource::open(path, 0)?;
        Ok(Self {
            fd,
            state: Mutex::new(State::default()),
            cond: Condvar::new(),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn allocated(&self) -> bool {
        self.state.lock().unwrap().allocated
    }

    pub fn channel(&self) -> u32 {
        self.state.lock().unwrap().channel
    }

    pub fn bandwidth(&self) -> u32 {
        self.state.lock().unwrap().bandwidth
    }

    pub fn generation(&self) -> u32 {
        self.state.lock().unwrap().generation
    }

    /// See `SPEC_FULL.md` §4.6 `allocate_async`.
    pub fn allocate_async(&self, candidates: &[u8], bandwidth: u32) -> ResourceResult<()> {
        {
            let state = self.state.lock().unwrap();
            if state.allocated {
                return Err(ResourceError::Allocated);
            }
        }

        let mut req = sys::AllocateIsoResource {
            channels: resource::channel_mask(candidates),
            bandwidth,
            handle: 0,
        };
        unsafe { sys::ioctl(self.fd, sys::allocate_iso_resource_request(), &mut req) }
            .map_err(|e| ResourceError::failed("ALLOCATE_ISO_RESOURCE", e))?;

        self.state.lock().unwrap().handle = req.handle;
        Ok(())
    }

    /// Fire-and-forget deallocate; waits for the `deallocated` event.
    pub fn deallocate_async(&self) -> ResourceResult<()> {
        let handle = self.state.lock().unwrap().handle;
        let mut req = sys::Deallocate { handle };
        unsafe { sys::ioctl(self.fd, sys::deallocate_iso_resource_request(), &mut req) }
            .map(drop)
            .map_err(|e| ResourceError::failed("DEALLOCATE_ISO_RESOURCE", e))
    }

    /// Blocks until the `deallocated` event or `timeout` elapses.
    pub fn deallocate_wait(&self, timeout: Duration) -> ResourceResult<()> {
        self.deallocate_async()?;
        let state = self.state.lock().unwrap();
        let (_state, result) = self
            .cond
            .wait_timeout_while(state, timeout, |s| s.allocated)
            .unwrap();
        if result.timed_out() {
            return Err(ResourceError::Timeout);
        }
        Ok(())
    }

    /// Parse one `ISO_RESOURCE_ALLOCATED`/`ISO_RESOURCE_DEALLOCATED` event.
    pub fn handle_event(&self, buf: &[u8]) {
        let ev = unsafe { &*(buf.as_ptr() as *const sys::EventIsoResource) };
        let mut state = self.state.lock().unwrap();
        if ev.type_ == sys::EVENT_ISO_RESOURCE_ALLOCATED {
            if ev.channel >= 0 {
                state.channel = ev.channel as u32;
                state.bandwidth = ev.bandwidth as u32;
                state.allocated = true;
            }
        } else {
            state.allocated = false;
        }
        self.cond.notify_all();
    }

    /// Updates the observable generation counter on a bus-reset
    /// notification from the owning thread's event dispatch; the kernel
    /// reallocates `(channel, bandwidth)` automatically (§4.6 bus reset).
    pub fn note_generation(&self, generation: u32) {
        debug!("resource generation advanced to {}", generation);
        self.state.lock().unwrap().generation = generation;
    }
}

impl Drop for ResourceAuto {
    fn drop(&mut self) {
        sys::close(self.fd).ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_unopened() -> ResourceAuto {
        ResourceAuto {
            fd: -1,
            state: Mutex::new(State::default()),
            cond: Condvar::new(),
        }
    }

    #[test]
    fn second_allocate_without_deallocated_event_fails_allocated() {
        let res = make_unopened();
        res.state.lock().unwrap().allocated = true;
        let err = res.allocate_async(&[0], 10).unwrap_err();
        assert!(matches!(err, ResourceError::Allocated));
    }

    #[test]
    fn handle_event_sets_allocated_on_non_negative_channel() {
        let res = make_unopened();
        let mut ev = sys::EventIsoResource {
            type_: sys::EVENT_ISO_RESOURCE_ALLOCATED,
            channel: 3,
            bandwidth: 16,
            ..Default::default()
        };
        let buf = unsafe {
            std::slice::from_raw_parts(
                &mut ev as *mut _ as *const u8,
                std::mem::size_of::<sys::EventIsoResource>(),
            )
        };
        res.handle_event(buf);
        assert!(res.allocated());
        assert_eq!(res.channel(), 3);
        assert_eq!(res.bandwidth(), 16);
    }

    #[test]
    fn handle_event_clears_allocated_on_deallocated() {
        let res = make_unopened();
        res.state.lock().unwrap().allocated = true;
        let mut ev = sys::EventIsoResource {
            type_: sys::EVENT_ISO_RESOURCE_DEALLOCATED,
            ..Default::default()
        };
        let buf = unsafe {
            std::slice::from_raw_parts(
                &mut ev as *mut _ as *const u8,
                std::mem::size_of::<sys::EventIsoResource>(),
            )
        };
        res.handle_event(buf);
        assert!(!res.allocated());
    }
}
