//! Fire-and-forget isochronous resource allocation (`SPEC_FULL.md` §4.5),
//! grounded on `examples/original_source/src/fw_iso_resource_once.c`.

use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::err::{ResourceError, ResourceResult};
use crate::resource::{self, Waiter, DEFAULT_TIMEOUT};
use crate::sys;

/// `(channel, bandwidth, err_code)` reported on an allocated/deallocated
/// event.
pub struct ResourceEvent {
    pub channel: i32,
    pub bandwidth: i32,
    pub err_code: i32,
}

pub trait Observer {
    fn on_allocated(&mut self, event: ResourceEvent);
    fn on_deallocated(&mut self, event: ResourceEvent);
}

/// One `HinokoFwIsoResourceOnce`-equivalent handle: the allocated resource
/// outlives this value, so there is no local allocation state beyond the fd.
pub struct ResourceOnce {
    fd: RawFd,
}

impl ResourceOnce {
    pub fn open(path: &str) -> ResourceResult<Self> {
        let fd = resource::open(path, 0)?;
        Ok(Self { fd })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// See `SPEC_FULL.md` §4.5 `allocate_once_async`.
    pub fn allocate_once_async(&self, channel_candidates: &[u8], bandwidth: u32) -> ResourceResult<()> {
        let mut req = sys::AllocateIsoResource {
            channels: resource::channel_mask(channel_candidates),
            bandwidth,
            handle: 0,
        };
        unsafe { sys::ioctl(self.fd, sys::allocate_iso_resource_once_request(), &mut req) }
            .map(drop)
            .map_err(|e| ResourceError::failed("ALLOCATE_ISO_RESOURCE_ONCE", e))
    }

    /// See `SPEC_FULL.md` §4.5 `deallocate_once_async`.
    pub fn deallocate_once_async(&self, channel: u8, bandwidth: u32) -> ResourceResult<()> {
        let mut req = sys::AllocateIsoResource {
            channels: 1u64 << channel,
            bandwidth,
            handle: 0,
        };
        unsafe { sys::ioctl(self.fd, sys::deallocate_iso_resource_once_request(), &mut req) }
            .map(drop)
            .map_err(|e| ResourceError::failed("DEALLOCATE_ISO_RESOURCE_ONCE", e))
    }

    /// Blocking variant of `allocate_once_async`; waits up to `timeout` for
    /// the `allocated` event delivered through `waiter`.
    pub fn allocate_once_sync(
        &self,
        channel_candidates: &[u8],
        bandwidth: u32,
        waiter: &Waiter,
        timeout: Duration,
    ) -> ResourceResult<(u32, u32)> {
        self.allocate_once_async(channel_candidates, bandwidth)?;
        waiter.wait(timeout)
    }

    pub fn deallocate_once_sync(
        &self,
        channel: u8,
        bandwidth: u32,
        waiter: &Waiter,
    ) -> ResourceResult<()> {
        self.deallocate_once_async(channel, bandwidth)?;
        waiter.wait(DEFAULT_TIMEOUT).map(drop)
    }

    /// Parse one `ISO_RESOURCE_ALLOCATED`/`ISO_RESOURCE_DEALLOCATED` event and
    /// notify `observer`.
    pub fn handle_event(&self, buf: &[u8], observer: &mut dyn Observer) {
        let ev = unsafe { &*(buf.as_ptr() as *const sys::EventIsoResource) };
        let event = ResourceEvent {
            channel: ev.channel,
            bandwidth: ev.bandwidth,
            err_code: if ev.channel < 0 { -ev.channel } else { 0 },
        };
        if ev.type_ == sys::EVENT_ISO_RESOURCE_ALLOCATED {
            observer.on_allocated(event);
        } else {
            observer.on_deallocated(event);
        }
    }
}

impl Drop for ResourceOnce {
    fn drop(&mut self) {
        sys::close(self.fd).ok();
    }
}
