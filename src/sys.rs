//! Raw bindings to the Linux `firewire-cdev` character-device ABI.
//!
//! Struct layouts mirror `<linux/firewire-cdev.h>` (ABI version >= 5) and are
//! taken as given constants; this module only wraps them in `repr(C)` and
//! issues the matching `ioctl(2)` calls through [`cvt`].

use std::io::{Error, Result};
use std::mem;
use std::os::unix::io::RawFd;

use libc;
use log::trace;

const IOC_NRBITS: u32 = 8;
const IOC_TYPEBITS: u32 = 8;
const IOC_SIZEBITS: u32 = 14;

const IOC_NRSHIFT: u32 = 0;
const IOC_TYPESHIFT: u32 = IOC_NRSHIFT + IOC_NRBITS;
const IOC_SIZESHIFT: u32 = IOC_TYPESHIFT + IOC_TYPEBITS;
const IOC_DIRSHIFT: u32 = IOC_SIZESHIFT + IOC_SIZEBITS;

const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

const FW_CDEV_MAGIC: u32 = b'#' as u32;

const fn ioc(dir: u32, nr: u32, size: u32) -> libc::c_ulong {
    ((dir << IOC_DIRSHIFT)
        | (FW_CDEV_MAGIC << IOC_TYPESHIFT)
        | (nr << IOC_NRSHIFT)
        | (size << IOC_SIZESHIFT)) as libc::c_ulong
}

const fn iow<T>(nr: u32) -> libc::c_ulong {
    ioc(IOC_WRITE, nr, mem::size_of::<T>() as u32)
}

const fn iowr<T>(nr: u32) -> libc::c_ulong {
    ioc(IOC_READ | IOC_WRITE, nr, mem::size_of::<T>() as u32)
}

/// ABI version the core requires to rely on auto-flush-on-overflow semantics.
pub const MIN_ABI_VERSION: u32 = 5;

#[repr(C)]
#[derive(Debug, Copy, Clone, Default)]
pub struct GetInfo {
    pub version: u32,
    pub rom_length: u32,
    pub rom: u64,
    pub bus_reset: u64,
    pub bus_reset_closure: u64,
    pub card: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Default)]
pub struct CreateIsoContext {
    pub type_: u32,
    pub header_size: u32,
    pub channel: u32,
    pub speed: u32,
    pub closure: u64,
    pub handle: u32,
}

// fw_cdev_create_iso_context.type
pub const ISO_CONTEXT_TRANSMIT: u32 = 0;
pub const ISO_CONTEXT_RECEIVE: u32 = 1;
pub const ISO_CONTEXT_RECEIVE_MULTICHANNEL: u32 = 2;

#[repr(C)]
#[derive(Debug, Copy, Clone, Default)]
pub struct QueueIso {
    pub packets: u64,
    pub data: u64,
    pub size: u32,
    pub handle: u32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Default)]
pub struct StartIso {
    pub cycle: i32,
    pub sync: u32,
    pub tags: u32,
    pub handle: u32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Default)]
pub struct StopIso {
    pub handle: u32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Default)]
pub struct FlushIso {
    pub handle: u32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Default)]
pub struct GetCycleTimer2 {
    pub tv_sec: i64,
    pub tv_nsec: i32,
    pub clk_id: i32,
    pub cycle_timer: u32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Default)]
pub struct SetIsoChannels {
    pub channels: u64,
    pub handle: u32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Default)]
pub struct AllocateIsoResource {
    pub channels: u64,
    pub bandwidth: u32,
    pub handle: u32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Default)]
pub struct Deallocate {
    pub handle: u32,
}

// fw_cdev_event_common.type
pub const EVENT_ISO_INTERRUPT: u32 = 2;
pub const EVENT_ISO_RESOURCE_ALLOCATED: u32 = 4;
pub const EVENT_ISO_RESOURCE_DEALLOCATED: u32 = 5;
pub const EVENT_ISO_INTERRUPT_MULTICHANNEL: u32 = 9;

#[repr(C)]
#[derive(Debug, Copy, Clone, Default)]
pub struct EventCommon {
    pub closure: u64,
    pub type_: u32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Default)]
pub struct EventIsoInterrupt {
    pub closure: u64,
    pub type_: u32,
    pub cycle: u32,
    pub header_length: u32,
    // followed by `header_length` bytes of packet header data
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Default)]
pub struct EventIsoInterruptMultichannel {
    pub closure: u64,
    pub type_: u32,
    pub completed: u32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Default)]
pub struct EventIsoResource {
    pub closure: u64,
    pub type_: u32,
    pub channel: i32,
    pub bandwidth: i32,
    pub handle: u32,
}

pub fn get_info_request() -> libc::c_ulong {
    iowr::<GetInfo>(0x00)
}

pub fn create_iso_context_request() -> libc::c_ulong {
    iowr::<CreateIsoContext>(0x08)
}

pub fn queue_iso_request() -> libc::c_ulong {
    iowr::<QueueIso>(0x09)
}

pub fn start_iso_request() -> libc::c_ulong {
    iow::<StartIso>(0x0a)
}

pub fn stop_iso_request() -> libc::c_ulong {
    iow::<StopIso>(0x0b)
}

pub fn get_cycle_timer2_request() -> libc::c_ulong {
    iowr::<GetCycleTimer2>(0x14)
}

pub fn set_iso_channels_request() -> libc::c_ulong {
    iow::<SetIsoChannels>(0x15)
}

pub fn flush_iso_request() -> libc::c_ulong {
    iow::<FlushIso>(0x12)
}

pub fn allocate_iso_resource_request() -> libc::c_ulong {
    iowr::<AllocateIsoResource>(0x0d)
}

pub fn deallocate_iso_resource_request() -> libc::c_ulong {
    iow::<Deallocate>(0x0e)
}

pub fn allocate_iso_resource_once_request() -> libc::c_ulong {
    iow::<AllocateIsoResource>(0x0f)
}

pub fn deallocate_iso_resource_once_request() -> libc::c_ulong {
    iow::<Deallocate>(0x10)
}

#[inline]
pub fn cvt(ret: libc::c_int) -> Result<libc::c_int> {
    if ret >= 0 {
        Ok(ret)
    } else {
        Err(Error::last_os_error())
    }
}

/// # Safety
/// `arg` must point to a value of the type the kernel expects for `request`.
pub unsafe fn ioctl<T>(fd: RawFd, request: libc::c_ulong, arg: *mut T) -> Result<libc::c_int> {
    trace!("ioctl fd={} request={:#x}", fd, request);
    cvt(libc::ioctl(fd, request as _, arg))
}

pub fn mmap(
    len: usize,
    prot: libc::c_int,
    fd: RawFd,
    offset: libc::off_t,
) -> Result<*mut libc::c_void> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            prot,
            libc::MAP_SHARED,
            fd,
            offset,
        )
    };
    if ptr == libc::MAP_FAILED {
        Err(Error::last_os_error())
    } else {
        Ok(ptr)
    }
}

/// # Safety
/// `addr`/`len` must describe a mapping previously returned by [`mmap`].
pub unsafe fn munmap(addr: *mut libc::c_void, len: usize) -> Result<()> {
    cvt(libc::munmap(addr, len)).map(drop)
}

pub fn open(path: &std::ffi::CStr, flags: libc::c_int) -> Result<RawFd> {
    let fd = unsafe { libc::open(path.as_ptr(), flags) };
    cvt(fd)
}

pub fn close(fd: RawFd) -> Result<()> {
    cvt(unsafe { libc::close(fd) }).map(drop)
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    cvt(n as libc::c_int).map(|n| n as usize)
}
