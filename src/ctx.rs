//! Shared machinery for all three isochronous context variants (`SPEC_FULL.md` §4.1).

use std::ffi::CString;
use std::mem;
use std::os::unix::io::RawFd;

use bitflags::bitflags;
use log::{debug, warn};

use crate::err::{CtxError, Result};
use crate::mmap::Pointer;
use crate::sys;

bitflags! {
    /// Control-word flag bits packed alongside the tag/sy/header-length/
    /// payload-length fields of one [`DescriptorWord`].
    struct ControlFlags: u32 {
        const SKIP      = 1 << 31;
        const INTERRUPT = 1 << 30;
    }
}

/// OHCI context shape.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Mode {
    Transmit,
    ReceiveSingle,
    ReceiveMultichannel,
}

impl Mode {
    fn kernel_type(self) -> u32 {
        match self {
            Mode::Transmit => sys::ISO_CONTEXT_TRANSMIT,
            Mode::ReceiveSingle => sys::ISO_CONTEXT_RECEIVE,
            Mode::ReceiveMultichannel => sys::ISO_CONTEXT_RECEIVE_MULTICHANNEL,
        }
    }

    fn mmap_prot(self) -> libc::c_int {
        match self {
            Mode::Transmit => libc::PROT_READ | libc::PROT_WRITE,
            Mode::ReceiveSingle | Mode::ReceiveMultichannel => libc::PROT_READ,
        }
    }
}

/// 1394 link speed; only meaningful to [`Mode::Transmit`] and
/// [`Mode::ReceiveMultichannel`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum Speed {
    S100 = 0,
    S200 = 1,
    S400 = 2,
    S800 = 3,
    S1600 = 4,
    S3200 = 5,
}

/// One fixed-size descriptor record plus the optional header bytes that
/// follow it for transmit packets (`SPEC_FULL.md` §3 PacketDescriptor).
#[repr(C)]
#[derive(Debug, Copy, Clone, Default)]
struct DescriptorWord {
    control: u32,
    irq_payload: u32,
}

impl DescriptorWord {
    const CONTROL_TAG_SHIFT: u32 = 28;
    const CONTROL_SY_SHIFT: u32 = 24;
    const CONTROL_HEADER_LEN_SHIFT: u32 = 16;
    const CONTROL_PAYLOAD_LEN_MASK: u32 = 0xffff;

    fn pack(
        skip: bool,
        interrupt: bool,
        tags: u8,
        sy: u8,
        header_length: u8,
        payload_length: u16,
    ) -> Self {
        let mut flags = ControlFlags::empty();
        flags.set(ControlFlags::SKIP, skip);
        flags.set(ControlFlags::INTERRUPT, interrupt);

        let control = flags.bits()
            | (tags as u32) << Self::CONTROL_TAG_SHIFT
            | (sy as u32) << Self::CONTROL_SY_SHIFT
            | (header_length as u32) << Self::CONTROL_HEADER_LEN_SHIFT
            | payload_length as u32 & Self::CONTROL_PAYLOAD_LEN_MASK;
        Self {
            control,
            irq_payload: 0,
        }
    }
}

const DESCRIPTOR_SIZE: usize = mem::size_of::<DescriptorWord>();

/// Shared state owned by all three context variants: the character-device
/// fd, the kernel handle, the mmap'd payload ring, and the descriptor
/// staging area.
#[derive(Debug)]
pub struct CtxState {
    fd: RawFd,
    handle: u32,
    mode: Mode,
    header_size: u32,

    ring: Option<Pointer<u8>>,
    bytes_per_chunk: u32,
    chunks_per_buffer: u32,

    staging: Vec<u8>,
    data_length: usize,
    registered_chunk_count: u32,

    curr_offset: u32,
    running: bool,
}

impl CtxState {
    pub(crate) fn new() -> Self {
        Self {
            fd: -1,
            handle: 0,
            mode: Mode::Transmit,
            header_size: 0,
            ring: None,
            bytes_per_chunk: 0,
            chunks_per_buffer: 0,
            staging: Vec::new(),
            data_length: 0,
            registered_chunk_count: 0,
            curr_offset: 0,
            running: false,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn handle(&self) -> u32 {
        self.handle
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn ring_size(&self) -> usize {
        self.bytes_per_chunk as usize * self.chunks_per_buffer as usize
    }

    pub fn bytes_per_chunk(&self) -> u32 {
        self.bytes_per_chunk
    }

    pub fn chunks_per_buffer(&self) -> u32 {
        self.chunks_per_buffer
    }

    pub fn curr_offset(&self) -> u32 {
        self.curr_offset
    }

    /// See `SPEC_FULL.md` §4.1 `allocate`. Called on a freshly-constructed or
    /// previously-[`release`](Self::release)d instance; a second call before
    /// `release` fails with [`CtxError::Opened`], mirroring
    /// `hinoko_fw_iso_ctx_allocate`'s `priv->fd >= 0` guard.
    pub fn allocate(
        &mut self,
        path: &str,
        mode: Mode,
        speed: Speed,
        channel: u32,
        header_size: u32,
    ) -> Result<()> {
        if path.is_empty() {
            return Err(CtxError::failed(
                "allocate",
                std::io::Error::from(std::io::ErrorKind::InvalidInput),
            ));
        }
        if channel >= 64 {
            return Err(CtxError::failed(
                "allocate",
                std::io::Error::from(std::io::ErrorKind::InvalidInput),
            ));
        }
        if header_size % 4 != 0 {
            return Err(CtxError::failed(
                "allocate",
                std::io::Error::from(std::io::ErrorKind::InvalidInput),
            ));
        }
        match mode {
            Mode::ReceiveSingle if header_size < 4 => {
                return Err(CtxError::failed(
                    "allocate",
                    std::io::Error::from(std::io::ErrorKind::InvalidInput),
                ))
            }
            Mode::ReceiveMultichannel if header_size != 0 || channel != 0 => {
                return Err(CtxError::failed(
                    "allocate",
                    std::io::Error::from(std::io::ErrorKind::InvalidInput),
                ))
            }
            _ => {}
        }

        if self.fd >= 0 {
            return Err(CtxError::Opened);
        }

        let c_path = CString::new(path)
            .map_err(|e| CtxError::failed("open", std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))?;
        let fd = sys::open(&c_path, libc::O_RDWR).map_err(|e| CtxError::failed("open", e))?;

        let mut info = sys::GetInfo {
            version: sys::MIN_ABI_VERSION,
            ..Default::default()
        };
        if let Err(e) = unsafe { sys::ioctl(fd, sys::get_info_request(), &mut info) } {
            sys::close(fd).ok();
            return Err(CtxError::failed("GET_INFO", e));
        }

        let mut create = sys::CreateIsoContext {
            type_: mode.kernel_type(),
            header_size,
            channel,
            speed: speed as u32,
            ..Default::default()
        };
        if let Err(e) = unsafe { sys::ioctl(fd, sys::create_iso_context_request(), &mut create) } {
            sys::close(fd).ok();
            return Err(CtxError::failed("CREATE_ISO_CONTEXT", e));
        }

        debug!(
            "allocated {:?} context handle={} channel={} on {}",
            mode, create.handle, channel, path
        );

        self.fd = fd;
        self.handle = create.handle;
        self.mode = mode;
        self.header_size = header_size;
        Ok(())
    }

    /// See `SPEC_FULL.md` §4.1 `release`: unmaps the buffer (if any) and
    /// closes the fd. Idempotent, and leaves the instance ready for another
    /// `allocate` call — mirroring `hinoko_fw_iso_ctx_release`'s `priv->fd = -1`.
    pub fn release(&mut self) {
        self.unmap_buffer();
        if self.fd >= 0 {
            debug!("releasing context handle={}", self.handle);
            sys::close(self.fd).ok();
        }
        self.fd = -1;
        self.handle = 0;
        self.running = false;
    }

    /// See `SPEC_FULL.md` §4.1 `map_buffer`.
    pub fn map_buffer(&mut self, bytes_per_chunk: u32, chunks_per_buffer: u32) -> Result<()> {
        if self.fd < 0 {
            return Err(CtxError::NotOpened);
        }
        if self.ring.is_some() {
            return Err(CtxError::Mapped);
        }
        if bytes_per_chunk == 0 || chunks_per_buffer == 0 {
            return Err(CtxError::failed(
                "map_buffer",
                std::io::Error::from(std::io::ErrorKind::InvalidInput),
            ));
        }

        let per_desc_header = match self.mode {
            Mode::Transmit | Mode::ReceiveSingle => self.header_size as usize,
            Mode::ReceiveMultichannel => 0,
        };
        let staging_cap =
            chunks_per_buffer as usize * (DESCRIPTOR_SIZE + per_desc_header);

        let ring_len = bytes_per_chunk as usize * chunks_per_buffer as usize;
        let ring = unsafe {
            Pointer::<u8>::try_new(ring_len, self.mode.mmap_prot(), self.fd, 0)
        }
        .map_err(|e| CtxError::failed("mmap", e))?;

        debug!(
            "mapped handle={} bytes_per_chunk={} chunks_per_buffer={}",
            self.handle, bytes_per_chunk, chunks_per_buffer
        );

        self.ring = Some(ring);
        self.bytes_per_chunk = bytes_per_chunk;
        self.chunks_per_buffer = chunks_per_buffer;
        self.staging = Vec::with_capacity(staging_cap);
        self.data_length = 0;
        self.registered_chunk_count = 0;
        self.curr_offset = 0;
        Ok(())
    }

    /// See `SPEC_FULL.md` §4.1 `unmap_buffer`.
    pub fn unmap_buffer(&mut self) {
        if self.ring.is_some() {
            debug!("unmapped handle={}", self.handle);
        }
        self.ring = None;
        self.staging.clear();
        self.data_length = 0;
        self.registered_chunk_count = 0;
    }

    /// See `SPEC_FULL.md` §4.1 `register_chunk`. For receive contexts, the
    /// caller-supplied `header_length`/`payload_length` are ignored and
    /// substituted with the full chunk's capacity (and, for
    /// [`Mode::ReceiveSingle`], the context's configured `header_size`) —
    /// mirroring `hinoko_fw_iso_ctx_register_chunk`, which claims the whole
    /// chunk for a receive descriptor rather than trusting the caller.
    pub fn register_chunk(
        &mut self,
        skip: bool,
        tags: u8,
        sy: u8,
        header: &[u8],
        header_length: u8,
        payload_length: u16,
        schedule_interrupt: bool,
    ) -> Result<()> {
        if self.fd < 0 {
            return Err(CtxError::NotOpened);
        }
        if self.ring.is_none() {
            return Err(CtxError::NotMapped);
        }

        let (header_length, payload_length) = match self.mode {
            Mode::Transmit => (header_length, payload_length),
            Mode::ReceiveSingle => (self.header_size as u8, self.bytes_per_chunk as u16),
            Mode::ReceiveMultichannel => (0, self.bytes_per_chunk as u16),
        };

        if payload_length as u32 > self.bytes_per_chunk {
            return Err(CtxError::failed(
                "register_chunk",
                std::io::Error::from(std::io::ErrorKind::InvalidInput),
            ));
        }

        let entry_size = DESCRIPTOR_SIZE + header_length as usize;
        if self.data_length + entry_size > self.staging.capacity() {
            warn!(
                "register_chunk overflow: {} + {} > {}",
                self.data_length,
                entry_size,
                self.staging.capacity()
            );
            return Err(CtxError::failed(
                "register_chunk",
                std::io::Error::from(std::io::ErrorKind::OutOfMemory),
            ));
        }

        let word = DescriptorWord::pack(skip, schedule_interrupt, tags, sy, header_length, payload_length);
        self.staging
            .extend_from_slice(unsafe { as_bytes(&word) });
        if self.mode == Mode::Transmit {
            self.staging.extend_from_slice(&header[..header_length as usize]);
        } else {
            // Receive descriptors reserve header space for the kernel to
            // fill in; there is nothing to copy from the caller.
            self.staging.resize(self.staging.len() + header_length as usize, 0);
        }
        self.data_length += entry_size;
        self.registered_chunk_count += 1;
        Ok(())
    }

    /// See `SPEC_FULL.md` §4.1 `queue_chunks`.
    pub fn queue_chunks(&mut self) -> Result<()> {
        if self.staging.is_empty() {
            return Ok(());
        }
        let ring_size = self.ring_size() as u32;
        let mut data_offset = 0usize;
        let mut buf_offset = self.curr_offset;

        while data_offset < self.staging.len() {
            let run_start = data_offset;
            let mut run_bytes: u32 = 0;
            while data_offset < self.staging.len() {
                let word = unsafe {
                    &*(self.staging.as_ptr().add(data_offset) as *const DescriptorWord)
                };
                let header_length =
                    (word.control >> DescriptorWord::CONTROL_HEADER_LEN_SHIFT) as u8 as usize;
                let payload_length =
                    (word.control & DescriptorWord::CONTROL_PAYLOAD_LEN_MASK) as u32;
                if buf_offset + run_bytes + payload_length > ring_size {
                    break;
                }
                run_bytes += payload_length;
                data_offset += DESCRIPTOR_SIZE + header_length;
            }

            if run_bytes == 0 && data_offset == run_start {
                // Next descriptor's payload alone overflows the remainder;
                // wrap and retry from offset 0.
                buf_offset = 0;
                continue;
            }

            self.submit_run(run_start, data_offset, buf_offset, run_bytes)?;
            buf_offset = (buf_offset + run_bytes) % ring_size.max(1);
        }

        self.curr_offset = buf_offset;
        self.staging.clear();
        self.data_length = 0;
        self.registered_chunk_count = 0;
        Ok(())
    }

    fn submit_run(
        &self,
        data_offset: usize,
        data_end: usize,
        buf_offset: u32,
        run_bytes: u32,
    ) -> Result<()> {
        let ring = self.ring.as_ref().ok_or(CtxError::NotMapped)?;
        let mut req = sys::QueueIso {
            packets: unsafe { self.staging.as_ptr().add(data_offset) as u64 },
            data: unsafe { ring.as_ptr().add(buf_offset as usize) as u64 },
            size: (data_end - data_offset) as u32,
            handle: self.handle,
        };
        unsafe { sys::ioctl(self.fd, sys::queue_iso_request(), &mut req) }
            .map(drop)
            .map_err(|e| CtxError::failed("QUEUE_ISO", e))?;
        let _ = run_bytes;
        Ok(())
    }

    /// See `SPEC_FULL.md` §4.1 `start`.
    pub fn start(&mut self, cycle_match: Option<(u16, u16)>, sync: u32, tags: u32) -> Result<()> {
        if self.registered_chunk_count == 0 && self.staging.is_empty() {
            return Err(CtxError::ChunkUnregistered);
        }
        self.queue_chunks()?;

        let cycle = match cycle_match {
            None => -1,
            Some((sec, cyc)) => ((sec as i32) << 13 | cyc as i32),
        };
        let mut req = sys::StartIso {
            cycle,
            sync,
            tags,
            handle: self.handle,
        };
        unsafe { sys::ioctl(self.fd, sys::start_iso_request(), &mut req) }
            .map_err(|e| CtxError::failed("START_ISO", e))?;
        self.running = true;
        Ok(())
    }

    /// See `SPEC_FULL.md` §4.1 `stop`.
    pub fn stop(&mut self) -> Result<()> {
        if !self.running {
            return Ok(());
        }
        let mut req = sys::StopIso {
            handle: self.handle,
        };
        unsafe { sys::ioctl(self.fd, sys::stop_iso_request(), &mut req) }
            .map_err(|e| CtxError::failed("STOP_ISO", e))?;
        self.running = false;
        self.registered_chunk_count = 0;
        self.data_length = 0;
        self.curr_offset = 0;
        Ok(())
    }

    /// See `SPEC_FULL.md` §4.1 cycle-time read.
    pub fn get_cycle_timer(&self, clock_id: i32) -> Result<(u32, i64, i32)> {
        let mut req = sys::GetCycleTimer2 {
            clk_id: clock_id,
            ..Default::default()
        };
        unsafe { sys::ioctl(self.fd, sys::get_cycle_timer2_request(), &mut req) }
            .map_err(|e| CtxError::failed("GET_CYCLE_TIMER2", e))?;
        Ok((req.cycle_timer, req.tv_sec, req.tv_nsec))
    }

    /// See `SPEC_FULL.md` §4.1 `flush_completions`.
    pub fn flush_completions(&self) -> Result<()> {
        let mut req = sys::FlushIso {
            handle: self.handle,
        };
        unsafe { sys::ioctl(self.fd, sys::flush_iso_request(), &mut req) }
            .map(drop)
            .map_err(|e| CtxError::failed("FLUSH_ISO", e))
    }

    pub fn set_iso_channels(&self, mask: u64) -> Result<u64> {
        let mut req = sys::SetIsoChannels {
            channels: mask,
            handle: self.handle,
        };
        unsafe { sys::ioctl(self.fd, sys::set_iso_channels_request(), &mut req) }
            .map_err(|e| CtxError::failed("SET_ISO_CHANNELS", e))?;
        Ok(req.channels)
    }

    /// # Safety
    /// Valid only while no kernel write to `[0, len)` of the ring is in
    /// flight past `len`; see `SPEC_FULL.md` §9 circular buffer ownership.
    pub unsafe fn ring_slice(&self) -> Option<&[u8]> {
        self.ring.as_ref().map(|r| r.as_slice())
    }

    /// # Safety
    /// Only sound for a transmit ring never concurrently read by the kernel
    /// ahead of the write cursor.
    pub unsafe fn ring_slice_mut(&self) -> Option<&mut [u8]> {
        self.ring.as_ref().map(|r| r.as_mut_slice())
    }

    pub fn has_ring(&self) -> bool {
        self.ring.is_some()
    }
}

impl Drop for CtxState {
    fn drop(&mut self) {
        self.release();
    }
}

unsafe fn as_bytes<T: Copy>(value: &T) -> &[u8] {
    std::slice::from_raw_parts(value as *const T as *const u8, mem::size_of::<T>())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapped_state(bytes_per_chunk: u32, chunks_per_buffer: u32) -> CtxState {
        mapped_state_with_mode(Mode::Transmit, 4, bytes_per_chunk, chunks_per_buffer)
    }

    fn mapped_state_with_mode(
        mode: Mode,
        header_size: u32,
        bytes_per_chunk: u32,
        chunks_per_buffer: u32,
    ) -> CtxState {
        let mut state = CtxState::new();
        state.fd = 9999; // not a real fd; only descriptor-packing logic is exercised
        state.mode = mode;
        state.header_size = header_size;
        state.bytes_per_chunk = bytes_per_chunk;
        state.chunks_per_buffer = chunks_per_buffer;
        state.staging = Vec::with_capacity(
            chunks_per_buffer as usize * (DESCRIPTOR_SIZE + header_size as usize),
        );
        // register_chunk only requires `ring` to be present; back it with a
        // real anonymous mapping so the descriptor-packing logic under test
        // can run without a real firewire-cdev fd.
        let ring_len = (bytes_per_chunk as usize * chunks_per_buffer as usize).max(1);
        let c_path = CString::new("/dev/zero").unwrap();
        let zero_fd = sys::open(&c_path, libc::O_RDWR).unwrap();
        let ring = unsafe {
            Pointer::<u8>::try_new(ring_len, mode.mmap_prot(), zero_fd, 0).unwrap()
        };
        sys::close(zero_fd).unwrap();
        state.ring = Some(ring);
        state
    }

    fn decode_control(staging: &[u8]) -> (u8, u16) {
        let word = unsafe { &*(staging.as_ptr() as *const DescriptorWord) };
        let header_length = (word.control >> DescriptorWord::CONTROL_HEADER_LEN_SHIFT) as u8;
        let payload_length = (word.control & DescriptorWord::CONTROL_PAYLOAD_LEN_MASK) as u16;
        (header_length, payload_length)
    }

    #[test]
    fn register_chunk_accumulates_staging_and_counters() {
        let mut state = mapped_state(64, 4);
        state.register_chunk(false, 0, 0, &[1, 2, 3, 4], 4, 32, false).unwrap();
        state.register_chunk(false, 0, 0, &[5, 6, 7, 8], 4, 16, false).unwrap();
        assert_eq!(state.registered_chunk_count, 2);
        assert_eq!(state.data_length, 2 * (DESCRIPTOR_SIZE + 4));
    }

    #[test]
    fn register_chunk_substitutes_full_chunk_and_header_for_receive_single() {
        let mut state = mapped_state_with_mode(Mode::ReceiveSingle, 8, 32, 4);
        state.register_chunk(false, 0, 0, &[], 0, 0, false).unwrap();
        assert_eq!(state.data_length, DESCRIPTOR_SIZE + 8);
        let (header_length, payload_length) = decode_control(&state.staging);
        assert_eq!(header_length, 8);
        assert_eq!(payload_length, 32);
    }

    #[test]
    fn register_chunk_substitutes_full_chunk_and_no_header_for_receive_multichannel() {
        let mut state = mapped_state_with_mode(Mode::ReceiveMultichannel, 0, 48, 4);
        state.register_chunk(false, 0, 0, &[], 0, 0, false).unwrap();
        assert_eq!(state.data_length, DESCRIPTOR_SIZE);
        let (header_length, payload_length) = decode_control(&state.staging);
        assert_eq!(header_length, 0);
        assert_eq!(payload_length, 48);
    }

    #[test]
    fn register_chunk_rejects_payload_larger_than_chunk() {
        let mut state = mapped_state(16, 4);
        let err = state
            .register_chunk(false, 0, 0, &[], 0, 17, false)
            .unwrap_err();
        assert!(matches!(err, CtxError::Failed { .. }));
    }

    #[test]
    fn register_chunk_without_map_fails_not_mapped() {
        let mut state = CtxState::new();
        state.fd = 9999;
        let err = state
            .register_chunk(false, 0, 0, &[], 0, 0, false)
            .unwrap_err();
        assert!(matches!(err, CtxError::NotMapped));
    }

    #[test]
    fn map_buffer_without_allocate_fails_not_opened() {
        let mut state = CtxState::new();
        let err = state.map_buffer(16, 4).unwrap_err();
        assert!(matches!(err, CtxError::NotOpened));
    }

    #[test]
    fn start_without_registered_chunk_fails() {
        let mut state = mapped_state(16, 4);
        let err = state.start(None, 0, 0).unwrap_err();
        assert!(matches!(err, CtxError::ChunkUnregistered));
    }

    #[test]
    fn allocate_while_already_open_fails_opened() {
        let mut state = CtxState::new();
        state.fd = 9999; // simulate an outstanding allocation
        let err = state
            .allocate("/dev/fw1", Mode::Transmit, Speed::S400, 0, 0)
            .unwrap_err();
        assert!(matches!(err, CtxError::Opened));
    }

    #[test]
    fn release_resets_fd_and_is_idempotent() {
        let mut state = mapped_state(16, 4);
        state.fd = 9999;
        state.running = true;
        state.release();
        assert_eq!(state.fd, -1);
        assert!(!state.is_running());
        assert!(!state.has_ring());
        state.release(); // idempotent: no panic, no double-close
        assert_eq!(state.fd, -1);
    }
}
