//! Isochronous receive, packet-per-buffer, single channel (`SPEC_FULL.md` §4.3),
//! grounded on `examples/original_source/src/fw_iso_ir_single.c`.

use std::os::unix::io::RawFd;

use log::trace;

use crate::ctx::{CtxState, Mode, Speed};
use crate::err::Result;
use crate::event::{page_size, read_event, DispatchResult, Source};
use crate::sys;

/// A live batch of received headers; `get_payload` is only valid while this
/// value is alive (borrowed from the event buffer), preventing use-after-event
/// access at compile time (`SPEC_FULL.md` §9).
pub struct Event<'a> {
    pub sec: u32,
    pub cycle: u32,
    headers: &'a [u8],
    header_size: u32,
    chunk_cursor: u32,
    chunks_per_buffer: u32,
    bytes_per_chunk: u32,
    ring: &'a [u8],
}

impl<'a> Event<'a> {
    pub fn count(&self) -> u32 {
        if self.header_size == 0 {
            0
        } else {
            self.headers.len() as u32 / self.header_size
        }
    }

    pub fn header(&self, index: u32) -> &'a [u8] {
        let start = (index * self.header_size) as usize;
        &self.headers[start..start + self.header_size as usize]
    }

    /// See `SPEC_FULL.md` §4.3 `get_payload`.
    pub fn get_payload(&self, index: u32) -> &'a [u8] {
        let header = self.header(index);
        let iso_header = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let mut data_length = (iso_header >> 16) & 0xffff;
        if self.header_size > 8 {
            data_length = data_length.saturating_sub(self.header_size - 8);
        }
        data_length = data_length.min(self.bytes_per_chunk);

        let chunk = (self.chunk_cursor + index) % self.chunks_per_buffer.max(1);
        let offset = chunk as usize * self.bytes_per_chunk as usize;
        &self.ring[offset..offset + data_length as usize]
    }
}

pub trait Observer {
    fn on_interrupt(&mut self, event: &Event<'_>);
    fn on_stopped(&mut self, error: Option<&crate::err::CtxError>) {
        let _ = error;
    }
}

/// One packet-per-buffer receive (IR-single) context.
pub struct IsoRxSingle {
    state: CtxState,
    header_size: u32,
    chunk_cursor: u32,
}

impl IsoRxSingle {
    pub fn allocate(path: &str, speed: Speed, channel: u32, header_size: u32) -> Result<Self> {
        let mut state = CtxState::new();
        state.allocate(path, Mode::ReceiveSingle, speed, channel, header_size)?;
        Ok(Self {
            state,
            header_size,
            chunk_cursor: 0,
        })
    }

    pub fn map_buffer(&mut self, bytes_per_chunk: u32, chunks_per_buffer: u32) -> Result<()> {
        self.state.map_buffer(bytes_per_chunk, chunks_per_buffer)?;
        self.chunk_cursor = 0;
        Ok(())
    }

    pub fn unmap_buffer(&mut self) {
        self.state.unmap_buffer();
        self.chunk_cursor = 0;
    }

    pub fn start(&mut self, cycle_match: Option<(u16, u16)>) -> Result<()> {
        self.state.start(cycle_match, 0, 0)
    }

    /// See `SPEC_FULL.md` §4.1 `stop`: emits `on_stopped` exactly when the
    /// running:true→false transition is observed, matching
    /// `fw_iso_ir_single.c`'s explicit-stop wrapper.
    pub fn stop(&mut self, observer: &mut dyn Observer) -> Result<()> {
        let was_running = self.state.is_running();
        let result = self.state.stop();
        if was_running && !self.state.is_running() {
            observer.on_stopped(None);
        }
        result
    }

    pub fn fd(&self) -> RawFd {
        self.state.fd()
    }

    /// See `SPEC_FULL.md` §4.3 `register_packet`.
    pub fn register_packet(&mut self, schedule_interrupt: bool) -> Result<()> {
        self.state
            .register_chunk(false, 0, 0, &[], 0, 0, schedule_interrupt)
    }

    pub fn queue_chunks(&mut self) -> Result<()> {
        self.state.queue_chunks()
    }

    /// See `SPEC_FULL.md` §4.3 interrupt handler.
    pub fn handle_event(&mut self, buf: &[u8], observer: &mut dyn Observer) -> Result<()> {
        let hdr = unsafe { &*(buf.as_ptr() as *const sys::EventIsoInterrupt) };
        let sec = (hdr.cycle & 0x0000_e000) >> 13;
        let cycle = hdr.cycle & 0x0000_1fff;
        let headers = &buf[std::mem::size_of::<sys::EventIsoInterrupt>()
            ..std::mem::size_of::<sys::EventIsoInterrupt>() + hdr.header_length as usize];

        let ring = unsafe { self.state.ring_slice() }.expect("ring mapped before handle_event");
        let event = Event {
            sec,
            cycle,
            headers,
            header_size: self.header_size,
            chunk_cursor: self.chunk_cursor,
            chunks_per_buffer: self.state.chunks_per_buffer(),
            bytes_per_chunk: self.state.bytes_per_chunk(),
            ring,
        };
        let count = event.count();
        observer.on_interrupt(&event);

        self.chunk_cursor = (self.chunk_cursor + count) % self.state.chunks_per_buffer().max(1);
        self.queue_chunks()
    }
}

/// Adapter implementing the generic [`Source`] hook for a host event loop.
pub struct RxSingleSource<'a> {
    ctx: &'a mut IsoRxSingle,
    observer: &'a mut dyn Observer,
    buf: Vec<u8>,
}

impl<'a> RxSingleSource<'a> {
    pub fn new(ctx: &'a mut IsoRxSingle, observer: &'a mut dyn Observer) -> Self {
        Self {
            ctx,
            observer,
            buf: vec![0u8; page_size()],
        }
    }
}

impl Source for RxSingleSource<'_> {
    fn fd(&self) -> RawFd {
        self.ctx.fd()
    }

    fn dispatch(&mut self) -> DispatchResult {
        match read_event(self.fd(), &mut self.buf) {
            Ok(Some(n)) => {
                if let Err(e) = self.ctx.handle_event(&self.buf[..n], self.observer) {
                    trace!("ir_single handle_event error: {}", e);
                    self.observer.on_stopped(Some(&e));
                    return DispatchResult::Remove;
                }
                DispatchResult::Continue
            }
            Ok(None) => DispatchResult::Continue,
            Err(_) => {
                self.observer.on_stopped(None);
                DispatchResult::Remove
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_payload_extracts_big_endian_data_length() {
        let ring = vec![0xABu8; 64];
        let iso_header: u32 = 16u32 << 16; // data_length = 16
        let mut headers = vec![0u8; 8];
        headers[0..4].copy_from_slice(&iso_header.to_be_bytes());

        let event = Event {
            sec: 0,
            cycle: 0,
            headers: &headers,
            header_size: 8,
            chunk_cursor: 0,
            chunks_per_buffer: 4,
            bytes_per_chunk: 32,
            ring: &ring,
        };
        let payload = event.get_payload(0);
        assert_eq!(payload.len(), 16);
    }

    #[test]
    fn get_payload_subtracts_header_overhead_beyond_8_bytes() {
        let ring = vec![0u8; 64];
        let iso_header: u32 = 20u32 << 16; // data_length = 20
        let mut headers = vec![0u8; 12];
        headers[0..4].copy_from_slice(&iso_header.to_be_bytes());

        let event = Event {
            sec: 0,
            cycle: 0,
            headers: &headers,
            header_size: 12,
            chunk_cursor: 0,
            chunks_per_buffer: 4,
            bytes_per_chunk: 32,
            ring: &ring,
        };
        // header_size(12) - 8 = 4 subtracted from data_length(20) -> 16
        assert_eq!(event.get_payload(0).len(), 16);
    }
}
