//! Isochronous transmit context (`SPEC_FULL.md` §4.2), grounded on
//! `examples/original_source/src/fw_iso_tx.c`.

use std::os::unix::io::RawFd;

use log::trace;

use crate::ctx::{CtxState, Mode, Speed};
use crate::err::Result;
use crate::event::{page_size, read_event, DispatchResult, Source};
use crate::sys;

/// `(sec, cycle, timestamps, count)` delivered on an iso-interrupt event.
pub struct Interrupt<'a> {
    pub sec: u32,
    pub cycle: u32,
    pub timestamps: &'a [u8],
    pub count: u32,
}

pub trait Observer {
    fn on_interrupt(&mut self, event: Interrupt<'_>);
    fn on_stopped(&mut self, error: Option<&crate::err::CtxError>) {
        let _ = error;
    }
}

/// One transmit (IT) context.
pub struct IsoTx {
    state: CtxState,
    offset: u32,
}

impl IsoTx {
    pub fn allocate(path: &str, speed: Speed, channel: u32, header_size: u32) -> Result<Self> {
        let mut state = CtxState::new();
        state.allocate(path, Mode::Transmit, speed, channel, header_size)?;
        Ok(Self { state, offset: 0 })
    }

    pub fn map_buffer(&mut self, bytes_per_chunk: u32, chunks_per_buffer: u32) -> Result<()> {
        self.state.map_buffer(bytes_per_chunk, chunks_per_buffer)?;
        self.offset = 0;
        Ok(())
    }

    pub fn unmap_buffer(&mut self) {
        self.state.unmap_buffer();
        self.offset = 0;
    }

    pub fn start(&mut self, cycle_match: Option<(u16, u16)>) -> Result<()> {
        self.state.start(cycle_match, 0, 0)
    }

    /// See `SPEC_FULL.md` §4.1 `stop`: emits `on_stopped` exactly when the
    /// running:true→false transition is observed, matching `fw_iso_it_stop`.
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

    /// See `SPEC_FULL.md` §4.2 `register_packet`.
    pub fn register_packet(
        &mut self,
        tags: u8,
        sy: u8,
        header: &[u8],
        payload: &[u8],
        schedule_interrupt: bool,
    ) -> Result<()> {
        let skip = header.is_empty() && payload.is_empty();
        self.state.register_chunk(
            skip,
            tags,
            sy,
            header,
            header.len() as u8,
            payload.len() as u16,
            schedule_interrupt,
        )?;

        if !payload.is_empty() {
            self.write_payload(payload);
        }
        Ok(())
    }

    fn write_payload(&mut self, payload: &[u8]) {
        let ring_size = self.state.ring_size() as u32;
        let ring = unsafe { self.state.ring_slice_mut() }.expect("ring mapped before write_payload");
        let offset = self.offset as usize;
        let tail = ring_size as usize - offset;
        if payload.len() <= tail {
            ring[offset..offset + payload.len()].copy_from_slice(payload);
            self.offset = ((offset + payload.len()) as u32) % ring_size.max(1);
        } else {
            ring[offset..].copy_from_slice(&payload[..tail]);
            let rest = payload.len() - tail;
            ring[..rest].copy_from_slice(&payload[tail..]);
            self.offset = rest as u32;
        }
    }

    pub fn queue_chunks(&mut self) -> Result<()> {
        self.state.queue_chunks()
    }

    /// See `SPEC_FULL.md` §4.2 interrupt handler.
    pub fn handle_event(&mut self, buf: &[u8], observer: &mut dyn Observer) -> Result<()> {
        let hdr = unsafe { &*(buf.as_ptr() as *const sys::EventIsoInterrupt) };
        let sec = (hdr.cycle & 0x0000_e000) >> 13;
        let cycle = hdr.cycle & 0x0000_1fff;
        let count = hdr.header_length / 4;
        let timestamps = &buf[std::mem::size_of::<sys::EventIsoInterrupt>()
            ..std::mem::size_of::<sys::EventIsoInterrupt>() + hdr.header_length as usize];
        observer.on_interrupt(Interrupt {
            sec,
            cycle,
            timestamps,
            count,
        });
        self.queue_chunks()
    }
}

/// Adapter implementing the generic [`Source`] hook for a host event loop.
pub struct TxSource<'a> {
    ctx: &'a mut IsoTx,
    observer: &'a mut dyn Observer,
    buf: Vec<u8>,
}

impl<'a> TxSource<'a> {
    pub fn new(ctx: &'a mut IsoTx, observer: &'a mut dyn Observer) -> Self {
        Self {
            ctx,
            observer,
            buf: vec![0u8; page_size()],
        }
    }
}

impl Source for TxSource<'_> {
    fn fd(&self) -> RawFd {
        self.ctx.fd()
    }

    fn dispatch(&mut self) -> DispatchResult {
        match read_event(self.fd(), &mut self.buf) {
            Ok(Some(n)) => {
                if let Err(e) = self.ctx.handle_event(&self.buf[..n], self.observer) {
                    trace!("it handle_event error: {}", e);
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
