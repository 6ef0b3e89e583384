//! Integration tests that open a real `firewire-cdev` character device.
//!
//! These require a Linux host with at least one FireWire controller and
//! permission to open `/dev/fw0`, so they are marked `#[ignore]` and are not
//! part of the default `cargo test` run. Exercise them explicitly with
//! `cargo test --test cdev -- --ignored` on such a machine.

use fw_isoch::{IsoTx, ItObserver, Speed};

struct NullObserver;

impl ItObserver for NullObserver {
    fn on_interrupt(&mut self, _event: fw_isoch::Interrupt<'_>) {}
}

/// Requires `/dev/fw0` to exist and be writable by the current user.
#[test]
#[ignore]
fn allocate_map_and_release_a_transmit_context() {
    let mut ctx = IsoTx::allocate("/dev/fw0", Speed::S400, 0, 4).unwrap();
    ctx.map_buffer(256, 16).unwrap();

    let mut observer = NullObserver;
    ctx.stop(&mut observer).unwrap();
    ctx.unmap_buffer();
}
