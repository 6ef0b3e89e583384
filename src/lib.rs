//! A pure Rust library for IEEE 1394 isochronous I/O through the Linux
//! `firewire-cdev` interface: transmit, packet-per-buffer receive,
//! buffer-fill multi-channel receive, and the bandwidth/channel resource
//! protocols, built directly on the character device ioctl/mmap ABI.

mod ctx;
mod cycle_timer;
mod err;
mod event;
mod ir_multi;
mod ir_single;
mod it;
mod mmap;
mod resource;
mod resource_auto;
mod resource_once;
mod sys;

pub use ctx::{Mode, Speed};
pub use cycle_timer::decompose as decompose_cycle_timer;
pub use err::{CtxError, Result, ResourceError, ResourceResult};
pub use event::{page_size, DispatchResult, Source};
pub use ir_multi::{Event as IrMultiEvent, IsoRxMultiple, Observer as IrMultiObserver, PacketSlot, RxMultipleSource};
pub use ir_single::{Event as IrSingleEvent, IsoRxSingle, Observer as IrSingleObserver, RxSingleSource};
pub use it::{Interrupt, IsoTx, Observer as ItObserver, TxSource};
pub use resource::Waiter;
pub use resource_auto::ResourceAuto;
pub use resource_once::{ResourceEvent, ResourceOnce, Observer as ResourceOnceObserver};
