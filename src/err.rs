//! Tagged error kinds for context and resource operations (see `SPEC_FULL.md` §7).

use std::io;
use std::result;

use thiserror::Error;

pub type Result<T> = result::Result<T, CtxError>;
pub type ResourceResult<T> = result::Result<T, ResourceError>;

/// Errors raised by [`crate::ctx::CtxState`] and the three context variants.
#[derive(Debug, Error)]
pub enum CtxError {
    #[error("{syscall} failed: {source}")]
    Failed {
        syscall: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("context is already allocated")]
    Opened,

    #[error("context is not allocated")]
    NotOpened,

    #[error("payload buffer is already mapped")]
    Mapped,

    #[error("payload buffer is not mapped")]
    NotMapped,

    #[error("no chunk has been registered")]
    ChunkUnregistered,

    #[error("kernel reported no available isochronous channel")]
    NoIsocChannel,
}

impl CtxError {
    pub(crate) fn failed(syscall: &'static str, source: io::Error) -> Self {
        Self::Failed { syscall, source }
    }
}

/// Errors raised by [`crate::resource_once::ResourceOnce`] and
/// [`crate::resource_auto::ResourceAuto`].
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("{syscall} failed: {source}")]
    Failed {
        syscall: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("resource is already associated to a character device")]
    Opened,

    #[error("resource is not associated to any character device")]
    NotOpened,

    #[error("no event arrived within the timeout")]
    Timeout,

    #[error("kernel reported error {code} for the request")]
    Event { code: i32 },

    #[error("an allocation is already outstanding")]
    Allocated,

    #[error("no allocation is outstanding")]
    NotAllocated,
}

impl ResourceError {
    pub(crate) fn failed(syscall: &'static str, source: io::Error) -> Self {
        Self::Failed { syscall, source }
    }
}
