//! A thin owning wrapper around an `mmap(2)` mapping.
//!
//! Mirrors the teacher's `Pointer` type: a `NonNull` address plus a length,
//! `munmap`'d on drop. Generalized over the mapping's element type and
//! protection flags so it can back both the read-write transmit ring and the
//! read-only receive rings.

use std::io::Result;
use std::os::unix::io::RawFd;
use std::ptr;
use std::slice;

use libc;

use crate::sys;

#[derive(Debug)]
pub struct Pointer<T> {
    addr: ptr::NonNull<T>,
    len: usize,
}

impl<T> Pointer<T> {
    /// # Safety
    /// The caller must ensure `fd` supports mmap at `offset` for `len` bytes
    /// and that `T` is a valid interpretation of the mapped memory.
    pub unsafe fn try_new(len: usize, prot: libc::c_int, fd: RawFd, offset: i64) -> Result<Self> {
        let ptr = sys::mmap(len, prot, fd, offset as libc::off_t)?;
        let addr = ptr::NonNull::new_unchecked(ptr as *mut T);
        Ok(Self { addr, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *const T {
        self.addr.as_ptr()
    }

    pub fn as_mut_ptr(&self) -> *mut T {
        self.addr.as_ptr()
    }
}

impl Pointer<u8> {
    /// Borrow the mapping as a byte slice.
    ///
    /// # Safety
    /// The caller must not alias this with a concurrent kernel write to the
    /// same bytes; for receive rings, callers must restrict the returned
    /// range to bytes the kernel has already committed (see `ctx::CtxState`).
    pub unsafe fn as_slice(&self) -> &[u8] {
        slice::from_raw_parts(self.addr.as_ptr(), self.len)
    }

    /// # Safety
    /// The caller must hold the only writing reference to this range; only
    /// sound for transmit rings, which are never concurrently read by the
    /// kernel ahead of the write cursor.
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        slice::from_raw_parts_mut(self.addr.as_ptr(), self.len)
    }
}

impl<T> Drop for Pointer<T> {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                sys::munmap(self.addr.as_ptr() as *mut libc::c_void, self.len).ok();
            }
        }
    }
}

// SAFETY: the mapping is either read-only (IR rings) or exclusively owned
// (IT ring, descriptor staging); `CtxState` never exposes concurrent access
// from multiple threads without its own synchronization.
unsafe impl<T> Send for Pointer<T> {}
