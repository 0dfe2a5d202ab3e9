use std::num::NonZeroUsize;
use std::os::fd::AsFd;
use std::ptr::NonNull;
use std::slice;

use log::error;
use nix::libc::c_void;
use nix::sys::mman::{self, MapFlags, ProtFlags};

/// A read-write shared mapping, unmapped when dropped.
pub(crate) struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

// The mapping is plain memory. Concurrent access to the same bytes is
// prevented by the slot ownership rules of the pool using it.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    /// Map the first `len` bytes of `fd`.
    pub(crate) fn shared<F: AsFd>(fd: F, len: NonZeroUsize) -> nix::Result<Self> {
        // Safe because we are not requesting a fixed address and `fd` is a
        // valid file descriptor for the duration of the call.
        let ptr = unsafe {
            mman::mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                0,
            )
        }?;

        Ok(Self {
            ptr: ptr.cast(),
            len: len.get(),
        })
    }

    /// Map `len` bytes of anonymous memory shared with child processes.
    pub(crate) fn anonymous(len: NonZeroUsize) -> nix::Result<Self> {
        // Safe because we are not requesting a fixed address.
        let ptr = unsafe {
            mman::mmap_anonymous(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
            )
        }?;

        Ok(Self {
            ptr: ptr.cast(),
            len: len.get(),
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// # Safety
    ///
    /// `offset..offset + len` must lie within the mapping and nobody may be
    /// writing these bytes while the returned slice is alive.
    pub(crate) unsafe fn slice(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= self.len);
        slice::from_raw_parts(self.ptr.as_ptr().add(offset), len)
    }

    /// # Safety
    ///
    /// `offset..offset + len` must lie within the mapping and the caller must
    /// have exclusive access to these bytes while the returned slice is alive.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn slice_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        debug_assert!(offset + len <= self.len);
        slice::from_raw_parts_mut(self.ptr.as_ptr().add(offset), len)
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // Safe because the pointer and length were obtained from mmap() and
        // are always valid.
        unsafe { mman::munmap(self.ptr.cast::<c_void>(), self.len) }.unwrap_or_else(|e| {
            error!("Error while unmapping pool region: {}", e);
        });
    }
}
