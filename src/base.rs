use crate::core::{
    num::NonZeroUsize,
    ptr::{self, NonNull},
};

use crate::core::ptr::{NonNullStrict, Strict};

use crate::AllocInitError;

/// A pointer to the base of the region of memory managed by an allocator.
///
/// All pointers into the region are derived from this pointer, so they share
/// its provenance.
#[derive(Copy, Clone, Debug)]
pub struct BasePtr {
    ptr: NonNull<u8>,
    extent: usize,
}

impl BasePtr {
    /// Creates a `BasePtr` for the `extent`-byte region starting at `ptr`.
    ///
    /// The returned value assumes the provenance of `ptr`.
    ///
    /// # Errors
    ///
    /// Returns `Err(AllocInitError::InvalidLocation)` if the region would wrap
    /// the address space.
    #[inline]
    pub fn try_new(ptr: NonNull<u8>, extent: usize) -> Result<BasePtr, AllocInitError> {
        ptr.addr()
            .get()
            .checked_add(extent)
            .ok_or(AllocInitError::InvalidLocation)?;

        Ok(BasePtr { ptr, extent })
    }

    /// Returns the base pointer as a `NonNull<u8>`.
    #[inline]
    pub fn ptr(self) -> NonNull<u8> {
        self.ptr
    }

    /// Returns the size of the region in bytes.
    #[inline]
    pub fn extent(self) -> usize {
        self.extent
    }

    /// Returns the offset of `addr` within the region, or `None` if the
    /// region does not contain `addr`.
    #[inline]
    pub fn offset_of(self, addr: NonZeroUsize) -> Option<usize> {
        let offset = addr.get().checked_sub(self.ptr.addr().get())?;

        (offset < self.extent).then_some(offset)
    }

    /// Creates a pointer to the `len`-byte block at `offset` within the
    /// region.
    ///
    /// The returned pointer has the provenance of this pointer.
    #[inline]
    pub fn with_offset_and_len(self, offset: usize, len: usize) -> NonNull<[u8]> {
        debug_assert!(offset.checked_add(len).map_or(false, |end| end <= self.extent));

        let ptr = self.ptr.as_ptr().with_addr(self.ptr.addr().get() + offset);
        let raw_slice = ptr::slice_from_raw_parts_mut(ptr, len);

        // SAFETY: raw_slice is derived from a non-null pointer by an add that
        // does not wrap.
        unsafe { NonNull::new_unchecked(raw_slice) }
    }
}
