//! Arena-backed buddy and slab allocators.
//!
//! This crate implements the two classic allocators of kernel memory
//! management as small, single-threaded versions that manage fixed-size
//! regions:
//!
//! - [`Buddy`] hands out power-of-two blocks of a power-of-two arena,
//!   splitting larger blocks on demand and merging freed blocks with their
//!   buddies ([`buddy`] module docs).
//! - [`SlabCache`] hands out fixed-size objects from slabs, uniform regions
//!   obtained from a backing allocator, moving each slab between free,
//!   partial and full lists as its occupancy changes ([`slab`] module docs).
//!
//! Every allocator is parameterized on a [`BackingAllocator`]:
//!
//! - [`Raw`] wraps a caller-provided region and never acquires more memory.
//! - [`Global`] obtains regions from the global allocator and returns them on
//!   drop.
//! - [`Buddy`] implements the trait itself, so a slab cache can carve its
//!   slabs out of a buddy arena.
//!
//! Deallocation is checked: freeing a foreign pointer, an interior pointer or
//! an already-free address reports a [`FreeError`] and leaves the allocator
//! unchanged.
//!
//! # Example
//!
//! ```
//! use core::alloc::Layout;
//!
//! use carve_alloc::Buddy;
//!
//! let mut buddy = Buddy::try_new(1024, 16).unwrap();
//!
//! // Requests round up to the next power-of-two block size.
//! let layout = Layout::from_size_align(48, 1).unwrap();
//! let block = buddy.allocate(layout).unwrap();
//! assert_eq!(buddy.allocation_size(block.cast()), Some(64));
//!
//! unsafe { buddy.deallocate(block.cast()).unwrap() };
//! ```
//!
//! This crate is `no_std`, but it depends on `alloc` for allocator metadata.

#![doc(html_root_url = "https://docs.rs/carve_alloc/0.1.0")]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
#![no_std]
// This is necessary to allow `sptr` to shadow methods provided by unstable
// features.
#![allow(unstable_name_collisions)]

extern crate alloc;

mod base;
mod core;
mod list;
mod tree;

pub mod buddy;
pub mod slab;

#[cfg(test)]
mod tests;

use crate::core::{alloc::Layout, ptr::NonNull};

pub use crate::buddy::{Buddy, BuddyReport};
pub use crate::core::alloc::AllocError;
pub use crate::slab::{CacheStats, SlabCache};

/// The error type for allocator constructors.
#[derive(Clone, Debug)]
pub enum AllocInitError {
    /// A necessary allocation failed.
    ///
    /// This variant is returned when a constructor attempts to allocate
    /// memory, either for metadata or the managed region, but the underlying
    /// allocator fails.
    ///
    /// The variant contains the [`Layout`] that could not be allocated.
    AllocFailed(Layout),

    /// The configuration of the allocator is invalid.
    ///
    /// This variant is returned when an allocator's configuration parameters
    /// are impossible to satisfy.
    InvalidConfig,

    /// The location of the allocator is invalid.
    ///
    /// This variant is returned when the managed region would wrap the
    /// address space.
    InvalidLocation,
}

/// The error type for deallocation.
///
/// A failed deallocation leaves the allocator unchanged, so these errors are
/// recoverable: the allocator remains usable, and only the rejected pointer
/// is in question.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum FreeError {
    /// The pointer does not address memory holding live allocations of this
    /// allocator.
    OutOfRegion,

    /// The pointed-to memory is managed by this allocator, but no live
    /// allocation starts at the pointer.
    ///
    /// This is reported when an address is freed twice, and when the pointer
    /// lands inside an allocated block rather than at its start.
    NotAllocated,
}

/// Types which provide memory which backs an allocator.
///
/// This trait is implemented by the following types:
/// - The [`Raw`] marker type indicates that an allocator is not backed by
///   another allocator. This is the case when constructing the allocator from
///   raw pointers. Memory used by this allocator can be reclaimed using
///   `.into_raw_parts()`, and requests for new regions always fail.
/// - The [`Global`] marker type indicates that an allocator is backed by the
///   global allocator. The allocator will free its memory on drop.
/// - [`Buddy`], which allows other allocators to manage subdivisions of a
///   buddy arena.
pub trait BackingAllocator: Sealed {
    /// Attempts to allocate a block of memory.
    ///
    /// The contents of the block are uninitialized.
    ///
    /// # Errors
    ///
    /// Returns `Err` if a block satisfying `layout` could not be provided.
    fn allocate(&mut self, layout: Layout) -> Result<NonNull<u8>, AllocError>;

    /// Deallocates the memory referenced by `ptr`.
    ///
    /// # Safety
    ///
    /// * `ptr` must denote a block of memory currently allocated via this
    ///   allocator, and
    /// * `layout` must fit that block of memory.
    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, layout: Layout);
}

/// A marker type indicating that an allocator is backed by raw pointers.
///
/// A `Raw`-backed allocator manages only the region it was constructed with;
/// requests for new regions fail with [`AllocError`], and the region is not
/// freed on drop.
#[derive(Clone, Debug)]
pub struct Raw;
impl Sealed for Raw {}
impl BackingAllocator for Raw {
    fn allocate(&mut self, _: Layout) -> Result<NonNull<u8>, AllocError> {
        Err(AllocError)
    }

    unsafe fn deallocate(&mut self, _: NonNull<u8>, _: Layout) {}
}

/// The global memory allocator.
#[derive(Clone, Debug)]
pub struct Global;
impl Sealed for Global {}
impl BackingAllocator for Global {
    fn allocate(&mut self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        if layout.size() == 0 {
            return Err(AllocError);
        }

        // SAFETY: layout has nonzero size.
        let raw = unsafe { alloc::alloc::alloc(layout) };

        NonNull::new(raw).ok_or(AllocError)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { alloc::alloc::dealloc(ptr.as_ptr(), layout) };
    }
}

#[doc(hidden)]
mod private {
    pub trait Sealed {}
}
use private::Sealed;
