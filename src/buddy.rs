//! Binary-buddy allocation.
//!
//! A buddy allocator manages a power-of-two arena in power-of-two blocks.
//! Each request is rounded up to the nearest block size and served by the
//! lowest-address free block of that size, splitting larger blocks as
//! needed. Every block other than the whole arena has a buddy, the other
//! half of the block it was split from; when a freed block's buddy is also
//! free, the two immediately merge back into the larger block, keeping big
//! allocations possible for as long as the usage pattern allows.
//!
//! [`Buddy`] records all block states in a flat status tree and the depth of
//! each live allocation in a side map, so deallocation takes only the
//! pointer and invalid frees are reported as [`FreeError`]s rather than
//! corrupting the arena.
//!
//! ## Characteristics
//!
//! #### Time complexity
//!
//! With an arena of `n` minimum-size blocks:
//!
//! | Operation                | Best-case | Worst-case |
//! |--------------------------|-----------|------------|
//! | Allocate                 | O(log n)  | O(log n)   |
//! | Deallocate               | O(log n)  | O(log n)   |
//!
//! #### Fragmentation
//!
//! Rounding to power-of-two block sizes wastes up to half of each block.
//! External fragmentation is kept low by immediate coalescing.

use alloc::{collections::BTreeMap, vec, vec::Vec};

use crate::base::BasePtr;
use crate::core::{
    alloc::{layout_error, AllocError, Layout, LayoutError},
    fmt,
    num::UsizeExt,
    ptr::{NonNull, NonNullStrict},
};
use crate::tree::StatusTree;
use crate::{private::Sealed, AllocInitError, BackingAllocator, FreeError, Global, Raw};

/// A binary-buddy allocator.
///
/// The arena size and the minimum block size must both be powers of two,
/// with the arena the larger of the two. Allocations are rounded up to the
/// nearest power-of-two block size, and every block is aligned to its own
/// size.
///
/// # Example
///
/// ```
/// use core::alloc::Layout;
///
/// use carve_alloc::Buddy;
///
/// // A 64-byte arena split down into blocks of no less than 8 bytes.
/// let mut buddy = Buddy::try_new(64, 8).unwrap();
///
/// let layout = Layout::from_size_align(10, 1).unwrap();
/// let first = buddy.allocate(layout).unwrap();
/// let second = buddy.allocate(layout).unwrap();
///
/// // Each request rounds up to a 16-byte block.
/// assert_eq!(buddy.allocation_size(first.cast()), Some(16));
/// assert_eq!(buddy.report().live_bytes, 32);
///
/// unsafe {
///     buddy.deallocate(first.cast()).unwrap();
///     buddy.deallocate(second.cast()).unwrap();
/// }
///
/// // Freed buddies coalesce back into the whole arena.
/// assert_eq!(buddy.report().largest_free_block, 64);
/// ```
pub struct Buddy<A: BackingAllocator> {
    /// Pointer to the arena managed by this allocator.
    base: BasePtr,
    /// Size of the smallest block the allocator hands out.
    min_block_size: usize,
    /// One status per power-of-two block of the arena.
    tree: StatusTree,
    /// The depth of each live allocation, keyed by arena offset.
    ///
    /// Deallocation takes only a pointer; the depth recorded here selects
    /// the tree node to release.
    allocations: BTreeMap<usize, u32>,
    backing_allocator: A,
}

fn params_valid(arena_size: usize, min_block_size: usize) -> bool {
    arena_size.is_power_of_two()
        && min_block_size.is_power_of_two()
        && min_block_size <= arena_size
}

impl Buddy<Raw> {
    /// Constructs a new `Buddy` from a raw pointer to the arena.
    ///
    /// The allocator does not take ownership of the arena; dropping it or
    /// calling [`into_raw_parts`] leaves the region untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if `arena_size` and `min_block_size` do not satisfy
    /// [`region_layout`], if the arena would wrap the address space, or if
    /// the status tree cannot be allocated.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `region` must point to a region that satisfies the [`Layout`]
    ///   returned by [`region_layout`], and it must be valid for reads and
    ///   writes for the entire size indicated by that `Layout`.
    /// - The region must not be accessed except through this allocator for
    ///   as long as the allocator exists.
    ///
    /// [`into_raw_parts`]: Buddy::into_raw_parts
    /// [`region_layout`]: Buddy::region_layout
    pub unsafe fn new_raw(
        region: NonNull<u8>,
        arena_size: usize,
        min_block_size: usize,
    ) -> Result<Buddy<Raw>, AllocInitError> {
        unsafe {
            RawBuddy::try_new(region, arena_size, min_block_size)
                .map(|raw| raw.with_backing_allocator(Raw))
        }
    }

    /// Decomposes the allocator, returning the arena pointer.
    ///
    /// The status tree and the allocation map are dropped. Outstanding
    /// allocations are invalidated; the returned pointer is once again the
    /// sole handle to the arena.
    pub fn into_raw_parts(self) -> NonNull<u8> {
        let region = self.base.ptr();
        drop(self);

        region
    }
}

impl Buddy<Global> {
    /// Attempts to construct a new `Buddy` backed by the global allocator.
    ///
    /// The arena is allocated here and freed on drop.
    ///
    /// # Errors
    ///
    /// Returns an error if `arena_size` and `min_block_size` do not satisfy
    /// [`region_layout`], or if allocation of the arena or the status tree
    /// fails.
    ///
    /// [`region_layout`]: Buddy::region_layout
    pub fn try_new(arena_size: usize, min_block_size: usize) -> Result<Buddy<Global>, AllocInitError> {
        Self::try_new_in(arena_size, min_block_size, Global)
    }
}

impl<A: BackingAllocator> Buddy<A> {
    /// Attempts to construct a new `Buddy` whose arena is obtained from
    /// `backing_allocator`.
    ///
    /// The arena is returned to the backing allocator on drop.
    ///
    /// # Errors
    ///
    /// Returns an error if `arena_size` and `min_block_size` do not satisfy
    /// [`region_layout`], or if allocation of the arena or the status tree
    /// fails.
    ///
    /// [`region_layout`]: Buddy::region_layout
    pub fn try_new_in(
        arena_size: usize,
        min_block_size: usize,
        mut backing_allocator: A,
    ) -> Result<Buddy<A>, AllocInitError> {
        let region_layout = Self::region_layout(arena_size, min_block_size)
            .map_err(|_| AllocInitError::InvalidConfig)?;

        let region = backing_allocator
            .allocate(region_layout)
            .map_err(|_| AllocInitError::AllocFailed(region_layout))?;

        // SAFETY: region satisfies region_layout and is not otherwise in
        // use.
        match unsafe { RawBuddy::try_new(region, arena_size, min_block_size) } {
            Ok(raw) => Ok(raw.with_backing_allocator(backing_allocator)),
            Err(e) => {
                unsafe { backing_allocator.deallocate(region, region_layout) };
                Err(e)
            }
        }
    }

    /// Returns the layout requirements of the arena for an allocator with
    /// these parameters.
    ///
    /// The required alignment equals `arena_size`, which makes every block
    /// aligned to its own size.
    ///
    /// # Errors
    ///
    /// Returns `Err` unless `arena_size` and `min_block_size` are powers of
    /// two, `min_block_size <= arena_size`, and the layout fits in `isize`.
    pub fn region_layout(arena_size: usize, min_block_size: usize) -> Result<Layout, LayoutError> {
        if !params_valid(arena_size, min_block_size) {
            return Err(layout_error());
        }

        Layout::from_size_align(arena_size, arena_size)
    }

    /// Returns the size of the arena in bytes.
    pub fn arena_size(&self) -> usize {
        self.base.extent()
    }

    /// Returns the size of the smallest allocatable block in bytes.
    pub fn min_block_size(&self) -> usize {
        self.min_block_size
    }

    /// Returns the block size that serves a request of `layout`, or `None`
    /// if no block can.
    fn block_size_for(&self, layout: Layout) -> Option<usize> {
        if layout.size() == 0 {
            return None;
        }

        let unrounded = layout
            .size()
            .max(layout.align())
            .max(self.min_block_size);
        let block_size = unrounded.checked_next_power_of_two()?;

        (block_size <= self.arena_size()).then_some(block_size)
    }

    /// Returns the tree depth of blocks of `block_size` bytes.
    fn depth_for(&self, block_size: usize) -> u32 {
        self.arena_size().log2() - block_size.log2()
    }

    /// Attempts to allocate a block of memory.
    ///
    /// The request is rounded up to the nearest power-of-two block size no
    /// smaller than [`min_block_size`], and the lowest-address free block of
    /// that size is returned. The length of the returned pointer is the full
    /// block size, which may exceed `layout.size()`.
    ///
    /// The contents of the block are uninitialized.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `layout.size()` is zero, if the rounded size exceeds
    /// the arena size, or if no free block of the rounded size remains.
    ///
    /// [`min_block_size`]: Buddy::min_block_size
    pub fn allocate(&mut self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        let block_size = self.block_size_for(layout).ok_or(AllocError)?;
        let depth = self.depth_for(block_size);

        let node = self.tree.find_free(depth).ok_or(AllocError)?;
        self.tree.mark_used(node);

        let offset = self.tree.offset_of(node) * self.min_block_size;
        let prev = self.allocations.insert(offset, depth);
        debug_assert!(prev.is_none());

        Ok(self.base.with_offset_and_len(offset, block_size))
    }

    /// Deallocates the block of memory referenced by `ptr`.
    ///
    /// If the block's buddy is free, the two coalesce immediately, as do any
    /// further buddy pairs the merge completes.
    ///
    /// # Errors
    ///
    /// Returns `Err(FreeError::OutOfRegion)` if `ptr` does not point into
    /// the arena, and `Err(FreeError::NotAllocated)` if no live allocation
    /// starts at `ptr`, as with a repeated free or a pointer into the middle
    /// of a block. The allocator is unchanged when an error is returned.
    ///
    /// # Safety
    ///
    /// The block must not be accessed after this method returns `Ok`, and no
    /// references into it may be live.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) -> Result<(), FreeError> {
        let offset = self
            .base
            .offset_of(ptr.addr())
            .ok_or(FreeError::OutOfRegion)?;
        let depth = self
            .allocations
            .remove(&offset)
            .ok_or(FreeError::NotAllocated)?;

        let node = self.tree.node_at(depth, offset / self.min_block_size);
        self.tree.release(node);

        Ok(())
    }

    /// Returns the block size of the live allocation starting at `ptr`, or
    /// `None` if no live allocation starts there.
    pub fn allocation_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        let offset = self.base.offset_of(ptr.addr())?;
        let depth = self.allocations.get(&offset)?;

        Some(self.arena_size() >> depth)
    }

    /// Returns the offset and size in bytes of every live allocation, in
    /// ascending offset order.
    pub fn allocations(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.allocations
            .iter()
            .map(|(&offset, &depth)| (offset, self.arena_size() >> depth))
    }

    /// Returns the offset and size in bytes of every maximal free block, in
    /// ascending offset order.
    ///
    /// A free block is maximal if its buddy is not also free; otherwise the
    /// two would have coalesced.
    pub fn free_blocks(&self) -> Vec<(usize, usize)> {
        let mut blocks = Vec::new();

        self.tree.for_each_free_block(|depth, units| {
            blocks.push((units * self.min_block_size, self.arena_size() >> depth));
        });
        blocks.sort_unstable();

        blocks
    }

    /// Captures a summary of the allocator's state.
    pub fn report(&self) -> BuddyReport {
        let mut free_blocks_by_depth = vec![0_usize; self.tree.levels() as usize];
        self.tree
            .for_each_free_block(|depth, _| free_blocks_by_depth[depth as usize] += 1);

        BuddyReport {
            arena_size: self.arena_size(),
            min_block_size: self.min_block_size,
            live_allocations: self.allocations.len(),
            live_bytes: self
                .allocations
                .values()
                .map(|&depth| self.arena_size() >> depth)
                .sum(),
            largest_free_block: self.tree.largest_free() * self.min_block_size,
            free_blocks_by_depth,
        }
    }
}

/// A point-in-time summary of a [`Buddy`]'s state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuddyReport {
    /// The size of the arena in bytes.
    pub arena_size: usize,
    /// The size of the smallest allocatable block in bytes.
    pub min_block_size: usize,
    /// The number of live allocations.
    pub live_allocations: usize,
    /// The total size in bytes of all live allocations, after rounding.
    pub live_bytes: usize,
    /// The size of the largest free block in bytes, or zero if the arena is
    /// exhausted.
    pub largest_free_block: usize,
    /// The number of maximal free blocks at each depth: entry `i` counts
    /// free blocks of `arena_size >> i` bytes.
    pub free_blocks_by_depth: Vec<usize>,
}

impl<A: BackingAllocator> fmt::Debug for Buddy<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buddy")
            .field("base", &self.base.ptr())
            .field("arena_size", &self.arena_size())
            .field("min_block_size", &self.min_block_size)
            .field("live_allocations", &self.allocations.len())
            .finish()
    }
}

impl<A: BackingAllocator> Drop for Buddy<A> {
    fn drop(&mut self) {
        // Safe unwrap: this layout was checked when the allocator was
        // constructed.
        let region_layout = Self::region_layout(self.arena_size(), self.min_block_size).unwrap();

        unsafe { self.backing_allocator.deallocate(self.base.ptr(), region_layout) };
    }
}

impl<A: BackingAllocator> Sealed for Buddy<A> {}

impl<A: BackingAllocator> BackingAllocator for Buddy<A> {
    fn allocate(&mut self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        Buddy::allocate(self, layout).map(NonNull::cast)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, layout: Layout) {
        let _ = layout;

        // The caller guarantees that ptr denotes a live allocation, so this
        // cannot fail.
        let freed = unsafe { Buddy::deallocate(self, ptr) };
        debug_assert!(freed.is_ok());
    }
}

/// Like a `Buddy`, but without a `Drop` impl or an associated allocator.
///
/// This assists in tacking on the allocator type parameter because this
/// struct can be moved out of, while `Buddy` itself cannot.
struct RawBuddy {
    base: BasePtr,
    min_block_size: usize,
    tree: StatusTree,
    allocations: BTreeMap<usize, u32>,
}

impl RawBuddy {
    /// Constructs a new `RawBuddy` from a raw pointer to the arena.
    ///
    /// # Safety
    ///
    /// `region` must point to a region that satisfies the [`Layout`]
    /// returned by `Buddy::region_layout(arena_size, min_block_size)`, and
    /// it must be valid for reads and writes for the entire size indicated
    /// by that `Layout`.
    unsafe fn try_new(
        region: NonNull<u8>,
        arena_size: usize,
        min_block_size: usize,
    ) -> Result<RawBuddy, AllocInitError> {
        if !params_valid(arena_size, min_block_size) {
            return Err(AllocInitError::InvalidConfig);
        }

        let base = BasePtr::try_new(region, arena_size)?;
        let order = arena_size.log2() - min_block_size.log2();
        let tree = StatusTree::try_new(order + 1)?;

        Ok(RawBuddy {
            base,
            min_block_size,
            tree,
            allocations: BTreeMap::new(),
        })
    }

    fn with_backing_allocator<A: BackingAllocator>(self, backing_allocator: A) -> Buddy<A> {
        let RawBuddy {
            base,
            min_block_size,
            tree,
            allocations,
        } = self;

        Buddy {
            base,
            min_block_size,
            tree,
            allocations,
            backing_allocator,
        }
    }
}
