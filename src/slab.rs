//! Slab allocation.
//!
//! A slab cache serves objects of a single fixed size. It obtains uniform
//! regions, slabs, from its backing allocator and carves each one into a
//! header, a stack of free slot indices and an array of object slots.
//! Allocation pops an index off a slab's stack; deallocation pushes it back.
//! The cache tracks every slab on one of three intrusive lists keyed by
//! occupancy, fully free, partially used or full, and serves requests from
//! partial slabs first so free slabs stay whole.
//!
//! Everything the cache needs lives inside the slab regions themselves, so a
//! cache whose object size is `size_of::<SlabCache<A>>()` can hold other
//! caches, the way kernel slab systems bootstrap their cache descriptors.
//!
//! ## Characteristics
//!
//! #### Time complexity
//!
//! With `s` slabs in the cache and `n` object slots per slab:
//!
//! | Operation                | Best-case | Worst-case |
//! |--------------------------|-----------|------------|
//! | Allocate                 | O(1)      | O(n)       |
//! | Deallocate               | O(1)      | O(s + n)   |
//!
//! Allocation is O(n) only when the cache grows and a fresh slab's index
//! stack must be initialized. Deallocation walks the full and partial lists
//! to find the slab containing the pointer, then checks that slab's free
//! entries to reject repeated frees.
//!
//! #### Fragmentation
//!
//! Fixed-size slots make external fragmentation impossible. Internal
//! fragmentation consists of the slack between object and request sizes,
//! plus the per-slab overhead of the header, the index stack and any
//! leftover bytes that do not fit a whole object.

use crate::core::{
    alloc::{AllocError, Layout},
    fmt, mem,
    num::NonZeroUsize,
    ptr::{self, NonNull, NonNullStrict},
};

use crate::list::SlabList;
use crate::{AllocInitError, BackingAllocator, FreeError, Global};

/// Alignment of every slab region.
///
/// The index stack and object storage are placed at multiples of this, so
/// objects whose size is a multiple of it are aligned to it as well.
const SLAB_ALIGN: usize = mem::align_of::<SlabHeader>();

/// The header at the start of every slab region.
///
/// The list links are updated only by [`SlabList`](crate::list::SlabList);
/// the free count is updated in lock step with the slab's index stack.
#[repr(C)]
#[derive(Debug)]
pub(crate) struct SlabHeader {
    pub(crate) prev: Option<NonNull<SlabHeader>>,
    pub(crate) next: Option<NonNull<SlabHeader>>,
    pub(crate) free_count: u32,
}

impl SlabHeader {
    pub(crate) const fn new(free_count: u32) -> SlabHeader {
        SlabHeader {
            prev: None,
            next: None,
            free_count,
        }
    }
}

/// The byte layout of a slab region, computed once per cache.
///
/// A region is laid out as the header, then `objs_per_slab` stack entries of
/// type `u32`, then the object slots, with the slots aligned to
/// [`SLAB_ALIGN`]. The stack entries at indices below the header's free
/// count name the free slots; the rest of the stack is garbage.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct SlabLayout {
    slab_size: usize,
    obj_size: usize,
    objs_per_slab: u32,
    stack_offset: usize,
    storage_offset: usize,
}

/// Aligns `value` upward to `align`, which must be a power of two.
fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

impl SlabLayout {
    /// Computes the layout of slabs holding `obj_size`-byte objects in
    /// `slab_size`-byte regions, fitting as many objects as possible.
    ///
    /// # Errors
    ///
    /// Returns `Err(InvalidConfig)` if `obj_size` is zero, if `slab_size` is
    /// not a representable region size, or if a slab cannot hold at least
    /// one object alongside the header and its stack entry.
    fn try_new(obj_size: usize, slab_size: usize) -> Result<SlabLayout, AllocInitError> {
        if obj_size == 0 {
            return Err(AllocInitError::InvalidConfig);
        }

        Layout::from_size_align(slab_size, SLAB_ALIGN)
            .map_err(|_| AllocInitError::InvalidConfig)?;

        let header_size = mem::size_of::<SlabHeader>();
        let index_size = mem::size_of::<u32>();
        debug_assert_eq!(header_size % index_size, 0);

        let per_object = obj_size
            .checked_add(index_size)
            .ok_or(AllocInitError::InvalidConfig)?;

        // Start from an upper bound that ignores storage alignment, then
        // shrink until the slots fit. Slot indices are u32.
        let mut objs_per_slab = (slab_size.saturating_sub(header_size) / per_object)
            .min(u32::MAX as usize);

        loop {
            if objs_per_slab == 0 {
                return Err(AllocInitError::InvalidConfig);
            }

            let stack_end = header_size + objs_per_slab * index_size;
            let storage_offset = align_up(stack_end, SLAB_ALIGN);
            let storage_end = objs_per_slab
                .checked_mul(obj_size)
                .and_then(|storage| storage_offset.checked_add(storage));

            match storage_end {
                Some(end) if end <= slab_size => {
                    return Ok(SlabLayout {
                        slab_size,
                        obj_size,
                        objs_per_slab: objs_per_slab as u32,
                        stack_offset: header_size,
                        storage_offset,
                    });
                }
                _ => objs_per_slab -= 1,
            }
        }
    }

    /// Returns the layout of one slab region.
    fn region_layout(&self) -> Layout {
        // Safe unwrap: this layout was checked when the cache was
        // constructed.
        Layout::from_size_align(self.slab_size, SLAB_ALIGN).unwrap()
    }

    /// Returns the byte offset of object slot `index`.
    #[inline]
    fn object_offset(&self, index: u32) -> usize {
        debug_assert!(index < self.objs_per_slab);

        self.storage_offset + index as usize * self.obj_size
    }

    /// Creates a pointer to the byte at `offset` in `slab`'s region.
    ///
    /// The returned pointer has the provenance of `slab`, which covers the
    /// whole region.
    #[inline]
    fn region_ptr(&self, slab: NonNull<SlabHeader>, offset: usize) -> NonNull<u8> {
        debug_assert!(offset < self.slab_size);

        // The sum is nonzero and does not wrap: allocated regions never wrap
        // the address space.
        slab.cast::<u8>()
            .map_addr(|addr| NonZeroUsize::new(addr.get() + offset).unwrap())
    }

    /// Creates a pointer to object slot `index` in `slab`'s region.
    fn object_ptr(&self, slab: NonNull<SlabHeader>, index: u32) -> NonNull<u8> {
        self.region_ptr(slab, self.object_offset(index))
    }

    /// Creates a pointer to object slot `index`, sized to one object.
    fn object_slice(&self, slab: NonNull<SlabHeader>, index: u32) -> NonNull<[u8]> {
        let ptr = self.object_ptr(slab, index);
        let raw_slice = ptr::slice_from_raw_parts_mut(ptr.as_ptr(), self.obj_size);

        // SAFETY: raw_slice is derived from a NonNull.
        unsafe { NonNull::new_unchecked(raw_slice) }
    }

    /// Maps `addr` to the object slot starting at it.
    ///
    /// Returns `Err(OutOfRegion)` if `addr` is not within `slab`'s object
    /// storage, and `Err(NotAllocated)` if it is inside the storage but not
    /// at the start of a slot.
    fn slot_of(&self, slab: NonNull<SlabHeader>, addr: NonZeroUsize) -> Result<u32, FreeError> {
        let offset = addr
            .get()
            .checked_sub(slab.addr().get())
            .ok_or(FreeError::OutOfRegion)?;

        if offset >= self.slab_size {
            return Err(FreeError::OutOfRegion);
        }

        let storage_offset = offset
            .checked_sub(self.storage_offset)
            .ok_or(FreeError::OutOfRegion)?;
        let index = storage_offset / self.obj_size;

        if index >= self.objs_per_slab as usize {
            return Err(FreeError::OutOfRegion);
        }

        if storage_offset % self.obj_size != 0 {
            return Err(FreeError::NotAllocated);
        }

        Ok(index as u32)
    }

    fn stack_entry_ptr(&self, slab: NonNull<SlabHeader>, slot: u32) -> NonNull<u32> {
        debug_assert!(slot < self.objs_per_slab);

        self.region_ptr(slab, self.stack_offset + slot as usize * mem::size_of::<u32>())
            .cast::<u32>()
    }

    /// Reads the stack entry at `slot`.
    ///
    /// # Safety
    ///
    /// `slab` must be an initialized slab region laid out by `self`, with no
    /// other access to it live.
    unsafe fn stack_entry(&self, slab: NonNull<SlabHeader>, slot: u32) -> u32 {
        unsafe { self.stack_entry_ptr(slab, slot).as_ptr().read() }
    }

    /// Writes the stack entry at `slot`.
    ///
    /// # Safety
    ///
    /// Same contract as [`Self::stack_entry`].
    unsafe fn set_stack_entry(&self, slab: NonNull<SlabHeader>, slot: u32, index: u32) {
        unsafe { self.stack_entry_ptr(slab, slot).as_ptr().write(index) };
    }

    /// Writes a fresh header and a full index stack into `region`, and
    /// returns the header pointer.
    ///
    /// # Safety
    ///
    /// `region` must satisfy [`Self::region_layout`] and be valid for reads
    /// and writes for `slab_size` bytes, with no other access to it live.
    unsafe fn init_region(&self, region: NonNull<u8>) -> NonNull<SlabHeader> {
        let slab = region.cast::<SlabHeader>();

        unsafe {
            slab.as_ptr().write(SlabHeader::new(self.objs_per_slab));

            for index in 0..self.objs_per_slab {
                self.set_stack_entry(slab, index, index);
            }
        }

        slab
    }

    /// Pops the top free slot index off `slab`'s stack, or returns `None` if
    /// the slab is full.
    ///
    /// # Safety
    ///
    /// `slab` must be an initialized slab region laid out by `self`, with no
    /// other access to it live.
    unsafe fn pop_free(&self, mut slab: NonNull<SlabHeader>) -> Option<u32> {
        unsafe {
            let top = slab.as_ref().free_count.checked_sub(1)?;
            let index = self.stack_entry(slab, top);
            slab.as_mut().free_count = top;

            Some(index)
        }
    }

    /// Pushes `index` back onto `slab`'s free stack.
    ///
    /// Fails without modifying the slab if `index` is already free.
    ///
    /// # Safety
    ///
    /// Same contract as [`Self::pop_free`]; `index` must be less than
    /// `objs_per_slab`.
    unsafe fn push_free(&self, mut slab: NonNull<SlabHeader>, index: u32) -> Result<(), FreeError> {
        unsafe {
            if self.slot_is_free(slab, index) {
                return Err(FreeError::NotAllocated);
            }

            let free_count = slab.as_ref().free_count;
            debug_assert!(free_count < self.objs_per_slab);

            self.set_stack_entry(slab, free_count, index);
            slab.as_mut().free_count = free_count + 1;
        }

        Ok(())
    }

    /// Returns `true` if `index` is on `slab`'s free stack.
    ///
    /// # Safety
    ///
    /// Same contract as [`Self::pop_free`].
    unsafe fn slot_is_free(&self, slab: NonNull<SlabHeader>, index: u32) -> bool {
        let free_count = unsafe { slab.as_ref().free_count };

        (0..free_count).any(|slot| unsafe { self.stack_entry(slab, slot) } == index)
    }
}

/// Which occupancy list a slab belongs on.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Occupancy {
    Free,
    Partial,
    Full,
}

/// A slab cache for objects of a single fixed size.
///
/// The cache starts with no slabs. It grows by one slab whenever an
/// allocation finds no free slot, or when [`grow`] is called explicitly, and
/// it holds every slab it has grown until it is dropped.
///
/// # Example
///
/// ```
/// use carve_alloc::SlabCache;
///
/// // A cache of 48-byte objects in 4 KiB slabs.
/// let mut cache = SlabCache::try_new(48, 4096).unwrap();
///
/// let first = cache.allocate().unwrap();
/// assert_eq!(first.len(), 48);
///
/// let stats = cache.stats();
/// assert_eq!(stats.in_use, 1);
/// assert_eq!(stats.slabs, 1);
///
/// unsafe { cache.deallocate(first.cast()).unwrap() };
/// assert_eq!(cache.stats().in_use, 0);
/// ```
///
/// [`grow`]: SlabCache::grow
pub struct SlabCache<A: BackingAllocator> {
    layout: SlabLayout,
    free: SlabList,
    partial: SlabList,
    full: SlabList,
    in_use: usize,
    backing_allocator: A,
}

impl SlabCache<Global> {
    /// Attempts to construct a new `SlabCache` backed by the global
    /// allocator.
    ///
    /// # Errors
    ///
    /// Returns `Err(InvalidConfig)` if `obj_size` is zero or if a
    /// `slab_size`-byte region cannot hold the slab header, the index stack
    /// and at least one object.
    pub fn try_new(obj_size: usize, slab_size: usize) -> Result<SlabCache<Global>, AllocInitError> {
        Self::try_new_in(obj_size, slab_size, Global)
    }
}

impl<A: BackingAllocator> SlabCache<A> {
    /// Attempts to construct a new `SlabCache` whose slabs are obtained from
    /// `backing_allocator`.
    ///
    /// No slab is allocated up front; the first slab is created by the first
    /// allocation or by an explicit [`grow`].
    ///
    /// # Errors
    ///
    /// Returns `Err(InvalidConfig)` if `obj_size` is zero or if a
    /// `slab_size`-byte region cannot hold the slab header, the index stack
    /// and at least one object.
    ///
    /// [`grow`]: SlabCache::grow
    pub fn try_new_in(
        obj_size: usize,
        slab_size: usize,
        backing_allocator: A,
    ) -> Result<SlabCache<A>, AllocInitError> {
        let layout = SlabLayout::try_new(obj_size, slab_size)?;

        Ok(SlabCache {
            layout,
            free: SlabList::new(),
            partial: SlabList::new(),
            full: SlabList::new(),
            in_use: 0,
            backing_allocator,
        })
    }

    /// Returns the object size in bytes.
    pub fn object_size(&self) -> usize {
        self.layout.obj_size
    }

    /// Returns the slab region size in bytes.
    pub fn slab_size(&self) -> usize {
        self.layout.slab_size
    }

    /// Returns the number of object slots in each slab.
    pub fn objects_per_slab(&self) -> u32 {
        self.layout.objs_per_slab
    }

    /// Returns the number of live objects.
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Returns the layout of the regions this cache requests from its
    /// backing allocator.
    pub fn region_layout(&self) -> Layout {
        self.layout.region_layout()
    }

    /// Allocates one fresh slab from the backing allocator and adds it to
    /// the free list.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the backing allocator cannot provide a region. The
    /// cache is unchanged in that case.
    pub fn grow(&mut self) -> Result<(), AllocError> {
        let region = self.backing_allocator.allocate(self.layout.region_layout())?;

        // SAFETY: region satisfies the slab layout and is not otherwise in
        // use, and the new header is not on any list.
        unsafe {
            let slab = self.layout.init_region(region);
            self.free.push_back(slab);
        }

        Ok(())
    }

    /// Attempts to allocate one object.
    ///
    /// A slot is taken from a partially-used slab if one exists, then from a
    /// fully-free slab; growing the cache is the last resort. The length of
    /// the returned pointer is the object size.
    ///
    /// The contents of the object are uninitialized.
    ///
    /// # Errors
    ///
    /// Returns `Err` only when the cache must grow and the backing allocator
    /// fails to provide a region.
    pub fn allocate(&mut self) -> Result<NonNull<[u8]>, AllocError> {
        let slab = match self.partial.first().or_else(|| self.free.first()) {
            Some(slab) => slab,
            None => {
                self.grow()?;
                self.free.first().ok_or(AllocError)?
            }
        };

        // SAFETY: slabs on the cache's lists are initialized, laid out by
        // self.layout, and accessed only through the cache.
        unsafe {
            let index = self.layout.pop_free(slab).ok_or(AllocError)?;

            let remaining = slab.as_ref().free_count;
            self.relocate(slab, remaining + 1, remaining);

            self.in_use += 1;

            Ok(self.layout.object_slice(slab, index))
        }
    }

    /// Deallocates the object referenced by `ptr`.
    ///
    /// The full and partial lists are searched for the slab whose storage
    /// contains `ptr`; free slabs hold no live objects and are not
    /// consulted.
    ///
    /// # Errors
    ///
    /// Returns `Err(FreeError::OutOfRegion)` if no slab with live objects
    /// contains `ptr`, and `Err(FreeError::NotAllocated)` if `ptr` is not
    /// the start of a live object, as with a repeated free or a pointer into
    /// an object's interior. The cache is unchanged when an error is
    /// returned.
    ///
    /// # Safety
    ///
    /// The object must not be accessed after this method returns `Ok`, and
    /// no references into it may be live.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) -> Result<(), FreeError> {
        let addr = ptr.addr();

        // SAFETY: slabs on the cache's lists are initialized, laid out by
        // self.layout, and accessed only through the cache.
        unsafe {
            let (slab, index) = self.find_slot(addr)?;
            self.layout.push_free(slab, index)?;

            let free_count = slab.as_ref().free_count;
            self.relocate(slab, free_count - 1, free_count);
        }

        self.in_use -= 1;

        Ok(())
    }

    /// Captures a summary of the cache's state.
    pub fn stats(&self) -> CacheStats {
        let slabs = self.free.len() + self.partial.len() + self.full.len();

        CacheStats {
            object_size: self.layout.obj_size,
            slab_size: self.layout.slab_size,
            objects_per_slab: self.layout.objs_per_slab,
            slabs,
            free_slabs: self.free.len(),
            partial_slabs: self.partial.len(),
            full_slabs: self.full.len(),
            in_use: self.in_use,
            capacity: slabs * self.layout.objs_per_slab as usize,
        }
    }

    /// Finds the slab and slot containing `addr` among the slabs with live
    /// objects.
    ///
    /// # Safety
    ///
    /// The headers on the cache's lists must be initialized, with no other
    /// access to them live.
    unsafe fn find_slot(&self, addr: NonZeroUsize) -> Result<(NonNull<SlabHeader>, u32), FreeError> {
        let live = unsafe { self.full.iter().chain(self.partial.iter()) };

        for slab in live {
            match self.layout.slot_of(slab, addr) {
                Ok(index) => return Ok((slab, index)),
                // Slab regions are disjoint, so an interior hit in this slab
                // cannot be a slot start in another.
                Err(FreeError::NotAllocated) => return Err(FreeError::NotAllocated),
                Err(FreeError::OutOfRegion) => {}
            }
        }

        Err(FreeError::OutOfRegion)
    }

    fn occupancy(&self, free_count: u32) -> Occupancy {
        if free_count == self.layout.objs_per_slab {
            Occupancy::Free
        } else if free_count == 0 {
            Occupancy::Full
        } else {
            Occupancy::Partial
        }
    }

    fn list_mut(&mut self, occupancy: Occupancy) -> &mut SlabList {
        match occupancy {
            Occupancy::Free => &mut self.free,
            Occupancy::Partial => &mut self.partial,
            Occupancy::Full => &mut self.full,
        }
    }

    /// Moves `slab` between occupancy lists if its free count crossed a
    /// boundary.
    ///
    /// # Safety
    ///
    /// `slab` must be an initialized header on the list matching
    /// `old_free_count`, with no other access to the lists' headers live.
    unsafe fn relocate(&mut self, slab: NonNull<SlabHeader>, old_free_count: u32, new_free_count: u32) {
        let from = self.occupancy(old_free_count);
        let to = self.occupancy(new_free_count);

        if from != to {
            unsafe {
                self.list_mut(from).remove(slab);
                self.list_mut(to).push_back(slab);
            }
        }
    }

    /// Asserts that every slab sits on the list matching its free count and
    /// that `in_use` matches the slabs' counts.
    #[cfg(test)]
    fn check_occupancy(&self) {
        let objs = self.layout.objs_per_slab;
        let mut live = 0_usize;

        unsafe {
            for slab in self.free.iter() {
                assert_eq!(slab.as_ref().free_count, objs);
            }

            for slab in self.partial.iter() {
                let free_count = slab.as_ref().free_count;
                assert!(0 < free_count && free_count < objs);
                live += (objs - free_count) as usize;
            }

            for slab in self.full.iter() {
                assert_eq!(slab.as_ref().free_count, 0);
                live += objs as usize;
            }
        }

        assert_eq!(self.in_use, live);
    }
}

/// A point-in-time summary of a [`SlabCache`]'s state.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CacheStats {
    /// The size of each object slot in bytes.
    pub object_size: usize,
    /// The size of each slab region in bytes.
    pub slab_size: usize,
    /// The number of object slots in each slab.
    pub objects_per_slab: u32,
    /// The number of slabs owned by the cache.
    pub slabs: usize,
    /// The number of slabs with every slot free.
    pub free_slabs: usize,
    /// The number of slabs with both live objects and free slots.
    pub partial_slabs: usize,
    /// The number of slabs with no free slot.
    pub full_slabs: usize,
    /// The number of live objects.
    pub in_use: usize,
    /// The total number of object slots across all slabs.
    pub capacity: usize,
}

impl<A: BackingAllocator> fmt::Debug for SlabCache<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlabCache")
            .field("object_size", &self.layout.obj_size)
            .field("slab_size", &self.layout.slab_size)
            .field("objects_per_slab", &self.layout.objs_per_slab)
            .field("free_slabs", &self.free.len())
            .field("partial_slabs", &self.partial.len())
            .field("full_slabs", &self.full.len())
            .field("in_use", &self.in_use)
            .finish()
    }
}

impl<A: BackingAllocator> Drop for SlabCache<A> {
    fn drop(&mut self) {
        let region_layout = self.layout.region_layout();

        for list in [&mut self.free, &mut self.partial, &mut self.full] {
            // SAFETY: the popped header was initialized by init_region in a
            // region allocated from the backing allocator with this layout,
            // and no allocation handles remain usable after drop.
            unsafe {
                while let Some(slab) = list.pop_front() {
                    self.backing_allocator
                        .deallocate(slab.cast::<u8>(), region_layout);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::buddy::Buddy;
    use crate::Raw;

    fn layout_for(obj_size: usize, slab_size: usize) -> SlabLayout {
        SlabLayout::try_new(obj_size, slab_size).unwrap()
    }

    #[test]
    fn rejects_unworkable_configs() {
        // Zero-size objects.
        assert!(matches!(
            SlabCache::try_new(0, 1024),
            Err(AllocInitError::InvalidConfig)
        ));

        // Object larger than the whole slab.
        assert!(matches!(
            SlabCache::try_new(4096, 64),
            Err(AllocInitError::InvalidConfig)
        ));

        // No room for even one object beside the header.
        assert!(matches!(
            SlabCache::try_new(64, mem::size_of::<SlabHeader>()),
            Err(AllocInitError::InvalidConfig)
        ));
    }

    #[test]
    fn layout_packs_maximally() {
        for (obj_size, slab_size) in [(1, 64), (16, 128), (16, 4096), (48, 4096), (100, 1000)] {
            let layout = layout_for(obj_size, slab_size);
            let objs = layout.objs_per_slab as usize;

            assert!(objs > 0);
            assert_eq!(layout.stack_offset, mem::size_of::<SlabHeader>());
            assert_eq!(layout.storage_offset % SLAB_ALIGN, 0);
            assert!(layout.stack_offset + 4 * objs <= layout.storage_offset);
            assert!(layout.storage_offset + objs * obj_size <= slab_size);

            // One more object would not fit.
            let stack_end = layout.stack_offset + 4 * (objs + 1);
            let storage = align_up(stack_end, SLAB_ALIGN);
            assert!(storage + (objs + 1) * obj_size > slab_size);
        }
    }

    #[test]
    fn sixteen_byte_objects_in_small_slabs() {
        let cache = SlabCache::try_new(16, 128).unwrap();

        assert_eq!(cache.object_size(), 16);
        assert_eq!(cache.slab_size(), 128);
        assert_eq!(cache.objects_per_slab(), 5);
        assert_eq!(cache.region_layout().size(), 128);
        assert_eq!(cache.region_layout().align(), SLAB_ALIGN);
    }

    #[test]
    fn grow_adds_a_free_slab() {
        let mut cache = SlabCache::try_new(16, 256).unwrap();
        assert_eq!(cache.stats().slabs, 0);

        cache.grow().unwrap();

        let stats = cache.stats();
        assert_eq!(stats.slabs, 1);
        assert_eq!(stats.free_slabs, 1);
        assert_eq!(stats.partial_slabs, 0);
        assert_eq!(stats.full_slabs, 0);
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.capacity, cache.objects_per_slab() as usize);
        cache.check_occupancy();
    }

    #[test]
    fn allocate_moves_slab_through_lists() {
        let mut cache = SlabCache::try_new(16, 128).unwrap();
        let objs = cache.objects_per_slab();
        let mut objects = alloc::vec::Vec::new();

        for i in 0..objs {
            objects.push(cache.allocate().unwrap());

            let stats = cache.stats();
            assert_eq!(stats.slabs, 1);
            assert_eq!(stats.in_use, i as usize + 1);
            if i + 1 < objs {
                assert_eq!(stats.partial_slabs, 1);
            } else {
                assert_eq!(stats.full_slabs, 1);
                assert_eq!(stats.partial_slabs, 0);
            }
            cache.check_occupancy();
        }

        // Draining the slab walks it back to the free list.
        for (i, object) in objects.drain(..).enumerate() {
            unsafe { cache.deallocate(object.cast()).unwrap() };

            let stats = cache.stats();
            assert_eq!(stats.in_use, objs as usize - i - 1);
            cache.check_occupancy();
        }

        let stats = cache.stats();
        assert_eq!(stats.free_slabs, 1);
        assert_eq!(stats.partial_slabs, 0);
        assert_eq!(stats.full_slabs, 0);
    }

    #[test]
    fn freed_slot_is_reused_first() {
        let mut cache = SlabCache::try_new(32, 512).unwrap();

        let a = cache.allocate().unwrap();
        unsafe { cache.deallocate(a.cast()).unwrap() };

        let b = cache.allocate().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn exhausted_cache_grows_on_demand() {
        let mut cache = SlabCache::try_new(16, 128).unwrap();
        let objs = cache.objects_per_slab();
        let mut objects = alloc::vec::Vec::new();

        for _ in 0..objs {
            objects.push(cache.allocate().unwrap());
        }
        assert_eq!(cache.stats().full_slabs, 1);

        // One more allocation forces a second slab.
        let extra = cache.allocate().unwrap();
        let stats = cache.stats();
        assert_eq!(stats.slabs, 2);
        assert_eq!(stats.full_slabs, 1);
        assert_eq!(stats.partial_slabs, 1);
        assert_eq!(stats.in_use, objs as usize + 1);
        cache.check_occupancy();

        // Freeing from the full slab moves it back to partial.
        unsafe { cache.deallocate(objects.pop().unwrap().cast()).unwrap() };
        let stats = cache.stats();
        assert_eq!(stats.full_slabs, 0);
        assert_eq!(stats.partial_slabs, 2);
        assert_eq!(stats.in_use, objs as usize);
        cache.check_occupancy();

        unsafe {
            cache.deallocate(extra.cast()).unwrap();
            for object in objects.drain(..) {
                cache.deallocate(object.cast()).unwrap();
            }
        }
        assert_eq!(cache.stats().in_use, 0);
    }

    #[test]
    fn single_object_slabs_skip_partial() {
        // A slab just big enough for one object never holds a partial state.
        let mut cache = SlabCache::try_new(64, 100).unwrap();
        assert_eq!(cache.objects_per_slab(), 1);

        let a = cache.allocate().unwrap();
        let stats = cache.stats();
        assert_eq!(stats.full_slabs, 1);
        assert_eq!(stats.partial_slabs, 0);
        cache.check_occupancy();

        unsafe { cache.deallocate(a.cast()).unwrap() };
        assert_eq!(cache.stats().free_slabs, 1);
        cache.check_occupancy();
    }

    #[test]
    fn double_free_in_live_slab_detected() {
        let mut cache = SlabCache::try_new(16, 128).unwrap();

        let a = cache.allocate().unwrap();
        let _b = cache.allocate().unwrap();

        unsafe { cache.deallocate(a.cast()).unwrap() };
        let before = cache.stats();

        assert_eq!(
            unsafe { cache.deallocate(a.cast()) },
            Err(FreeError::NotAllocated)
        );
        assert_eq!(cache.stats(), before);
        cache.check_occupancy();
    }

    #[test]
    fn free_slab_holds_no_live_objects() {
        let mut cache = SlabCache::try_new(16, 128).unwrap();

        let a = cache.allocate().unwrap();
        unsafe { cache.deallocate(a.cast()).unwrap() };

        // The slab is fully free now, so its interior is no longer a live
        // region.
        assert_eq!(
            unsafe { cache.deallocate(a.cast()) },
            Err(FreeError::OutOfRegion)
        );
    }

    #[test]
    fn interior_pointer_rejected() {
        let mut cache = SlabCache::try_new(16, 128).unwrap();

        let a = cache.allocate().unwrap();
        let interior = a
            .cast::<u8>()
            .map_addr(|addr| NonZeroUsize::new(addr.get() + 1).unwrap());

        assert_eq!(
            unsafe { cache.deallocate(interior) },
            Err(FreeError::NotAllocated)
        );
        assert_eq!(cache.stats().in_use, 1);

        unsafe { cache.deallocate(a.cast()).unwrap() };
    }

    #[test]
    fn header_and_stack_area_rejected() {
        let mut cache = SlabCache::try_new(16, 128).unwrap();

        let a = cache.allocate().unwrap();

        // Walk back from the object to the region base; the header area is
        // not allocatable space.
        let slot_offset = cache.layout.object_offset(cache.objects_per_slab() - 1);
        let region_base = a
            .cast::<u8>()
            .map_addr(|addr| NonZeroUsize::new(addr.get() - slot_offset).unwrap());

        assert_eq!(
            unsafe { cache.deallocate(region_base) },
            Err(FreeError::OutOfRegion)
        );

        unsafe { cache.deallocate(a.cast()).unwrap() };
    }

    #[test]
    fn foreign_pointer_rejected() {
        let mut cache = SlabCache::try_new(16, 128).unwrap();

        assert_eq!(
            unsafe { cache.deallocate(NonNull::dangling()) },
            Err(FreeError::OutOfRegion)
        );

        let _a = cache.allocate().unwrap();
        assert_eq!(
            unsafe { cache.deallocate(NonNull::dangling()) },
            Err(FreeError::OutOfRegion)
        );
    }

    #[test]
    fn objects_do_not_collide() {
        let mut cache = SlabCache::try_new(16, 128).unwrap();

        let a = cache.allocate().unwrap();
        let b = cache.allocate().unwrap();

        unsafe {
            a.cast::<u8>().as_ptr().write_bytes(0xaa, 16);
            b.cast::<u8>().as_ptr().write_bytes(0xbb, 16);

            let a_bytes = core::slice::from_raw_parts(a.cast::<u8>().as_ptr(), 16);
            assert!(a_bytes.iter().all(|&byte| byte == 0xaa));
        }
    }

    #[test]
    fn raw_backed_cache_cannot_grow() {
        let mut cache = SlabCache::try_new_in(16, 128, Raw).unwrap();

        assert_eq!(cache.allocate(), Err(AllocError));
        assert_eq!(cache.stats().slabs, 0);
    }

    #[test]
    fn slabs_carved_from_a_buddy_arena() {
        let buddy = Buddy::try_new(4096, 64).unwrap();
        let mut cache = SlabCache::try_new_in(32, 512, buddy).unwrap();

        let a = cache.allocate().unwrap();
        let b = cache.allocate().unwrap();

        // Each slab claims one block of the arena.
        assert_eq!(cache.backing_allocator.report().live_allocations, 1);
        assert_eq!(cache.backing_allocator.allocation_size(a.cast()), None);

        unsafe {
            a.cast::<u8>().as_ptr().write_bytes(0x5a, 32);
            cache.deallocate(a.cast()).unwrap();
            cache.deallocate(b.cast()).unwrap();
        }

        // Dropping the cache returns its slabs to the buddy, which releases
        // the arena when it is dropped in turn.
        drop(cache);
    }

    #[test]
    fn cache_of_caches() {
        let mut cache_cache =
            SlabCache::try_new(mem::size_of::<SlabCache<Global>>(), 4096).unwrap();

        let slot = cache_cache.allocate().unwrap();
        let inner_ptr = slot.cast::<SlabCache<Global>>();

        unsafe {
            inner_ptr
                .as_ptr()
                .write(SlabCache::try_new(64, 1024).unwrap());

            let inner = &mut *inner_ptr.as_ptr();
            let object = inner.allocate().unwrap();
            object.cast::<u8>().as_ptr().write_bytes(0x11, 64);
            inner.deallocate(object.cast()).unwrap();

            inner_ptr.as_ptr().drop_in_place();
            cache_cache.deallocate(slot.cast()).unwrap();
        }

        assert_eq!(cache_cache.stats().in_use, 0);
    }
}
