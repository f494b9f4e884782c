#![cfg(test)]
extern crate std;

use crate::core::{
    alloc::{AllocError, Layout},
    fmt::Debug,
    ptr::NonNull,
};
use crate::{AllocInitError, Buddy, FreeError, Global, SlabCache};

use alloc::vec::Vec;
use quickcheck::{Arbitrary, Gen, QuickCheck};

/// Allocators drivable by a random operation sequence.
trait QcAllocator: Sized {
    type Params: Arbitrary + Debug;

    fn with_params(params: Self::Params) -> Result<Self, AllocInitError>;

    /// Attempts one allocation. For fixed-size allocators, `size` is a hint
    /// and the returned length is the allocator's own.
    fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, AllocError>;

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>) -> Result<(), FreeError>;
}

// Buddy ======================================================================

#[derive(Clone, Debug)]
struct BuddyParams {
    arena_size: usize,
    min_block_size: usize,
}

impl Arbitrary for BuddyParams {
    fn arbitrary(g: &mut Gen) -> Self {
        let min_exp = u32::arbitrary(g) % 5;
        let order = u32::arbitrary(g) % 8;

        BuddyParams {
            arena_size: 1 << (min_exp + order),
            min_block_size: 1 << min_exp,
        }
    }
}

impl QcAllocator for Buddy<Global> {
    type Params = BuddyParams;

    fn with_params(params: BuddyParams) -> Result<Self, AllocInitError> {
        Buddy::try_new(params.arena_size, params.min_block_size)
    }

    fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, AllocError> {
        let layout = Layout::from_size_align(size, 1).map_err(|_| AllocError)?;
        self.allocate(layout)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>) -> Result<(), FreeError> {
        unsafe { Buddy::deallocate(self, ptr) }
    }
}

// Slab cache =================================================================

#[derive(Clone, Debug)]
struct CacheParams {
    obj_size: usize,
    slab_size: usize,
}

impl Arbitrary for CacheParams {
    fn arbitrary(g: &mut Gen) -> Self {
        // The slab floor leaves room for the header, one stack entry and one
        // object of the largest size generated here.
        CacheParams {
            obj_size: usize::arbitrary(g) % 128 + 1,
            slab_size: usize::arbitrary(g) % 3840 + 256,
        }
    }
}

impl QcAllocator for SlabCache<Global> {
    type Params = CacheParams;

    fn with_params(params: CacheParams) -> Result<Self, AllocInitError> {
        SlabCache::try_new(params.obj_size, params.slab_size)
    }

    fn allocate(&mut self, _size: usize) -> Result<NonNull<[u8]>, AllocError> {
        self.allocate()
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>) -> Result<(), FreeError> {
        unsafe { SlabCache::deallocate(self, ptr) }
    }
}

// Operation sequences ========================================================

#[derive(Clone, Debug)]
enum AllocatorOp {
    /// Allocate a block of `size` bytes.
    Allocate { size: usize },
    /// Free an existing allocation.
    ///
    /// Given `n` outstanding allocations, the allocation to free is at index
    /// `index % n`.
    Free { index: usize },
}

/// Limit on allocation size, expressed in bits.
const ALLOC_LIMIT_BITS: u8 = 12;

fn limited_size(g: &mut Gen) -> usize {
    let exp = u8::arbitrary(g) % (ALLOC_LIMIT_BITS + 1);
    usize::arbitrary(g) % 2_usize.pow(exp.into()) + 1
}

impl Arbitrary for AllocatorOp {
    fn arbitrary(g: &mut Gen) -> Self {
        if bool::arbitrary(g) {
            AllocatorOp::Allocate {
                size: limited_size(g),
            }
        } else {
            AllocatorOp::Free {
                index: usize::arbitrary(g),
            }
        }
    }
}

type OpId = u32;

struct Allocation {
    id: OpId,
    ptr: NonNull<[u8]>,
}

fn pattern_byte(id: OpId, offset: usize) -> u8 {
    id.to_ne_bytes()[offset % 4]
}

/// Fills the allocated block with a pattern unique to `id`.
///
/// # Safety
///
/// `ptr` must be valid for writes for its entire length.
unsafe fn write_pattern(ptr: NonNull<[u8]>, id: OpId) {
    let base = ptr.as_ptr().cast::<u8>();

    for offset in 0..ptr.len() {
        unsafe { base.add(offset).write(pattern_byte(id, offset)) };
    }
}

/// Returns `true` if the block still holds the pattern written for `id`.
///
/// # Safety
///
/// `ptr` must be valid for reads for its entire length.
unsafe fn check_pattern(ptr: NonNull<[u8]>, id: OpId) -> bool {
    let base = ptr.as_ptr().cast::<u8>();

    (0..ptr.len()).all(|offset| unsafe { base.add(offset).read() } == pattern_byte(id, offset))
}

struct Checker<A: QcAllocator> {
    allocator: A,
    live: Vec<Allocation>,
    num_ops: OpId,
}

impl<A: QcAllocator> Checker<A> {
    fn new(params: A::Params) -> Result<Checker<A>, AllocInitError> {
        Ok(Checker {
            allocator: A::with_params(params)?,
            live: Vec::new(),
            num_ops: 0,
        })
    }

    fn do_op(&mut self, op: AllocatorOp) -> bool {
        let id = self.num_ops;
        self.num_ops += 1;

        match op {
            AllocatorOp::Allocate { size } => {
                // Failure is acceptable; the arena may be exhausted.
                if let Ok(ptr) = self.allocator.allocate(size) {
                    unsafe { write_pattern(ptr, id) };
                    self.live.push(Allocation { id, ptr });
                }

                true
            }

            AllocatorOp::Free { index } => {
                if self.live.is_empty() {
                    return true;
                }

                let a = self.live.swap_remove(index % self.live.len());

                // An intact pattern means no other allocation overlapped this
                // one.
                if !unsafe { check_pattern(a.ptr, a.id) } {
                    return false;
                }

                if unsafe { self.allocator.deallocate(a.ptr.cast()) }.is_err() {
                    return false;
                }

                // The address is no longer live, so a repeated free must be
                // detected.
                unsafe { self.allocator.deallocate(a.ptr.cast()) }.is_err()
            }
        }
    }

    /// Runs every operation, then frees the outstanding allocations.
    fn run(&mut self, ops: Vec<AllocatorOp>) -> bool {
        ops.into_iter().all(|op| self.do_op(op)) && self.drain()
    }

    fn drain(&mut self) -> bool {
        for a in self.live.drain(..) {
            if !unsafe { check_pattern(a.ptr, a.id) } {
                return false;
            }

            if unsafe { self.allocator.deallocate(a.ptr.cast()) }.is_err() {
                return false;
            }
        }

        true
    }
}

fn check<A: QcAllocator>(params: A::Params, ops: Vec<AllocatorOp>) -> bool {
    let mut checker: Checker<A> = Checker::new(params).unwrap();
    checker.run(ops)
}

// Miri is substantially slower to run property tests, so the number of test
// cases is reduced to keep the runtime in check.

#[cfg(not(miri))]
const MAX_TESTS: u64 = 100;

#[cfg(miri)]
const MAX_TESTS: u64 = 20;

#[test]
fn buddy_allocations_are_mutually_exclusive() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(check::<Buddy<Global>> as fn(_, _) -> bool);
}

#[test]
fn slab_allocations_are_mutually_exclusive() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(check::<SlabCache<Global>> as fn(_, _) -> bool);
}

fn buddy_drains_to_all_free(params: BuddyParams, ops: Vec<AllocatorOp>) -> bool {
    let mut checker: Checker<Buddy<Global>> = Checker::new(params.clone()).unwrap();

    if !checker.run(ops) {
        return false;
    }

    // With every allocation freed, the arena must have coalesced back into a
    // single block, and a whole-arena allocation must succeed.
    let report = checker.allocator.report();

    report.live_allocations == 0
        && report.live_bytes == 0
        && report.largest_free_block == params.arena_size
        && checker.allocator.free_blocks() == [(0, params.arena_size)]
        && checker
            .allocator
            .allocate(Layout::from_size_align(params.arena_size, 1).unwrap())
            .is_ok()
}

#[test]
fn buddy_returns_to_all_free() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(buddy_drains_to_all_free as fn(_, _) -> bool);
}

fn cache_stats_stay_consistent(params: CacheParams, ops: Vec<AllocatorOp>) -> bool {
    let mut checker: Checker<SlabCache<Global>> = Checker::new(params).unwrap();

    for op in ops {
        if !checker.do_op(op) {
            return false;
        }

        let stats = checker.allocator.stats();
        let consistent = stats.free_slabs + stats.partial_slabs + stats.full_slabs == stats.slabs
            && stats.capacity == stats.slabs * stats.objects_per_slab as usize
            && stats.in_use == checker.live.len()
            && stats.in_use <= stats.capacity;

        if !consistent {
            return false;
        }
    }

    checker.drain() && checker.allocator.stats().in_use == 0
}

#[test]
fn cache_occupancy_partitions_slabs() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(cache_stats_stay_consistent as fn(_, _) -> bool);
}

// Version sync ================================================================
#[test]
fn html_root_url() {
    version_sync::assert_html_root_url_updated!("src/lib.rs");
}
