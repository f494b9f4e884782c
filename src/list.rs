//! Intrusive doubly-linked lists of slabs.
//!
//! A slab cache keeps each of its slabs on exactly one of three lists, and a
//! slab changes lists when its occupancy crosses a boundary. The links live
//! in the slab headers themselves, so moving a slab between lists touches no
//! allocator; the list value holds only the end pointers.
//!
//! The links are real pointers rather than bare addresses. Slab regions are
//! separate allocations, so an address alone could not be turned back into a
//! usable pointer; a header pointer carries the provenance of its own
//! region. Headers are never handed out to callers, so holding these
//! pointers does not alias any caller-visible memory.

use crate::core::ptr::NonNull;

use crate::slab::SlabHeader;

/// An intrusive doubly-linked list of slab headers.
///
/// Every operation is O(1) except [`iter`], which is O(1) per step.
///
/// [`iter`]: SlabList::iter
#[derive(Debug)]
pub(crate) struct SlabList {
    head: Option<NonNull<SlabHeader>>,
    tail: Option<NonNull<SlabHeader>>,
    len: usize,
}

impl SlabList {
    /// Creates an empty list.
    pub const fn new() -> SlabList {
        SlabList {
            head: None,
            tail: None,
            len: 0,
        }
    }

    /// Returns the number of slabs in the list.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the list holds no slabs.
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Returns the first slab in the list without removing it.
    pub fn first(&self) -> Option<NonNull<SlabHeader>> {
        self.head
    }

    /// Appends `slab` at the tail of the list.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `slab` must point to an initialized `SlabHeader` that remains valid
    ///   while it is on the list.
    /// - `slab` must not currently be on any list.
    /// - No other access to the headers on the list may be live.
    pub unsafe fn push_back(&mut self, mut slab: NonNull<SlabHeader>) {
        unsafe {
            let header = slab.as_mut();
            debug_assert!(header.prev.is_none() && header.next.is_none());

            header.prev = self.tail;
            header.next = None;
        }

        match self.tail {
            Some(mut tail) => unsafe { tail.as_mut().next = Some(slab) },
            None => self.head = Some(slab),
        }

        self.tail = Some(slab);
        self.len += 1;
    }

    /// Removes `slab` from the list.
    ///
    /// The removed header's links are set to `None`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `slab` must point to an initialized `SlabHeader` that is on this
    ///   list.
    /// - No other access to the headers on the list may be live.
    pub unsafe fn remove(&mut self, mut slab: NonNull<SlabHeader>) {
        let (prev, next) = unsafe {
            let header = slab.as_mut();
            (header.prev.take(), header.next.take())
        };

        match prev {
            Some(mut prev) => unsafe { prev.as_mut().next = next },
            None => {
                debug_assert_eq!(self.head, Some(slab));
                self.head = next;
            }
        }

        match next {
            Some(mut next) => unsafe { next.as_mut().prev = prev },
            None => {
                debug_assert_eq!(self.tail, Some(slab));
                self.tail = prev;
            }
        }

        self.len -= 1;
    }

    /// Removes and returns the first slab in the list.
    ///
    /// # Safety
    ///
    /// No other access to the headers on the list may be live.
    pub unsafe fn pop_front(&mut self) -> Option<NonNull<SlabHeader>> {
        let first = self.head?;
        unsafe { self.remove(first) };

        Some(first)
    }

    /// Returns an iterator over the slabs in the list, front to back.
    ///
    /// # Safety
    ///
    /// The headers on the list must stay valid and unmodified for as long as
    /// the returned iterator is used.
    pub unsafe fn iter(&self) -> SlabIter {
        SlabIter { next: self.head }
    }
}

/// An iterator over the slabs of a [`SlabList`].
#[derive(Debug)]
pub(crate) struct SlabIter {
    next: Option<NonNull<SlabHeader>>,
}

impl Iterator for SlabIter {
    type Item = NonNull<SlabHeader>;

    fn next(&mut self) -> Option<NonNull<SlabHeader>> {
        let current = self.next?;

        // SAFETY: a SlabIter is only created by SlabList::iter, whose caller
        // guarantees that the headers outlive the iterator unmodified.
        self.next = unsafe { current.as_ref().next };

        Some(current)
    }
}
