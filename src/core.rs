//! Re-exports of `core`, plus stable polyfills.
//!
//! The polyfill traits in this module are copied more-or-less verbatim from
//! the standard library source.

pub use core::{fmt, mem};

pub(crate) mod alloc {
    pub use core::alloc::*;

    /// Indicates an allocation failure due to resource exhaustion or an unsupported
    /// set of arguments.
    #[derive(Copy, Clone, PartialEq, Eq, Debug)]
    pub struct AllocError;

    /// Returns a `LayoutError`.
    ///
    /// `LayoutError` has no public constructor, so this obtains one from a
    /// `Layout` constructor that always fails.
    pub(crate) fn layout_error() -> LayoutError {
        match Layout::from_size_align(0, 0) {
            Ok(_) => unreachable!("alignment of zero is invalid"),
            Err(e) => e,
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn layout_error_returns_error() {
            let _: LayoutError = layout_error();
        }
    }
}

pub mod num {
    pub use core::num::*;

    // #![feature(int_log)]

    pub trait UsizeExt {
        fn log2(self) -> u32;
    }

    impl UsizeExt for usize {
        #[inline]
        fn log2(self) -> u32 {
            Self::BITS - 1 - self.leading_zeros()
        }
    }
}

pub(crate) mod ptr {
    pub use core::ptr::*;

    // #![feature(strict_provenance)]

    use core::num::NonZeroUsize;

    pub use sptr::Strict;

    pub trait NonNullStrict<T> {
        fn addr(self) -> NonZeroUsize
        where
            T: Sized;

        fn with_addr(self, addr: NonZeroUsize) -> Self
        where
            T: Sized;

        fn map_addr(self, f: impl FnOnce(NonZeroUsize) -> NonZeroUsize) -> Self
        where
            T: Sized;
    }

    impl<T> NonNullStrict<T> for NonNull<T> {
        fn addr(self) -> NonZeroUsize
        where
            T: Sized,
        {
            // SAFETY: The pointer is guaranteed by the type to be non-null,
            // meaning that the address will be non-zero.
            unsafe { NonZeroUsize::new_unchecked(self.as_ptr().addr()) }
        }

        fn with_addr(self, addr: NonZeroUsize) -> Self
        where
            T: Sized,
        {
            // SAFETY: The result of `with_addr` is non-null because `addr` is
            // guaranteed to be non-zero.
            unsafe { NonNull::new_unchecked(self.as_ptr().with_addr(addr.get()) as *mut _) }
        }

        fn map_addr(self, f: impl FnOnce(NonZeroUsize) -> NonZeroUsize) -> Self
        where
            T: Sized,
        {
            self.with_addr(f(self.addr()))
        }
    }
}
