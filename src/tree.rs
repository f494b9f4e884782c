//! The status tree that tracks free blocks for the buddy allocator.
//!
//! The tree is a complete binary tree over the arena: the root covers the
//! whole arena, and each node's children cover the two halves of its block,
//! down to blocks of the minimum size. Nodes covering the two halves of the
//! same block are buddies. The tree is stored as a flat array in heap order,
//! with the root at index 1 and the children of node `i` at `2 * i` and
//! `2 * i + 1`; entry 0 is unused.
//!
//! Each entry records how many times the node's block must be halved to
//! reach the largest free block in its subtree: 0 means the whole block is
//! free, and one more than the number of levels below the node means nothing
//! in the subtree is free. Splitting and coalescing are implicit in this
//! encoding. Marking a node used makes every ancestor report a smaller free
//! block, and releasing it walks the same path upward, with a parent
//! returning to 0 exactly when both its children have.
//!
//! Statuses below a fully-allocated node are stale; lookups never descend
//! past an allocated node, so they are never observed.

use alloc::{boxed::Box, vec::Vec};

use crate::core::{alloc::Layout, num::UsizeExt};
use crate::AllocInitError;

/// A tree of free-block statuses, one status per power-of-two block.
#[derive(Clone, Debug)]
pub struct StatusTree {
    levels: u32,
    status: Box<[u8]>,
}

impl StatusTree {
    /// Attempts to create a tree of `levels` levels with every block free.
    ///
    /// # Errors
    ///
    /// Returns `Err(InvalidConfig)` if `levels` is zero or too large for the
    /// status array to be addressable, and `Err(AllocFailed)` if the status
    /// array cannot be allocated.
    pub fn try_new(levels: u32) -> Result<StatusTree, AllocInitError> {
        if levels == 0 || levels >= usize::BITS {
            return Err(AllocInitError::InvalidConfig);
        }

        let len = 1_usize << levels;
        let layout = Layout::array::<u8>(len).map_err(|_| AllocInitError::InvalidConfig)?;

        let mut status = Vec::new();
        status
            .try_reserve_exact(len)
            .map_err(|_| AllocInitError::AllocFailed(layout))?;
        status.resize(len, 0);

        Ok(StatusTree {
            levels,
            status: status.into_boxed_slice(),
        })
    }

    /// Returns the number of levels in the tree.
    pub fn levels(&self) -> u32 {
        self.levels
    }

    /// Returns the depth of the deepest level, i.e. the number of halvings
    /// from the whole arena down to a minimum-size block.
    pub fn order(&self) -> u32 {
        self.levels - 1
    }

    /// Returns `true` if every block in the tree is free.
    pub fn is_free(&self) -> bool {
        self.status[1] == 0
    }

    /// Returns the size of the largest free block, in minimum-size block
    /// units.
    pub fn largest_free(&self) -> usize {
        let halvings = u32::from(self.status[1]);

        if halvings == self.levels {
            0
        } else {
            (1_usize << self.order()) >> halvings
        }
    }

    #[inline]
    fn depth_of(node: usize) -> u32 {
        node.log2()
    }

    /// Returns the status that marks a node at `depth` fully allocated.
    #[inline]
    fn full_status(&self, depth: u32) -> u8 {
        (self.levels - depth) as u8
    }

    /// Returns `true` if the subtree rooted at `node` contains a free block
    /// of the size addressed at depth `target`.
    ///
    /// `depth` must be the depth of `node`, and at most `target`.
    #[inline]
    fn is_viable(&self, node: usize, depth: u32, target: u32) -> bool {
        u32::from(self.status[node]) <= target - depth
    }

    /// Finds the lowest-address free node at depth `target`, or `None` if no
    /// block that large is free.
    ///
    /// The search is a single descent with no backtracking: a viable node
    /// always has a viable child, because its status is one more than the
    /// smaller of its children's. Preferring the left child at every step
    /// yields the lowest-address fit.
    pub fn find_free(&self, target: u32) -> Option<usize> {
        debug_assert!(target <= self.order());

        let mut node = 1;

        if !self.is_viable(node, 0, target) {
            return None;
        }

        for depth in 1..=target {
            let left = 2 * node;

            node = if self.is_viable(left, depth, target) {
                left
            } else {
                debug_assert!(self.is_viable(left + 1, depth, target));
                left + 1
            };
        }

        debug_assert_eq!(self.status[node], 0);

        Some(node)
    }

    /// Marks the free block at `node` fully allocated and updates its
    /// ancestors.
    pub fn mark_used(&mut self, node: usize) {
        debug_assert_eq!(self.status[node], 0);

        self.status[node] = self.full_status(Self::depth_of(node));
        self.update_ancestors(node);
    }

    /// Marks the allocated block at `node` free and updates its ancestors.
    ///
    /// Coalescing is immediate: every ancestor whose children are now both
    /// fully free returns to status 0.
    pub fn release(&mut self, node: usize) {
        debug_assert_eq!(self.status[node], self.full_status(Self::depth_of(node)));

        self.status[node] = 0;
        self.update_ancestors(node);
    }

    /// Recomputes the status of every ancestor of `node`, bottom-up.
    ///
    /// The walk always continues to the root; any change to a child changes
    /// the minimum its parent is derived from.
    fn update_ancestors(&mut self, mut node: usize) {
        while node > 1 {
            node /= 2;

            let left = self.status[2 * node];
            let right = self.status[2 * node + 1];

            self.status[node] = if left == 0 && right == 0 {
                0
            } else {
                1 + left.min(right)
            };
        }
    }

    /// Returns the node at `depth` whose block starts at `offset`, given in
    /// minimum-size block units.
    pub fn node_at(&self, depth: u32, offset: usize) -> usize {
        (1 << depth) + (offset >> (self.order() - depth))
    }

    /// Returns the offset of `node`'s block, in minimum-size block units.
    pub fn offset_of(&self, node: usize) -> usize {
        let depth = Self::depth_of(node);

        (node - (1 << depth)) << (self.order() - depth)
    }

    /// Calls `f` with the depth and unit offset of every maximal free block,
    /// a free block whose buddy is not also free.
    ///
    /// Blocks at the same depth are visited in address order.
    pub fn for_each_free_block(&self, mut f: impl FnMut(u32, usize)) {
        self.visit_free(1, &mut f);
    }

    fn visit_free(&self, node: usize, f: &mut impl FnMut(u32, usize)) {
        let depth = Self::depth_of(node);

        if self.status[node] == 0 {
            f(depth, self.offset_of(node));
            return;
        }

        // A fully-allocated subtree holds nothing free, and the statuses
        // below it are stale.
        if self.status[node] == self.full_status(depth) {
            return;
        }

        self.visit_free(2 * node, f);
        self.visit_free(2 * node + 1, f);
    }

    /// Asserts the status encoding over the whole tree, given the set of
    /// nodes currently marked used.
    #[cfg(test)]
    pub fn check_invariants(&self, allocated: &[usize]) {
        fn walk(tree: &StatusTree, node: usize, allocated: &[usize]) {
            let depth = StatusTree::depth_of(node);

            if allocated.contains(&node) {
                assert_eq!(tree.status[node], tree.full_status(depth), "node {node}");
                return;
            }

            if depth == tree.order() {
                assert_eq!(tree.status[node], 0, "node {node}");
                return;
            }

            let left = tree.status[2 * node];
            let right = tree.status[2 * node + 1];
            let expected = if left == 0 && right == 0 {
                0
            } else {
                1 + left.min(right)
            };

            assert_eq!(tree.status[node], expected, "node {node}");

            walk(tree, 2 * node, allocated);
            walk(tree, 2 * node + 1, allocated);
        }

        walk(self, 1, allocated);
    }
}
