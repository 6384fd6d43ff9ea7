//! Defines the [`FreeSizeIndex`], a red-black tree of free blocks keyed by block size.
//!
//! Every [`TreeNode`] fronts a FIFO queue of free blocks of exactly its size, so a program
//! that keeps freeing and allocating objects of the same few sizes only ever touches a
//! handful of nodes. The queues are threaded through the free blocks themselves
//! (see [`FreeLinks`]).
//!
//! ```text
//!                 [ 64 ] --> blk --> blk --> blk
//!                /      \
//!  [ 32 ] --> blk        [ 4096 ] --> blk
//! ```
//!
//! The tree follows the classic CLRS formulation with a shared black NIL sentinel.
//! Tree nodes (the sentinel included) are never taken from the general heap; they come
//! from a [`NodePool`] carved out of dedicated tree node pages.

use core::mem::size_of;
use core::ptr::{addr_of_mut, null_mut, NonNull};

use tracing::debug;

use crate::header::{FreeLinks, Header};
use crate::page::{PageKind, PageRecord, PageSource, PageStore};
use crate::util::fatal;

/// Number of tree nodes carved out of one tree node page.
pub const TREE_NODES_PER_PAGE: usize = 2048;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Color {
    Red,
    Black,
}

/// Red-black tree node holding the queue of free blocks of one size.
#[derive(Debug)]
#[repr(C)]
pub struct TreeNode {
    size: usize,
    /// Doubles as the pool link while the node is unused.
    parent: *mut TreeNode,
    left: *mut TreeNode,
    right: *mut TreeNode,
    color: Color,
    queue_head: *mut Header,
    queue_tail: *mut Header,
}

impl TreeNode {
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the number of free blocks queued on this node.
    pub fn queue_len(&self) -> usize {
        let mut len = 0;
        let mut walk = self.queue_head;
        while !walk.is_null() {
            len += 1;
            walk = unsafe { links(walk).queue_next };
        }
        len
    }
}

/// Free list of unused tree nodes, linked through their `parent` field.
#[derive(Debug)]
struct NodePool {
    free: *mut TreeNode,
}

impl NodePool {
    const fn new() -> Self {
        NodePool { free: null_mut() }
    }

    fn take<S: PageSource>(&mut self, pages: &mut PageStore<S>) -> *mut TreeNode {
        if self.free.is_null() {
            self.refill(pages);
        }
        let node = self.free;
        unsafe { self.free = (*node).parent };
        node
    }

    fn give(&mut self, node: *mut TreeNode) {
        unsafe { addr_of_mut!((*node).parent).write(self.free) };
        self.free = node;
    }

    fn refill<S: PageSource>(&mut self, pages: &mut PageStore<S>) {
        let page = pages.acquire(TREE_NODES_PER_PAGE * size_of::<TreeNode>(), PageKind::TreeNodes);
        let first: *mut TreeNode = unsafe { PageRecord::base(page.as_ptr()).cast() };
        debug!(?first, count = TREE_NODES_PER_PAGE, "Refilled tree node pool.");

        unsafe {
            for i in 0..TREE_NODES_PER_PAGE - 1 {
                addr_of_mut!((*first.add(i)).parent).write(first.add(i + 1));
            }
            addr_of_mut!((*first.add(TREE_NODES_PER_PAGE - 1)).parent).write(self.free);
        }
        self.free = first;
    }
}

/// Returns the queue links of a free block.
///
/// # Safety
/// `block` must point to a free block header and the returned reference must not outlive
/// any other access to that header.
#[inline(always)]
unsafe fn links<'a>(block: *mut Header) -> &'a mut FreeLinks {
    (*block).free_links_mut()
}

/// Red-black tree of free block queues keyed by size.
#[derive(Debug)]
pub struct FreeSizeIndex {
    root: *mut TreeNode,
    /// Shared sentinel, null until the first insertion.
    nil: *mut TreeNode,
    pool: NodePool,
    node_count: usize,
}

impl FreeSizeIndex {
    pub const fn new() -> Self {
        FreeSizeIndex {
            root: null_mut(),
            nil: null_mut(),
            pool: NodePool::new(),
            node_count: 0,
        }
    }

    /// Returns the number of distinct free block sizes.
    #[inline]
    pub fn node_count(&self) -> usize {
        self.node_count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.node_count == 0
    }

    /// Returns the oldest free block of the smallest size that is greater or equal to `size`,
    /// or `None` if every free block is smaller.
    /// This operation has a time complexity of *O*(log *k*) where *k* is the number of distinct sizes.
    pub fn find_smallest_at_least(&self, size: usize) -> Option<NonNull<Header>> {
        if self.nil.is_null() {
            return None;
        }
        let nil = self.nil;
        let mut best = nil;
        let mut walk = self.root;
        unsafe {
            while walk != nil {
                if size == (*walk).size {
                    return NonNull::new((*walk).queue_head);
                } else if size > (*walk).size {
                    walk = (*walk).right;
                } else {
                    best = walk;
                    walk = (*walk).left;
                }
            }
            match best == nil {
                true => None,
                false => NonNull::new((*best).queue_head),
            }
        }
    }

    /// Adds a free block at the tail of the queue for its size, creating the tree node if needed.
    ///
    /// # Safety
    /// `block` must point to a detached free block (see [`Header::detached`])
    /// that is not part of the index.
    pub unsafe fn insert<S: PageSource>(&mut self, block: *mut Header, pages: &mut PageStore<S>) {
        debug_assert!((*block).is_free(), "Only free blocks can be indexed.");
        (*block).check_guard(true);
        (*block).set_guard(false);

        if self.nil.is_null() {
            self.init_sentinel(pages);
        }
        let nil = self.nil;
        let size = (*block).size;

        let mut parent = nil;
        let mut walk = self.root;
        while walk != nil {
            parent = walk;
            if size < (*walk).size {
                walk = (*walk).left;
            } else if size > (*walk).size {
                walk = (*walk).right;
            } else {
                let tail = (*walk).queue_tail;
                links(tail).queue_next = block;
                *links(block) = FreeLinks {
                    queue_next: null_mut(),
                    queue_prev: tail,
                    tree_node: walk,
                };
                (*walk).queue_tail = block;
                return;
            }
        }

        let node = self.pool.take(pages);
        node.write(TreeNode {
            size,
            parent,
            left: nil,
            right: nil,
            color: Color::Red,
            queue_head: block,
            queue_tail: block,
        });
        *links(block) = FreeLinks {
            queue_next: null_mut(),
            queue_prev: null_mut(),
            tree_node: node,
        };
        self.node_count += 1;

        if parent == nil {
            self.root = node;
        } else if size < (*parent).size {
            (*parent).left = node;
        } else {
            (*parent).right = node;
        }

        self.insert_fixup(node);
    }

    /// Unlinks a free block from its queue, deleting the tree node if the queue becomes empty.
    ///
    /// # Safety
    /// `block` must point to a free block that is part of the index.
    pub unsafe fn remove(&mut self, block: *mut Header) {
        debug_assert!((*block).is_free(), "Only free blocks can be indexed.");
        (*block).check_guard(false);

        let FreeLinks {
            queue_next: next,
            queue_prev: prev,
            tree_node: node,
        } = *links(block);
        debug_assert!(!node.is_null(), "Block is not part of the index.");

        (*block).set_guard(true);

        match prev.is_null() {
            true => (*node).queue_head = next,
            false => links(prev).queue_next = next,
        }
        match next.is_null() {
            true => (*node).queue_tail = prev,
            false => links(next).queue_prev = prev,
        }

        if prev.is_null() && next.is_null() {
            self.delete_node(node);
        }
    }

    unsafe fn init_sentinel<S: PageSource>(&mut self, pages: &mut PageStore<S>) {
        let nil = self.pool.take(pages);
        nil.write(TreeNode {
            size: 0,
            parent: null_mut(),
            left: null_mut(),
            right: null_mut(),
            color: Color::Black,
            queue_head: null_mut(),
            queue_tail: null_mut(),
        });
        self.nil = nil;
        self.root = nil;
    }

    unsafe fn rotate_left(&mut self, x: *mut TreeNode) {
        let nil = self.nil;
        let y = (*x).right;
        (*x).right = (*y).left;
        if (*y).left != nil {
            (*(*y).left).parent = x;
        }
        (*y).parent = (*x).parent;
        if (*x).parent == nil {
            self.root = y;
        } else if x == (*(*x).parent).left {
            (*(*x).parent).left = y;
        } else {
            (*(*x).parent).right = y;
        }
        (*y).left = x;
        (*x).parent = y;
    }

    unsafe fn rotate_right(&mut self, x: *mut TreeNode) {
        let nil = self.nil;
        let y = (*x).left;
        (*x).left = (*y).right;
        if (*y).right != nil {
            (*(*y).right).parent = x;
        }
        (*y).parent = (*x).parent;
        if (*x).parent == nil {
            self.root = y;
        } else if x == (*(*x).parent).left {
            (*(*x).parent).left = y;
        } else {
            (*(*x).parent).right = y;
        }
        (*y).right = x;
        (*x).parent = y;
    }

    unsafe fn insert_fixup(&mut self, mut z: *mut TreeNode) {
        while z != self.root && (*(*z).parent).color == Color::Red {
            let parent = (*z).parent;
            let grandparent = (*parent).parent;

            if parent == (*grandparent).left {
                let uncle = (*grandparent).right;
                if (*uncle).color == Color::Red {
                    (*parent).color = Color::Black;
                    (*uncle).color = Color::Black;
                    (*grandparent).color = Color::Red;
                    z = grandparent;
                } else {
                    if z == (*parent).right {
                        z = parent;
                        self.rotate_left(z);
                    }
                    (*(*z).parent).color = Color::Black;
                    (*(*(*z).parent).parent).color = Color::Red;
                    self.rotate_right((*(*z).parent).parent);
                }
            } else {
                let uncle = (*grandparent).left;
                if (*uncle).color == Color::Red {
                    (*parent).color = Color::Black;
                    (*uncle).color = Color::Black;
                    (*grandparent).color = Color::Red;
                    z = grandparent;
                } else {
                    if z == (*parent).left {
                        z = parent;
                        self.rotate_right(z);
                    }
                    (*(*z).parent).color = Color::Black;
                    (*(*(*z).parent).parent).color = Color::Red;
                    self.rotate_left((*(*z).parent).parent);
                }
            }
        }
        (*self.root).color = Color::Black;
    }

    /// Removes `z` from the tree and returns it to the pool.
    ///
    /// Nodes own their queues so, unlike textbook deletion, the successor is relinked
    /// into `z`'s position instead of having its key copied over.
    unsafe fn delete_node(&mut self, z: *mut TreeNode) {
        let nil = self.nil;
        (*nil).color = Color::Black;

        let y = match (*z).left == nil || (*z).right == nil {
            true => z,
            false => {
                let mut y = (*z).right;
                while (*y).left != nil {
                    y = (*y).left;
                }
                y
            }
        };
        let x = match (*y).left != nil {
            true => (*y).left,
            false => (*y).right,
        };

        // Splice y out, x takes its place (x may be the sentinel).
        (*x).parent = (*y).parent;
        if (*y).parent == nil {
            self.root = x;
        } else if y == (*(*y).parent).left {
            (*(*y).parent).left = x;
        } else {
            (*(*y).parent).right = x;
        }

        let removed_color = (*y).color;
        if y != z {
            // Move y into z's position.
            let zp = (*z).parent;
            if zp == nil {
                self.root = y;
            } else if (*zp).left == z {
                (*zp).left = y;
            } else {
                (*zp).right = y;
            }
            (*y).left = (*z).left;
            (*y).right = (*z).right;
            if (*y).left != nil {
                (*(*y).left).parent = y;
            }
            if (*y).right != nil {
                (*(*y).right).parent = y;
            }
            (*y).parent = zp;
            (*y).color = (*z).color;
            if (*x).parent == z {
                (*x).parent = y;
            }
        }

        self.pool.give(z);
        self.node_count -= 1;

        if removed_color == Color::Black {
            self.delete_fixup(x);
        }
        if self.root == nil {
            (*nil).parent = null_mut();
        }
    }

    unsafe fn delete_fixup(&mut self, mut x: *mut TreeNode) {
        while x != self.root && (*x).color == Color::Black {
            let parent = (*x).parent;
            if x == (*parent).left {
                let mut w = (*parent).right;
                if (*w).color == Color::Red {
                    (*w).color = Color::Black;
                    (*parent).color = Color::Red;
                    self.rotate_left(parent);
                    w = (*(*x).parent).right;
                }
                if (*(*w).left).color == Color::Black && (*(*w).right).color == Color::Black {
                    (*w).color = Color::Red;
                    x = (*x).parent;
                } else {
                    if (*(*w).right).color == Color::Black {
                        (*(*w).left).color = Color::Black;
                        (*w).color = Color::Red;
                        self.rotate_right(w);
                        w = (*(*x).parent).right;
                    }
                    (*w).color = (*(*x).parent).color;
                    (*(*x).parent).color = Color::Black;
                    (*(*w).right).color = Color::Black;
                    self.rotate_left((*x).parent);
                    x = self.root;
                }
            } else {
                let mut w = (*parent).left;
                if (*w).color == Color::Red {
                    (*w).color = Color::Black;
                    (*parent).color = Color::Red;
                    self.rotate_right(parent);
                    w = (*(*x).parent).left;
                }
                if (*(*w).left).color == Color::Black && (*(*w).right).color == Color::Black {
                    (*w).color = Color::Red;
                    x = (*x).parent;
                } else {
                    if (*(*w).left).color == Color::Black {
                        (*(*w).right).color = Color::Black;
                        (*w).color = Color::Red;
                        self.rotate_left(w);
                        w = (*(*x).parent).left;
                    }
                    (*w).color = (*(*x).parent).color;
                    (*(*x).parent).color = Color::Black;
                    (*(*w).left).color = Color::Black;
                    self.rotate_right((*x).parent);
                    x = self.root;
                }
            }
        }
        (*x).color = Color::Black;
    }

    /// Calls `f` for every node with its depth (the root is at depth 1), in key order.
    pub fn for_each_node(&self, mut f: impl FnMut(&TreeNode, u32)) {
        if self.nil.is_null() {
            return;
        }
        unsafe { self.walk(self.root, 1, &mut f) }
    }

    unsafe fn walk(&self, node: *mut TreeNode, depth: u32, f: &mut impl FnMut(&TreeNode, u32)) {
        if node == self.nil {
            return;
        }
        self.walk((*node).left, depth + 1, f);
        f(&*node, depth);
        self.walk((*node).right, depth + 1, f);
    }

    /// Checks the binary search and red-black properties as well as every size queue.
    /// Returns the number of queued blocks. Any inconsistency is fatal.
    pub fn validate(&self) -> usize {
        if self.nil.is_null() {
            return 0;
        }
        unsafe {
            let nil = self.nil;
            if (*nil).color != Color::Black {
                fatal!("Tree sentinel is red.");
            }
            if self.root == nil {
                if self.node_count != 0 {
                    fatal!("Empty tree claims {} nodes.", self.node_count);
                }
                return 0;
            }
            if (*self.root).color != Color::Black {
                fatal!("Tree root {:?} is red.", self.root);
            }
            if (*self.root).parent != nil {
                fatal!("Tree root {:?} has a parent.", self.root);
            }

            let mut blocks = 0;
            let mut nodes = 0;
            self.validate_subtree(self.root, None, None, &mut blocks, &mut nodes);
            if nodes != self.node_count {
                fatal!("Tree holds {nodes} nodes but counts {}.", self.node_count);
            }
            blocks
        }
    }

    /// Returns the black height of the subtree rooted at `node`.
    unsafe fn validate_subtree(
        &self,
        node: *mut TreeNode,
        lower: Option<usize>,
        upper: Option<usize>,
        blocks: &mut usize,
        nodes: &mut usize,
    ) -> usize {
        let nil = self.nil;
        if node == nil {
            return 1;
        }
        *nodes += 1;
        let size = (*node).size;

        if lower.is_some_and(|lower| size <= lower) || upper.is_some_and(|upper| size >= upper) {
            fatal!("Tree node {node:?} of size {size} breaks the search order.");
        }
        for child in [(*node).left, (*node).right] {
            if child != nil && (*child).parent != node {
                fatal!("Tree node {child:?} has a wrong parent link.");
            }
        }
        if (*node).color == Color::Red
            && ((*(*node).left).color == Color::Red || (*(*node).right).color == Color::Red)
        {
            fatal!("Red tree node {node:?} of size {size} has a red child.");
        }

        let mut walk = (*node).queue_head;
        if walk.is_null() {
            fatal!("Tree node {node:?} of size {size} has an empty queue.");
        }
        let mut prev = null_mut();
        while !walk.is_null() {
            if !(*walk).is_free() {
                fatal!("Block {walk:?} is queued but not free.");
            }
            let FreeLinks {
                queue_next,
                queue_prev,
                tree_node,
            } = *links(walk);
            if queue_prev != prev {
                fatal!("Block {walk:?} has a wrong queue link.");
            }
            if tree_node != node {
                fatal!("Block {walk:?} points to the wrong tree node.");
            }
            if (*walk).size != size {
                fatal!("Block {walk:?} of size {} is queued under {size}.", (*walk).size);
            }
            if queue_next.is_null() && walk != (*node).queue_tail {
                fatal!("Queue tail of tree node {node:?} is stale.");
            }
            *blocks += 1;
            prev = walk;
            walk = queue_next;
        }

        let left = self.validate_subtree((*node).left, lower, Some(size), blocks, nodes);
        let right = self.validate_subtree((*node).right, Some(size), upper, blocks, nodes);
        if left != right {
            fatal!("Tree node {node:?} of size {size} has unequal black heights {left} and {right}.");
        }
        left + ((*node).color == Color::Black) as usize
    }
}

impl Default for FreeSizeIndex {
    fn default() -> Self {
        Self::new()
    }
}
