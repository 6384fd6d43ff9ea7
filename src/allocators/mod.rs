//! The [`RawHeap`] and [`TreeHeap`] allocators.

pub mod raw_heap;
pub mod tree_heap;

pub use raw_heap::RawHeap;
pub use tree_heap::TreeHeap;
