//! A process-wide best-fit heap allocator with heap debugging built in.
//!
//! # Usage
//! To use this crate you can add `treeheap` as a dependency in your project's `Cargo.toml`.
//! ```toml
//! [dependencies]
//! treeheap = "0.1"
//! ```
//!
//! ```no_run
//! use treeheap::{MmapSource, TreeHeap};
//!
//! #[global_allocator]
//! static HEAP: TreeHeap<MmapSource> = TreeHeap::with_source(MmapSource::new());
//!
//! fn main() {
//!     let v1: Vec<u32> = vec![1, 2, 3];
//!     HEAP.validate();
//!     println!("Trees are cool {:?}, {} bytes in use", v1, HEAP.memory_used());
//! }
//! ```
//!
//! # Allocators
//! Two allocators are exported by this crate - [`RawHeap`] and [`TreeHeap`].
//! [`RawHeap`] is single-threaded and takes `&mut self`,
//! [`TreeHeap`] is just a `Mutex` wrapper over it which can also be used as a global
//! allocator (it implements both [`GlobalAlloc`] and [`Allocator`]).
//!
//! # Mode of operation
//! The allocator is a best-fit allocator over coarse pages:
//! - When an allocation is requested the [free size index](#free-size-index) is asked for the
//!   smallest free block that can hold it. Blocks of equal size are handed out oldest first.
//! - If no block is large enough a new [page](#pages) is mapped and registered as one
//!   big free block, after which the lookup is repeated.
//! - The chosen block is split, the unused tail becomes a new free block.
//! - On release the block is merged with its free neighbors and the result goes back
//!   into the free size index.
//!
//! Bellow is a list of the abstractions used by the allocators for operating on the heap:
//!
//! ## Pages
//! Memory comes from a [`PageSource`] in pages of at least 8 MiB by default.
//! Pages are never returned before the heap is torn down.
//!
//! ## Blocks
//! Every data page is tiled by blocks, each a [header](#headers) followed by a payload.
//! Blocks are chained in address order so that neighbors can be found in constant time.
//! Two free blocks are never adjacent.
//!
//! ## Headers
//! At the beginning of each block there is a header holding its neighbors, its payload size
//! and its state. Allocated blocks remember where and in which order they were allocated,
//! free blocks hold their links into the free size index.
//!
//! ## Free size index
//! A red-black tree with one node per distinct free block size. Each node owns a FIFO
//! queue of the free blocks of its size. Tree nodes live in dedicated pages.
//!
//! # Debugging
//! With the default `guard` feature every header is fenced with guard words that are
//! checked on every release, payloads are filled with `0xCF` on allocation and `0xCE` on
//! release, and the heap records the call-site of every allocation. On top of that:
//! - [`TreeHeap::validate`] checks the whole heap structure,
//! - [`TreeHeap::flag_current_allocs`] and [`TreeHeap::dump_unflagged_allocs`] find leaks,
//! - [`TreeHeap::set_break_alloc`] stops in the debugger at a given allocation,
//! - [`TreeHeap::enable_logging`] records every allocation to a file.
//!
//! Heap corruption is never recoverable: the condition is logged through [`tracing`]
//! and the process aborts.
//!
//! [`GlobalAlloc`]: std::alloc::GlobalAlloc
//! [`Allocator`]: std::alloc::Allocator
#![feature(allocator_api)]

pub use crate::allocators::{RawHeap, TreeHeap};
pub use crate::diagnostics::{FreeBlockReport, SizeClass};
pub use crate::header::{AllocKind, PAYLOAD_ALIGN};
#[cfg(unix)]
pub use crate::page::MmapSource;
pub use crate::page::{DefaultSource, PageSource, SystemSource, DEFAULT_MIN_PAGE_SIZE};

pub mod allocators;
mod block;
pub mod diagnostics;
mod header;
pub mod page;
mod size_index;
mod util;
