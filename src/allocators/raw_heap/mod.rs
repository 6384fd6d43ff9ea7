//! A singlethreaded memory allocator.
//!
// For a general view of the allocator's operational semantics see the [`crate`] level documentation.
//
// # Additional implementation notes
// ## Size augmentation
// Every payload is a multiple of [`PAYLOAD_ALIGN`] bytes so that the header following it
// stays aligned. Requests are rounded up by [`util::augment_size`] before the size index
// is queried, which means the index only ever holds sizes that are multiples of 16.
//
// ## Over-aligned layouts
// Payloads are [`PAYLOAD_ALIGN`]-aligned. Layouts asking for more are served from a block
// of `size + align` bytes: the object is placed at the first aligned address that leaves
// room for a back pointer to the block payload, which is stored right in front of the object.
//
// [`PAYLOAD_ALIGN`]: crate::header::PAYLOAD_ALIGN

use core::alloc::Layout;
use core::fmt::{self, Debug};
use core::panic::Location;
use core::ptr::{self, null_mut, NonNull};
use std::fs::File;

use tracing::{debug, instrument};

use self::util::{augment_size, padded_size, BACK_POINTER_SIZE};
use crate::block;
use crate::header::{AllocInfo, AllocKind, BlockState, Header, HEADER_SIZE, PAYLOAD_ALIGN};
use crate::page::{PageKind, PageSource, PageStore, DEFAULT_MIN_PAGE_SIZE};
use crate::size_index::FreeSizeIndex;
use crate::util::{debug_break, fatal, find_aligned};

pub(crate) mod util;

#[cfg(test)]
mod tests;

/// Byte pattern written over a fresh payload.
#[cfg(feature = "guard")]
pub const ALLOC_FILL: u8 = 0xCF;
/// Byte pattern written over a released payload.
#[cfg(feature = "guard")]
pub const FREE_FILL: u8 = 0xCE;

/// Call-site of an allocation, captured by `#[track_caller]` on the public surface.
pub type Site = Option<&'static Location<'static>>;

/// A single threaded memory allocator.
///
/// Owns every page it maps, dropping the heap returns them all to the page source.
pub struct RawHeap<S: PageSource> {
    pub(crate) pages: PageStore<S>,
    pub(crate) index: FreeSizeIndex,
    /// Sequence number of the next allocation.
    pub(crate) alloc_count: u32,
    pub(crate) break_alloc: Option<u32>,
    #[cfg(feature = "guard")]
    pub(crate) bytes_allocated: usize,
    pub(crate) log: Option<File>,
}

// The heap exclusively owns its pages, the raw pointers never alias another heap.
unsafe impl<S: PageSource + Send> Send for RawHeap<S> {}

impl<S: PageSource> Debug for RawHeap<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawHeap")
            .field("pages", &self.pages.page_count())
            .field("mapped_bytes", &self.pages.mapped_bytes())
            .field("free_sizes", &self.index.node_count())
            .field("alloc_count", &self.alloc_count)
            .finish()
    }
}

impl<S: PageSource> RawHeap<S> {
    /// Creates a heap mapping data pages of at least [`DEFAULT_MIN_PAGE_SIZE`] bytes from `source`.
    pub const fn new(source: S) -> Self {
        Self::with_source(source, DEFAULT_MIN_PAGE_SIZE)
    }

    /// Creates a heap mapping data pages of at least `min_page_size` bytes from `source`.
    /// No memory is mapped before the first allocation.
    pub const fn with_source(source: S, min_page_size: usize) -> Self {
        RawHeap {
            pages: PageStore::new(source, min_page_size),
            index: FreeSizeIndex::new(),
            alloc_count: 0,
            break_alloc: None,
            #[cfg(feature = "guard")]
            bytes_allocated: 0,
            log: None,
        }
    }

    /// Allocates at least `size` bytes aligned to [`PAYLOAD_ALIGN`] and returns the payload.
    ///
    /// Never fails: running out of memory is fatal.
    #[instrument(level = "debug", skip(self))]
    pub fn allocate(&mut self, size: usize, kind: AllocKind, site: Site) -> NonNull<u8> {
        let Ok(size) = augment_size(size) else {
            fatal!("Allocation of {size} bytes exceeds the address space.")
        };

        let block = match self.index.find_smallest_at_least(size) {
            Some(block) => block.as_ptr(),
            None => {
                debug!("No free block is large enough, acquiring a new page.");
                self.grow(size)
            }
        };

        unsafe {
            self.index.remove(block);
            block::split(block, size, &mut self.index, &mut self.pages);

            let alloc_num = self.alloc_count;
            (*block).mark_allocated(kind, alloc_info(site, alloc_num));
            self.alloc_count = alloc_num.wrapping_add(1);

            let payload = Header::payload(block);
            #[cfg(feature = "guard")]
            {
                self.bytes_allocated += (*block).size;
                payload.write_bytes(ALLOC_FILL, (*block).size);
            }
            self.log_record("alloc", block);
            debug!(?block, size = (*block).size, alloc_num, "Allocated block.");

            if self.break_alloc == Some(alloc_num) {
                debug_break(alloc_num);
            }
            NonNull::new_unchecked(payload)
        }
    }

    /// Maps a data page that can hold `size` bytes, registers it as one free block and
    /// returns the block the index now hands out for `size`.
    fn grow(&mut self, size: usize) -> *mut Header {
        let page = self.pages.acquire(size, PageKind::Data);
        unsafe {
            let block = block::format_page(page);
            self.index.insert(block, &mut self.pages);
        }
        match self.index.find_smallest_at_least(size) {
            Some(block) => block.as_ptr(),
            None => fatal!("A fresh page cannot hold {size} bytes."),
        }
    }

    /// Releases the allocation at `ptr`. A null pointer is ignored.
    ///
    /// Releasing a pointer that is not the payload of a live allocation of `kind` is fatal.
    ///
    /// # Safety
    /// `ptr` must be null or have been returned by this heap.
    #[instrument(level = "debug", skip(self))]
    pub unsafe fn release(&mut self, ptr: *mut u8, kind: AllocKind) {
        self.free_block(ptr, Some(kind))
    }

    unsafe fn free_block(&mut self, ptr: *mut u8, expected: Option<AllocKind>) {
        if ptr.is_null() {
            return;
        }
        let block = Header::from_payload(ptr);
        self.check_allocated(block, expected);

        self.log_record("free", block);
        #[cfg(feature = "guard")]
        {
            self.bytes_allocated -= (*block).size;
            ptr.write_bytes(FREE_FILL, (*block).size);
        }
        (*block).mark_free();

        block::try_merge_with_next(block, &mut self.index);
        let block = block::try_merge_with_prev(block, &mut self.index);
        self.index.insert(block, &mut self.pages);
        debug!(?block, size = (*block).size, "Released block.");
    }

    /// Fatal unless `block` is an allocated block with intact guards whose kind is `expected`.
    /// Returns the block's kind.
    unsafe fn check_allocated(&self, block: *mut Header, expected: Option<AllocKind>) -> AllocKind {
        match (*block).state() {
            BlockState::Allocated { kind, .. } => {
                if let Some(expected) = expected.filter(|&expected| expected != kind) {
                    fatal!(
                        "Array alloc mismatch! Block {block:?} was allocated as {kind:?} \
                         and released as {expected:?}."
                    );
                }
                (*block).check_guard(true);
                kind
            }
            state => fatal!("Not an allocated block! Block {block:?} is {state:?}."),
        }
    }

    /// Resizes the allocation at `ptr` to `new_size` bytes, in place when possible.
    ///
    /// A zero `new_size` releases `ptr` and returns null, a null `ptr` allocates.
    /// When the block has to move, the old payload is copied over and released.
    ///
    /// # Safety
    /// `ptr` must be null or have been returned by this heap.
    #[instrument(level = "debug", skip(self))]
    pub unsafe fn reallocate(&mut self, ptr: *mut u8, new_size: usize, site: Site) -> *mut u8 {
        if new_size == 0 {
            self.free_block(ptr, None);
            return null_mut();
        }
        if ptr.is_null() {
            return self.allocate(new_size, AllocKind::Single, site).as_ptr();
        }

        let block = Header::from_payload(ptr);
        let kind = self.check_allocated(block, None);
        let Ok(size) = augment_size(new_size) else {
            fatal!("Reallocation to {new_size} bytes exceeds the address space.")
        };
        let old_size = (*block).size;
        if size == old_size {
            return ptr;
        }

        let next = (*block).next;
        let absorbs_next =
            !next.is_null() && (*next).is_free() && old_size + HEADER_SIZE + (*next).size >= size;

        if absorbs_next || size < old_size {
            if absorbs_next {
                block::try_merge_with_next(block, &mut self.index);
            }
            block::split(block, size, &mut self.index, &mut self.pages);
            #[cfg(feature = "guard")]
            {
                self.bytes_allocated = self.bytes_allocated + (*block).size - old_size;
            }
            self.log_record("realloc", block);
            debug!(?block, old_size, size = (*block).size, "Resized block in place.");
            return ptr;
        }

        debug!("Couldn't resize block in place, moving the allocation.");
        let new_ptr = self.allocate(size, kind, site).as_ptr();
        ptr::copy_nonoverlapping(ptr, new_ptr, old_size);
        self.free_block(ptr, Some(kind));
        new_ptr
    }

    /// Allocates memory fitting `layout`, including alignments above [`PAYLOAD_ALIGN`].
    pub fn allocate_layout(&mut self, layout: Layout, site: Site) -> NonNull<u8> {
        let Ok(padded) = padded_size(layout) else {
            return self.allocate(layout.size(), AllocKind::Single, site);
        };

        let base = self.allocate(padded, AllocKind::Single, site).as_ptr();
        unsafe {
            let Some(object) = find_aligned(base.add(BACK_POINTER_SIZE), layout.align()) else {
                fatal!("Cannot align {base:?} to {} bytes.", layout.align())
            };
            let object = object.cast_mut();
            debug_assert!(object.add(layout.size()) <= base.add(padded));
            object.cast::<*mut u8>().sub(1).write(base);
            NonNull::new_unchecked(object)
        }
    }

    /// Releases memory returned by [`allocate_layout`](RawHeap::allocate_layout).
    ///
    /// # Safety
    /// `ptr` must have been returned by `allocate_layout` with the same `layout` alignment.
    pub unsafe fn release_layout(&mut self, ptr: *mut u8, layout: Layout) {
        let base = block_payload(ptr, layout);
        self.release(base, AllocKind::Single)
    }

    /// Resizes memory returned by [`allocate_layout`](RawHeap::allocate_layout).
    ///
    /// # Safety
    /// `ptr` must have been returned by `allocate_layout` with `layout`, `new_size` must be nonzero.
    pub unsafe fn reallocate_layout(
        &mut self,
        ptr: *mut u8,
        layout: Layout,
        new_size: usize,
        site: Site,
    ) -> *mut u8 {
        if layout.align() <= PAYLOAD_ALIGN {
            return self.reallocate(ptr, new_size, site);
        }
        let new_layout = Layout::from_size_align_unchecked(new_size, layout.align());
        let new_ptr = self.allocate_layout(new_layout, site).as_ptr();
        ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size));
        self.release_layout(ptr, layout);
        new_ptr
    }

    /// Returns the sum of the payload sizes of all allocated blocks.
    pub fn memory_used(&self) -> usize {
        self.blocks()
            .filter(|&block| unsafe { (*block).is_allocated() })
            .map(|block| unsafe { (*block).size })
            .sum()
    }

    /// Running total of allocated payload bytes.
    #[cfg(feature = "guard")]
    #[inline]
    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// Number of allocations made so far, which is also the sequence number of the next one.
    #[inline]
    pub fn alloc_count(&self) -> u32 {
        self.alloc_count
    }

    #[inline]
    pub fn page_count(&self) -> usize {
        self.pages.page_count()
    }

    #[inline]
    pub fn mapped_bytes(&self) -> usize {
        self.pages.mapped_bytes()
    }

    /// Sets the smallest data page size. It must be a power of two larger than 2 MiB.
    pub fn set_min_page_size(&mut self, size: usize) {
        self.pages.set_min_page_size(size)
    }

    /// Iterates over every block of every data page.
    pub(crate) fn blocks(&self) -> impl Iterator<Item = *mut Header> + '_ {
        self.pages.data_pages().flat_map(block::blocks)
    }

    /// Returns every page to the page source and resets the heap to its initial state.
    ///
    /// # Safety
    /// Every pointer handed out by the heap is dangling afterwards.
    pub unsafe fn teardown(&mut self) {
        self.pages.release_all();
        self.index = FreeSizeIndex::new();
        #[cfg(feature = "guard")]
        {
            self.bytes_allocated = 0;
        }
    }
}

impl<S: PageSource> Drop for RawHeap<S> {
    fn drop(&mut self) {
        unsafe { self.teardown() }
    }
}

/// Returns the payload of the block an object placed by
/// [`RawHeap::allocate_layout`] lives in.
unsafe fn block_payload(ptr: *mut u8, layout: Layout) -> *mut u8 {
    if ptr.is_null() || layout.align() <= PAYLOAD_ALIGN {
        return ptr;
    }
    ptr.cast::<*mut u8>().sub(1).read()
}

#[cfg(feature = "guard")]
#[inline(always)]
fn alloc_info(site: Site, alloc_num: u32) -> AllocInfo {
    AllocInfo { site, alloc_num }
}

#[cfg(not(feature = "guard"))]
#[inline(always)]
fn alloc_info(_site: Site, _alloc_num: u32) -> AllocInfo {
    AllocInfo::default()
}
