//! A multithreaded memory allocator.

use core::alloc::{AllocError, Allocator, GlobalAlloc, Layout};
use core::panic::Location;
use core::ptr::{self, NonNull};
use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::allocators::RawHeap;
use crate::diagnostics::FreeBlockReport;
use crate::header::AllocKind;
use crate::page::{DefaultSource, PageSource, DEFAULT_MIN_PAGE_SIZE};

/// A multithreaded memory allocator.
///
/// This allocator is just a `Mutex` wrapper over [`RawHeap`] to allow for multithreading.
/// Every method locks the heap once for its whole duration.
pub struct TreeHeap<S: PageSource> {
    inner: Mutex<RawHeap<S>>,
}

impl TreeHeap<DefaultSource> {
    /// Creates a heap backed by the platform's default page source.
    pub const fn new() -> Self {
        TreeHeap::with_source(DefaultSource::new())
    }
}

impl Default for TreeHeap<DefaultSource> {
    fn default() -> Self {
        TreeHeap::new()
    }
}

impl<S: PageSource> TreeHeap<S> {
    pub const fn with_source(source: S) -> Self {
        TreeHeap::with_page_size(source, DEFAULT_MIN_PAGE_SIZE)
    }

    pub const fn with_page_size(source: S, min_page_size: usize) -> Self {
        TreeHeap {
            inner: Mutex::new(RawHeap::with_source(source, min_page_size)),
        }
    }

    // A poisoned lock means a fatal error unwound under test, the heap itself is intact.
    #[inline]
    fn heap(&self) -> MutexGuard<'_, RawHeap<S>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocates at least `size` bytes and records the caller as the allocation site.
    /// Never returns null.
    #[track_caller]
    pub fn allocate(&self, size: usize) -> *mut u8 {
        let site = Location::caller();
        self.heap()
            .allocate(size, AllocKind::Single, Some(site))
            .as_ptr()
    }

    /// Like [`allocate`](TreeHeap::allocate) but the memory must be released with
    /// [`release_array`](TreeHeap::release_array).
    #[track_caller]
    pub fn allocate_array(&self, size: usize) -> *mut u8 {
        let site = Location::caller();
        self.heap()
            .allocate(size, AllocKind::Array, Some(site))
            .as_ptr()
    }

    /// # Safety
    /// `ptr` must be null or have been returned by [`allocate`](TreeHeap::allocate) or
    /// [`reallocate`](TreeHeap::reallocate) on this heap.
    pub unsafe fn release(&self, ptr: *mut u8) {
        self.heap().release(ptr, AllocKind::Single)
    }

    /// # Safety
    /// `ptr` must be null or have been returned by
    /// [`allocate_array`](TreeHeap::allocate_array) on this heap.
    pub unsafe fn release_array(&self, ptr: *mut u8) {
        self.heap().release(ptr, AllocKind::Array)
    }

    /// # Safety
    /// `ptr` must be null or have been returned by this heap.
    #[track_caller]
    pub unsafe fn reallocate(&self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        let site = Location::caller();
        self.heap().reallocate(ptr, new_size, Some(site))
    }

    pub fn validate(&self) {
        self.heap().validate()
    }

    pub fn memory_used(&self) -> usize {
        self.heap().memory_used()
    }

    #[cfg(feature = "guard")]
    pub fn bytes_allocated(&self) -> usize {
        self.heap().bytes_allocated()
    }

    pub fn free_block_report(&self) -> FreeBlockReport {
        self.heap().free_block_report()
    }

    pub fn set_break_alloc(&self, alloc_num: u32) {
        self.heap().set_break_alloc(alloc_num)
    }

    pub fn set_min_page_size(&self, size: usize) {
        self.heap().set_min_page_size(size)
    }

    /// Starts logging every allocation to a new file at `path`.
    pub fn enable_logging(&self, path: &Path) -> io::Result<()> {
        let log = File::create(path)?;
        self.heap().enable_logging(log)
    }

    pub fn disable_logging(&self) {
        let log = self.heap().disable_logging();
        drop(log);
    }

    #[cfg(feature = "guard")]
    pub fn flag_current_allocs(&self) -> usize {
        self.heap().flag_current_allocs()
    }

    /// Reports the live allocations made since the last
    /// [`flag_current_allocs`](TreeHeap::flag_current_allocs) to a new file at `sink`,
    /// or to the log when `sink` is `None`. Returns the number of reported allocations.
    #[cfg(feature = "guard")]
    pub fn dump_unflagged_allocs(&self, sink: Option<&Path>) -> io::Result<usize> {
        let mut file = sink.map(File::create).transpose()?;
        let heap = self.heap();
        heap.dump_unflagged_allocs(file.as_mut().map(|file| file as &mut dyn io::Write))
    }

    /// Writes every live allocation to a new file at `path`.
    #[cfg(feature = "guard")]
    pub fn dump_mem_snapshot(&self, path: &Path) -> io::Result<usize> {
        let mut file = File::create(path)?;
        let heap = self.heap();
        heap.dump_mem_snapshot(&mut file)
    }

    /// Returns every page to the page source.
    ///
    /// # Safety
    /// Every pointer handed out by the heap is dangling afterwards.
    pub unsafe fn teardown(&self) {
        self.heap().teardown()
    }
}

//---------------impl Allocator for TreeHeap---------------//

unsafe impl<S: PageSource + Send> Allocator for TreeHeap<S> {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        let ptr = self.heap().allocate_layout(layout, None);
        Ok(NonNull::slice_from_raw_parts(ptr, layout.size()))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        self.heap().release_layout(ptr.as_ptr(), layout)
    }

    unsafe fn grow(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        self.resize(ptr, old_layout, new_layout)
    }

    unsafe fn shrink(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        self.resize(ptr, old_layout, new_layout)
    }
}

impl<S: PageSource> TreeHeap<S> {
    unsafe fn resize(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        let mut heap = self.heap();
        let new_ptr = if old_layout.align() == new_layout.align() {
            heap.reallocate_layout(ptr.as_ptr(), old_layout, new_layout.size().max(1), None)
        } else {
            let new_ptr = heap.allocate_layout(new_layout, None).as_ptr();
            let count = old_layout.size().min(new_layout.size());
            ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr, count);
            heap.release_layout(ptr.as_ptr(), old_layout);
            new_ptr
        };
        NonNull::new(new_ptr)
            .map(|new_ptr| NonNull::slice_from_raw_parts(new_ptr, new_layout.size()))
            .ok_or(AllocError)
    }
}

//---------------impl GlobalAlloc for TreeHeap---------------//

unsafe impl<S: PageSource + Send> GlobalAlloc for TreeHeap<S> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.heap().allocate_layout(layout, None).as_ptr()
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.heap().release_layout(ptr, layout)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        self.heap().reallocate_layout(ptr, layout, new_size, None)
    }
}
