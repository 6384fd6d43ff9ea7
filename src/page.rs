//! [`PageSource`] trait, structures that implement it and the [`PageStore`].
//!
//! The heap never talks to the operating system directly: it maps coarse pages through a
//! [`PageSource`] and keeps them on an intrusive stack so they can all be returned at teardown.
//!
//! ```text
//!   page (data)                              page (tree nodes)
//! +--------------+                         +--------------+
//! | PageRecord   |  prev_page <----------- | PageRecord   | <- PageStore::list
//! +--------------+                         +--------------+
//! | Header       |                         | TreeNode     |
//! | payload ...  |                         | TreeNode     |
//! | Header       |                         | ...          |
//! | payload ...  |                         |              |
//! +--------------+                         +--------------+
//! ```

use core::alloc::Layout;
use core::iter;
use core::mem::size_of;
use core::ptr::{null_mut, NonNull};
use std::alloc::{GlobalAlloc, System};

use static_assertions::const_assert;
use tracing::{debug, error};

use crate::header::{Header, HEADER_SIZE, PAYLOAD_ALIGN};
use crate::util::{fatal, round_up};

/// Smallest data page requested from the page source, 8 MiB.
pub const DEFAULT_MIN_PAGE_SIZE: usize = 8 * 1024 * 1024;

/// [`PageStore::set_min_page_size`] only accepts sizes above this.
pub const MIN_PAGE_SIZE_FLOOR: usize = 2 << 20;

pub const RECORD_SIZE: usize = size_of::<PageRecord>();

// Keeps the first block of a data page aligned like every other header.
const_assert!(RECORD_SIZE % PAYLOAD_ALIGN == 0);

/// A trait for types that hand out independent chunks of memory.
///
/// # Safety
/// * `map` must return memory aligned to at least [`PAYLOAD_ALIGN`] bytes that is valid for
///   reads and writes of `size` bytes and not handed out to anyone else until it is unmapped.
/// * copying, cloning, or moving the source must not invalidate any page it handed out.
pub unsafe trait PageSource {
    /// Maps a page of exactly `size` bytes or returns `Err(())` if no memory is left.
    ///
    /// # Safety
    /// `size` must be nonzero.
    unsafe fn map(&mut self, size: usize) -> Result<NonNull<u8>, ()>;

    /// Returns a page to the source.
    ///
    /// # Safety
    /// `base` and `size` must be exactly those of a page previously returned by `map`
    /// that has not been unmapped yet.
    unsafe fn unmap(&mut self, base: NonNull<u8>, size: usize);
}

unsafe impl<T: PageSource + ?Sized> PageSource for &mut T {
    unsafe fn map(&mut self, size: usize) -> Result<NonNull<u8>, ()> {
        (**self).map(size)
    }

    unsafe fn unmap(&mut self, base: NonNull<u8>, size: usize) {
        (**self).unmap(base, size)
    }
}

/// A page source backed by anonymous private [`libc::mmap`] mappings.
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct MmapSource;

#[cfg(unix)]
impl MmapSource {
    pub const fn new() -> Self {
        MmapSource
    }
}

#[cfg(unix)]
unsafe impl PageSource for MmapSource {
    unsafe fn map(&mut self, size: usize) -> Result<NonNull<u8>, ()> {
        let protection = libc::PROT_READ | libc::PROT_WRITE;
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

        match libc::mmap(null_mut(), size, protection, flags, -1, 0) {
            libc::MAP_FAILED => Err(()),
            address => NonNull::new(address.cast()).ok_or(()),
        }
    }

    unsafe fn unmap(&mut self, base: NonNull<u8>, size: usize) {
        if libc::munmap(base.as_ptr().cast(), size) != 0 {
            error!(base = ?base.as_ptr(), size, "munmap failed, page is leaked.");
        }
    }
}

/// A page source that forwards to the [`System`] allocator.
/// Useful on platforms without `mmap` and under Miri.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSource;

impl SystemSource {
    pub const fn new() -> Self {
        SystemSource
    }
}

unsafe impl PageSource for SystemSource {
    unsafe fn map(&mut self, size: usize) -> Result<NonNull<u8>, ()> {
        let layout = Layout::from_size_align(size, PAYLOAD_ALIGN).map_err(|_| ())?;
        NonNull::new(System.alloc(layout)).ok_or(())
    }

    unsafe fn unmap(&mut self, base: NonNull<u8>, size: usize) {
        let layout = Layout::from_size_align_unchecked(size, PAYLOAD_ALIGN);
        System.dealloc(base.as_ptr(), layout)
    }
}

#[cfg(unix)]
pub type DefaultSource = MmapSource;
#[cfg(not(unix))]
pub type DefaultSource = SystemSource;

/// What a page is formatted into. The two kinds are never mixed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PageKind {
    /// One chain of blocks.
    Data,
    /// The backing store of the free size index node pool.
    TreeNodes,
}

/// Lives at the start of every page.
#[derive(Debug)]
#[repr(C, align(16))]
pub struct PageRecord {
    /// Mapped size, record included.
    pub alloc_size: usize,
    pub prev_page: *mut PageRecord,
    /// First block of a data page, null for a tree node page.
    pub header_list: *mut Header,
}

impl PageRecord {
    /// Returns the first usable byte after the record.
    ///
    /// # Safety
    /// `page` must point to a live page record.
    #[inline(always)]
    pub unsafe fn base(page: *mut PageRecord) -> *mut u8 {
        page.cast::<u8>().add(RECORD_SIZE)
    }

    /// Returns the number of usable bytes after the record.
    #[inline(always)]
    pub fn usable_size(&self) -> usize {
        self.alloc_size - RECORD_SIZE
    }
}

/// Intrusive stack of every page mapped by the heap.
#[derive(Debug)]
pub struct PageStore<S: PageSource> {
    source: S,
    list: *mut PageRecord,
    min_page_size: usize,
    page_count: usize,
    mapped_bytes: usize,
}

impl<S: PageSource> PageStore<S> {
    pub const fn new(source: S, min_page_size: usize) -> Self {
        PageStore {
            source,
            list: null_mut(),
            min_page_size,
            page_count: 0,
            mapped_bytes: 0,
        }
    }

    /// Maps a new page able to hold `min_bytes` of content and pushes it onto the page stack.
    ///
    /// Data pages hold at least one [`Header`] plus `min_bytes` and are never smaller than
    /// the minimum page size. Tree node pages are exactly `min_bytes` large.
    /// The page content is left unformatted.
    ///
    /// A page source failure releases every page and is fatal.
    pub fn acquire(&mut self, min_bytes: usize, kind: PageKind) -> NonNull<PageRecord> {
        let content = match kind {
            PageKind::Data => min_bytes
                .checked_add(HEADER_SIZE)
                .map(|size| size.max(self.min_page_size)),
            PageKind::TreeNodes => Some(min_bytes),
        };
        let Some(alloc_size) = content
            .and_then(|size| size.checked_add(RECORD_SIZE))
            .and_then(|size| round_up(size, PAYLOAD_ALIGN))
        else {
            self.memory_error(min_bytes)
        };

        let base = match unsafe { self.source.map(alloc_size) } {
            Ok(base) => base,
            Err(()) => self.memory_error(alloc_size),
        };
        debug_assert_eq!(base.as_ptr() as usize % PAYLOAD_ALIGN, 0);

        let page: NonNull<PageRecord> = base.cast();
        unsafe {
            page.as_ptr().write(PageRecord {
                alloc_size,
                prev_page: self.list,
                header_list: null_mut(),
            });
        }
        self.list = page.as_ptr();
        self.page_count += 1;
        self.mapped_bytes += alloc_size;

        debug!(
            ?kind,
            alloc_size,
            page = ?page.as_ptr(),
            total = self.mapped_bytes,
            "Mapped a new page."
        );
        page
    }

    /// Returns every page to the page source.
    ///
    /// Every pointer into the heap is dangling afterwards.
    pub fn release_all(&mut self) {
        let mut walk = self.list;
        while let Some(page) = NonNull::new(walk) {
            unsafe {
                let PageRecord {
                    alloc_size,
                    prev_page,
                    ..
                } = *page.as_ptr();
                self.source.unmap(page.cast(), alloc_size);
                walk = prev_page;
            }
        }
        debug!(pages = self.page_count, bytes = self.mapped_bytes, "Released all pages.");
        self.list = null_mut();
        self.page_count = 0;
        self.mapped_bytes = 0;
    }

    /// Iterates over the page stack, newest first.
    pub fn pages(&self) -> impl Iterator<Item = NonNull<PageRecord>> + '_ {
        iter::successors(NonNull::new(self.list), |page| unsafe {
            NonNull::new((*page.as_ptr()).prev_page)
        })
    }

    /// Iterates over the first block of every data page.
    pub fn data_pages(&self) -> impl Iterator<Item = *mut Header> + '_ {
        self.pages()
            .map(|page| unsafe { (*page.as_ptr()).header_list })
            .filter(|list| !list.is_null())
    }

    #[inline]
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    #[inline]
    pub fn mapped_bytes(&self) -> usize {
        self.mapped_bytes
    }

    #[inline]
    pub fn min_page_size(&self) -> usize {
        self.min_page_size
    }

    /// Sets the smallest data page size. It must be a power of two larger than 2 MiB.
    pub fn set_min_page_size(&mut self, size: usize) {
        if !size.is_power_of_two() || size <= MIN_PAGE_SIZE_FLOOR {
            fatal!("Minimum page size must be a power of two larger than 2 MiB, got {size}.");
        }
        self.min_page_size = size;
    }

    #[cold]
    fn memory_error(&mut self, size: usize) -> ! {
        error!(size, "Page source is out of memory, releasing every page.");
        self.release_all();
        fatal!("Error allocating memory ({size} bytes)! Shutting down.")
    }
}
