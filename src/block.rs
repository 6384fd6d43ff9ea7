//! Operations on the address-ordered chain of blocks inside a data page.
//!
//! Blocks tile their page without gaps: a block's `next` header starts exactly
//! [`HEADER_SIZE`] + `size` bytes after the block itself.
//!
//! ```text
//! +--------+---------+--------+-------------------+--------+------+
//! | Header | payload | Header | payload           | Header | ...  |
//! +--------+---------+--------+-------------------+--------+------+
//!  ^ header_list       ^ next                       ^ next
//! ```

use core::iter;
use core::ptr::{null_mut, NonNull};

use tracing::debug;

use crate::header::{Header, HEADER_SIZE};
use crate::page::{PageRecord, PageSource, PageStore};
use crate::size_index::FreeSizeIndex;

/// A tail is only split off when it can hold a header plus this many payload bytes.
pub const MIN_SPLIT_PAYLOAD: usize = 16;

/// Formats a freshly mapped data page into one detached free block spanning all of it.
///
/// # Safety
/// `page` must be a data page returned by [`PageStore::acquire`] that was not formatted yet.
pub unsafe fn format_page(page: NonNull<PageRecord>) -> *mut Header {
    let page = page.as_ptr();
    let block: *mut Header = PageRecord::base(page).cast();
    let usable = (*page).usable_size();
    debug_assert!(usable > HEADER_SIZE);

    block.write(Header::detached(null_mut(), null_mut(), usable - HEADER_SIZE));
    (*page).header_list = block;
    block
}

/// Shrinks `block` to `size` bytes and turns the unused tail into a new free block
/// which is added to `index`. Returns the new block, or `None` if the tail was too
/// small to hold a block, in which case `block` keeps its size.
///
/// # Safety
/// `block` must be a block that is not part of the index, `size` must be a multiple of
/// the header alignment no larger than the block size, and the block after `block` (if any)
/// must not be free, otherwise the new tail would sit next to another free block.
pub unsafe fn split<S: PageSource>(
    block: *mut Header,
    size: usize,
    index: &mut FreeSizeIndex,
    pages: &mut PageStore<S>,
) -> Option<NonNull<Header>> {
    debug_assert!(size <= (*block).size);
    if (*block).size < size + HEADER_SIZE + MIN_SPLIT_PAYLOAD {
        return None;
    }

    let next = (*block).next;
    debug_assert!(next.is_null() || !(*next).is_free());

    let tail: *mut Header = Header::payload(block).add(size).cast();
    tail.write(Header::detached(
        next,
        block,
        (*block).size - size - HEADER_SIZE,
    ));
    (*block).next = tail;
    if !next.is_null() {
        (*next).prev = tail;
    }
    (*block).size = size;

    debug!(?block, size, ?tail, tail_size = (*tail).size, "Split block.");
    index.insert(tail, pages);
    NonNull::new(tail)
}

/// Absorbs the block after `block` if it is free, removing it from `index`.
/// Returns whether a merge took place.
///
/// # Safety
/// `block` must point to a block of a data page.
pub unsafe fn try_merge_with_next(block: *mut Header, index: &mut FreeSizeIndex) -> bool {
    let next = (*block).next;
    if next.is_null() || !(*next).is_free() {
        return false;
    }

    index.remove(next);
    (*block).size += HEADER_SIZE + (*next).size;
    (*block).next = (*next).next;
    if !(*block).next.is_null() {
        (*(*block).next).prev = block;
    }
    debug!(?block, size = (*block).size, "Merged with next block.");
    true
}

/// Lets the block before `block` absorb it if that block is free, removing it from `index`.
/// Returns the block that now covers `block`'s memory.
///
/// # Safety
/// `block` must point to a block of a data page that is not part of the index.
pub unsafe fn try_merge_with_prev(block: *mut Header, index: &mut FreeSizeIndex) -> *mut Header {
    let prev = (*block).prev;
    if prev.is_null() || !(*prev).is_free() {
        return block;
    }

    index.remove(prev);
    (*prev).size += HEADER_SIZE + (*block).size;
    (*prev).next = (*block).next;
    if !(*prev).next.is_null() {
        (*(*prev).next).prev = prev;
    }
    debug!(block = ?prev, size = (*prev).size, "Merged with previous block.");
    prev
}

/// Iterates over the chain of blocks starting at `first`.
pub fn blocks(first: *mut Header) -> impl Iterator<Item = *mut Header> {
    iter::successors(NonNull::new(first), |block| unsafe {
        NonNull::new((*block.as_ptr()).next)
    })
    .map(NonNull::as_ptr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{AllocInfo, AllocKind};
    use crate::page::{PageKind, SystemSource};

    struct Fixture {
        pages: PageStore<SystemSource>,
        index: FreeSizeIndex,
        first: *mut Header,
    }

    impl Fixture {
        fn new() -> Self {
            let mut pages = PageStore::new(SystemSource, 4096);
            let page = pages.acquire(0, PageKind::Data);
            let first = unsafe { format_page(page) };
            Fixture {
                pages,
                index: FreeSizeIndex::new(),
                first,
            }
        }

        /// Carves `size` bytes off the front of `block` and marks them allocated.
        unsafe fn carve(&mut self, block: *mut Header, size: usize) -> *mut Header {
            let tail = split(block, size, &mut self.index, &mut self.pages)
                .unwrap()
                .as_ptr();
            (*block).mark_allocated(AllocKind::Single, AllocInfo::default());
            self.index.remove(tail);
            tail
        }

        fn sizes(&self) -> Vec<(usize, bool)> {
            blocks(self.first)
                .map(|b| unsafe { ((*b).size, (*b).is_free()) })
                .collect()
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.pages.release_all();
        }
    }

    #[test]
    fn test_format_page() {
        let f = Fixture::new();
        assert_eq!(f.sizes(), vec![(4096 - HEADER_SIZE, true)]);
        assert_eq!(
            unsafe { (*f.pages.pages().next().unwrap().as_ptr()).header_list },
            f.first
        );
    }

    #[test]
    fn test_split() {
        let mut f = Fixture::new();
        let total = unsafe { (*f.first).size };
        let tail = unsafe { split(f.first, 64, &mut f.index, &mut f.pages) }.unwrap();
        assert_eq!(f.sizes(), vec![(64, true), (total - 64 - HEADER_SIZE, true)]);
        unsafe {
            assert_eq!((*f.first).next, tail.as_ptr());
            assert_eq!((*tail.as_ptr()).prev, f.first);
            assert_eq!(
                tail.as_ptr() as usize,
                f.first as usize + HEADER_SIZE + 64
            );
        }
        assert_eq!(f.index.validate(), 1);
    }

    #[test]
    fn test_split_threshold() {
        let mut f = Fixture::new();
        let total = unsafe { (*f.first).size };
        // Leaves exactly a header and MIN_SPLIT_PAYLOAD bytes.
        let size = total - HEADER_SIZE - MIN_SPLIT_PAYLOAD;
        assert!(unsafe { split(f.first, size, &mut f.index, &mut f.pages) }.is_some());

        let mut f = Fixture::new();
        let size = total - HEADER_SIZE;
        assert!(unsafe { split(f.first, size, &mut f.index, &mut f.pages) }.is_none());
        assert_eq!(f.sizes(), vec![(total, true)]);
    }

    #[test]
    fn test_merge_with_next() {
        let mut f = Fixture::new();
        unsafe {
            let b = f.carve(f.first, 32);
            let c = f.carve(b, 48);
            let total = (*c).size;

            assert!(!try_merge_with_next(f.first, &mut f.index));

            f.index.insert(c, &mut f.pages);
            (*b).mark_free();
            assert!(try_merge_with_next(b, &mut f.index));
            assert_eq!((*b).size, 48 + HEADER_SIZE + total);
            assert!((*b).next.is_null());
            assert!(f.index.is_empty());
        }
    }

    #[test]
    fn test_merge_with_prev() {
        let mut f = Fixture::new();
        unsafe {
            let b = f.carve(f.first, 32);
            let c = f.carve(b, 48);

            assert_eq!(try_merge_with_prev(b, &mut f.index), b);

            (*f.first).mark_free();
            (*f.first).set_guard(true);
            f.index.insert(f.first, &mut f.pages);
            (*b).mark_free();
            let merged = try_merge_with_prev(b, &mut f.index);
            assert_eq!(merged, f.first);
            assert_eq!((*merged).size, 32 + HEADER_SIZE + 48);
            assert_eq!((*merged).next, c);
            assert_eq!((*c).prev, merged);
            assert!(f.index.is_empty());
        }
    }
}
