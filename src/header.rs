//! Defines the block [`Header`] and associated constants and functions.
//!
//! Every block starts with a header which is immediately followed by the block payload.
//! The header layout comes in two variants selected by the `guard` feature:
//!
//! ```text
//!   minimal                       instrumented (`guard`)
//! +-----------------------+     +-----------------------+
//! | next                  |     | preguard [u32; 4]     |
//! | prev                  |     | next                  |
//! | size                  |     | prev                  |
//! | flags                 |     | size                  |
//! | body (free | alloc)   |     | flags                 |
//! +-----------------------+     | body (free | alloc)   |
//! | payload ...           |     | postguard [u32; 4]    |
//!                               +-----------------------+
//!                               | payload ...           |
//! ```
//!
//! The body is a union whose active variant is selected by the state tag in `flags`:
//! free blocks keep their size-queue links there, allocated blocks keep their
//! call-site and sequence number (guard builds only).

use core::mem::{align_of, size_of};
#[cfg(feature = "guard")]
use core::panic::Location;
use core::ptr::null_mut;

use static_assertions::const_assert;

use crate::size_index::TreeNode;

pub const HEADER_SIZE: usize = size_of::<Header>();
pub const HEADER_ALIGN: usize = align_of::<Header>();

/// Alignment of every payload handed out by the heap.
pub const PAYLOAD_ALIGN: usize = HEADER_ALIGN;

#[cfg(feature = "guard")]
pub const GUARD_WORDS: usize = 4;
pub const ALLOCATED_GUARD: u32 = 0xCEDE_FEDE;
pub const FREE_GUARD: u32 = 0x5555_FFFF;

const ALLOCATED: u32 = 1 << 0;
const ARRAY: u32 = 1 << 1;
#[cfg(feature = "guard")]
const FLAGGED: u32 = 1 << 2;
#[cfg(feature = "guard")]
const KNOWN_FLAGS: u32 = ALLOCATED | ARRAY | FLAGGED;
#[cfg(not(feature = "guard"))]
const KNOWN_FLAGS: u32 = ALLOCATED | ARRAY;

// Payload sizes are rounded to the header alignment so that headers following
// a payload stay naturally aligned.
const_assert!(HEADER_ALIGN == 16);
const_assert!(HEADER_SIZE % HEADER_ALIGN == 0);

/// Whether an allocation was made for a single object or for an array.
/// Releasing with the wrong kind is a fatal error.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AllocKind {
    Single,
    Array,
}

/// Decoded view of a header's state tag.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BlockState {
    Free,
    Allocated { kind: AllocKind, flagged: bool },
    /// The tag holds bits the heap never writes, the header is not one of ours.
    Corrupt(u32),
}

/// Links of a free block into the queue of its [`TreeNode`].
#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub struct FreeLinks {
    pub queue_next: *mut Header,
    pub queue_prev: *mut Header,
    pub tree_node: *mut TreeNode,
}

/// Bookkeeping of an allocated block.
#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct AllocInfo {
    #[cfg(feature = "guard")]
    pub site: Option<&'static Location<'static>>,
    #[cfg(feature = "guard")]
    pub alloc_num: u32,
}

#[derive(Copy, Clone)]
#[repr(C)]
union Body {
    free: FreeLinks,
    alloc: AllocInfo,
}

/// Block header. `next` and `prev` point to the physically adjacent blocks of the same page.
#[repr(C, align(16))]
pub struct Header {
    #[cfg(feature = "guard")]
    preguard: [u32; GUARD_WORDS],
    pub next: *mut Header,
    pub prev: *mut Header,
    /// Payload size in bytes, the header itself excluded.
    pub size: usize,
    flags: u32,
    body: Body,
    #[cfg(feature = "guard")]
    postguard: [u32; GUARD_WORDS],
}

impl Header {
    /// Creates the header of a block that is free but not yet part of the size index.
    ///
    /// Its guard words carry the allocated pattern,
    /// [`FreeSizeIndex::insert`](crate::size_index::FreeSizeIndex::insert) flips them.
    pub fn detached(next: *mut Header, prev: *mut Header, size: usize) -> Header {
        Header {
            #[cfg(feature = "guard")]
            preguard: [ALLOCATED_GUARD; GUARD_WORDS],
            next,
            prev,
            size,
            flags: 0,
            body: Body {
                free: FreeLinks {
                    queue_next: null_mut(),
                    queue_prev: null_mut(),
                    tree_node: null_mut(),
                },
            },
            #[cfg(feature = "guard")]
            postguard: [ALLOCATED_GUARD; GUARD_WORDS],
        }
    }

    /// Returns the header preceding the payload at `payload`.
    ///
    /// # Safety
    /// `payload` must point exactly [`HEADER_SIZE`] bytes past a header.
    #[inline(always)]
    pub unsafe fn from_payload(payload: *mut u8) -> *mut Header {
        payload.sub(HEADER_SIZE).cast()
    }

    /// Returns the address of the payload following `header`.
    ///
    /// # Safety
    /// `header` must point to a header inside a page.
    #[inline(always)]
    pub unsafe fn payload(header: *mut Header) -> *mut u8 {
        header.cast::<u8>().add(HEADER_SIZE)
    }

    /// Returns the address one past the end of the block payload,
    /// which is where the next block (if any) starts.
    #[inline(always)]
    pub fn end(&self) -> *const u8 {
        (self as *const Header)
            .cast::<u8>()
            .wrapping_add(HEADER_SIZE + self.size)
    }

    #[inline]
    pub fn state(&self) -> BlockState {
        if self.flags == 0 {
            return BlockState::Free;
        }
        if self.flags & ALLOCATED == 0 || self.flags & !KNOWN_FLAGS != 0 {
            return BlockState::Corrupt(self.flags);
        }
        let kind = match self.flags & ARRAY {
            0 => AllocKind::Single,
            _ => AllocKind::Array,
        };
        #[cfg(feature = "guard")]
        let flagged = self.flags & FLAGGED != 0;
        #[cfg(not(feature = "guard"))]
        let flagged = false;
        BlockState::Allocated { kind, flagged }
    }

    #[inline(always)]
    pub fn is_free(&self) -> bool {
        self.flags == 0
    }

    #[inline(always)]
    pub fn is_allocated(&self) -> bool {
        matches!(self.state(), BlockState::Allocated { .. })
    }

    #[inline]
    pub fn mark_free(&mut self) {
        self.flags = 0;
    }

    /// Tags the block as allocated and replaces the body with `info`.
    #[inline]
    pub fn mark_allocated(&mut self, kind: AllocKind, info: AllocInfo) {
        self.flags = match kind {
            AllocKind::Single => ALLOCATED,
            AllocKind::Array => ALLOCATED | ARRAY,
        };
        self.body.alloc = info;
    }

    /// Sets the leak-snapshot bit of an allocated block.
    #[cfg(feature = "guard")]
    #[inline]
    pub fn set_flagged(&mut self) {
        debug_assert!(self.is_allocated());
        self.flags |= FLAGGED;
    }

    /// # Safety
    /// The block must be free.
    #[inline(always)]
    pub unsafe fn free_links(&self) -> &FreeLinks {
        debug_assert!(self.is_free());
        &self.body.free
    }

    /// # Safety
    /// The block must be free.
    #[inline(always)]
    pub unsafe fn free_links_mut(&mut self) -> &mut FreeLinks {
        debug_assert!(self.is_free());
        &mut self.body.free
    }

    /// # Safety
    /// The block must be allocated.
    #[inline(always)]
    pub unsafe fn alloc_info(&self) -> &AllocInfo {
        debug_assert!(self.is_allocated());
        &self.body.alloc
    }

    /// Stamps the guard words with the pattern of the given state.
    #[cfg(feature = "guard")]
    #[inline]
    pub fn set_guard(&mut self, allocated: bool) {
        let value = guard_value(allocated);
        self.preguard = [value; GUARD_WORDS];
        self.postguard = [value; GUARD_WORDS];
    }

    #[cfg(not(feature = "guard"))]
    #[inline(always)]
    pub fn set_guard(&mut self, _allocated: bool) {}

    /// Returns whether the guard words carry the pattern of the given state.
    #[cfg(feature = "guard")]
    #[inline]
    pub fn guard_matches(&self, allocated: bool) -> bool {
        let value = guard_value(allocated);
        self.preguard.iter().all(|&w| w == value) && self.postguard.iter().all(|&w| w == value)
    }

    #[cfg(not(feature = "guard"))]
    #[inline(always)]
    pub fn guard_matches(&self, _allocated: bool) -> bool {
        true
    }

    /// Fatal error unless the guard words carry the pattern of the given state.
    #[inline]
    pub fn check_guard(&self, allocated: bool) {
        if !self.guard_matches(allocated) {
            crate::util::fatal!(
                "Guard words of block {:?} (size {}) are corrupt, expected {} pattern.",
                self as *const Header,
                self.size,
                if allocated { "allocated" } else { "free" }
            );
        }
    }

    /// Overwrites one word of the preceding guard. Used to simulate corruption.
    #[cfg(all(test, feature = "guard"))]
    pub fn stomp_guard(&mut self, value: u32) {
        self.preguard[0] = value;
    }

    /// Overwrites the state tag. Used to simulate corruption.
    #[cfg(test)]
    pub fn stomp_flags(&mut self, value: u32) {
        self.flags = value;
    }
}

#[cfg(feature = "guard")]
#[inline(always)]
fn guard_value(allocated: bool) -> u32 {
    match allocated {
        true => ALLOCATED_GUARD,
        false => FREE_GUARD,
    }
}
