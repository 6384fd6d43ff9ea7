//! Heap validation, leak tracking, the allocation log and free block statistics.
//!
//! Leak tracking works in two steps: [`RawHeap::flag_current_allocs`] marks every live
//! allocation, and [`RawHeap::dump_unflagged_allocs`] later reports the allocations made
//! since then that are still alive.

use core::fmt;
use core::ptr::null_mut;
use std::fs::File;
use std::io::{self, Write};

use tracing::debug;
#[cfg(feature = "guard")]
use tracing::{error, info};

use crate::allocators::RawHeap;
use crate::block;
use crate::header::{BlockState, Header};
use crate::page::{PageRecord, PageSource};
use crate::util::fatal;

/// Number of size classes in a [`FreeBlockReport`].
pub const REPORT_CLASSES: usize = 20;
/// Upper bound of the smallest size class, each following class doubles it.
pub const SMALLEST_CLASS: usize = 16;

/// First line of every allocation log.
pub const LOG_BANNER: &str = " --- INIT MEMORY LOG (ACTION): (FILE) (LINE) (SIZE) (ALLOCNUMBER) ---";
/// File name reported for allocations without a known call-site.
pub const UNKNOWN_FILE: &str = "Undetermined";

/// Free blocks whose size is at most `max_size` and above the previous class.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SizeClass {
    pub max_size: usize,
    pub blocks: usize,
    pub bytes: usize,
    /// Shallowest and deepest tree node holding blocks of this class, the root has depth 1.
    pub min_depth: u32,
    pub max_depth: u32,
    depth_sum: u64,
    nodes: u32,
}

impl SizeClass {
    /// Average depth of the tree nodes holding blocks of this class.
    pub fn average_depth(&self) -> f64 {
        match self.nodes {
            0 => 0.0,
            nodes => self.depth_sum as f64 / nodes as f64,
        }
    }

    fn record(&mut self, size: usize, blocks: usize, depth: u32) {
        if self.nodes == 0 || depth < self.min_depth {
            self.min_depth = depth;
        }
        self.max_depth = self.max_depth.max(depth);
        self.depth_sum += u64::from(depth);
        self.nodes += 1;
        self.blocks += blocks;
        self.bytes += size * blocks;
    }
}

/// Histogram of the free blocks by size, along with their position in the size index.
#[derive(Clone, Debug, PartialEq)]
pub struct FreeBlockReport {
    pub classes: [SizeClass; REPORT_CLASSES],
    pub free_blocks: usize,
    pub free_bytes: usize,
    pub tree_nodes: usize,
}

impl FreeBlockReport {
    fn new() -> Self {
        let mut classes = [SizeClass::default(); REPORT_CLASSES];
        for (i, class) in classes.iter_mut().enumerate() {
            class.max_size = SMALLEST_CLASS << i;
        }
        classes[REPORT_CLASSES - 1].max_size = usize::MAX;
        FreeBlockReport {
            classes,
            free_blocks: 0,
            free_bytes: 0,
            tree_nodes: 0,
        }
    }

    fn class_of(&mut self, size: usize) -> &mut SizeClass {
        let i = self
            .classes
            .iter()
            .position(|class| size <= class.max_size)
            .unwrap_or(REPORT_CLASSES - 1);
        &mut self.classes[i]
    }
}

impl fmt::Display for FreeBlockReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Free blocks by size:")?;
        for class in self.classes.iter().filter(|class| class.blocks > 0) {
            match class.max_size {
                usize::MAX => write!(f, "  larger: ")?,
                max => write!(f, "  <= {max}: ")?,
            }
            writeln!(
                f,
                "{} blocks, {} bytes, depth {}/{}/{:.2}",
                class.blocks,
                class.bytes,
                class.min_depth,
                class.max_depth,
                class.average_depth()
            )?;
        }
        write!(
            f,
            "Total: {} blocks, {} bytes in {} sizes.",
            self.free_blocks, self.free_bytes, self.tree_nodes
        )
    }
}

/// One allocated block as it appears in leak dumps and memory snapshots.
#[cfg(feature = "guard")]
#[derive(Copy, Clone, Debug)]
struct AllocRecord {
    file: &'static str,
    line: u32,
    size: usize,
    alloc_num: u32,
    flagged: bool,
}

#[cfg(feature = "guard")]
impl AllocRecord {
    /// # Safety
    /// `block` must be an allocated block.
    unsafe fn of(block: *mut Header) -> AllocRecord {
        let info = (*block).alloc_info();
        let (file, line) = info
            .site
            .map_or((UNKNOWN_FILE, 0), |site| (site.file(), site.line()));
        AllocRecord {
            file,
            line,
            size: (*block).size,
            alloc_num: info.alloc_num,
            flagged: matches!((*block).state(), BlockState::Allocated { flagged: true, .. }),
        }
    }
}

impl<S: PageSource> RawHeap<S> {
    /// Checks the structure of the whole heap, fatal on the first inconsistency.
    ///
    /// Every data page must be tiled by its block chain with consistent back links,
    /// guard words must match block states, no two free blocks may be adjacent and
    /// every free block must be queued in the size index under its own size.
    /// The size index itself must be a valid red-black tree.
    pub fn validate(&self) {
        let queued = self.index.validate();
        let mut free_blocks = 0;

        for page in self.pages.pages() {
            let page = page.as_ptr();
            unsafe {
                let first = (*page).header_list;
                if first.is_null() {
                    continue;
                }

                let mut prev = null_mut();
                for block in block::blocks(first) {
                    validate_block(block, prev);
                    free_blocks += usize::from((*block).is_free());
                    prev = block;
                }

                let page_end = PageRecord::base(page).add((*page).usable_size());
                if (*prev).end() != page_end.cast_const() {
                    fatal!(
                        "Block chain of page {page:?} ends at {:?}, not at {page_end:?}.",
                        (*prev).end()
                    );
                }
            }
        }

        if free_blocks != queued {
            fatal!("{free_blocks} free blocks in the pages but {queued} in the size index.");
        }
        debug!(free_blocks, pages = self.pages.page_count(), "Heap is valid.");
    }

    /// Makes the next allocation with sequence number `alloc_num` break into the debugger.
    pub fn set_break_alloc(&mut self, alloc_num: u32) {
        self.break_alloc = Some(alloc_num);
    }

    /// Starts logging every allocation, reallocation and release to `log`.
    /// Records are only written in `guard` builds, which track call-sites.
    pub fn enable_logging(&mut self, mut log: File) -> io::Result<()> {
        writeln!(log, "{LOG_BANNER}")?;
        self.log = Some(log);
        Ok(())
    }

    /// Stops logging and hands back the log file so it can be closed outside the heap.
    pub fn disable_logging(&mut self) -> Option<File> {
        self.log.take()
    }

    /// Appends a record for `block` to the allocation log, if any.
    ///
    /// # Safety
    /// `block` must be an allocated block.
    #[cfg(feature = "guard")]
    pub(crate) unsafe fn log_record(&mut self, action: &str, block: *mut Header) {
        let Some(log) = self.log.as_mut() else {
            return;
        };
        let record = AllocRecord::of(block);
        let written = writeln!(
            log,
            "{action}: {} {} {} {}",
            record.file, record.line, record.size, record.alloc_num
        );
        if let Err(err) = written {
            error!(kind = ?err.kind(), "Allocation log write failed, logging disabled.");
            self.log = None;
        }
    }

    #[cfg(not(feature = "guard"))]
    #[inline(always)]
    pub(crate) unsafe fn log_record(&mut self, _action: &str, _block: *mut Header) {}

    /// Marks every live allocation so that [`dump_unflagged_allocs`](RawHeap::dump_unflagged_allocs)
    /// only reports allocations made afterwards. Returns the number of flagged blocks.
    #[cfg(feature = "guard")]
    pub fn flag_current_allocs(&mut self) -> usize {
        let mut flagged = 0;
        for block in self.blocks() {
            unsafe {
                if (*block).is_allocated() {
                    (*block).set_flagged();
                    flagged += 1;
                }
            }
        }
        info!(flagged, "Flagged current allocations.");
        flagged
    }

    /// Writes `"<file>   <line>   <size>   <sequence>"` for every live allocation that was
    /// not flagged by [`flag_current_allocs`](RawHeap::flag_current_allocs), or logs the
    /// records as errors when there is no sink. Returns the number of records.
    #[cfg(feature = "guard")]
    pub fn dump_unflagged_allocs(&self, mut sink: Option<&mut dyn Write>) -> io::Result<usize> {
        let mut count = 0;
        for record in self.alloc_records().filter(|record| !record.flagged) {
            match sink.as_mut() {
                Some(sink) => writeln!(
                    sink,
                    "{}   {}   {}   {}",
                    record.file, record.line, record.size, record.alloc_num
                )?,
                None => error!(
                    file = record.file,
                    line = record.line,
                    size = record.size,
                    alloc_num = record.alloc_num,
                    "Unflagged allocation."
                ),
            }
            count += 1;
        }
        Ok(count)
    }

    /// Writes `"<file>\t<line>\t<size>\t<sequence>"` for every live allocation.
    /// Returns the number of records.
    #[cfg(feature = "guard")]
    pub fn dump_mem_snapshot(&self, sink: &mut dyn Write) -> io::Result<usize> {
        let mut count = 0;
        for record in self.alloc_records() {
            writeln!(
                sink,
                "{}\t{}\t{}\t{}",
                record.file, record.line, record.size, record.alloc_num
            )?;
            count += 1;
        }
        Ok(count)
    }

    #[cfg(feature = "guard")]
    fn alloc_records(&self) -> impl Iterator<Item = AllocRecord> + '_ {
        self.blocks()
            .filter(|&block| unsafe { (*block).is_allocated() })
            .map(|block| unsafe { AllocRecord::of(block) })
    }

    /// Builds a histogram of the free blocks by size class.
    pub fn free_block_report(&self) -> FreeBlockReport {
        let mut report = FreeBlockReport::new();
        self.index.for_each_node(|node, depth| {
            let blocks = node.queue_len();
            report.class_of(node.size()).record(node.size(), blocks, depth);
            report.free_blocks += blocks;
            report.free_bytes += node.size() * blocks;
            report.tree_nodes += 1;
        });
        report
    }
}

/// Fatal unless `block` is consistent with its state and its predecessor `prev`.
unsafe fn validate_block(block: *mut Header, prev: *mut Header) {
    let header = &*block;
    if header.prev != prev {
        fatal!("Block {block:?} links back to {:?} instead of {prev:?}.", header.prev);
    }
    if !header.next.is_null() && header.next.cast_const().cast::<u8>() != header.end() {
        fatal!("Block {block:?} of size {} is followed by {:?}.", header.size, header.next);
    }

    match header.state() {
        BlockState::Free => {
            header.check_guard(false);
            if !prev.is_null() && (*prev).is_free() {
                fatal!("Free block {block:?} follows free block {prev:?}.");
            }
            let node = header.free_links().tree_node;
            if node.is_null() || (*node).size() != header.size {
                fatal!("Free block {block:?} of size {} is not in the size index.", header.size);
            }
        }
        BlockState::Allocated { .. } => header.check_guard(true),
        BlockState::Corrupt(flags) => fatal!("Block {block:?} has corrupt flags {flags:#x}."),
    }
}
