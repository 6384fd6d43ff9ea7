use std::fs::{self, File};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

use self::format::{HeapEventFormatter, SpanArgsLayer};
use super::*;
use crate::page::counting_source::CountingSource;
use crate::page::SystemSource;


const PAGE: usize = 64 * 1024;

fn heap() -> RawHeap<SystemSource> {
    RawHeap::with_source(SystemSource, PAGE)
}

#[track_caller]
fn alloc<S: PageSource>(heap: &mut RawHeap<S>, size: usize) -> *mut u8 {
    heap.allocate(size, AllocKind::Single, Some(Location::caller()))
        .as_ptr()
}

unsafe fn free<S: PageSource>(heap: &mut RawHeap<S>, ptr: *mut u8) {
    heap.release(ptr, AllocKind::Single)
}

fn block_of(ptr: *mut u8) -> &'static Header {
    unsafe { &*Header::from_payload(ptr) }
}

fn temp_path(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("treeheap-{name}-{}.txt", std::process::id()))
}

#[test]
fn test_round_trip() {
    let mut heap = heap();
    let sizes = [1, 15, 16, 17, 100, 1000, 5000, 70_000];
    let objects: Vec<_> = sizes
        .iter()
        .enumerate()
        .map(|(i, &size)| {
            let ptr = alloc(&mut heap, size);
            assert_eq!(ptr as usize % PAYLOAD_ALIGN, 0);
            assert!(block_of(ptr).size >= size);
            unsafe { ptr.write_bytes(i as u8, size) };
            (ptr, size, i as u8)
        })
        .collect();
    heap.validate();

    for &(ptr, size, fill) in objects.iter().rev() {
        unsafe {
            assert!((0..size).all(|k| *ptr.add(k) == fill));
            free(&mut heap, ptr);
        }
        heap.validate();
    }
    assert_eq!(heap.memory_used(), 0);
}

#[test]
fn test_zero_size_request() {
    let mut heap = heap();
    let p = alloc(&mut heap, 0);
    let q = alloc(&mut heap, 0);
    assert_ne!(p, q);
    assert_eq!(block_of(p).size, 16);
    unsafe { free(&mut heap, core::ptr::null_mut()) };
    heap.validate();
}

#[test]
fn test_no_overlap() {
    let mut rng = StdRng::seed_from_u64(7);
    let mut heap = heap();
    let mut live = vec![];
    for _ in 0..2000 {
        if live.is_empty() || rng.gen_bool(0.6) {
            live.push(alloc(&mut heap, rng.gen_range(1..3000)));
        } else {
            let i = rng.gen_range(0..live.len());
            unsafe { free(&mut heap, live.swap_remove(i)) };
        }
    }

    let mut ranges: Vec<_> = live
        .iter()
        .map(|&ptr| {
            let start = ptr as usize - HEADER_SIZE;
            (start, ptr as usize + block_of(ptr).size)
        })
        .collect();
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        assert!(pair[0].1 <= pair[1].0, "{:x?} overlaps {:x?}", pair[0], pair[1]);
    }
    heap.validate();
}

#[test]
fn test_coalescing() {
    let mut heap = heap();
    let a = alloc(&mut heap, 64);
    let b = alloc(&mut heap, 64);
    let c = alloc(&mut heap, 64);
    let d = alloc(&mut heap, 64);
    unsafe {
        free(&mut heap, a);
        free(&mut heap, c);
        assert_eq!(heap.free_block_report().free_blocks, 3);

        free(&mut heap, b);
        let merged = block_of(a);
        assert!(merged.is_free());
        assert_eq!(merged.size, 3 * 64 + 2 * HEADER_SIZE);
        assert_eq!(merged.next, Header::from_payload(d));
        assert_eq!(heap.free_block_report().free_blocks, 2);
        heap.validate();

        let pages = heap.page_count();
        assert_eq!(alloc(&mut heap, 3 * 64 + 2 * HEADER_SIZE), a);
        assert_eq!(heap.page_count(), pages);
        free(&mut heap, a);

        free(&mut heap, d);
    }
    let report = heap.free_block_report();
    assert_eq!(report.free_blocks, 1);
    assert_eq!(report.free_bytes, PAGE - HEADER_SIZE);
    assert_eq!(heap.memory_used(), 0);
    heap.validate();
}

#[test]
fn test_best_fit() {
    let mut heap = heap();
    let a = alloc(&mut heap, 64);
    alloc(&mut heap, 16);
    let b = alloc(&mut heap, 128);
    alloc(&mut heap, 16);
    let c = alloc(&mut heap, 256);
    alloc(&mut heap, 16);
    unsafe {
        free(&mut heap, a);
        free(&mut heap, b);
        free(&mut heap, c);
    }

    assert_eq!(alloc(&mut heap, 100), b);
    assert_eq!(alloc(&mut heap, 200), c);
    assert_eq!(alloc(&mut heap, 50), a);
    heap.validate();
}

#[test]
fn test_best_fit_random() {
    let mut rng = StdRng::seed_from_u64(11);
    let mut heap = heap();
    let mut live = vec![];
    for _ in 0..500 {
        live.push(alloc(&mut heap, rng.gen_range(1..1500)));
    }
    for _ in 0..200 {
        let i = rng.gen_range(0..live.len());
        unsafe { free(&mut heap, live.swap_remove(i)) };
    }

    for _ in 0..100 {
        let request = rng.gen_range(1..1500);
        let rounded = util::augment_size(request).unwrap();
        let best = heap
            .blocks()
            .filter(|&block| unsafe { (*block).is_free() && (*block).size >= rounded })
            .map(|block| unsafe { (*block).size })
            .min();

        let ptr = alloc(&mut heap, request);
        if let Some(best) = best {
            let size = block_of(ptr).size;
            assert!(size == rounded || size == best, "got {size}, best fit was {best}");
        }
        live.push(ptr);
    }
    heap.validate();
}

#[test]
fn test_same_size_is_fifo() {
    let mut heap = heap();
    let holes: Vec<_> = (0..3)
        .map(|_| {
            let hole = alloc(&mut heap, 64);
            alloc(&mut heap, 16);
            hole
        })
        .collect();
    for &hole in &holes {
        unsafe { free(&mut heap, hole) };
    }

    for &hole in &holes {
        assert_eq!(alloc(&mut heap, 64), hole);
    }
    heap.validate();
}

#[cfg(feature = "guard")]
#[test]
#[should_panic(expected = "corrupt")]
fn test_overrun_is_detected() {
    let mut heap = heap();
    let a = alloc(&mut heap, 32);
    let b = alloc(&mut heap, 32);
    unsafe {
        // First byte past `a` is the guard of `b`.
        a.add(32).write(0);
        free(&mut heap, b);
    }
}

#[cfg(feature = "guard")]
#[test]
#[should_panic(expected = "corrupt")]
fn test_validate_detects_freed_guard_overwrite() {
    let mut heap = heap();
    let a = alloc(&mut heap, 64);
    alloc(&mut heap, 64);
    unsafe {
        free(&mut heap, a);
        (*Header::from_payload(a)).stomp_guard(0);
    }
    heap.validate();
}

#[test]
#[should_panic(expected = "corrupt flags")]
fn test_validate_detects_bad_flags() {
    let mut heap = heap();
    let a = alloc(&mut heap, 32);
    alloc(&mut heap, 32);
    unsafe { (*Header::from_payload(a)).stomp_flags(0xDEAD) };
    heap.validate();
}

#[test]
#[should_panic(expected = "Not an allocated block")]
fn test_double_free_is_detected() {
    let mut heap = heap();
    let a = alloc(&mut heap, 64);
    alloc(&mut heap, 64);
    unsafe {
        free(&mut heap, a);
        free(&mut heap, a);
    }
}

#[test]
#[should_panic(expected = "Array alloc mismatch")]
fn test_array_mismatch_is_detected() {
    let mut heap = heap();
    let p = heap.allocate(64, AllocKind::Array, None).as_ptr();
    unsafe { free(&mut heap, p) };
}

#[test]
fn test_array_round_trip() {
    let mut heap = heap();
    let p = heap.allocate(32, AllocKind::Array, None).as_ptr();
    alloc(&mut heap, 16);
    unsafe {
        let q = heap.reallocate(p, 5000, None);
        assert_ne!(p, q);
        assert_eq!(
            block_of(q).state(),
            BlockState::Allocated {
                kind: AllocKind::Array,
                flagged: false
            }
        );
        heap.release(q, AllocKind::Array);
    }
    heap.validate();
}

#[test]
#[should_panic(expected = "debug break at allocation 2")]
fn test_break_alloc() {
    let mut heap = heap();
    heap.set_break_alloc(2);
    alloc(&mut heap, 16);
    alloc(&mut heap, 16);
    alloc(&mut heap, 16);
}

#[test]
fn test_reallocate_paths() {
    let mut heap = heap();
    let a = alloc(&mut heap, 512);
    let b = alloc(&mut heap, 512);
    alloc(&mut heap, 64);
    unsafe {
        for k in 0..64 {
            *a.add(k) = k as u8;
        }

        assert_eq!(heap.reallocate(a, 500, None), a);
        assert_eq!(block_of(a).size, 512);

        // Shrink splits off a free tail.
        assert_eq!(heap.reallocate(a, 256, None), a);
        assert_eq!(block_of(a).size, 256);
        assert!((*block_of(a).next).is_free());
        heap.validate();

        // Grow into the free tail.
        assert_eq!(heap.reallocate(a, 400, None), a);
        assert_eq!(block_of(a).size, 400);
        heap.validate();

        // No room next to it, the allocation moves.
        let moved = heap.reallocate(a, 2000, None);
        assert_ne!(moved, a);
        assert_eq!(block_of(moved).size, 2000);
        assert!((0..64).all(|k| *moved.add(k) == k as u8));
        assert!(block_of(a).is_free());
        assert_eq!(block_of(a).size, 512);
        heap.validate();

        assert!(heap.reallocate(moved, 0, None).is_null());
        assert_eq!(heap.memory_used(), 512 + 64);

        let fresh = heap.reallocate(core::ptr::null_mut(), 10, None);
        assert!(!fresh.is_null());
        assert_eq!(block_of(fresh).size, 16);

        free(&mut heap, b);
    }
    heap.validate();
}

#[test]
fn test_random_operations() {
    let mut rng = StdRng::seed_from_u64(42);
    let mut heap = heap();
    let mut live: Vec<(*mut u8, usize, u8)> = vec![];

    for step in 0..5000 {
        match rng.gen_range(0..10) {
            0..=4 => {
                let size = rng.gen_range(1..4000);
                let fill = rng.gen();
                let ptr = alloc(&mut heap, size);
                unsafe {
                    *ptr = fill;
                    *ptr.add(size - 1) = fill;
                }
                live.push((ptr, size, fill));
            }
            5..=7 if !live.is_empty() => {
                let (ptr, size, fill) = live.swap_remove(rng.gen_range(0..live.len()));
                unsafe {
                    assert_eq!(*ptr, fill);
                    assert_eq!(*ptr.add(size - 1), fill);
                    free(&mut heap, ptr);
                }
            }
            _ if !live.is_empty() => {
                let i = rng.gen_range(0..live.len());
                let (ptr, _, fill) = live[i];
                let size = rng.gen_range(1..6000);
                let ptr = unsafe { heap.reallocate(ptr, size, None) };
                unsafe {
                    assert_eq!(*ptr, fill);
                    *ptr.add(size - 1) = fill;
                }
                live[i] = (ptr, size, fill);
            }
            _ => {}
        }

        if step % 250 == 0 {
            heap.validate();
            let used: usize = live.iter().map(|&(ptr, ..)| block_of(ptr).size).sum();
            assert_eq!(heap.memory_used(), used);
            #[cfg(feature = "guard")]
            assert_eq!(heap.bytes_allocated(), used);
        }
    }

    for (ptr, ..) in live {
        unsafe { free(&mut heap, ptr) };
    }
    heap.validate();
    assert_eq!(heap.memory_used(), 0);
    assert_eq!(heap.free_block_report().free_blocks, heap.pages.data_pages().count());
}

#[cfg(feature = "guard")]
#[test]
fn test_fill_patterns() {
    let mut heap = heap();
    alloc(&mut heap, 64);
    let b = alloc(&mut heap, 64);
    alloc(&mut heap, 64);
    unsafe {
        assert!((0..64).all(|k| *b.add(k) == ALLOC_FILL));
        free(&mut heap, b);
        assert!((0..64).all(|k| *b.add(k) == FREE_FILL));
    }
}

#[cfg(feature = "guard")]
#[test]
fn test_leak_snapshot() {
    let mut heap = heap();
    let a = alloc(&mut heap, 40);
    let b = alloc(&mut heap, 40);
    assert_eq!(heap.flag_current_allocs(), 2);

    let line = line!() + 2;
    let c = alloc(&mut heap, 100);
    alloc(&mut heap, 200);
    unsafe {
        free(&mut heap, a);
        free(&mut heap, c);
    }

    let mut out = Vec::new();
    assert_eq!(heap.dump_unflagged_allocs(Some(&mut out)).unwrap(), 1);
    assert_eq!(
        String::from_utf8(out).unwrap(),
        format!("{}   {}   208   3\n", file!(), line)
    );
    assert_eq!(heap.dump_unflagged_allocs(None).unwrap(), 1);

    let mut snapshot = Vec::new();
    assert_eq!(heap.dump_mem_snapshot(&mut snapshot).unwrap(), 2);
    let snapshot = String::from_utf8(snapshot).unwrap();
    let lines: Vec<_> = snapshot.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].ends_with("\t48\t1"));
    assert_eq!(lines[1], format!("{}\t{}\t208\t3", file!(), line));
    assert_eq!(block_of(b).size, 48);
}

#[cfg(feature = "guard")]
#[test]
fn test_allocation_log() {
    let path = temp_path("log");
    let mut heap = heap();
    heap.enable_logging(File::create(&path).unwrap()).unwrap();

    let line = line!() + 1;
    let p = alloc(&mut heap, 24);
    unsafe {
        let p = heap.reallocate(p, 8, None);
        free(&mut heap, p);
    }
    drop(heap.disable_logging());
    alloc(&mut heap, 24);

    let text = fs::read_to_string(&path).unwrap();
    fs::remove_file(&path).unwrap();
    let expected = [
        crate::diagnostics::LOG_BANNER.to_string(),
        format!("alloc: {} {line} 32 0", file!()),
        format!("realloc: {} {line} 16 0", file!()),
        format!("free: {} {line} 16 0", file!()),
    ];
    assert_eq!(text.lines().collect::<Vec<_>>(), expected);
}

#[test]
fn test_page_source_failure_releases_everything() {
    let mut source = CountingSource::with_limit(2);
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let mut heap = RawHeap::with_source(&mut source, PAGE);
        alloc(&mut heap, 100);
        alloc(&mut heap, 2 * PAGE);
    }));

    let message = result.unwrap_err().downcast::<String>().unwrap();
    assert!(message.contains("Error allocating memory"), "{message}");
    assert_eq!(source.maps, 2);
    assert_eq!(source.live, 0);
}

#[test]
fn test_teardown_returns_pages() {
    let mut source = CountingSource::default();
    {
        let mut heap = RawHeap::with_source(&mut source, PAGE);
        for _ in 0..10 {
            alloc(&mut heap, PAGE);
        }
        // Ten data pages and one page of tree nodes.
        assert_eq!(heap.page_count(), 11);
        heap.validate();
    }
    assert_eq!(source.maps, 11);
    assert_eq!(source.live, 0);
}

#[test]
fn test_large_allocation_gets_own_page() {
    let mut heap = heap();
    alloc(&mut heap, 100);
    let big = alloc(&mut heap, 200_000);
    assert_eq!(block_of(big).size, 200_000);
    assert_eq!(heap.memory_used(), 112 + 200_000);
    heap.validate();
}

#[test]
fn test_min_page_size() {
    let mut heap = heap();
    heap.set_min_page_size(4 << 20);
    alloc(&mut heap, 16);
    assert!(heap.mapped_bytes() > 4 << 20);
}

#[derive(Clone, Default)]
struct Capture(Arc<Mutex<Vec<u8>>>);

impl io::Write for Capture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_traced_session() {
    let capture = Capture::default();
    let writer = capture.clone();
    let subscriber = Registry::default()
        .with(EnvFilter::new("treeheap=debug"))
        .with(SpanArgsLayer::default())
        .with(
            tracing_subscriber::fmt::layer()
                .event_format(HeapEventFormatter)
                .with_writer(move || writer.clone()),
        );

    tracing::subscriber::with_default(subscriber, || {
        let mut heap = heap();
        let p = alloc(&mut heap, 100);
        unsafe { free(&mut heap, p) };
    });

    let text = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
    assert!(text.contains("Mapped a new page."), "{text}");
    assert!(text.contains("Allocated block."), "{text}");
    assert!(text.contains("size=100"), "{text}");
    assert!(text.contains("Released block."), "{text}");
}
