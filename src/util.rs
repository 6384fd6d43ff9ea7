//! Utility functions.

use core::fmt;

use tracing::error;

/// Aborts the process after logging `args`.
///
/// Every unrecoverable heap condition (corruption, double free, page exhaustion)
/// ends up here. Under `cfg(test)` this panics instead so the condition can be
/// observed with `#[should_panic]`.
#[cold]
#[inline(never)]
pub(crate) fn fatal_error(args: fmt::Arguments<'_>) -> ! {
    error!("{}", args);
    #[cfg(test)]
    panic!("heap fatal: {}", args);
    #[cfg(not(test))]
    std::process::abort()
}

/// `format!`-style front end for [`fatal_error`].
macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::util::fatal_error(format_args!($($arg)*))
    };
}
pub(crate) use fatal;

/// Stops in the debugger (raises `SIGTRAP` on unix).
#[cold]
#[inline(never)]
pub(crate) fn debug_break(alloc_num: u32) {
    error!(alloc_num, "Break allocation reached.");
    #[cfg(test)]
    panic!("debug break at allocation {alloc_num}");
    #[cfg(all(not(test), unix))]
    unsafe {
        libc::raise(libc::SIGTRAP);
    }
    #[cfg(all(not(test), not(unix)))]
    std::process::abort()
}

/// Returns the smallest multiple of `align` that is greater or equal to `x`
/// or `None` if it does not fit in a `usize`.
///
/// # Panics
/// Panics if `align` is not a power of two (debug builds only).
#[inline]
pub(crate) fn round_up(x: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    Some(x.checked_add(align - 1)? & !(align - 1))
}

/// Returns the smallest (in address) `align`-aligned pointer
/// with an address greater or equal to that of `ptr`
/// or `None` if no such pointer exists.
///
/// # Panics
/// Panics if `align` is not a power-of-two.
#[inline]
pub(crate) fn find_aligned(ptr: *const u8, align: usize) -> Option<*const u8> {
    let offset = ptr.align_offset(align);
    debug_assert_ne!(
        offset,
        usize::MAX,
        "align_offset() on a *const u8 should never fail."
    );
    if usize::MAX - offset < ptr as usize {
        return None;
    }
    Some(ptr.wrapping_add(offset))
}
