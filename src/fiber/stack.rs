//! Fiber stack allocation.
//!
//! Each fiber owns one contiguous, `mmap`-backed region, clamped up to a
//! minimum and rounded up to a whole number of pages, exactly as the
//! original design's `Scheduler::allocateFiber` does (there via
//! `posix_memalign`-equivalent sizing; here via `mmap`, which
//! `wasmtime-internal-fiber` also reaches for, since it gives us a
//! guaranteed-page-aligned region we can protect with a guard page).

use std::io;
use std::ptr;

pub const MIN_STACK_SIZE: usize = 4096;

/// An mmap'd fiber stack. Freed on drop via `munmap`; the guard page means
/// stack overflow faults instead of silently corrupting a neighboring
/// allocation.
pub struct FiberStack {
    base: *mut u8,
    len: usize,
    usable_len: usize,
}

impl FiberStack {
    /// Allocates a stack of at least `requested` bytes (clamped to
    /// [`MIN_STACK_SIZE`] and rounded up to a whole number of pages), plus
    /// one leading guard page.
    pub fn new(requested: usize) -> io::Result<Self> {
        let requested = requested.max(MIN_STACK_SIZE);
        let page_size = page_size();
        let usable_len = round_up(requested, page_size);
        let len = usable_len + page_size; // leading guard page

        unsafe {
            let base = libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if base == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }
            if libc::mprotect(base, page_size, libc::PROT_NONE) != 0 {
                let err = io::Error::last_os_error();
                libc::munmap(base, len);
                return Err(err);
            }
            Ok(FiberStack {
                base: base.cast(),
                len,
                usable_len,
            })
        }
    }

    /// The usable (non-guard-page) region's length, rounded to a page.
    pub fn len(&self) -> usize {
        self.usable_len
    }

    /// Pointer to the start of the *usable* region (just past the guard
    /// page). The stack grows down from `usable_base() + len()`.
    pub fn usable_base(&self) -> *mut u8 {
        unsafe { self.base.add(self.len - self.usable_len) }
    }
}

impl Drop for FiberStack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.cast(), self.len);
        }
    }
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE).max(4096) as usize }
}

fn round_up(n: usize, multiple: usize) -> usize {
    (n + multiple - 1) / multiple * multiple
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_at_least_min_size() {
        let stack = FiberStack::new(1024).unwrap();
        assert!(stack.len() >= MIN_STACK_SIZE);
    }

    #[test]
    fn rounds_up_to_a_whole_number_of_pages() {
        let stack = FiberStack::new(5000).unwrap();
        assert_eq!(stack.len() % page_size(), 0);
        assert!(stack.len() >= 5000);
    }
}
