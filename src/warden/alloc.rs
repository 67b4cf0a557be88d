//! Heap accounting for the memory budget.
//!
//! Register the allocator in the binary that hosts plugins:
//!
//! ```ignore
//! #[global_allocator]
//! static ALLOC: plugbox::warden::WardenAllocator = plugbox::warden::WardenAllocator;
//! ```
use super::{Warden, WardenStatus};
use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

static ALLOCATED: AtomicU64 = AtomicU64::new(0);
static PEAK: AtomicU64 = AtomicU64::new(0);
static ACTIVE: AtomicBool = AtomicBool::new(false);

/// System allocator wrapper feeding the Warden's memory accounting.
pub struct WardenAllocator;

/// Bytes currently allocated through [`WardenAllocator`].
pub fn allocated() -> u64 {
    ALLOCATED.load(Ordering::Relaxed)
}

/// Highest value [`allocated`] ever reached, including a refused request.
pub fn peak() -> u64 {
    PEAK.load(Ordering::Relaxed)
}

pub(crate) fn allocator_active() -> bool {
    ACTIVE.load(Ordering::Relaxed)
}

#[inline]
fn account(size: usize) {
    if !ACTIVE.load(Ordering::Relaxed) {
        ACTIVE.store(true, Ordering::Relaxed);
    }
    let size = size as u64;
    let now = ALLOCATED.fetch_add(size, Ordering::Relaxed) + size;
    PEAK.fetch_max(now, Ordering::Relaxed);

    if let Some(warden) = Warden::get() {
        if warden.over_budget(now) {
            warden.trip(WardenStatus::MemoryLimitReached, "malloc");
        }
    }
}

#[inline]
fn release(size: usize) {
    ALLOCATED.fetch_sub(size as u64, Ordering::Relaxed);
}

unsafe impl GlobalAlloc for WardenAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        account(layout.size());
        let ptr = System.alloc(layout);
        if ptr.is_null() {
            release(layout.size());
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        account(layout.size());
        let ptr = System.alloc_zeroed(layout);
        if ptr.is_null() {
            release(layout.size());
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout);
        release(layout.size());
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let old_size = layout.size();
        if new_size > old_size {
            account(new_size - old_size);
        }
        let new_ptr = System.realloc(ptr, layout, new_size);
        if new_ptr.is_null() {
            if new_size > old_size {
                release(new_size - old_size);
            }
        } else if new_size < old_size {
            release(old_size - new_size);
        }
        new_ptr
    }
}
