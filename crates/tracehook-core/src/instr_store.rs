//! Bump-allocated executable pages for relocated prologues and
//! trampolines, and the saved-prologue map keyed by function entry.
//!
//! Pages are requested in fixed-size chunks, written to while still `RW`, and
//! flipped to `RX` with [`InstructionStore::freeze_all`] once a patch pass
//! is done writing into them. A frozen page is never made writable again
//! — if a later pass needs more room it gets a fresh page instead.

use crate::error::ResourceError;
use crate::maps::SignalSafeMap;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

static PAGE_SIZE: Lazy<usize> = Lazy::new(|| {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 {
        sz as usize
    } else {
        4096
    }
});

/// Pages are requested from the kernel in chunks of this many pages at a
/// time.
const CHUNK_PAGES: usize = 8;

/// One bump-allocated, initially-writable, eventually-frozen code page.
struct CodePage {
    base: *mut u8,
    capacity: usize,
    used: AtomicUsize,
    frozen: AtomicBool,
}

// Safety: `base` points at a kernel-backed anonymous mapping this struct
// owns exclusively; all mutation goes through the atomics above.
unsafe impl Send for CodePage {}
unsafe impl Sync for CodePage {}

impl CodePage {
    fn new(min_bytes: usize) -> Result<Self, ResourceError> {
        let page_size = *PAGE_SIZE;
        let pages = min_bytes.div_ceil(page_size).max(CHUNK_PAGES);
        let capacity = pages * page_size;
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                capacity,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(ResourceError::Mmap(std::io::Error::last_os_error()));
        }
        Ok(CodePage { base: base as *mut u8, capacity, used: AtomicUsize::new(0), frozen: AtomicBool::new(false) })
    }

    /// Bump-allocates `len` bytes aligned to `align`, or `None` if the
    /// page doesn't have room.
    fn reserve(&self, len: usize, align: usize) -> Option<*mut u8> {
        loop {
            let current = self.used.load(Ordering::Relaxed);
            let aligned = (current + align - 1) & !(align - 1);
            let next = aligned.checked_add(len)?;
            if next > self.capacity {
                return None;
            }
            if self
                .used
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(unsafe { self.base.add(aligned) });
            }
        }
    }

    fn freeze(&self) -> Result<(), ResourceError> {
        if self.frozen.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        unsafe {
            region::protect(self.base, self.capacity, region::Protection::READ_EXECUTE)
                .map_err(|e| ResourceError::Mprotect(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;
        }
        Ok(())
    }
}

impl Drop for CodePage {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.capacity);
        }
    }
}

/// A function's saved original prologue: the bytes the patch overwrote,
/// and where the relocated copy and its trampoline now live.
#[derive(Debug, Clone)]
pub struct SavedPrologue {
    /// Address of the first byte the engine overwrote (`function_start`
    /// plus 4 if an ENDBR64 prefix precedes the call site).
    pub site_addr: usize,
    /// The bytes the engine overwrote, for restoration on unpatch or
    /// bad-symbol recovery.
    pub original_bytes: Vec<u8>,
    /// Relocated copy of the original prologue, in the instruction store.
    pub relocated_ptr: usize,
    /// Length in bytes of the relocated copy.
    pub relocated_len: usize,
    /// The trampoline this site's patch jumps to.
    pub trampoline_addr: usize,
    /// `(original_addr, relocated_addr)` for every instruction boundary
    /// in the prologue, reused on unpatch to steer any peer thread still
    /// running in the out-of-line copy back to the restored original.
    pub steering_points: Vec<(usize, usize)>,
}

/// Bump allocator over a growing set of code pages, plus the
/// saved-prologue map keyed by function entry address.
pub struct InstructionStore {
    pages: RwLock<Vec<Arc<CodePage>>>,
    saved: SignalSafeMap<SavedPrologue>,
}

impl InstructionStore {
    /// Builds a store whose saved-prologue map has room for at least
    /// `expected_patches` entries, sized once and never grown (it may be
    /// read from signal context).
    pub fn new(expected_patches: usize) -> Self {
        InstructionStore { pages: RwLock::new(Vec::new()), saved: SignalSafeMap::with_capacity(expected_patches) }
    }

    /// Reserves `len` executable-page bytes aligned to `align`,
    /// allocating a fresh page (rounded up to [`CHUNK_PAGES`]) if no
    /// existing unfrozen page has room.
    pub fn reserve(&self, len: usize, align: usize) -> Result<usize, ResourceError> {
        {
            let pages = self.pages.read();
            for page in pages.iter().rev() {
                if !page.frozen.load(Ordering::Relaxed) {
                    if let Some(ptr) = page.reserve(len, align) {
                        return Ok(ptr as usize);
                    }
                }
            }
        }
        let page = Arc::new(CodePage::new(len)?);
        let ptr = page.reserve(len, align).expect("freshly allocated page must fit the first reservation");
        self.pages.write().push(page);
        Ok(ptr as usize)
    }

    /// Flips every unfrozen page to `RX`. Call once a patch pass has
    /// finished writing relocated code and trampolines into the store.
    pub fn freeze_all(&self) -> Result<(), ResourceError> {
        for page in self.pages.read().iter() {
            page.freeze()?;
        }
        Ok(())
    }

    /// Records the saved prologue for `function_start`.
    pub fn record(&self, function_start: usize, saved: SavedPrologue) {
        self.saved.insert(function_start, saved);
    }

    /// Looks up the saved prologue for `function_start`. Safe to call
    /// from signal context.
    pub fn lookup(&self, function_start: usize) -> Option<*const SavedPrologue> {
        self.saved.get(function_start)
    }

    /// Forgets `function_start`'s saved prologue (its code-store bytes
    /// are not reclaimed; see [`crate::maps`]).
    pub fn forget(&self, function_start: usize) -> bool {
        self.saved.remove(function_start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_packs_sequential_allocations_into_one_page() {
        let store = InstructionStore::new(8);
        let a = store.reserve(32, 16).unwrap();
        let b = store.reserve(32, 16).unwrap();
        assert_eq!(store.pages.read().len(), 1);
        assert!(b > a);
    }

    #[test]
    fn reserve_past_a_page_allocates_a_new_one() {
        let store = InstructionStore::new(8);
        let page_size = *PAGE_SIZE;
        let _ = store.reserve(page_size * CHUNK_PAGES - 64, 16).unwrap();
        let _ = store.reserve(page_size, 16).unwrap();
        assert_eq!(store.pages.read().len(), 2);
    }

    #[test]
    fn record_then_lookup_roundtrips() {
        let store = InstructionStore::new(8);
        store.record(0x1000, SavedPrologue { site_addr: 0x1000, original_bytes: vec![0x90; 5], relocated_ptr: 0x2000, relocated_len: 5, trampoline_addr: 0x3000, steering_points: vec![] });
        let saved = unsafe { &*store.lookup(0x1000).unwrap() };
        assert_eq!(saved.relocated_addr_for_test(), 0x2000);
    }

    impl SavedPrologue {
        fn relocated_addr_for_test(&self) -> usize {
            self.relocated_ptr
        }
    }

    #[test]
    fn forget_removes_the_entry() {
        let store = InstructionStore::new(8);
        store.record(0x1000, SavedPrologue { site_addr: 0x1000, original_bytes: vec![], relocated_ptr: 0, relocated_len: 0, trampoline_addr: 0, steering_points: vec![] });
        assert!(store.forget(0x1000));
        assert!(store.lookup(0x1000).is_none());
    }
}
