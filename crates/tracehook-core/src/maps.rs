//! Lock-free, fixed-capacity, single-writer/multi-reader maps.
//!
//! The trap handler, and the steering handler it triggers on peer
//! threads, read these maps from signal context: no allocation, no lock,
//! no resize is possible there. Every map used on that path (the
//! saved-prologue map, the trap-record map, the steering map, the
//! emulated-return-address map) is one of these, sized once at
//! `Engine::init` for the whole run and never grown. The instrumenter
//! thread is the map's only writer; this is not a general-purpose
//! concurrent map.
//!
//! Reclamation is intentionally absent: [`SignalSafeMap::remove`] writes
//! a tombstone and leaks the old value rather than freeing it, because a
//! signal can land on another thread mid-lookup at any point and there is
//! no quiescence signal cheap enough to wait for here. Patch/unpatch
//! cycles on a long-running process are bounded by how many functions
//! exist, so the leak is bounded too.

use rustc_hash::FxHasher;
use std::hash::Hasher;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

const EMPTY: usize = 0;
const TOMBSTONE: usize = usize::MAX;

/// A lock-free open-addressed table keyed by a non-null address.
pub struct SignalSafeMap<V> {
    capacity: usize,
    keys: Vec<AtomicUsize>,
    values: Vec<AtomicPtr<V>>,
}

impl<V> SignalSafeMap<V> {
    /// Builds a table with room for at least `capacity` live entries.
    /// Rounded up to a power of two and padded so load factor stays
    /// reasonable even at the requested capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = (capacity.max(1) * 2).next_power_of_two().max(16);
        let keys = (0..capacity).map(|_| AtomicUsize::new(EMPTY)).collect();
        let values = (0..capacity).map(|_| AtomicPtr::new(ptr::null_mut())).collect();
        SignalSafeMap { capacity, keys, values }
    }

    fn slot(&self, key: usize) -> usize {
        let mut hasher = FxHasher::default();
        hasher.write_usize(key);
        (hasher.finish() as usize) & (self.capacity - 1)
    }

    /// Inserts or overwrites `key`. Instrumenter-thread only. Returns
    /// `false` if the table is full (its capacity was sized too small at
    /// `init`; this is a configuration bug, not a runtime condition).
    pub fn insert(&self, key: usize, value: V) -> bool {
        debug_assert!(key != EMPTY && key != TOMBSTONE);
        let boxed = Box::into_raw(Box::new(value));
        let mut idx = self.slot(key);
        for _ in 0..self.capacity {
            let existing = self.keys[idx].load(Ordering::Acquire);
            if existing == EMPTY || existing == TOMBSTONE || existing == key {
                if existing == key {
                    let old = self.values[idx].swap(boxed, Ordering::AcqRel);
                    if !old.is_null() {
                        drop(unsafe { Box::from_raw(old) });
                    }
                } else {
                    self.values[idx].store(boxed, Ordering::Relaxed);
                    self.keys[idx].store(key, Ordering::Release);
                }
                return true;
            }
            idx = (idx + 1) & (self.capacity - 1);
        }
        drop(unsafe { Box::from_raw(boxed) });
        false
    }

    /// Looks up `key`. Safe to call from signal context: no allocation,
    /// no lock, bounded probe length.
    pub fn get(&self, key: usize) -> Option<*const V> {
        let mut idx = self.slot(key);
        for _ in 0..self.capacity {
            let existing = self.keys[idx].load(Ordering::Acquire);
            if existing == key {
                let v = self.values[idx].load(Ordering::Acquire);
                if !v.is_null() {
                    return Some(v as *const V);
                }
            } else if existing == EMPTY {
                return None;
            }
            idx = (idx + 1) & (self.capacity - 1);
        }
        None
    }

    /// Removes `key` by writing a tombstone. Instrumenter-thread only;
    /// leaks the value rather than freeing it (see module docs).
    pub fn remove(&self, key: usize) -> bool {
        let mut idx = self.slot(key);
        for _ in 0..self.capacity {
            let existing = self.keys[idx].load(Ordering::Acquire);
            if existing == key {
                self.keys[idx].store(TOMBSTONE, Ordering::Release);
                return true;
            }
            if existing == EMPTY {
                return false;
            }
            idx = (idx + 1) & (self.capacity - 1);
        }
        false
    }
}

impl<V> Drop for SignalSafeMap<V> {
    fn drop(&mut self) {
        for v in &self.values {
            let p = v.load(Ordering::Relaxed);
            if !p.is_null() {
                drop(unsafe { Box::from_raw(p) });
            }
        }
    }
}

// Safety: entries are heap-allocated and only ever reached through the
// atomic key/value slots; no interior mutability escapes without going
// through those atomics.
unsafe impl<V: Send> Send for SignalSafeMap<V> {}
unsafe impl<V: Send> Sync for SignalSafeMap<V> {}
