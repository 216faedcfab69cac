//! A non-moving, never-collecting object heap.
//!
//! Objects are bump-allocated out of zeroed chunks. Nothing is freed
//! before the heap is dropped, so raw object addresses are stable and can
//! be held by generated code, frames and handles.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::klass::Klass;
use super::oop::{ARRAY_BASE_OFFSET, ARRAY_LENGTH_OFFSET, BasicType, HEADER_SIZE, KLASS_OFFSET, Oop};

const CHUNK_SIZE: usize = 1 << 20;

struct Chunk {
    base: *mut u8,
    size: usize,
    top: usize,
}

impl Chunk {
    fn new(size: usize) -> Option<Chunk> {
        let layout = Layout::from_size_align(size, 16).ok()?;
        // SAFETY: the layout has non-zero size.
        let base = unsafe { alloc_zeroed(layout) };
        if base.is_null() {
            return None;
        }
        Some(Chunk { base, size, top: 0 })
    }

    fn allocate(&mut self, bytes: usize) -> Option<usize> {
        if self.top + bytes > self.size {
            return None;
        }
        let addr = self.base as usize + self.top;
        self.top += bytes;
        Some(addr)
    }

    fn contains(&self, addr: usize) -> bool {
        addr >= self.base as usize && addr < self.base as usize + self.top
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        if let Ok(layout) = Layout::from_size_align(self.size, 16) {
            // SAFETY: allocated in `Chunk::new` with this layout.
            unsafe { dealloc(self.base, layout) }
        }
    }
}

// SAFETY: chunk memory is only handed out under the heap lock.
unsafe impl Send for Chunk {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub objects: usize,
    pub bytes: usize,
    pub chunks: usize,
}

pub struct Heap {
    chunks: Mutex<Vec<Chunk>>,
    objects: AtomicUsize,
    bytes: AtomicUsize,
    next_hash: AtomicU64,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Self {
            chunks: Mutex::new(Vec::new()),
            objects: AtomicUsize::new(0),
            bytes: AtomicUsize::new(0),
            next_hash: AtomicU64::new(0x2545_f491),
        }
    }

    /// Allocate `bytes` of zeroed, 8-byte aligned storage.
    fn allocate_raw(&self, bytes: usize) -> Option<usize> {
        let bytes = (bytes + 7) & !7;
        let mut chunks = self.chunks.lock();
        if let Some(addr) = chunks.last_mut().and_then(|c| c.allocate(bytes)) {
            return Some(addr);
        }
        let mut chunk = Chunk::new(bytes.max(CHUNK_SIZE))?;
        let addr = chunk.allocate(bytes)?;
        log::trace!("heap: new chunk of {} bytes", chunk.size);
        chunks.push(chunk);
        Some(addr)
    }

    fn install(&self, addr: usize, klass: &Klass, bytes: usize) -> Oop {
        let obj = Oop::from_raw(addr);
        obj.put_u64(KLASS_OFFSET, klass as *const Klass as u64);
        self.objects.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        obj
    }

    /// A zeroed instance with `field_slots` 8-byte fields.
    pub fn allocate_instance(&self, klass: &Klass, field_slots: usize) -> Option<Oop> {
        let bytes = HEADER_SIZE + field_slots * 8;
        let addr = self.allocate_raw(bytes)?;
        Some(self.install(addr, klass, bytes))
    }

    /// A zeroed array of `length` elements of `elem` type.
    pub fn allocate_array(&self, klass: &Klass, elem: BasicType, length: usize) -> Option<Oop> {
        let bytes = ARRAY_BASE_OFFSET as usize + length.checked_mul(elem.element_size())?;
        let addr = self.allocate_raw(bytes)?;
        let obj = self.install(addr, klass, bytes);
        obj.put_u64(ARRAY_LENGTH_OFFSET, length as u64);
        Some(obj)
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.chunks.lock().iter().any(|c| c.contains(addr))
    }

    /// Identity hash, assigned on first request and kept in the mark word.
    pub fn identity_hash(&self, obj: Oop) -> i32 {
        let mark = obj.mark();
        let current = mark.load(Ordering::Relaxed);
        if current != 0 {
            return current as i32;
        }
        // xorshift keeps hashes well spread without a lock
        let mut h = self.next_hash.load(Ordering::Relaxed);
        h ^= h << 13;
        h ^= h >> 7;
        h ^= h << 17;
        self.next_hash.store(h, Ordering::Relaxed);
        let hash = (h & 0x7fff_ffff).max(1);
        match mark.compare_exchange(0, hash, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => hash as i32,
            Err(existing) => existing as i32,
        }
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            objects: self.objects.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            chunks: self.chunks.lock().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::klass::Klass;

    #[test]
    fn test_allocation_is_zeroed_and_aligned() {
        let heap = Heap::new();
        let klass = Klass::new_for_test("T");
        let a = heap.allocate_instance(&klass, 3).unwrap();
        let b = heap.allocate_instance(&klass, 1).unwrap();
        assert_eq!(a.raw() % 8, 0);
        assert_eq!(b.raw(), a.raw() + HEADER_SIZE + 24);
        assert_eq!(a.field(2), 0);
        assert!(std::ptr::eq(a.klass(), &klass));
        assert!(heap.contains(b.raw()));
        assert_eq!(heap.stats().objects, 2);
    }

    #[test]
    fn test_large_arrays_get_their_own_chunk() {
        let heap = Heap::new();
        let klass = Klass::new_for_test("[J");
        let arr = heap
            .allocate_array(&klass, BasicType::Long, CHUNK_SIZE / 4)
            .unwrap();
        assert_eq!(arr.array_length(), CHUNK_SIZE / 4);
        assert_eq!(heap.stats().chunks, 1);
        heap.allocate_instance(&klass, 1).unwrap();
        assert_eq!(heap.stats().chunks, 2);
    }

    #[test]
    fn test_identity_hash_is_stable() {
        let heap = Heap::new();
        let klass = Klass::new_for_test("T");
        let obj = heap.allocate_instance(&klass, 0).unwrap();
        let h = heap.identity_hash(obj);
        assert_ne!(h, 0);
        assert_eq!(heap.identity_hash(obj), h);
    }
}
