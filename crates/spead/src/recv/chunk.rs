// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Chunk: the delivery unit of the receive pipeline.
//!
//! A chunk aggregates a contiguous range of heaps into one payload buffer
//! plus a per-heap present array. Ownership is shared between the group
//! window and the member streams writing into it, with a manually managed
//! protocol refcount embedded in the chunk (rather than relying on the
//! `Arc` strong count) so the group can observe and wait on it under its
//! own mutex.
//!
//! # Write discipline
//!
//! Member streams copy payload bytes into disjoint regions of `data`: the
//! placement function assigns every heap a distinct `(heap_index, offset)`
//! and the per-member partial-heap table drops duplicate payload ranges
//! before they reach the buffer. Present flags are atomic bytes, so two
//! members completing different heaps of one chunk never conflict.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};

/// Sentinel chunk id for a slot or recycled chunk that holds no data.
pub const CHUNK_ID_NONE: i64 = -1;

/// A fixed-size aggregation of heaps, shared between the group window and
/// the member streams currently writing into it.
pub struct Chunk {
    /// Monotonically assigned id, or [`CHUNK_ID_NONE`] when recycled.
    chunk_id: AtomicI64,
    /// Member that most recently touched the chunk (diagnostics only).
    stream_id: AtomicU64,
    /// Protocol refcount: one reference held by the window while the chunk
    /// is resident, plus one per member with an in-flight heap. Mutated
    /// only under the group mutex; reaching zero implies the chunk has
    /// been evicted and may be handed to the ready callback.
    ref_count: AtomicU32,
    /// Payload buffer.
    data: UnsafeCell<Box<[u8]>>,
    data_size: usize,
    /// One flag byte per expected heap; flips 0 -> 1 when the heap is
    /// fully received, never cleared for a given occupancy.
    present: Box<[AtomicU8]>,
    /// Opaque per-heap metadata, `extra_item_size` bytes per heap.
    extra: UnsafeCell<Box<[u8]>>,
    extra_item_size: usize,
}

// SAFETY: Chunk is Send + Sync because:
// - `data` and `extra` are only written through `write_payload` /
//   `write_extra`, whose callers route disjoint byte ranges (see the
//   module-level write discipline);
// - `present` uses atomic bytes;
// - the id/refcount fields are atomics.
unsafe impl Send for Chunk {}
unsafe impl Sync for Chunk {}

impl Chunk {
    /// Create a chunk with a payload buffer of `data_size` bytes and
    /// `heap_count` present flags, and no extra metadata.
    pub fn new(data_size: usize, heap_count: usize) -> Self {
        Self::with_extra(data_size, heap_count, 0)
    }

    /// Create a chunk that additionally carries `extra_item_size` bytes of
    /// opaque metadata per heap.
    pub fn with_extra(data_size: usize, heap_count: usize, extra_item_size: usize) -> Self {
        Self {
            chunk_id: AtomicI64::new(CHUNK_ID_NONE),
            stream_id: AtomicU64::new(0),
            ref_count: AtomicU32::new(0),
            data: UnsafeCell::new(vec![0u8; data_size].into_boxed_slice()),
            data_size,
            present: (0..heap_count).map(|_| AtomicU8::new(0)).collect(),
            extra: UnsafeCell::new(vec![0u8; heap_count * extra_item_size].into_boxed_slice()),
            extra_item_size,
        }
    }

    /// Chunk id, or [`CHUNK_ID_NONE`] for a recycled chunk.
    #[inline]
    pub fn chunk_id(&self) -> i64 {
        self.chunk_id.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_chunk_id(&self, id: i64) {
        self.chunk_id.store(id, Ordering::Release);
    }

    /// Id of the member stream that most recently acquired the chunk.
    #[inline]
    pub fn stream_id(&self) -> u64 {
        self.stream_id.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_stream_id(&self, id: u64) {
        self.stream_id.store(id, Ordering::Relaxed);
    }

    /// Payload buffer size in bytes.
    #[inline]
    pub fn data_size(&self) -> usize {
        self.data_size
    }

    /// Number of heaps the chunk expects.
    #[inline]
    pub fn heap_count(&self) -> usize {
        self.present.len()
    }

    /// Read access to the payload buffer.
    ///
    /// Intended for the consumer after delivery, when no member holds a
    /// stake in the chunk. Bytes of heaps whose present flag is unset are
    /// unspecified (stale from a previous occupancy).
    pub fn data(&self) -> &[u8] {
        // SAFETY: shared read; writers only exist while members hold a
        // stake, and those write disjoint regions (module discipline).
        unsafe { &*self.data.get() }
    }

    /// Copy `bytes` into the payload buffer at `offset`.
    ///
    /// Returns `false` (copying nothing) if the range does not fit.
    pub(crate) fn write_payload(&self, offset: usize, bytes: &[u8]) -> bool {
        let Some(end) = offset.checked_add(bytes.len()) else {
            return false;
        };
        if end > self.data_size {
            return false;
        }
        // SAFETY: bounds checked above; concurrent writers target disjoint
        // ranges per the module-level write discipline.
        unsafe {
            let data = &mut *self.data.get();
            data[offset..end].copy_from_slice(bytes);
        }
        true
    }

    /// Whether heap `heap_index` has been fully received.
    #[inline]
    pub fn present(&self, heap_index: usize) -> bool {
        self.present
            .get(heap_index)
            .map_or(false, |flag| flag.load(Ordering::Acquire) != 0)
    }

    /// Copy of the present array, one byte per heap.
    pub fn present_snapshot(&self) -> Vec<u8> {
        self.present
            .iter()
            .map(|flag| flag.load(Ordering::Acquire))
            .collect()
    }

    #[inline]
    pub(crate) fn set_present(&self, heap_index: usize) {
        if let Some(flag) = self.present.get(heap_index) {
            flag.store(1, Ordering::Release);
        }
    }

    /// Per-heap extra metadata buffer.
    pub fn extra(&self) -> &[u8] {
        // SAFETY: same discipline as `data`.
        unsafe { &*self.extra.get() }
    }

    /// Bytes of extra metadata per heap.
    #[inline]
    pub fn extra_item_size(&self) -> usize {
        self.extra_item_size
    }

    /// Copy `bytes` into the metadata slot of heap `heap_index`.
    ///
    /// Returns `false` if the chunk carries no extra array, the index is
    /// out of range, or `bytes` is longer than one slot.
    pub fn write_extra(&self, heap_index: usize, bytes: &[u8]) -> bool {
        if self.extra_item_size == 0
            || heap_index >= self.present.len()
            || bytes.len() > self.extra_item_size
        {
            return false;
        }
        let offset = heap_index * self.extra_item_size;
        // SAFETY: one slot per heap; the heap-routing discipline keeps
        // concurrent writers on distinct heap indices.
        unsafe {
            let extra = &mut *self.extra.get();
            extra[offset..offset + bytes.len()].copy_from_slice(bytes);
        }
        true
    }

    /// Reset id, diagnostics and present flags for reuse from the free
    /// ring. Payload bytes are left as-is; only present heaps are valid.
    pub(crate) fn recycle(&self) {
        self.chunk_id.store(CHUNK_ID_NONE, Ordering::Release);
        self.stream_id.store(0, Ordering::Relaxed);
        for flag in self.present.iter() {
            flag.store(0, Ordering::Release);
        }
    }

    // Refcount protocol. All transitions happen under the group mutex;
    // the atomics make concurrent reads well-defined.

    #[inline]
    pub(crate) fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn init_refs(&self, n: u32) {
        self.ref_count.store(n, Ordering::Release);
    }

    /// Increment the refcount, returning the new value.
    #[inline]
    pub(crate) fn acquire(&self) -> u32 {
        self.ref_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrement the refcount, returning the new value.
    #[inline]
    pub(crate) fn release(&self) -> u32 {
        let prev = self.ref_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "chunk refcount underflow");
        prev - 1
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("chunk_id", &self.chunk_id())
            .field("stream_id", &self.stream_id())
            .field("ref_count", &self.ref_count())
            .field("data_size", &self.data_size)
            .field("heap_count", &self.present.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_chunk_is_blank() {
        let chunk = Chunk::new(256, 4);
        assert_eq!(chunk.chunk_id(), CHUNK_ID_NONE);
        assert_eq!(chunk.data_size(), 256);
        assert_eq!(chunk.heap_count(), 4);
        assert_eq!(chunk.ref_count(), 0);
        assert_eq!(chunk.present_snapshot(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_write_payload_bounds() {
        let chunk = Chunk::new(8, 1);
        assert!(chunk.write_payload(0, &[1, 2, 3, 4]));
        assert!(chunk.write_payload(4, &[5, 6, 7, 8]));
        assert!(!chunk.write_payload(5, &[0; 4])); // overruns
        assert!(!chunk.write_payload(usize::MAX, &[1])); // offset overflow
        assert_eq!(chunk.data(), &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_present_flags() {
        let chunk = Chunk::new(16, 2);
        assert!(!chunk.present(0));
        chunk.set_present(0);
        assert!(chunk.present(0));
        assert!(!chunk.present(1));
        chunk.set_present(99); // out of range, ignored
        assert_eq!(chunk.present_snapshot(), vec![1, 0]);
    }

    #[test]
    fn test_extra_metadata() {
        let chunk = Chunk::with_extra(16, 2, 4);
        assert_eq!(chunk.extra_item_size(), 4);
        assert!(chunk.write_extra(1, &[0xDE, 0xAD]));
        assert!(!chunk.write_extra(2, &[0])); // index out of range
        assert!(!chunk.write_extra(0, &[0; 5])); // too long for one slot
        assert_eq!(&chunk.extra()[4..6], &[0xDE, 0xAD]);

        let plain = Chunk::new(16, 2);
        assert!(!plain.write_extra(0, &[1]));
    }

    #[test]
    fn test_refcount_protocol() {
        let chunk = Chunk::new(1, 1);
        chunk.init_refs(1);
        assert_eq!(chunk.acquire(), 2);
        assert_eq!(chunk.release(), 1);
        assert_eq!(chunk.release(), 0);
    }

    #[test]
    fn test_recycle_clears_identity_not_payload() {
        let chunk = Chunk::new(4, 2);
        chunk.set_chunk_id(7);
        chunk.set_stream_id(3);
        chunk.set_present(1);
        chunk.write_payload(0, &[9, 9, 9, 9]);

        chunk.recycle();
        assert_eq!(chunk.chunk_id(), CHUNK_ID_NONE);
        assert_eq!(chunk.stream_id(), 0);
        assert_eq!(chunk.present_snapshot(), vec![0, 0]);
        assert_eq!(chunk.data(), &[9, 9, 9, 9]); // payload intentionally kept
    }
}
