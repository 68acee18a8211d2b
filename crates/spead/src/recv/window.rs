// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sliding window of chunk slots.
//!
//! A circular buffer of `max_chunks` slots indexed by `chunk_id mod
//! capacity`. The window is policy-free: the group decides when to advance
//! the head and what to do with vacated chunks.
//!
//! Invariants (maintained by the group under its mutex):
//! - every occupied slot satisfies `head_chunk_id <= id < tail_chunk_id`;
//! - `tail_chunk_id - head_chunk_id == capacity` once the window has
//!   started.

use super::chunk::{Chunk, CHUNK_ID_NONE};
use std::sync::Arc;

pub(crate) struct ChunkWindow {
    slots: Vec<Option<Arc<Chunk>>>,
    /// Id of the oldest chunk position, or [`CHUNK_ID_NONE`] before the
    /// first chunk is seen (and after a reset).
    head_chunk_id: i64,
}

impl ChunkWindow {
    /// Create a window with `capacity` slots. Capacity must be positive
    /// (enforced by config validation).
    pub(crate) fn new(capacity: usize) -> Self {
        debug_assert!(capacity > 0);
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            head_chunk_id: CHUNK_ID_NONE,
        }
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Oldest chunk id covered, or [`CHUNK_ID_NONE`] when unstarted.
    #[inline]
    pub(crate) fn head_chunk_id(&self) -> i64 {
        self.head_chunk_id
    }

    /// Exclusive upper bound of the window, defined even for positions
    /// whose slots are empty. [`CHUNK_ID_NONE`] when unstarted.
    #[inline]
    pub(crate) fn tail_chunk_id(&self) -> i64 {
        if self.head_chunk_id == CHUNK_ID_NONE {
            CHUNK_ID_NONE
        } else {
            self.head_chunk_id + self.slots.len() as i64
        }
    }

    /// Start the window with `id` as its head position.
    pub(crate) fn start(&mut self, id: i64) {
        debug_assert_eq!(self.head_chunk_id, CHUNK_ID_NONE);
        debug_assert!(id >= 0);
        self.head_chunk_id = id;
    }

    fn position(&self, id: i64) -> usize {
        (id.rem_euclid(self.slots.len() as i64)) as usize
    }

    /// Occupant of the slot at `id mod capacity`. Occupancy is not
    /// enforced; callers stay within `[head, tail)`.
    pub(crate) fn get(&self, id: i64) -> Option<&Arc<Chunk>> {
        self.slots[self.position(id)].as_ref()
    }

    /// Install `chunk` in the slot for `id`. The slot must be vacant and
    /// `id` within the window.
    pub(crate) fn put(&mut self, id: i64, chunk: Arc<Chunk>) {
        debug_assert!(self.head_chunk_id != CHUNK_ID_NONE);
        debug_assert!(id >= self.head_chunk_id && id < self.tail_chunk_id());
        let pos = self.position(id);
        debug_assert!(self.slots[pos].is_none());
        self.slots[pos] = Some(chunk);
    }

    /// Advance the head by `n` positions, handing each vacated occupant to
    /// `sink`. Empty positions are skipped cheaply. The caller's eviction
    /// policy decides what the sink does with a not-yet-complete chunk.
    pub(crate) fn flush_head(&mut self, n: usize, mut sink: impl FnMut(Arc<Chunk>)) {
        for _ in 0..n {
            if self.head_chunk_id == CHUNK_ID_NONE {
                return;
            }
            let pos = self.position(self.head_chunk_id);
            if let Some(chunk) = self.slots[pos].take() {
                sink(chunk);
            }
            self.head_chunk_id += 1;
        }
    }

    /// Flush every occupied slot in ascending id order and return to the
    /// unstarted state.
    pub(crate) fn reset(&mut self, sink: impl FnMut(Arc<Chunk>)) {
        let capacity = self.slots.len();
        self.flush_head(capacity, sink);
        self.head_chunk_id = CHUNK_ID_NONE;
    }
}
