// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Ring-buffer chunk provisioning and delivery.
//!
//! [`ChunkRingbuffer`] is a bounded MPMC channel of chunks with a stop
//! switch and a producer count. [`ChunkRingPair`] combines a free ring
//! (empty chunks posted by the consumer) and a data ring (completed chunks
//! delivered to the consumer) with a graveyard for chunks that became
//! deliverable after the data ring stopped. [`ChunkStreamRingGroup`] is
//! the usual entry point: a chunk stream group wired to a ring pair.
//!
//! # Shutdown protocol
//!
//! When any member stream is stopped by the user, both rings stop so a
//! producer blocked on a full data ring unblocks immediately; chunks that
//! become ready afterwards divert to the graveyard. The graveyard empties
//! from the thread that calls [`ChunkStreamRingGroup::stop`], which
//! matters for embeddings where chunk buffers may only be freed from one
//! thread.

use super::chunk::Chunk;
use super::config::{ChunkStreamConfig, ChunkStreamGroupConfig, ConfigError, RingGroupConfigBuilder};
use super::group::{ChunkStreamGroup, GroupHooks};
use super::member::ChunkStreamMember;
use crate::executor::Executor;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;

struct RingState {
    queue: VecDeque<Arc<Chunk>>,
    stopped: bool,
    producers: usize,
}

/// Bounded MPMC ring of chunks.
///
/// Producers block on a full ring, consumers on an empty one. Stopping
/// wakes everyone: pushes fail immediately, pops drain what is queued and
/// then report end-of-stream. When the producer count drops to zero the
/// ring behaves as stopped-when-empty, so consumers see end-of-stream
/// without an explicit stop.
pub struct ChunkRingbuffer {
    capacity: usize,
    state: Mutex<RingState>,
    data_available: Condvar,
    space_available: Condvar,
}

impl ChunkRingbuffer {
    /// Create a ring holding at most `capacity` chunks.
    ///
    /// # Panics
    /// Panics if `capacity` is 0.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be > 0");
        Self {
            capacity,
            state: Mutex::new(RingState {
                queue: VecDeque::with_capacity(capacity),
                stopped: false,
                producers: 0,
            }),
            data_available: Condvar::new(),
            space_available: Condvar::new(),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current number of queued chunks (racy, for observation only).
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Whether the ring holds no chunks (racy, for observation only).
    pub fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }

    /// Whether the ring has been stopped.
    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    /// Register a producer. Consumers keep blocking on an empty ring
    /// while at least one producer is registered.
    pub fn add_producer(&self) {
        self.state.lock().producers += 1;
    }

    /// Deregister a producer. When the count reaches zero, waiting
    /// consumers drain the queue and then observe end-of-stream.
    pub fn remove_producer(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.producers > 0);
        state.producers -= 1;
        if state.producers == 0 {
            drop(state);
            self.data_available.notify_all();
        }
    }

    /// Push a chunk, blocking while the ring is full.
    ///
    /// # Errors
    /// Returns the chunk back if the ring is (or becomes) stopped.
    pub fn push(&self, chunk: Arc<Chunk>) -> Result<(), Arc<Chunk>> {
        let mut state = self.state.lock();
        loop {
            if state.stopped {
                return Err(chunk);
            }
            if state.queue.len() < self.capacity {
                state.queue.push_back(chunk);
                drop(state);
                self.data_available.notify_one();
                return Ok(());
            }
            self.space_available.wait(&mut state);
        }
    }

    /// Push without blocking.
    ///
    /// # Errors
    /// Returns the chunk back if the ring is full or stopped.
    pub fn try_push(&self, chunk: Arc<Chunk>) -> Result<(), Arc<Chunk>> {
        let mut state = self.state.lock();
        if state.stopped || state.queue.len() >= self.capacity {
            return Err(chunk);
        }
        state.queue.push_back(chunk);
        drop(state);
        self.data_available.notify_one();
        Ok(())
    }

    /// Pop a chunk, blocking while the ring is empty and producers are
    /// active. `None` means end-of-stream: the ring was stopped, or every
    /// producer left, and the queue has drained.
    pub fn pop(&self) -> Option<Arc<Chunk>> {
        let mut state = self.state.lock();
        loop {
            if let Some(chunk) = state.queue.pop_front() {
                drop(state);
                self.space_available.notify_one();
                return Some(chunk);
            }
            if state.stopped || state.producers == 0 {
                return None;
            }
            self.data_available.wait(&mut state);
        }
    }

    /// Pop without blocking. `None` means the ring is currently empty.
    pub fn try_pop(&self) -> Option<Arc<Chunk>> {
        let mut state = self.state.lock();
        let chunk = state.queue.pop_front();
        if chunk.is_some() {
            drop(state);
            self.space_available.notify_one();
        }
        chunk
    }

    /// Stop the ring: wake all waiters, fail further pushes, let pops
    /// drain the queue. Idempotent.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
        }
        self.data_available.notify_all();
        self.space_available.notify_all();
    }
}

/// A free ring, a data ring and the graveyard joining them.
pub struct ChunkRingPair {
    data_ring: Arc<ChunkRingbuffer>,
    free_ring: Arc<ChunkRingbuffer>,
    /// Chunks that were ready after the data ring stopped. Emptied from
    /// the thread that stops the group.
    graveyard: Mutex<Vec<Arc<Chunk>>>,
}

impl ChunkRingPair {
    pub fn new(data_ring: Arc<ChunkRingbuffer>, free_ring: Arc<ChunkRingbuffer>) -> Self {
        Self {
            data_ring,
            free_ring,
            graveyard: Mutex::new(Vec::new()),
        }
    }

    #[inline]
    pub fn data_ring(&self) -> &Arc<ChunkRingbuffer> {
        &self.data_ring
    }

    #[inline]
    pub fn free_ring(&self) -> &Arc<ChunkRingbuffer> {
        &self.free_ring
    }

    /// Recycle a chunk received from the data ring: present flags clear,
    /// id back to the sentinel, then onto the free ring. A stopped free
    /// ring drops the chunk instead.
    pub fn add_free_chunk(&self, chunk: Arc<Chunk>) {
        chunk.recycle();
        if self.free_ring.push(chunk).is_err() {
            log::debug!("[Ring] free ring stopped, dropping recycled chunk");
        }
    }

    /// The group's allocate: a non-blocking pop from the free ring.
    /// Empty or stopped means the chunk id is skipped.
    pub(crate) fn allocate(&self, chunk_id: i64) -> Option<Arc<Chunk>> {
        if self.free_ring.is_stopped() {
            return None;
        }
        let chunk = self.free_ring.try_pop();
        if chunk.is_none() {
            log::debug!("[Ring] no free chunk available for chunk {chunk_id}");
        }
        chunk
    }

    /// The group's ready: push to the data ring, diverting to the
    /// graveyard once the ring has stopped.
    pub(crate) fn ready(&self, chunk: Arc<Chunk>) {
        if let Err(chunk) = self.data_ring.push(chunk) {
            log::debug!(
                "[Ring] data ring stopped, chunk {} diverted to graveyard",
                chunk.chunk_id()
            );
            self.graveyard.lock().push(chunk);
        }
    }

    /// Number of chunks parked in the graveyard (for monitoring).
    pub fn graveyard_len(&self) -> usize {
        self.graveyard.lock().len()
    }

    /// Drop all graveyard chunks on the calling thread.
    pub fn empty_graveyard(&self) {
        let chunks = std::mem::take(&mut *self.graveyard.lock());
        drop(chunks);
    }
}

/// Group lifecycle hooks that keep the ring pair in sync with the member
/// streams.
struct RingHooks {
    rings: Arc<ChunkRingPair>,
}

impl GroupHooks for RingHooks {
    fn stream_added(&self, _member: &ChunkStreamMember) {
        self.rings.data_ring().add_producer();
    }

    fn stream_stop_received(&self, _member: &ChunkStreamMember) {
        self.rings.data_ring().remove_producer();
    }

    fn stream_pre_stop(&self, _member: &ChunkStreamMember) {
        // Shut the rings down so a producer blocked on a full data ring
        // cannot deadlock the teardown.
        self.rings.data_ring().stop();
        self.rings.free_ring().stop();
    }
}

/// A chunk stream group that uses ring buffers to manage chunks.
///
/// Fresh chunks come from the free ring; completed chunks go to the data
/// ring. The rings may be shared between groups that start and stop
/// together: they are stopped as soon as any member stream stops.
pub struct ChunkStreamRingGroup {
    group: ChunkStreamGroup,
    rings: Arc<ChunkRingPair>,
    stopped: bool,
}

impl ChunkStreamRingGroup {
    /// Build a ring-backed group. Window parameters come from
    /// [`ChunkStreamGroupConfig::ring_builder`]; allocate, ready and the
    /// lifecycle hooks are wired to the ring pair.
    pub fn new(
        window: RingGroupConfigBuilder,
        data_ring: Arc<ChunkRingbuffer>,
        free_ring: Arc<ChunkRingbuffer>,
    ) -> Result<Self, ConfigError> {
        let rings = Arc::new(ChunkRingPair::new(data_ring, free_ring));
        let allocate_rings = Arc::clone(&rings);
        let ready_rings = Arc::clone(&rings);
        let config = ChunkStreamGroupConfig::builder()
            .max_chunks(window.max_chunks)
            .eviction_mode(window.eviction_mode)
            .allocate(move |chunk_id, _stats| allocate_rings.allocate(chunk_id))
            .ready(move |chunk, _stats| ready_rings.ready(chunk))
            .hooks(Box::new(RingHooks {
                rings: Arc::clone(&rings),
            }))
            .build()?;
        Ok(Self {
            group: ChunkStreamGroup::new(config),
            rings,
            stopped: false,
        })
    }

    /// Add a new member stream. See
    /// [`ChunkStreamGroup::emplace_member`].
    pub fn emplace_member(
        &mut self,
        config: ChunkStreamConfig,
        executor: Arc<dyn Executor>,
    ) -> Arc<ChunkStreamMember> {
        self.group.emplace_member(config, executor)
    }

    /// The delivery ring: completed chunks in ascending chunk-id order.
    #[inline]
    pub fn data_ring(&self) -> &Arc<ChunkRingbuffer> {
        self.rings.data_ring()
    }

    /// The provisioning ring: empty chunks posted by the consumer.
    #[inline]
    pub fn free_ring(&self) -> &Arc<ChunkRingbuffer> {
        self.rings.free_ring()
    }

    /// The underlying ring pair (graveyard observation, sharing).
    #[inline]
    pub fn ring_pair(&self) -> &Arc<ChunkRingPair> {
        &self.rings
    }

    /// Recycle a chunk received from the data ring.
    pub fn add_free_chunk(&self, chunk: Arc<Chunk>) {
        self.rings.add_free_chunk(chunk);
    }

    /// Number of member streams.
    pub fn len(&self) -> usize {
        self.group.len()
    }

    /// Whether the group has any member streams.
    pub fn is_empty(&self) -> bool {
        self.group.is_empty()
    }

    /// The member at `index`.
    pub fn member(&self, index: usize) -> Option<&Arc<ChunkStreamMember>> {
        self.group.member(index)
    }

    /// Iterate the member streams in creation order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ChunkStreamMember>> {
        self.group.iter()
    }

    /// Stop the rings and every member stream, flush the window, then
    /// empty the graveyard on this thread. Idempotent.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        // Stopping the first member does this too, but make sure the
        // rings stop even when the group has no members.
        self.rings.data_ring().stop();
        self.rings.free_ring().stop();
        self.group.stop();
        self.rings.empty_graveyard();
    }
}

impl Drop for ChunkStreamRingGroup {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: i64) -> Arc<Chunk> {
        let c = Chunk::new(8, 1);
        c.set_chunk_id(id);
        Arc::new(c)
    }

    #[test]
    fn test_push_pop_fifo() {
        let ring = ChunkRingbuffer::new(4);
        ring.add_producer();
        assert!(ring.push(chunk(0)).is_ok());
        assert!(ring.push(chunk(1)).is_ok());
        assert_eq!(ring.len(), 2);

        assert_eq!(ring.pop().map(|c| c.chunk_id()), Some(0));
        assert_eq!(ring.pop().map(|c| c.chunk_id()), Some(1));
        assert!(ring.is_empty());
    }

    #[test]
    fn test_try_ops_do_not_block() {
        let ring = ChunkRingbuffer::new(1);
        assert!(ring.try_pop().is_none());
        assert!(ring.try_push(chunk(0)).is_ok());
        assert!(ring.try_push(chunk(1)).is_err()); // full
        assert_eq!(ring.try_pop().map(|c| c.chunk_id()), Some(0));
    }

    #[test]
    fn test_stopped_ring_drains_then_ends() {
        let ring = ChunkRingbuffer::new(4);
        ring.add_producer();
        ring.push(chunk(0)).expect("push before stop");
        ring.stop();

        assert!(ring.push(chunk(1)).is_err());
        assert_eq!(ring.pop().map(|c| c.chunk_id()), Some(0));
        assert!(ring.pop().is_none());
    }

    #[test]
    fn test_zero_producers_means_end_of_stream() {
        let ring = ChunkRingbuffer::new(4);
        ring.add_producer();
        ring.push(chunk(0)).expect("push");
        ring.remove_producer();

        // Queue drains, then end-of-stream without an explicit stop.
        assert_eq!(ring.pop().map(|c| c.chunk_id()), Some(0));
        assert!(ring.pop().is_none());
        assert!(!ring.is_stopped());
    }

    #[test]
    fn test_graveyard_diversion_and_drain() {
        let pair = ChunkRingPair::new(
            Arc::new(ChunkRingbuffer::new(2)),
            Arc::new(ChunkRingbuffer::new(2)),
        );
        pair.data_ring().stop();

        pair.ready(chunk(0));
        pair.ready(chunk(1));
        assert_eq!(pair.graveyard_len(), 2);
        assert!(pair.data_ring().pop().is_none());

        pair.empty_graveyard();
        assert_eq!(pair.graveyard_len(), 0);
    }

    #[test]
    fn test_add_free_chunk_recycles() {
        let pair = ChunkRingPair::new(
            Arc::new(ChunkRingbuffer::new(2)),
            Arc::new(ChunkRingbuffer::new(2)),
        );
        let c = chunk(5);
        c.set_present(0);
        pair.add_free_chunk(c);

        let recycled = pair.free_ring().try_pop().expect("recycled chunk");
        assert_eq!(recycled.chunk_id(), super::super::chunk::CHUNK_ID_NONE);
        assert!(!recycled.present(0));
    }
}
