// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Chunk stream group: the window-owning coordinator.
//!
//! A group holds a collection of member streams that share chunks. The
//! group owns the member streams and takes care of stopping them when the
//! group is stopped or dropped.
//!
//! Ownership of in-window chunks is shared between the group and the
//! members, but reference counting is manual (rather than relying on the
//! `Arc` strong count) so the count lives in the chunk and the group can
//! wait on it draining under its own mutex.
//!
//! # Delivery order
//!
//! Chunks pass to the ready callback in strictly ascending chunk-id order,
//! each exactly once. A chunk evicted while members still hold stakes is
//! parked; once its refcount drains it is delivered as soon as no evicted
//! chunk with a smaller id is still outstanding.
//!
//! # Threading
//!
//! `get_chunk` / `release_chunk` are thread-safe and called from member
//! dispatch threads. The public surface (`emplace_member`, `stop`,
//! indexing) must only be used from one thread at a time, and never
//! concurrently with itself.

use super::chunk::{Chunk, CHUNK_ID_NONE};
use super::config::{ChunkStreamConfig, ChunkStreamGroupConfig, EvictionMode};
use super::member::ChunkStreamMember;
use super::stats::StreamStats;
use super::window::ChunkWindow;
use crate::executor::Executor;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

/// Extension points fired on member lifecycle transitions.
///
/// Attached to the group configuration; the ring-backed group uses these
/// to track producers and shut its rings down.
pub trait GroupHooks: Send + Sync {
    /// Called after a newly constructed stream has joined the group.
    fn stream_added(&self, _member: &ChunkStreamMember) {}

    /// Called when a stream stops, whether from the network or the user.
    fn stream_stop_received(&self, _member: &ChunkStreamMember) {}

    /// Called before a user-initiated stop starts tearing a stream down,
    /// while packets may still be in flight.
    fn stream_pre_stop(&self, _member: &ChunkStreamMember) {}
}

/// Result of asking the group for a chunk.
pub(crate) enum GetChunkOutcome {
    /// Chunk granted; the caller now holds one reference and must pair it
    /// with a `release_chunk`.
    Granted(Arc<Chunk>),
    /// The chunk id has already fallen out of the window.
    TooOld,
    /// The allocate callback declined; the id is skipped.
    AllocateFailed,
}

struct GroupState {
    window: ChunkWindow,
    /// Members for which `stream_stop_received` has not run yet.
    live_streams: usize,
    /// Evicted chunks still referenced by members, keyed by id.
    in_flight: BTreeMap<i64, Arc<Chunk>>,
    /// Evicted chunks with drained refcounts awaiting ordered delivery.
    backlog: BTreeMap<i64, Arc<Chunk>>,
}

/// Shared core: everything the member streams need from the group. Members
/// hold `Arc<GroupCore>`, the core holds only weak member references, so
/// teardown needs no cycle breaking.
pub(crate) struct GroupCore {
    config: ChunkStreamGroupConfig,
    state: Mutex<GroupState>,
    /// Notified whenever a chunk's refcount drops to the window-only or
    /// zero level.
    ready_condition: Condvar,
    members: RwLock<Vec<Weak<ChunkStreamMember>>>,
    /// Charged for group-initiated flushes (stop with no member context).
    stats: StreamStats,
}

impl GroupCore {
    fn new(config: ChunkStreamGroupConfig) -> Self {
        let window = ChunkWindow::new(config.max_chunks);
        debug_assert_eq!(window.capacity(), config.max_chunks);
        Self {
            config,
            state: Mutex::new(GroupState {
                window,
                live_streams: 0,
                in_flight: BTreeMap::new(),
                backlog: BTreeMap::new(),
            }),
            ready_condition: Condvar::new(),
            members: RwLock::new(Vec::new()),
            stats: StreamStats::new(),
        }
    }

    #[inline]
    pub(crate) fn max_chunks(&self) -> usize {
        self.config.max_chunks
    }

    pub(crate) fn hooks(&self) -> &dyn GroupHooks {
        self.config.hooks.as_ref()
    }

    fn register_member(&self, member: &Arc<ChunkStreamMember>) {
        self.state.lock().live_streams += 1;
        self.members.write().push(Arc::downgrade(member));
    }

    /// Obtain the chunk with the given id, shifting the window if the id
    /// is beyond the tail. The returned chunk's refcount is incremented.
    pub(crate) fn get_chunk(
        &self,
        chunk_id: i64,
        stream_id: u64,
        stats: &StreamStats,
    ) -> GetChunkOutcome {
        debug_assert!(chunk_id >= 0);
        let capacity = self.config.max_chunks as i64;
        let mut state = self.state.lock();
        if state.window.head_chunk_id() == CHUNK_ID_NONE {
            state.window.start(chunk_id);
        }
        if chunk_id < state.window.head_chunk_id() {
            return GetChunkOutcome::TooOld;
        }
        if chunk_id >= state.window.tail_chunk_id() {
            let target = chunk_id - capacity + 1;
            match self.config.eviction_mode {
                EvictionMode::Lossy => {
                    // Tell every member to abandon writes into the slots
                    // being ejected. Posting happens with the state lock
                    // released so an inline executor can run the releases
                    // right here on this thread.
                    drop(state);
                    self.flush_members_until(target);
                    state = self.state.lock();
                    if state.window.head_chunk_id() == CHUNK_ID_NONE
                        || chunk_id < state.window.head_chunk_id()
                    {
                        // The group was reset, or another stream advanced
                        // the window past us, while the lock was released.
                        return GetChunkOutcome::TooOld;
                    }
                    while state.window.head_chunk_id() < target {
                        Self::evict_head(&mut state);
                    }
                }
                EvictionMode::Lossless => {
                    loop {
                        let head = state.window.head_chunk_id();
                        if head == CHUNK_ID_NONE || head >= target {
                            break;
                        }
                        let busy = state
                            .window
                            .get(head)
                            .map_or(false, |chunk| chunk.ref_count() > 1);
                        if busy {
                            // Backpressure: park this dispatch thread
                            // until the member stakes drain.
                            self.ready_condition.wait(&mut state);
                            continue;
                        }
                        Self::evict_head(&mut state);
                    }
                    if state.window.head_chunk_id() == CHUNK_ID_NONE
                        || chunk_id < state.window.head_chunk_id()
                    {
                        return GetChunkOutcome::TooOld;
                    }
                }
            }
            self.dispatch_ready(&mut state, stats);
        }

        let existing = state.window.get(chunk_id).cloned();
        let chunk = match existing {
            Some(chunk) => chunk,
            None => match (self.config.allocate)(chunk_id, stats) {
                Some(chunk) => {
                    chunk.set_chunk_id(chunk_id);
                    chunk.init_refs(1); // the window's reference
                    state.window.put(chunk_id, Arc::clone(&chunk));
                    chunk
                }
                None => {
                    log::debug!("[Group] allocate declined chunk {chunk_id}, id skipped");
                    return GetChunkOutcome::AllocateFailed;
                }
            },
        };
        chunk.set_stream_id(stream_id);
        chunk.acquire();
        GetChunkOutcome::Granted(chunk)
    }

    /// Drop the window's reference to the current head slot and advance.
    fn evict_head(state: &mut GroupState) {
        let GroupState {
            window,
            in_flight,
            backlog,
            ..
        } = &mut *state;
        window.flush_head(1, |chunk| {
            let id = chunk.chunk_id();
            let refs = chunk.release();
            if refs == 0 {
                backlog.insert(id, chunk);
            } else {
                log::debug!("[Group] chunk {id} evicted with {refs} member stakes in flight");
                in_flight.insert(id, chunk);
            }
        });
    }

    /// Decrement a member's stake. At zero the chunk has necessarily been
    /// evicted (the window holds a reference while resident) and becomes
    /// eligible for ordered delivery.
    pub(crate) fn release_chunk(&self, chunk: &Arc<Chunk>, stats: &StreamStats) {
        let mut state = self.state.lock();
        let refs = chunk.release();
        if refs == 0 {
            let id = chunk.chunk_id();
            let chunk = state
                .in_flight
                .remove(&id)
                .unwrap_or_else(|| Arc::clone(chunk));
            state.backlog.insert(id, chunk);
            self.dispatch_ready(&mut state, stats);
        }
        if refs <= 1 {
            // A lossless evictor may be waiting for this count to drain.
            self.ready_condition.notify_all();
        }
    }

    /// Hand drained chunks to the ready callback, smallest id first, never
    /// overtaking an evicted chunk that is still referenced.
    fn dispatch_ready(&self, state: &mut GroupState, stats: &StreamStats) {
        loop {
            let Some((&id, _)) = state.backlog.first_key_value() else {
                break;
            };
            if let Some((&oldest_busy, _)) = state.in_flight.first_key_value() {
                if oldest_busy < id {
                    break;
                }
            }
            let Some(chunk) = state.backlog.remove(&id) else {
                break;
            };
            debug_assert_eq!(chunk.ref_count(), 0);
            log::trace!("[Group] chunk {id} ready");
            (self.config.ready)(chunk, stats);
        }
    }

    /// Post an asynchronous flush request to every member.
    fn flush_members_until(&self, target: i64) {
        let members = self.members.read();
        for weak in members.iter() {
            if let Some(member) = weak.upgrade() {
                member.async_flush_until(target);
            }
        }
    }

    /// A member has stopped: drop it from the live count, and flush the
    /// window once no producer remains (nothing further can complete).
    pub(crate) fn stream_stop_received(&self, member: &ChunkStreamMember) {
        {
            let mut state = self.state.lock();
            debug_assert!(state.live_streams > 0);
            state.live_streams -= 1;
            log::debug!(
                "[Group] stream {} stopped, {} still live",
                member.id(),
                state.live_streams
            );
            if state.live_streams == 0 {
                self.flush_window_locked(&mut state, member.stats());
            }
        }
        self.config.hooks.stream_stop_received(member);
    }

    fn flush_window_locked(&self, state: &mut GroupState, stats: &StreamStats) {
        {
            let GroupState {
                window,
                in_flight,
                backlog,
                ..
            } = &mut *state;
            window.reset(|chunk| {
                let id = chunk.chunk_id();
                let refs = chunk.release();
                if refs == 0 {
                    backlog.insert(id, chunk);
                } else {
                    in_flight.insert(id, chunk);
                }
            });
        }
        self.dispatch_ready(state, stats);
    }

    /// Flush whatever the window still holds. Used by `stop` so that even
    /// a group whose members never stopped by themselves (or that has no
    /// members at all) delivers its residue.
    fn flush_remaining(&self) {
        let mut state = self.state.lock();
        self.flush_window_locked(&mut state, &self.stats);
        if !state.in_flight.is_empty() {
            // Only reachable when a dispatch thread races stop(); the
            // parked chunks are delivered when that thread releases them.
            log::debug!(
                "[Group] {} evicted chunks still referenced at stop",
                state.in_flight.len()
            );
        }
    }
}

/// A holder for a collection of member streams that share chunks.
///
/// The group owns the component streams and stops them when it is stopped
/// or dropped. It exposes vector-style access to the members.
///
/// The public interface must only be called from one thread at a time; in
/// particular `stop` must not run concurrently with `emplace_member`.
pub struct ChunkStreamGroup {
    core: Arc<GroupCore>,
    members: Vec<Arc<ChunkStreamMember>>,
    stopped: bool,
}

impl ChunkStreamGroup {
    /// Create a group from a validated configuration.
    pub fn new(config: ChunkStreamGroupConfig) -> Self {
        Self {
            core: Arc::new(GroupCore::new(config)),
            members: Vec::new(),
            stopped: false,
        }
    }

    /// Add a new member stream driven by `executor` for its deferred
    /// flushes. Returns a handle that stays valid for the group's
    /// lifetime.
    ///
    /// # Panics
    ///
    /// Panics if the group has been stopped.
    pub fn emplace_member(
        &mut self,
        config: ChunkStreamConfig,
        executor: Arc<dyn Executor>,
    ) -> Arc<ChunkStreamMember> {
        assert!(!self.stopped, "emplace_member on a stopped group");
        let id = self.members.len() as u64;
        let member = ChunkStreamMember::new(id, config, executor, Arc::clone(&self.core));
        self.core.register_member(&member);
        self.core.hooks().stream_added(&member);
        self.members.push(Arc::clone(&member));
        member
    }

    /// Number of member streams.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the group has any member streams.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// The member at `index`.
    pub fn member(&self, index: usize) -> Option<&Arc<ChunkStreamMember>> {
        self.members.get(index)
    }

    /// Iterate the member streams in creation order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ChunkStreamMember>> {
        self.members.iter()
    }

    /// Stop all member streams and release every chunk the window still
    /// holds. Idempotent. Must not be called concurrently with
    /// `emplace_member`.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        for member in &self.members {
            member.stop();
        }
        self.core.flush_remaining();
    }
}

impl Drop for ChunkStreamGroup {
    fn drop(&mut self) {
        self.stop();
    }
}
