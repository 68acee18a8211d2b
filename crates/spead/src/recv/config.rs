// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Group and per-stream configuration.
//!
//! Both configs are built through validating builders: a config value that
//! exists is well-formed, so construction of groups and members is
//! infallible afterwards.

use super::chunk::Chunk;
use super::group::GroupHooks;
use super::member::HeapPlacement;
use super::stats::StreamStats;
use crate::config::{DEFAULT_MAX_CHUNKS, DEFAULT_MAX_HEAPS, DEFAULT_MAX_PACKET_SIZE};
use crate::protocol::packet::PacketHeader;
use std::sync::Arc;

/// Provides an empty chunk for `chunk_id`, or `None` when no chunk can be
/// accepted (the id is then skipped and its heaps are lost).
pub type AllocateFn = Box<dyn Fn(i64, &StreamStats) -> Option<Arc<Chunk>> + Send + Sync>;

/// Receives chunks whose refcount has drained after eviction, in strictly
/// ascending chunk-id order.
pub type ReadyFn = Box<dyn Fn(Arc<Chunk>, &StreamStats) + Send + Sync>;

/// Maps a packet header to the heap's position, or `None` to discard the
/// heap. Must be deterministic and side-effect-free.
pub type PlaceFn = Box<dyn Fn(&PacketHeader<'_>) -> Option<HeapPlacement> + Send + Sync>;

/// What happens to still-referenced chunks when the window must advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionMode {
    /// Force member streams to release incomplete chunks; the window
    /// advances without waiting and chunks may be delivered with missing
    /// heaps.
    #[default]
    Lossy,
    /// Block the requesting stream until every member has released its
    /// stake; no data is discarded and backpressure propagates upstream.
    Lossless,
}

/// Configuration or construction error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// `max_chunks` must be positive.
    ZeroMaxChunks,
    /// `max_heaps` must be positive.
    ZeroMaxHeaps,
    /// The group needs an allocate callback.
    MissingAllocate,
    /// The group needs a ready callback.
    MissingReady,
    /// The stream needs a place callback.
    MissingPlace,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ZeroMaxChunks => write!(f, "max_chunks must be positive"),
            Self::ZeroMaxHeaps => write!(f, "max_heaps must be positive"),
            Self::MissingAllocate => write!(f, "allocate callback not set"),
            Self::MissingReady => write!(f, "ready callback not set"),
            Self::MissingPlace => write!(f, "place callback not set"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Validated configuration of a chunk stream group.
pub struct ChunkStreamGroupConfig {
    pub(crate) max_chunks: usize,
    pub(crate) eviction_mode: EvictionMode,
    pub(crate) allocate: AllocateFn,
    pub(crate) ready: ReadyFn,
    pub(crate) hooks: Box<dyn GroupHooks>,
}

impl ChunkStreamGroupConfig {
    /// Builder for a group with user-supplied allocate/ready callbacks.
    pub fn builder() -> ChunkStreamGroupConfigBuilder {
        ChunkStreamGroupConfigBuilder::default()
    }

    /// Builder for the ring-backed group, which wires allocate/ready to a
    /// ring pair itself (see
    /// [`ChunkStreamRingGroup`](super::ring::ChunkStreamRingGroup)).
    pub fn ring_builder() -> RingGroupConfigBuilder {
        RingGroupConfigBuilder::default()
    }

    /// Maximum number of chunks live at the same time.
    pub fn max_chunks(&self) -> usize {
        self.max_chunks
    }

    /// Eviction mode applied when the window must advance.
    pub fn eviction_mode(&self) -> EvictionMode {
        self.eviction_mode
    }
}

/// Builder for [`ChunkStreamGroupConfig`].
pub struct ChunkStreamGroupConfigBuilder {
    max_chunks: usize,
    eviction_mode: EvictionMode,
    allocate: Option<AllocateFn>,
    ready: Option<ReadyFn>,
    hooks: Option<Box<dyn GroupHooks>>,
}

impl Default for ChunkStreamGroupConfigBuilder {
    fn default() -> Self {
        Self {
            max_chunks: DEFAULT_MAX_CHUNKS,
            eviction_mode: EvictionMode::default(),
            allocate: None,
            ready: None,
            hooks: None,
        }
    }
}

impl ChunkStreamGroupConfigBuilder {
    /// Set the maximum number of chunks live at the same time. A value of
    /// 1 means heaps must be received in chunk order.
    pub fn max_chunks(mut self, max_chunks: usize) -> Self {
        self.max_chunks = max_chunks;
        self
    }

    /// Set the eviction mode. Defaults to [`EvictionMode::Lossy`].
    pub fn eviction_mode(mut self, mode: EvictionMode) -> Self {
        self.eviction_mode = mode;
        self
    }

    /// Set the chunk allocation callback.
    pub fn allocate<F>(mut self, allocate: F) -> Self
    where
        F: Fn(i64, &StreamStats) -> Option<Arc<Chunk>> + Send + Sync + 'static,
    {
        self.allocate = Some(Box::new(allocate));
        self
    }

    /// Set the completed-chunk callback.
    pub fn ready<F>(mut self, ready: F) -> Self
    where
        F: Fn(Arc<Chunk>, &StreamStats) + Send + Sync + 'static,
    {
        self.ready = Some(Box::new(ready));
        self
    }

    /// Attach lifecycle hooks (defaults to no-ops).
    pub fn hooks(mut self, hooks: Box<dyn GroupHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<ChunkStreamGroupConfig, ConfigError> {
        if self.max_chunks == 0 {
            return Err(ConfigError::ZeroMaxChunks);
        }
        let allocate = self.allocate.ok_or(ConfigError::MissingAllocate)?;
        let ready = self.ready.ok_or(ConfigError::MissingReady)?;
        Ok(ChunkStreamGroupConfig {
            max_chunks: self.max_chunks,
            eviction_mode: self.eviction_mode,
            allocate,
            ready,
            hooks: self.hooks.unwrap_or_else(|| Box::new(NoopHooks)),
        })
    }
}

/// Reduced builder for the ring-backed group: only the window parameters
/// are user-chosen; callbacks and hooks come from the ring pair.
#[derive(Debug, Clone, Copy)]
pub struct RingGroupConfigBuilder {
    pub(crate) max_chunks: usize,
    pub(crate) eviction_mode: EvictionMode,
}

impl Default for RingGroupConfigBuilder {
    fn default() -> Self {
        Self {
            max_chunks: DEFAULT_MAX_CHUNKS,
            eviction_mode: EvictionMode::default(),
        }
    }
}

impl RingGroupConfigBuilder {
    /// Set the maximum number of chunks live at the same time.
    pub fn max_chunks(mut self, max_chunks: usize) -> Self {
        self.max_chunks = max_chunks;
        self
    }

    /// Set the eviction mode. Defaults to [`EvictionMode::Lossy`].
    pub fn eviction_mode(mut self, mode: EvictionMode) -> Self {
        self.eviction_mode = mode;
        self
    }
}

struct NoopHooks;

impl GroupHooks for NoopHooks {}

/// Validated configuration of one member stream.
pub struct ChunkStreamConfig {
    pub(crate) max_heaps: usize,
    pub(crate) max_packet_size: usize,
    pub(crate) max_heap_size: usize,
    pub(crate) stop_on_stop_item: bool,
    pub(crate) place: PlaceFn,
}

impl ChunkStreamConfig {
    pub fn builder() -> ChunkStreamConfigBuilder {
        ChunkStreamConfigBuilder::default()
    }
}

/// Builder for [`ChunkStreamConfig`].
pub struct ChunkStreamConfigBuilder {
    max_heaps: usize,
    max_packet_size: usize,
    max_heap_size: usize,
    stop_on_stop_item: bool,
    place: Option<PlaceFn>,
}

impl Default for ChunkStreamConfigBuilder {
    fn default() -> Self {
        Self {
            max_heaps: DEFAULT_MAX_HEAPS,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            max_heap_size: usize::MAX,
            stop_on_stop_item: true,
            place: None,
        }
    }
}

impl ChunkStreamConfigBuilder {
    /// Maximum number of partially received heaps tracked at once. When
    /// the table is full, the oldest partial heap is abandoned.
    pub fn max_heaps(mut self, max_heaps: usize) -> Self {
        self.max_heaps = max_heaps;
        self
    }

    /// Upper bound on accepted datagram size.
    pub fn max_packet_size(mut self, max_packet_size: usize) -> Self {
        self.max_packet_size = max_packet_size;
        self
    }

    /// Upper bound on the declared heap length. Defaults to unbounded.
    pub fn max_heap_size(mut self, max_heap_size: usize) -> Self {
        self.max_heap_size = max_heap_size;
        self
    }

    /// Whether a stream-control stop item stops the member. Defaults to
    /// true.
    pub fn stop_on_stop_item(mut self, stop: bool) -> Self {
        self.stop_on_stop_item = stop;
        self
    }

    /// Set the placement callback (mandatory).
    pub fn place<F>(mut self, place: F) -> Self
    where
        F: Fn(&PacketHeader<'_>) -> Option<HeapPlacement> + Send + Sync + 'static,
    {
        self.place = Some(Box::new(place));
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<ChunkStreamConfig, ConfigError> {
        if self.max_heaps == 0 {
            return Err(ConfigError::ZeroMaxHeaps);
        }
        let place = self.place.ok_or(ConfigError::MissingPlace)?;
        Ok(ChunkStreamConfig {
            max_heaps: self.max_heaps,
            max_packet_size: self.max_packet_size,
            max_heap_size: self.max_heap_size,
            stop_on_stop_item: self.stop_on_stop_item,
            place,
        })
    }
}
