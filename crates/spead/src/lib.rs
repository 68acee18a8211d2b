// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # SPEAD - Streaming Protocol for Exchange of Astronomical Data
//!
//! A pure Rust receiver for SPEAD streams, the UDP wire protocol used by
//! high-rate radio-astronomy instruments (correlators, beamformers,
//! channelisers) to ship telemetry heaps into software pipelines.
//!
//! The centrepiece is the **chunk stream group**: a fan-in scheduler that
//! aggregates several parallel substreams of packets into a single sliding
//! window of fixed-size chunks, routes each heap into its chunk slot, and
//! delivers completed chunks to the consumer through bounded ring buffers.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use spead::{
//!     Chunk, ChunkRingbuffer, ChunkStreamConfig, ChunkStreamRingGroup,
//!     ChunkStreamGroupConfig, EvictionMode, HeapPlacement, InlineExecutor,
//!     PacketHeader,
//! };
//!
//! const HEAPS_PER_CHUNK: i64 = 64;
//! const HEAP_PAYLOAD: usize = 1024;
//!
//! let data_ring = Arc::new(ChunkRingbuffer::new(4));
//! let free_ring = Arc::new(ChunkRingbuffer::new(4));
//! for _ in 0..4 {
//!     free_ring
//!         .push(Arc::new(Chunk::new(
//!             HEAPS_PER_CHUNK as usize * HEAP_PAYLOAD,
//!             HEAPS_PER_CHUNK as usize,
//!         )))
//!         .ok();
//! }
//!
//! let mut group = ChunkStreamRingGroup::new(
//!     ChunkStreamGroupConfig::ring_builder()
//!         .max_chunks(4)
//!         .eviction_mode(EvictionMode::Lossy),
//!     data_ring.clone(),
//!     free_ring.clone(),
//! ).expect("valid group config");
//!
//! let config = ChunkStreamConfig::builder()
//!     .place(|header: &PacketHeader<'_>| {
//!         Some(HeapPlacement {
//!             chunk_id: header.heap_cnt / HEAPS_PER_CHUNK,
//!             heap_index: (header.heap_cnt % HEAPS_PER_CHUNK) as usize,
//!             offset: (header.heap_cnt % HEAPS_PER_CHUNK) as usize * HEAP_PAYLOAD,
//!         })
//!     })
//!     .build()
//!     .expect("valid stream config");
//! let member = group.emplace_member(config, Arc::new(InlineExecutor));
//!
//! // Feed datagrams from your transport of choice:
//! // member.handle_packet(&datagram);
//! # let _ = member;
//!
//! // Consumer side:
//! while let Some(chunk) = data_ring.pop() {
//!     // process chunk.data() where chunk.present(i) is set ...
//!     group.add_free_chunk(chunk);
//! }
//! group.stop();
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                        Consumer Thread                              |
//! |        data_ring.pop() -> process -> add_free_chunk()               |
//! +---------------------------------------------------------------------+
//! |                     Chunk Stream Group                              |
//! |   Sliding window | Manual refcounts | Lossy/Lossless eviction       |
//! +---------------------------------------------------------------------+
//! |                      Member Streams                                 |
//! |   Packet decode | Heap placement | Partial-heap assembly            |
//! +---------------------------------------------------------------------+
//! |                   Transport (out of scope)                          |
//! |   UDP sockets / in-process queues dispatch to handle_packet()       |
//! +---------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`ChunkStreamRingGroup`] | Ring-backed group: the usual entry point |
//! | [`ChunkStreamGroup`] | Group with user-supplied allocate/ready callbacks |
//! | [`ChunkStreamMember`] | One substream; feed it datagrams |
//! | [`Chunk`] | Delivery unit: payload buffer plus per-heap present flags |
//! | [`ChunkRingbuffer`] | Bounded MPMC channel carrying chunks |
//!
//! ## Guarantees
//!
//! - Chunks are delivered through the data ring in strictly ascending
//!   chunk-id order, each exactly once.
//! - `Lossless` eviction blocks the producer until every substream has
//!   released its stake in a chunk; `Lossy` eviction forces the release
//!   and may deliver chunks with missing heaps.
//! - Packet-level errors never propagate: malformed or out-of-window
//!   packets are dropped and counted in [`StreamStats`].

/// Wire-level constants (magic numbers, item ids, defaults).
pub mod config;
/// Serial executors used for deferred per-member work.
pub mod executor;
/// SPEAD packet decoding.
pub mod protocol;
/// The receive pipeline: chunks, window, group, members, rings.
pub mod recv;

pub use config::{
    CTRL_STREAM_STOP, DEFAULT_MAX_CHUNKS, DEFAULT_MAX_HEAPS, DEFAULT_MAX_PACKET_SIZE,
    HEAP_CNT_ID, HEAP_LENGTH_ID, MAGIC, PAYLOAD_LENGTH_ID, PAYLOAD_OFFSET_ID, STREAM_CTRL_ID,
    VERSION,
};
pub use executor::{Executor, InlineExecutor, ThreadExecutor};
pub use protocol::packet::{decode_packet, DecodeError, ItemPointer, PacketHeader};
pub use recv::chunk::{Chunk, CHUNK_ID_NONE};
pub use recv::config::{
    ChunkStreamConfig, ChunkStreamConfigBuilder, ChunkStreamGroupConfig,
    ChunkStreamGroupConfigBuilder, ConfigError, EvictionMode, RingGroupConfigBuilder,
};
pub use recv::group::{ChunkStreamGroup, GroupHooks};
pub use recv::member::{ChunkStreamMember, HeapPlacement};
pub use recv::ring::{ChunkRingPair, ChunkRingbuffer, ChunkStreamRingGroup};
pub use recv::stats::{StreamStats, StreamStatsSnapshot};
