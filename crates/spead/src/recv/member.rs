// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Member stream: one substream of a chunk stream group.
//!
//! A member decodes datagrams, maps each heap to a chunk slot through the
//! user place callback, copies payload into the shared chunk buffers, and
//! tracks partially received heaps until they complete or are abandoned.
//!
//! Feed datagrams through [`ChunkStreamMember::handle_packet`] from your
//! transport's dispatch callback. Dispatch for one member is expected to
//! be serialised (one packet at a time); different members may run
//! concurrently on different threads.

use super::config::ChunkStreamConfig;
use super::group::{GetChunkOutcome, GroupCore};
use super::heap::{PartialHeap, PayloadOutcome};
use super::stats::StreamStats;
use crate::executor::Executor;
use crate::protocol::packet::{decode_packet, PacketHeader};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Where a heap lands: produced by the user place callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapPlacement {
    /// Chunk the heap belongs to. Negative values discard the heap.
    pub chunk_id: i64,
    /// Index of the heap's present flag within the chunk.
    pub heap_index: usize,
    /// Byte offset of the heap's payload within the chunk buffer.
    pub offset: usize,
}

struct MemberState {
    /// In-flight heaps keyed by heap id.
    heaps: HashMap<i64, PartialHeap>,
}

enum HeapProgress {
    Continue,
    Complete,
}

/// One substream within a [`ChunkStreamGroup`](super::group::ChunkStreamGroup).
pub struct ChunkStreamMember {
    id: u64,
    config: ChunkStreamConfig,
    core: Arc<GroupCore>,
    executor: Arc<dyn Executor>,
    stats: StreamStats,
    stopped: AtomicBool,
    state: Mutex<MemberState>,
    self_ref: Weak<ChunkStreamMember>,
}

impl ChunkStreamMember {
    pub(crate) fn new(
        id: u64,
        config: ChunkStreamConfig,
        executor: Arc<dyn Executor>,
        core: Arc<GroupCore>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            id,
            config,
            core,
            executor,
            stats: StreamStats::new(),
            stopped: AtomicBool::new(false),
            state: Mutex::new(MemberState {
                heaps: HashMap::new(),
            }),
            self_ref: self_ref.clone(),
        })
    }

    /// Member id within its group (also recorded on touched chunks).
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Batch statistics for this substream.
    #[inline]
    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    /// Whether the member has stopped (user call or stream-control item).
    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Process one datagram.
    ///
    /// Never fails: malformed, oversized, duplicate or out-of-window input
    /// is dropped and counted in [`stats`](Self::stats). Packets arriving
    /// after the member stopped are dropped silently.
    pub fn handle_packet(&self, raw: &[u8]) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        StreamStats::bump(&self.stats.packets_received);
        if raw.len() > self.config.max_packet_size {
            log::debug!(
                "[Member {}] {} byte packet exceeds the {} byte bound",
                self.id,
                raw.len(),
                self.config.max_packet_size
            );
            StreamStats::bump(&self.stats.packets_rejected);
            return;
        }
        let header = match decode_packet(raw) {
            Ok(header) => header,
            Err(err) => {
                log::debug!("[Member {}] packet rejected: {err}", self.id);
                StreamStats::bump(&self.stats.packets_rejected);
                return;
            }
        };
        if header.has_stream_ctrl_stop() {
            StreamStats::bump(&self.stats.stop_items);
            if self.config.stop_on_stop_item {
                log::debug!("[Member {}] stream control stop received", self.id);
                self.finish_stop();
            }
            return;
        }
        if header.heap_length >= 0 && header.heap_length as u64 > self.config.max_heap_size as u64
        {
            log::debug!(
                "[Member {}] heap {} declares {} bytes, above the permitted size",
                self.id,
                header.heap_cnt,
                header.heap_length
            );
            StreamStats::bump(&self.stats.packets_rejected);
            return;
        }
        self.route_payload(&header);
    }

    /// Heap-table lookup and payload routing for one decoded packet.
    fn route_payload(&self, header: &PacketHeader<'_>) {
        let heap_id = header.heap_cnt;

        // Fast path: the heap is already being assembled.
        {
            let mut state = self.state.lock();
            if let Some(entry) = state.heaps.get_mut(&heap_id) {
                match self.copy_into(entry, header) {
                    HeapProgress::Continue => return,
                    HeapProgress::Complete => {
                        let entry = state.heaps.remove(&heap_id);
                        drop(state);
                        if let Some(entry) = entry {
                            self.finish_heap(entry);
                        }
                        return;
                    }
                }
            }
        }

        // Slow path: first packet of a new heap.
        let Some(placement) = (self.config.place)(header) else {
            StreamStats::bump(&self.stats.heaps_lost);
            return;
        };
        if placement.chunk_id < 0 {
            StreamStats::bump(&self.stats.heaps_lost);
            return;
        }

        // Release our own stakes in slots the window is about to leave;
        // the group never reaches into member state itself, so a lossless
        // advance would otherwise wait on us forever.
        let target = placement.chunk_id - self.core.max_chunks() as i64 + 1;
        if target > 0 {
            self.flush_until(target);
        }

        let chunk = match self
            .core
            .get_chunk(placement.chunk_id, self.id, &self.stats)
        {
            GetChunkOutcome::Granted(chunk) => chunk,
            GetChunkOutcome::TooOld => {
                log::debug!(
                    "[Member {}] heap {} targets chunk {} below the window",
                    self.id,
                    heap_id,
                    placement.chunk_id
                );
                StreamStats::bump(&self.stats.heaps_too_old);
                return;
            }
            GetChunkOutcome::AllocateFailed => {
                StreamStats::bump(&self.stats.chunks_lost);
                StreamStats::bump(&self.stats.heaps_lost);
                return;
            }
        };
        if placement.heap_index >= chunk.heap_count() {
            log::debug!(
                "[Member {}] placement index {} outside chunk with {} heaps",
                self.id,
                placement.heap_index,
                chunk.heap_count()
            );
            StreamStats::bump(&self.stats.heaps_lost);
            self.core.release_chunk(&chunk, &self.stats);
            return;
        }
        if chunk.present(placement.heap_index) {
            // The heap already completed in this chunk occupancy; this is
            // a straggling duplicate.
            StreamStats::bump(&self.stats.duplicate_payloads);
            self.core.release_chunk(&chunk, &self.stats);
            return;
        }

        let mut entry = PartialHeap::new(
            heap_id,
            placement.chunk_id,
            placement.heap_index,
            placement.offset,
            header.heap_length,
            chunk,
        );
        if let HeapProgress::Complete = self.copy_into(&mut entry, header) {
            self.finish_heap(entry);
            return;
        }

        // Park the entry, displacing the oldest heap if the table is full.
        let displaced = {
            let mut state = self.state.lock();
            let displaced = if state.heaps.len() >= self.config.max_heaps {
                Self::displace_oldest(&mut state)
            } else {
                None
            };
            state.heaps.insert(heap_id, entry);
            displaced
        };
        if let Some(old) = displaced {
            log::debug!(
                "[Member {}] heap {} abandoned under table pressure",
                self.id,
                old.heap_id
            );
            StreamStats::bump(&self.stats.heaps_flushed);
            self.core.release_chunk(&old.chunk, &self.stats);
        }

        if self.stopped.load(Ordering::Acquire) {
            // Raced with a concurrent stop; make sure nothing stays
            // parked holding a chunk stake.
            self.flush_until(i64::MAX);
        }
    }

    /// Validate, record and copy one packet's payload into the heap's
    /// chunk. Counting happens here; the caller only acts on completion.
    fn copy_into(&self, entry: &mut PartialHeap, header: &PacketHeader<'_>) -> HeapProgress {
        let offset = header.payload_offset as u64;
        let length = header.payload_length as u64;
        let destination = entry.base_offset as u64 + offset;
        if destination + length > entry.chunk.data_size() as u64 {
            log::debug!(
                "[Member {}] heap {} payload range overruns the chunk buffer",
                self.id,
                entry.heap_id
            );
            StreamStats::bump(&self.stats.packets_rejected);
            return HeapProgress::Continue;
        }
        match entry.record_payload(offset, length, header.heap_length) {
            PayloadOutcome::Duplicate => {
                StreamStats::bump(&self.stats.duplicate_payloads);
                HeapProgress::Continue
            }
            PayloadOutcome::OutOfBounds => {
                log::debug!(
                    "[Member {}] payload at {offset}+{length} outside heap {} of length {}",
                    self.id,
                    entry.heap_id,
                    entry.heap_length()
                );
                StreamStats::bump(&self.stats.packets_rejected);
                HeapProgress::Continue
            }
            outcome => {
                if entry.chunk.write_payload(destination as usize, header.payload) {
                    StreamStats::add(&self.stats.bytes_copied, length);
                }
                if let PayloadOutcome::Completed = outcome {
                    HeapProgress::Complete
                } else {
                    HeapProgress::Continue
                }
            }
        }
    }

    /// Terminal transition: mark the heap present and drop its stake.
    fn finish_heap(&self, entry: PartialHeap) {
        entry.chunk.set_present(entry.heap_index);
        StreamStats::bump(&self.stats.heaps_completed);
        log::trace!(
            "[Member {}] heap {} complete in chunk {}",
            self.id,
            entry.heap_id,
            entry.chunk_id
        );
        self.core.release_chunk(&entry.chunk, &self.stats);
    }

    /// Drop the oldest in-flight heap (smallest chunk id, then heap id)
    /// to make room in the table.
    fn displace_oldest(state: &mut MemberState) -> Option<PartialHeap> {
        let key = state
            .heaps
            .iter()
            .min_by_key(|(&id, entry)| (entry.chunk_id, id))
            .map(|(&id, _)| id)?;
        state.heaps.remove(&key)
    }

    /// Release every partial heap assigned to a chunk with an id strictly
    /// below `chunk_id`, without marking anything present.
    pub(crate) fn flush_until(&self, chunk_id: i64) {
        let drained: Vec<PartialHeap> = {
            let mut state = self.state.lock();
            let ids: Vec<i64> = state
                .heaps
                .iter()
                .filter(|(_, entry)| entry.chunk_id < chunk_id)
                .map(|(&id, _)| id)
                .collect();
            ids.iter()
                .filter_map(|id| state.heaps.remove(id))
                .collect()
        };
        for entry in drained {
            log::debug!(
                "[Member {}] abandoning heap {} in flushed chunk {}",
                self.id,
                entry.heap_id,
                entry.chunk_id
            );
            StreamStats::bump(&self.stats.heaps_flushed);
            self.core.release_chunk(&entry.chunk, &self.stats);
        }
    }

    /// Schedule [`flush_until`](Self::flush_until) on the member's serial
    /// executor. Returns immediately; safe to call from any thread.
    pub fn async_flush_until(&self, chunk_id: i64) {
        let member = self.self_ref.clone();
        self.executor.post(Box::new(move || {
            if let Some(member) = member.upgrade() {
                member.flush_until(chunk_id);
            }
        }));
    }

    /// Stop this member: abandon its partial heaps and notify the group.
    /// Packets arriving afterwards are dropped silently. Idempotent.
    pub fn stop(&self) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        // Fires first so ring-backed groups unblock any producer stuck on
        // a full data ring before we wait on anything.
        self.core.hooks().stream_pre_stop(self);
        self.finish_stop();
    }

    /// Common stop tail for user stops and stream-control stop items.
    fn finish_stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.drain_executor();
        self.flush_until(i64::MAX);
        self.core.stream_stop_received(self);
    }

    /// Wait for flush tasks already posted to the executor to finish, so
    /// no release runs after the group considers this member drained.
    fn drain_executor(&self) {
        let (barrier_tx, barrier_rx) = crossbeam::channel::bounded::<()>(1);
        self.executor.post(Box::new(move || {
            let _ = barrier_tx.send(());
        }));
        let _ = barrier_rx.recv();
    }
}

impl std::fmt::Debug for ChunkStreamMember {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkStreamMember")
            .field("id", &self.id)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        HEAP_CNT_ID, HEAP_LENGTH_ID, ITEM_POINTER_SIZE, MAGIC, PAYLOAD_LENGTH_ID,
        PAYLOAD_OFFSET_ID, VERSION,
    };
    use crate::executor::InlineExecutor;
    use crate::recv::chunk::Chunk;
    use crate::recv::config::{ChunkStreamGroupConfig, EvictionMode};
    use crate::recv::group::ChunkStreamGroup;
    use std::sync::Mutex as StdMutex;

    const ADDR_BITS: u8 = 40;
    const HEAPS_PER_CHUNK: i64 = 2;
    const HEAP_PAYLOAD: usize = 8;

    fn immediate(id: u64, value: u64) -> u64 {
        (1u64 << 63) | (id << ADDR_BITS) | value
    }

    fn packet(heap_cnt: i64, payload_offset: usize, payload: &[u8], heap_length: usize) -> Vec<u8> {
        let items = [
            immediate(HEAP_CNT_ID, heap_cnt as u64),
            immediate(HEAP_LENGTH_ID, heap_length as u64),
            immediate(PAYLOAD_OFFSET_ID, payload_offset as u64),
            immediate(PAYLOAD_LENGTH_ID, payload.len() as u64),
        ];
        let mut raw = vec![
            MAGIC,
            VERSION,
            (ITEM_POINTER_SIZE - usize::from(ADDR_BITS / 8)) as u8,
            ADDR_BITS / 8,
            0,
            0,
            0,
            items.len() as u8,
        ];
        for item in items {
            raw.extend_from_slice(&item.to_be_bytes());
        }
        raw.extend_from_slice(payload);
        raw
    }

    fn test_group(
        max_chunks: usize,
        mode: EvictionMode,
    ) -> (ChunkStreamGroup, Arc<StdMutex<Vec<Arc<Chunk>>>>) {
        let delivered = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&delivered);
        let config = ChunkStreamGroupConfig::builder()
            .max_chunks(max_chunks)
            .eviction_mode(mode)
            .allocate(|_, _| {
                Some(Arc::new(Chunk::new(
                    HEAPS_PER_CHUNK as usize * HEAP_PAYLOAD,
                    HEAPS_PER_CHUNK as usize,
                )))
            })
            .ready(move |chunk, _| sink.lock().expect("sink lock").push(chunk))
            .build()
            .expect("valid config");
        (ChunkStreamGroup::new(config), delivered)
    }

    fn plain_place(header: &PacketHeader<'_>) -> Option<HeapPlacement> {
        Some(HeapPlacement {
            chunk_id: header.heap_cnt / HEAPS_PER_CHUNK,
            heap_index: (header.heap_cnt % HEAPS_PER_CHUNK) as usize,
            offset: (header.heap_cnt % HEAPS_PER_CHUNK) as usize * HEAP_PAYLOAD,
        })
    }

    fn member_config() -> ChunkStreamConfig {
        ChunkStreamConfig::builder()
            .place(plain_place)
            .build()
            .expect("valid stream config")
    }

    #[test]
    fn test_single_packet_heap_lands_in_chunk() {
        let (mut group, delivered) = test_group(2, EvictionMode::Lossy);
        let member = group.emplace_member(member_config(), Arc::new(InlineExecutor));

        member.handle_packet(&packet(0, 0, &[1; HEAP_PAYLOAD], HEAP_PAYLOAD));
        member.handle_packet(&packet(1, 0, &[2; HEAP_PAYLOAD], HEAP_PAYLOAD));
        assert_eq!(member.stats().snapshot().heaps_completed, 2);

        group.stop();
        let delivered = delivered.lock().expect("lock");
        assert_eq!(delivered.len(), 1);
        let chunk = &delivered[0];
        assert_eq!(chunk.chunk_id(), 0);
        assert_eq!(chunk.present_snapshot(), vec![1, 1]);
        assert_eq!(&chunk.data()[..HEAP_PAYLOAD], &[1; HEAP_PAYLOAD]);
        assert_eq!(&chunk.data()[HEAP_PAYLOAD..], &[2; HEAP_PAYLOAD]);
    }

    #[test]
    fn test_multi_packet_heap_assembly() {
        let (mut group, delivered) = test_group(2, EvictionMode::Lossy);
        let member = group.emplace_member(member_config(), Arc::new(InlineExecutor));

        member.handle_packet(&packet(0, 0, &[7; 4], HEAP_PAYLOAD));
        assert_eq!(member.stats().snapshot().heaps_completed, 0);
        member.handle_packet(&packet(0, 4, &[8; 4], HEAP_PAYLOAD));
        assert_eq!(member.stats().snapshot().heaps_completed, 1);
        // A straggling duplicate of the first packet is dropped.
        member.handle_packet(&packet(0, 0, &[9; 4], HEAP_PAYLOAD));
        assert_eq!(member.stats().snapshot().duplicate_payloads, 1);

        group.stop();
        let delivered = delivered.lock().expect("lock");
        assert_eq!(delivered[0].present_snapshot(), vec![1, 0]);
        assert_eq!(&delivered[0].data()[..4], &[7; 4]);
        assert_eq!(&delivered[0].data()[4..8], &[8; 4]);
    }

    #[test]
    fn test_malformed_packet_only_counted() {
        let (mut group, delivered) = test_group(2, EvictionMode::Lossy);
        let member = group.emplace_member(member_config(), Arc::new(InlineExecutor));

        let mut bad = packet(0, 0, &[1; HEAP_PAYLOAD], HEAP_PAYLOAD);
        bad[0] = 0x00;
        member.handle_packet(&bad);

        let snap = member.stats().snapshot();
        assert_eq!(snap.packets_received, 1);
        assert_eq!(snap.packets_rejected, 1);
        group.stop();
        assert!(delivered.lock().expect("lock").is_empty());
    }

    #[test]
    fn test_oversized_packet_rejected() {
        let (mut group, _) = test_group(2, EvictionMode::Lossy);
        let config = ChunkStreamConfig::builder()
            .place(plain_place)
            .max_packet_size(16)
            .build()
            .expect("valid stream config");
        let member = group.emplace_member(config, Arc::new(InlineExecutor));

        member.handle_packet(&packet(0, 0, &[1; HEAP_PAYLOAD], HEAP_PAYLOAD));
        assert_eq!(member.stats().snapshot().packets_rejected, 1);
    }

    #[test]
    fn test_oversized_heap_rejected() {
        let (mut group, _) = test_group(2, EvictionMode::Lossy);
        let config = ChunkStreamConfig::builder()
            .place(plain_place)
            .max_heap_size(4)
            .build()
            .expect("valid stream config");
        let member = group.emplace_member(config, Arc::new(InlineExecutor));

        member.handle_packet(&packet(0, 0, &[1; HEAP_PAYLOAD], HEAP_PAYLOAD));
        assert_eq!(member.stats().snapshot().packets_rejected, 1);
        assert_eq!(member.stats().snapshot().heaps_completed, 0);
    }

    #[test]
    fn test_place_decline_drops_heap() {
        let (mut group, _) = test_group(2, EvictionMode::Lossy);
        let config = ChunkStreamConfig::builder()
            .place(|header: &PacketHeader<'_>| {
                if header.heap_cnt == 0 {
                    None
                } else {
                    plain_place(header)
                }
            })
            .build()
            .expect("valid stream config");
        let member = group.emplace_member(config, Arc::new(InlineExecutor));

        member.handle_packet(&packet(0, 0, &[1; HEAP_PAYLOAD], HEAP_PAYLOAD));
        member.handle_packet(&packet(1, 0, &[2; HEAP_PAYLOAD], HEAP_PAYLOAD));
        let snap = member.stats().snapshot();
        assert_eq!(snap.heaps_lost, 1);
        assert_eq!(snap.heaps_completed, 1);
    }

    #[test]
    fn test_table_pressure_displaces_oldest_heap() {
        let (mut group, _) = test_group(4, EvictionMode::Lossy);
        let config = ChunkStreamConfig::builder()
            .place(plain_place)
            .max_heaps(2)
            .build()
            .expect("valid stream config");
        let member = group.emplace_member(config, Arc::new(InlineExecutor));

        // Three half-finished heaps; the first (oldest chunk) gives way.
        member.handle_packet(&packet(0, 0, &[1; 4], HEAP_PAYLOAD));
        member.handle_packet(&packet(2, 0, &[2; 4], HEAP_PAYLOAD));
        member.handle_packet(&packet(4, 0, &[3; 4], HEAP_PAYLOAD));
        let snap = member.stats().snapshot();
        assert_eq!(snap.heaps_flushed, 1);

        // Completing the displaced heap now starts a fresh entry.
        member.handle_packet(&packet(0, 4, &[1; 4], HEAP_PAYLOAD));
        assert_eq!(member.stats().snapshot().heaps_completed, 0);
    }

    #[test]
    fn test_too_old_heap_counted() {
        let (mut group, _) = test_group(1, EvictionMode::Lossy);
        let member = group.emplace_member(member_config(), Arc::new(InlineExecutor));

        member.handle_packet(&packet(2, 0, &[1; HEAP_PAYLOAD], HEAP_PAYLOAD)); // chunk 1
        member.handle_packet(&packet(4, 0, &[1; HEAP_PAYLOAD], HEAP_PAYLOAD)); // chunk 2
        member.handle_packet(&packet(0, 0, &[1; HEAP_PAYLOAD], HEAP_PAYLOAD)); // chunk 0: gone
        assert_eq!(member.stats().snapshot().heaps_too_old, 1);
    }

    #[test]
    fn test_packets_after_stop_dropped_silently() {
        let (mut group, _) = test_group(2, EvictionMode::Lossy);
        let member = group.emplace_member(member_config(), Arc::new(InlineExecutor));

        member.stop();
        member.handle_packet(&packet(0, 0, &[1; HEAP_PAYLOAD], HEAP_PAYLOAD));
        assert_eq!(member.stats().snapshot().packets_received, 0);
        group.stop();
    }
}
