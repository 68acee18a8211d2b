// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The receive pipeline.
//!
//! A [`group::ChunkStreamGroup`] owns a sliding [`window::ChunkWindow`] of
//! [`chunk::Chunk`] slots shared by its [`member::ChunkStreamMember`]
//! substreams. The ring-backed assembly in [`ring`] provisions empty chunks
//! and delivers completed ones to the consumer.

pub mod chunk;
pub mod config;
pub mod group;
pub(crate) mod heap;
pub mod member;
pub mod ring;
pub mod stats;
pub(crate) mod window;
