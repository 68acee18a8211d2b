// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SPEAD wire-format handling.
//!
//! Only the decoding needed to route heaps is implemented here: item
//! descriptors and the full item model live above this library.

pub mod packet;

pub use packet::{decode_packet, DecodeError, ItemPointer, PacketHeader};
