// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SPEAD packet header decoding.
//!
//! [`decode_packet`] splits a raw datagram into a [`PacketHeader`] that
//! borrows the input: no payload bytes are copied. The decoder is pure and
//! re-entrant, so it can run concurrently on every receive thread.
//!
//! Layout (big-endian):
//!
//! ```text
//! byte 0      magic (0x53)
//! byte 1      version (0x04)
//! byte 2      pointer width minus address width, in bytes
//! byte 3      heap_address_bits / 8
//! bytes 4-5   reserved
//! bytes 6-7   n_items
//! 8..8+8n     item pointers (8 bytes each)
//! remainder   payload
//! ```

use crate::config::{
    CTRL_STREAM_STOP, HEADER_SIZE, HEAP_CNT_ID, HEAP_LENGTH_ID, ITEM_POINTER_SIZE, MAGIC,
    PAYLOAD_LENGTH_ID, PAYLOAD_OFFSET_ID, STREAM_CTRL_ID, VERSION,
};

/// One raw 64-bit item pointer.
///
/// The top bit is the immediate flag, the next `63 - heap_address_bits`
/// bits are the item id, and the bottom `heap_address_bits` bits hold the
/// immediate value (or the address, for non-immediate items).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemPointer(pub u64);

impl ItemPointer {
    /// Whether the pointer carries an immediate value rather than an
    /// address into the heap payload.
    #[inline]
    pub fn is_immediate(self) -> bool {
        (self.0 >> 63) != 0
    }

    /// Item id field.
    #[inline]
    pub fn id(self, heap_address_bits: u8) -> u64 {
        let id_bits = 63 - u32::from(heap_address_bits);
        (self.0 >> heap_address_bits) & ((1u64 << id_bits) - 1)
    }

    /// Immediate value or address field.
    #[inline]
    pub fn value(self, heap_address_bits: u8) -> u64 {
        self.0 & ((1u64 << heap_address_bits) - 1)
    }
}

/// Unpacked packet header borrowing the original datagram.
///
/// The four key fields are always non-negative on the wire; `-1` means the
/// packet did not carry the item.
#[derive(Debug, Clone, PartialEq)]
pub struct PacketHeader<'a> {
    /// Number of bits in addresses/immediates (from the SPEAD flavour).
    pub heap_address_bits: u8,
    /// Number of item pointers in the packet.
    pub n_items: usize,
    /// Heap this packet belongs to.
    pub heap_cnt: i64,
    /// Declared total heap payload length, or -1 if not declared.
    pub heap_length: i64,
    /// Offset of this packet's payload within the heap.
    pub payload_offset: i64,
    /// Length of this packet's payload.
    pub payload_length: i64,
    /// Raw item pointers, big-endian, `n_items * 8` bytes.
    pub pointers: &'a [u8],
    /// This packet's payload slice (exactly `payload_length` bytes).
    pub payload: &'a [u8],
    /// Bytes of the datagram actually consumed (header + payload).
    pub packet_size: usize,
}

impl PacketHeader<'_> {
    /// Iterate the packet's item pointers.
    pub fn item_pointers(&self) -> impl Iterator<Item = ItemPointer> + '_ {
        self.pointers.chunks_exact(ITEM_POINTER_SIZE).map(|raw| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(raw);
            ItemPointer(u64::from_be_bytes(bytes))
        })
    }

    /// Whether the packet carries a stream-control stop item.
    pub fn has_stream_ctrl_stop(&self) -> bool {
        let bits = self.heap_address_bits;
        self.item_pointers().any(|p| {
            p.is_immediate() && p.id(bits) == STREAM_CTRL_ID && p.value(bits) == CTRL_STREAM_STOP
        })
    }
}

/// Why a datagram was rejected by [`decode_packet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Shorter than the fixed 8-byte header.
    TooShort,
    /// Byte 0 is not the SPEAD magic.
    BadMagic(u8),
    /// Byte 1 is not the supported protocol version.
    BadVersion(u8),
    /// Heap address width is zero or leaves no room for item ids.
    BadAddressBits(u8),
    /// Bytes 2 and 3 do not sum to the item pointer size.
    BadPointerWidth(u8),
    /// The declared item pointers do not fit in the datagram.
    Truncated { expected: usize, actual: usize },
    /// A mandatory immediate item is absent.
    MissingItem(&'static str),
    /// The declared payload extent exceeds the datagram.
    PayloadOverrun { declared: usize, available: usize },
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooShort => write!(f, "packet shorter than the SPEAD header"),
            Self::BadMagic(b) => write!(f, "bad magic byte 0x{b:02x}"),
            Self::BadVersion(b) => write!(f, "unsupported version 0x{b:02x}"),
            Self::BadAddressBits(bits) => write!(f, "invalid heap address width {bits} bits"),
            Self::BadPointerWidth(b) => write!(f, "inconsistent item pointer width byte {b}"),
            Self::Truncated { expected, actual } => {
                write!(f, "item pointers need {expected} bytes, packet has {actual}")
            }
            Self::MissingItem(name) => write!(f, "mandatory item {name} missing"),
            Self::PayloadOverrun {
                declared,
                available,
            } => write!(f, "payload length {declared} exceeds {available} available bytes"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Split out the header fields of one datagram.
///
/// Returns a header whose `payload` slice covers exactly the declared
/// payload and whose `packet_size` is the number of bytes consumed
/// (trailing slack in the datagram is ignored, matching coalesced
/// receive buffers).
///
/// # Errors
///
/// Any structural defect rejects the whole packet; see [`DecodeError`].
/// Callers on the receive path count rejects in their stream statistics
/// rather than propagating them.
pub fn decode_packet(raw: &[u8]) -> Result<PacketHeader<'_>, DecodeError> {
    if raw.len() < HEADER_SIZE {
        return Err(DecodeError::TooShort);
    }
    if raw[0] != MAGIC {
        return Err(DecodeError::BadMagic(raw[0]));
    }
    if raw[1] != VERSION {
        return Err(DecodeError::BadVersion(raw[1]));
    }
    let addr_bytes = raw[3];
    if addr_bytes == 0 || usize::from(addr_bytes) >= ITEM_POINTER_SIZE {
        return Err(DecodeError::BadAddressBits(addr_bytes.wrapping_mul(8)));
    }
    if usize::from(raw[2]) != ITEM_POINTER_SIZE - usize::from(addr_bytes) {
        return Err(DecodeError::BadPointerWidth(raw[2]));
    }
    let heap_address_bits = addr_bytes * 8;

    let n_items = usize::from(u16::from_be_bytes([raw[6], raw[7]]));
    let header_len = HEADER_SIZE + n_items * ITEM_POINTER_SIZE;
    if header_len > raw.len() {
        return Err(DecodeError::Truncated {
            expected: header_len,
            actual: raw.len(),
        });
    }

    let mut heap_cnt: i64 = -1;
    let mut heap_length: i64 = -1;
    let mut payload_offset: i64 = -1;
    let mut payload_length: i64 = -1;

    for raw_ptr in raw[HEADER_SIZE..header_len].chunks_exact(ITEM_POINTER_SIZE) {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(raw_ptr);
        let pointer = ItemPointer(u64::from_be_bytes(bytes));
        // The routing items are only meaningful as immediates; addressed
        // variants are left to higher layers.
        if !pointer.is_immediate() {
            continue;
        }
        let value = pointer.value(heap_address_bits) as i64;
        match pointer.id(heap_address_bits) {
            HEAP_CNT_ID => heap_cnt = value,
            HEAP_LENGTH_ID => heap_length = value,
            PAYLOAD_LENGTH_ID => payload_length = value,
            PAYLOAD_OFFSET_ID => payload_offset = value,
            _ => {}
        }
    }

    if heap_cnt < 0 {
        return Err(DecodeError::MissingItem("heap_cnt"));
    }
    if payload_offset < 0 {
        return Err(DecodeError::MissingItem("payload_offset"));
    }
    if payload_length < 0 {
        return Err(DecodeError::MissingItem("payload_length"));
    }

    let available = raw.len() - header_len;
    let declared = payload_length as usize;
    if declared > available {
        return Err(DecodeError::PayloadOverrun {
            declared,
            available,
        });
    }

    Ok(PacketHeader {
        heap_address_bits,
        n_items,
        heap_cnt,
        heap_length,
        payload_offset,
        payload_length,
        pointers: &raw[HEADER_SIZE..header_len],
        payload: &raw[header_len..header_len + declared],
        packet_size: header_len + declared,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Heap address width used by the common SPEAD-64-40 flavour.
    const ADDR_BITS: u8 = 40;

    fn immediate(id: u64, value: u64) -> u64 {
        (1u64 << 63) | (id << ADDR_BITS) | value
    }

    fn build_packet(items: &[u64], payload: &[u8]) -> Vec<u8> {
        let mut raw = vec![
            MAGIC,
            VERSION,
            (ITEM_POINTER_SIZE - usize::from(ADDR_BITS / 8)) as u8,
            ADDR_BITS / 8,
            0,
            0,
        ];
        raw.extend_from_slice(&(items.len() as u16).to_be_bytes());
        for item in items {
            raw.extend_from_slice(&item.to_be_bytes());
        }
        raw.extend_from_slice(payload);
        raw
    }

    fn routing_items(heap_cnt: u64, heap_length: u64, offset: u64, length: u64) -> Vec<u64> {
        vec![
            immediate(HEAP_CNT_ID, heap_cnt),
            immediate(HEAP_LENGTH_ID, heap_length),
            immediate(PAYLOAD_OFFSET_ID, offset),
            immediate(PAYLOAD_LENGTH_ID, length),
        ]
    }

    #[test]
    fn test_decode_basic() {
        let payload = [0xAAu8, 0xBB, 0xCC, 0xDD];
        let raw = build_packet(&routing_items(7, 4, 0, 4), &payload);
        let header = decode_packet(&raw).expect("well-formed packet should decode");
        assert_eq!(header.heap_address_bits, ADDR_BITS);
        assert_eq!(header.n_items, 4);
        assert_eq!(header.heap_cnt, 7);
        assert_eq!(header.heap_length, 4);
        assert_eq!(header.payload_offset, 0);
        assert_eq!(header.payload_length, 4);
        assert_eq!(header.payload, &payload);
        assert_eq!(header.packet_size, raw.len());
    }

    #[test]
    fn test_decode_ignores_trailing_slack() {
        let mut raw = build_packet(&routing_items(1, 2, 0, 2), &[0x11, 0x22]);
        let consumed = raw.len();
        raw.extend_from_slice(&[0u8; 16]); // coalesced receive slack
        let header = decode_packet(&raw).expect("packet with slack should decode");
        assert_eq!(header.packet_size, consumed);
        assert_eq!(header.payload, &[0x11, 0x22]);
    }

    #[test]
    fn test_decode_bad_magic() {
        let mut raw = build_packet(&routing_items(0, 1, 0, 1), &[0]);
        raw[0] = 0x54;
        assert_eq!(decode_packet(&raw), Err(DecodeError::BadMagic(0x54)));
    }

    #[test]
    fn test_decode_bad_version() {
        let mut raw = build_packet(&routing_items(0, 1, 0, 1), &[0]);
        raw[1] = 0x03;
        assert_eq!(decode_packet(&raw), Err(DecodeError::BadVersion(0x03)));
    }

    #[test]
    fn test_decode_bad_widths() {
        let mut raw = build_packet(&routing_items(0, 1, 0, 1), &[0]);
        raw[3] = 0;
        assert_eq!(decode_packet(&raw), Err(DecodeError::BadAddressBits(0)));

        let mut raw = build_packet(&routing_items(0, 1, 0, 1), &[0]);
        raw[2] = 4; // 4 + 5 != 8
        assert_eq!(decode_packet(&raw), Err(DecodeError::BadPointerWidth(4)));
    }

    #[test]
    fn test_decode_truncated_pointers() {
        let raw = build_packet(&routing_items(0, 1, 0, 1), &[0]);
        // Claim one more item than the packet carries.
        let mut raw = raw[..HEADER_SIZE + 2 * ITEM_POINTER_SIZE].to_vec();
        raw[7] = 5;
        assert!(matches!(
            decode_packet(&raw),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn test_decode_missing_required_items() {
        let items = vec![
            immediate(HEAP_LENGTH_ID, 4),
            immediate(PAYLOAD_OFFSET_ID, 0),
            immediate(PAYLOAD_LENGTH_ID, 0),
        ];
        let raw = build_packet(&items, &[]);
        assert_eq!(
            decode_packet(&raw),
            Err(DecodeError::MissingItem("heap_cnt"))
        );

        // A non-immediate heap_cnt does not satisfy the requirement.
        let items = vec![
            (HEAP_CNT_ID << ADDR_BITS) | 3, // immediate flag clear
            immediate(PAYLOAD_OFFSET_ID, 0),
            immediate(PAYLOAD_LENGTH_ID, 0),
        ];
        let raw = build_packet(&items, &[]);
        assert_eq!(
            decode_packet(&raw),
            Err(DecodeError::MissingItem("heap_cnt"))
        );
    }

    #[test]
    fn test_decode_payload_overrun() {
        let raw = build_packet(&routing_items(0, 8, 0, 8), &[0u8; 4]);
        assert_eq!(
            decode_packet(&raw),
            Err(DecodeError::PayloadOverrun {
                declared: 8,
                available: 4
            })
        );
    }

    #[test]
    fn test_decode_heap_length_optional() {
        let items = vec![
            immediate(HEAP_CNT_ID, 9),
            immediate(PAYLOAD_OFFSET_ID, 0),
            immediate(PAYLOAD_LENGTH_ID, 2),
        ];
        let raw = build_packet(&items, &[1, 2]);
        let header = decode_packet(&raw).expect("heap_length is optional");
        assert_eq!(header.heap_length, -1);
    }

    #[test]
    fn test_stream_ctrl_stop_detection() {
        let mut items = routing_items(3, 1, 0, 0);
        items.push(immediate(STREAM_CTRL_ID, CTRL_STREAM_STOP));
        let raw = build_packet(&items, &[]);
        let header = decode_packet(&raw).expect("stop packet should decode");
        assert!(header.has_stream_ctrl_stop());

        // A stream_ctrl item with a different value is not a stop.
        let mut items = routing_items(3, 1, 0, 0);
        items.push(immediate(STREAM_CTRL_ID, 0x1));
        let raw = build_packet(&items, &[]);
        let header = decode_packet(&raw).expect("ctrl packet should decode");
        assert!(!header.has_stream_ctrl_stop());
    }

    #[test]
    fn test_item_pointer_fields() {
        let p = ItemPointer(immediate(HEAP_CNT_ID, 0x1234));
        assert!(p.is_immediate());
        assert_eq!(p.id(ADDR_BITS), HEAP_CNT_ID);
        assert_eq!(p.value(ADDR_BITS), 0x1234);

        let addressed = ItemPointer((0x42u64 << ADDR_BITS) | 0x9999);
        assert!(!addressed.is_immediate());
        assert_eq!(addressed.id(ADDR_BITS), 0x42);
        assert_eq!(addressed.value(ADDR_BITS), 0x9999);
    }
}
