//! Wire header
//!
//! Every active message the core issues carries this 16-byte header ahead of (or packed beside,
//! for AM-SHORT) its payload. The layout is fixed so that a dispatcher on a differently-built
//! peer (different compiler, different endianness in principle, though none of our transports
//! cross architectures in practice) still agrees on field boundaries.

/// The fixed 16-byte header carried by every active message.
///
/// `group_id` is little-endian on the wire regardless of host endianness; the other fields are
/// single bytes or are interpreted host-endian since they never cross a byte-order boundary in
/// any transport this core targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct WireHeader {
    /// Identifies the group this message belongs to; looked up in the context's by-id table.
    pub group_id: u32,
    /// Identifies the operation within the group; also the slot ring index modulo `P`.
    pub coll_id: u8,
    /// Monotonic step index within the operation.
    pub step_idx: u8,
    /// Reserved, always zero.
    pub reserved: u16,
    /// Byte offset into the receiver's buffer where this message's payload belongs.
    pub remote_offset: u64,
}

const WIRE_HEADER_LEN: usize = 16;

impl WireHeader {
    /// Encodes the header into its 16-byte wire representation.
    pub fn encode(&self) -> [u8; WIRE_HEADER_LEN] {
        let mut buf = [0u8; WIRE_HEADER_LEN];
        buf[0..4].copy_from_slice(&self.group_id.to_le_bytes());
        buf[4] = self.coll_id;
        buf[5] = self.step_idx;
        buf[6..8].copy_from_slice(&0u16.to_le_bytes());
        buf[8..16].copy_from_slice(&self.remote_offset.to_le_bytes());
        buf
    }

    /// Decodes a header from its 16-byte wire representation.
    pub fn decode(buf: &[u8; WIRE_HEADER_LEN]) -> Self {
        WireHeader {
            group_id: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            coll_id: buf[4],
            step_idx: buf[5],
            reserved: 0,
            remote_offset: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_wire_bytes() {
        let header = WireHeader {
            group_id: 0xdead_beef,
            coll_id: 7,
            step_idx: 2,
            reserved: 0,
            remote_offset: 0x1122_3344_5566_7788,
        };
        let encoded = header.encode();
        assert_eq!(encoded.len(), WIRE_HEADER_LEN);
        let decoded = WireHeader::decode(&encoded);
        assert_eq!(decoded, header);
    }

    #[test]
    fn group_id_is_little_endian_on_the_wire() {
        let header = WireHeader {
            group_id: 1,
            coll_id: 0,
            step_idx: 0,
            reserved: 0,
            remote_offset: 0,
        };
        assert_eq!(&header.encode()[0..4], &[1, 0, 0, 0]);
    }
}
