//! Packer selection and non-contiguous pack/unpack bracketing
//!
//! For AM-BCOPY steps the step builder chooses three pack callbacks up front — full fragment,
//! partial last fragment, single-message — so the send path never has to branch on which one
//! applies; the [`SendPlan`](crate::step::SendPlan) variant already encodes which callback set
//! is active. For non-contiguous send/receive datatypes, a pre-step pack and/or a post-step
//! unpack is inserted around the step itself (§4.3 item 1); those are modeled here as a
//! `DatatypeIterator` rather than as pack callbacks, since they run outside the transport send
//! path entirely.

/// One of the three pack callback shapes an AM-BCOPY step may need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackKind {
    /// Copies exactly `fragment_length` bytes at the iterator's current offset.
    FullFragment,
    /// Copies the remaining tail, shorter than `fragment_length`.
    PartialLastFragment,
    /// Copies the entire (unfragmented) buffer in one call.
    SingleMessage,
}

impl PackKind {
    /// Selects the pack kind for fragment `idx` of `fragments_total` given `fragment_length`
    /// and `buffer_length`.
    pub fn for_fragment(idx: u32, fragments_total: u32, fragment_length: usize, buffer_length: usize) -> PackKind {
        if fragments_total <= 1 {
            return PackKind::SingleMessage;
        }
        let is_last = idx + 1 == fragments_total;
        let remaining = buffer_length.saturating_sub(idx as usize * fragment_length);
        if is_last && remaining < fragment_length {
            PackKind::PartialLastFragment
        } else {
            PackKind::FullFragment
        }
    }
}

/// Packs `count` bytes of `src` at `offset` into `dst`, returning the number of bytes written.
/// This is the bcopy pack callback's actual body; `kind` only determines how many bytes the
/// caller asked for ahead of time, not how the copy itself works.
pub fn pack(kind: PackKind, src: &[u8], offset: usize, fragment_length: usize, dst: &mut [u8]) -> usize {
    let len = match kind {
        PackKind::FullFragment => fragment_length,
        PackKind::PartialLastFragment => src.len().saturating_sub(offset),
        PackKind::SingleMessage => src.len(),
    };
    let len = len.min(dst.len()).min(src.len().saturating_sub(offset));
    dst[..len].copy_from_slice(&src[offset..offset + len]);
    len
}

/// Per-direction datatype iterator state for a non-contiguous send or receive side. Walking
/// this state is how the pre-step pack / post-step unpack bracketing (§4.3 item 1) produces (or
/// consumes) a flat byte buffer that the rest of the step machinery can treat as contiguous.
#[derive(Debug, Clone)]
pub struct DatatypeIterator {
    /// Byte extents of each non-contiguous block, in type order.
    pub blocks: Vec<(usize, usize)>,
    pub cursor: usize,
}

impl DatatypeIterator {
    pub fn new(blocks: Vec<(usize, usize)>) -> Self {
        DatatypeIterator { blocks, cursor: 0 }
    }

    /// Packs every block of `src` (the user's non-contiguous buffer, addressed by the blocks'
    /// own offsets) into a flat `dst`.
    pub fn pack_all(&self, src: &[u8], dst: &mut Vec<u8>) {
        dst.clear();
        for &(offset, len) in &self.blocks {
            dst.extend_from_slice(&src[offset..offset + len]);
        }
    }

    /// Unpacks a flat `src` back out into the non-contiguous blocks of `dst`.
    pub fn unpack_all(&self, src: &[u8], dst: &mut [u8]) {
        let mut cursor = 0;
        for &(offset, len) in &self.blocks {
            dst[offset..offset + len].copy_from_slice(&src[cursor..cursor + len]);
            cursor += len;
        }
    }

    pub fn total_len(&self) -> usize {
        self.blocks.iter().map(|(_, len)| len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_message_when_not_fragmented() {
        assert_eq!(PackKind::for_fragment(0, 1, 1024, 500), PackKind::SingleMessage);
    }

    #[test]
    fn last_fragment_is_partial_when_shorter() {
        assert_eq!(PackKind::for_fragment(2, 3, 1000, 2500), PackKind::PartialLastFragment);
    }

    #[test]
    fn middle_fragments_are_full() {
        assert_eq!(PackKind::for_fragment(1, 3, 1000, 2500), PackKind::FullFragment);
    }

    #[test]
    fn datatype_iterator_round_trips_noncontiguous_blocks() {
        let iter = DatatypeIterator::new(vec![(0, 4), (8, 4)]);
        let src = vec![1, 2, 3, 4, 0xff, 0xff, 0xff, 0xff, 5, 6, 7, 8];
        let mut flat = Vec::new();
        iter.pack_all(&src, &mut flat);
        assert_eq!(flat, vec![1, 2, 3, 4, 5, 6, 7, 8]);

        let mut dst = vec![0u8; 12];
        iter.unpack_all(&flat, &mut dst);
        assert_eq!(&dst[0..4], &[1, 2, 3, 4]);
        assert_eq!(&dst[8..12], &[5, 6, 7, 8]);
    }
}
