//! Collective modifier bitfield and collective type
//!
//! A collective's shape (broadcast vs. reduce vs. gather, barrier vs. data-moving, ...) is
//! described entirely by a bitfield plus a root index; there is deliberately no separate
//! "collective kind" enum; the planner's phase synthesis (see
//! [`crate::planner::builtin::method`]) switches on combinations of these bits exactly as the
//! wire format does.

use bitflags::bitflags;

bitflags! {
    /// Bits 0..13 of the 16-bit collective modifier field; bits 14 and 15 are reserved and must
    /// be zero.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CollectiveModifiers: u16 {
        /// The collective has exactly one source (e.g. broadcast, scatter).
        const SINGLE_SOURCE = 1 << 0;
        /// The collective has exactly one destination (e.g. reduce, gather).
        const SINGLE_DESTINATION = 1 << 1;
        /// Contributions are combined with a reduction operator.
        const AGGREGATE = 1 << 2;
        /// Contributions are concatenated in member-index order.
        const CONCATENATE = 1 << 3;
        /// The single source's data is replicated to every destination.
        const BROADCAST = 1 << 4;
        /// Per-member counts/displacements vary (the `-v` family: scatterv, gatherv, ...).
        const VARIADIC = 1 << 5;
        /// Aggregation only needs to happen among a subset of contributions per step
        /// (reduce-scatter style partial aggregation).
        const AGGREGATE_PARTIAL = 1 << 6;
        /// The peer set is the neighbor list from the runtime's topology callback, not the
        /// group's own ordered member list.
        const NEIGHBOR = 1 << 7;
        /// Pure synchronization; no payload is exchanged.
        const BARRIER = 1 << 8;
        /// The operation is started once and retriggered by the caller (MPI persistent
        /// collectives); step state may be reused across triggers.
        const PERSISTENT = 1 << 9;
        /// Every member is simultaneously a source and a destination (all-gather, all-reduce,
        /// all-to-all).
        const SYMMETRIC = 1 << 10;
        /// Reduction must be bit-exactly reproducible regardless of arrival order (a fixed
        /// left-to-right fold is used instead of arrival order).
        const AGGREGATE_STABLE = 1 << 11;
        /// Send and/or receive datatypes are non-contiguous; pack/unpack bracketing is required.
        const NONCONTIG_DATATYPE = 1 << 12;
        /// Test-only: replace real endpoints with mock endpoints that loop back locally.
        const MOCK_EPS = 1 << 13;
    }
}

/// The modifier set plus the root index: together these are sufficient to determine a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CollectiveType {
    /// Which shape of collective this is.
    pub modifiers: CollectiveModifiers,
    /// The root member index, meaningful only when `SINGLE_SOURCE` or `SINGLE_DESTINATION` is
    /// set; ignored otherwise.
    pub root: u32,
}

impl CollectiveType {
    /// A pure barrier: no payload, every member both a source and sink of the synchronization.
    pub fn barrier() -> Self {
        CollectiveType {
            modifiers: CollectiveModifiers::BARRIER,
            root: 0,
        }
    }

    /// A broadcast from `root` to every other member.
    pub fn broadcast(root: u32) -> Self {
        CollectiveType {
            modifiers: CollectiveModifiers::SINGLE_SOURCE | CollectiveModifiers::BROADCAST,
            root,
        }
    }

    /// A reduction of every member's contribution to `root`.
    pub fn reduce(root: u32, stable: bool) -> Self {
        let mut modifiers = CollectiveModifiers::SINGLE_DESTINATION | CollectiveModifiers::AGGREGATE;
        if stable {
            modifiers |= CollectiveModifiers::AGGREGATE_STABLE;
        }
        CollectiveType { modifiers, root }
    }

    /// A reduction whose result is replicated back to every member.
    pub fn all_reduce(stable: bool) -> Self {
        let mut modifiers = CollectiveModifiers::AGGREGATE | CollectiveModifiers::SYMMETRIC;
        if stable {
            modifiers |= CollectiveModifiers::AGGREGATE_STABLE;
        }
        CollectiveType { modifiers, root: 0 }
    }

    /// A gather of every member's contribution, concatenated in order, at `root`.
    pub fn gather(root: u32, variadic: bool) -> Self {
        let mut modifiers = CollectiveModifiers::SINGLE_DESTINATION | CollectiveModifiers::CONCATENATE;
        if variadic {
            modifiers |= CollectiveModifiers::VARIADIC;
        }
        CollectiveType { modifiers, root }
    }

    /// A scatter of `root`'s buffer to every member.
    pub fn scatter(root: u32, variadic: bool) -> Self {
        let mut modifiers = CollectiveModifiers::SINGLE_SOURCE | CollectiveModifiers::CONCATENATE;
        if variadic {
            modifiers |= CollectiveModifiers::VARIADIC;
        }
        CollectiveType { modifiers, root }
    }

    /// Every member exchanges a distinct segment with every other member.
    pub fn all_to_all(variadic: bool) -> Self {
        let mut modifiers = CollectiveModifiers::CONCATENATE | CollectiveModifiers::SYMMETRIC;
        if variadic {
            modifiers |= CollectiveModifiers::VARIADIC;
        }
        CollectiveType { modifiers, root: 0 }
    }

    /// A neighbor collective: peer set is the runtime's topology callback, not the ordered
    /// member list.
    pub fn neighbor(base: CollectiveModifiers) -> Self {
        CollectiveType {
            modifiers: base | CollectiveModifiers::NEIGHBOR,
            root: 0,
        }
    }

    /// True when this collective moves no payload at all.
    pub fn is_pure_barrier(&self) -> bool {
        self.modifiers.contains(CollectiveModifiers::BARRIER)
    }

    /// True when every member is both a source and a destination.
    pub fn is_symmetric(&self) -> bool {
        self.modifiers.contains(CollectiveModifiers::SYMMETRIC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_bits_stay_clear() {
        let all = CollectiveModifiers::all();
        assert_eq!(all.bits() & 0xC000, 0);
    }

    #[test]
    fn broadcast_is_single_source() {
        let t = CollectiveType::broadcast(2);
        assert!(t.modifiers.contains(CollectiveModifiers::SINGLE_SOURCE));
        assert!(t.modifiers.contains(CollectiveModifiers::BROADCAST));
        assert_eq!(t.root, 2);
    }

    #[test]
    fn all_reduce_is_symmetric_aggregate() {
        let t = CollectiveType::all_reduce(false);
        assert!(t.modifiers.contains(CollectiveModifiers::AGGREGATE));
        assert!(t.is_symmetric());
    }
}
