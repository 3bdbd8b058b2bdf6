//! Per-group endpoint caches
//!
//! Three caches live on every group: point-to-point, native broadcast, and a small set of
//! native incast lanes keyed by reduction signature. All three grow monotonically until the
//! group is destroyed, and none of them are locked — a group is progressed by exactly one
//! scheduler thread at a time (see §5 of the design document).

use std::collections::HashMap;

/// Identifies a native incast lane: which operator, over which operand type, combining how many
/// elements. Two collectives that agree on all three may share the same hardware lane.
///
/// This is the explicit struct the design notes call for in place of the single packed
/// pointer-sized integer the incast callback historically used: naming the fields keeps the
/// packing rule local to [`IncastSignature::pack`] instead of smeared across every call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IncastSignature {
    pub operator: u32,
    pub operand: u32,
    pub count: u32,
}

impl IncastSignature {
    /// Canonical pack into a single 64-bit key, for transports that still want one word to hand
    /// to hardware. The layout is private to this function; nothing else may assume it.
    pub fn pack(&self) -> u64 {
        (self.operator as u64) << 40 | (self.operand as u64) << 24 | (self.count as u64 & 0xFF_FFFF)
    }
}

/// An opaque, cache-stable endpoint handle.
///
/// Endpoints live in a [`crate::group::Group`]'s caches and are referenced by handle everywhere
/// else (plans, steps) so that no code outside the group needs direct endpoint ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointHandle(pub u32);

/// The three endpoint caches owned by a group.
#[derive(Debug, Default)]
pub struct EndpointCaches {
    p2p: HashMap<u32, EndpointHandle>,
    bcast: HashMap<u32, EndpointHandle>,
    incast: Vec<(IncastSignature, HashMap<u32, EndpointHandle>)>,
}

impl EndpointCaches {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn p2p_get(&self, member: u32) -> Option<EndpointHandle> {
        self.p2p.get(&member).copied()
    }

    /// Idempotent insertion: re-inserting the same (member, handle) pair is a no-op; inserting a
    /// different handle for an already-cached member is a logic error in the caller and panics,
    /// since the cache is documented to hold at most one endpoint per key.
    pub fn p2p_insert(&mut self, member: u32, handle: EndpointHandle) {
        match self.p2p.get(&member) {
            Some(existing) => assert_eq!(*existing, handle, "p2p cache key collision for member {member}"),
            None => {
                self.p2p.insert(member, handle);
            }
        }
    }

    pub fn bcast_get(&self, member: u32) -> Option<EndpointHandle> {
        self.bcast.get(&member).copied()
    }

    pub fn bcast_insert(&mut self, member: u32, handle: EndpointHandle) {
        match self.bcast.get(&member) {
            Some(existing) => assert_eq!(*existing, handle, "bcast cache key collision for member {member}"),
            None => {
                self.bcast.insert(member, handle);
            }
        }
    }

    pub fn incast_get(&self, signature: IncastSignature, member: u32) -> Option<EndpointHandle> {
        self.incast
            .iter()
            .find(|(sig, _)| *sig == signature)
            .and_then(|(_, map)| map.get(&member).copied())
    }

    /// Inserts an endpoint into the incast cache for `signature`, creating the signature's
    /// bucket if needed, and links it into the bcast cache as well — an endpoint returned by
    /// native collective wire-up always covers both lanes.
    pub fn incast_insert(&mut self, signature: IncastSignature, member: u32, handle: EndpointHandle) {
        if let Some((_, map)) = self.incast.iter_mut().find(|(sig, _)| *sig == signature) {
            map.insert(member, handle);
        } else {
            let mut map = HashMap::new();
            map.insert(member, handle);
            self.incast.push((signature, map));
        }
        self.bcast_insert(member, handle);
    }
}
