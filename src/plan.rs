//! Plans and phases
//!
//! A [`Plan`] is the planner's output: an ordered sequence of [`Phase`]s ready to be
//! instantiated into an [`crate::op::Op`]. Plans are immutable once built and may be cached and
//! reused across every operation with the same collective type on the same group (persistent
//! operations reuse the very same plan across triggers).

use smallvec::SmallVec;

use crate::group::endpoint_cache::{EndpointHandle, IncastSignature};
use crate::transport::{InterfaceAttributes, MemoryDomainAttributes};

/// The primitive method a phase uses to move data, per §4.2 of the design document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    SendTerminal,
    RecvTerminal,
    SendToSmRoot,
    ReduceTerminal,
    ReduceWaypoint,
    GatherTerminal,
    GatherWaypoint,
    BcastWaypoint,
    ScatterWaypoint,
    ScatterTerminal,
    RecursiveKning,
}

impl Method {
    /// Whether this method both receives from children and forwards toward a parent, as opposed
    /// to terminating the chain.
    pub fn is_waypoint(self) -> bool {
        matches!(
            self,
            Method::ReduceWaypoint | Method::GatherWaypoint | Method::BcastWaypoint | Method::ScatterWaypoint
        )
    }
}

/// The peer set a phase targets: either a single endpoint (the common case once the
/// single-endpoint specialization in §4.2 applies) or an ordered list of endpoints.
#[derive(Debug, Clone)]
pub enum PeerSet {
    Single(EndpointHandle),
    Many(SmallVec<[EndpointHandle; 8]>),
}

impl PeerSet {
    pub fn len(&self) -> usize {
        match self {
            PeerSet::Single(_) => 1,
            PeerSet::Many(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = EndpointHandle> + '_ {
        match self {
            PeerSet::Single(h) => EitherIter::A(std::iter::once(*h)),
            PeerSet::Many(v) => EitherIter::B(v.iter().copied()),
        }
    }
}

enum EitherIter<A, B> {
    A(A),
    B(B),
}

impl<T, A: Iterator<Item = T>, B: Iterator<Item = T>> Iterator for EitherIter<A, B> {
    type Item = T;
    fn next(&mut self) -> Option<T> {
        match self {
            EitherIter::A(a) => a.next(),
            EitherIter::B(b) => b.next(),
        }
    }
}

/// A snapshot of a peer's relevant transport attributes, captured at plan-build time so the
/// step executor never has to re-query the transport mid-operation.
#[derive(Debug, Clone, Copy)]
pub struct PeerAttributes {
    pub interface: InterfaceAttributes,
    pub memory_domain: Option<MemoryDomainAttributes>,
}

/// One contiguous executor step targeting one peer set with one method.
#[derive(Debug, Clone)]
pub struct Phase {
    pub method: Method,
    pub step_idx: u8,
    pub peers: PeerSet,
    pub peer_attrs: SmallVec<[PeerAttributes; 8]>,
    pub incast_signature: Option<IncastSignature>,
}

/// A complete, buildable execution plan for one collective type on one group.
#[derive(Debug, Clone)]
pub struct Plan {
    pub phases: Vec<Phase>,
    pub total_endpoints: usize,
    /// Alternate phase sequences for roots other than the one this plan was built for, indexed
    /// by root member index. Populated lazily by planners that cache per-root variants (the
    /// root-swap adjustment in tree construction is the expensive part, so callers that sweep
    /// over many roots benefit from reusing the non-root-dependent structure).
    pub root_variants: Vec<(u32, Vec<Phase>)>,
}

impl Plan {
    /// Validates the ordering and monotonicity invariants §3 requires of a freshly built plan.
    pub fn validate(&self) -> Result<(), String> {
        let mut last_idx: Option<u8> = None;
        for phase in &self.phases {
            if let Some(last) = last_idx {
                if phase.step_idx <= last {
                    return Err("phase step indices must be strictly monotonic".into());
                }
            }
            last_idx = Some(phase.step_idx);
            if phase.peers.len() != phase.peer_attrs.len() {
                return Err("peer count must equal resolved-attribute count".into());
            }
        }
        Ok(())
    }
}
