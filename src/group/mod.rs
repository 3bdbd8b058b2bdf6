//! Groups: ordered participant sets with a distance model and endpoint caches

pub mod endpoint_cache;

use std::fmt;

use crate::dispatcher::SlotRing;
use crate::distance::DistanceModel;
use crate::error::{PlanError, PlanResult};
use crate::transport::Endpoint;
use endpoint_cache::{EndpointCaches, EndpointHandle};

/// A group's stable identifier, also the `group_id` field of every [`crate::wire::WireHeader`]
/// addressed to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub u32);

/// Caller-supplied description of a group, mirroring the runtime surface's group creation
/// parameters.
#[derive(Debug, Clone)]
pub struct GroupParams {
    pub id: GroupId,
    pub member_count: u32,
    pub my_index: u32,
    pub distance: DistanceModel,
    /// Human-readable name, prefix-matched against planner component names to steer selection;
    /// empty means "no preference".
    pub name: String,
}

impl GroupParams {
    pub fn validate(&self) -> PlanResult<()> {
        if self.member_count == 0 {
            return Err(PlanError::InvalidParameter("member_count must be at least 1".into()));
        }
        if self.my_index >= self.member_count {
            return Err(PlanError::InvalidParameter(format!(
                "my_index {} out of range for member_count {}",
                self.my_index, self.member_count
            )));
        }
        self.distance
            .validate(self.member_count, self.my_index)
            .map_err(PlanError::InvalidParameter)?;
        Ok(())
    }
}

/// An ordered group of collective participants.
///
/// A `Group` owns its endpoint caches and a per-planner state region (opaque to everything but
/// the planner that requested it at registration, see [`crate::context::Context`]); it does not
/// own its operations — those are created against the group but tracked by the dispatcher's
/// slot ring, not by the group itself, so that op lifetime cannot create a cycle back through
/// the group.
pub struct Group<E: Endpoint> {
    pub id: GroupId,
    pub member_count: u32,
    pub my_index: u32,
    pub distance: DistanceModel,
    caches: EndpointCaches,
    endpoints: Vec<E>,
    /// Per-group recursive-broadcast guard (see the endpoint resolver). This was a file-scope
    /// flag in the system this core replaces; here it is ordinary per-group state, so progress
    /// on two groups on two schedulers can never interfere with each other.
    pub(crate) bcast_recursion_guard: bool,
    /// A singly-linked (in effect; we use a `Vec` as the queue, order-preserving) list of slot
    /// indices waiting for transport resources, walked once per progress tick by the dispatcher.
    pub(crate) resend_queue: Vec<u8>,
    /// The group's concurrency slot ring, sized `P = max_concurrent_ops` at creation. See
    /// [`crate::dispatcher`].
    pub slots: SlotRing,
    planner_state: Vec<u8>,
    /// Monotonic counter backing [`Group::alloc_coll_id`]; wraps at 256, which is fine, since
    /// `coll_id` only needs to disambiguate *concurrently live* requests and the slot ring
    /// already rejects a reused id while its slot is still busy.
    next_coll_id: u8,
}

impl<E: Endpoint> fmt::Debug for Group<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("id", &self.id)
            .field("member_count", &self.member_count)
            .field("my_index", &self.my_index)
            .finish_non_exhaustive()
    }
}

impl<E: Endpoint> Group<E> {
    /// `slot_capacity` must be a power of two (see
    /// [`crate::config::Config::max_concurrent_ops`]); it is typically the owning context's
    /// configured concurrency limit.
    pub fn new(params: GroupParams, planner_state_len: usize, slot_capacity: u8) -> PlanResult<Self> {
        params.validate()?;
        Ok(Group {
            id: params.id,
            member_count: params.member_count,
            my_index: params.my_index,
            distance: params.distance,
            caches: EndpointCaches::new(),
            endpoints: Vec::new(),
            bcast_recursion_guard: false,
            resend_queue: Vec::new(),
            slots: SlotRing::new(slot_capacity),
            planner_state: vec![0u8; planner_state_len],
            next_coll_id: 0,
        })
    }

    /// Hands out the next `coll_id` for a new request on this group. Callers still go through
    /// [`crate::dispatcher::SlotRing::acquire`] to actually claim a slot, which is where the
    /// real "too many ops in flight" rejection happens; this just keeps ids from colliding
    /// across the group's lifetime for as long as `u8` wraparound allows.
    pub fn alloc_coll_id(&mut self) -> u8 {
        let id = self.next_coll_id;
        self.next_coll_id = self.next_coll_id.wrapping_add(1);
        id
    }

    pub fn caches(&self) -> &EndpointCaches {
        &self.caches
    }

    pub fn caches_mut(&mut self) -> &mut EndpointCaches {
        &mut self.caches
    }

    pub fn planner_state(&self) -> &[u8] {
        &self.planner_state
    }

    pub fn planner_state_mut(&mut self) -> &mut [u8] {
        &mut self.planner_state
    }

    /// Stores a newly opened endpoint and returns a stable handle to it.
    pub fn store_endpoint(&mut self, endpoint: E) -> EndpointHandle {
        let handle = EndpointHandle(self.endpoints.len() as u32);
        self.endpoints.push(endpoint);
        handle
    }

    pub fn endpoint(&self, handle: EndpointHandle) -> &E {
        &self.endpoints[handle.0 as usize]
    }

    pub fn endpoint_mut(&mut self, handle: EndpointHandle) -> &mut E {
        &mut self.endpoints[handle.0 as usize]
    }
}
