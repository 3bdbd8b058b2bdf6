//! Endpoint resolver
//!
//! Lazily establishes and caches per-peer transport endpoints, distinguishing point-to-point,
//! native-incast, and native-broadcast lanes. See §4.5 of the design document for the algorithm
//! this module implements move-for-move.

use crate::callbacks::RuntimeCallbacks;
use crate::error::CoreError;
use crate::group::endpoint_cache::{EndpointHandle, IncastSignature};
use crate::group::Group;
use crate::transport::{Capabilities, Endpoint, Transport};

/// Which lane the caller wants from [`resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveFlags {
    None,
    WantIncast(IncastSignature),
    WantBcast,
}

/// The zero-length address sentinel (§4.5): a "debug peer" with no real endpoint.
fn is_debug_peer_address(address: &[u8]) -> bool {
    address.is_empty()
}

/// Resolves (and, on first use, opens) the endpoint for `member` under the requested
/// capability, returning its stable cache handle.
///
/// Step 1 of the documented algorithm (translating `member_index` through a global-index
/// callback to consult a root group's cache instead of the current group's) is the caller's
/// responsibility: the caller passes whichever `Group` the translated index should be resolved
/// against. This function only implements steps 2 through 6.
pub fn resolve<T: Transport + ?Sized>(
    ctx_transport: &mut T,
    group: &mut Group<T::Ep>,
    callbacks: &dyn RuntimeCallbacks,
    group_id: u32,
    member: u32,
    flags: ResolveFlags,
) -> Result<Option<EndpointHandle>, CoreError> {
    match flags {
        ResolveFlags::None => resolve_p2p(ctx_transport, group, callbacks, group_id, member),
        ResolveFlags::WantIncast(sig) => resolve_incast(ctx_transport, group, member, sig),
        ResolveFlags::WantBcast => resolve_bcast(ctx_transport, group, member),
    }
}

fn resolve_p2p<T: Transport + ?Sized>(
    ctx_transport: &mut T,
    group: &mut Group<T::Ep>,
    callbacks: &dyn RuntimeCallbacks,
    group_id: u32,
    member: u32,
) -> Result<Option<EndpointHandle>, CoreError> {
    if let Some(handle) = group.caches().p2p_get(member) {
        return Ok(Some(handle));
    }
    let address = callbacks.address_lookup(group_id, member)?;
    if is_debug_peer_address(&address) {
        return Ok(None);
    }
    let endpoint = ctx_transport.open_endpoint(&address)?;
    let handle = group.store_endpoint(endpoint);
    group.caches_mut().p2p_insert(member, handle);
    await_connection(ctx_transport, group, handle)?;
    Ok(Some(handle))
}

fn resolve_incast<T: Transport + ?Sized>(
    ctx_transport: &mut T,
    group: &mut Group<T::Ep>,
    member: u32,
    signature: IncastSignature,
) -> Result<Option<EndpointHandle>, CoreError> {
    if let Some(handle) = group.caches().incast_get(signature, member) {
        return Ok(Some(handle));
    }
    let endpoint = ctx_transport.open_collective_endpoint(&[member], Capabilities::INCAST | Capabilities::BCAST)?;
    let handle = group.store_endpoint(endpoint);
    group.caches_mut().incast_insert(signature, member, handle);
    await_connection(ctx_transport, group, handle)?;
    Ok(Some(handle))
}

fn resolve_bcast<T: Transport + ?Sized>(
    ctx_transport: &mut T,
    group: &mut Group<T::Ep>,
    member: u32,
) -> Result<Option<EndpointHandle>, CoreError> {
    if let Some(handle) = group.caches().bcast_get(member) {
        return Ok(Some(handle));
    }
    // Recursive-broadcast guard: a per-group field, not the file-scope flag the source used, so
    // two groups resolving bcast endpoints concurrently on independent schedulers never race.
    if group.bcast_recursion_guard {
        return Err(CoreError::Unreachable {
            member,
            capability: "bcast",
        });
    }
    group.bcast_recursion_guard = true;
    let result = (|| {
        let endpoint = ctx_transport.open_collective_endpoint(&[member], Capabilities::BCAST)?;
        let handle = group.store_endpoint(endpoint);
        group.caches_mut().bcast_insert(member, handle);
        await_connection(ctx_transport, group, handle)?;
        Ok(Some(handle))
    })();
    group.bcast_recursion_guard = false;
    result
}

/// Step 5: wait for the chosen lane to become connected, driving transport progress and
/// retrying as needed. Bounded by the transport's own connection handshake, not by a core-level
/// timeout (§5: there are no core-level timeouts).
fn await_connection<T: Transport + ?Sized>(
    ctx_transport: &mut T,
    group: &mut Group<T::Ep>,
    handle: EndpointHandle,
) -> Result<(), CoreError> {
    const MAX_PROGRESS_TICKS: u32 = 1 << 20;
    let mut ticks = 0;
    loop {
        if group.endpoint(handle).is_connected() {
            return Ok(());
        }
        group.endpoint_mut(handle).connect_remote()?;
        ctx_transport.progress();
        ticks += 1;
        if ticks > MAX_PROGRESS_TICKS {
            return Err(CoreError::Unreachable {
                member: handle.0,
                capability: "connect",
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_length_address_is_debug_peer() {
        assert!(is_debug_peer_address(&[]));
        assert!(!is_debug_peer_address(&[0]));
    }
}
