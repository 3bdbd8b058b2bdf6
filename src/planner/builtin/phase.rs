//! Phase synthesis: turns a [`TreeRoles`] (or a neighbor topology) plus a [`CollectiveType`]
//! into an ordered list of phase specifications, one per peer set the executing member
//! participates in.
//!
//! Waypoint methods (`ReduceWaypoint`/`GatherWaypoint`/`BcastWaypoint`/`ScatterWaypoint`) both
//! receive from one peer set and forward to another. Rather than threading that cross-peer-set
//! forwarding through a single [`crate::step::CompletionAction::ReenterSend`] (reserved here for
//! same-peer-set re-entry), each waypoint level is modeled as two consecutive phases: a
//! receive-from-children phase, then a send-to-parent phase — matching the existing
//! [`crate::plan::Phase`] shape (one method, one peer set) without widening it.

use smallvec::SmallVec;

use crate::modifiers::{CollectiveModifiers, CollectiveType};
use crate::plan::Method;
use crate::planner::builtin::topology::TreeRoles;

/// One phase's method and the member indices (not yet resolved to endpoints) it targets.
#[derive(Debug, Clone)]
pub struct PhaseSpec {
    pub method: Method,
    pub peer_members: SmallVec<[u32; 16]>,
}

impl PhaseSpec {
    fn new(method: Method, peer_members: impl Into<SmallVec<[u32; 16]>>) -> Self {
        PhaseSpec {
            method,
            peer_members: peer_members.into(),
        }
    }
}

/// Synthesizes the tree-based phase sequence for one member, given its role in the tree and the
/// collective's shape. Returns an empty list for members with no work at either tree level (a
/// singleton host with no inter-host level and no intra-host peers, e.g. a one-member group).
pub fn synthesize(roles: &TreeRoles, collective: CollectiveType) -> Vec<PhaseSpec> {
    let m = collective.modifiers;
    let aggregate = m.contains(CollectiveModifiers::AGGREGATE) || m.contains(CollectiveModifiers::BARRIER);
    let concatenate = m.contains(CollectiveModifiers::CONCATENATE);
    let single_source = m.contains(CollectiveModifiers::SINGLE_SOURCE) && !aggregate;
    // BROADCAST ships the same buffer to every child; a single-source collective that instead
    // carries CONCATENATE is a scatter, which must hand each child its own disjoint segment —
    // the two share the fan-out shape but never the same methods.
    let single_source_scatter = single_source && concatenate;
    let single_source_broadcast = single_source && !concatenate;
    let single_destination = m.contains(CollectiveModifiers::SINGLE_DESTINATION) && concatenate && !single_source;
    let needs_release = m.contains(CollectiveModifiers::SYMMETRIC) || m.contains(CollectiveModifiers::BARRIER);

    if single_source_broadcast {
        return down_sweep(roles, Method::BcastWaypoint, Method::SendTerminal, Method::RecvTerminal);
    }
    if single_source_scatter {
        return down_sweep(roles, Method::ScatterWaypoint, Method::ScatterWaypoint, Method::ScatterTerminal);
    }
    if single_destination {
        return up_sweep(roles, Method::GatherWaypoint, Method::GatherTerminal, Method::SendTerminal);
    }
    if concatenate && m.contains(CollectiveModifiers::SYMMETRIC) {
        // All-to-all: the direct single-phase exchange simplification of `RecursiveKning`
        // documented in DESIGN.md — one phase against every other member, relying on
        // SEND_VARIADIC addressing (wired in at step-build time) rather than log(P)-round
        // halving/doubling.
        let mut peers: SmallVec<[u32; 16]> = SmallVec::new();
        if let Some(p) = roles.intra_parent {
            peers.push(p);
        }
        peers.extend(roles.intra_children.iter().copied());
        peers.extend(roles.inter_children.iter().copied());
        if let Some(p) = roles.inter_parent {
            peers.push(p);
        }
        return vec![PhaseSpec::new(Method::RecursiveKning, peers)];
    }

    if aggregate {
        // A barrier's fan-in leg carries no payload, so its forward-to-parent leg uses the
        // shared-memory-root send rather than the plain terminal send a real reduce uses.
        let forward_to_parent = if m.contains(CollectiveModifiers::BARRIER) {
            Method::SendToSmRoot
        } else {
            Method::SendTerminal
        };
        let mut phases = up_sweep(roles, Method::ReduceWaypoint, Method::ReduceTerminal, forward_to_parent);
        if needs_release {
            phases.extend(down_sweep(roles, Method::BcastWaypoint, Method::SendTerminal, Method::RecvTerminal));
        }
        return phases;
    }

    Vec::new()
}

/// Builds the fan-in (leaf-to-root) half of a tree sweep: intra-host level first, then (if this
/// member is its host's master) the inter-host level.
fn up_sweep(roles: &TreeRoles, waypoint: Method, terminal_at_root: Method, forward_to_parent: Method) -> Vec<PhaseSpec> {
    let mut phases = Vec::new();

    if !roles.intra_children.is_empty() {
        let continues = roles.intra_parent.is_some() || roles.has_inter_host_work();
        let method = if continues { waypoint } else { terminal_at_root };
        phases.push(PhaseSpec::new(method, roles.intra_children.clone()));
    }
    if let Some(parent) = roles.intra_parent {
        phases.push(PhaseSpec::new(forward_to_parent, SmallVec::from_slice(&[parent])));
    }

    if roles.is_host_master {
        if !roles.inter_children.is_empty() {
            let continues = roles.inter_parent.is_some();
            let method = if continues { waypoint } else { terminal_at_root };
            phases.push(PhaseSpec::new(method, roles.inter_children.clone()));
        }
        if let Some(parent) = roles.inter_parent {
            phases.push(PhaseSpec::new(forward_to_parent, SmallVec::from_slice(&[parent])));
        }
    }

    phases
}

/// Builds the fan-out (root-to-leaf) half of a tree sweep: inter-host level first (only this
/// host's master participates), then the intra-host level.
fn down_sweep(roles: &TreeRoles, waypoint: Method, send_to_children_only: Method, recv_from_parent: Method) -> Vec<PhaseSpec> {
    let mut phases = Vec::new();

    if roles.is_host_master {
        if let Some(parent) = roles.inter_parent {
            phases.push(PhaseSpec::new(recv_from_parent, SmallVec::from_slice(&[parent])));
        }
        if !roles.inter_children.is_empty() {
            let method = if roles.inter_parent.is_some() { waypoint } else { send_to_children_only };
            phases.push(PhaseSpec::new(method, roles.inter_children.clone()));
        }
    }

    if let Some(parent) = roles.intra_parent {
        phases.push(PhaseSpec::new(recv_from_parent, SmallVec::from_slice(&[parent])));
    }
    if !roles.intra_children.is_empty() {
        let method = if roles.intra_parent.is_some() || roles.has_inter_host_work() {
            waypoint
        } else {
            send_to_children_only
        };
        phases.push(PhaseSpec::new(method, roles.intra_children.clone()));
    }

    phases
}
