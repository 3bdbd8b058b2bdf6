//! The built-in planner
//!
//! Ties together tree construction ([`topology`]), phase synthesis ([`phase`]), and endpoint
//! resolution into the [`Planner`] implementation used when no other planner is registered (or
//! requested by name). This mirrors how the original system shipped exactly one production
//! planner component and left the registry open only for experimentation.

pub mod method;
pub mod phase;
pub mod topology;

use smallvec::SmallVec;

use crate::callbacks::RuntimeCallbacks;
use crate::config::Config;
use crate::context::PlannerDescriptor;
use crate::endpoint::{self, ResolveFlags};
use crate::error::{PlanError, PlanResult};
use crate::group::endpoint_cache::EndpointHandle;
use crate::group::Group;
use crate::modifiers::{CollectiveModifiers, CollectiveType};
use crate::plan::{Method, PeerAttributes, PeerSet, Phase, Plan};
use crate::planner::builtin::phase::PhaseSpec;
use crate::planner::Planner;
use crate::transport::{Endpoint, Transport};

/// The sole planner shipped with this core. Stateless: it keeps no per-context or per-group
/// state of its own (`global_state_len`/`group_state_len` default to 0), since every input it
/// needs — the group's distance model, the collective type, the transport's negotiated
/// attributes — is already owned elsewhere.
#[derive(Debug, Default)]
pub struct BuiltinPlanner;

impl BuiltinPlanner {
    pub fn new() -> Self {
        BuiltinPlanner
    }
}

impl<E: Endpoint> PlannerDescriptor<E> for BuiltinPlanner {
    fn name(&self) -> &str {
        "builtin"
    }
}

impl<E: Endpoint> Planner<E> for BuiltinPlanner {
    fn build_plan(
        &self,
        transport: &mut dyn Transport<Ep = E>,
        group: &mut Group<E>,
        callbacks: &dyn RuntimeCallbacks,
        config: &Config,
        collective: CollectiveType,
    ) -> PlanResult<Plan> {
        let specs = if collective.modifiers.contains(CollectiveModifiers::NEIGHBOR) {
            neighbor_phase_specs(group, callbacks)
        } else {
            let roles = topology::build(group, config, collective.root)?;
            phase::synthesize(&roles, collective)
        };

        // Native broadcast lanes are only attempted for the down-sweep legs of an actual
        // broadcast; a reduce's up-sweep or a gather's fan-in always resolves p2p, since the
        // wire-level distinction between "many sources, one sink" and "one source, many sinks"
        // is exactly what the bcast/incast capability split encodes. Incast upgrade is
        // deliberately not attempted here: it needs a concrete (operator, operand, count)
        // signature that only exists once the step builder sees real buffers, so incast lanes
        // are resolved lazily the first time a reducing step actually runs (see
        // `crate::collective`), not at plan-build time.
        let want_bcast = config.enable_bcast && collective.modifiers.contains(CollectiveModifiers::BROADCAST);

        let mut phases = Vec::with_capacity(specs.len());
        for (idx, spec) in specs.into_iter().enumerate() {
            let step_idx = idx as u8;
            let resolve_flags = if want_bcast && spec.peer_members.len() > 1 {
                ResolveFlags::WantBcast
            } else {
                ResolveFlags::None
            };

            let mut peers: SmallVec<[EndpointHandle; 8]> = SmallVec::new();
            let mut peer_attrs: SmallVec<[PeerAttributes; 8]> = SmallVec::new();
            for &member in &spec.peer_members {
                let resolved = endpoint::resolve(transport, group, callbacks, group.id.0, member, resolve_flags)?;
                let Some(handle) = resolved else {
                    // Zero-length ("debug peer") address: the original system's convention for
                    // a member that participates logically but has no real transport endpoint
                    // (single-process test harnesses). Silently excluded from the peer set.
                    continue;
                };
                let attrs = group.endpoint(handle).attributes();
                peers.push(handle);
                peer_attrs.push(PeerAttributes {
                    interface: attrs,
                    memory_domain: None,
                });
            }

            let peer_set = if peers.len() == 1 {
                PeerSet::Single(peers[0])
            } else {
                PeerSet::Many(peers)
            };

            phases.push(Phase {
                method: spec.method,
                step_idx,
                peers: peer_set,
                peer_attrs,
                incast_signature: None,
            });
        }

        let total_endpoints = phases.iter().map(|p| p.peers.len()).sum();
        let plan = Plan {
            phases,
            total_endpoints,
            root_variants: Vec::new(),
        };
        plan.validate().map_err(PlanError::InvalidParameter)?;
        Ok(plan)
    }
}

/// Builds the phase list for a neighbor collective straight from the runtime's topology
/// callback, bypassing the tree builder entirely: a neighbor collective's peer set is exactly
/// the in/out index lists the runtime reports, not the group's ordered member list (§4.2,
/// `NEIGHBOR` modifier). Send and receive legs run as independent phases since the in/out sets
/// need not be symmetric (a Cartesian or distributed-graph topology routinely isn't).
fn neighbor_phase_specs<E: Endpoint>(group: &Group<E>, callbacks: &dyn RuntimeCallbacks) -> Vec<PhaseSpec> {
    let topo = callbacks.neighbor_topology(group.id.0);
    let mut specs = Vec::new();
    if !topo.out_indices.is_empty() {
        specs.push(PhaseSpec {
            method: Method::SendTerminal,
            peer_members: topo.out_indices.iter().copied().collect(),
        });
    }
    if !topo.in_indices.is_empty() {
        specs.push(PhaseSpec {
            method: Method::RecvTerminal,
            peer_members: topo.in_indices.iter().copied().collect(),
        });
    }
    specs
}
