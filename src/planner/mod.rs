//! Planner registry trait
//!
//! A planner turns a group and a collective type into a [`Plan`](crate::plan::Plan). The
//! built-in planner ([`builtin`]) is the only implementation shipped here, but the registry in
//! [`crate::context::Context`] is open to others selected by name prefix, matching how the
//! original component registry worked.

pub mod builtin;

use crate::callbacks::RuntimeCallbacks;
use crate::config::Config;
use crate::context::PlannerDescriptor;
use crate::error::PlanResult;
use crate::group::Group;
use crate::modifiers::CollectiveType;
use crate::plan::Plan;
use crate::transport::{Endpoint, Transport};

/// Extends [`PlannerDescriptor`] (the registration lifecycle) with the actual plan-building
/// entry point used by [`crate::collective`].
///
/// Plan building is side-effecting, not pure: synthesizing phases requires resolving real
/// endpoints (`transport`, mutably, to open them; `group`, mutably, to cache them) and may need
/// to ask the embedding runtime for addresses or datatype properties (`callbacks`). `transport`
/// is taken as `&mut dyn Transport<Ep = E>` rather than the concrete `T: Transport` so a
/// `Planner<E>` can be stored and invoked through the same `Arc<dyn PlannerDescriptor<E>>`-style
/// dynamic dispatch the context's planner registry already uses.
pub trait Planner<E: Endpoint>: PlannerDescriptor<E> {
    fn build_plan(
        &self,
        transport: &mut dyn Transport<Ep = E>,
        group: &mut Group<E>,
        callbacks: &dyn RuntimeCallbacks,
        config: &Config,
        collective: CollectiveType,
    ) -> PlanResult<Plan>;
}
