//! Context and planner registry
//!
//! The context is created once per process. It enumerates registered planner components, hands
//! each one a region of per-context and per-group state sized to its own request, and owns the
//! one cross-thread structure in this whole crate: the locked by-id group table (see §5 of the
//! design document — everything else is single-threaded per group).

use std::sync::Arc;

use parking_lot::RwLock;
use slab::Slab;

use crate::callbacks::RuntimeCallbacks;
use crate::config::Config;
use crate::error::{CoreError, PlanResult};
use crate::group::{Group, GroupId, GroupParams};
use crate::modifiers::CollectiveType;
use crate::plan::Plan;
use crate::planner::Planner;
use crate::transport::{Endpoint, Transport};

/// One registered planner's lifecycle hooks plus its requested state sizes.
///
/// A real planner (the built-in one, or a future alternative) implements this trait and is
/// registered with [`Context::register_planner`] before any group is created. Descriptors are
/// consulted in registration order; the first one whose `name_prefix` matches (or the empty
/// prefix) wins a given group, mirroring how the original component-selection mechanism worked.
pub trait PlannerDescriptor<E: Endpoint>: Send + Sync {
    /// Name this planner is selected by; group creation can request a planner by name prefix.
    fn name(&self) -> &str;

    /// Bytes of per-context state this planner needs, allocated once at `init` time.
    fn global_state_len(&self) -> usize {
        0
    }

    /// Bytes of per-group state this planner needs, allocated once per group at `create` time.
    fn group_state_len(&self) -> usize {
        0
    }

    /// Called once, after the active-message id has been reserved for this planner.
    fn init(&self, _global_state: &mut [u8], _config: &Config) -> Result<(), CoreError> {
        Ok(())
    }

    /// Called once at process shutdown.
    fn finalize(&self, _global_state: &mut [u8]) {}

    /// Called when a group selects this planner, after the group's own fields are initialized.
    fn create_group_state(&self, _global_state: &[u8], _group_state: &mut [u8], _group: &Group<E>) -> Result<(), CoreError> {
        Ok(())
    }

    /// Called when a group using this planner is destroyed.
    fn destroy_group_state(&self, _group_state: &mut [u8]) {}
}

struct PlannerEntry<E: Endpoint> {
    descriptor: Arc<dyn PlannerDescriptor<E>>,
    am_id: u8,
    global_state: Vec<u8>,
}

/// Process-wide registry of planner components plus the cross-thread group table.
pub struct Context<T: Transport> {
    transport: T,
    callbacks: Arc<dyn RuntimeCallbacks>,
    config: Config,
    planners: Vec<PlannerEntry<T::Ep>>,
    groups: RwLock<Slab<Group<T::Ep>>>,
}

impl<T: Transport> Context<T> {
    /// Creates a context. Per the ambient-stack note, `config` is already-parsed, typed
    /// configuration; sourcing it from the environment is the embedding runtime's job.
    pub fn init(transport: T, callbacks: Arc<dyn RuntimeCallbacks>, config: Config) -> PlanResult<Self> {
        config.validate()?;
        Ok(Context {
            transport,
            callbacks,
            config,
            planners: Vec::new(),
            groups: RwLock::new(Slab::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn callbacks(&self) -> &Arc<dyn RuntimeCallbacks> {
        &self.callbacks
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Registers a planner component. Active-message identifier negotiation happens here: the
    /// transport's id space is queried and the first id not already bound (by this or any
    /// previously registered planner) is reserved for this planner's exclusive use.
    pub fn register_planner(&mut self, descriptor: Arc<dyn PlannerDescriptor<T::Ep>>) -> Result<(), CoreError> {
        let am_id = self.transport.reserve_am_id()?;
        self.transport.register_am_handler(am_id);
        let mut global_state = vec![0u8; descriptor.global_state_len()];
        descriptor.init(&mut global_state, &self.config)?;
        tracing::debug!(planner = descriptor.name(), am_id, "registered planner");
        self.planners.push(PlannerEntry {
            descriptor,
            am_id,
            global_state,
        });
        Ok(())
    }

    fn select_planner(&self, name_hint: &str) -> Option<usize> {
        if name_hint.is_empty() {
            return if self.planners.is_empty() { None } else { Some(0) };
        }
        self.planners
            .iter()
            .position(|p| p.descriptor.name().starts_with(name_hint))
            .or(if self.planners.is_empty() { None } else { Some(0) })
    }

    /// Creates a group, selecting a planner by `params.name` prefix (or the first registered
    /// planner if the name is empty or unmatched), and allocates its per-group state region
    /// immediately after the group header, as the layout in §4.1 requires.
    #[tracing::instrument(skip(self, params), fields(group_id = params.id.0))]
    pub fn create_group(&mut self, params: GroupParams) -> Result<GroupId, CoreError> {
        let id = params.id;
        let planner_idx = self
            .select_planner(&params.name)
            .ok_or_else(|| CoreError::Unsupported("no planner registered".into()))?;
        let group_state_len = self.planners[planner_idx].descriptor.group_state_len();
        let mut group = Group::new(params, group_state_len, self.config.max_concurrent_ops).map_err(CoreError::from)?;
        {
            let entry = &self.planners[planner_idx];
            entry
                .descriptor
                .create_group_state(&entry.global_state, group.planner_state_mut(), &group)?;
        }
        let mut groups = self.groups.write();
        let key = groups.insert(group);
        debug_assert_eq!(key as u32, id.0, "group id must match slab key for O(1) lookup");
        tracing::debug!("group created");
        Ok(id)
    }

    pub fn destroy_group(&mut self, id: GroupId) {
        let mut groups = self.groups.write();
        if groups.contains(id.0 as usize) {
            groups.remove(id.0 as usize);
        }
    }

    /// The dispatcher's entry point: looks up a group by id in the locked by-id table.
    pub fn with_group<R>(&self, id: GroupId, f: impl FnOnce(&Group<T::Ep>) -> R) -> Option<R> {
        let groups = self.groups.read();
        groups.get(id.0 as usize).map(f)
    }

    pub fn with_group_mut<R>(&self, id: GroupId, f: impl FnOnce(&mut Group<T::Ep>) -> R) -> Option<R> {
        let mut groups = self.groups.write();
        groups.get_mut(id.0 as usize).map(f)
    }

    /// Builds a plan for `id` using `planner`, resolving endpoints against this context's
    /// transport. Takes `&mut self` rather than going through [`Self::with_group_mut`] (which
    /// only hands the closure `&mut Group`): plan building needs `&mut self.transport` and
    /// `&mut` one group's state at once, two disjoint fields of `Context` that a `&self`-based
    /// closure API cannot express simultaneously.
    pub fn build_plan_for_group<P: Planner<T::Ep>>(&mut self, id: GroupId, planner: &P, collective: CollectiveType) -> Result<Plan, CoreError> {
        let mut groups = self.groups.write();
        let group = groups
            .get_mut(id.0 as usize)
            .ok_or_else(|| CoreError::InvalidParameter(format!("no such group {}", id.0)))?;
        planner
            .build_plan(&mut self.transport, group, self.callbacks.as_ref(), &self.config, collective)
            .map_err(CoreError::from)
    }

    pub fn am_id_for(&self, planner_name: &str) -> Option<u8> {
        self.planners
            .iter()
            .find(|p| p.descriptor.name() == planner_name)
            .map(|p| p.am_id)
    }
}

impl<T: Transport> Drop for Context<T> {
    fn drop(&mut self) {
        for entry in &mut self.planners {
            let descriptor = entry.descriptor.clone();
            descriptor.finalize(&mut entry.global_state);
        }
    }
}

