//! Collective operation lifecycle: plan, bind, trigger, progress, complete.
//!
//! This is the public entry point that ties the rest of the core together. [`create`] builds (or
//! reuses — plans are buffer-independent, see [`crate::planner::builtin::method`]) a plan for a
//! group/collective pair, binds each phase to real buffers via the step builder, claims a slot in
//! the group's concurrency ring, and triggers the resulting op's first step. [`deliver`] is where
//! a transport's active-message handler for this planner's `am_id` feeds an inbound message back
//! in. [`progress`] drains whatever the group's resend queue is carrying. [`cancel`] implements
//! the best-effort cancellation policy; [`retrigger`] re-enters a persistent op in place.
//!
//! None of this owns a thread or a loop: the embedding runtime calls `create` once per trigger and
//! `deliver`/`progress` as often as its own event loop or polling cadence dictates.

use crate::callbacks::CompletionNotify;
use crate::context::Context;
use crate::dispatcher::{self, DispatchOutcome, Request, SlotRing};
use crate::error::CoreError;
use crate::group::{Group, GroupId};
use crate::modifiers::{CollectiveModifiers, CollectiveType};
use crate::op::{FaultMode, Op, OpFlags};
use crate::plan::Plan;
use crate::planner::builtin::method::{self, OperandDescriptor, ReduceDescriptor, VariadicLayout};
use crate::planner::Planner;
use crate::step::executor::{StepExecutor, StepState};
use crate::step::reducer::Reducer;
use crate::step::Step;
use crate::transport::{Endpoint, Transport};
use crate::wire::WireHeader;

/// Everything [`create`] needs beyond the group and the collective's shape: the real buffers, the
/// reduce operator (if any), an explicit variadic layout (if any), fault handling, and how the
/// trigger wants to be notified on completion.
pub struct TriggerParams {
    pub operand: OperandDescriptor,
    pub reduce: Option<ReduceDescriptor>,
    pub variadic: Option<VariadicLayout>,
    pub fault_mode: FaultMode,
    pub completion: CompletionNotify,
    /// Whether this request tolerates out-of-order fragment arrival within a step, rather than
    /// requiring strict in-order delivery.
    pub handle_out_of_order: bool,
}

/// A live operation: which group it runs against and which concurrency-ring slot it occupies.
/// Opaque to the caller beyond that — progress, delivery, and cancellation are all driven by
/// group id plus `coll_id`, never by a reference into the op itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectiveHandle {
    pub group_id: GroupId,
    pub coll_id: u8,
}

/// Builds a plan for `collective` against `group_id`, binds it to `params`'s buffers, claims a
/// free slot in the group's concurrency ring, and triggers the resulting op.
///
/// Planning errors (an unreachable member, a malformed distance model, a ring already at its
/// concurrency limit) are returned synchronously here; they never reach `params.completion`,
/// which only ever fires for errors encountered once the op is actually in flight.
pub fn create<T: Transport, P: Planner<T::Ep>>(
    ctx: &mut Context<T>,
    group_id: GroupId,
    planner: &P,
    collective: CollectiveType,
    params: TriggerParams,
) -> Result<CollectiveHandle, CoreError> {
    let plan = ctx.build_plan_for_group(group_id, planner, collective)?;
    let am_id = ctx.am_id_for(planner.name()).unwrap_or(0);
    let config = ctx.config().clone();
    let callbacks = ctx.callbacks().clone();
    let (steps, reducers) = build_steps(plan, &params, &config, callbacks.as_ref());

    let mut op = Op::new(steps, op_flags(collective), params.fault_mode);
    op.completion = Some(params.completion);

    let no_such_group = || CoreError::InvalidParameter(format!("no such group {}", group_id.0));

    ctx.with_group_mut(group_id, move |group| -> Result<CollectiveHandle, CoreError> {
        let coll_id = group.alloc_coll_id();
        let request = Request {
            coll_id,
            next_expected_step: 0,
            handle_out_of_order: params.handle_out_of_order,
            am_id,
            op,
            reducers,
            executor: StepExecutor::new(),
            completion_slot: Vec::new(),
        };

        let mut ring = take_slots(group);
        let result = ring.acquire(coll_id, request);
        if result.is_ok() {
            dispatcher::trigger_current_step(group, &mut ring, coll_id);
        }
        put_back_slots(group, ring);
        result.map(|()| CollectiveHandle { group_id, coll_id })
    })
    .ok_or_else(no_such_group)?
}

/// Binds every phase of `plan` to `params`'s buffers, in phase order, via
/// [`crate::planner::builtin::method::build_step`]. The last phase gets `LAST_STEP` set so the
/// executor knows to complete the op, rather than advance, once it is satisfied.
fn build_steps(
    plan: Plan,
    params: &TriggerParams,
    config: &crate::config::Config,
    callbacks: &dyn crate::callbacks::RuntimeCallbacks,
) -> (Vec<Step>, Vec<Option<Reducer>>) {
    let total = plan.phases.len();
    let mut steps = Vec::with_capacity(total);
    let mut reducers = Vec::with_capacity(total);
    for (idx, phase) in plan.phases.into_iter().enumerate() {
        let is_last = idx + 1 == total;
        let (step, reducer) = method::build_step(phase, &params.operand, params.reduce, params.variadic.clone(), is_last, config, callbacks);
        steps.push(step);
        reducers.push(reducer);
    }
    (steps, reducers)
}

/// Maps a collective's modifiers onto the op-level flags that describe it, so the (not yet
/// implemented) fault-tolerance rerouting hook can branch on an op's shape without re-deriving it
/// from the plan.
fn op_flags(collective: CollectiveType) -> OpFlags {
    let m = collective.modifiers;
    let mut flags = OpFlags::OPTIMIZE_PENDING;
    if m.contains(CollectiveModifiers::BARRIER) {
        flags |= OpFlags::BARRIER;
    }
    if m.contains(CollectiveModifiers::AGGREGATE) {
        flags |= OpFlags::REDUCE;
    }
    if m.contains(CollectiveModifiers::SYMMETRIC) && m.contains(CollectiveModifiers::CONCATENATE) {
        flags |= OpFlags::ALL_TO_ALL;
    }
    if m.contains(CollectiveModifiers::SINGLE_SOURCE) && m.contains(CollectiveModifiers::CONCATENATE) {
        flags |= OpFlags::SCATTER;
    }
    if m.contains(CollectiveModifiers::SINGLE_DESTINATION) && m.contains(CollectiveModifiers::CONCATENATE) {
        flags |= OpFlags::GATHER_TERMINAL;
    }
    if m.contains(CollectiveModifiers::NONCONTIG_DATATYPE) {
        flags |= OpFlags::NON_CONTIGUOUS;
    }
    flags
}

/// Routes one inbound active message to its group and, within it, its request, via
/// [`crate::dispatcher::dispatch`]. Returns `NoSuchRequest` both when the group itself doesn't
/// exist (already destroyed) and when the group exists but the targeted slot doesn't (the op
/// already completed, or was cancelled).
pub fn deliver<T: Transport>(ctx: &Context<T>, group_id: GroupId, header: WireHeader, payload: &[u8]) -> DispatchOutcome {
    let callbacks = ctx.callbacks().clone();
    ctx.with_group_mut(group_id, |group| {
        let mut ring = take_slots(group);
        let outcome = dispatcher::dispatch(group, &mut ring, callbacks.as_ref(), header, payload);
        put_back_slots(group, ring);
        outcome
    })
    .unwrap_or(DispatchOutcome::NoSuchRequest)
}

/// Drives the transport's own progress function, then walks the group's resend queue once,
/// retrying every entry still parked in `Resend` state. An entry that fails again is left on the
/// queue for the next tick.
pub fn progress<T: Transport>(ctx: &mut Context<T>, group_id: GroupId) {
    ctx.transport_mut().progress();
    ctx.with_group_mut(group_id, |group| {
        retry_resend_queue(group);
    });
}

/// One pass over the group's resend queue (§4.4): every slot still parked in `Resend` gets one
/// retry attempt; a slot that clears `Resend` is driven forward exactly as a fresh trigger or an
/// incoming message would drive it, via the same [`dispatcher::handle_step_outcome`] tail every
/// other call site uses.
fn retry_resend_queue<E: Endpoint>(group: &mut Group<E>) {
    let queue = std::mem::take(&mut group.resend_queue);
    let mut ring = take_slots(group);
    let mut remaining = Vec::with_capacity(queue.len());

    for coll_id in queue {
        let idx = ring.index_for(coll_id);
        let next = {
            let Some(request) = ring.slot_mut(idx).request.as_mut() else { continue };
            if request.coll_id != coll_id || !matches!(request.executor.state, StepState::Resend) {
                continue;
            }
            let am_id = request.am_id;
            let Some(step) = request.op.current_step_mut() else { continue };
            if request.executor.retry(step, group, am_id).is_err() || matches!(request.executor.state, StepState::Resend) {
                None
            } else {
                let current = request.op.current_step;
                let pending = request.op.pending[current];
                let step = &mut request.op.steps[current];
                Some(request.executor.finish_if_locally_done(step, pending))
            }
        };

        match next {
            Some(outcome) => dispatcher::handle_step_outcome(group, &mut ring, idx, coll_id, outcome),
            None => remaining.push(coll_id),
        }
    }

    group.resend_queue = remaining;
    put_back_slots(group, ring);
}

/// Best-effort cancellation (§5): marks the op cancelled, invokes its completion notification
/// with [`CoreError::Cancelled`], and releases its slot immediately. A send already in flight at
/// the transport layer is not retracted; the peer(s) may still see it arrive, but this side stops
/// waiting on it and the slot is free for reuse the instant this call returns.
pub fn cancel<T: Transport>(ctx: &Context<T>, group_id: GroupId, coll_id: u8) -> bool {
    ctx.with_group_mut(group_id, |group| {
        let mut ring = take_slots(group);
        let idx = ring.index_for(coll_id);
        let found = match ring.slot_mut(idx).request.as_mut() {
            Some(request) if request.coll_id == coll_id => {
                request.op.cancel();
                request.op.complete(Err(CoreError::Cancelled), &mut request.completion_slot);
                true
            }
            _ => false,
        };
        if found {
            ring.release(coll_id);
        }
        put_back_slots(group, ring);
        found
    })
    .unwrap_or(false)
}

/// Resets a persistent op for its next trigger and re-triggers it in place, reusing the same
/// slot rather than acquiring a new one (the `PERSISTENT` modifier's retrigger path).
pub fn retrigger<T: Transport>(ctx: &Context<T>, group_id: GroupId, coll_id: u8, completion: CompletionNotify) -> Result<(), CoreError> {
    let no_such_group = || CoreError::InvalidParameter(format!("no such group {}", group_id.0));
    let no_such_request = || CoreError::InvalidParameter(format!("no request for coll_id {coll_id} in group {}", group_id.0));

    ctx.with_group_mut(group_id, |group| -> Result<(), CoreError> {
        let mut ring = take_slots(group);
        let idx = ring.index_for(coll_id);
        let rearmed = match ring.slot_mut(idx).request.as_mut() {
            Some(request) if request.coll_id == coll_id => {
                request.op.rearm(completion);
                request.executor = StepExecutor::new();
                request.next_expected_step = 0;
                true
            }
            _ => false,
        };
        if rearmed {
            dispatcher::trigger_current_step(group, &mut ring, coll_id);
        }
        put_back_slots(group, ring);
        if rearmed {
            Ok(())
        } else {
            Err(no_such_request())
        }
    })
    .ok_or_else(no_such_group)?
}

/// Temporarily takes the group's concurrency ring out so its caller can hold a mutable borrow of
/// both the ring and the rest of the group (which the ring's own steps need, for endpoint access)
/// at once — the two would otherwise alias through the same `&mut Group`. Always paired with
/// [`put_back_slots`] before the group is handed back.
fn take_slots<E: Endpoint>(group: &mut Group<E>) -> SlotRing {
    std::mem::replace(&mut group.slots, SlotRing::empty())
}

fn put_back_slots<E: Endpoint>(group: &mut Group<E>, ring: SlotRing) {
    group.slots = ring;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::{FaultDisposition, IntegerKind, NativeDatatype, NativeReduceOp, NeighborTopology, ReduceOpKind, RuntimeCallbacks};
    use crate::config::Config;
    use crate::distance::{Distance, DistanceModel};
    use crate::group::GroupParams;
    use crate::planner::builtin::BuiltinPlanner;
    use crate::transport::{Capabilities, InterfaceAttributes, MemoryDomain, MemoryDomainAttributes, SendOutcome};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Default)]
    struct LoopbackEndpoint;

    impl Endpoint for LoopbackEndpoint {
        fn attributes(&self) -> InterfaceAttributes {
            InterfaceAttributes {
                caps: Capabilities::AM_SHORT | Capabilities::AM_BCOPY,
                am_short_max: 256,
                am_bcopy_max: 8192,
                zcopy_min: 16384,
                zcopy_max: usize::MAX,
                rkey_packed_size: 0,
            }
        }
        fn is_connected(&self) -> bool {
            true
        }
        fn connect_remote(&mut self) -> Result<(), CoreError> {
            Ok(())
        }
        fn am_short(&mut self, _am_id: u8, _header: u64, _payload: &[u8]) -> SendOutcome {
            SendOutcome::Complete
        }
        fn am_bcopy(&mut self, am_id: u8, header: u64, payload: &[u8]) -> SendOutcome {
            self.am_short(am_id, header, payload)
        }
        fn am_zcopy(&mut self, am_id: u8, header: u64, payload: &[u8]) -> SendOutcome {
            self.am_short(am_id, header, payload)
        }
        fn put_zcopy(&mut self, _payload: &[u8], _remote_addr: u64, _rkey: &[u8]) -> SendOutcome {
            SendOutcome::Complete
        }
        fn get_zcopy(&mut self, _buffer: &mut [u8], _remote_addr: u64, _rkey: &[u8]) -> SendOutcome {
            SendOutcome::Complete
        }
        fn poll_completions(&mut self) -> Vec<u64> {
            Vec::new()
        }
    }

    #[derive(Default)]
    struct LoopbackTransport;
    impl MemoryDomain for LoopbackTransport {
        fn register(&mut self, _region: &[u8]) -> Result<MemoryDomainAttributes, CoreError> {
            Ok(MemoryDomainAttributes {
                local_handle: 0,
                rkey_packed_size: 0,
            })
        }
        fn deregister(&mut self, _local_handle: u64) {}
        fn pack_rkey(&self, _local_handle: u64) -> Vec<u8> {
            Vec::new()
        }
    }
    impl Transport for LoopbackTransport {
        type Ep = LoopbackEndpoint;
        fn reserve_am_id(&mut self) -> Result<u8, CoreError> {
            Ok(0)
        }
        fn register_am_handler(&mut self, _am_id: u8) {}
        fn open_endpoint(&mut self, _address: &[u8]) -> Result<LoopbackEndpoint, CoreError> {
            Ok(LoopbackEndpoint)
        }
        fn open_collective_endpoint(&mut self, _members: &[u32], _required: Capabilities) -> Result<LoopbackEndpoint, CoreError> {
            Ok(LoopbackEndpoint)
        }
        fn progress(&mut self) -> bool {
            false
        }
    }

    struct Int32SumCallbacks;
    impl RuntimeCallbacks for Int32SumCallbacks {
        fn address_lookup(&self, _group_id: u32, member_index: u32) -> Result<Vec<u8>, CoreError> {
            Ok(vec![member_index as u8])
        }
        fn neighbor_topology(&self, _group_id: u32) -> NeighborTopology {
            Default::default()
        }
        fn datatype_convert(&self, external: u64) -> NativeDatatype {
            external
        }
        fn datatype_span(&self, _dt: NativeDatatype, count: usize) -> (usize, usize) {
            (count * 4, 4)
        }
        fn datatype_is_contiguous(&self, _dt: NativeDatatype) -> bool {
            true
        }
        fn datatype_element_size(&self, _dt: NativeDatatype) -> usize {
            4
        }
        fn datatype_is_integer(&self, _dt: NativeDatatype) -> IntegerKind {
            IntegerKind {
                is_integer: true,
                is_signed: true,
            }
        }
        fn datatype_is_floating_point(&self, _dt: NativeDatatype) -> bool {
            false
        }
        fn reduce_apply(&self, _op: NativeReduceOp, _src: &[u8], _dst: &mut [u8], _count: usize, _dt: NativeDatatype) {}
        fn reduce_op_kind(&self, _op: NativeReduceOp) -> ReduceOpKind {
            ReduceOpKind {
                is_sum: true,
                is_commutative: true,
                is_loc_expected: false,
            }
        }
        fn fault_handle(&self, _err: &CoreError) -> FaultDisposition {
            FaultDisposition::Unhandled
        }
    }

    fn make_context() -> Context<LoopbackTransport> {
        let mut ctx = Context::init(LoopbackTransport, Arc::new(Int32SumCallbacks), Config::default()).unwrap();
        ctx.register_planner(Arc::new(BuiltinPlanner::new())).unwrap();
        ctx
    }

    fn make_solo_group(ctx: &mut Context<LoopbackTransport>, id: u32) -> GroupId {
        ctx.create_group(GroupParams {
            id: GroupId(id),
            member_count: 1,
            my_index: 0,
            distance: DistanceModel::Fixed(Distance::SelfRank),
            name: String::new(),
        })
        .unwrap()
    }

    #[test]
    fn single_member_barrier_completes_immediately() {
        let mut ctx = make_context();
        let group_id = make_solo_group(&mut ctx, 0);
        let planner = BuiltinPlanner::new();

        let done = Arc::new(AtomicBool::new(false));
        let done2 = done.clone();

        let params = TriggerParams {
            operand: OperandDescriptor {
                send_ptr: None,
                recv_ptr: None,
                count: 0,
                datatype: 0,
            },
            reduce: None,
            variadic: None,
            fault_mode: FaultMode::Fatal,
            completion: CompletionNotify::Callback(Box::new(move |result| {
                assert!(result.is_ok());
                done2.store(true, Ordering::SeqCst);
            })),
            handle_out_of_order: false,
        };

        create(&mut ctx, group_id, &planner, CollectiveType::barrier(), params).unwrap();
        assert!(done.load(Ordering::SeqCst), "a single-member barrier has no peers to wait on and must complete on trigger");
    }

    #[test]
    fn single_member_broadcast_completes_with_write_offset_notify() {
        let mut ctx = make_context();
        let group_id = make_solo_group(&mut ctx, 1);
        let planner = BuiltinPlanner::new();

        let buf = vec![0u8; 4];
        let params = TriggerParams {
            operand: OperandDescriptor {
                send_ptr: Some(buf.as_ptr()),
                recv_ptr: None,
                count: 1,
                datatype: 0,
            },
            reduce: None,
            variadic: None,
            fault_mode: FaultMode::Fatal,
            completion: CompletionNotify::WriteOffset {
                flag_offset: 0,
                status_offset: 1,
            },
            handle_out_of_order: false,
        };

        let handle = create(&mut ctx, group_id, &planner, CollectiveType::broadcast(0), params).unwrap();
        assert_eq!(handle.group_id, group_id);
    }

    #[test]
    fn cancel_on_unknown_coll_id_reports_false() {
        let mut ctx = make_context();
        let group_id = make_solo_group(&mut ctx, 2);
        assert!(!cancel(&ctx, group_id, 7));
    }

    #[test]
    fn deliver_to_nonexistent_group_reports_no_such_request() {
        let ctx = make_context();
        let header = WireHeader {
            group_id: 99,
            coll_id: 0,
            step_idx: 0,
            reserved: 0,
            remote_offset: 0,
        };
        let outcome = deliver(&ctx, GroupId(99), header, &[]);
        assert_eq!(outcome, DispatchOutcome::NoSuchRequest);
    }

    #[test]
    fn retrigger_on_unknown_coll_id_errors() {
        let mut ctx = make_context();
        let group_id = make_solo_group(&mut ctx, 3);
        let result = retrigger(
            &ctx,
            group_id,
            0,
            CompletionNotify::WriteOffset {
                flag_offset: 0,
                status_offset: 1,
            },
        );
        assert!(result.is_err());
    }
}
