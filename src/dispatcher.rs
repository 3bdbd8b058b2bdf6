//! Dispatcher: per-group concurrency slot ring and inbound-message routing
//!
//! §4.6 of the design document, realized as a fixed-size `Vec<Slot>` indexed by `coll_id mod P`
//! (`P` a power of two, so the modulo is a mask). A [`Request`] owns the [`crate::op::Op`] it
//! drives plus the bookkeeping the design document attaches to it (`pending`, the
//! out-of-order/next-expected tracking, the active-message id). Messages that arrive before
//! their step is ready to receive them sit in the slot's `deferred` list until the step catches
//! up, rather than being dropped or misrouted to the wrong step.

use smallvec::SmallVec;

use crate::callbacks::RuntimeCallbacks;
use crate::error::CoreError;
use crate::group::Group;
use crate::op::Op;
use crate::step::executor::{StepExecutor, StepOutcome, StepState};
use crate::step::reducer::Reducer;
use crate::step::SendPlan;
use crate::transport::Endpoint;
use crate::wire::WireHeader;

/// One inbound message that arrived before the matching step entered its receiving phase.
#[derive(Debug, Clone)]
pub struct DeferredMessage {
    pub header: WireHeader,
    pub payload: Vec<u8>,
}

/// A slot's live request: the op it drives, plus the per-request fields §3 attaches to it.
pub struct Request {
    pub coll_id: u8,
    /// The step index this request expects its next inbound message to target. Messages for a
    /// later step arrive out of order and are deferred; messages for this step are applied
    /// immediately.
    pub next_expected_step: u8,
    /// Whether this request tolerates (and buffers) out-of-order fragment arrival within a step,
    /// as opposed to requiring strict in-order delivery.
    pub handle_out_of_order: bool,
    pub am_id: u8,
    pub op: Op,
    /// One reducer per step, selected at step-build time by
    /// [`crate::planner::builtin::method`]; `None` for steps with no `Reduce`/`ReduceSwap`
    /// aggregation.
    pub reducers: Vec<Option<Reducer>>,
    pub executor: StepExecutor,
    /// The user-visible completion slot backing `CompletionNotify::WriteOffset`, if that style
    /// was chosen; unused (empty) for the callback style.
    pub completion_slot: Vec<u8>,
}

/// One entry in the per-group concurrency ring.
#[derive(Default)]
pub struct Slot {
    pub request: Option<Request>,
    pub deferred: SmallVec<[DeferredMessage; 4]>,
}

impl Slot {
    pub fn is_busy(&self) -> bool {
        self.request.is_some()
    }
}

/// The per-group concurrency slot ring, sized `P` (a power of two) at group creation from
/// [`crate::config::Config::max_concurrent_ops`].
pub struct SlotRing {
    slots: Vec<Slot>,
    mask: u8,
}

impl SlotRing {
    pub fn new(capacity: u8) -> Self {
        assert!(capacity.is_power_of_two(), "slot ring capacity must be a power of two");
        SlotRing {
            slots: (0..capacity).map(|_| Slot::default()).collect(),
            mask: capacity - 1,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// `slot = coll_id mod P`, realized as a mask since `P` is a power of two.
    pub fn index_for(&self, coll_id: u8) -> usize {
        (coll_id & self.mask) as usize
    }

    pub fn slot(&self, idx: usize) -> &Slot {
        &self.slots[idx]
    }

    pub fn slot_mut(&mut self, idx: usize) -> &mut Slot {
        &mut self.slots[idx]
    }

    /// Claims the slot for `coll_id`, failing with [`CoreError::Unsupported`] if it is already
    /// busy (the concurrency-limit invariant in §3: no more than `P` ops per group in flight; the
    /// `(P+1)`-th trigger must block at the caller, not silently overwrite the slot).
    pub fn acquire(&mut self, coll_id: u8, request: Request) -> Result<(), CoreError> {
        let idx = self.index_for(coll_id);
        let slot = &mut self.slots[idx];
        if slot.is_busy() {
            return Err(CoreError::Unsupported(format!(
                "slot {idx} busy: at most {} operations may be in flight per group",
                self.slots.len()
            )));
        }
        slot.request = Some(request);
        Ok(())
    }

    /// Releases the slot once the op's final completion callback has fired.
    pub fn release(&mut self, coll_id: u8) {
        let idx = self.index_for(coll_id);
        self.slots[idx].request = None;
        self.slots[idx].deferred.clear();
    }

    /// A ring with no slots at all, used as a placeholder by [`crate::collective`] while it has
    /// temporarily `mem::replace`d a group's real ring out so it can borrow the group and the
    /// ring mutably at the same time.
    pub(crate) fn empty() -> Self {
        SlotRing {
            slots: Vec::new(),
            mask: 0,
        }
    }
}

/// What the caller should do after routing one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The message was applied to its step immediately.
    Applied(StepOutcome),
    /// The message's step hasn't started receiving yet; it was buffered in the slot's deferred
    /// list.
    Deferred,
    /// No request occupies the target slot (the op already completed, or was cancelled and its
    /// slot released); the message is silently dropped, matching the "no-ops until slot release"
    /// cancellation policy in §5.
    NoSuchRequest,
}

/// Routes one inbound active message, per the 5-step algorithm in §4.6. The group lookup (step 2:
/// "looks up the group by id in the context's locked pointer array") is the caller's
/// responsibility — this function is handed the already-resolved group.
pub fn dispatch<E: Endpoint>(
    group: &mut Group<E>,
    ring: &mut SlotRing,
    callbacks: &dyn RuntimeCallbacks,
    header: WireHeader,
    payload: &[u8],
) -> DispatchOutcome {
    let idx = ring.index_for(header.coll_id);

    let outcome = {
        let slot = ring.slot_mut(idx);
        let request = match &mut slot.request {
            Some(r) if r.coll_id == header.coll_id => r,
            _ => return DispatchOutcome::NoSuchRequest,
        };

        if header.step_idx != request.next_expected_step {
            slot.deferred.push(DeferredMessage {
                header,
                payload: payload.to_vec(),
            });
            return DispatchOutcome::Deferred;
        }

        apply_to_current_step(group, request, callbacks, header, payload)
    };

    if let DispatchOutcome::Applied(step_outcome) = outcome {
        let drain_after = matches!(step_outcome, StepOutcome::AdvanceToNextStep);
        handle_step_outcome(group, ring, idx, header.coll_id, step_outcome);
        if drain_after {
            drain_deferred(group, ring, callbacks, idx);
        }
    }

    outcome
}

fn advance_to_next_step(ring: &mut SlotRing, idx: usize) {
    if let Some(request) = ring.slot_mut(idx).request.as_mut() {
        request.op.current_step += 1;
        request.next_expected_step += 1;
        request.executor.state = StepState::Ready;
    }
}

fn rearm_current_step(ring: &mut SlotRing, idx: usize) {
    if let Some(request) = ring.slot_mut(idx).request.as_mut() {
        request.executor.state = StepState::Ready;
    }
}

/// Shared tail of every call site that just observed a [`StepOutcome`] for a slot's current
/// step: advances/rearms/finalizes as needed, and (for the two outcomes that leave the op still
/// running) retriggers the next step immediately. Used by `dispatch`, `drain_deferred`, and
/// `crate::collective`'s resend-queue walk, so the three places an op can be driven forward from
/// never disagree about what each outcome means.
pub(crate) fn handle_step_outcome<E: Endpoint>(group: &mut Group<E>, ring: &mut SlotRing, idx: usize, coll_id: u8, outcome: StepOutcome) {
    match outcome {
        StepOutcome::AdvanceToNextStep => {
            advance_to_next_step(ring, idx);
            trigger_current_step(group, ring, coll_id);
        }
        StepOutcome::ReenterSend => {
            rearm_current_step(ring, idx);
            trigger_current_step(group, ring, coll_id);
        }
        StepOutcome::OpComplete => finalize_slot(ring, idx, coll_id),
        StepOutcome::StillWaiting => {}
    }
}

/// The total number of outstanding zero-copy sends a freshly triggered step owes itself a local
/// completion for, fed into [`StepExecutor::initial_pending`]. Every peer in the step's peer set
/// gets the same fragment count (the step builder already collapsed the peer set to a single
/// negotiated send kind), so this is just peers × fragments for any step that sends at all.
fn zcopy_send_count(step: &crate::step::Step) -> u32 {
    if matches!(step.send_plan, SendPlan::ReceiveOnly) {
        0
    } else {
        (step.peer_handles().len().max(1) as u32) * step.fragments_total.max(1)
    }
}

/// Triggers the slot's current step and drives it through however many locally-resolved steps
/// follow immediately (see [`StepExecutor::finish_if_locally_done`]), stopping once the op
/// genuinely needs to wait on the network, gets parked on the resend queue, or completes.
///
/// Issues the send side of the step an op just advanced into. A step entered via `on_incoming`
/// never triggers itself (receiving a message is not the same event as being ready to send), so
/// the caller that observed `AdvanceToNextStep` is responsible for starting the new current
/// step; this is that responsibility, shared by `dispatch`, `drain_deferred`, and
/// `crate::collective`. A step whose send side hits `NoResource` lands in the group's resend
/// queue exactly like a direct `trigger`/`retry` call would (§4.4); a connection error is
/// treated the same way, since this has no error channel of its own to propagate it through.
pub(crate) fn trigger_current_step<E: Endpoint>(group: &mut Group<E>, ring: &mut SlotRing, coll_id: u8) {
    let idx = ring.index_for(coll_id);
    loop {
        let next = {
            let Some(request) = ring.slot_mut(idx).request.as_mut() else { return };
            if request.coll_id != coll_id {
                return;
            }
            let current = request.op.current_step;
            if current >= request.op.steps.len() {
                return;
            }

            request.op.pending[current] = StepExecutor::initial_pending(&request.op.steps[current], zcopy_send_count(&request.op.steps[current]));

            let am_id = request.am_id;
            let step = &mut request.op.steps[current];
            if request.executor.trigger(step, group, am_id).is_err() {
                request.executor.state = StepState::Resend;
            }
            if matches!(request.executor.state, StepState::Resend) {
                group.resend_queue.push(coll_id);
                return;
            }

            let pending = request.op.pending[current];
            let step = &mut request.op.steps[current];
            request.executor.finish_if_locally_done(step, pending)
        };

        match next {
            StepOutcome::AdvanceToNextStep => advance_to_next_step(ring, idx),
            StepOutcome::ReenterSend => rearm_current_step(ring, idx),
            StepOutcome::OpComplete => {
                finalize_slot(ring, idx, coll_id);
                return;
            }
            StepOutcome::StillWaiting => return,
        }
    }
}

/// Invokes the op's completion notification and releases its slot. Called once, from whichever
/// of `dispatch`/`drain_deferred`/`trigger_current_step`/`crate::collective` first observes
/// `StepOutcome::OpComplete`.
pub(crate) fn finalize_slot(ring: &mut SlotRing, idx: usize, coll_id: u8) {
    if let Some(request) = ring.slot_mut(idx).request.as_mut() {
        request.op.complete(Ok(()), &mut request.completion_slot);
    }
    ring.release(coll_id);
}

/// Applies one inbound message's payload to the request's current step via its completion
/// aggregator, then asks the step executor whether the step (and, transitively, the op) is now
/// complete.
fn apply_to_current_step<E: Endpoint>(
    _group: &mut Group<E>,
    request: &mut Request,
    callbacks: &dyn RuntimeCallbacks,
    header: WireHeader,
    payload: &[u8],
) -> DispatchOutcome {
    use crate::step::CompletionAggregation;

    let op = &mut request.op;
    let current = op.current_step;
    if current >= op.steps.len() {
        return DispatchOutcome::NoSuchRequest;
    }
    let step = &mut op.steps[current];

    if let Some(recv_ptr) = step.recv_buffer {
        let offset = header.remote_offset as usize;
        let len = payload.len();
        match step.aggregation {
            CompletionAggregation::Nop => {}
            CompletionAggregation::Write | CompletionAggregation::WriteOutOfOrder | CompletionAggregation::Gather => {
                // SAFETY: `recv_buffer` is valid for `buffer_length` bytes for the lifetime of
                // the step (§5 single-writer scheduling model); `remote_offset` is bounds-checked
                // by the planner's fragmentation accounting before any send ever carries it.
                unsafe {
                    let dst = std::slice::from_raw_parts_mut(recv_ptr.add(offset), len.min(step.buffer_length.saturating_sub(offset)));
                    let copy_len = dst.len();
                    dst.copy_from_slice(&payload[..copy_len]);
                }
            }
            CompletionAggregation::Reduce | CompletionAggregation::ReduceSwap => {
                let swap = matches!(step.aggregation, CompletionAggregation::ReduceSwap);
                if let Some(reducer) = request.reducers[current].as_ref() {
                    let copy_len = len.min(step.buffer_length.saturating_sub(offset));
                    let elem = step.reduce_element_size.max(1);
                    let count = copy_len / elem;
                    let copy_len = count * elem;
                    // SAFETY: see the `Write` arm above; `reduce_apply`/specializations only
                    // ever read `count` elements starting at the destination's current offset.
                    unsafe {
                        let dst = std::slice::from_raw_parts_mut(recv_ptr.add(offset), copy_len);
                        if swap {
                            // AGGREGATE_STABLE: fold as `incoming op accumulator` to preserve a
                            // fixed left-to-right order regardless of arrival order.
                            let mut tmp = payload[..copy_len].to_vec();
                            reducer.apply(dst, &mut tmp, count, callbacks);
                            dst.copy_from_slice(&tmp);
                        } else {
                            reducer.apply(&payload[..copy_len], dst, count, callbacks);
                        }
                    }
                }
            }
            CompletionAggregation::UnpackRemoteKey => {
                let mut rkey = smallvec::SmallVec::<[u8; 32]>::new();
                rkey.extend_from_slice(payload);
                step.remote_rkey = Some(rkey);
            }
        }
    }

    let op = &mut request.op;
    let step = &mut op.steps[current];
    let pending = &mut op.pending[current];
    DispatchOutcome::Applied(request.executor.on_incoming(step, pending))
}

/// After a step advances, replays any messages that were deferred while waiting for it, in FIFO
/// arrival order, until one of them fails to match the (now current) expected step.
fn drain_deferred<E: Endpoint>(group: &mut Group<E>, ring: &mut SlotRing, callbacks: &dyn RuntimeCallbacks, idx: usize) {
    loop {
        let next = {
            let slot = ring.slot(idx);
            let Some(request) = &slot.request else { return };
            slot.deferred
                .iter()
                .position(|m| m.header.step_idx == request.next_expected_step)
        };
        let Some(pos) = next else { return };
        let msg = ring.slot_mut(idx).deferred.remove(pos);

        let outcome = {
            let Some(request) = ring.slot_mut(idx).request.as_mut() else { return };
            apply_to_current_step(group, request, callbacks, msg.header, &msg.payload)
        };

        match outcome {
            DispatchOutcome::Applied(step_outcome @ (StepOutcome::AdvanceToNextStep | StepOutcome::ReenterSend)) => {
                handle_step_outcome(group, ring, idx, msg.header.coll_id, step_outcome);
            }
            DispatchOutcome::Applied(StepOutcome::OpComplete) => {
                finalize_slot(ring, idx, msg.header.coll_id);
                return;
            }
            _ => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_for_wraps_with_mask() {
        let ring = SlotRing::new(16);
        assert_eq!(ring.index_for(0), 0);
        assert_eq!(ring.index_for(16), 0);
        assert_eq!(ring.index_for(17), 1);
    }

    #[test]
    fn acquire_rejects_busy_slot() {
        let mut ring = SlotRing::new(2);
        let request = Request {
            coll_id: 0,
            next_expected_step: 0,
            handle_out_of_order: false,
            am_id: 0,
            op: Op::new(Vec::new(), crate::op::OpFlags::empty(), crate::op::FaultMode::Fatal),
            reducers: Vec::new(),
            executor: StepExecutor::new(),
            completion_slot: Vec::new(),
        };
        ring.acquire(0, request).unwrap();
        let request2 = Request {
            coll_id: 2,
            next_expected_step: 0,
            handle_out_of_order: false,
            am_id: 0,
            op: Op::new(Vec::new(), crate::op::OpFlags::empty(), crate::op::FaultMode::Fatal),
            reducers: Vec::new(),
            executor: StepExecutor::new(),
            completion_slot: Vec::new(),
        };
        assert!(ring.acquire(2, request2).is_err());
    }

    #[test]
    fn release_clears_slot_and_deferred() {
        let mut ring = SlotRing::new(2);
        let request = Request {
            coll_id: 0,
            next_expected_step: 0,
            handle_out_of_order: false,
            am_id: 0,
            op: Op::new(Vec::new(), crate::op::OpFlags::empty(), crate::op::FaultMode::Fatal),
            reducers: Vec::new(),
            executor: StepExecutor::new(),
            completion_slot: Vec::new(),
        };
        ring.acquire(0, request).unwrap();
        ring.release(0);
        assert!(!ring.slot(0).is_busy());
    }
}
