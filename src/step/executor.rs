//! Step executor
//!
//! Drives one [`Step`](crate::step::Step) from `READY` to `COMPLETE`, negotiating fragmentation,
//! pipelining, and resend on transient transport exhaustion. This module is the largest single
//! piece of the core by design (§2): every combination of send kind and modifier the step
//! builder considered viable funnels through [`StepExecutor::trigger`] and
//! [`StepExecutor::on_send_outcome`].

use smallvec::SmallVec;

use crate::error::CoreError;
use crate::group::Group;
use crate::step::{pipeline_sentinel, CompletionAction, CompletionAggregation, CompletionCriterion, SendPlan, Step, StepFlags};
use crate::transport::{Endpoint, SendOutcome};

/// The step's place in its own lifecycle. `Resend` is not a design-document state so much as a
/// restatement of it: a step parked on the resend queue is, from the outside, still `Sending` —
/// but the executor tracks it separately so a resend-queue walk never re-triggers a step that
/// is genuinely waiting on a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    Ready,
    Sending,
    Waiting,
    Complete,
    Resend,
}

/// A snapshot of the two iterators the resend-idempotence property (§8 invariant 3) is about.
/// Saved before every transport call and restored verbatim on `NoResource`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IterSnapshot {
    iter_ep: u32,
    iter_offset: u64,
}

/// Drives a single step. Owns no state beyond what it needs to track progress; the step itself
/// (and its group, for endpoint access) are borrowed for the duration of each call.
pub struct StepExecutor {
    pub state: StepState,
}

impl Default for StepExecutor {
    fn default() -> Self {
        StepExecutor {
            state: StepState::Ready,
        }
    }
}

impl StepExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// `pending` at step entry: expected incoming fragments, plus one per outgoing zero-copy
    /// completion still owed back to this step.
    pub fn initial_pending(step: &Step, outgoing_zcopy_completions: u32) -> u32 {
        let expected_incoming = if matches!(step.criterion, CompletionCriterion::LocalSendDone) {
            0
        } else {
            // `fragments_total` is derived from this step's own buffer_length/fragment_length,
            // which for an elementwise-fold aggregation (unlike gather/concatenate, where the
            // receive-side operand count is the already-total, across-contributors size) is
            // always just one contributor's fragment count: every peer folds a same-shaped
            // buffer into the same accumulator, so a multi-child reduce waypoint owes one full
            // set of fragments per child, not one set total.
            let per_peer = step.fragments_total.max(1);
            let fan_in = matches!(
                step.aggregation,
                CompletionAggregation::Reduce | CompletionAggregation::ReduceSwap
            );
            if fan_in {
                per_peer * step.peer_handles().len().max(1) as u32
            } else {
                per_peer
            }
        };
        let zcopy_component = if step.flags.contains(StepFlags::AM_ZCOPY)
            || step.flags.contains(StepFlags::PUT_ZCOPY)
            || step.flags.contains(StepFlags::GET_ZCOPY)
        {
            outgoing_zcopy_completions
        } else {
            0
        };
        expected_incoming + zcopy_component
    }

    /// Triggers the step: issues the send side per [`SendPlan`], transitioning `Ready` into
    /// `Sending` or `Waiting` (a pure-receive step has nothing to send and goes straight to
    /// `Waiting`). `am_id` is the active-message id this request's planner negotiated at
    /// registration (`Context::register_planner`/`Transport::reserve_am_id`), used as the
    /// dispatch key on every send this step issues.
    pub fn trigger<E: Endpoint>(&mut self, step: &mut Step, group: &mut Group<E>, am_id: u8) -> Result<(), CoreError> {
        debug_assert_eq!(self.state, StepState::Ready);
        if matches!(step.send_plan, SendPlan::ReceiveOnly) {
            self.state = StepState::Waiting;
            return Ok(());
        }
        self.state = StepState::Sending;
        self.drive_send(step, group, am_id)
    }

    /// Re-issues the send side from wherever `iter_ep`/`iter_offset` left off. Called both by
    /// `trigger` and by the resend-queue walk.
    fn drive_send<E: Endpoint>(&mut self, step: &mut Step, group: &mut Group<E>, am_id: u8) -> Result<(), CoreError> {
        let peers = step.peer_handles();
        loop {
            if step.iter_ep as usize >= peers.len() {
                step.iter_ep = 0;
                self.state = StepState::Waiting;
                return Ok(());
            }
            let ep_idx = step.iter_ep as usize;
            let fragment_idx = if step.is_fragmented() {
                (step.iter_offset / step.fragment_length.max(1) as u64) as u32
            } else {
                0
            };

            let snapshot = IterSnapshot {
                iter_ep: step.iter_ep,
                iter_offset: step.iter_offset,
            };

            let (offset, len) = step.local_fragment(ep_idx, fragment_idx);
            let outcome = issue_send(step, group, ep_idx, offset, len, fragment_idx, am_id);

            match outcome {
                SendOutcome::NoResource => {
                    // Resend idempotence: restore the pre-call iterator state exactly.
                    step.iter_ep = snapshot.iter_ep;
                    step.iter_offset = snapshot.iter_offset;
                    if step.is_pipelined() {
                        step.iter_offset = pipeline_sentinel::PENDING;
                    }
                    self.state = StepState::Resend;
                    return Ok(());
                }
                SendOutcome::Complete | SendOutcome::InProgress(_) => {
                    advance_iterators(step, &peers);
                    if matches!(step.send_plan, SendPlan::OneShot | SendPlan::FragmentedSingle)
                        && step.iter_offset == 0
                    {
                        // OneShot/FragmentedSingle completed their single endpoint's full
                        // fragment sequence; fall through to the "all peers done" check above
                        // on the next loop iteration by advancing iter_ep past bounds.
                        step.iter_ep = peers.len() as u32;
                    }
                }
            }
        }
    }

    /// Called when a matching incoming message/fragment arrives for this step. Decrements
    /// `pending`; when it reaches zero, runs the step's completion action.
    pub fn on_incoming(&mut self, step: &mut Step, pending: &mut u32) -> StepOutcome {
        debug_assert!(matches!(self.state, StepState::Waiting | StepState::Sending));
        *pending = pending.saturating_sub(1);
        self.finish_if_satisfied(step, *pending)
    }

    /// Runs the step's completion action if `pending` is already zero, otherwise reports
    /// `StillWaiting` without touching `self.state`.
    ///
    /// Shared by [`StepExecutor::on_incoming`] (which always calls this right after
    /// decrementing) and by [`StepExecutor::finish_if_locally_done`] (which calls it without any
    /// decrement, for steps that start out satisfied).
    fn finish_if_satisfied(&mut self, step: &mut Step, pending: u32) -> StepOutcome {
        if pending != 0 {
            return StepOutcome::StillWaiting;
        }
        self.state = StepState::Complete;
        match step.action {
            CompletionAction::AdvanceStep => {
                if step.is_last() {
                    StepOutcome::OpComplete
                } else {
                    StepOutcome::AdvanceToNextStep
                }
            }
            CompletionAction::ReenterSend => {
                self.state = StepState::Ready;
                StepOutcome::ReenterSend
            }
        }
    }

    /// Checks whether a step that just finished triggering is already done, for
    /// `CompletionCriterion::LocalSendDone` steps whose pending count starts at zero: no inbound
    /// message or zero-copy completion will ever arrive to drive them through `on_incoming`, so
    /// without this call they would sit in `Waiting` forever. A no-op for any step not currently
    /// `Waiting` (a step still `Sending` genuinely has more to do).
    pub fn finish_if_locally_done(&mut self, step: &mut Step, pending: u32) -> StepOutcome {
        if !matches!(self.state, StepState::Waiting) {
            return StepOutcome::StillWaiting;
        }
        self.finish_if_satisfied(step, pending)
    }

    /// Drains one zero-copy completion, decrementing pending the same way an incoming message
    /// would.
    pub fn on_zcopy_completion(&mut self, step: &mut Step, pending: &mut u32) -> StepOutcome {
        self.on_incoming(step, pending)
    }

    /// Re-drives a step parked in `Resend` state. Called once per entry on every resend-queue
    /// progress tick (§4.4); a failing entry leaves the queue unchanged for the caller to retry
    /// next tick.
    pub fn retry<E: Endpoint>(&mut self, step: &mut Step, group: &mut Group<E>, am_id: u8) -> Result<(), CoreError> {
        debug_assert_eq!(self.state, StepState::Resend);
        self.state = StepState::Sending;
        self.drive_send(step, group, am_id)
    }
}

/// What the caller (the op driver / dispatcher) should do after a completion event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    StillWaiting,
    AdvanceToNextStep,
    ReenterSend,
    OpComplete,
}

fn advance_iterators(step: &mut Step, peers: &SmallVec<[crate::group::endpoint_cache::EndpointHandle; 8]>) {
    if step.is_fragmented() {
        step.iter_offset += step.fragment_length as u64;
        if step.iter_offset >= step.buffer_length as u64 {
            step.iter_offset = 0;
            step.iter_ep += 1;
        } else if step.is_pipelined() {
            step.iter_offset = pipeline_sentinel::READY;
        }
    } else {
        step.iter_ep += 1;
    }
    if step.iter_ep as usize >= peers.len() {
        step.iter_ep = peers.len() as u32;
    }
}

fn issue_send<E: Endpoint>(step: &Step, group: &mut Group<E>, ep_idx: usize, offset: usize, len: usize, fragment_idx: u32, am_id: u8) -> SendOutcome {
    let peers = step.peer_handles();
    let handle = peers[ep_idx];
    let endpoint = group.endpoint_mut(handle);
    // Low byte carries the step index, the rest the destination-buffer offset this fragment
    // belongs at; a real transport's AM header is this crate's only channel for conveying that to
    // the peer's `deliver` call, since `am_header_template` alone (always 0 today) has no way to
    // express either. `offset` addresses this step's own send buffer; `remote_offset` translates
    // that into where the fragment belongs in the *peer's* receive buffer (see `Step::remote_offset`).
    let remote_offset = step.remote_offset(offset, fragment_idx);
    let header = step.am_header_template | (step.phase.step_idx as u64) | ((remote_offset as u64) << 8);
    // SAFETY: `send_buffer` is valid for `buffer_length` bytes for the lifetime of the step,
    // per the scheduling model in §5 (single-threaded progress, no send outlives its op).
    let payload: &[u8] = match step.send_buffer {
        Some(ptr) => unsafe { std::slice::from_raw_parts(ptr.add(offset), len) },
        None => &[],
    };
    if step.flags.contains(StepFlags::AM_SHORT) {
        endpoint.am_short(am_id, header, payload)
    } else if step.flags.contains(StepFlags::AM_BCOPY) {
        endpoint.am_bcopy(am_id, header, payload)
    } else if step.flags.contains(StepFlags::AM_ZCOPY) {
        endpoint.am_zcopy(am_id, header, payload)
    } else if step.flags.contains(StepFlags::PUT_ZCOPY) {
        let addr = step.remote_addr.unwrap_or(0);
        let rkey = step.remote_rkey.as_deref().unwrap_or(&[]);
        endpoint.put_zcopy(payload, addr, rkey)
    } else if step.flags.contains(StepFlags::GET_ZCOPY) {
        let addr = step.remote_addr.unwrap_or(0);
        let rkey = step.remote_rkey.as_deref().unwrap_or(&[]);
        match step.recv_buffer {
            // SAFETY: `recv_buffer` is valid for `buffer_length` bytes for the lifetime of the
            // step, per the scheduling model in §5; the get's destination is disjoint from any
            // concurrent send since a step is either GET_ZCOPY or a send-kind, never both.
            Some(ptr) => {
                let dest = unsafe { std::slice::from_raw_parts_mut(ptr.add(offset), len) };
                endpoint.get_zcopy(dest, addr, rkey)
            }
            None => SendOutcome::Complete,
        }
    } else {
        SendOutcome::Complete
    }
}
