//! Step construction
//!
//! Binds one already-resolved [`Phase`] (method, peer endpoints, and their negotiated transport
//! attributes) to the buffers and datatype of a concrete collective trigger, producing an
//! executable [`Step`] plus the [`Reducer`] the dispatcher should apply against it, if any. This
//! is §4.3 of the design document: the contiguity check, transport/send-kind choice,
//! fragmentation, pipelining, reducer selection, and completion-policy assignment all happen
//! here, once per phase, at op-creation time (not at plan-build time — the [`Phase`] list is
//! buffer-independent and is built once by [`crate::planner::builtin::BuiltinPlanner`] and
//! reused across triggers of the same collective on the same group).

use smallvec::SmallVec;

use crate::callbacks::{NativeDatatype, NativeReduceOp, RuntimeCallbacks};
use crate::config::Config;
use crate::plan::{Method, Phase};
use crate::step::reducer::{self, Operand, Operator, Reducer, ReducerKey};
use crate::step::{CompletionAction, CompletionAggregation, CompletionCriterion, FragmentPending, SendPlan, Step, StepFlags};
use crate::transport::Capabilities;

/// The local buffers and datatype bound to one phase of one collective trigger. `send_ptr`/
/// `recv_ptr` point at the already-packed flat representation: non-contiguous datatypes are
/// packed/unpacked by the caller (via [`crate::step::packer::DatatypeIterator`]) before and
/// after the step runs, so the step builder only ever sees a flat byte buffer here.
#[derive(Debug, Clone, Copy)]
pub struct OperandDescriptor {
    pub send_ptr: Option<*const u8>,
    pub recv_ptr: Option<*mut u8>,
    /// Element count of the local (per-rank) contribution, not the full concatenated buffer.
    pub count: usize,
    pub datatype: NativeDatatype,
}

/// The reduce operator bound to a reducing collective. Absent for non-reducing methods.
#[derive(Debug, Clone, Copy)]
pub struct ReduceDescriptor {
    pub op: NativeReduceOp,
    /// Whether the operator needs bit-exact, arrival-order-independent folding
    /// (`AGGREGATE_STABLE`).
    pub stable: bool,
}

/// Explicit per-peer counts/displacements for the `-v` (variadic) collective family. When
/// absent, `build_step` computes a uniform split across `phase.peers` itself.
#[derive(Debug, Clone)]
pub struct VariadicLayout {
    pub counts: SmallVec<[u32; 8]>,
    pub displs: SmallVec<[u32; 8]>,
}

/// Binds `phase` to `operand`, returning the executable step and, for reducing methods, the
/// reducer the dispatcher should apply against incoming contributions.
///
/// `is_last` marks the final step of the whole op (sets `LAST_STEP`, which the executor
/// consults to decide between `AdvanceToNextStep` and `OpComplete`).
pub fn build_step(
    phase: Phase,
    operand: &OperandDescriptor,
    reduce: Option<ReduceDescriptor>,
    variadic: Option<VariadicLayout>,
    is_last: bool,
    config: &Config,
    callbacks: &dyn RuntimeCallbacks,
) -> (Step, Option<Reducer>) {
    let element_size = callbacks.datatype_element_size(operand.datatype).max(1);
    let buffer_length = operand.count * element_size;
    let contiguous = callbacks.datatype_is_contiguous(operand.datatype);

    let (aggregation, has_recv, has_send) = aggregation_for(phase.method, reduce.is_some());
    let recv_buffer = if has_recv { operand.recv_ptr } else { None };
    let send_buffer = if has_send { operand.send_ptr } else { None };

    let single_endpoint = phase.peers.len() <= 1;
    let send_kind = choose_send_kind(&phase, buffer_length, config);

    let mut flags = send_kind;
    if single_endpoint {
        flags |= StepFlags::SINGLE_ENDPOINT;
    }
    if !contiguous {
        flags |= StepFlags::PACKED_DTYPE_MODE;
    }
    if is_last {
        flags |= StepFlags::LAST_STEP;
    }

    let single_message_cap = send_kind_cap(send_kind, &phase);
    // Whether the payload needs more than one message, independent of which side of the step
    // this is: a recv-only step still expects as many incoming fragments as its peer's send
    // side produced, so `fragments_total` (and the pending count it drives) is computed the
    // same way regardless of `has_send`. Only the `FRAGMENTED` flag itself — which governs this
    // step's own send-side iteration in `Step::local_fragment` — is conditioned on `has_send`.
    let needs_fragmentation = single_message_cap > 0 && buffer_length > single_message_cap;
    if needs_fragmentation && has_send {
        flags |= StepFlags::FRAGMENTED;
        if phase.method.is_waypoint() {
            flags |= StepFlags::PIPELINED;
        }
    }
    let fragment_length = if needs_fragmentation { single_message_cap } else { buffer_length.max(1) };
    let fragments_total = if needs_fragmentation {
        ((buffer_length + fragment_length - 1) / fragment_length).max(1) as u32
    } else {
        1
    };

    let (var_counts, var_displs) = if matches!(phase.method, Method::RecursiveKning | Method::ScatterWaypoint) || variadic.is_some() {
        let layout = variadic.unwrap_or_else(|| {
            // A scatter waypoint's `operand.count` is the *whole* region it is about to
            // redistribute (the root's full buffer, or an intermediate forwarder's subtree
            // share), not a single child's count — split it across this phase's peers before
            // falling back to the plain equal-width layout every other variadic method uses.
            let per_peer = if matches!(phase.method, Method::ScatterWaypoint) {
                operand.count as u32 / phase.peers.len().max(1) as u32
            } else {
                operand.count as u32
            };
            uniform_layout(phase.peers.len(), per_peer)
        });
        flags |= StepFlags::SEND_VARIADIC;
        (Some(layout.counts), Some(layout.displs))
    } else {
        (None, None)
    };

    let criterion = if has_recv {
        CompletionCriterion::PendingZero
    } else {
        CompletionCriterion::LocalSendDone
    };

    let step = Step {
        phase,
        send_buffer,
        recv_buffer,
        buffer_length,
        fragment_length,
        fragments_total,
        iter_ep: 0,
        iter_offset: 0,
        fragment_pending: FragmentPending::default(),
        am_header_template: 0,
        flags,
        send_plan: if !has_send {
            SendPlan::ReceiveOnly
        } else {
            SendPlan::from_flags(flags)
        },
        aggregation,
        criterion,
        action: CompletionAction::AdvanceStep,
        var_counts,
        var_displs,
        remote_rkey: None,
        remote_addr: None,
        reduce_element_size: element_size,
    };

    let reducer = reduce.map(|desc| select_reducer(desc, operand.datatype, contiguous, callbacks));
    (step, reducer)
}

/// Maps a [`Method`] to its completion aggregator and whether this phase's step has a receiving
/// and/or sending side. Waypoint and terminal variants of the same family (`ReduceWaypoint` vs.
/// `ReduceTerminal`, etc.) build an identical step shape; the distinction between them is purely
/// which phase [`crate::planner::builtin::phase`] chose to emit, not anything the executor needs
/// to branch on.
fn aggregation_for(method: Method, reducing: bool) -> (CompletionAggregation, bool, bool) {
    match method {
        Method::SendTerminal | Method::SendToSmRoot | Method::BcastWaypoint | Method::ScatterWaypoint => {
            (CompletionAggregation::Nop, false, true)
        }
        Method::ScatterTerminal | Method::RecvTerminal => (CompletionAggregation::Write, true, false),
        Method::ReduceTerminal | Method::ReduceWaypoint => {
            let agg = if reducing {
                CompletionAggregation::Reduce
            } else {
                CompletionAggregation::Nop
            };
            (agg, true, false)
        }
        Method::GatherTerminal | Method::GatherWaypoint => (CompletionAggregation::Gather, true, false),
        Method::RecursiveKning => (CompletionAggregation::WriteOutOfOrder, true, true),
    }
}

/// Chooses exactly one send-kind flag from the peer set's negotiated capabilities, preferring
/// the cheapest kind that still fits the payload, and promoting to zero-copy once the payload
/// crosses `config.bcopy_to_zcopy_threshold` and the peer supports it (§4.3 item 2).
fn choose_send_kind(phase: &Phase, buffer_length: usize, config: &Config) -> StepFlags {
    let caps = phase
        .peer_attrs
        .iter()
        .map(|a| a.interface.caps)
        .fold(Capabilities::all(), |acc, c| acc & c);
    let attrs = phase.peer_attrs.first().map(|a| a.interface);

    if let Some(attrs) = attrs {
        let prefer_zcopy = buffer_length >= config.bcopy_to_zcopy_threshold && caps.contains(Capabilities::AM_ZCOPY);
        if !prefer_zcopy && caps.contains(Capabilities::AM_SHORT) && buffer_length <= attrs.am_short_max {
            return StepFlags::AM_SHORT;
        }
        if !prefer_zcopy && caps.contains(Capabilities::AM_BCOPY) && buffer_length <= attrs.am_bcopy_max {
            return StepFlags::AM_BCOPY;
        }
        if caps.contains(Capabilities::AM_ZCOPY) {
            return StepFlags::AM_ZCOPY;
        }
        if caps.contains(Capabilities::AM_BCOPY) {
            return StepFlags::AM_BCOPY;
        }
    }
    StepFlags::AM_SHORT
}

/// Largest single-message payload the chosen send kind can carry before fragmentation is
/// required, taken from the first peer's negotiated attributes (every peer in one phase shares
/// a method, so a mixed-capability peer set already picked the most conservative common kind in
/// [`choose_send_kind`]).
fn send_kind_cap(send_kind: StepFlags, phase: &Phase) -> usize {
    let Some(attrs) = phase.peer_attrs.first().map(|a| a.interface) else {
        return usize::MAX;
    };
    if send_kind.contains(StepFlags::AM_SHORT) {
        attrs.am_short_max
    } else if send_kind.contains(StepFlags::AM_BCOPY) {
        attrs.am_bcopy_max
    } else {
        attrs.zcopy_max
    }
}

/// Equal-width split of `count` elements across `peers`, for the non-variadic members of the
/// `-v` family (plain all-to-all, all-gather, scatter): every peer gets the same slice, displaced
/// by its position in the phase's own peer list.
fn uniform_layout(peers: usize, count: u32) -> VariadicLayout {
    VariadicLayout {
        counts: std::iter::repeat(count).take(peers).collect(),
        displs: (0..peers as u32).map(|i| i * count).collect(),
    }
}

/// Classifies a runtime reduce-op/datatype pair into the (operator, operand) key
/// [`crate::step::reducer::select`] dispatches on, falling back to `Custom`/`Custom` (which
/// always routes to the runtime callback) for anything the core cannot name structurally.
fn select_reducer(desc: ReduceDescriptor, dt: NativeDatatype, contiguous: bool, callbacks: &dyn RuntimeCallbacks) -> Reducer {
    let op_kind = callbacks.reduce_op_kind(desc.op);
    let operator = if op_kind.is_loc_expected {
        Operator::MinLoc
    } else if op_kind.is_sum {
        Operator::Sum
    } else {
        Operator::Custom
    };
    let integer = callbacks.datatype_is_integer(dt);
    let floating = callbacks.datatype_is_floating_point(dt);
    let size = callbacks.datatype_element_size(dt);
    let operand = match (integer.is_integer, floating, size) {
        (true, _, 4) if integer.is_signed => Operand::I32,
        (true, _, 4) => Operand::U32,
        (true, _, 8) if integer.is_signed => Operand::I64,
        (true, _, 8) => Operand::U64,
        (true, _, 2) if integer.is_signed => Operand::I16,
        (true, _, 2) => Operand::U16,
        (true, _, 1) if integer.is_signed => Operand::I8,
        (true, _, 1) => Operand::U8,
        (_, true, 4) => Operand::F32,
        (_, true, 8) => Operand::F64,
        _ => Operand::Custom,
    };
    let key = ReducerKey {
        operator,
        operand,
        contiguous,
    };
    reducer::select(key, desc.op, dt)
}
