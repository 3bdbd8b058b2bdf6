//! Steps: the executable unit of a plan
//!
//! A [`Step`] is a [`crate::plan::Phase`] bound to real buffers. Its flags, completion policy,
//! and the pre-resolved [`SendPlan`] it carries are all chosen once, by the step builder in
//! [`crate::planner::builtin::method`], and never change for the lifetime of the step (except
//! the optimizer's one-shot rewrite, §4.3).

pub mod executor;
pub mod packer;
pub mod reducer;

use bitflags::bitflags;
use smallvec::SmallVec;

use crate::group::endpoint_cache::EndpointHandle;
use crate::plan::{Method, Phase};

bitflags! {
    /// Orthogonal modifiers on how a step sends. Exactly one "send kind" bit
    /// (`AM_SHORT`/`AM_BCOPY`/`AM_ZCOPY`/`PUT_ZCOPY`/`GET_ZCOPY`) is set; the rest compose
    /// freely. The full set actually produced by the step builder is finite and enumerated by
    /// [`SendPlan`], which is what the executor matches on — this bitfield is the serializable,
    /// inspectable form used for diagnostics and the property tests in §8.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StepFlags: u32 {
        const AM_SHORT = 1 << 0;
        const AM_BCOPY = 1 << 1;
        const AM_ZCOPY = 1 << 2;
        const PUT_ZCOPY = 1 << 3;
        const GET_ZCOPY = 1 << 4;
        const FRAGMENTED = 1 << 5;
        const PIPELINED = 1 << 6;
        const SINGLE_ENDPOINT = 1 << 7;
        const SEND_STRIDED = 1 << 8;
        const SEND_VARIADIC = 1 << 9;
        const RECV_AFTER_SEND = 1 << 10;
        const RECV_BEFORE_SEND1 = 1 << 11;
        const RECV1_BEFORE_SEND = 1 << 12;
        const LAST_STEP = 1 << 13;
        const WRITE_REMOTE_ADDR = 1 << 14;
        const PACKED_DTYPE_MODE = 1 << 15;
    }
}

impl StepFlags {
    pub fn send_kind_bits(self) -> StepFlags {
        self & (StepFlags::AM_SHORT
            | StepFlags::AM_BCOPY
            | StepFlags::AM_ZCOPY
            | StepFlags::PUT_ZCOPY
            | StepFlags::GET_ZCOPY)
    }

    /// Exactly one send-kind bit must be set; everything else is a modifier. This is checked
    /// by the step builder before a step is ever handed to the executor.
    pub fn has_exactly_one_send_kind(self) -> bool {
        self.send_kind_bits().bits().count_ones() == 1
    }
}

/// How incoming fragments/messages for this step are combined into the receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionAggregation {
    /// No aggregation; the step carries no incoming payload (pure send or pure barrier leg).
    Nop,
    /// Blit the payload into the buffer at `remote_offset`, overwriting in arrival order.
    Write,
    /// Like `Write`, but arrival order is explicitly allowed to be out-of-order (the common
    /// case; offsets make this safe).
    WriteOutOfOrder,
    /// Concatenate contributions in member-index order regardless of arrival order (gather).
    Gather,
    /// Fold contributions with the operation's reduce operator as they arrive.
    Reduce,
    /// Like `Reduce`, but swap operand order to preserve a fixed left-to-right fold
    /// (`AGGREGATE_STABLE`).
    ReduceSwap,
    /// The payload is a packed remote memory key; unpack it into the step's rkey slot rather
    /// than the user buffer (the rkey-broadcast preliminary step for PUT/GET-ZCOPY).
    UnpackRemoteKey,
}

/// When a step is considered complete and ready to run its completion action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionCriterion {
    /// `pending` fragments/messages received, and (if this step sends with zero-copy) all
    /// outgoing zero-copy completions observed.
    PendingZero,
    /// Complete as soon as the local send finishes, without waiting for any reply (pure
    /// fan-out legs with no acknowledgement).
    LocalSendDone,
}

/// What happens once a step's completion criterion is met.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionAction {
    /// Advance to the next step in the op (or, if this was the last step, invoke the op's
    /// completion notification with `Ok(())`).
    AdvanceStep,
    /// Re-enter the send side of this same step (waypoint methods that must forward what they
    /// just aggregated/gathered).
    ReenterSend,
}

/// The sum-typed send dispatch the design notes call for in place of the flag-combination
/// switch. Each variant names exactly the control-flow shape the step builder considered
/// viable; the executor match over this type is exhaustive and compiles to a jump table, same
/// as the flag switch it replaces, but the variants are enumerable by a test without decoding a
/// bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPlan {
    /// A single message to a single peer, no fragmentation.
    OneShot,
    /// A single message to a single peer, split into fragments by a byte-offset iterator.
    FragmentedSingle,
    /// One message per peer in `PeerSet::Many`, no fragmentation.
    PerEndpoint,
    /// One message per peer, each itself fragmented; used by waypoint methods forwarding a
    /// large payload to several children.
    PerEndpointFragmented,
    /// Like `PerEndpointFragmented`, but each (endpoint, fragment) pair has an independent
    /// pending counter so a fragment can be forwarded the instant its own inputs arrive
    /// (`PIPELINED`).
    PerEndpointPipelined,
    /// A receive-only leg: no send at all, only a matching incoming message/fragment sequence.
    ReceiveOnly,
    /// Embeds the local address and registered-memory rkey at the payload head before sending
    /// (`WRITE_REMOTE_ADDR`).
    RkeyWriting,
}

impl SendPlan {
    /// Chooses the `SendPlan` variant implied by a step's flags, mirroring the condition order
    /// the original flag-switch used (fragmentation and pipelining dominate endpoint count).
    pub fn from_flags(flags: StepFlags) -> SendPlan {
        if flags.contains(StepFlags::WRITE_REMOTE_ADDR) {
            return SendPlan::RkeyWriting;
        }
        if flags.contains(StepFlags::PIPELINED) {
            return SendPlan::PerEndpointPipelined;
        }
        let fragmented = flags.contains(StepFlags::FRAGMENTED);
        let single = flags.contains(StepFlags::SINGLE_ENDPOINT);
        match (single, fragmented) {
            (true, false) => SendPlan::OneShot,
            (true, true) => SendPlan::FragmentedSingle,
            (false, false) => SendPlan::PerEndpoint,
            (false, true) => SendPlan::PerEndpointFragmented,
        }
    }
}

/// Sentinel values for [`Step::iter_offset`] on pipelined steps.
pub mod pipeline_sentinel {
    pub const READY: u64 = u64::MAX;
    pub const PENDING: u64 = u64::MAX - 1;
}

/// Per-fragment pending-byte tracking for pipelined steps.
#[derive(Debug, Clone, Default)]
pub struct FragmentPending {
    pub pending: SmallVec<[u32; 16]>,
}

/// A phase bound to real buffers: the unit the executor drives.
pub struct Step {
    pub phase: Phase,
    pub send_buffer: Option<*const u8>,
    pub recv_buffer: Option<*mut u8>,
    pub buffer_length: usize,
    pub fragment_length: usize,
    pub fragments_total: u32,
    pub iter_ep: u32,
    pub iter_offset: u64,
    pub fragment_pending: FragmentPending,
    pub am_header_template: u64,
    pub flags: StepFlags,
    pub send_plan: SendPlan,
    pub aggregation: CompletionAggregation,
    pub criterion: CompletionCriterion,
    pub action: CompletionAction,
    pub var_counts: Option<SmallVec<[u32; 8]>>,
    pub var_displs: Option<SmallVec<[u32; 8]>>,
    pub remote_rkey: Option<SmallVec<[u8; 32]>>,
    pub remote_addr: Option<u64>,
    /// Byte width of one reduce operand, queried from `callbacks.datatype_element_size` by the
    /// step builder. Only meaningful when `aggregation` is `Reduce`/`ReduceSwap`; left at 1 for
    /// every other step so a stray read never divides by zero.
    pub reduce_element_size: usize,
}

// Safety: `send_buffer`/`recv_buffer` point into caller-owned buffers that outlive the step for
// the duration of one progress tick, and the core's scheduling model (§5) guarantees a group is
// driven by exactly one thread at a time, so a `Step` never has two threads touching its raw
// pointers concurrently.
unsafe impl Send for Step {}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("step_idx", &self.phase.step_idx)
            .field("method", &self.phase.method)
            .field("flags", &self.flags)
            .field("send_plan", &self.send_plan)
            .field("buffer_length", &self.buffer_length)
            .field("fragments_total", &self.fragments_total)
            .field("iter_ep", &self.iter_ep)
            .field("iter_offset", &self.iter_offset)
            .finish()
    }
}

impl Step {
    pub fn is_last(&self) -> bool {
        self.flags.contains(StepFlags::LAST_STEP)
    }

    pub fn is_pipelined(&self) -> bool {
        self.flags.contains(StepFlags::PIPELINED)
    }

    pub fn is_fragmented(&self) -> bool {
        self.flags.contains(StepFlags::FRAGMENTED)
    }

    /// Computes the local address and length for a given fragment/endpoint combination,
    /// honoring strided and variadic send addressing.
    pub fn local_fragment(&self, ep_idx: usize, fragment_idx: u32) -> (usize, usize) {
        let base_offset = if self.flags.contains(StepFlags::SEND_VARIADIC) {
            self.var_displs
                .as_ref()
                .map(|d| d[ep_idx] as usize)
                .unwrap_or(0)
        } else if self.flags.contains(StepFlags::SEND_STRIDED) {
            ep_idx * self.buffer_length
        } else {
            0
        };
        let len = if self.is_fragmented() {
            let remaining = self.buffer_length.saturating_sub(fragment_idx as usize * self.fragment_length);
            remaining.min(self.fragment_length)
        } else if self.flags.contains(StepFlags::SEND_VARIADIC) {
            self.var_counts.as_ref().map(|c| c[ep_idx] as usize).unwrap_or(self.buffer_length)
        } else {
            self.buffer_length
        };
        (base_offset + fragment_idx as usize * self.fragment_length, len)
    }

    /// The offset a fragment should be written at in the *peer's* receive buffer, as opposed to
    /// `source_offset` (from [`Step::local_fragment`]), which addresses this step's own send
    /// buffer. The two coincide for every method except scatter: broadcast, gather and
    /// all-to-all all share one globally-consistent buffer layout on both ends, but a scatter
    /// waypoint's `source_offset` is a displacement into its own (single, concatenated) send
    /// buffer, while each child's receive buffer starts back at zero, sized only for its own
    /// share.
    pub fn remote_offset(&self, source_offset: usize, fragment_idx: u32) -> usize {
        if matches!(self.phase.method, Method::ScatterWaypoint) && self.flags.contains(StepFlags::SEND_VARIADIC) {
            fragment_idx as usize * self.fragment_length
        } else {
            source_offset
        }
    }

    pub fn peer_handles(&self) -> SmallVec<[EndpointHandle; 8]> {
        self.phase.peers.iter().collect()
    }
}
