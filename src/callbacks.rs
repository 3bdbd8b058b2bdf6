//! Runtime callback surface
//!
//! The datatype system, the reduction operators, and address resolution all belong to the
//! embedding runtime (typically an MPI implementation); the core only ever calls through this
//! trait object, supplied once at [`crate::context::Context::init`] time.

use crate::error::CoreError;

/// Opaque handle to a runtime-native datatype descriptor. The core never inspects its bits; it
/// only round-trips it through [`RuntimeCallbacks`] calls.
pub type NativeDatatype = u64;

/// Opaque handle to a runtime-native reduction operator descriptor.
pub type NativeReduceOp = u64;

/// Whether a datatype is an integer type and, if so, whether it is signed. Returned by
/// [`RuntimeCallbacks::datatype_is_integer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegerKind {
    pub is_integer: bool,
    pub is_signed: bool,
}

/// A reduction operator's algebraic properties, as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReduceOpKind {
    pub is_sum: bool,
    pub is_commutative: bool,
    /// True for `minloc`/`maxloc`-style operators that additionally track a location index.
    pub is_loc_expected: bool,
}

/// How a completed operation notifies its caller.
///
/// The runtime surface historically supports either a callback or a write-to-offset pair; the
/// core offers both and a given operation picks one statically at creation time (see
/// [`crate::op::Op::completion`]).
pub enum CompletionNotify {
    /// Invoke a callback with the final status once the operation's last step completes.
    Callback(Box<dyn FnOnce(Result<(), CoreError>) + Send>),
    /// Write a flag byte and a status word at caller-specified offsets inside the request's
    /// user-visible completion slot.
    WriteOffset {
        flag_offset: usize,
        status_offset: usize,
    },
}

impl std::fmt::Debug for CompletionNotify {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompletionNotify::Callback(_) => f.debug_tuple("Callback").finish(),
            CompletionNotify::WriteOffset {
                flag_offset,
                status_offset,
            } => f
                .debug_struct("WriteOffset")
                .field("flag_offset", flag_offset)
                .field("status_offset", status_offset)
                .finish(),
        }
    }
}

/// Neighbor topology for neighbor collectives (the `NEIGHBOR` modifier).
#[derive(Debug, Clone, Default)]
pub struct NeighborTopology {
    pub in_indices: Vec<u32>,
    pub out_indices: Vec<u32>,
}

/// How the embedding runtime's fault handler wants to proceed after a step-execution error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultDisposition {
    /// The error was handled; continue as if it had not occurred (used only by the
    /// `transparent` fault-tolerance mode's reroute hook).
    Handled,
    /// The error was not handled; propagate it to the operation's completion notification.
    Unhandled,
}

/// Everything the embedding runtime must supply for the core to operate.
///
/// This is deliberately a trait object boundary (`Arc<dyn RuntimeCallbacks>`), not a generic
/// parameter threaded through every type, because exactly one implementation exists per process
/// and the indirection cost is irrelevant next to a network round trip.
pub trait RuntimeCallbacks: Send + Sync {
    /// Resolves `member_index` within `group_id` to an opaque address blob suitable for
    /// [`crate::transport::Transport::open_endpoint`].
    fn address_lookup(&self, group_id: u32, member_index: u32) -> Result<Vec<u8>, CoreError>;

    /// Returns the neighbor topology for a neighbor collective on `group_id`.
    fn neighbor_topology(&self, group_id: u32) -> NeighborTopology;

    /// Converts an external (runtime-facing) datatype identifier into the core's opaque handle.
    fn datatype_convert(&self, external: u64) -> NativeDatatype;

    /// Returns `(span, gap)` for `count` contiguous repetitions of `dt`: `span` is the total
    /// byte extent including the gap, `gap` is the slack between the last meaningful byte and
    /// the type's extent.
    fn datatype_span(&self, dt: NativeDatatype, count: usize) -> (usize, usize);

    /// True when `dt` is laid out with no internal gaps for any count (lets the step builder
    /// skip pack/unpack bracketing).
    fn datatype_is_contiguous(&self, dt: NativeDatatype) -> bool;

    /// The size, in bytes, of one element of `dt`.
    fn datatype_element_size(&self, dt: NativeDatatype) -> usize;

    fn datatype_is_integer(&self, dt: NativeDatatype) -> IntegerKind;

    fn datatype_is_floating_point(&self, dt: NativeDatatype) -> bool;

    /// Applies `op` element-wise: `dst[i] = dst[i] op src[i]` for `count` elements of `dt`.
    /// This is the fallback reducer invoked when no specialized reducer (see
    /// [`crate::step::reducer`]) matches the (operator, operand, contiguity) triple.
    fn reduce_apply(&self, op: NativeReduceOp, src: &[u8], dst: &mut [u8], count: usize, dt: NativeDatatype);

    fn reduce_op_kind(&self, op: NativeReduceOp) -> ReduceOpKind;

    /// Reports an unrecoverable step-execution error to the runtime's fault handler, returning
    /// its disposition. Only consulted when the operation's fault-tolerance mode is
    /// `user_handled`; see [`crate::op::FaultMode`].
    fn fault_handle(&self, error: &CoreError) -> FaultDisposition;

    /// A human-readable description for a fault code, used in diagnostics only.
    fn fault_err_str(&self, error: &CoreError) -> String {
        format!("{error}")
    }

    /// Translates a member index within a (sub)group to a process-global index, when the
    /// runtime supports non-trivial group nesting. Groups that do not need this leave it
    /// unimplemented via the default, which is the identity mapping.
    fn global_index(&self, _group_id: u32, member_index: u32) -> u32 {
        member_index
    }
}
