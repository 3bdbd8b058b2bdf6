//! Operations: a plan instance bound to real buffers

use bitflags::bitflags;

use crate::callbacks::CompletionNotify;
use crate::error::CoreError;
use crate::step::Step;

bitflags! {
    /// Feature flags carried by an [`Op`], set once at creation from the collective's modifiers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpFlags: u32 {
        const BARRIER = 1 << 0;
        const REDUCE = 1 << 1;
        const ALL_TO_ALL = 1 << 2;
        const SCATTER = 1 << 3;
        const GATHER_TERMINAL = 1 << 4;
        const GATHER_WAYPOINT = 1 << 5;
        const NON_CONTIGUOUS = 1 << 6;
        /// Set after the op's first trigger; cleared by the one-shot optimizer once it has run.
        const OPTIMIZE_PENDING = 1 << 7;
        /// Set by `request_cancel`; every subsequent progress tick for this op is a no-op.
        const CANCELLED = 1 << 8;
        const FT_ONGOING = 1 << 9;
    }
}

/// How a step-execution error that survives the resend queue is handled (§7 fault-tolerance
/// modes). The recovery algorithm for `Transparent` is out of scope; only the hook is modeled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultMode {
    /// Terminate the op immediately with the error.
    Fatal,
    /// Same as `Fatal`, but the error is only observed when the caller polls, never pushed
    /// proactively (meaningful only for the callback-vs-write-offset distinction, not modeled
    /// as distinct behavior here since both notification styles are pull- or push-based on
    /// their own terms).
    Returned,
    /// Reroute via an alternate plan phase. The core exposes this as a hook the embedding
    /// runtime's fault-tolerance layer drives; the recovery algorithm itself is not implemented
    /// here.
    Transparent,
    /// Hand control to the runtime's fault handler; its [`crate::callbacks::FaultDisposition`]
    /// decides whether the op continues or terminates.
    UserHandled,
}

/// A plan instance bound to user buffers.
///
/// An `Op` owns its steps outright (no step ever outlives its op, and an op never outlives the
/// group it was created against, since it is only ever reached through the dispatcher's slot
/// ring, which is itself owned by the group's context — see the ownership note in
/// [`crate::context`]).
pub struct Op {
    pub steps: Vec<Step>,
    pub current_step: usize,
    pub flags: OpFlags,
    pub fault_mode: FaultMode,
    pub completion: Option<CompletionNotify>,
    pub pending: Vec<u32>,
}

impl Op {
    pub fn new(steps: Vec<Step>, flags: OpFlags, fault_mode: FaultMode) -> Self {
        let pending = vec![0u32; steps.len()];
        Op {
            steps,
            current_step: 0,
            flags,
            fault_mode,
            completion: None,
            pending,
        }
    }

    pub fn current_step_mut(&mut self) -> Option<&mut Step> {
        self.steps.get_mut(self.current_step)
    }

    pub fn is_cancelled(&self) -> bool {
        self.flags.contains(OpFlags::CANCELLED)
    }

    pub fn cancel(&mut self) {
        self.flags |= OpFlags::CANCELLED;
    }

    /// Invokes (or writes) the completion notification exactly once. Persistent ops retain
    /// their `steps`/`flags` across retriggers, so only `completion` and `pending` are reset by
    /// [`Op::rearm`], not the whole op.
    pub fn complete(&mut self, result: Result<(), CoreError>, completion_slot: &mut [u8]) {
        match self.completion.take() {
            Some(CompletionNotify::Callback(cb)) => cb(result),
            Some(CompletionNotify::WriteOffset {
                flag_offset,
                status_offset,
            }) => {
                if flag_offset < completion_slot.len() {
                    completion_slot[flag_offset] = 1;
                }
                if status_offset < completion_slot.len() {
                    completion_slot[status_offset] = if result.is_ok() { 0 } else { 1 };
                }
            }
            None => {}
        }
    }

    /// Resets a persistent op for its next trigger.
    pub fn rearm(&mut self, completion: CompletionNotify) {
        self.current_step = 0;
        self.pending.iter_mut().for_each(|p| *p = 0);
        self.completion = Some(completion);
        self.flags.remove(OpFlags::CANCELLED);
    }
}
