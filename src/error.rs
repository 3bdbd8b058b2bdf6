//! Error types
//!
//! The core never panics on caller-supplied input; every fallible operation returns one of the
//! two error enums defined here. `NO_RESOURCE`, the transient condition raised by a transport
//! when it is momentarily out of send buffers, is deliberately absent from both enums: it never
//! escapes the step executor, which absorbs it into the resend queue (see
//! [`crate::step::executor`]).

use thiserror::Error;

/// Errors that can occur while a plan is being synthesized.
///
/// Returned synchronously from [`crate::collective::create`]; planning never blocks and never
/// partially completes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlanError {
    /// A collective's modifier combination or root index could not be satisfied by any
    /// registered planner, or a group's distance model was malformed.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// A peer list at some tree level exceeded the configured radix, or a header could not
    /// carry the requested field. Planning never truncates silently.
    #[error("buffer too small: {0}")]
    BufferTooSmall(String),
}

/// Errors that can occur while an operation is in flight, or while resolving an endpoint.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// See [`PlanError::InvalidParameter`].
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// See [`PlanError::BufferTooSmall`].
    #[error("buffer too small: {0}")]
    BufferTooSmall(String),

    /// No endpoint could be established for the requested peer under the requested capability.
    #[error("unreachable: no endpoint for member {member} with capability {capability}")]
    Unreachable {
        /// The member index that could not be reached.
        member: u32,
        /// The capability that was requested (`p2p`, `incast`, or `bcast`).
        capability: &'static str,
    },

    /// A capability was required (e.g. a native incast lane) and no transport- or
    /// software-fallback path was available.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The operation was cancelled via `request_cancel` before its final step completed.
    #[error("cancelled")]
    Cancelled,
}

impl From<PlanError> for CoreError {
    fn from(e: PlanError) -> Self {
        match e {
            PlanError::InvalidParameter(s) => CoreError::InvalidParameter(s),
            PlanError::BufferTooSmall(s) => CoreError::BufferTooSmall(s),
        }
    }
}

/// Plan building resolves endpoints, which can fail with the operation-time error type; this
/// folds that back into `PlanError` so the builtin planner's `build_plan` can stay within
/// `PlanResult` end to end rather than mixing the two result types.
impl From<CoreError> for PlanError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::InvalidParameter(s) => PlanError::InvalidParameter(s),
            CoreError::BufferTooSmall(s) => PlanError::BufferTooSmall(s),
            CoreError::Unreachable { member, capability } => {
                PlanError::InvalidParameter(format!("unreachable: member {member} capability {capability}"))
            }
            CoreError::Unsupported(s) => PlanError::InvalidParameter(format!("unsupported: {s}")),
            CoreError::Cancelled => PlanError::InvalidParameter("cancelled".into()),
        }
    }
}

/// Result alias for planning-time fallibility.
pub type PlanResult<T> = Result<T, PlanError>;

/// Result alias for operation-time fallibility.
pub type CoreResult<T> = Result<T, CoreError>;
