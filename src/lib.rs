//! A pluggable planner and executor for group-collective operations.
//!
//! This crate is the core of a collective-communication engine: given a declarative description
//! of a collective operation (broadcast, reduce, all-reduce, scatter, gather, all-to-all,
//! barrier, or a neighbor variant) over an ordered [`group::Group`] of participants, it
//! synthesizes a multi-step [`plan::Plan`] over point-to-point and (when available) native
//! in-network collective transports, and drives that plan to completion with fragmentation,
//! pipelining, and zero-copy semantics.
//!
//! The crate never touches a network itself. Everything below the [`transport`] trait boundary —
//! active messages, RDMA put/get, memory registration, endpoint wire-up — is supplied by an
//! embedding runtime, as is the datatype/reduction-operator system ([`callbacks`]) and
//! configuration sourcing ([`config`]). What lives here is topology derivation, phase synthesis,
//! step construction, and the step executor and dispatcher that drive it all to completion.
//!
//! # Layering
//!
//! - [`context`]: process-wide registry of planner components and the one cross-thread
//!   structure in the crate, the by-id group table.
//! - [`group`]: an ordered participant set with a [`distance::DistanceModel`] and lazily
//!   populated endpoint caches.
//! - [`planner`]: turns a group and a [`modifiers::CollectiveType`] into a [`plan::Plan`]; the
//!   only implementation shipped is [`planner::builtin::BuiltinPlanner`].
//! - [`op`] / [`step`]: a plan instance bound to real buffers, and the executable unit the
//!   [`step::executor`] drives.
//! - [`dispatcher`]: routes inbound messages to the right concurrency slot and, from there, the
//!   right step.
//! - [`collective`]: the public entry point tying the rest of the crate together —
//!   [`collective::create`], [`collective::deliver`], [`collective::progress`],
//!   [`collective::cancel`], [`collective::retrigger`].
//!
//! # Example
//!
//! Wiring a context together (a real embedding runtime would supply its own transport and
//! callbacks implementations; the unit and integration tests in this crate use an in-process
//! loopback mock for exactly this purpose):
//!
//! ```ignore
//! let mut ctx = Context::init(transport, callbacks, Config::default())?;
//! ctx.register_planner(Arc::new(BuiltinPlanner::new()))?;
//! let group_id = ctx.create_group(group_params)?;
//! let handle = collective::create(&mut ctx, group_id, &BuiltinPlanner::new(), CollectiveType::barrier(), trigger_params)?;
//! ```

pub mod callbacks;
pub mod collective;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod distance;
pub mod endpoint;
pub mod error;
pub mod group;
pub mod modifiers;
pub mod op;
pub mod plan;
pub mod planner;
pub mod step;
pub mod transport;
pub mod wire;

pub use callbacks::RuntimeCallbacks;
pub use collective::{CollectiveHandle, TriggerParams};
pub use config::Config;
pub use context::Context;
pub use distance::{Distance, DistanceModel};
pub use error::{CoreError, CoreResult, PlanError, PlanResult};
pub use group::{GroupId, GroupParams};
pub use modifiers::{CollectiveModifiers, CollectiveType};
pub use plan::Plan;
pub use planner::builtin::BuiltinPlanner;
pub use transport::{Endpoint, Transport};
