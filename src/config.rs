//! Runtime-supplied configuration
//!
//! Parsing configuration out of environment variables, files, or command-line flags is the
//! embedding runtime's job; the core only consumes an already-built [`Config`] value. This
//! mirrors the split the rest of the stack uses elsewhere (transport setup, process launch): the
//! core takes typed values in, and never reaches out to the environment itself.

use crate::error::{PlanError, PlanResult};

/// Tunables that influence topology construction, transport selection, and concurrency limits.
///
/// All fields have defaults matching the built-in planner's historical behavior; callers
/// typically only override one or two.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Inter-host fan-in/fan-out degree. Default 8.
    pub tree_radix: u32,

    /// Processes-per-node threshold above which the intra-host tree switches from a flat
    /// single-level fan-in/out to a two-level socket-then-host tree. Default 16.
    pub tree_sock_thresh: u32,

    /// Size of the per-group concurrency slot ring. Must be a power of two no greater than 64.
    /// Default 16.
    pub max_concurrent_ops: u8,

    /// Message length, in bytes, above which the step optimizer prefers a zero-copy transport
    /// over bcopy once a persistent registration has been established.
    pub bcopy_to_zcopy_threshold: usize,

    /// Whether the endpoint resolver may establish native incast lanes.
    pub enable_incast: bool,

    /// Whether the endpoint resolver may establish native bcast lanes.
    pub enable_bcast: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            tree_radix: 8,
            tree_sock_thresh: 16,
            max_concurrent_ops: 16,
            bcopy_to_zcopy_threshold: 16 * 1024,
            enable_incast: true,
            enable_bcast: true,
        }
    }
}

impl Config {
    /// Validates the configuration, rejecting values that would make later stages (the slot
    /// ring, the tree builder) miscompute.
    pub fn validate(&self) -> PlanResult<()> {
        if self.tree_radix == 0 {
            return Err(PlanError::InvalidParameter(
                "tree.radix must be at least 1".into(),
            ));
        }
        if self.tree_sock_thresh == 0 {
            return Err(PlanError::InvalidParameter(
                "tree.sock_thresh must be at least 1".into(),
            ));
        }
        if self.max_concurrent_ops == 0
            || self.max_concurrent_ops > 64
            || !self.max_concurrent_ops.is_power_of_two()
        {
            return Err(PlanError::InvalidParameter(
                "max_concurrent_ops must be a power of two no greater than 64".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_non_power_of_two_slot_count() {
        let cfg = Config {
            max_concurrent_ops: 15,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_oversized_slot_count() {
        let cfg = Config {
            max_concurrent_ops: 128,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }
}
