//! Group member distance model
//!
//! A group's distance model tells the planner how "close" each member is to the calling
//! process, from finest (`SelfRank`, meaning "this is me") to coarsest (`Cluster`). The built-in
//! planner walks this ordering twice: once to build the intra-host tree (members at `Host`
//! distance or finer) and once to build the inter-host tree (host masters only).

use smallvec::SmallVec;

/// A totally ordered measure of topological proximity between the calling process and some
/// other group member.
///
/// The ordering is significant: `Distance::Core < Distance::Numa` must hold for the tree
/// builder's "strictly finer than the master phase" test in topology construction to be
/// meaningful. `Unknown` sorts last and is treated as "assume the worst" (cluster-or-coarser)
/// wherever a decision must be made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Distance {
    /// This entry describes the calling process itself.
    SelfRank = 0,
    HwThread = 1,
    Core = 2,
    L1 = 3,
    L2 = 4,
    L3 = 5,
    Socket = 6,
    Numa = 7,
    Board = 8,
    Host = 9,
    Cu = 10,
    Cluster = 11,
    /// No distance information is available; treated as at-least-`Cluster` for planning
    /// purposes.
    Unknown = 12,
}

/// A per-level placement entry: which host (or higher-level unit) a member belongs to.
pub type PlacementUnit = u32;

/// The distance information carried by a [`crate::group::Group`].
///
/// Exactly one of these shapes is chosen when a group is created, matching how the distance
/// was actually reported by the caller (a single uniform value, a flat array, a symmetric
/// matrix, or per-level placement vectors).
#[derive(Debug, Clone)]
pub enum DistanceModel {
    /// Every other member is at the same fixed distance from "me".
    Fixed(Distance),

    /// One entry per member index; `array[my_index]` must equal [`Distance::SelfRank`].
    Array(Vec<Distance>),

    /// A full `member_count` x `member_count` symmetric matrix of pairwise distances.
    Table(Vec<Vec<Distance>>),

    /// For each distance level present in the model, the placement unit each member belongs to
    /// at that level (e.g. which host, which socket). Levels are listed finest-first.
    Placement(Vec<(Distance, Vec<PlacementUnit>)>),
}

impl DistanceModel {
    /// Returns the distance from `my_index` to `other`, or `Distance::Unknown` if the model
    /// cannot express it (which the caller treats as "assume coarsest").
    pub fn distance_to(&self, my_index: u32, other: u32) -> Distance {
        if my_index == other {
            return Distance::SelfRank;
        }
        match self {
            DistanceModel::Fixed(d) => *d,
            DistanceModel::Array(arr) => arr.get(other as usize).copied().unwrap_or(Distance::Unknown),
            DistanceModel::Table(table) => table
                .get(my_index as usize)
                .and_then(|row| row.get(other as usize))
                .copied()
                .unwrap_or(Distance::Unknown),
            DistanceModel::Placement(levels) => {
                for (level, units) in levels {
                    let mine = units.get(my_index as usize);
                    let theirs = units.get(other as usize);
                    if let (Some(mine), Some(theirs)) = (mine, theirs) {
                        if mine == theirs {
                            return *level;
                        }
                    }
                }
                Distance::Unknown
            }
        }
    }

    /// Validates internal consistency against a known member count and the caller's index.
    pub fn validate(&self, member_count: u32, my_index: u32) -> Result<(), String> {
        match self {
            DistanceModel::Array(arr) => {
                if arr.len() as u32 != member_count {
                    return Err(format!(
                        "distance array has {} entries, expected {}",
                        arr.len(),
                        member_count
                    ));
                }
                if arr[my_index as usize] != Distance::SelfRank {
                    return Err("distance array entry at my_index must be SelfRank".into());
                }
                Ok(())
            }
            DistanceModel::Table(table) => {
                if table.len() as u32 != member_count {
                    return Err("distance table row count must equal member_count".into());
                }
                for row in table {
                    if row.len() as u32 != member_count {
                        return Err("distance table must be square".into());
                    }
                }
                Ok(())
            }
            DistanceModel::Placement(levels) => {
                for (_, units) in levels {
                    if units.len() as u32 != member_count {
                        return Err("placement vector length must equal member_count".into());
                    }
                }
                Ok(())
            }
            DistanceModel::Fixed(_) => Ok(()),
        }
    }

    /// Returns the member indices at or finer than `level`, excluding `my_index`, in ascending
    /// order. Used by the tree builder to find intra-host candidates.
    pub fn members_within(&self, member_count: u32, my_index: u32, level: Distance) -> SmallVec<[u32; 32]> {
        (0..member_count)
            .filter(|&m| m != my_index && self.distance_to(my_index, m) <= level)
            .collect()
    }
}
