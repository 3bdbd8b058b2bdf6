//! Intra-host and inter-host tree construction
//!
//! Grounded in the original implementation's two-stage tree builder: an intra-host tree over
//! members at `Host` distance or finer, and an inter-host radix-`R` tree over host masters. See
//! §4.2 items 2-4 of the design document.

use smallvec::SmallVec;

use crate::config::Config;
use crate::distance::{Distance, DistanceModel};
use crate::error::{PlanError, PlanResult};
use crate::group::Group;
use crate::transport::Endpoint;

/// One node's role in the two-level tree: who it reports to, and who reports to it, at each of
/// the intra-host and inter-host levels independently.
#[derive(Debug, Clone, Default)]
pub struct TreeRoles {
    pub intra_parent: Option<u32>,
    pub intra_children: SmallVec<[u32; 16]>,
    pub inter_parent: Option<u32>,
    pub inter_children: SmallVec<[u32; 16]>,
    /// True when this member is the smallest-index (or root-displaced) representative of its
    /// host at the inter-host level.
    pub is_host_master: bool,
}

impl TreeRoles {
    pub fn has_intra_host_work(&self) -> bool {
        self.intra_parent.is_some() || !self.intra_children.is_empty()
    }

    pub fn has_inter_host_work(&self) -> bool {
        self.inter_parent.is_some() || !self.inter_children.is_empty()
    }
}

/// Partitions member indices into host groups using the group's distance model: two members
/// share a host iff their mutual distance is `Host` or finer.
fn host_groups<E: Endpoint>(group: &Group<E>) -> Vec<SmallVec<[u32; 16]>> {
    let n = group.member_count;
    let mut assigned = vec![false; n as usize];
    let mut groups = Vec::new();
    for m in 0..n {
        if assigned[m as usize] {
            continue;
        }
        let mut members = group.distance.members_within(n, m, Distance::Host);
        members.push(m);
        members.sort_unstable();
        for &x in &members {
            assigned[x as usize] = true;
        }
        groups.push(members);
    }
    groups
}

/// Applies the non-zero-root adjustment to a child list: if `root` is present but isn't
/// `displaced`, swap them so `root` takes `displaced`'s place (§4.2 item 4, and the placement
/// analogue in SPEC_FULL §4.8).
fn apply_root_swap(children: &mut [u32], displaced: u32, root: u32) {
    if root == displaced {
        return;
    }
    if let Some(pos) = children.iter().position(|&c| c == root) {
        children[pos] = displaced;
    }
}

/// Builds the two-level tree for `root`, bounded by `config.tree_radix` at every level.
pub fn build<E: Endpoint>(group: &Group<E>, config: &Config, root: u32) -> PlanResult<TreeRoles> {
    let groups = host_groups(group);
    let my_index = group.my_index;
    let my_host = groups
        .iter()
        .position(|g| g.contains(&my_index))
        .expect("every member belongs to exactly one host group");

    let mut roles = TreeRoles::default();

    // --- intra-host level ---
    let my_group = &groups[my_host];
    if my_group.len() > 1 {
        let host_master = my_group[0];
        let use_two_level = my_group.len() as u32 > config.tree_sock_thresh;

        if use_two_level {
            build_intra_host_two_level(group, config, my_group, host_master, root, &mut roles)?;
        } else {
            build_intra_host_flat(my_group, host_master, root, my_index, &mut roles)?;
        }
    }

    // --- inter-host level ---
    let effective_master = if my_group.contains(&root) { root } else { my_group[0] };
    roles.is_host_master = my_index == effective_master;
    if groups.len() > 1 {
        let mut masters: Vec<u32> = groups.iter().map(|g| g[0]).collect();
        let root_host = groups.iter().position(|g| g.contains(&root)).unwrap();
        // Treat the host containing `root` as master-equivalent-to-root for the inter-host
        // radix tree: swap root into its host's master slot so the inter-host tree's "member 0"
        // adjustment lines up with the intra-host one.
        masters[root_host] = root;
        masters.sort_unstable_by_key(|&m| if m == root { 0 } else { 1 });

        let my_master = if my_host == root_host { root } else { groups[my_host][0] };
        if masters.contains(&my_master) {
            build_radix_tree(&masters, config.tree_radix, my_master, &mut roles)?;
        }
    }

    Ok(roles)
}

fn build_intra_host_flat(
    host_members: &[u32],
    host_master: u32,
    root: u32,
    my_index: u32,
    roles: &mut TreeRoles,
) -> PlanResult<()> {
    let mut children: SmallVec<[u32; 16]> = host_members.iter().filter(|&&m| m != host_master).copied().collect();
    let root_present = host_members.contains(&root);
    if root_present {
        apply_root_swap(&mut children, host_master, root);
    }
    let effective_root = if root_present { root } else { host_master };

    if my_index == effective_root {
        // `apply_root_swap` already placed the displaced host master into root's child list
        // (at root's former slot) when `root_present && root != host_master`, so no further
        // adjustment is needed here.
        roles.intra_children = children;
    } else {
        roles.intra_parent = Some(effective_root);
    }
    Ok(())
}

fn build_intra_host_two_level<E: Endpoint>(
    group: &Group<E>,
    config: &Config,
    host_members: &[u32],
    host_master: u32,
    root: u32,
    roles: &mut TreeRoles,
) -> PlanResult<()> {
    let my_index = group.my_index;
    let mut socket_groups: Vec<SmallVec<[u32; 16]>> = Vec::new();
    let mut assigned = vec![false; host_members.len()];
    for (i, &m) in host_members.iter().enumerate() {
        if assigned[i] {
            continue;
        }
        let mut members = group.distance.members_within(group.member_count, m, Distance::Socket);
        members.retain(|x| host_members.contains(x));
        members.push(m);
        members.sort_unstable();
        for &x in &members {
            if let Some(j) = host_members.iter().position(|&h| h == x) {
                assigned[j] = true;
            }
        }
        socket_groups.push(members);
    }

    let my_socket = socket_groups
        .iter()
        .position(|g| g.contains(&my_index))
        .expect("every host member belongs to exactly one socket group");
    let socket_members = &socket_groups[my_socket];
    let socket_root = socket_members[0];

    if socket_members.len() as u32 > config.tree_radix {
        return Err(PlanError::BufferTooSmall(format!(
            "socket group of {} members exceeds tree radix {}",
            socket_members.len(),
            config.tree_radix
        )));
    }

    if my_index == socket_root {
        roles.intra_children = socket_members.iter().filter(|&&m| m != socket_root).copied().collect();
        if socket_root != host_master {
            roles.intra_parent = Some(host_master);
        }
    } else {
        roles.intra_parent = Some(socket_root);
    }

    if my_index == host_master {
        let mut socket_roots: SmallVec<[u32; 16]> =
            socket_groups.iter().map(|g| g[0]).filter(|&r| r != host_master).collect();
        if host_members.contains(&root) {
            apply_root_swap(&mut socket_roots, host_master, root);
        }
        if socket_roots.len() as u32 > config.tree_radix {
            return Err(PlanError::BufferTooSmall(format!(
                "host has {} sockets, exceeds tree radix {}",
                socket_roots.len() + 1,
                config.tree_radix
            )));
        }
        // A host master's intra-host children, at this level, are the socket roots (the
        // within-socket fan-in already happened at the socket level above).
        if roles.intra_children.is_empty() {
            roles.intra_children = socket_roots;
        } else {
            roles.intra_children.extend(socket_roots);
        }
    }

    Ok(())
}

/// Counts members within `distance` of "me", not counting "me" (§4.7, from the original
/// implementation's `builtin_topo_info`). Used to determine processes-per-node before the tree
/// builder chooses between the flat and two-level intra-host tree.
pub fn count_ppx<E: Endpoint>(group: &Group<E>, distance: Distance) -> u32 {
    group
        .distance
        .members_within(group.member_count, group.my_index, distance)
        .len() as u32
}

/// For placement-table distance models, reports whether every host carries the same number of
/// members (§4.7). Always `true` for non-placement models, since only the placement model can
/// express per-host imbalance in the first place. An unbalanced placement never aborts planning;
/// it only tells the caller to skip a fixed-root fast path and fall back to the general per-member
/// scan `build` already performs.
pub fn check_ppn_balance<E: Endpoint>(group: &Group<E>) -> bool {
    let DistanceModel::Placement(levels) = &group.distance else {
        return true;
    };
    let Some((_, units)) = levels.first() else {
        return true;
    };
    let mut counts = std::collections::HashMap::new();
    for &unit in units {
        *counts.entry(unit).or_insert(0u32) += 1;
    }
    counts.values().all(|&c| c == counts.values().next().copied().unwrap_or(c))
}

/// Lays out a flat radix-`R` tree over `masters`, where `masters[0]` is the tree root (by
/// construction, `build` always arranges for the root-bearing host to be `masters[0]`).
fn build_radix_tree(masters: &[u32], radix: u32, my_master: u32, roles: &mut TreeRoles) -> PlanResult<()> {
    let pos = masters.iter().position(|&m| m == my_master).unwrap();
    if pos != 0 {
        let parent_pos = (pos - 1) / radix as usize;
        roles.inter_parent = Some(masters[parent_pos]);
    }
    let first_child = pos * radix as usize + 1;
    let last_child = ((pos + 1) * radix as usize).min(masters.len() - 1);
    if first_child <= last_child && first_child < masters.len() {
        let children: SmallVec<[u32; 16]> = masters[first_child..=last_child].iter().copied().collect();
        if children.len() as u32 > radix {
            return Err(PlanError::BufferTooSmall(format!(
                "inter-host fan-out of {} exceeds tree radix {}",
                children.len(),
                radix
            )));
        }
        roles.inter_children = children;
    }
    Ok(())
}
