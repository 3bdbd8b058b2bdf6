//! Drives a set of per-rank [`Context`]s to quiescence against a shared [`Network`].
//!
//! None of the core owns an event loop (see `collective::mod`'s module doc), so every scenario
//! test plays the embedding runtime's part itself: drain whatever each rank's inbox is holding,
//! feed it to `collective::deliver`, then give every rank one `collective::progress` tick for its
//! resend queue. Repeated until the network has nothing left in flight.

use ucg_core::collective;
use ucg_core::group::GroupId;
use ucg_core::transport::Transport;

use super::mock_transport::{Network, QueuedMessage};

/// Drains and delivers until the network is quiet, giving every context a `progress` tick each
/// round. Panics if `max_ticks` rounds pass without quiescence — that means a scenario is wired
/// wrong (an expected reply never gets sent, or an offset override is missing) rather than that
/// it just needs more ticks, since every scenario here converges in a handful of rounds.
pub fn run_to_quiescence<T: Transport>(contexts: &mut [ucg_core::Context<T>], network: &Network, group_id: GroupId, world_size: u32, max_ticks: usize) {
    run_to_quiescence_with(contexts, network, group_id, world_size, max_ticks, |_, _| {})
}

/// Same as [`run_to_quiescence`], but `rewrite` gets a chance to edit each message (destination
/// rank, message) before it is handed to `collective::deliver`. Scatter and gather need this: the
/// sender only ever knows an offset into its *own* buffer (see `Step::local_fragment`), not where
/// that contribution belongs in a receiver whose buffer has a different shape.
pub fn run_to_quiescence_with<T: Transport>(
    contexts: &mut [ucg_core::Context<T>],
    network: &Network,
    group_id: GroupId,
    world_size: u32,
    max_ticks: usize,
    mut rewrite: impl FnMut(u32, &mut QueuedMessage),
) {
    for _ in 0..max_ticks {
        let mut delivered_any = false;
        for rank in 0..world_size {
            for mut msg in network.drain(rank) {
                rewrite(rank, &mut msg);
                delivered_any = true;
                collective::deliver(&contexts[rank as usize], group_id, msg.header, &msg.payload);
            }
        }
        for ctx in contexts.iter_mut() {
            collective::progress(ctx, group_id);
        }
        if !delivered_any && (0..world_size).all(|r| !network.has_pending(r)) {
            return;
        }
    }
    panic!("network did not quiesce within {max_ticks} ticks");
}
