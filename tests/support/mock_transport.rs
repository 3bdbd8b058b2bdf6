//! In-process mock transport driving the scenario, concurrency, and property tests.
//!
//! One [`Network`] is shared (via `Rc<RefCell<_>>`, these tests are single-threaded) by every
//! rank's [`MockTransport`]. `MockEndpoint::am_short`/`am_bcopy` push straight into the
//! destination rank's inbox; the test driver pulls messages back out with [`Network::drain`] and
//! feeds them to `collective::deliver` on the receiving rank's `Context`.
//!
//! The real wire framing only carries a packed `u64` header — step index in the low byte, remote
//! offset above it, see `step::executor::issue_send` — not a full `WireHeader`; group id and
//! collective id never reach `Endpoint::am_short` at all, since the core's own
//! `am_header_template` is "always 0 today" (`step/executor.rs`'s doc comment on `issue_send`).
//! Every test built on this harness uses exactly one group (id 0) and one live collective
//! (coll_id 0) per rank at a time, so the mock fills in those two `WireHeader` fields as fixed
//! constants rather than threading them through a path the core doesn't expose yet.
//!
//! Capabilities are limited to `AM_SHORT | AM_BCOPY`: `AM_ZCOPY`/`PUT_ZCOPY`/`GET_ZCOPY`
//! completions are never drained back into the dispatcher (`Endpoint::poll_completions` has no
//! caller outside this crate's own unit tests), so a step that picked a zero-copy send kind would
//! wait on a completion that never arrives. Capping the mock's capabilities keeps
//! `planner::builtin::method::choose_send_kind` from ever picking one.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use ucg_core::error::CoreError;
use ucg_core::transport::{Capabilities, Endpoint, InterfaceAttributes, MemoryDomain, MemoryDomainAttributes, SendOutcome, Transport};
use ucg_core::wire::WireHeader;

const AM_SHORT_MAX: usize = 512;
const AM_BCOPY_MAX: usize = 1 << 20;
const GROUP_ID: u32 = 0;
const COLL_ID: u8 = 0;

#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub header: WireHeader,
    pub payload: Vec<u8>,
    /// Rank that issued the send. Not part of the real wire format — it never crosses
    /// `Endpoint::am_short` — but the gather scenario's driver needs it to know which slot of the
    /// root's concatenated buffer an arriving contribution belongs in.
    pub sender: u32,
}

/// One-shot `NoResource` injection, armed by [`Network::inject_no_resource_once`]: the
/// `countdown`-th send issued anywhere on the network (1-based) fails once, then the network
/// passes every subsequent send through normally.
struct FaultState {
    countdown: u32,
    armed: bool,
}

struct NetworkInner {
    inboxes: Vec<VecDeque<QueuedMessage>>,
    fault: Option<FaultState>,
    sends_issued: u32,
}

/// Shared message fabric for one test's whole rank set. Cheap to clone — every clone refers to
/// the same underlying queues.
#[derive(Clone)]
pub struct Network {
    inner: Rc<RefCell<NetworkInner>>,
}

impl Network {
    pub fn new(world_size: usize) -> Self {
        Network {
            inner: Rc::new(RefCell::new(NetworkInner {
                inboxes: (0..world_size).map(|_| VecDeque::new()).collect(),
                fault: None,
                sends_issued: 0,
            })),
        }
    }

    /// Arranges for the `countdown`-th send issued on this network (counting from 1, across
    /// every rank) to fail with [`SendOutcome::NoResource`] exactly once; every other send,
    /// before and after, succeeds.
    pub fn inject_no_resource_once(&self, countdown: u32) {
        self.inner.borrow_mut().fault = Some(FaultState { countdown, armed: true });
    }

    fn send(&self, dest_rank: u32, sender: u32, header: WireHeader, payload: &[u8]) -> SendOutcome {
        let mut inner = self.inner.borrow_mut();
        inner.sends_issued += 1;
        let sends_issued = inner.sends_issued;
        if let Some(fault) = inner.fault.as_mut() {
            if fault.armed && sends_issued == fault.countdown {
                fault.armed = false;
                return SendOutcome::NoResource;
            }
        }
        inner.inboxes[dest_rank as usize].push_back(QueuedMessage {
            header,
            payload: payload.to_vec(),
            sender,
        });
        SendOutcome::Complete
    }

    /// Drains every message currently queued for `rank`, in FIFO arrival order.
    pub fn drain(&self, rank: u32) -> Vec<QueuedMessage> {
        self.inner.borrow_mut().inboxes[rank as usize].drain(..).collect()
    }

    pub fn has_pending(&self, rank: u32) -> bool {
        !self.inner.borrow().inboxes[rank as usize].is_empty()
    }

    pub fn sends_issued(&self) -> u32 {
        self.inner.borrow().sends_issued
    }
}

pub struct MockEndpoint {
    network: Network,
    peer_rank: u32,
    my_rank: u32,
    am_bcopy_max: usize,
}

impl std::fmt::Debug for MockEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockEndpoint").field("peer_rank", &self.peer_rank).finish()
    }
}

impl MockEndpoint {
    fn send(&mut self, packed_header: u64, payload: &[u8]) -> SendOutcome {
        let step_idx = (packed_header & 0xFF) as u8;
        let remote_offset = packed_header >> 8;
        let header = WireHeader {
            group_id: GROUP_ID,
            coll_id: COLL_ID,
            step_idx,
            reserved: 0,
            remote_offset,
        };
        self.network.send(self.peer_rank, self.my_rank, header, payload)
    }
}

impl Endpoint for MockEndpoint {
    fn attributes(&self) -> InterfaceAttributes {
        InterfaceAttributes {
            caps: Capabilities::AM_SHORT | Capabilities::AM_BCOPY,
            am_short_max: AM_SHORT_MAX,
            am_bcopy_max: self.am_bcopy_max,
            zcopy_min: usize::MAX,
            zcopy_max: 0,
            rkey_packed_size: 0,
        }
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn connect_remote(&mut self) -> Result<(), CoreError> {
        Ok(())
    }

    fn am_short(&mut self, _am_id: u8, header: u64, payload: &[u8]) -> SendOutcome {
        self.send(header, payload)
    }

    fn am_bcopy(&mut self, _am_id: u8, header: u64, payload: &[u8]) -> SendOutcome {
        self.send(header, payload)
    }

    fn am_zcopy(&mut self, _am_id: u8, header: u64, payload: &[u8]) -> SendOutcome {
        self.send(header, payload)
    }

    fn put_zcopy(&mut self, _payload: &[u8], _remote_addr: u64, _rkey: &[u8]) -> SendOutcome {
        SendOutcome::Complete
    }

    fn get_zcopy(&mut self, _buffer: &mut [u8], _remote_addr: u64, _rkey: &[u8]) -> SendOutcome {
        SendOutcome::Complete
    }

    fn poll_completions(&mut self) -> Vec<u64> {
        Vec::new()
    }
}

/// One rank's transport. `address_lookup` (see `tests/support/callbacks.rs`) hands back a
/// single-byte address holding the peer's rank, which `open_endpoint` decodes directly.
pub struct MockTransport {
    network: Network,
    my_rank: u32,
    next_am_id: u8,
    am_bcopy_max: usize,
}

impl MockTransport {
    pub fn new(network: Network, my_rank: u32) -> Self {
        MockTransport {
            network,
            my_rank,
            next_am_id: 0,
            am_bcopy_max: AM_BCOPY_MAX,
        }
    }

    /// Same as [`MockTransport::new`], but with a caller-chosen AM-BCOPY ceiling instead of the
    /// default 1 MiB one. Used by the gather scenario to make the root's "per-contributor chunk
    /// equals the BCOPY cap" fragmentation trick (see `planner::builtin::method::build_step`'s
    /// `fragment_length` derivation) exercisable with small in-memory buffers.
    pub fn with_bcopy_max(network: Network, my_rank: u32, am_bcopy_max: usize) -> Self {
        MockTransport {
            network,
            my_rank,
            next_am_id: 0,
            am_bcopy_max,
        }
    }
}

impl MemoryDomain for MockTransport {
    fn register(&mut self, _buffer: &[u8]) -> Result<MemoryDomainAttributes, CoreError> {
        Ok(MemoryDomainAttributes {
            local_handle: 0,
            rkey_packed_size: 0,
        })
    }

    fn deregister(&mut self, _handle: u64) {}

    fn pack_rkey(&self, _handle: u64) -> Vec<u8> {
        Vec::new()
    }
}

impl Transport for MockTransport {
    type Ep = MockEndpoint;

    fn reserve_am_id(&mut self) -> Result<u8, CoreError> {
        let id = self.next_am_id;
        self.next_am_id += 1;
        Ok(id)
    }

    fn register_am_handler(&mut self, _am_id: u8) {}

    fn open_endpoint(&mut self, address: &[u8]) -> Result<MockEndpoint, CoreError> {
        let peer_rank = *address
            .first()
            .ok_or_else(|| CoreError::InvalidParameter("mock address must carry the peer rank".into()))? as u32;
        Ok(MockEndpoint {
            network: self.network.clone(),
            peer_rank,
            my_rank: self.my_rank,
            am_bcopy_max: self.am_bcopy_max,
        })
    }

    fn open_collective_endpoint(&mut self, members: &[u32], _caps: Capabilities) -> Result<MockEndpoint, CoreError> {
        let peer_rank = *members.first().unwrap_or(&0);
        Ok(MockEndpoint {
            network: self.network.clone(),
            peer_rank,
            my_rank: self.my_rank,
            am_bcopy_max: self.am_bcopy_max,
        })
    }

    fn progress(&mut self) -> bool {
        false
    }
}
