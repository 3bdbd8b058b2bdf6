//! Transport surface consumed by the core
//!
//! The core never speaks to hardware directly. Everything below this line is implemented by the
//! embedding runtime's transport layer; the core only ever sees these traits. A test harness
//! supplies an in-process mock (see `tests/support/mock_transport.rs`) that loops sends back as
//! receives on the same thread, which is what makes the scenario tests in §8 of the design
//! document runnable without any real network.

use bitflags::bitflags;

use crate::error::CoreError;

bitflags! {
    /// Capability bits reported by an endpoint's interface attributes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u32 {
        /// Short inline active-message send (payload copied into the message itself).
        const AM_SHORT = 1 << 0;
        /// Buffered-copy active-message send (payload handed to a pack callback).
        const AM_BCOPY = 1 << 1;
        /// Zero-copy active-message send (payload referenced by IOV, not copied).
        const AM_ZCOPY = 1 << 2;
        /// One-sided put with zero-copy semantics.
        const PUT_ZCOPY = 1 << 3;
        /// One-sided get with zero-copy semantics.
        const GET_ZCOPY = 1 << 4;
        /// Hardware-assisted incast (many-to-one combine).
        const INCAST = 1 << 5;
        /// Hardware-assisted broadcast (one-to-many replicate).
        const BCAST = 1 << 6;
    }
}

/// Per-endpoint limits relevant to transport selection in the step builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceAttributes {
    /// Capability bits this endpoint actually supports (a subset of what the transport as a
    /// whole can do, if the remote peer negotiated down).
    pub caps: Capabilities,
    /// Largest payload, in bytes, that fits in a single AM-SHORT message.
    pub am_short_max: usize,
    /// Largest payload, in bytes, that fits in a single AM-BCOPY message.
    pub am_bcopy_max: usize,
    /// Smallest payload, in bytes, for which AM-ZCOPY/PUT/GET registration overhead pays off.
    pub zcopy_min: usize,
    /// Largest payload, in bytes, a single zero-copy operation can cover before fragmentation.
    pub zcopy_max: usize,
    /// Packed size, in bytes, of a remote memory key as exchanged by this transport.
    pub rkey_packed_size: usize,
}

/// Attributes of a registered memory region, returned by [`MemoryDomain::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryDomainAttributes {
    /// Opaque local registration handle.
    pub local_handle: u64,
    /// Packed remote key, valid for the lifetime of the registration.
    pub rkey_packed_size: usize,
}

/// The outcome of attempting to issue a single transport-level send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The send was issued and will complete asynchronously; `completion_id` identifies it to
    /// [`Endpoint::poll_completions`].
    InProgress(u64),
    /// The send completed inline (typical for AM-SHORT).
    Complete,
    /// The transport is momentarily out of send resources. Never surfaced as a [`CoreError`];
    /// the step executor absorbs this into the resend queue.
    NoResource,
}

/// A single transport-level endpoint to one peer.
///
/// Endpoints are opened lazily by the endpoint resolver (`crate::endpoint`) and cached on the
/// owning group; they outlive any one operation.
pub trait Endpoint: std::fmt::Debug {
    /// Returns this endpoint's interface attributes, as negotiated with the remote peer.
    fn attributes(&self) -> InterfaceAttributes;

    /// True once the endpoint's connection handshake has finished and sends may be issued.
    fn is_connected(&self) -> bool;

    /// Drives the connection handshake forward by one step; a no-op once connected.
    fn connect_remote(&mut self) -> Result<(), CoreError>;

    /// Issues a short inline active-message send.
    fn am_short(&mut self, am_id: u8, header: u64, payload: &[u8]) -> SendOutcome;

    /// Issues a buffered-copy active-message send; `payload` is copied by the transport before
    /// this call returns, so the caller may reuse the buffer immediately.
    fn am_bcopy(&mut self, am_id: u8, header: u64, payload: &[u8]) -> SendOutcome;

    /// Issues a zero-copy active-message send; `payload` must remain valid (and, if registered,
    /// registered) until the matching completion is observed.
    fn am_zcopy(&mut self, am_id: u8, header: u64, payload: &[u8]) -> SendOutcome;

    /// Issues a one-sided put into the peer's registered memory at `remote_addr`/`rkey`.
    fn put_zcopy(&mut self, payload: &[u8], remote_addr: u64, rkey: &[u8]) -> SendOutcome;

    /// Issues a one-sided get from the peer's registered memory at `remote_addr`/`rkey` into
    /// `payload`.
    fn get_zcopy(&mut self, payload: &mut [u8], remote_addr: u64, rkey: &[u8]) -> SendOutcome;

    /// Drains completion ids for sends previously returned as [`SendOutcome::InProgress`].
    fn poll_completions(&mut self) -> Vec<u64>;
}

/// Memory registration for zero-copy transfers.
pub trait MemoryDomain {
    /// Registers `buffer` for zero-copy access, returning a handle and the packed remote key
    /// size the caller should expect from [`Self::pack_rkey`].
    fn register(&mut self, buffer: &[u8]) -> Result<MemoryDomainAttributes, CoreError>;

    /// Releases a registration obtained from [`Self::register`].
    fn deregister(&mut self, handle: u64);

    /// Packs the remote key for `handle` into a transport-defined byte representation suitable
    /// for exchange in an rkey-broadcast step.
    fn pack_rkey(&self, handle: u64) -> Vec<u8>;
}

/// Factory for endpoints and memory domains, and the transport-wide progress pump.
///
/// One `Transport` is shared by every group created against a [`crate::context::Context`].
pub trait Transport: MemoryDomain {
    /// The concrete endpoint type this transport produces.
    type Ep: Endpoint;

    /// Reserves the next unused active-message identifier in the transport's dispatch table,
    /// skipping any ids already bound (by this or another planner).
    fn reserve_am_id(&mut self) -> Result<u8, CoreError>;

    /// Registers the handler that should receive all inbound messages for `am_id`. The core
    /// registers exactly one handler per planner (see the dispatcher in
    /// [`crate::dispatcher`]), which demultiplexes by wire header from there.
    fn register_am_handler(&mut self, am_id: u8);

    /// Opens a new endpoint to the peer described by `address`, an opaque blob obtained from the
    /// runtime's `address.lookup` callback.
    fn open_endpoint(&mut self, address: &[u8]) -> Result<Self::Ep, CoreError>;

    /// Opens a native collective endpoint (incast, bcast, or both) covering the given peer set
    /// and signature, when the transport and configuration both allow it.
    fn open_collective_endpoint(
        &mut self,
        peers: &[u32],
        caps: Capabilities,
    ) -> Result<Self::Ep, CoreError>;

    /// Drives one tick of transport progress (polling completion queues, advancing
    /// handshakes). The core calls this exactly where the design document's progress tick is
    /// defined: once per resend-queue walk and once per wire-up wait.
    fn progress(&mut self) -> bool;
}
