//! The unreliable-transport interface the engine consumes.
//!
//! A transport models one NIC queue pair on a lossless fabric: a fixed-size
//! send postlist and a receive ring. The engine is generic over the
//! transport, so the datapath monomorphises with the transport's constants
//! and carries no vtable.

use crate::error::Result;
use crate::packet::PktHdr;

/// Maximum bytes of opaque routing info exchanged in the connect handshake.
pub const MAX_ROUTING_INFO_LEN: usize = 48;

/// Opaque transport-specific addressing blob. Filled by the local transport,
/// resolved by the peer's.
#[derive(Clone, Copy)]
pub struct RoutingInfo {
    pub buf: [u8; MAX_ROUTING_INFO_LEN],
    pub len: u8,
}

impl RoutingInfo {
    pub fn empty() -> Self {
        Self {
            buf: [0; MAX_ROUTING_INFO_LEN],
            len: 0,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len as usize]
    }
}

impl Default for RoutingInfo {
    fn default() -> Self {
        Self::empty()
    }
}

impl std::fmt::Debug for RoutingInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RoutingInfo({} bytes)", self.len)
    }
}

/// Handle to a resolved remote route, returned by
/// [`Transport::resolve_remote_routing_info`].
pub type RouteHandle = u32;

/// An unreliable datagram transport.
///
/// All operations are non-blocking. `post_send` queues into the postlist;
/// `flush_sends` rings the doorbell. `rx_burst` surfaces newly arrived
/// packets in the receive ring; ring entries stay valid until the engine
/// reposts them with `post_recvs`.
pub trait Transport {
    /// Transport kind tag carried in session endpoints; both ends of a
    /// session must match.
    const KIND: u8;
    /// Maximum payload bytes per packet, excluding the packet header.
    const MAX_DATA_PER_PKT: usize;
    /// Depth of the receive ring.
    const RECV_QUEUE_DEPTH: usize;
    /// Send postlist capacity.
    const POSTLIST: usize;

    /// Write the opaque routing info a peer needs to reach this endpoint.
    fn fill_local_routing_info(&self, ri: &mut RoutingInfo);

    /// Resolve a peer's routing info into a send route. May fail; failures
    /// surface as connect errors.
    fn resolve_remote_routing_info(&mut self, ri: &RoutingInfo) -> Result<RouteHandle>;

    /// Queue one packet (header plus payload copied into the next postlist
    /// entry). Returns false when the postlist is full; the caller retries
    /// after a flush.
    fn post_send(&mut self, route: RouteHandle, hdr: &PktHdr, payload: &[u8]) -> bool;

    /// Post the accumulated postlist to the wire.
    fn flush_sends(&mut self);

    /// Poll for newly received packets, up to `max`. Returns the count;
    /// packet `i` of the burst lands at ring slot
    /// `(ring_head + i) % RECV_QUEUE_DEPTH`.
    fn rx_burst(&mut self, max: usize) -> usize;

    /// Borrow the packet bytes in a receive-ring slot.
    fn rx_slot(&self, slot: usize) -> &[u8];

    /// Return `n` consumed ring entries to the NIC.
    fn post_recvs(&mut self, n: usize);
}
