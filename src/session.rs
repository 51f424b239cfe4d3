//! Sessions and session slots.
//!
//! A session is one logical channel between a client endpoint and a server
//! endpoint. It carries up to `SESSION_REQ_WINDOW` concurrent
//! request/response exchanges, one per slot.

use crate::buffer::MsgBuffer;
use crate::transport::{RouteHandle, RoutingInfo};

/// Slots per session. Power of two; the low `REQ_WINDOW_SHIFT` bits of a
/// request number are the slot index.
pub const SESSION_REQ_WINDOW: usize = 8;

/// log2 of [`SESSION_REQ_WINDOW`].
pub const REQ_WINDOW_SHIFT: u32 = SESSION_REQ_WINDOW.trailing_zeros();

/// Width of the session secret exchanged in the handshake.
pub const SECRET_BITS: u32 = 48;

/// Maximum hostname length accepted by session management.
pub const MAX_HOSTNAME_LEN: usize = 127;

/// Maximum zero-based physical fabric port.
pub const MAX_PHY_PORTS: u8 = 16;

/// Session role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Client,
    Server,
}

/// Session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connect request sent, waiting for the response.
    ConnectInProgress,
    /// Ready for requests.
    Connected,
    /// Disconnect request sent, waiting for the response.
    DisconnectInProgress,
    /// Terminal; the session-vector entry is nulled after burial.
    Disconnected,
}

/// One side of a session: everything a peer needs to address and validate
/// this endpoint.
#[derive(Debug, Clone)]
pub struct SessionEndpoint {
    /// Transport kind tag; both sides must match.
    pub transport_kind: u8,
    pub hostname: String,
    /// Zero-based physical fabric port.
    pub phy_port: u8,
    /// Application-assigned endpoint id.
    pub rpc_id: u8,
    /// Session number local to this side.
    pub session_num: u16,
    /// 48-bit shared secret, echoed unchanged in every management reply.
    pub secret: u64,
    /// Opaque transport addressing blob.
    pub routing_info: RoutingInfo,
}

impl SessionEndpoint {
    pub fn name(&self) -> String {
        format!("{}:{}", self.hostname, self.rpc_id)
    }
}

/// What a slot is currently transmitting.
#[derive(Debug)]
pub enum TxBuf {
    /// Nothing pending.
    None,
    /// A client request; the buffer is application-owned and is handed back
    /// through the continuation, never freed by the engine.
    Request(MsgBuffer),
    /// The slot's preallocated single-packet response buffer.
    PreResp,
    /// A handler-allocated response; freed once fully transmitted.
    DynamicResp(MsgBuffer),
}

impl TxBuf {
    #[inline]
    pub fn is_none(&self) -> bool {
        matches!(self, TxBuf::None)
    }

    #[inline]
    pub fn is_resp(&self) -> bool {
        matches!(self, TxBuf::PreResp | TxBuf::DynamicResp(_))
    }
}

/// Continuation invoked when a client request completes. Receives the
/// request buffer back (ownership returns to the application), the response
/// payload, and the tag given to `enqueue_request`.
pub type Continuation = Box<dyn FnOnce(MsgBuffer, &[u8], u64) + Send>;

/// Multi-packet reassembly state for one in-flight message.
#[derive(Debug)]
pub struct Reassembly {
    pub msgbuf: MsgBuffer,
    bitmap: Vec<u64>,
    pkts_rcvd: usize,
    num_pkts: usize,
}

impl Reassembly {
    pub fn new(msgbuf: MsgBuffer, num_pkts: usize) -> Self {
        Self {
            msgbuf,
            bitmap: vec![0u64; (num_pkts + 63) / 64],
            pkts_rcvd: 0,
            num_pkts,
        }
    }

    /// Record a packet. Returns false for duplicates. Out-of-order arrival
    /// within the message is tolerated.
    pub fn record(&mut self, pkt_num: u16) -> bool {
        let i = pkt_num as usize;
        debug_assert!(i < self.num_pkts);
        let mask = 1u64 << (i % 64);
        if self.bitmap[i / 64] & mask != 0 {
            return false;
        }
        self.bitmap[i / 64] |= mask;
        self.pkts_rcvd += 1;
        true
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.pkts_rcvd == self.num_pkts
    }
}

/// One in-flight request/response pair within a session.
pub struct SSlot {
    /// Slot index within the session.
    pub index: usize,
    /// Current request number; low bits equal `index`, high bits are the
    /// reuse generation. Strictly increasing per slot.
    pub cur_req_num: u64,
    /// Request type of the exchange in progress.
    pub req_type: u8,
    /// What the TX engine is transmitting for this slot.
    pub tx_msgbuf: TxBuf,
    /// Packets of `tx_msgbuf` handed to the transport so far.
    pub tx_pkts_sent: usize,
    /// Total packets in `tx_msgbuf`.
    pub tx_num_pkts: usize,
    /// Fully transmitted client request, parked until the continuation runs.
    pub req_backup: Option<MsgBuffer>,
    /// Permanent single-packet response buffer, sized for the common small
    /// response. Owned by this slot for the session's lifetime.
    pub pre_resp_msgbuf: MsgBuffer,
    /// Client continuation and tag.
    pub cont: Option<Continuation>,
    pub tag: u64,
    /// Multi-packet reassembly in progress, if any.
    pub rx: Option<Reassembly>,
    /// Unexpected-window credits consumed by the request being served.
    pub unexp_taken: usize,
    /// An explicit credit return already went out for this request.
    pub cr_sent: bool,
}

impl SSlot {
    pub fn new(index: usize, pre_resp_msgbuf: MsgBuffer) -> Self {
        Self {
            index,
            cur_req_num: 0,
            req_type: 0,
            tx_msgbuf: TxBuf::None,
            tx_pkts_sent: 0,
            tx_num_pkts: 0,
            req_backup: None,
            pre_resp_msgbuf,
            cont: None,
            tag: 0,
            rx: None,
            unexp_taken: 0,
            cr_sent: false,
        }
    }

    /// True when the TX engine still owes packets for this slot.
    #[inline]
    pub fn has_pending_tx(&self) -> bool {
        !self.tx_msgbuf.is_none()
    }
}

/// A client or server endpoint pair with its slots and flow-control state.
pub struct Session {
    pub role: SessionRole,
    pub state: SessionState,
    /// The client side of this session. Fully populated at creation.
    pub client: SessionEndpoint,
    /// The server side; `session_num` and `routing_info` are filled by the
    /// connect response at the client.
    pub server: SessionEndpoint,
    pub local_session_num: u16,
    pub sslots: Vec<SSlot>,
    /// Free-slot stack, client side.
    pub sslot_free_vec: Vec<usize>,
    /// Remaining session credits.
    pub credits: usize,
    max_credits: usize,
    /// True iff this session is in the datapath TX work queue.
    pub in_tx_queue: bool,
    /// Resolved transport route to the peer.
    pub remote_route: Option<RouteHandle>,
    /// TSC stamp of the last management request sent.
    pub last_sm_send_tsc: u64,
    /// Resend count for the in-flight management request.
    pub sm_attempts: usize,
}

impl Session {
    /// Create a session. `pre_resp_msgbufs` supplies one preallocated
    /// single-packet buffer per slot.
    pub fn new(
        role: SessionRole,
        state: SessionState,
        client: SessionEndpoint,
        server: SessionEndpoint,
        local_session_num: u16,
        pre_resp_msgbufs: Vec<MsgBuffer>,
        credits: usize,
    ) -> Self {
        debug_assert_eq!(pre_resp_msgbufs.len(), SESSION_REQ_WINDOW);
        let sslots: Vec<SSlot> = pre_resp_msgbufs
            .into_iter()
            .enumerate()
            .map(|(i, buf)| SSlot::new(i, buf))
            .collect();
        // Pop order matches slot order: index 0 first.
        let sslot_free_vec = (0..SESSION_REQ_WINDOW).rev().collect();

        Self {
            role,
            state,
            client,
            server,
            local_session_num,
            sslots,
            sslot_free_vec,
            credits,
            max_credits: credits,
            in_tx_queue: false,
            remote_route: None,
            last_sm_send_tsc: 0,
            sm_attempts: 0,
        }
    }

    #[inline]
    pub fn is_client(&self) -> bool {
        self.role == SessionRole::Client
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    /// The peer's session number, stamped into outgoing packet headers.
    #[inline]
    pub fn peer_session_num(&self) -> u16 {
        match self.role {
            SessionRole::Client => self.server.session_num,
            SessionRole::Server => self.client.session_num,
        }
    }

    /// Pop a free slot, if any.
    #[inline]
    pub fn alloc_sslot(&mut self) -> Option<usize> {
        self.sslot_free_vec.pop()
    }

    /// Return a slot to the free stack.
    #[inline]
    pub fn free_sslot(&mut self, index: usize) {
        debug_assert!(!self.sslot_free_vec.contains(&index));
        self.sslot_free_vec.push(index);
    }

    /// Consume one credit for a message start. False when exhausted.
    #[inline]
    pub fn consume_credit(&mut self) -> bool {
        if self.credits == 0 {
            return false;
        }
        self.credits -= 1;
        true
    }

    /// Return one credit, capped at the configured maximum.
    #[inline]
    pub fn return_credit(&mut self) {
        if self.credits < self.max_credits {
            self.credits += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::MsgBuffer;

    fn dummy_endpoint(hostname: &str, rpc_id: u8) -> SessionEndpoint {
        SessionEndpoint {
            transport_kind: 0,
            hostname: hostname.to_string(),
            phy_port: 0,
            rpc_id,
            session_num: 0,
            secret: 0x1234,
            routing_info: RoutingInfo::empty(),
        }
    }

    fn dummy_session() -> Session {
        let bufs = (0..SESSION_REQ_WINDOW).map(|_| MsgBuffer::invalid()).collect();
        Session::new(
            SessionRole::Client,
            SessionState::Connected,
            dummy_endpoint("a", 0),
            dummy_endpoint("b", 1),
            0,
            bufs,
            8,
        )
    }

    #[test]
    fn test_slot_alloc_order_and_exhaustion() {
        let mut s = dummy_session();
        for i in 0..SESSION_REQ_WINDOW {
            assert_eq!(s.alloc_sslot(), Some(i));
        }
        assert_eq!(s.alloc_sslot(), None);
        s.free_sslot(3);
        assert_eq!(s.alloc_sslot(), Some(3));
    }

    #[test]
    fn test_credits_capped() {
        let mut s = dummy_session();
        assert!(s.consume_credit());
        assert_eq!(s.credits, 7);
        s.return_credit();
        s.return_credit();
        assert_eq!(s.credits, 8);
        for _ in 0..8 {
            assert!(s.consume_credit());
        }
        assert!(!s.consume_credit());
    }

    #[test]
    fn test_reassembly_out_of_order_and_dups() {
        let mut a = crate::alloc::HugeAllocator::new(4 * 1024 * 1024);
        let raw = a.alloc(4096 + 4 * 16).unwrap();
        let buf = MsgBuffer::from_raw(raw, 4096, 4, crate::buffer::BufOrigin::Dynamic);
        let mut r = Reassembly::new(buf, 4);

        assert!(r.record(2));
        assert!(r.record(0));
        assert!(!r.record(2)); // duplicate
        assert!(!r.is_complete());
        assert!(r.record(3));
        assert!(r.record(1));
        assert!(r.is_complete());
        a.free(r.msgbuf.take_raw().unwrap());
    }

    #[test]
    fn test_peer_session_num_by_role() {
        let mut s = dummy_session();
        s.server.session_num = 42;
        s.client.session_num = 7;
        assert_eq!(s.peer_session_num(), 42);
        s.role = SessionRole::Server;
        assert_eq!(s.peer_session_num(), 7);
    }
}
