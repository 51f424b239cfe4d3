//! Session-management messages and mailboxes.
//!
//! Management traffic is transport-agnostic: structs routed by the
//! registry between endpoint mailboxes. Each endpoint's mailbox is a
//! single-producer/single-consumer list guarded by its own lock, shared
//! with whatever thread the registry routes from.

use parking_lot::Mutex;

use crate::session::SessionEndpoint;

/// Management packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmPktType {
    ConnectReq,
    ConnectResp,
    DisconnectReq,
    DisconnectResp,
    /// Fault injection: the receiver starts dropping datapath TX.
    FaultDropTxRemote,
}

impl SmPktType {
    #[inline]
    pub fn is_req(self) -> bool {
        matches!(
            self,
            SmPktType::ConnectReq | SmPktType::DisconnectReq | SmPktType::FaultDropTxRemote
        )
    }

    /// The response type matching a request type.
    pub fn req_to_resp(self) -> SmPktType {
        match self {
            SmPktType::ConnectReq => SmPktType::ConnectResp,
            SmPktType::DisconnectReq => SmPktType::DisconnectResp,
            _ => unreachable!("not a request type"),
        }
    }
}

/// Error kind carried in management responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmErr {
    NoError,
    /// The server's session limit is reached.
    TooManySessions,
    /// Routing info resolution failed.
    ResolveFailure,
    /// The server could not allocate session buffers.
    OutOfMemory,
    /// Transport kinds do not match.
    InvalidTransport,
    /// The addressed endpoint does not exist at the destination.
    InvalidEndpoint,
}

/// Events delivered to the application's session-management handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmEvent {
    Connected,
    ConnectFailed,
    Disconnected,
    DisconnectFailed,
}

/// A session-management packet. Carries both endpoint descriptors; the
/// shared secret inside them is echoed unchanged in every reply.
#[derive(Debug, Clone)]
pub struct SmPkt {
    pub pkt_type: SmPktType,
    pub err: SmErr,
    pub client: SessionEndpoint,
    pub server: SessionEndpoint,
}

impl SmPkt {
    pub fn new_req(pkt_type: SmPktType, client: SessionEndpoint, server: SessionEndpoint) -> Self {
        debug_assert!(pkt_type.is_req());
        Self {
            pkt_type,
            err: SmErr::NoError,
            client,
            server,
        }
    }

    /// Build the response to a request, echoing both endpoints.
    pub fn resp_from(req: &SmPkt, err: SmErr) -> Self {
        Self {
            pkt_type: req.pkt_type.req_to_resp(),
            err,
            client: req.client.clone(),
            server: req.server.clone(),
        }
    }

    #[inline]
    pub fn is_req(&self) -> bool {
        self.pkt_type.is_req()
    }

    /// The endpoint this packet should be routed to.
    pub fn dest(&self) -> &SessionEndpoint {
        if self.is_req() {
            &self.server
        } else {
            &self.client
        }
    }
}

/// A locked SPSC list delivering management packets to one endpoint.
pub struct SmMailbox {
    list: Mutex<Vec<SmPkt>>,
}

impl SmMailbox {
    pub fn new() -> Self {
        Self {
            list: Mutex::new(Vec::new()),
        }
    }

    /// Producer side: the registry's routing thread.
    pub fn push(&self, pkt: SmPkt) {
        self.list.lock().push(pkt);
    }

    /// Consumer side: the endpoint's event loop. Takes everything queued.
    pub fn drain(&self) -> Vec<SmPkt> {
        std::mem::take(&mut *self.list.lock())
    }

    pub fn is_empty(&self) -> bool {
        self.list.lock().is_empty()
    }
}

impl Default for SmMailbox {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::RoutingInfo;

    fn ep(host: &str) -> SessionEndpoint {
        SessionEndpoint {
            transport_kind: 1,
            hostname: host.to_string(),
            phy_port: 0,
            rpc_id: 0,
            session_num: 0,
            secret: 99,
            routing_info: RoutingInfo::empty(),
        }
    }

    #[test]
    fn test_req_resp_routing_direction() {
        let req = SmPkt::new_req(SmPktType::ConnectReq, ep("client"), ep("server"));
        assert_eq!(req.dest().hostname, "server");

        let resp = SmPkt::resp_from(&req, SmErr::NoError);
        assert_eq!(resp.pkt_type, SmPktType::ConnectResp);
        assert_eq!(resp.dest().hostname, "client");
        // Secret echoed unchanged.
        assert_eq!(resp.client.secret, 99);
    }

    #[test]
    fn test_mailbox_drain_order() {
        let mb = SmMailbox::new();
        mb.push(SmPkt::new_req(SmPktType::ConnectReq, ep("a"), ep("b")));
        mb.push(SmPkt::new_req(SmPktType::DisconnectReq, ep("a"), ep("b")));
        let pkts = mb.drain();
        assert_eq!(pkts.len(), 2);
        assert_eq!(pkts[0].pkt_type, SmPktType::ConnectReq);
        assert_eq!(pkts[1].pkt_type, SmPktType::DisconnectReq);
        assert!(mb.is_empty());
    }
}
