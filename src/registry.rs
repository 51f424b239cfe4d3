//! The per-process registry.
//!
//! One registry per process owns the hostname, the measured TSC frequency,
//! the request-handler table, and the session-management mailbox of every
//! local endpoint. It routes management packets between local endpoints
//! and linked peer registries. (Production deployments route to remote
//! hosts over UDP; that transport is outside the engine and the in-process
//! router keeps the same mailbox discipline.)

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::rpc::ReqHandle;
use crate::sm::{SmErr, SmMailbox, SmPkt};
use crate::timing::measure_freq_ghz;

/// Maximum distinct request types; the handler table is indexed by the
/// 8-bit request type.
pub const MAX_REQ_TYPES: usize = 256;

/// Whether a request handler runs inline on the event loop or on a
/// background worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqFuncType {
    Foreground,
    Background,
}

/// A registered request handler.
pub struct ReqFunc {
    pub(crate) func: Box<dyn Fn(&mut ReqHandle<'_>) + Send + Sync>,
    pub(crate) kind: ReqFuncType,
}

struct RegistryInner {
    hostname: String,
    freq_ghz: f64,
    num_bg_threads: usize,
    handlers: Mutex<Vec<Option<Arc<ReqFunc>>>>,
    endpoints: Mutex<HashMap<u8, Arc<SmMailbox>>>,
    peers: Mutex<HashMap<String, Weak<RegistryInner>>>,
}

/// Handle to the process-wide registry. Cheap to clone; endpoints keep one.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    /// Create a registry for this process. Measures the TSC frequency once;
    /// `num_bg_threads > 0` makes endpoints created from this registry
    /// multi-threaded (background workers for flagged handlers).
    pub fn new(hostname: &str, num_bg_threads: usize) -> Self {
        let freq_ghz = measure_freq_ghz();
        debug!(hostname, freq_ghz, num_bg_threads, "registry created");
        Self {
            inner: Arc::new(RegistryInner {
                hostname: hostname.to_string(),
                freq_ghz,
                num_bg_threads,
                handlers: Mutex::new((0..MAX_REQ_TYPES).map(|_| None).collect()),
                endpoints: Mutex::new(HashMap::new()),
                peers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.inner.hostname
    }

    /// TSC frequency in GHz, measured at construction.
    pub fn freq_ghz(&self) -> f64 {
        self.inner.freq_ghz
    }

    pub fn num_bg_threads(&self) -> usize {
        self.inner.num_bg_threads
    }

    /// Register a request handler for `req_type`. Must happen before the
    /// endpoints that will serve it are created; endpoints snapshot the
    /// table at construction.
    pub fn register_req_handler<F>(&self, req_type: u8, kind: ReqFuncType, func: F) -> Result<()>
    where
        F: Fn(&mut ReqHandle<'_>) + Send + Sync + 'static,
    {
        let mut handlers = self.inner.handlers.lock();
        let entry = &mut handlers[req_type as usize];
        if entry.is_some() {
            return Err(Error::DuplicateReqType(req_type));
        }
        *entry = Some(Arc::new(ReqFunc {
            func: Box::new(func),
            kind,
        }));
        Ok(())
    }

    /// Make two registries visible to each other for management routing,
    /// as if their hosts shared a management network.
    pub fn link(a: &Registry, b: &Registry) {
        a.inner
            .peers
            .lock()
            .insert(b.hostname().to_string(), Arc::downgrade(&b.inner));
        b.inner
            .peers
            .lock()
            .insert(a.hostname().to_string(), Arc::downgrade(&a.inner));
    }

    /// Install an endpoint's mailbox. Fails on a duplicate endpoint id;
    /// this is a construction-time failure for the endpoint.
    pub(crate) fn register_endpoint(&self, rpc_id: u8) -> Result<Arc<SmMailbox>> {
        let mut endpoints = self.inner.endpoints.lock();
        if endpoints.contains_key(&rpc_id) {
            return Err(Error::DuplicateRpcId(rpc_id));
        }
        let mailbox = Arc::new(SmMailbox::new());
        endpoints.insert(rpc_id, mailbox.clone());
        Ok(mailbox)
    }

    pub(crate) fn unregister_endpoint(&self, rpc_id: u8) {
        self.inner.endpoints.lock().remove(&rpc_id);
    }

    /// Snapshot of the handler table for an endpoint's local copy.
    pub(crate) fn handler_snapshot(&self) -> Vec<Option<Arc<ReqFunc>>> {
        self.inner.handlers.lock().clone()
    }

    /// Route a management packet toward its destination endpoint. Requests
    /// to an unknown endpoint id are answered with an error reply; packets
    /// to an unknown host are dropped (the sender's retry timer handles it).
    pub(crate) fn route_sm(&self, pkt: SmPkt) {
        let dest = pkt.dest().clone();

        let target = if dest.hostname == self.inner.hostname {
            Some(self.inner.clone())
        } else {
            self.inner
                .peers
                .lock()
                .get(&dest.hostname)
                .and_then(Weak::upgrade)
        };

        let Some(target) = target else {
            warn!(host = %dest.hostname, "no route to management destination, dropping");
            return;
        };

        let mailbox = target.endpoints.lock().get(&dest.rpc_id).cloned();
        match mailbox {
            Some(mb) => mb.push(pkt),
            None => {
                warn!(host = %dest.hostname, rpc_id = dest.rpc_id,
                      "management destination endpoint missing");
                if pkt.is_req() && pkt.pkt_type != crate::sm::SmPktType::FaultDropTxRemote {
                    self.route_sm(SmPkt::resp_from(&pkt, SmErr::InvalidEndpoint));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionEndpoint;
    use crate::sm::SmPktType;
    use crate::transport::RoutingInfo;

    fn ep(host: &str, rpc_id: u8) -> SessionEndpoint {
        SessionEndpoint {
            transport_kind: 1,
            hostname: host.to_string(),
            phy_port: 0,
            rpc_id,
            session_num: 0,
            secret: 7,
            routing_info: RoutingInfo::empty(),
        }
    }

    #[test]
    fn test_duplicate_endpoint_id_rejected() {
        let r = Registry::new("host-a", 0);
        r.register_endpoint(3).unwrap();
        assert!(matches!(
            r.register_endpoint(3),
            Err(Error::DuplicateRpcId(3))
        ));
        r.unregister_endpoint(3);
        r.register_endpoint(3).unwrap();
    }

    #[test]
    fn test_local_routing() {
        let r = Registry::new("host-a", 0);
        let mb = r.register_endpoint(1).unwrap();
        let pkt = SmPkt::new_req(SmPktType::ConnectReq, ep("host-b", 0), ep("host-a", 1));
        r.route_sm(pkt);
        assert_eq!(mb.drain().len(), 1);
    }

    #[test]
    fn test_peer_routing_and_unknown_endpoint_reply() {
        let ra = Registry::new("host-a", 0);
        let rb = Registry::new("host-b", 0);
        Registry::link(&ra, &rb);
        let client_mb = ra.register_endpoint(0).unwrap();

        // Request to an endpoint id that does not exist on host-b: the
        // registry answers with an InvalidEndpoint error reply.
        let pkt = SmPkt::new_req(SmPktType::ConnectReq, ep("host-a", 0), ep("host-b", 9));
        ra.route_sm(pkt);
        let replies = client_mb.drain();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].pkt_type, SmPktType::ConnectResp);
        assert_eq!(replies[0].err, SmErr::InvalidEndpoint);
    }

    #[test]
    fn test_unknown_host_dropped() {
        let r = Registry::new("host-a", 0);
        let mb = r.register_endpoint(0).unwrap();
        let pkt = SmPkt::new_req(SmPktType::ConnectReq, ep("host-a", 0), ep("nowhere", 0));
        r.route_sm(pkt);
        assert!(mb.is_empty());
    }
}
