//! Common test utilities: an in-memory fabric standing in for the NIC.
//!
//! `Fabric` is a process-local lossless network; each `FakeTransport`
//! registers an inbox and delivers packets instantly on flush. Routing
//! info carries the transport's fabric id.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use fabrpc::packet::PKT_HDR_SIZE;
use fabrpc::transport::{RouteHandle, RoutingInfo, Transport};
use fabrpc::{Error, PktHdr, Registry, Rpc, RpcConfig, SmErr, SmEvent};

type Inbox = Arc<Mutex<VecDeque<Vec<u8>>>>;

/// A process-local lossless fabric: a directory of transport inboxes.
#[derive(Clone, Default)]
pub struct Fabric {
    directory: Arc<Mutex<HashMap<u32, Inbox>>>,
    next_id: Arc<AtomicU32>,
}

impl Fabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new transport endpoint to this fabric.
    pub fn new_transport(&self) -> FakeTransport {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let inbox: Inbox = Arc::new(Mutex::new(VecDeque::new()));
        self.directory.lock().unwrap().insert(id, inbox.clone());
        FakeTransport {
            id,
            inbox,
            directory: self.directory.clone(),
            routes: Vec::new(),
            postlist: Vec::new(),
            ring: vec![Vec::new(); FakeTransport::RECV_QUEUE_DEPTH],
            ring_write: 0,
            posted_recvs: 0,
            fail_resolve: false,
        }
    }
}

/// One datagram queue pair on the fake fabric.
pub struct FakeTransport {
    id: u32,
    inbox: Inbox,
    directory: Arc<Mutex<HashMap<u32, Inbox>>>,
    routes: Vec<Inbox>,
    postlist: Vec<(usize, Vec<u8>)>,
    ring: Vec<Vec<u8>>,
    ring_write: usize,
    posted_recvs: usize,
    /// Make `resolve_remote_routing_info` fail.
    pub fail_resolve: bool,
}

impl Transport for FakeTransport {
    const KIND: u8 = 1;
    const MAX_DATA_PER_PKT: usize = 1024;
    const RECV_QUEUE_DEPTH: usize = 64;
    const POSTLIST: usize = 8;

    fn fill_local_routing_info(&self, ri: &mut RoutingInfo) {
        ri.buf[..4].copy_from_slice(&self.id.to_le_bytes());
        ri.len = 4;
    }

    fn resolve_remote_routing_info(&mut self, ri: &RoutingInfo) -> fabrpc::Result<RouteHandle> {
        if self.fail_resolve || ri.len < 4 {
            return Err(Error::ResolveFailure);
        }
        let id = u32::from_le_bytes(ri.buf[..4].try_into().unwrap());
        let inbox = self
            .directory
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(Error::ResolveFailure)?;
        self.routes.push(inbox);
        Ok((self.routes.len() - 1) as RouteHandle)
    }

    fn post_send(&mut self, route: RouteHandle, hdr: &PktHdr, payload: &[u8]) -> bool {
        if self.postlist.len() >= Self::POSTLIST {
            return false;
        }
        let mut pkt = Vec::with_capacity(PKT_HDR_SIZE + payload.len());
        pkt.extend_from_slice(&hdr.to_bytes());
        pkt.extend_from_slice(payload);
        self.postlist.push((route as usize, pkt));
        true
    }

    fn flush_sends(&mut self) {
        for (route, pkt) in self.postlist.drain(..) {
            if let Some(inbox) = self.routes.get(route) {
                inbox.lock().unwrap().push_back(pkt);
            }
        }
    }

    fn rx_burst(&mut self, max: usize) -> usize {
        let mut inbox = self.inbox.lock().unwrap();
        let mut count = 0;
        while count < max && self.posted_recvs > 0 {
            let Some(pkt) = inbox.pop_front() else { break };
            self.ring[self.ring_write % Self::RECV_QUEUE_DEPTH] = pkt;
            self.ring_write += 1;
            self.posted_recvs -= 1;
            count += 1;
        }
        count
    }

    fn rx_slot(&self, slot: usize) -> &[u8] {
        &self.ring[slot]
    }

    fn post_recvs(&mut self, n: usize) {
        self.posted_recvs = (self.posted_recvs + n).min(Self::RECV_QUEUE_DEPTH);
    }
}

/// Session-management events observed by an endpoint.
pub type SmEvents = Arc<Mutex<Vec<(u16, SmEvent, SmErr)>>>;

/// A registry + endpoint pair wired to a fabric, with captured SM events.
pub struct TestEndpoint {
    pub registry: Registry,
    pub rpc: Rpc<FakeTransport>,
    pub sm_events: SmEvents,
}

impl TestEndpoint {
    pub fn new(fabric: &Fabric, registry: &Registry, rpc_id: u8, config: RpcConfig) -> Self {
        let sm_events: SmEvents = Arc::new(Mutex::new(Vec::new()));
        let events = sm_events.clone();
        let rpc = Rpc::new(
            registry,
            rpc_id,
            0,
            fabric.new_transport(),
            move |session, event, err| {
                events.lock().unwrap().push((session, event, err));
            },
            config,
        )
        .expect("endpoint construction");
        Self {
            registry: registry.clone(),
            rpc,
            sm_events,
        }
    }

    pub fn has_event(&self, event: SmEvent) -> bool {
        self.sm_events.lock().unwrap().iter().any(|(_, e, _)| *e == event)
    }
}

/// Drive both endpoints' event loops for `iters` iterations.
pub fn run_both(a: &Rpc<FakeTransport>, b: &Rpc<FakeTransport>, iters: usize) {
    for _ in 0..iters {
        a.run_event_loop_one();
        b.run_event_loop_one();
    }
}
