//! The per-endpoint RPC engine.
//!
//! One `Rpc` instance is one logical endpoint bound to one fabric port and
//! one creator thread. The creator thread owns the event loop and every
//! engine mutation; optional background workers execute application
//! callbacks only and hand results back through a completion mailbox.
//!
//! The engine is generic over the [`Transport`]; the datapath
//! monomorphises with the transport's constants and carries no vtable.

mod rx;
mod sm_api;
mod sm_handlers;
mod tx;

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::ThreadId;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::alloc::HugeAllocator;
use crate::bg::{BgComplete, BgWorkerPool};
use crate::buffer::{BufOrigin, MsgBuffer};
use crate::config::RpcConfig;
use crate::error::{Error, Result};
use crate::packet::{pkts_for, PKT_HDR_SIZE};
use crate::registry::{ReqFunc, Registry};
use crate::session::{Session, SESSION_REQ_WINDOW};
use crate::sm::{SmErr, SmEvent, SmMailbox, SmPkt, SmPktType};
use crate::timing::{rdtsc, to_ms, to_sec};
use crate::transport::{RoutingInfo, Transport};

/// Low-bits mask extracting the slot index from a request number.
pub(crate) const REQ_WINDOW_MASK: u64 = (SESSION_REQ_WINDOW as u64) - 1;

/// Session-management event handler: `(local_session_num, event, err)`.
pub type SmHandler = Box<dyn Fn(u16, SmEvent, SmErr)>;

/// Datapath counters. Protocol and configuration failures bump these
/// rather than erroring.
#[derive(Debug, Default, Clone, Copy)]
pub struct DpathStats {
    /// Event-loop iterations.
    pub ev_loop_calls: u64,
    /// Packets dropped because the unexpected-packet window was exhausted.
    pub unexp_credits_exhausted: u64,
    /// Malformed or unroutable packets dropped.
    pub pkts_dropped: u64,
    /// Stale or duplicate responses dropped.
    pub stale_drops: u64,
    /// Management packets dropped (bad secret, bad state).
    pub sm_drops: u64,
}

/// The request payload a handler sees.
pub(crate) enum ReqData<'a> {
    /// Zero-copy view into the receive ring (foreground small requests).
    Borrowed(&'a [u8]),
    /// Copied out of the ring for a background worker.
    Owned(Vec<u8>),
    /// A reassembled multi-packet request, moved from the slot.
    OwnedBuf(MsgBuffer),
}

/// The response a handler chose.
pub(crate) enum RespChoice {
    /// The slot's preallocated single-packet buffer, already sized.
    Prealloc,
    /// A handler-allocated buffer; the engine frees it after transmission.
    Dynamic(MsgBuffer),
}

/// Handle passed to request handlers.
///
/// Carries the request payload and the slot's preallocated response
/// buffer. The handler responds either through the preallocated buffer
/// (`pre_resp_buf` + `set_resp_size`, or `respond` for small payloads) or
/// by attaching a buffer it allocated (`alloc_msg_buffer` +
/// `respond_dynamic`). The response is enqueued when the handler returns.
pub struct ReqHandle<'a> {
    req_type: u8,
    data: ReqData<'a>,
    pre_resp: MsgBuffer,
    choice: Option<RespChoice>,
    max_data_per_pkt: usize,
    alloc: Arc<Mutex<HugeAllocator>>,
}

impl<'a> ReqHandle<'a> {
    pub(crate) fn new(
        req_type: u8,
        data: ReqData<'a>,
        pre_resp: MsgBuffer,
        max_data_per_pkt: usize,
        alloc: Arc<Mutex<HugeAllocator>>,
    ) -> Self {
        Self {
            req_type,
            data,
            pre_resp,
            choice: None,
            max_data_per_pkt,
            alloc,
        }
    }

    #[inline]
    pub fn req_type(&self) -> u8 {
        self.req_type
    }

    /// The request payload.
    pub fn req_data(&self) -> &[u8] {
        match &self.data {
            ReqData::Borrowed(s) => s,
            ReqData::Owned(v) => v,
            ReqData::OwnedBuf(m) => m.data(),
        }
    }

    /// Staging area of the preallocated response buffer (the common-case
    /// path for responses up to one packet).
    pub fn pre_resp_buf(&mut self) -> &mut [u8] {
        self.pre_resp.data_full_mut()
    }

    /// Commit `n` bytes of the preallocated buffer as the response.
    pub fn set_resp_size(&mut self, n: usize) {
        assert!(n <= self.max_data_per_pkt);
        self.pre_resp.set_data_size(n, 1);
        self.choice = Some(RespChoice::Prealloc);
    }

    /// Allocate a buffer for a response larger than one packet.
    /// Returns the invalid buffer when the allocator is exhausted.
    pub fn alloc_msg_buffer(&self, max_data_size: usize) -> MsgBuffer {
        let pkts = pkts_for(max_data_size, self.max_data_per_pkt);
        match self
            .alloc
            .lock()
            .alloc(max_data_size + pkts * PKT_HDR_SIZE)
        {
            Some(raw) => MsgBuffer::from_raw(raw, max_data_size, pkts, BufOrigin::Dynamic),
            None => MsgBuffer::invalid(),
        }
    }

    /// Attach a handler-allocated buffer as the response. The engine owns
    /// and frees it once transmitted.
    pub fn respond_dynamic(&mut self, msgbuf: MsgBuffer) {
        debug_assert!(msgbuf.is_valid() && msgbuf.check_magic());
        if let Some(RespChoice::Dynamic(mut old)) =
            self.choice.replace(RespChoice::Dynamic(msgbuf))
        {
            if let Some(raw) = old.take_raw() {
                self.alloc.lock().free(raw);
            }
        }
    }

    /// Copy `data` out as the response, choosing the preallocated buffer
    /// when it fits and a dynamic buffer otherwise.
    pub fn respond(&mut self, data: &[u8]) -> Result<()> {
        if data.len() <= self.max_data_per_pkt {
            self.pre_resp.set_data_size(data.len(), 1);
            self.pre_resp.data_mut().copy_from_slice(data);
            self.choice = Some(RespChoice::Prealloc);
        } else {
            let mut m = self.alloc_msg_buffer(data.len());
            if !m.is_valid() {
                return Err(Error::OutOfMemory);
            }
            m.data_mut().copy_from_slice(data);
            self.respond_dynamic(m);
        }
        Ok(())
    }

    /// Split into the returning pre-resp buffer, the handler's choice, and
    /// any owned request buffer the engine must free.
    pub(crate) fn into_parts(self) -> (MsgBuffer, Option<RespChoice>, Option<MsgBuffer>) {
        let leftover = match self.data {
            ReqData::OwnedBuf(m) => Some(m),
            _ => None,
        };
        (self.pre_resp, self.choice, leftover)
    }
}

/// One RPC endpoint attached to one fabric port.
pub struct Rpc<T: Transport> {
    registry: Registry,
    rpc_id: u8,
    phy_port: u8,
    config: RpcConfig,

    pub(crate) transport: RefCell<T>,
    pub(crate) huge_alloc: Arc<Mutex<HugeAllocator>>,

    /// Append-only session vector indexed by local session number.
    /// Buried sessions become `None`; numbers are never recycled.
    pub(crate) sessions: RefCell<Vec<Option<Session>>>,
    /// Sessions needing TX; each session appears at most once.
    pub(crate) tx_work_queue: RefCell<Vec<u16>>,
    /// Sessions with an in-flight management request.
    pub(crate) mgmt_retry_queue: RefCell<Vec<u16>>,
    /// Next request-number generation per slot index.
    pub(crate) req_num_arr: RefCell<[u64; SESSION_REQ_WINDOW]>,
    /// Remaining endpoint-wide unexpected-packet credits.
    pub(crate) unexp_credits: Cell<usize>,
    /// Absolute receive-ring cursor.
    pub(crate) rx_ring_head: Cell<usize>,

    pub(crate) sm_mailbox: Arc<SmMailbox>,
    pub(crate) sm_handler: SmHandler,
    /// Snapshot of the registry's handler table.
    pub(crate) handlers: Vec<Option<Arc<ReqFunc>>>,

    pub(crate) local_routing_info: RoutingInfo,
    creator: ThreadId,
    pub(crate) multi_threaded: bool,
    bg_pool: Option<BgWorkerPool>,
    pub(crate) bg_completions: Arc<Mutex<VecDeque<BgComplete>>>,

    creation_tsc: u64,
    pub(crate) freq_ghz: f64,
    pub(crate) stats: RefCell<DpathStats>,

    /// Fault injection: fail remote routing-info resolution at the client
    /// after a valid connect response.
    pub(crate) testing_fail_resolve_remote_rinfo_client: Cell<bool>,
    /// Fault injection: silently drop datapath TX.
    pub(crate) fault_drop_tx_local: Cell<bool>,
}

impl<T: Transport> Rpc<T> {
    /// Construct an endpoint from a foreground thread. Fails loudly on a
    /// duplicate endpoint id or transport bring-up problems; everything
    /// after construction reports errors through codes and callbacks.
    pub fn new<F>(
        registry: &Registry,
        rpc_id: u8,
        phy_port: u8,
        transport: T,
        sm_handler: F,
        config: RpcConfig,
    ) -> Result<Self>
    where
        F: Fn(u16, SmEvent, SmErr) + 'static,
    {
        let sm_mailbox = registry.register_endpoint(rpc_id)?;
        let handlers = registry.handler_snapshot();
        let multi_threaded = registry.num_bg_threads() > 0;

        let huge_alloc = Arc::new(Mutex::new(HugeAllocator::new(config.alloc_capacity)));
        let bg_completions = Arc::new(Mutex::new(VecDeque::new()));
        let bg_pool = if multi_threaded {
            Some(BgWorkerPool::new(
                registry.num_bg_threads(),
                huge_alloc.clone(),
                bg_completions.clone(),
            ))
        } else {
            None
        };

        let mut local_routing_info = RoutingInfo::empty();
        transport.fill_local_routing_info(&mut local_routing_info);
        let unexp_pkt_window = config.unexp_pkt_window;

        let rpc = Self {
            registry: registry.clone(),
            rpc_id,
            phy_port,
            config,
            transport: RefCell::new(transport),
            huge_alloc,
            sessions: RefCell::new(Vec::new()),
            tx_work_queue: RefCell::new(Vec::new()),
            mgmt_retry_queue: RefCell::new(Vec::new()),
            // Generations start at 1 so no live request number is zero.
            req_num_arr: RefCell::new([1; SESSION_REQ_WINDOW]),
            unexp_credits: Cell::new(unexp_pkt_window),
            rx_ring_head: Cell::new(0),
            sm_mailbox,
            sm_handler: Box::new(sm_handler),
            handlers,
            local_routing_info,
            creator: std::thread::current().id(),
            multi_threaded,
            bg_pool,
            bg_completions,
            creation_tsc: rdtsc(),
            freq_ghz: registry.freq_ghz(),
            stats: RefCell::new(DpathStats::default()),
            testing_fail_resolve_remote_rinfo_client: Cell::new(false),
            fault_drop_tx_local: Cell::new(false),
        };

        rpc.transport.borrow_mut().post_recvs(T::RECV_QUEUE_DEPTH);

        info!(rpc_id, phy_port, "rpc endpoint created");
        Ok(rpc)
    }

    /// True iff the caller is the thread that created this endpoint.
    #[inline]
    pub fn in_creator(&self) -> bool {
        std::thread::current().id() == self.creator
    }

    #[inline]
    pub fn rpc_id(&self) -> u8 {
        self.rpc_id
    }

    #[inline]
    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    #[inline]
    pub(crate) fn config(&self) -> &RpcConfig {
        &self.config
    }

    /// Maximum payload bytes per packet for this endpoint's transport.
    #[inline]
    pub fn max_data_per_pkt(&self) -> usize {
        T::MAX_DATA_PER_PKT
    }

    // Buffer API

    /// Allocate a message buffer holding up to `max_data_size` payload
    /// bytes plus its inline packet headers. Returns the invalid buffer
    /// when the allocator is out of memory; callers may retry.
    pub fn alloc_msg_buffer(&self, max_data_size: usize) -> MsgBuffer {
        let max_num_pkts = pkts_for(max_data_size, T::MAX_DATA_PER_PKT);
        match self
            .huge_alloc
            .lock()
            .alloc(max_data_size + max_num_pkts * PKT_HDR_SIZE)
        {
            Some(raw) => MsgBuffer::from_raw(raw, max_data_size, max_num_pkts, BufOrigin::Dynamic),
            None => MsgBuffer::invalid(),
        }
    }

    /// Shrink a buffer to `new_data_size` bytes. Recomputes the packet
    /// count; never touches memory. Idempotent on equal sizes.
    pub fn resize_msg_buffer(&self, msgbuf: &mut MsgBuffer, new_data_size: usize) {
        assert!(msgbuf.is_valid() && msgbuf.check_magic());
        assert!(new_data_size <= msgbuf.max_data_size());
        msgbuf.set_data_size(new_data_size, pkts_for(new_data_size, T::MAX_DATA_PER_PKT));
    }

    /// Free a dynamically allocated buffer. Preallocated slot buffers must
    /// not be freed by the user.
    pub fn free_msg_buffer(&self, mut msgbuf: MsgBuffer) {
        assert!(msgbuf.is_dynamic());
        debug_assert!(msgbuf.check_magic());
        if let Some(raw) = msgbuf.take_raw() {
            self.huge_alloc.lock().free(raw);
        }
    }

    /// Free an engine-owned buffer regardless of origin (bury paths).
    pub(crate) fn free_engine_buf(&self, mut msgbuf: MsgBuffer) {
        if let Some(raw) = msgbuf.take_raw() {
            self.huge_alloc.lock().free(raw);
        }
    }

    /// Allocate one slot's permanent single-packet response buffer.
    pub(crate) fn alloc_prealloc_resp_msgbuf(&self) -> MsgBuffer {
        match self
            .huge_alloc
            .lock()
            .alloc(T::MAX_DATA_PER_PKT + PKT_HDR_SIZE)
        {
            Some(raw) => MsgBuffer::from_raw(raw, T::MAX_DATA_PER_PKT, 1, BufOrigin::Prealloc),
            None => MsgBuffer::invalid(),
        }
    }

    /// Total bytes the allocator currently has handed out.
    pub fn stat_user_alloc_tot(&self) -> usize {
        self.huge_alloc.lock().user_alloc_tot()
    }

    // Event loop

    /// Run exactly one event-loop iteration: management dispatch, retry
    /// sweep, background completions, RX, TX.
    pub fn run_event_loop_one(&self) {
        debug_assert!(self.in_creator());
        self.stats.borrow_mut().ev_loop_calls += 1;

        if !self.sm_mailbox.is_empty() {
            self.handle_session_management();
        }
        if !self.mgmt_retry_queue.borrow().is_empty() {
            self.mgmt_retry();
        }
        if self.multi_threaded {
            self.drain_bg_completions();
        }

        self.process_completions();
        self.process_datapath_tx_work_queue();
    }

    /// Run the event loop forever.
    pub fn run_event_loop(&self) {
        debug_assert!(self.in_creator());
        loop {
            self.run_event_loop_one();
        }
    }

    /// Run the event loop for `timeout_ms` milliseconds, measured by TSC
    /// converted through the registry's CPU frequency.
    pub fn run_event_loop_timeout(&self, timeout_ms: u64) {
        debug_assert!(self.in_creator());
        let start = rdtsc();
        loop {
            self.run_event_loop_one();
            if to_ms(rdtsc().wrapping_sub(start), self.freq_ghz) > timeout_ms as f64 {
                return;
            }
        }
    }

    /// Apply background handler results as ordinary response enqueues.
    fn drain_bg_completions(&self) {
        let completed: Vec<BgComplete> = {
            let mut q = self.bg_completions.lock();
            q.drain(..).collect()
        };
        for c in completed {
            self.enqueue_response_internal(c.session_num, c.sslot_idx, c.req_num, c.pre_resp, c.choice);
        }
    }

    /// Hand a work item to the background pool.
    pub(crate) fn submit_bg(&self, work: crate::bg::BgWork) {
        debug_assert!(self.multi_threaded);
        if let Some(pool) = &self.bg_pool {
            pool.queue.push(work);
        }
    }

    // Introspection

    /// Seconds since this endpoint was constructed.
    pub fn sec_since_creation(&self) -> f64 {
        to_sec(rdtsc().wrapping_sub(self.creation_tsc), self.freq_ghz)
    }

    /// Snapshot of the datapath counters.
    pub fn dpath_stats(&self) -> DpathStats {
        *self.stats.borrow()
    }

    /// State of a session, if it exists.
    pub fn session_state(&self, session_num: u16) -> Option<crate::session::SessionState> {
        self.sessions
            .borrow()
            .get(session_num as usize)
            .and_then(|s| s.as_ref())
            .map(|s| s.state)
    }

    /// Remaining endpoint-wide unexpected-packet credits.
    pub fn unexp_credits(&self) -> usize {
        self.unexp_credits.get()
    }

    /// Remaining credits of a session, if it exists.
    pub fn session_credits(&self, session_num: u16) -> Option<usize> {
        self.sessions
            .borrow()
            .get(session_num as usize)
            .and_then(|s| s.as_ref())
            .map(|s| s.credits)
    }

    // Fault injection

    /// Make the client fail routing-info resolution after receiving a
    /// valid connect response.
    pub fn set_fail_resolve_remote_rinfo_client(&self, enable: bool) {
        self.testing_fail_resolve_remote_rinfo_client.set(enable);
    }

    /// Ask the peer of `session_num` to start dropping its datapath TX.
    pub fn fault_inject_drop_tx_remote(&self, session_num: u16) -> Result<()> {
        debug_assert!(self.in_creator());
        let sessions = self.sessions.borrow();
        let sess = sessions
            .get(session_num as usize)
            .and_then(|s| s.as_ref())
            .ok_or(Error::InvalidSession(session_num))?;
        let pkt = SmPkt::new_req(
            SmPktType::FaultDropTxRemote,
            sess.client.clone(),
            sess.server.clone(),
        );
        drop(sessions);
        warn!(session_num, "injecting remote TX-drop fault");
        self.registry.route_sm(pkt);
        Ok(())
    }
}

impl<T: Transport> Drop for Rpc<T> {
    fn drop(&mut self) {
        if !self.in_creator() {
            warn!(rpc_id = self.rpc_id, "rpc dropped outside its creator thread");
        }
        self.registry.unregister_endpoint(self.rpc_id);
        debug!(rpc_id = self.rpc_id, "rpc endpoint destroyed");
    }
}
