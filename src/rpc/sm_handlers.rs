//! Session-management dispatch: the three-way handshake, retries, and
//! session burial.

use tracing::{debug, info, warn};

use crate::session::{
    Session, SessionRole, SessionState, TxBuf, SESSION_REQ_WINDOW,
};
use crate::sm::{SmErr, SmEvent, SmPkt, SmPktType};
use crate::timing::{ms_to_cycles, rdtsc};
use crate::transport::Transport;

use super::Rpc;

impl<T: Transport> Rpc<T> {
    /// Drain the management mailbox and dispatch every packet.
    pub(crate) fn handle_session_management(&self) {
        debug_assert!(self.in_creator());
        for pkt in self.sm_mailbox.drain() {
            match pkt.pkt_type {
                SmPktType::ConnectReq => self.handle_connect_req(&pkt),
                SmPktType::ConnectResp => self.handle_connect_resp(&pkt),
                SmPktType::DisconnectReq => self.handle_disconnect_req(&pkt),
                SmPktType::DisconnectResp => self.handle_disconnect_resp(&pkt),
                SmPktType::FaultDropTxRemote => {
                    warn!(from = %pkt.client.name(), "received drop-TX fault injection");
                    self.fault_drop_tx_local.set(true);
                }
            }
        }
    }

    // Requests sent by this (client) endpoint

    pub(crate) fn send_connect_req_one(&self, session_num: u16) {
        let pkt = {
            let mut sessions = self.sessions.borrow_mut();
            let Some(Some(sess)) = sessions.get_mut(session_num as usize) else {
                return;
            };
            debug_assert!(sess.is_client());
            debug_assert_eq!(sess.state, SessionState::ConnectInProgress);
            sess.last_sm_send_tsc = rdtsc();
            SmPkt::new_req(SmPktType::ConnectReq, sess.client.clone(), sess.server.clone())
        };
        self.registry().route_sm(pkt);
    }

    pub(crate) fn send_disconnect_req_one(&self, session_num: u16) {
        let pkt = {
            let mut sessions = self.sessions.borrow_mut();
            let Some(Some(sess)) = sessions.get_mut(session_num as usize) else {
                return;
            };
            debug_assert!(sess.is_client());
            debug_assert_eq!(sess.state, SessionState::DisconnectInProgress);
            sess.last_sm_send_tsc = rdtsc();
            SmPkt::new_req(
                SmPktType::DisconnectReq,
                sess.client.clone(),
                sess.server.clone(),
            )
        };
        self.registry().route_sm(pkt);
    }

    // Retry queue

    pub(crate) fn mgmt_retry_queue_add(&self, session_num: u16) {
        let mut queue = self.mgmt_retry_queue.borrow_mut();
        debug_assert!(!queue.contains(&session_num));
        queue.push(session_num);
    }

    pub(crate) fn mgmt_retry_queue_remove(&self, session_num: u16) {
        self.mgmt_retry_queue.borrow_mut().retain(|&s| s != session_num);
    }

    pub(crate) fn mgmt_retry_queue_contains(&self, session_num: u16) -> bool {
        self.mgmt_retry_queue.borrow().contains(&session_num)
    }

    /// Resend expired management requests; fail operations that exhausted
    /// the retry cap.
    pub(crate) fn mgmt_retry(&self) {
        debug_assert!(self.in_creator());
        let now = rdtsc();
        let retry_cycles = ms_to_cycles(self.config().mgmt_retry_ms, self.freq_ghz);
        let queue_snapshot: Vec<u16> = self.mgmt_retry_queue.borrow().clone();

        for session_num in queue_snapshot {
            let (state, expired, exhausted) = {
                let mut sessions = self.sessions.borrow_mut();
                let Some(Some(sess)) = sessions.get_mut(session_num as usize) else {
                    self.mgmt_retry_queue_remove(session_num);
                    continue;
                };
                let expired = now.wrapping_sub(sess.last_sm_send_tsc) >= retry_cycles;
                if expired {
                    sess.sm_attempts += 1;
                }
                (
                    sess.state,
                    expired,
                    sess.sm_attempts >= self.config().mgmt_max_retries,
                )
            };

            if !expired {
                continue;
            }

            if exhausted {
                self.mgmt_retry_queue_remove(session_num);
                match state {
                    SessionState::ConnectInProgress => {
                        warn!(session = session_num, "connect retry cap exhausted");
                        (self.sm_handler)(session_num, SmEvent::ConnectFailed, SmErr::NoError);
                        self.bury_session(session_num);
                    }
                    SessionState::DisconnectInProgress => {
                        warn!(session = session_num, "disconnect retry cap exhausted");
                        (self.sm_handler)(session_num, SmEvent::DisconnectFailed, SmErr::NoError);
                        // The peer is unresponsive; reclaim resources anyway.
                        self.bury_session(session_num);
                    }
                    _ => {}
                }
                continue;
            }

            match state {
                SessionState::ConnectInProgress => {
                    debug!(session = session_num, "retrying connect request");
                    self.send_connect_req_one(session_num);
                }
                SessionState::DisconnectInProgress => {
                    debug!(session = session_num, "retrying disconnect request");
                    self.send_disconnect_req_one(session_num);
                }
                _ => self.mgmt_retry_queue_remove(session_num),
            }
        }
    }

    // Server-side handlers

    fn handle_connect_req(&self, pkt: &SmPkt) {
        debug_assert!(self.in_creator());

        // Addressed to this endpoint?
        if pkt.server.hostname != self.registry().hostname()
            || pkt.server.rpc_id != self.rpc_id()
        {
            warn!(dest = %pkt.server.name(), "connect request for another endpoint");
            self.enqueue_sm_resp(pkt, SmErr::InvalidEndpoint);
            return;
        }
        if pkt.server.transport_kind != T::KIND || pkt.client.transport_kind != T::KIND {
            warn!("connect request with mismatched transport kind");
            self.enqueue_sm_resp(pkt, SmErr::InvalidTransport);
            return;
        }

        // A retransmitted connect request for a session we already set up:
        // resend the response instead of creating a second session.
        let dup_resp = {
            let sessions = self.sessions.borrow();
            sessions.iter().flatten().find_map(|sess| {
                let same_client = sess.role == SessionRole::Server
                    && sess.client.hostname == pkt.client.hostname
                    && sess.client.rpc_id == pkt.client.rpc_id
                    && sess.client.session_num == pkt.client.session_num
                    && sess.client.secret == pkt.client.secret;
                same_client.then(|| {
                    let mut resp = SmPkt::resp_from(pkt, SmErr::NoError);
                    resp.server = sess.server.clone();
                    (sess.local_session_num, resp)
                })
            })
        };
        if let Some((session_num, resp)) = dup_resp {
            debug!(session = session_num, "duplicate connect request");
            self.registry().route_sm(resp);
            return;
        }

        if self.sessions.borrow().len() >= self.config().max_sessions {
            warn!("connect request rejected: session limit");
            self.enqueue_sm_resp(pkt, SmErr::TooManySessions);
            return;
        }

        let route = match self
            .transport
            .borrow_mut()
            .resolve_remote_routing_info(&pkt.client.routing_info)
        {
            Ok(route) => route,
            Err(_) => {
                warn!(client = %pkt.client.name(), "failed to resolve client routing info");
                self.enqueue_sm_resp(pkt, SmErr::ResolveFailure);
                return;
            }
        };

        let mut pre_resp_msgbufs = Vec::with_capacity(SESSION_REQ_WINDOW);
        for _ in 0..SESSION_REQ_WINDOW {
            let buf = self.alloc_prealloc_resp_msgbuf();
            if !buf.is_valid() {
                for b in pre_resp_msgbufs {
                    self.free_engine_buf(b);
                }
                warn!("connect request rejected: out of memory");
                self.enqueue_sm_resp(pkt, SmErr::OutOfMemory);
                return;
            }
            pre_resp_msgbufs.push(buf);
        }

        let local_session_num = self.sessions.borrow().len() as u16;
        let mut server = pkt.server.clone();
        server.session_num = local_session_num;
        server.routing_info = self.local_routing_info;

        let mut session = Session::new(
            SessionRole::Server,
            SessionState::Connected,
            pkt.client.clone(),
            server.clone(),
            local_session_num,
            pre_resp_msgbufs,
            self.config().session_credits,
        );
        session.remote_route = Some(route);
        self.sessions.borrow_mut().push(Some(session));

        info!(
            session = local_session_num,
            client = %pkt.client.name(),
            "server session connected"
        );
        (self.sm_handler)(local_session_num, SmEvent::Connected, SmErr::NoError);

        let mut resp = SmPkt::resp_from(pkt, SmErr::NoError);
        resp.server = server;
        self.registry().route_sm(resp);
    }

    fn handle_disconnect_req(&self, pkt: &SmPkt) {
        debug_assert!(self.in_creator());
        let session_num = pkt.server.session_num;

        let found = {
            let mut sessions = self.sessions.borrow_mut();
            match sessions.get_mut(session_num as usize).and_then(|s| s.as_mut()) {
                Some(sess) if sess.role == SessionRole::Server => {
                    if sess.server.secret != pkt.server.secret {
                        warn!(session = session_num, "disconnect request with bad secret");
                        self.stats.borrow_mut().sm_drops += 1;
                        return;
                    }
                    sess.state = SessionState::DisconnectInProgress;
                    true
                }
                // Already buried (a retransmitted disconnect): still reply
                // so the client completes.
                _ => false,
            }
        };

        self.registry().route_sm(SmPkt::resp_from(pkt, SmErr::NoError));

        if found {
            if let Some(Some(sess)) = self.sessions.borrow_mut().get_mut(session_num as usize) {
                sess.state = SessionState::Disconnected;
            }
            info!(session = session_num, "server session disconnected");
            (self.sm_handler)(session_num, SmEvent::Disconnected, SmErr::NoError);
            self.bury_session(session_num);
        }
    }

    // Client-side handlers

    fn handle_connect_resp(&self, pkt: &SmPkt) {
        debug_assert!(self.in_creator());
        let session_num = pkt.client.session_num;

        {
            let sessions = self.sessions.borrow();
            let Some(Some(sess)) = sessions.get(session_num as usize) else {
                self.stats.borrow_mut().sm_drops += 1;
                return;
            };
            if sess.client.secret != pkt.client.secret {
                warn!(session = session_num, "connect response with bad secret");
                self.stats.borrow_mut().sm_drops += 1;
                return;
            }
            if sess.state != SessionState::ConnectInProgress {
                debug!(session = session_num, "duplicate connect response");
                return;
            }
        }

        if pkt.err != SmErr::NoError {
            warn!(session = session_num, err = ?pkt.err, "connect refused by server");
            self.mgmt_retry_queue_remove(session_num);
            (self.sm_handler)(session_num, SmEvent::ConnectFailed, pkt.err);
            self.bury_session(session_num);
            return;
        }

        // Resolve the server's routing info. Fault-injectable.
        let route = if self.testing_fail_resolve_remote_rinfo_client.get() {
            Err(crate::error::Error::ResolveFailure)
        } else {
            self.transport
                .borrow_mut()
                .resolve_remote_routing_info(&pkt.server.routing_info)
        };
        let route = match route {
            Ok(route) => route,
            Err(_) => {
                warn!(session = session_num, "failed to resolve server routing info");
                self.mgmt_retry_queue_remove(session_num);
                (self.sm_handler)(session_num, SmEvent::ConnectFailed, SmErr::ResolveFailure);
                self.bury_session(session_num);
                return;
            }
        };

        {
            let mut sessions = self.sessions.borrow_mut();
            if let Some(Some(sess)) = sessions.get_mut(session_num as usize) {
                sess.server = pkt.server.clone();
                sess.remote_route = Some(route);
                sess.state = SessionState::Connected;
            }
        }
        self.mgmt_retry_queue_remove(session_num);
        info!(session = session_num, server = %pkt.server.name(), "session connected");
        (self.sm_handler)(session_num, SmEvent::Connected, SmErr::NoError);
    }

    fn handle_disconnect_resp(&self, pkt: &SmPkt) {
        debug_assert!(self.in_creator());
        let session_num = pkt.client.session_num;

        {
            let mut sessions = self.sessions.borrow_mut();
            let Some(Some(sess)) = sessions.get_mut(session_num as usize) else {
                self.stats.borrow_mut().sm_drops += 1;
                return;
            };
            if sess.client.secret != pkt.client.secret {
                warn!(session = session_num, "disconnect response with bad secret");
                self.stats.borrow_mut().sm_drops += 1;
                return;
            }
            if sess.state != SessionState::DisconnectInProgress {
                debug!(session = session_num, "duplicate disconnect response");
                return;
            }
            sess.state = SessionState::Disconnected;
        }

        self.mgmt_retry_queue_remove(session_num);
        info!(session = session_num, "session disconnected");
        (self.sm_handler)(session_num, SmEvent::Disconnected, SmErr::NoError);
        self.bury_session(session_num);
    }

    /// Reply to a management request with the given error kind.
    fn enqueue_sm_resp(&self, req: &SmPkt, err: SmErr) {
        self.registry().route_sm(SmPkt::resp_from(req, err));
    }

    /// Free a session's engine-owned resources and null its vector entry.
    /// Application-owned request buffers are never freed here.
    pub(crate) fn bury_session(&self, session_num: u16) {
        debug_assert!(self.in_creator());
        debug_assert!(!self.mgmt_retry_queue_contains(session_num));

        let session = self.sessions.borrow_mut()[session_num as usize].take();
        let Some(mut session) = session else { return };

        self.tx_work_queue.borrow_mut().retain(|&s| s != session_num);

        for slot in session.sslots.drain(..) {
            self.free_engine_buf(slot.pre_resp_msgbuf);
            if let Some(reassembly) = slot.rx {
                self.free_engine_buf(reassembly.msgbuf);
            }
            match slot.tx_msgbuf {
                TxBuf::DynamicResp(m) => self.free_engine_buf(m),
                // The application owns request buffers; it reclaims them
                // itself (the continuation never ran).
                TxBuf::Request(_) | TxBuf::PreResp | TxBuf::None => {}
            }
        }

        debug!(session = session_num, "session buried");
    }
}
