//! Datapath TX: request/response enqueue and the TX work queue drain.

use tracing::{debug, warn};

use crate::buffer::MsgBuffer;
use crate::error::DatapathError;
use crate::packet::{PktHdr, PktType, MAX_MSG_SIZE, MAX_REQ_NUM};
use crate::session::TxBuf;
use crate::transport::Transport;

use super::{ReqHandle, RespChoice, Rpc, REQ_WINDOW_MASK};

impl<T: Transport> Rpc<T> {
    /// Enqueue a request on a client session.
    ///
    /// On success the engine owns `msgbuf` until the continuation runs; the
    /// continuation receives it back together with the response payload and
    /// `tag`. On failure the buffer is returned alongside the error code.
    /// No transport I/O happens here; the TX engine drains the work queue
    /// from the event loop.
    pub fn enqueue_request<F>(
        &self,
        session_num: u16,
        req_type: u8,
        msgbuf: MsgBuffer,
        cont: F,
        tag: u64,
    ) -> Result<(), (DatapathError, MsgBuffer)>
    where
        F: FnOnce(MsgBuffer, &[u8], u64) + Send + 'static,
    {
        let mut sessions = self.sessions.borrow_mut();
        let sess = match sessions.get_mut(session_num as usize).and_then(|s| s.as_mut()) {
            Some(sess) if sess.is_client() && sess.is_connected() => sess,
            _ => return Err((DatapathError::InvalidSessionArg, msgbuf)),
        };
        if !msgbuf.is_valid() || !msgbuf.check_magic() {
            return Err((DatapathError::InvalidMsgBufferArg, msgbuf));
        }
        if msgbuf.data_size() > MAX_MSG_SIZE {
            return Err((DatapathError::InvalidMsgSizeArg, msgbuf));
        }
        if self.handlers[req_type as usize].is_none() {
            return Err((DatapathError::InvalidReqTypeArg, msgbuf));
        }

        let Some(sslot_idx) = sess.alloc_sslot() else {
            return Err((DatapathError::NoSessionMsgSlots, msgbuf));
        };

        // Request number: slot index in the low bits, reuse generation above.
        let req_num = {
            let mut arr = self.req_num_arr.borrow_mut();
            let gen = arr[sslot_idx];
            arr[sslot_idx] += 1;
            ((gen << REQ_WINDOW_MASK.count_ones()) | sslot_idx as u64) & MAX_REQ_NUM
        };

        let mut msgbuf = msgbuf;
        let num_pkts = msgbuf.num_pkts();
        let peer = sess.peer_session_num();
        for i in 0..num_pkts {
            let hdr = PktHdr::new(
                req_type,
                msgbuf.data_size(),
                peer,
                PktType::Req,
                i as u16,
                req_num,
            );
            msgbuf.set_pkt_hdr(i, &hdr);
        }

        let slot = &mut sess.sslots[sslot_idx];
        slot.cur_req_num = req_num;
        slot.req_type = req_type;
        slot.cont = Some(Box::new(cont));
        slot.tag = tag;
        slot.tx_msgbuf = TxBuf::Request(msgbuf);
        slot.tx_pkts_sent = 0;
        slot.tx_num_pkts = num_pkts;
        slot.rx = None;

        if !sess.in_tx_queue {
            sess.in_tx_queue = true;
            self.tx_work_queue.borrow_mut().push(session_num);
        }
        Ok(())
    }

    /// Attach the response a handler chose and schedule the session for TX.
    /// Background handlers funnel through here via the completion mailbox.
    pub(crate) fn enqueue_response_internal(
        &self,
        session_num: u16,
        sslot_idx: usize,
        req_num: u64,
        pre_resp: MsgBuffer,
        choice: Option<RespChoice>,
    ) {
        let mut sessions = self.sessions.borrow_mut();
        let sess = match sessions.get_mut(session_num as usize).and_then(|s| s.as_mut()) {
            Some(sess) => sess,
            None => {
                // Session buried while the handler ran.
                drop(sessions);
                self.free_engine_buf(pre_resp);
                if let Some(RespChoice::Dynamic(m)) = choice {
                    self.free_engine_buf(m);
                }
                return;
            }
        };

        let slot = &mut sess.sslots[sslot_idx];
        if slot.cur_req_num != req_num {
            warn!(session = session_num, slot = sslot_idx, "response for a stale request");
            drop(sessions);
            self.free_engine_buf(pre_resp);
            if let Some(RespChoice::Dynamic(m)) = choice {
                self.free_engine_buf(m);
            }
            return;
        }

        slot.pre_resp_msgbuf = pre_resp;
        let Some(choice) = choice else {
            warn!(session = session_num, slot = sslot_idx, "handler produced no response");
            return;
        };

        let peer = sess.peer_session_num();
        let req_type = sess.sslots[sslot_idx].req_type;
        let slot = &mut sess.sslots[sslot_idx];
        match choice {
            RespChoice::Prealloc => {
                let size = slot.pre_resp_msgbuf.data_size();
                let hdr = PktHdr::new(req_type, size, peer, PktType::Resp, 0, req_num);
                slot.pre_resp_msgbuf.set_pkt_hdr(0, &hdr);
                slot.tx_msgbuf = TxBuf::PreResp;
                slot.tx_num_pkts = 1;
            }
            RespChoice::Dynamic(mut m) => {
                let num_pkts = m.num_pkts();
                for i in 0..num_pkts {
                    let hdr = PktHdr::new(
                        req_type,
                        m.data_size(),
                        peer,
                        PktType::Resp,
                        i as u16,
                        req_num,
                    );
                    m.set_pkt_hdr(i, &hdr);
                }
                slot.tx_msgbuf = TxBuf::DynamicResp(m);
                slot.tx_num_pkts = num_pkts;
            }
        }
        slot.tx_pkts_sent = 0;

        if !sess.in_tx_queue {
            sess.in_tx_queue = true;
            self.tx_work_queue.borrow_mut().push(session_num);
        }
    }

    /// Drain the TX work queue into the transport postlist, respecting
    /// session credits. Sessions with nothing left to send leave the
    /// queue; a full postlist leaves the remainder for the next iteration.
    pub(crate) fn process_datapath_tx_work_queue(&self) {
        debug_assert!(self.in_creator());
        if self.tx_work_queue.borrow().is_empty() {
            return;
        }

        let mut sessions = self.sessions.borrow_mut();
        let mut transport = self.transport.borrow_mut();
        let mut queue = self.tx_work_queue.borrow_mut();

        let mut posted_any = false;
        let mut postlist_full = false;
        let mut i = 0;

        while i < queue.len() {
            let session_num = queue[i];
            let Some(sess) = sessions
                .get_mut(session_num as usize)
                .and_then(|s| s.as_mut())
            else {
                queue.remove(i);
                continue;
            };

            let route = sess.remote_route.unwrap_or(0);
            let mut session_done = true;

            for sslot_idx in 0..sess.sslots.len() {
                if !sess.sslots[sslot_idx].has_pending_tx() {
                    continue;
                }

                let num_pkts = sess.sslots[sslot_idx].tx_num_pkts;
                let mut sent = sess.sslots[sslot_idx].tx_pkts_sent;

                // The first packet of a message needs one session credit;
                // the rest are paced only by the postlist.
                if sent == 0 && sess.credits == 0 {
                    debug!(session = session_num, slot = sslot_idx, "no session credits");
                    session_done = false;
                    continue;
                }

                while sent < num_pkts {
                    let posted = {
                        let slot = &sess.sslots[sslot_idx];
                        let msgbuf = match &slot.tx_msgbuf {
                            TxBuf::Request(m) | TxBuf::DynamicResp(m) => m,
                            TxBuf::PreResp => &slot.pre_resp_msgbuf,
                            TxBuf::None => unreachable!(),
                        };
                        let hdr = msgbuf
                            .pkt_hdr(sent)
                            .expect("TX msgbuf header stamped at enqueue");
                        let payload = msgbuf.pkt_payload(sent, T::MAX_DATA_PER_PKT);
                        if self.fault_drop_tx_local.get() {
                            true
                        } else {
                            transport.post_send(route, &hdr, payload)
                        }
                    };

                    if !posted {
                        postlist_full = true;
                    } else {
                        posted_any = true;
                        if sent == 0 {
                            sess.credits -= 1;
                            // A response's first packet carries the implicit
                            // unexpected-window return, unless an explicit
                            // credit return already did.
                            let slot = &mut sess.sslots[sslot_idx];
                            if slot.tx_msgbuf.is_resp() && !slot.cr_sent {
                                let returned = slot.unexp_taken;
                                slot.unexp_taken = 0;
                                let cur = self.unexp_credits.get();
                                self.unexp_credits
                                    .set((cur + returned).min(self.config().unexp_pkt_window));
                            }
                        }
                        sent += 1;
                        sess.sslots[sslot_idx].tx_pkts_sent = sent;
                    }

                    if postlist_full {
                        break;
                    }
                }

                if sent == num_pkts {
                    let slot = &mut sess.sslots[sslot_idx];
                    match std::mem::replace(&mut slot.tx_msgbuf, TxBuf::None) {
                        // Fully transmitted request: park the buffer for the
                        // continuation. The application owns it.
                        TxBuf::Request(m) => slot.req_backup = Some(m),
                        // Dynamic responses are engine-owned; free now.
                        TxBuf::DynamicResp(m) => self.free_engine_buf(m),
                        TxBuf::PreResp | TxBuf::None => {}
                    }
                    let slot = &mut sess.sslots[sslot_idx];
                    slot.tx_pkts_sent = 0;
                    slot.tx_num_pkts = 0;
                } else {
                    session_done = false;
                }

                if postlist_full {
                    break;
                }
            }

            if postlist_full {
                break;
            }

            if session_done {
                sess.in_tx_queue = false;
                queue.remove(i);
            } else {
                i += 1;
            }
        }

        if posted_any {
            transport.flush_sends();
        }
    }

    /// Send an explicit credit return immediately. Used when an unexpected
    /// packet's reply cannot be shipped in time.
    pub(crate) fn send_credit_return_now(
        &self,
        route: u32,
        peer_session_num: u16,
        req_type: u8,
        req_num: u64,
    ) {
        let hdr = PktHdr::new(
            req_type,
            0,
            peer_session_num,
            PktType::ExplicitCreditReturn,
            0,
            req_num,
        );
        let mut transport = self.transport.borrow_mut();
        if !transport.post_send(route, &hdr, &[]) {
            transport.flush_sends();
            if !transport.post_send(route, &hdr, &[]) {
                warn!("failed to post explicit credit return");
                return;
            }
        }
        transport.flush_sends();
    }

    /// Construct the handle a request handler fills in.
    pub(crate) fn make_req_handle<'a>(
        &self,
        req_type: u8,
        data: super::ReqData<'a>,
        pre_resp: MsgBuffer,
    ) -> ReqHandle<'a> {
        ReqHandle::new(
            req_type,
            data,
            pre_resp,
            T::MAX_DATA_PER_PKT,
            self.huge_alloc.clone(),
        )
    }
}
