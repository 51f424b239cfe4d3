//! Datapath RX: burst receive, packet classification, reassembly, and
//! callback dispatch.
//!
//! Receive-ring entries are reposted to the transport only after every
//! foreground callback of the burst has returned, so zero-copy borrows
//! into the ring stay valid for the callback's duration.

use std::sync::Arc;

use tracing::warn;

use crate::bg::{BgData, BgWork};
use crate::buffer::MsgBuffer;
use crate::packet::{pkts_for, PktHdr, PktType, PKT_HDR_SIZE};
use crate::registry::{ReqFunc, ReqFuncType};
use crate::session::{Reassembly, SessionRole, SessionState, TxBuf};
use crate::transport::Transport;

use super::{ReqData, Rpc, REQ_WINDOW_MASK};

/// Where a dispatched request's payload lives.
enum ReqBody {
    /// Single-packet message aliasing a receive-ring slot.
    Ring(usize, usize),
    /// Reassembled multi-packet message, engine-owned.
    Buf(MsgBuffer),
}

impl<T: Transport> Rpc<T> {
    /// Poll the transport and process one burst of received packets.
    pub(crate) fn process_completions(&self) {
        debug_assert!(self.in_creator());

        let n = self
            .transport
            .borrow_mut()
            .rx_burst(self.config().rx_burst_size);
        if n == 0 {
            return;
        }

        let head = self.rx_ring_head.get();
        for k in 0..n {
            let ring_slot = (head + k) % T::RECV_QUEUE_DEPTH;
            let hdr = {
                let t = self.transport.borrow();
                PktHdr::from_bytes(t.rx_slot(ring_slot))
            };
            let Some(hdr) = hdr else {
                self.stats.borrow_mut().pkts_dropped += 1;
                continue;
            };

            let num_pkts = pkts_for(hdr.msg_size(), T::MAX_DATA_PER_PKT);
            if hdr.pkt_num() as usize >= num_pkts {
                self.stats.borrow_mut().pkts_dropped += 1;
                continue;
            }

            // The packet must carry the payload bytes its header declares.
            let offset = hdr.pkt_num() as usize * T::MAX_DATA_PER_PKT;
            let payload_len = hdr.msg_size().saturating_sub(offset).min(T::MAX_DATA_PER_PKT);
            let short = {
                let t = self.transport.borrow();
                t.rx_slot(ring_slot).len() < PKT_HDR_SIZE + payload_len
            };
            if short && hdr.pkt_type() != PktType::ExplicitCreditReturn {
                self.stats.borrow_mut().pkts_dropped += 1;
                continue;
            }

            match hdr.pkt_type() {
                PktType::ExplicitCreditReturn => self.process_credit_return(&hdr),
                PktType::Req if num_pkts == 1 => self.process_small_req(ring_slot, &hdr),
                PktType::Resp if num_pkts == 1 => self.process_small_resp(ring_slot, &hdr),
                PktType::Req => self.process_large_req(ring_slot, &hdr, num_pkts),
                PktType::Resp => self.process_large_resp(ring_slot, &hdr, num_pkts),
            }
        }

        // Every callback for this burst has returned; the NIC may reuse
        // the ring entries.
        self.rx_ring_head.set(head.wrapping_add(n));
        self.transport.borrow_mut().post_recvs(n);
    }

    fn process_credit_return(&self, hdr: &PktHdr) {
        let mut sessions = self.sessions.borrow_mut();
        match sessions
            .get_mut(hdr.dest_session_num() as usize)
            .and_then(|s| s.as_mut())
        {
            Some(sess) => sess.return_credit(),
            None => self.stats.borrow_mut().pkts_dropped += 1,
        }
    }

    /// Single-packet request at the server.
    fn process_small_req(&self, ring_slot: usize, hdr: &PktHdr) {
        let Some(func) = self.handlers[hdr.req_type() as usize].clone() else {
            warn!(req_type = hdr.req_type(), "request for unregistered type");
            self.stats.borrow_mut().pkts_dropped += 1;
            return;
        };

        let dest = hdr.dest_session_num();
        let req_num = hdr.req_num();
        let sslot_idx = (req_num & REQ_WINDOW_MASK) as usize;

        let (pre_resp, route, peer) = {
            let mut sessions = self.sessions.borrow_mut();
            let Some(sess) = sessions.get_mut(dest as usize).and_then(|s| s.as_mut()) else {
                self.stats.borrow_mut().pkts_dropped += 1;
                return;
            };
            if sess.role != SessionRole::Server || sess.state != SessionState::Connected {
                self.stats.borrow_mut().pkts_dropped += 1;
                return;
            }
            if req_num <= sess.sslots[sslot_idx].cur_req_num {
                self.stats.borrow_mut().stale_drops += 1;
                return;
            }

            // This is unexpected traffic; it consumes an unexpected-packet
            // credit. Exhaustion here means the window is misconfigured
            // for the fabric: drop and log.
            let unexp = self.unexp_credits.get();
            if unexp == 0 {
                warn!(session = dest, "unexpected-packet window exhausted, dropping request");
                self.stats.borrow_mut().unexp_credits_exhausted += 1;
                return;
            }
            self.unexp_credits.set(unexp - 1);

            // The peer starting a new message implicitly returns the
            // session credit from our previous response on this slot.
            sess.return_credit();

            let slot = &mut sess.sslots[sslot_idx];
            slot.cur_req_num = req_num;
            slot.req_type = hdr.req_type();
            slot.unexp_taken = 1;
            slot.cr_sent = false;
            if let Some(stale) = slot.rx.take() {
                let buf = stale.msgbuf;
                self.free_engine_buf(buf);
            }

            let pre_resp =
                std::mem::replace(&mut slot.pre_resp_msgbuf, MsgBuffer::invalid());
            (pre_resp, sess.remote_route.unwrap_or(0), sess.peer_session_num())
        };

        let body = ReqBody::Ring(ring_slot, hdr.msg_size());
        self.dispatch_request(
            dest,
            sslot_idx,
            req_num,
            hdr.req_type(),
            func,
            body,
            pre_resp,
            route,
            peer,
        );
    }

    /// Single-packet response at the client.
    fn process_small_resp(&self, ring_slot: usize, hdr: &PktHdr) {
        let dest = hdr.dest_session_num();
        let req_num = hdr.req_num();
        let sslot_idx = (req_num & REQ_WINDOW_MASK) as usize;

        let (cont, tag, req_msgbuf, req_type) = {
            let mut sessions = self.sessions.borrow_mut();
            let Some(sess) = sessions.get_mut(dest as usize).and_then(|s| s.as_mut()) else {
                self.stats.borrow_mut().pkts_dropped += 1;
                return;
            };
            let current = {
                let slot = &sess.sslots[sslot_idx];
                slot.cur_req_num == req_num && slot.cont.is_some()
            };
            if !current {
                self.stats.borrow_mut().stale_drops += 1;
                return;
            }

            // The response's first (only) packet is the implicit credit
            // return for the request we sent.
            sess.return_credit();

            let slot = &mut sess.sslots[sslot_idx];
            if let TxBuf::Request(m) = std::mem::replace(&mut slot.tx_msgbuf, TxBuf::None) {
                slot.req_backup = Some(m);
                slot.tx_pkts_sent = 0;
                slot.tx_num_pkts = 0;
            }
            let cont = slot.cont.take().expect("checked above");
            let tag = slot.tag;
            let req_type = slot.req_type;
            let req_msgbuf = slot.req_backup.take().unwrap_or_else(MsgBuffer::invalid);
            sess.free_sslot(sslot_idx);
            (cont, tag, req_msgbuf, req_type)
        };

        if self.continuation_runs_in_bg(req_type) {
            let data = {
                let t = self.transport.borrow();
                t.rx_slot(ring_slot)[PKT_HDR_SIZE..PKT_HDR_SIZE + hdr.msg_size()].to_vec()
            };
            self.submit_bg(BgWork::Continuation {
                cont,
                req_msgbuf,
                resp: BgData::Copied(data),
                tag,
            });
        } else {
            let t = self.transport.borrow();
            let payload = &t.rx_slot(ring_slot)[PKT_HDR_SIZE..PKT_HDR_SIZE + hdr.msg_size()];
            cont(req_msgbuf, payload, tag);
        }
    }

    /// Multi-packet request packet at the server.
    fn process_large_req(&self, ring_slot: usize, hdr: &PktHdr, num_pkts: usize) {
        let Some(func) = self.handlers[hdr.req_type() as usize].clone() else {
            warn!(req_type = hdr.req_type(), "request for unregistered type");
            self.stats.borrow_mut().pkts_dropped += 1;
            return;
        };

        let dest = hdr.dest_session_num();
        let req_num = hdr.req_num();
        let sslot_idx = (req_num & REQ_WINDOW_MASK) as usize;

        let completed = {
            let mut sessions = self.sessions.borrow_mut();
            let Some(sess) = sessions.get_mut(dest as usize).and_then(|s| s.as_mut()) else {
                self.stats.borrow_mut().pkts_dropped += 1;
                return;
            };
            if sess.role != SessionRole::Server || sess.state != SessionState::Connected {
                self.stats.borrow_mut().pkts_dropped += 1;
                return;
            }

            let cur = sess.sslots[sslot_idx].cur_req_num;
            if req_num < cur || (req_num == cur && sess.sslots[sslot_idx].rx.is_none()) {
                self.stats.borrow_mut().stale_drops += 1;
                return;
            }

            if req_num > cur {
                // First packet seen of a new request. The message as a
                // whole is one unit of unexpected traffic; its remaining
                // fragments arrive expected. It also carries the implicit
                // session-credit return, and opens reassembly.
                let unexp = self.unexp_credits.get();
                if unexp == 0 {
                    warn!(session = dest, "unexpected-packet window exhausted, dropping request");
                    self.stats.borrow_mut().unexp_credits_exhausted += 1;
                    return;
                }
                let msgbuf = self.alloc_msg_buffer(hdr.msg_size());
                if !msgbuf.is_valid() {
                    warn!(session = dest, "no memory for request reassembly, dropping");
                    self.stats.borrow_mut().pkts_dropped += 1;
                    return;
                }
                self.unexp_credits.set(unexp - 1);
                sess.return_credit();
                let slot = &mut sess.sslots[sslot_idx];
                slot.cur_req_num = req_num;
                slot.req_type = hdr.req_type();
                slot.unexp_taken = 1;
                slot.cr_sent = false;
                if let Some(abandoned) = slot.rx.take() {
                    self.free_engine_buf(abandoned.msgbuf);
                }
                slot.rx = Some(Reassembly::new(msgbuf, num_pkts));
            }

            let slot = &mut sess.sslots[sslot_idx];
            let reassembly = slot.rx.as_mut().expect("opened above");
            if !reassembly.record(hdr.pkt_num()) {
                self.stats.borrow_mut().stale_drops += 1;
                return;
            }
            self.copy_ring_payload(ring_slot, hdr, reassembly);

            if reassembly.is_complete() {
                let reassembly = slot.rx.take().expect("present");
                let pre_resp =
                    std::mem::replace(&mut slot.pre_resp_msgbuf, MsgBuffer::invalid());
                Some((
                    reassembly.msgbuf,
                    pre_resp,
                    sess.remote_route.unwrap_or(0),
                    sess.peer_session_num(),
                ))
            } else {
                None
            }
        };

        if let Some((req_buf, pre_resp, route, peer)) = completed {
            self.dispatch_request(
                dest,
                sslot_idx,
                req_num,
                hdr.req_type(),
                func,
                ReqBody::Buf(req_buf),
                pre_resp,
                route,
                peer,
            );
        }
    }

    /// Multi-packet response packet at the client.
    fn process_large_resp(&self, ring_slot: usize, hdr: &PktHdr, num_pkts: usize) {
        let dest = hdr.dest_session_num();
        let req_num = hdr.req_num();
        let sslot_idx = (req_num & REQ_WINDOW_MASK) as usize;

        let completed = {
            let mut sessions = self.sessions.borrow_mut();
            let Some(sess) = sessions.get_mut(dest as usize).and_then(|s| s.as_mut()) else {
                self.stats.borrow_mut().pkts_dropped += 1;
                return;
            };
            let current = {
                let slot = &sess.sslots[sslot_idx];
                slot.cur_req_num == req_num && slot.cont.is_some()
            };
            if !current {
                self.stats.borrow_mut().stale_drops += 1;
                return;
            }

            if sess.sslots[sslot_idx].rx.is_none() {
                // First packet seen of the response: implicit credit return.
                sess.return_credit();
                let msgbuf = self.alloc_msg_buffer(hdr.msg_size());
                if !msgbuf.is_valid() {
                    warn!(session = dest, "no memory for response reassembly, dropping");
                    self.stats.borrow_mut().pkts_dropped += 1;
                    return;
                }
                sess.sslots[sslot_idx].rx = Some(Reassembly::new(msgbuf, num_pkts));
            }

            let slot = &mut sess.sslots[sslot_idx];
            let reassembly = slot.rx.as_mut().expect("opened above");
            if !reassembly.record(hdr.pkt_num()) {
                self.stats.borrow_mut().stale_drops += 1;
                return;
            }
            self.copy_ring_payload(ring_slot, hdr, reassembly);

            if reassembly.is_complete() {
                let reassembly = slot.rx.take().expect("present");
                if let TxBuf::Request(m) = std::mem::replace(&mut slot.tx_msgbuf, TxBuf::None) {
                    slot.req_backup = Some(m);
                    slot.tx_pkts_sent = 0;
                    slot.tx_num_pkts = 0;
                }
                let cont = slot.cont.take().expect("checked above");
                let tag = slot.tag;
                let req_type = slot.req_type;
                let req_msgbuf = slot.req_backup.take().unwrap_or_else(MsgBuffer::invalid);
                sess.free_sslot(sslot_idx);
                Some((cont, reassembly.msgbuf, req_msgbuf, tag, req_type))
            } else {
                None
            }
        };

        if let Some((cont, resp_buf, req_msgbuf, tag, req_type)) = completed {
            if self.continuation_runs_in_bg(req_type) {
                self.submit_bg(BgWork::Continuation {
                    cont,
                    req_msgbuf,
                    resp: BgData::Owned(resp_buf),
                    tag,
                });
            } else {
                cont(req_msgbuf, resp_buf.data(), tag);
                self.free_engine_buf(resp_buf);
            }
        }
    }

    /// Copy one ring packet's payload into its reassembly offset.
    fn copy_ring_payload(&self, ring_slot: usize, hdr: &PktHdr, reassembly: &mut Reassembly) {
        let offset = hdr.pkt_num() as usize * T::MAX_DATA_PER_PKT;
        let len = T::MAX_DATA_PER_PKT.min(hdr.msg_size() - offset);
        if len == 0 {
            return;
        }
        let t = self.transport.borrow();
        let payload = &t.rx_slot(ring_slot)[PKT_HDR_SIZE..PKT_HDR_SIZE + len];
        reassembly.msgbuf.data_mut()[offset..offset + len].copy_from_slice(payload);
    }

    /// Run a completed request's handler, inline or on a worker.
    #[allow(clippy::too_many_arguments)]
    fn dispatch_request(
        &self,
        session_num: u16,
        sslot_idx: usize,
        req_num: u64,
        req_type: u8,
        func: Arc<ReqFunc>,
        body: ReqBody,
        pre_resp: MsgBuffer,
        route: u32,
        peer: u16,
    ) {
        if func.kind == ReqFuncType::Background && self.multi_threaded {
            let data = match body {
                ReqBody::Ring(ring_slot, msg_size) => {
                    let t = self.transport.borrow();
                    BgData::Copied(
                        t.rx_slot(ring_slot)[PKT_HDR_SIZE..PKT_HDR_SIZE + msg_size].to_vec(),
                    )
                }
                ReqBody::Buf(m) => BgData::Owned(m),
            };

            // The reply cannot be piggybacked in time; if the unexpected
            // window just ran dry, return this request's credits now.
            if self.unexp_credits.get() == 0 {
                self.send_credit_return_now(route, peer, req_type, req_num);
                let mut sessions = self.sessions.borrow_mut();
                if let Some(sess) = sessions
                    .get_mut(session_num as usize)
                    .and_then(|s| s.as_mut())
                {
                    let slot = &mut sess.sslots[sslot_idx];
                    slot.cr_sent = true;
                    let returned = std::mem::take(&mut slot.unexp_taken);
                    let cur = self.unexp_credits.get();
                    self.unexp_credits
                        .set((cur + returned).min(self.config().unexp_pkt_window));
                }
            }

            self.submit_bg(BgWork::Request {
                session_num,
                sslot_idx,
                req_num,
                req_type,
                data,
                pre_resp,
                func,
                max_data_per_pkt: T::MAX_DATA_PER_PKT,
            });
            return;
        }

        // Foreground (or background-flagged with no workers configured).
        let (pre_resp, choice, leftover) = match body {
            ReqBody::Ring(ring_slot, msg_size) => {
                let t = self.transport.borrow();
                let payload = &t.rx_slot(ring_slot)[PKT_HDR_SIZE..PKT_HDR_SIZE + msg_size];
                let mut handle =
                    self.make_req_handle(req_type, ReqData::Borrowed(payload), pre_resp);
                (func.func)(&mut handle);
                handle.into_parts()
            }
            ReqBody::Buf(m) => {
                let mut handle = self.make_req_handle(req_type, ReqData::OwnedBuf(m), pre_resp);
                (func.func)(&mut handle);
                handle.into_parts()
            }
        };
        if let Some(m) = leftover {
            self.free_engine_buf(m);
        }
        self.enqueue_response_internal(session_num, sslot_idx, req_num, pre_resp, choice);
    }

    /// Whether the continuation for `req_type` is background-flagged.
    fn continuation_runs_in_bg(&self, req_type: u8) -> bool {
        self.multi_threaded
            && self.handlers[req_type as usize]
                .as_ref()
                .map(|f| f.kind == ReqFuncType::Background)
                .unwrap_or(false)
    }
}
