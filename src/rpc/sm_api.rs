//! Session-management calls exposed to the application.
//!
//! These run on the creator thread only and are not performance-critical,
//! so argument checking is always on.

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::session::{
    Session, SessionEndpoint, SessionRole, SessionState, MAX_HOSTNAME_LEN, MAX_PHY_PORTS,
    SECRET_BITS, SESSION_REQ_WINDOW,
};
use crate::transport::{RoutingInfo, Transport};

use super::Rpc;

impl<T: Transport> Rpc<T> {
    /// Create a client session to `rem_hostname`'s endpoint `rem_rpc_id`
    /// and send the first connect request. On success the session is in
    /// `ConnectInProgress`; a `Connected` or `ConnectFailed` event follows.
    ///
    /// Creator thread only.
    pub fn create_session(
        &self,
        rem_hostname: &str,
        rem_rpc_id: u8,
        rem_phy_port: u8,
    ) -> Result<u16> {
        if !self.in_creator() {
            return Err(Error::NotCreator);
        }
        if rem_phy_port >= MAX_PHY_PORTS {
            return Err(Error::InvalidPhyPort(rem_phy_port));
        }
        if rem_hostname.is_empty() || rem_hostname.len() > MAX_HOSTNAME_LEN {
            return Err(Error::InvalidHostname);
        }
        if rem_hostname == self.registry().hostname() && rem_rpc_id == self.rpc_id() {
            return Err(Error::SelfConnection);
        }

        {
            let sessions = self.sessions.borrow();
            for sess in sessions.iter().flatten() {
                if sess.is_client()
                    && sess.server.hostname == rem_hostname
                    && sess.server.rpc_id == rem_rpc_id
                {
                    return Err(Error::DuplicateSession {
                        hostname: rem_hostname.to_string(),
                        rpc_id: rem_rpc_id,
                    });
                }
            }
            if sessions.len() >= self.config().max_sessions {
                return Err(Error::SessionLimit(self.config().max_sessions));
            }
        }

        // Preallocate the per-slot response buffers; roll back on failure.
        let mut pre_resp_msgbufs = Vec::with_capacity(SESSION_REQ_WINDOW);
        for _ in 0..SESSION_REQ_WINDOW {
            let buf = self.alloc_prealloc_resp_msgbuf();
            if !buf.is_valid() {
                for b in pre_resp_msgbufs {
                    self.free_engine_buf(b);
                }
                return Err(Error::OutOfMemory);
            }
            pre_resp_msgbufs.push(buf);
        }

        let local_session_num = self.sessions.borrow().len() as u16;
        let secret = rand::random::<u64>() & ((1u64 << SECRET_BITS) - 1);

        let client = SessionEndpoint {
            transport_kind: T::KIND,
            hostname: self.registry().hostname().to_string(),
            phy_port: self.phy_port,
            rpc_id: self.rpc_id(),
            session_num: local_session_num,
            secret,
            routing_info: self.local_routing_info,
        };
        let server = SessionEndpoint {
            transport_kind: T::KIND,
            hostname: rem_hostname.to_string(),
            phy_port: rem_phy_port,
            rpc_id: rem_rpc_id,
            // Filled by the connect response.
            session_num: 0,
            secret,
            routing_info: RoutingInfo::empty(),
        };

        let session = Session::new(
            SessionRole::Client,
            SessionState::ConnectInProgress,
            client,
            server,
            local_session_num,
            pre_resp_msgbufs,
            self.config().session_credits,
        );
        self.sessions.borrow_mut().push(Some(session));
        self.mgmt_retry_queue_add(local_session_num);

        info!(
            session = local_session_num,
            remote = %format!("{rem_hostname}:{rem_rpc_id}"),
            "sending first connect request"
        );
        self.send_connect_req_one(local_session_num);

        Ok(local_session_num)
    }

    /// Disconnect and destroy a client session. Returns true when the
    /// disconnect request went out and a `Disconnected`/`DisconnectFailed`
    /// event will follow; false when the session cannot be disconnected
    /// right now (connect or disconnect already in progress, already
    /// disconnected, or an invalid argument).
    ///
    /// Creator thread only.
    pub fn destroy_session(&self, session_num: u16) -> bool {
        if !self.in_creator() {
            warn!(session = session_num, "destroy_session: not creator thread");
            return false;
        }

        let state = {
            let sessions = self.sessions.borrow();
            let Some(Some(sess)) = sessions.get(session_num as usize) else {
                warn!(session = session_num, "destroy_session: invalid session");
                return false;
            };
            if !sess.is_client() {
                warn!(session = session_num, "destroy_session: not a client session");
                return false;
            }
            sess.state
        };

        match state {
            SessionState::ConnectInProgress => {
                debug!(session = session_num, "destroy_session: connect in progress");
                false
            }
            SessionState::DisconnectInProgress => {
                debug!(session = session_num, "destroy_session: disconnect in progress");
                false
            }
            SessionState::Disconnected => {
                debug!(session = session_num, "destroy_session: already disconnected");
                false
            }
            SessionState::Connected => {
                if let Some(Some(sess)) =
                    self.sessions.borrow_mut().get_mut(session_num as usize)
                {
                    sess.state = SessionState::DisconnectInProgress;
                }
                self.mgmt_retry_queue_add(session_num);
                info!(session = session_num, "sending first disconnect request");
                self.send_disconnect_req_one(session_num);
                true
            }
        }
    }

    /// Number of live (client or server) sessions at this endpoint.
    ///
    /// Creator thread only.
    pub fn num_active_sessions(&self) -> usize {
        debug_assert!(self.in_creator());
        self.sessions.borrow().iter().flatten().count()
    }
}
