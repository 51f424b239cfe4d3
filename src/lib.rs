//! # fabrpc - RPC for lossless RDMA-capable fabrics
//!
//! This crate implements an asynchronous request/response engine over an
//! unreliable datagram transport, assuming a lossless fabric: credit-based
//! flow control instead of retransmission, zero-copy payload handling, and
//! a single-writer event loop per endpoint.
//!
//! ## Features
//!
//! - **Transport-generic datapath**: the engine monomorphises over a
//!   [`Transport`] implementation (constants + postlist/ring operations),
//!   with no vtable on the hot path
//! - **Window-bounded request pipelining**: up to `SESSION_REQ_WINDOW`
//!   concurrent requests per session, correlated by 44-bit request numbers
//! - **Two-level flow control**: per-session credits plus an endpoint-wide
//!   unexpected-packet window with explicit credit returns
//! - **Fragmentation/reassembly**: large messages span packets; arrival
//!   order within a message is not assumed
//! - **Retried session management**: a three-way handshake driven through
//!   per-process registry mailboxes, with timeout-based retry
//! - **Optional background workers**: long-running handlers and
//!   continuations run off the event-loop thread
//!
//! ## Usage
//!
//! ```ignore
//! use fabrpc::{Registry, ReqFuncType, Rpc, RpcConfig};
//!
//! let registry = Registry::new("host-a", 0);
//! registry.register_req_handler(1, ReqFuncType::Foreground, |req| {
//!     let _ = req.respond(b"pong");
//! })?;
//!
//! let rpc = Rpc::new(&registry, 0, 0, transport, |sess, event, err| {
//!     println!("session {sess}: {event:?} ({err:?})");
//! }, RpcConfig::default())?;
//!
//! let session = rpc.create_session("host-b", 7, 0)?;
//! let req = rpc.alloc_msg_buffer(64);
//! rpc.enqueue_request(session, 1, req, |req_buf, resp, tag| {
//!     println!("response: {} bytes (tag {tag})", resp.len());
//! }, 0)?;
//!
//! loop {
//!     rpc.run_event_loop_one();
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`packet`]: wire header format (`PktHdr`)
//! - [`buffer`]: message buffers with inline packet headers (`MsgBuffer`)
//! - [`alloc`]: slab allocator for DMA-registrable memory
//! - [`transport`]: the consumed transport interface (`Transport`)
//! - [`session`]: sessions and slots (`Session`, `SSlot`)
//! - [`sm`]: session-management packets and mailboxes
//! - [`registry`]: per-process registry and handler table
//! - [`rpc`]: the per-endpoint engine (`Rpc`)
//! - [`timing`]: TSC-based timekeeping

pub mod alloc;
mod bg;
pub mod buffer;
pub mod config;
pub mod error;
pub mod packet;
pub mod registry;
pub mod rpc;
pub mod session;
pub mod sm;
pub mod timing;
pub mod transport;

// Re-export main types
pub use buffer::{BufOrigin, MsgBuffer};
pub use config::RpcConfig;
pub use error::{DatapathError, Error, Result};
pub use packet::{pkts_for, PktHdr, PktType, MAX_MSG_SIZE, PKT_HDR_SIZE};
pub use registry::{ReqFuncType, Registry};
pub use rpc::{DpathStats, ReqHandle, Rpc};
pub use session::{SessionRole, SessionState, SESSION_REQ_WINDOW};
pub use sm::{SmErr, SmEvent};
pub use transport::{RouteHandle, RoutingInfo, Transport, MAX_ROUTING_INFO_LEN};
