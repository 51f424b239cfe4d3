//! Error types for fabrpc.

use thiserror::Error;

/// Errors from construction and session-management entry points.
///
/// The datapath never returns these; it uses [`DatapathError`] codes.
#[derive(Debug, Error)]
pub enum Error {
    /// An endpoint with this id is already registered at the registry.
    #[error("endpoint id {0} already registered")]
    DuplicateRpcId(u8),
    /// A request handler for this type is already registered.
    #[error("handler for request type {0} already registered")]
    DuplicateReqType(u8),
    /// Remote fabric port out of range.
    #[error("invalid remote fabric port {0}")]
    InvalidPhyPort(u8),
    /// Remote hostname empty or too long.
    #[error("invalid remote hostname")]
    InvalidHostname,
    /// Connecting a session to the local endpoint is not allowed.
    #[error("session to local endpoint not allowed")]
    SelfConnection,
    /// A client session to this remote endpoint already exists.
    #[error("session to {hostname}:{rpc_id} already exists")]
    DuplicateSession { hostname: String, rpc_id: u8 },
    /// Per-endpoint session limit reached.
    #[error("session limit ({0}) reached")]
    SessionLimit(usize),
    /// The slab allocator ran out of memory.
    #[error("out of hugepage memory")]
    OutOfMemory,
    /// Routing info resolution failed at the transport.
    #[error("routing info resolution failed")]
    ResolveFailure,
    /// The caller is not the endpoint's creator thread.
    #[error("not called from the creator thread")]
    NotCreator,
    /// No session with this local session number.
    #[error("invalid session number {0}")]
    InvalidSession(u16),
    /// IO error from the underlying transport.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for fabrpc operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Numeric error codes returned by the Rpc datapath. Zero means success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DatapathError {
    /// Session is missing, not client-role, or not connected.
    #[error("invalid session argument")]
    InvalidSessionArg,
    /// The MsgBuffer is invalid (null or bad magic).
    #[error("invalid MsgBuffer argument")]
    InvalidMsgBufferArg,
    /// Message size exceeds the maximum.
    #[error("invalid message size argument")]
    InvalidMsgSizeArg,
    /// No handler registered for this request type.
    #[error("invalid request type argument")]
    InvalidReqTypeArg,
    /// The registered request function is unusable.
    #[error("invalid request function argument")]
    InvalidReqFuncArg,
    /// All session slots are occupied by in-flight requests.
    #[error("no session message slots")]
    NoSessionMsgSlots,
}

impl DatapathError {
    /// Stable numeric code. Zero is reserved for success.
    pub fn code(self) -> i32 {
        match self {
            DatapathError::InvalidSessionArg => 1,
            DatapathError::InvalidMsgBufferArg => 2,
            DatapathError::InvalidMsgSizeArg => 3,
            DatapathError::InvalidReqTypeArg => 4,
            DatapathError::InvalidReqFuncArg => 5,
            DatapathError::NoSessionMsgSlots => 6,
        }
    }
}
