//! Configuration for an Rpc endpoint.

/// Endpoint configuration.
///
/// Controls flow control, session management retry behavior, and the
/// hugepage allocator reservation.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Session credits for flow control (power of two).
    /// Default: 8
    pub session_credits: usize,
    /// Endpoint-wide budget for in-flight unexpected packets.
    /// Default: 20
    pub unexp_pkt_window: usize,
    /// Management request retry interval in milliseconds.
    /// Default: 50
    pub mgmt_retry_ms: u64,
    /// Management request retry cap before the failure callback.
    /// Default: 20
    pub mgmt_max_retries: usize,
    /// Maximum number of sessions per endpoint.
    /// Default: 1024
    pub max_sessions: usize,
    /// Bytes reserved for the hugepage allocator.
    /// Default: 32 MiB
    pub alloc_capacity: usize,
    /// Maximum packets drained per receive burst.
    /// Default: 16
    pub rx_burst_size: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            session_credits: 8,
            unexp_pkt_window: 20,
            mgmt_retry_ms: 50,
            mgmt_max_retries: 20,
            max_sessions: 1024,
            alloc_capacity: 32 * 1024 * 1024,
            rx_burst_size: 16,
        }
    }
}

impl RpcConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the session credits.
    pub fn with_session_credits(mut self, session_credits: usize) -> Self {
        debug_assert!(session_credits.is_power_of_two());
        self.session_credits = session_credits;
        self
    }

    /// Set the unexpected-packet window.
    pub fn with_unexp_pkt_window(mut self, unexp_pkt_window: usize) -> Self {
        self.unexp_pkt_window = unexp_pkt_window;
        self
    }

    /// Set the management retry interval in milliseconds.
    pub fn with_mgmt_retry_ms(mut self, mgmt_retry_ms: u64) -> Self {
        self.mgmt_retry_ms = mgmt_retry_ms;
        self
    }

    /// Set the management retry cap.
    pub fn with_mgmt_max_retries(mut self, mgmt_max_retries: usize) -> Self {
        self.mgmt_max_retries = mgmt_max_retries;
        self
    }

    /// Set the maximum number of sessions.
    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }

    /// Set the allocator reservation in bytes.
    pub fn with_alloc_capacity(mut self, alloc_capacity: usize) -> Self {
        self.alloc_capacity = alloc_capacity;
        self
    }

    /// Set the receive burst size.
    pub fn with_rx_burst_size(mut self, rx_burst_size: usize) -> Self {
        self.rx_burst_size = rx_burst_size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = RpcConfig::default()
            .with_session_credits(16)
            .with_unexp_pkt_window(40)
            .with_mgmt_retry_ms(10)
            .with_mgmt_max_retries(3)
            .with_max_sessions(4);

        assert_eq!(config.session_credits, 16);
        assert_eq!(config.unexp_pkt_window, 40);
        assert_eq!(config.mgmt_retry_ms, 10);
        assert_eq!(config.mgmt_max_retries, 3);
        assert_eq!(config.max_sessions, 4);
    }
}
