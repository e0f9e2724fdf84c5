use std::time::Duration;

pub const DEFAULT_PORT: u16 = 5309;
pub const RECV_BUFFER_SIZE: usize = 0xFFFF;
pub const TRANSACTION_EXPIRATION: Duration = Duration::from_secs(30);
pub const SEND_QUEUE_LIMIT: usize = 1024;

/// Poll budget suggested for callers driving [`Dht::pulse`](super::Dht::pulse)
/// from a dedicated task.
pub const DEFAULT_PULSE_TIMEOUT: Duration = Duration::from_millis(100);

/// Engine configuration.
///
/// ```
/// use dht_engine::dht::DhtConfig;
/// use std::time::Duration;
///
/// let config = DhtConfig::default()
///     .with_ipv6(false)
///     .with_transaction_expiration(Duration::from_secs(10));
/// assert!(config.bind_ipv4);
/// ```
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// Largest datagram the engine will receive; longer ones are truncated
    /// and then fail to parse.
    pub recv_buffer_size: usize,
    /// How long an outbound query waits for its reply.
    pub transaction_expiration: Duration,
    /// Datagrams allowed to wait for sending; further sends are refused.
    pub send_queue_limit: usize,
    pub default_port: u16,
    pub bind_ipv4: bool,
    pub bind_ipv6: bool,
    /// Bind an endpoint on demand when sending to a family with none.
    pub autoroute: bool,
    pub autoroute_port: u16,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            recv_buffer_size: RECV_BUFFER_SIZE,
            transaction_expiration: TRANSACTION_EXPIRATION,
            send_queue_limit: SEND_QUEUE_LIMIT,
            default_port: DEFAULT_PORT,
            bind_ipv4: true,
            bind_ipv6: true,
            autoroute: false,
            autoroute_port: DEFAULT_PORT,
        }
    }
}

impl DhtConfig {
    pub fn with_recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = size;
        self
    }

    pub fn with_transaction_expiration(mut self, expiration: Duration) -> Self {
        self.transaction_expiration = expiration;
        self
    }

    pub fn with_send_queue_limit(mut self, limit: usize) -> Self {
        self.send_queue_limit = limit;
        self
    }

    pub fn with_ipv4(mut self, enabled: bool) -> Self {
        self.bind_ipv4 = enabled;
        self
    }

    pub fn with_ipv6(mut self, enabled: bool) -> Self {
        self.bind_ipv6 = enabled;
        self
    }

    pub fn with_autoroute(mut self, enabled: bool, port: u16) -> Self {
        self.autoroute = enabled;
        self.autoroute_port = port;
        self
    }
}
