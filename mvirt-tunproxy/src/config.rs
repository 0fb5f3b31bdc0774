//! Runtime configuration for the proxy data plane.

use std::time::Duration;

use thiserror::Error;

use crate::buffer::MIN_BUFFER_SIZE;
use crate::packet::{IPV4_HEADER_LEN, TCP_HEADER_LEN};

/// Default pause between idle ticks of the processor loop.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(1);

/// Default initial sequence number for proxy-originated segments.
pub const DEFAULT_INITIAL_SEQ: u32 = 1000;

/// Default outbound read size: one segment fits one minimum-size pool buffer.
pub const DEFAULT_READ_CHUNK: usize = MIN_BUFFER_SIZE - IPV4_HEADER_LEN - TCP_HEADER_LEN;

/// Largest TCP payload that still fits a single IPv4 datagram.
pub const MAX_READ_CHUNK: usize = 65535 - IPV4_HEADER_LEN - TCP_HEADER_LEN;

/// Default limit on device bytes buffered per TCP session.
pub const DEFAULT_MAX_BACKLOG: usize = 256 * 1024;

/// Default capacity of the reader -> processor queue.
pub const DEFAULT_INPUT_QUEUE_CAPACITY: usize = 1024;

/// Default number of idle buffers the pool keeps around.
pub const DEFAULT_POOL_RETAIN: usize = 256;

/// Default number of datagrams drained per UDP flow per tick.
pub const DEFAULT_UDP_BATCH_LIMIT: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("read_chunk must be between 1 and {max}, got {0}", max = MAX_READ_CHUNK)]
    ReadChunk(usize),

    #[error("max_backlog must be non-zero")]
    MaxBacklog,

    #[error("input_queue_capacity must be non-zero")]
    InputQueueCapacity,

    #[error("pool_retain must be non-zero")]
    PoolRetain,

    #[error("udp_batch_limit must be non-zero")]
    UdpBatchLimit,

    #[error("udp_idle_timeout must be non-zero when set")]
    UdpIdleTimeout,
}

/// Data plane tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Sleep between ticks that found nothing to do.
    pub tick_interval: Duration,
    /// Initial sequence number the proxy uses toward the device.
    pub initial_seq: u32,
    /// Maximum bytes read from an outbound TCP socket per read.
    pub read_chunk: usize,
    /// Device bytes a TCP session buffers while its outbound socket is
    /// full. Data beyond this is not acknowledged.
    pub max_backlog: usize,
    /// Bounded capacity of the input queue.
    pub input_queue_capacity: usize,
    /// Idle buffers retained by the pool.
    pub pool_retain: usize,
    /// Optional idle timeout for UDP NAT entries. `None` keeps entries
    /// until shutdown.
    pub udp_idle_timeout: Option<Duration>,
    /// Datagrams drained per UDP flow per tick.
    pub udp_batch_limit: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            tick_interval: DEFAULT_TICK_INTERVAL,
            initial_seq: DEFAULT_INITIAL_SEQ,
            read_chunk: DEFAULT_READ_CHUNK,
            max_backlog: DEFAULT_MAX_BACKLOG,
            input_queue_capacity: DEFAULT_INPUT_QUEUE_CAPACITY,
            pool_retain: DEFAULT_POOL_RETAIN,
            udp_idle_timeout: None,
            udp_batch_limit: DEFAULT_UDP_BATCH_LIMIT,
        }
    }
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.read_chunk == 0 || self.read_chunk > MAX_READ_CHUNK {
            return Err(ConfigError::ReadChunk(self.read_chunk));
        }
        if self.max_backlog == 0 {
            return Err(ConfigError::MaxBacklog);
        }
        if self.input_queue_capacity == 0 {
            return Err(ConfigError::InputQueueCapacity);
        }
        if self.pool_retain == 0 {
            return Err(ConfigError::PoolRetain);
        }
        if self.udp_batch_limit == 0 {
            return Err(ConfigError::UdpBatchLimit);
        }
        if self.udp_idle_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::UdpIdleTimeout);
        }
        Ok(())
    }
}
