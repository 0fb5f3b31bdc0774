//! Output queue of synthesized datagrams
//!
//! Responses are built straight into pooled buffers and queued by value.
//! Once queued, a buffer belongs to the queue; the interface writer pops it,
//! writes its valid range and drops it back into the pool.

use std::collections::VecDeque;
use std::net::SocketAddrV4;
use std::sync::Arc;

use crate::buffer::{BufferPool, PoolBuffer};
use crate::packet::{self, BuildError, IPV4_HEADER_LEN, TCP_HEADER_LEN, TcpSegment, UDP_HEADER_LEN};

pub struct OutputQueue {
    pool: Arc<BufferPool>,
    queue: VecDeque<PoolBuffer>,
}

impl OutputQueue {
    pub fn new(pool: Arc<BufferPool>) -> Self {
        Self {
            pool,
            queue: VecDeque::new(),
        }
    }

    /// Build a TCP segment toward the device and queue it.
    pub fn push_tcp(&mut self, segment: &TcpSegment, payload: &[u8]) -> Result<(), BuildError> {
        let mut buf = self
            .pool
            .alloc(IPV4_HEADER_LEN + TCP_HEADER_LEN + payload.len());
        let len = packet::build_tcp(buf.write_area(), segment, payload)?;
        buf.set_len(len);
        self.queue.push_back(buf);
        Ok(())
    }

    /// Build a UDP datagram toward the device and queue it.
    pub fn push_udp(
        &mut self,
        src: SocketAddrV4,
        dst: SocketAddrV4,
        payload: &[u8],
    ) -> Result<(), BuildError> {
        let mut buf = self
            .pool
            .alloc(IPV4_HEADER_LEN + UDP_HEADER_LEN + payload.len());
        let len = packet::build_udp(buf.write_area(), src, dst, payload)?;
        buf.set_len(len);
        self.queue.push_back(buf);
        Ok(())
    }

    #[inline]
    pub fn pop(&mut self) -> Option<PoolBuffer> {
        self.queue.pop_front()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drop everything still queued.
    pub fn clear(&mut self) {
        self.queue.clear();
    }
}
