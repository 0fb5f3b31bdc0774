//! Delivery of relayed payload to the host application
//!
//! Every chunk read from an established outbound TCP connection is handed to
//! a [`PayloadSink`] before it is forwarded to the device, in read order.

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use tracing::{trace, warn};

use crate::tcp::SessionKey;

pub trait PayloadSink: Send {
    fn deliver(&mut self, flow: &SessionKey, data: &[u8]);
}

impl<F> PayloadSink for F
where
    F: FnMut(&SessionKey, &[u8]) + Send,
{
    fn deliver(&mut self, flow: &SessionKey, data: &[u8]) {
        self(flow, data)
    }
}

/// Logs deliveries at trace level and discards the bytes.
#[derive(Debug, Default)]
pub struct TraceSink;

impl PayloadSink for TraceSink {
    fn deliver(&mut self, flow: &SessionKey, data: &[u8]) {
        trace!(flow = %flow, len = data.len(), "Payload received");
    }
}

/// Forwards copies of each delivery over a bounded channel.
///
/// The processor never waits on the consumer: when the channel is full the
/// chunk is dropped and counted.
pub struct ChannelSink {
    tx: Sender<(SessionKey, Vec<u8>)>,
    dropped: u64,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, Receiver<(SessionKey, Vec<u8>)>) {
        let (tx, rx) = bounded(capacity);
        (Self { tx, dropped: 0 }, rx)
    }

    /// Chunks dropped because the consumer fell behind or went away
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl PayloadSink for ChannelSink {
    fn deliver(&mut self, flow: &SessionKey, data: &[u8]) {
        match self.tx.try_send((*flow, data.to_vec())) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped += 1;
                warn!(flow = %flow, len = data.len(), "Payload consumer full, dropping chunk");
            }
            Err(TrySendError::Disconnected(_)) => {
                self.dropped += 1;
            }
        }
    }
}
