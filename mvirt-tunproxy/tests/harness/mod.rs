//! Test harness for proxy integration tests
//!
//! Provides an in-memory stand-in for the TUN device and helpers to build and
//! check the datagrams that cross it.

#![allow(dead_code)]

pub mod device;
pub mod packets;

pub use device::{FakeDevice, FakeReader, FakeWriter, fake_device};
pub use packets::Segment;

use std::time::{Duration, Instant};

/// Poll `condition` until it holds or `timeout` expires.
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
