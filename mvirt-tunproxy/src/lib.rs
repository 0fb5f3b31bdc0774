//! Userspace transparent proxy for a TUN device.
//!
//! IPv4 traffic captured from the device is terminated locally: TCP flows are
//! answered by a minimal session state machine and relayed over real
//! outbound sockets, UDP datagrams go through a small NAT table.

pub mod buffer;
pub mod config;
pub mod error;
pub mod packet;
pub mod protect;
pub mod proxy;
pub mod queue;
pub mod sink;
pub mod tcp;
pub mod tun;
pub mod udp;

pub use config::ProxyConfig;
pub use error::{ProxyError, Result};
pub use proxy::{ProxyHandle, ProxyStats, ShutdownReport, spawn};
pub use tcp::SessionKey;
