//! Error types for the proxy.

use std::io;

use thiserror::Error;

use crate::config::ConfigError;

/// Errors surfaced by the proxy to its owner.
///
/// Per-flow failures (a refused connect, a reset outbound socket) never show
/// up here; they only tear down the affected session or NAT entry.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to create TUN device '{0}': {1}")]
    CreateTun(String, io::Error),

    #[error("Virtual interface I/O failed: {0}")]
    Interface(io::Error),

    #[error("Failed to set up readiness poller: {0}")]
    Poller(io::Error),

    #[error("Failed to spawn {0} thread: {1}")]
    Spawn(&'static str, io::Error),

    #[error("{0} thread panicked")]
    ThreadPanicked(&'static str),
}

pub type Result<T> = std::result::Result<T, ProxyError>;
