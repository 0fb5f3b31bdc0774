use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mvirt_tunproxy::config::{
    DEFAULT_INITIAL_SEQ, DEFAULT_INPUT_QUEUE_CAPACITY, DEFAULT_MAX_BACKLOG, DEFAULT_POOL_RETAIN,
    DEFAULT_READ_CHUNK, DEFAULT_UDP_BATCH_LIMIT,
};
use mvirt_tunproxy::protect::{BindDevice, FwMark, SocketProtector, Unprotected};
use mvirt_tunproxy::sink::TraceSink;
use mvirt_tunproxy::tun::{DEFAULT_TUN_NAME, TunDevice};
use mvirt_tunproxy::{ProxyConfig, ProxyError};

#[derive(Parser, Debug)]
#[command(name = "mvirt-tunproxy")]
#[command(about = "Transparent TCP/UDP proxy behind a TUN device")]
struct Args {
    /// TUN device name
    #[arg(long, default_value = DEFAULT_TUN_NAME)]
    tun_name: String,

    /// SO_MARK for outbound sockets (route them around the TUN device)
    #[arg(long, conflicts_with = "bind_device")]
    fwmark: Option<u32>,

    /// Bind outbound sockets to this interface
    #[arg(long)]
    bind_device: Option<String>,

    /// Idle sleep between processor ticks, in microseconds
    #[arg(long, default_value_t = 1000)]
    tick_us: u64,

    /// Initial sequence number for proxy-originated segments
    #[arg(long, default_value_t = DEFAULT_INITIAL_SEQ)]
    initial_seq: u32,

    /// Bytes read from an outbound TCP socket per segment
    #[arg(long, default_value_t = DEFAULT_READ_CHUNK)]
    read_chunk: usize,

    /// Device bytes held per TCP session while the remote is not reading
    #[arg(long, default_value_t = DEFAULT_MAX_BACKLOG)]
    max_backlog: usize,

    /// Capacity of the reader -> processor queue
    #[arg(long, default_value_t = DEFAULT_INPUT_QUEUE_CAPACITY)]
    input_queue: usize,

    /// Idle buffers kept by the buffer pool
    #[arg(long, default_value_t = DEFAULT_POOL_RETAIN)]
    pool_retain: usize,

    /// Datagrams drained per UDP flow per tick
    #[arg(long, default_value_t = DEFAULT_UDP_BATCH_LIMIT)]
    udp_batch: usize,

    /// Evict UDP flows idle for this many seconds (never when unset)
    #[arg(long)]
    udp_idle_timeout_secs: Option<u64>,
}

impl Args {
    fn config(&self) -> ProxyConfig {
        ProxyConfig {
            tick_interval: Duration::from_micros(self.tick_us),
            initial_seq: self.initial_seq,
            read_chunk: self.read_chunk,
            max_backlog: self.max_backlog,
            input_queue_capacity: self.input_queue,
            pool_retain: self.pool_retain,
            udp_idle_timeout: self.udp_idle_timeout_secs.map(Duration::from_secs),
            udp_batch_limit: self.udp_batch,
        }
    }

    fn protector(&self) -> Arc<dyn SocketProtector> {
        match (self.fwmark, &self.bind_device) {
            (Some(mark), _) => Arc::new(FwMark(mark)),
            (None, Some(device)) => Arc::new(BindDevice(device.clone())),
            (None, None) => {
                warn!("No --fwmark or --bind-device given, outbound sockets are unprotected");
                Arc::new(Unprotected)
            }
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = args.config();
    config.validate()?;

    info!(tun = %args.tun_name, "Starting mvirt-tunproxy");

    let device = TunDevice::create(&args.tun_name)
        .map_err(|e| ProxyError::CreateTun(args.tun_name.clone(), e))
        .context("Do you have CAP_NET_ADMIN?")?;
    device
        .bring_up()
        .map_err(ProxyError::Interface)
        .context("Failed to bring the TUN device up")?;
    info!(tun = device.name(), "TUN device up");
    let (reader, writer) = device.split().map_err(ProxyError::Interface)?;

    let handle = mvirt_tunproxy::spawn(
        reader,
        writer,
        config,
        args.protector(),
        Box::new(TraceSink),
    )?;

    let mut sigint = signal(SignalKind::interrupt()).context("Failed to set up SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to set up SIGTERM handler")?;
    let mut check = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                break;
            }
            _ = check.tick() => {
                if !handle.is_running() {
                    warn!("Proxy stopped on its own");
                    break;
                }
            }
        }
    }

    let report = handle.shutdown()?;
    info!(
        frames_in = report.stats.frames_in,
        frames_out = report.stats.frames_out,
        dropped = report.stats.dropped,
        malformed = report.stats.malformed,
        buffers_allocated = report.stats.pool.allocated,
        buffers_reused = report.stats.pool.reused,
        tcp_sessions = report.tcp.opened,
        udp_flows = report.udp.opened,
        "Stopped"
    );

    Ok(())
}
