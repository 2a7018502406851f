#![warn(clippy::all)]

mod error;
mod relay;
mod request;
mod session;
mod wire;

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::session::{SessionConfig, SessionReport};

// ============================================================================
// CLI ARGUMENTS
// ============================================================================

#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
struct Args {
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Upstream connect timeout in seconds, 0 disables it
    #[arg(long, default_value_t = 0)]
    connect_timeout: u64,

    /// Seconds between statistics lines, 0 disables them
    #[arg(long, default_value_t = 60)]
    stats_interval: u64,

    #[arg(long, short = 'q')]
    quiet: bool,

    #[arg(long, short = 'v')]
    verbose: bool,

    #[arg(long, default_value = "info")]
    log_level: String,
}

// ============================================================================
// STATISTICS
// ============================================================================

struct Stats {
    total: AtomicU64,
    active: AtomicU64,
    failed: AtomicU64,
    tunnels: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl Stats {
    fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            active: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            tunnels: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
        }
    }

    fn record(&self, report: &SessionReport) {
        if report.request.is_connect() {
            self.tunnels.fetch_add(1, Ordering::Relaxed);
        }
        self.bytes_out
            .fetch_add(report.relay.client_to_upstream, Ordering::Relaxed);
        self.bytes_in
            .fetch_add(report.relay.upstream_to_client, Ordering::Relaxed);
    }

    fn print(&self) {
        info!(
            "📊 total={} active={} tunnels={} failed={} in={}MB out={}MB",
            self.total.load(Ordering::Relaxed),
            self.active.load(Ordering::Relaxed),
            self.tunnels.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
            self.bytes_in.load(Ordering::Relaxed) / 1_000_000,
            self.bytes_out.load(Ordering::Relaxed) / 1_000_000,
        );
    }
}

// ============================================================================
// MAIN
// ============================================================================

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.quiet {
        "error"
    } else if args.verbose {
        "debug"
    } else {
        &args.log_level
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .compact()
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get() * 2)
        .thread_stack_size(2 * 1024 * 1024)
        .enable_all()
        .build()?;

    runtime.block_on(run(args))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let stats = Arc::new(Stats::new());

    if args.stats_interval > 0 {
        let stats_clone = stats.clone();
        let interval = args.stats_interval;
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(Duration::from_secs(interval));
            loop {
                timer.tick().await;
                stats_clone.print();
            }
        });
    }

    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let listener = bind_listener(addr)?;

    info!("🚀 Proxy listening on http://{}", addr);

    let config = Arc::new(SessionConfig {
        connect_timeout: (args.connect_timeout > 0)
            .then(|| Duration::from_secs(args.connect_timeout)),
    });

    loop {
        let (client_stream, client_addr) = listener.accept().await?;
        info!("receive from client conn: {}", client_addr);

        stats.total.fetch_add(1, Ordering::Relaxed);
        stats.active.fetch_add(1, Ordering::Relaxed);

        let config = config.clone();
        let stats = stats.clone();
        tokio::spawn(async move {
            match session::handle_connection(client_stream, client_addr, &config).await {
                Ok(report) => stats.record(&report),
                Err(e) => {
                    debug!("Connection error from {}: {}", client_addr, e);
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                }
            }

            stats.active.fetch_sub(1, Ordering::Relaxed);
        });
    }
}

// ============================================================================
// LISTENER
// ============================================================================

fn bind_listener(addr: SocketAddr) -> anyhow::Result<TcpListener> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;

    match socket.bind(&addr.into()) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::AddrInUse => {
            eprintln!("\n❌ PORT {} ALREADY IN USE\n", addr.port());
            eprintln!("   Run with a different port: --port {}\n", addr.port().wrapping_add(1));
            std::process::exit(1);
        }
        Err(e) => return Err(anyhow::anyhow!("bind {} failed: {}", addr, e)),
    }

    socket.listen(1024)?;
    Ok(TcpListener::from_std(socket.into())?)
}

// ============================================================================
// TESTS
// ============================================================================
