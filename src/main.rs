use std::sync::atomic::Ordering;

use clap::Parser;
use tracing::info;

use stoker::{Server, ServerConfig, StokerResult};

/// Epoll-driven HTTP/1.1 static file server with form auth.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Trigger mode 0..=3 (bit 0: connections edge-triggered, bit 1: listener)
    #[arg(short, long)]
    trigger_mode: Option<u8>,

    /// Idle timeout in milliseconds (0 disables eviction)
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Enable SO_LINGER on the listener
    #[arg(long)]
    linger: bool,

    /// Resource root directory
    #[arg(long)]
    src_dir: Option<std::path::PathBuf>,

    /// Database pool size (0 disables form auth)
    #[arg(long)]
    db_pool_size: Option<usize>,

    /// Worker thread count (0 = one per core)
    #[arg(long)]
    workers: Option<usize>,

    /// Log level (trace|debug|info|warn|error)
    #[arg(long)]
    log_level: Option<String>,

    /// Disable logging entirely
    #[arg(short, long)]
    quiet: bool,
}

fn main() -> StokerResult<()> {
    let args = Args::parse();

    let mut config = ServerConfig::from_env();
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(mode) = args.trigger_mode {
        config.trigger_mode = mode;
    }
    if let Some(timeout) = args.timeout_ms {
        config.timeout_ms = timeout;
    }
    if args.linger {
        config.linger = true;
    }
    if let Some(dir) = args.src_dir {
        config.src_dir = dir;
    }
    if let Some(size) = args.db_pool_size {
        config.db_pool_size = size;
    }
    if let Some(workers) = args.workers {
        config.worker_threads = workers;
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }
    if args.quiet {
        config.log_enable = false;
    }

    if config.log_enable {
        stoker::logging::init_logging(&config.log_level);
    }

    let mut server = Server::new(config)?;

    let shutdown = server.shutdown_handle();
    ctrlc::set_handler(move || {
        info!("received SIGINT, shutting down");
        shutdown.store(true, Ordering::Release);
    })
    .expect("failed to install SIGINT handler");

    server.start();
    Ok(())
}
