use std::net::IpAddr;
use std::process::ExitCode;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::{error, info};

use sockloop::constants::{
    DEFAULT_BUFFER_SIZE, DEFAULT_MAX_ACTIVE_REQUESTS, DEFAULT_MAX_POOLED_BUFFERS,
    DEFAULT_MAX_READS_PER_CYCLE, FRAME_RING_SIZE,
};
use sockloop::frame_servicer::bind_frame_server;
use sockloop::processor::build_frame_ring;
use sockloop::{
    AcceptedSocketOptions, FixedBufferPool, LogFormat, LoggingConfig, ServerConfig,
    ServerSocketOptions, SocketManager, logging, metrics,
};

#[derive(Parser)]
#[command(about = "Multiplexed socket server answering length-prefixed frames")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 9900)]
    port: u16,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: IpAddr,

    /// Socket worker threads (defaults to available parallelism)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Bytes per pooled buffer
    #[arg(long, default_value_t = DEFAULT_BUFFER_SIZE)]
    buffer_size: usize,

    /// Idle buffers kept by the pool
    #[arg(long, default_value_t = DEFAULT_MAX_POOLED_BUFFERS)]
    max_pooled_buffers: usize,

    /// Unanswered requests per connection before reads pause
    #[arg(long, default_value_t = DEFAULT_MAX_ACTIVE_REQUESTS)]
    max_active_requests: usize,

    /// Reads per connection per readiness cycle
    #[arg(long, default_value_t = DEFAULT_MAX_READS_PER_CYCLE)]
    max_reads_per_cycle: usize,

    /// SO_RCVBUF for accepted sockets
    #[arg(long)]
    receive_buffer_size: Option<usize>,

    /// SO_SNDBUF for accepted sockets
    #[arg(long)]
    send_buffer_size: Option<usize>,

    /// Set SO_REUSEPORT on the listener
    #[arg(long)]
    reuse_port: bool,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    #[arg(long, value_enum, default_value_t = Format::Pretty)]
    log_format: Format,

    /// Seconds between metrics reports (metrics feature only)
    #[arg(long, default_value_t = 10)]
    metrics_interval: u64,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Pretty,
    Compact,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        let defaults = ServerConfig::default();
        ServerConfig {
            workers: self.workers.unwrap_or(defaults.workers),
            buffer_size: self.buffer_size,
            max_pooled_buffers: self.max_pooled_buffers,
            max_reads_per_cycle: self.max_reads_per_cycle,
            max_active_requests: self.max_active_requests,
            receive_buffer_size: self.receive_buffer_size,
            send_buffer_size: self.send_buffer_size,
            ..defaults
        }
        .normalized()
    }

    fn logging_config(&self) -> LoggingConfig {
        LoggingConfig {
            level: self.log_level.clone(),
            format: match self.log_format {
                Format::Pretty => LogFormat::Pretty,
                Format::Compact => LogFormat::Compact,
            },
            thread_names: true,
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    logging::init(&args.logging_config());
    metrics::spawn_reporter(Duration::from_secs(args.metrics_interval.max(1)));

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "sockloop failed");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> sockloop::Result<()> {
    let config = args.server_config();
    let pool = FixedBufferPool::new(config.buffer_size, config.max_pooled_buffers).shared();

    let (producer, processor) = build_frame_ring(FRAME_RING_SIZE);
    let processor_handle = thread::Builder::new()
        .name("frame-processor".into())
        .spawn(move || processor.run())?;

    let manager = SocketManager::new(config, pool)?;
    let server_options = ServerSocketOptions {
        host: args.host,
        reuse_port: args.reuse_port,
        ..Default::default()
    };
    let listener = bind_frame_server(
        &manager,
        args.port,
        server_options,
        AcceptedSocketOptions::default(),
        producer,
    )?;
    info!(addr = %listener.local_addr(), workers = manager.worker_count(), "sockloop: ready");

    let (stop_tx, stop_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })
    .map_err(std::io::Error::other)?;
    let _ = stop_rx.recv();

    info!("sockloop: stopping");
    let result = manager.shutdown();
    // releases the last ring producers so the processor can exit
    drop(manager);
    if processor_handle.join().is_err() {
        error!("frame processor panicked");
    }
    result
}
