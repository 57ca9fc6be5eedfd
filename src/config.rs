//! Server sizing and operational configuration.
//!
//! Defaults live in `constants`. The binary maps its command line onto
//! `ServerConfig`; library users construct it directly.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use crate::constants::{
    DEFAULT_BUFFER_SIZE, DEFAULT_EVENTS_CAPACITY, DEFAULT_LISTEN_BACKLOG,
    DEFAULT_MAX_ACTIVE_REQUESTS, DEFAULT_MAX_POOLED_BUFFERS, DEFAULT_MAX_READS_PER_CYCLE,
    DEFAULT_SELECT_TIMEOUT, DEFAULT_SHUTDOWN_TIMEOUT,
};
use crate::servicer::{AcceptedSocketDecorator, ServerSocketDecorator};

/// Sizing for the socket manager and every worker it starts.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Number of readiness workers (event-loop threads).
    pub workers: usize,
    /// Bytes per pooled buffer.
    pub buffer_size: usize,
    /// Idle buffers the default pool keeps for reuse.
    pub max_pooled_buffers: usize,
    /// Reads per connection per readiness cycle.
    pub max_reads_per_cycle: usize,
    /// Pipelined requests per connection before read interest is dropped.
    pub max_active_requests: usize,
    /// SO_RCVBUF for accepted sockets, if set.
    pub receive_buffer_size: Option<usize>,
    /// SO_SNDBUF for accepted sockets, if set.
    pub send_buffer_size: Option<usize>,
    pub listen_backlog: i32,
    /// Longest single multiplexer wait.
    pub select_timeout: Duration,
    /// How long `shutdown` waits for workers to stop.
    pub shutdown_timeout: Duration,
    /// Readiness events fetched per wait.
    pub events_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_pooled_buffers: DEFAULT_MAX_POOLED_BUFFERS,
            max_reads_per_cycle: DEFAULT_MAX_READS_PER_CYCLE,
            max_active_requests: DEFAULT_MAX_ACTIVE_REQUESTS,
            receive_buffer_size: None,
            send_buffer_size: None,
            listen_backlog: DEFAULT_LISTEN_BACKLOG,
            select_timeout: DEFAULT_SELECT_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            events_capacity: DEFAULT_EVENTS_CAPACITY,
        }
    }
}

impl ServerConfig {
    /// Clamp values that would stall or break a worker.
    pub fn normalized(mut self) -> Self {
        self.workers = self.workers.max(1);
        self.buffer_size = self.buffer_size.max(1);
        self.max_reads_per_cycle = self.max_reads_per_cycle.max(1);
        self.max_active_requests = self.max_active_requests.max(1);
        self.events_capacity = self.events_capacity.max(16);
        self
    }
}

/// One worker per hardware thread.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Options for a listening socket created by `SocketManager::bind`.
#[derive(Clone)]
pub struct ServerSocketOptions {
    pub host: IpAddr,
    /// Backlog override; `None` uses `ServerConfig::listen_backlog`.
    pub backlog: Option<i32>,
    pub reuse_port: bool,
    pub decorator: Option<Arc<dyn ServerSocketDecorator>>,
}

impl Default for ServerSocketOptions {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            backlog: None,
            reuse_port: false,
            decorator: None,
        }
    }
}

impl std::fmt::Debug for ServerSocketOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSocketOptions")
            .field("host", &self.host)
            .field("backlog", &self.backlog)
            .field("reuse_port", &self.reuse_port)
            .field("decorator", &self.decorator.is_some())
            .finish()
    }
}

/// Options applied to every connection accepted on a listener.
#[derive(Clone)]
pub struct AcceptedSocketOptions {
    pub no_delay: bool,
    /// Overrides `ServerConfig::receive_buffer_size`.
    pub receive_buffer_size: Option<usize>,
    /// Overrides `ServerConfig::send_buffer_size`.
    pub send_buffer_size: Option<usize>,
    pub decorator: Option<Arc<dyn AcceptedSocketDecorator>>,
}

impl Default for AcceptedSocketOptions {
    fn default() -> Self {
        Self {
            no_delay: true,
            receive_buffer_size: None,
            send_buffer_size: None,
            decorator: None,
        }
    }
}

impl std::fmt::Debug for AcceptedSocketOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcceptedSocketOptions")
            .field("no_delay", &self.no_delay)
            .field("receive_buffer_size", &self.receive_buffer_size)
            .field("send_buffer_size", &self.send_buffer_size)
            .field("decorator", &self.decorator.is_some())
            .finish()
    }
}

/// Output format for the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Filter directive used when RUST_LOG is unset.
    pub level: String,
    pub format: LogFormat,
    pub thread_names: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
            thread_names: true,
        }
    }
}
