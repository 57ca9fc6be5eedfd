//! Library crate for sockloop: a multiplexed TCP socket core.
//!
//! A fixed set of worker threads each run a readiness event loop over their
//! listeners and connections. Protocols plug in through `SocketServicer`
//! (framing) and `RequestServicer` (answering); responses may be written from
//! any thread and are sent strictly in request order.
//!
//! The **binary** (`main.rs`) runs the demo frame server (`frame_servicer`
//! plus the disruptor-backed `processor`); `src/bin/client.rs` drives it.

pub mod buffer_pool;
pub mod config;
pub mod connection;
pub mod constants;
pub mod error;
pub mod frame_servicer;
pub mod logging;
pub mod manager;
pub mod metrics;
pub mod notifier;
pub mod processor;
pub mod protocol;
pub mod safe_event;
pub mod servicer;
pub mod stream_buffer;
mod worker;

pub use buffer_pool::{AllocError, BufferPool, FixedBufferPool, PoolStats, PooledBytes, SharedBufferPool};
pub use config::{AcceptedSocketOptions, LogFormat, LoggingConfig, ServerConfig, ServerSocketOptions};
pub use connection::{ConnectionControl, ConnectionHandle, ResponseWriter, SocketContext};
pub use error::{Error, Result};
pub use manager::{ListenerHandle, SocketManager};
pub use servicer::{
    AcceptedSocketDecorator, CancelHandle, HeaderWriter, RequestServicer, RequestServicerFactory,
    ServerSocketDecorator, SocketServicer, SocketServicerFactory,
};
pub use stream_buffer::{BufferChain, FileRegion, OutboundChain, StreamBuffer};
pub use worker::WorkerState;
