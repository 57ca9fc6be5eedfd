//! Interfaces through which protocols plug into the socket core.
//!
//! A `SocketServicer` frames bytes into requests, a `RequestServicer`
//! answers them (from any thread) through a `ResponseWriter`.

use std::io;

use socket2::{SockRef, Socket};

use crate::buffer_pool::PooledBytes;
use crate::connection::{ConnectionHandle, ResponseWriter, SocketContext};
use crate::stream_buffer::OutboundChain;

/// Told to stop work for a request whose connection went away.
pub type CancelHandle = Box<dyn FnOnce() + Send>;

/// Writes a response header into the connection's outbound chain, ahead of
/// the response body.
pub type HeaderWriter = Box<dyn FnOnce(&mut OutboundChain) + Send>;

/// Per-connection protocol framing, always invoked on the connection's worker.
pub trait SocketServicer<R>: Send {
    /// Called after each successful read.
    ///
    /// The new bytes are the last `bytes_read` bytes of `read_buffer.filled()`.
    /// When `is_new_buffer` is true the buffer holds only these bytes;
    /// otherwise it continues the previous read.
    fn service_read(
        &mut self,
        ctx: &mut SocketContext<'_, R>,
        read_buffer: &PooledBytes,
        bytes_read: usize,
        is_new_buffer: bool,
    ) -> io::Result<()>;

    /// Called once when the connection is torn down.
    fn release(&mut self) {}
}

pub trait SocketServicerFactory<R>: Send + Sync + 'static {
    fn create(&self, connection: &ConnectionHandle) -> Box<dyn SocketServicer<R>>;
}

impl<R, F> SocketServicerFactory<R> for F
where
    F: Fn(&ConnectionHandle) -> Box<dyn SocketServicer<R>> + Send + Sync + 'static,
{
    fn create(&self, connection: &ConnectionHandle) -> Box<dyn SocketServicer<R>> {
        self(connection)
    }
}

/// Services requests framed by a `SocketServicer`.
///
/// `service` runs on the worker thread but the `ResponseWriter` may be moved
/// to and written from any thread. Every request must be answered exactly
/// once, or later responses on the connection can never be sent.
pub trait RequestServicer<R>: Send {
    fn service(&mut self, request: R, response: ResponseWriter) -> Option<CancelHandle>;

    /// Called once when the connection is torn down.
    fn release(&mut self) {}
}

pub trait RequestServicerFactory<R>: Send + Sync + 'static {
    fn create(&self, connection: &ConnectionHandle) -> Box<dyn RequestServicer<R>>;
}

impl<R, F> RequestServicerFactory<R> for F
where
    F: Fn(&ConnectionHandle) -> Box<dyn RequestServicer<R>> + Send + Sync + 'static,
{
    fn create(&self, connection: &ConnectionHandle) -> Box<dyn RequestServicer<R>> {
        self(connection)
    }
}

/// Hook applied to a listening socket before it is bound.
pub trait ServerSocketDecorator: Send + Sync {
    fn decorate(&self, _socket: &Socket) -> io::Result<()> {
        Ok(())
    }

    /// Listen backlog to use, given the configured one.
    fn backlog(&self, configured: i32) -> i32 {
        configured
    }
}

/// Hook applied to each accepted socket before it is serviced.
pub trait AcceptedSocketDecorator: Send + Sync {
    fn decorate(&self, socket: SockRef<'_>) -> io::Result<()>;
}
