//! Error types for the socket core.

use std::any::Any;
use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

use thiserror::Error;

use crate::buffer_pool::AllocError;

/// Result type alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to the composition root.
///
/// Failures confined to one connection never show up here: they close that
/// connection and are logged by its worker.
#[derive(Debug, Error)]
pub enum Error {
    /// The listening socket could not be bound, after retrying "address in use".
    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    /// Some workers did not stop within the shutdown timeout.
    #[error("{remaining} socket worker(s) still running after {timeout:?}")]
    ShutdownTimeout { timeout: Duration, remaining: usize },

    /// The target worker has stopped (or is stopping) and cannot take work.
    #[error("socket worker is not running")]
    WorkerUnavailable,

    /// An operation was invoked on a thread it cannot run on: an owner-only
    /// connection operation off its worker, or `bind` from the only worker.
    #[error("{operation} cannot be invoked from this thread")]
    WrongThread { operation: &'static str },

    /// The connection has already been terminated.
    #[error("connection closed")]
    ConnectionClosed,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Alloc(#[from] AllocError),
}

impl Error {
    /// True when the failure is a transient "address in use" bind failure.
    pub fn is_addr_in_use(err: &io::Error) -> bool {
        err.kind() == io::ErrorKind::AddrInUse
    }
}

/// Classifies per-connection failures that are part of normal client churn.
pub fn is_expected_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
    )
}

/// Run servicer code on a worker, turning a panic into an error for the
/// connection it belongs to.
pub(crate) fn catch_servicer_panic<T>(f: impl FnOnce() -> io::Result<T>) -> io::Result<T> {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| Err(panic_error(payload.as_ref())))
}

pub(crate) fn panic_error(payload: &(dyn Any + Send)) -> io::Error {
    let msg = payload
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| payload.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    io::Error::other(format!("servicer panicked: {msg}"))
}
