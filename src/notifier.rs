//! eventfd-backed wakeup channel for a worker's multiplexer.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};

/// Private wakeup channel: any thread may `notify`, the owning worker sees
/// the descriptor become readable and `drain`s it.
#[derive(Debug)]
pub struct Notifier {
    fd: OwnedFd,
}

impl Notifier {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub fn register(&self, registry: &Registry, token: Token) -> io::Result<()> {
        let raw = self.fd.as_raw_fd();
        registry.register(&mut SourceFd(&raw), token, Interest::READABLE)
    }

    /// Wake the owning worker.
    pub fn notify(&self) {
        let val: u64 = 1;
        let n = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                &val as *const u64 as *const libc::c_void,
                8,
            )
        };
        if n < 0 {
            // EAGAIN means the counter is saturated, so a wakeup is already pending.
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                tracing::warn!(error = %err, "failed to signal worker notifier");
            }
        }
    }

    /// Reset the counter. Returns true if a notification was pending.
    pub fn drain(&self) -> bool {
        let mut val: u64 = 0;
        let n = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &mut val as *mut u64 as *mut libc::c_void,
                8,
            )
        };
        n == 8 && val > 0
    }
}

impl AsRawFd for Notifier {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_then_drain() {
        let notifier = Notifier::new().expect("eventfd");
        assert!(!notifier.drain());
        notifier.notify();
        notifier.notify();
        assert!(notifier.drain());
        assert!(!notifier.drain());
    }
}
