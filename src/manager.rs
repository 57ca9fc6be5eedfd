//! Composition root of the socket core: starts the workers, binds listeners
//! onto them and shuts them down.

use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mio::Poll;
use parking_lot::{Condvar, Mutex};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{error, info, warn};

use crate::buffer_pool::{FixedBufferPool, SharedBufferPool};
use crate::config::{AcceptedSocketOptions, ServerConfig, ServerSocketOptions};
use crate::connection::{Binding, ConnectionFactory};
use crate::constants::{BIND_RETRIES, BIND_RETRY_BACKOFF};
use crate::error::{Error, Result};
use crate::servicer::{RequestServicerFactory, SocketServicerFactory};
use crate::worker::{Balancer, ListenerKey, Worker, WorkerShared, WorkerState};

/// Counts running workers down to zero.
pub(crate) struct StopLatch {
    remaining: Mutex<usize>,
    stopped: Condvar,
}

impl StopLatch {
    pub(crate) fn new(count: usize) -> Self {
        Self {
            remaining: Mutex::new(count),
            stopped: Condvar::new(),
        }
    }

    pub(crate) fn count_down(&self) {
        let mut remaining = self.remaining.lock();
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            self.stopped.notify_all();
        }
    }

    pub(crate) fn remaining(&self) -> usize {
        *self.remaining.lock()
    }

    /// Wait up to `timeout` for the count to reach zero. Returns what is left.
    pub(crate) fn wait(&self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut remaining = self.remaining.lock();
        while *remaining > 0 {
            if self.stopped.wait_until(&mut remaining, deadline).timed_out() {
                break;
            }
        }
        *remaining
    }
}

/// A listening socket registered on one worker.
#[derive(Clone)]
pub struct ListenerHandle {
    worker: Arc<WorkerShared>,
    key: ListenerKey,
    local_addr: SocketAddr,
    reply_timeout: Duration,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Stop accepting on this listener. Established connections are kept.
    ///
    /// Returns once the worker has closed the socket, unless called from that
    /// worker's own thread.
    pub fn close(&self) -> Result<()> {
        let key = self.key;
        if self.worker.is_owner_thread() {
            return self
                .worker
                .submit_task(Box::new(move |worker: &mut Worker| worker.remove_listener(key)));
        }
        let (tx, rx) = mpsc::channel();
        self.worker.submit_task(Box::new(move |worker: &mut Worker| {
            worker.remove_listener(key);
            let _ = tx.send(());
        }))?;
        rx.recv_timeout(self.reply_timeout)
            .map_err(|_| Error::WorkerUnavailable)
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("worker", &self.worker.index)
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

/// Owns the socket workers.
///
/// ```no_run
/// use sockloop::{ServerConfig, SocketManager};
///
/// let manager = SocketManager::with_default_pool(ServerConfig::default())?;
/// // manager.bind(port, server_options, accepted_options, framing, servicing)?;
/// manager.shutdown()?;
/// # Ok::<(), sockloop::Error>(())
/// ```
pub struct SocketManager {
    config: ServerConfig,
    pool: SharedBufferPool,
    balancer: Arc<Balancer>,
    latch: Arc<StopLatch>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    listeners: Mutex<Vec<ListenerHandle>>,
    shutdown_started: AtomicBool,
}

impl SocketManager {
    /// Start `config.workers` workers sharing `pool`.
    pub fn new(config: ServerConfig, pool: SharedBufferPool) -> Result<Self> {
        let config = config.normalized();

        let mut polls = Vec::with_capacity(config.workers);
        let mut shared = Vec::with_capacity(config.workers);
        for index in 0..config.workers {
            let poll = Poll::new()?;
            let worker = Arc::new(WorkerShared::new(index)?);
            worker.register(&poll)?;
            polls.push(poll);
            shared.push(worker);
        }

        let manager = Self {
            balancer: Arc::new(Balancer::new(shared)),
            latch: Arc::new(StopLatch::new(config.workers)),
            threads: Mutex::new(Vec::with_capacity(config.workers)),
            listeners: Mutex::new(Vec::new()),
            shutdown_started: AtomicBool::new(false),
            config,
            pool,
        };

        for (index, poll) in polls.into_iter().enumerate() {
            let worker = Worker::new(
                Arc::clone(&manager.balancer.workers()[index]),
                poll,
                Arc::clone(&manager.balancer),
                Arc::clone(&manager.pool),
                manager.config.clone(),
                Arc::clone(&manager.latch),
            );
            let spawned = thread::Builder::new()
                .name(format!("sockloop-worker-{index}"))
                .spawn(move || worker.run());
            match spawned {
                Ok(thread) => manager.threads.lock().push(thread),
                Err(err) => {
                    error!(worker = index, error = %err, "failed to spawn socket worker");
                    for _ in index..manager.config.workers {
                        manager.latch.count_down();
                    }
                    // Drop stops the workers already running
                    return Err(err.into());
                }
            }
        }

        info!(
            workers = manager.config.workers,
            buffer_size = manager.pool.buffer_size(),
            max_active_requests = manager.config.max_active_requests,
            "socket manager started"
        );
        Ok(manager)
    }

    /// Start with a `FixedBufferPool` sized from `config`.
    pub fn with_default_pool(config: ServerConfig) -> Result<Self> {
        let pool = FixedBufferPool::new(config.buffer_size, config.max_pooled_buffers).shared();
        Self::new(config, pool)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn pool(&self) -> &SharedBufferPool {
        &self.pool
    }

    pub fn worker_count(&self) -> usize {
        self.balancer.workers().len()
    }

    /// Listeners bound so far and not yet cleared by shutdown.
    pub fn listeners(&self) -> Vec<ListenerHandle> {
        self.listeners.lock().clone()
    }

    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.balancer.workers().iter().map(|w| w.state()).collect()
    }

    /// True until every worker has stopped.
    pub fn is_running(&self) -> bool {
        self.latch.remaining() > 0
    }

    /// Listen on `port` (0 picks an ephemeral port) and service accepted
    /// connections with servicers created by the two factories.
    ///
    /// Listeners are assigned to workers round-robin; accepted connections
    /// are spread over all workers the same way.
    pub fn bind<R, S, Q>(
        &self,
        port: u16,
        server_options: ServerSocketOptions,
        accepted_options: AcceptedSocketOptions,
        socket_factory: S,
        request_factory: Q,
    ) -> Result<ListenerHandle>
    where
        R: 'static,
        S: SocketServicerFactory<R>,
        Q: RequestServicerFactory<R>,
    {
        if self.shutdown_started.load(Ordering::Acquire) {
            return Err(Error::WorkerUnavailable);
        }

        let std_listener = bind_with_retry(port, &server_options, self.config.listen_backlog)?;
        let local_addr = std_listener.local_addr()?;
        let listener = mio::net::TcpListener::from_std(std_listener);
        let binding: Arc<dyn ConnectionFactory> = Arc::new(Binding::new(
            socket_factory,
            request_factory,
            accepted_options,
        ));

        let worker = self.listener_worker()?;
        let key = register_listener(&worker, listener, binding, self.config.shutdown_timeout)?;

        let handle = ListenerHandle {
            worker: Arc::clone(&worker),
            key,
            local_addr,
            reply_timeout: self.config.shutdown_timeout,
        };
        self.listeners.lock().push(handle.clone());
        info!(%local_addr, worker = worker.index, "listening");
        Ok(handle)
    }

    /// Next worker in round-robin order that is not the calling thread's own,
    /// since a worker cannot wait on its own queue.
    fn listener_worker(&self) -> Result<Arc<WorkerShared>> {
        for _ in 0..self.worker_count() {
            let worker = self.balancer.next_worker();
            if !worker.is_owner_thread() {
                return Ok(Arc::clone(worker));
            }
        }
        Err(Error::WrongThread { operation: "bind" })
    }

    /// Stop every worker and wait up to `shutdown_timeout` for them.
    ///
    /// Safe to call more than once; a later call waits again for workers
    /// that missed the earlier deadline.
    pub fn shutdown(&self) -> Result<()> {
        if !self.shutdown_started.swap(true, Ordering::AcqRel) {
            info!("shutting down socket manager");
            self.listeners.lock().clear();
            for worker in self.balancer.workers() {
                worker.request_shutdown();
            }
        }

        let timeout = self.config.shutdown_timeout;
        let remaining = self.latch.wait(timeout);
        if remaining > 0 {
            warn!(remaining, ?timeout, "socket workers did not stop in time");
            return Err(Error::ShutdownTimeout { timeout, remaining });
        }

        let threads = std::mem::take(&mut *self.threads.lock());
        for thread in threads {
            if thread.join().is_err() {
                error!("socket worker panicked");
            }
        }
        Ok(())
    }
}

impl Drop for SocketManager {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            error!(error = %err, "socket manager dropped with workers still running");
        }
    }
}

/// Hand `listener` to `worker` and wait for it to be registered.
///
/// A listener the worker gets to only after `timeout` is dropped instead of
/// registered, so a failed bind never leaves the port accepting.
fn register_listener(
    worker: &WorkerShared,
    listener: mio::net::TcpListener,
    binding: Arc<dyn ConnectionFactory>,
    timeout: Duration,
) -> Result<ListenerKey> {
    let abandoned = Arc::new(Mutex::new(false));
    let (tx, rx) = mpsc::channel();
    let task_abandoned = Arc::clone(&abandoned);
    worker.submit_task(Box::new(move |w: &mut Worker| {
        // held while registering so the caller cannot give up halfway
        let abandoned = task_abandoned.lock();
        if *abandoned {
            return;
        }
        let _ = tx.send(w.add_listener(listener, binding));
    }))?;

    match rx.recv_timeout(timeout) {
        Ok(registered) => Ok(registered?),
        Err(_) => {
            *abandoned.lock() = true;
            // the worker may have answered between the timeout and the flag
            match rx.try_recv() {
                Ok(registered) => Ok(registered?),
                Err(_) => Err(Error::WorkerUnavailable),
            }
        }
    }
}

fn bind_with_retry(
    port: u16,
    options: &ServerSocketOptions,
    default_backlog: i32,
) -> Result<StdTcpListener> {
    let mut retries = 0;
    loop {
        match bind_listener(port, options, default_backlog) {
            Ok(listener) => return Ok(listener),
            Err(err) if Error::is_addr_in_use(&err) && retries < BIND_RETRIES => {
                retries += 1;
                warn!(port, retries, "address in use, retrying bind");
                thread::sleep(BIND_RETRY_BACKOFF * retries);
            }
            Err(source) => return Err(Error::Bind { port, source }),
        }
    }
}

fn bind_listener(
    port: u16,
    options: &ServerSocketOptions,
    default_backlog: i32,
) -> std::io::Result<StdTcpListener> {
    let addr = SocketAddr::new(options.host, port);
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if options.reuse_port {
        set_reuse_port(&socket)?;
    }
    socket.set_nonblocking(true)?;

    let mut backlog = options.backlog.unwrap_or(default_backlog);
    if let Some(decorator) = &options.decorator {
        decorator.decorate(&socket)?;
        backlog = decorator.backlog(backlog);
    }
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    Ok(socket.into())
}

fn set_reuse_port(socket: &Socket) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let optval: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of_val(&optval) as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
