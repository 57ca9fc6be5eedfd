//! Socket worker: one thread, one multiplexer, many connections.
//!
//! Each worker owns a `Poll`, a slab of listeners and connections, and five
//! cross-thread event queues (accept, execute, write, flush, close) whose
//! notifiers are registered with the multiplexer alongside the sockets.
//! Operations raised on the worker's own thread skip the queues and go to a
//! thread-local list drained after the current dispatch.

use std::cell::{Cell, RefCell};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};

use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use socket2::SockRef;
use tracing::{debug, error, info, trace, warn};

use crate::buffer_pool::SharedBufferPool;
use crate::config::{AcceptedSocketOptions, ServerConfig};
use crate::connection::{
    AcceptedConnection, ConnKey, ConnectionControl, ConnectionCore, ConnectionFactory,
    ConnectionHandle,
};
use crate::error::{Error, Result, catch_servicer_panic, is_expected_disconnect};
use crate::manager::StopLatch;
use crate::metrics;
use crate::notifier::Notifier;
use crate::safe_event::SafeEventQueue;
use crate::servicer::HeaderWriter;
use crate::stream_buffer::BufferChain;

const ACCEPT_TOKEN: Token = Token(0);
const EXECUTE_TOKEN: Token = Token(1);
const WRITE_TOKEN: Token = Token(2);
const FLUSH_TOKEN: Token = Token(3);
const CLOSE_TOKEN: Token = Token(4);
const SHUTDOWN_TOKEN: Token = Token(5);
/// Slab slot `n` is registered as `Token(n + FIRST_SLOT_TOKEN)`.
const FIRST_SLOT_TOKEN: usize = 6;

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Id of the worker running on this thread; 0 elsewhere.
    static CURRENT_WORKER: Cell<u64> = const { Cell::new(0) };
    static LOCAL_EVENTS: RefCell<Vec<LocalEvent>> = const { RefCell::new(Vec::new()) };
}

pub(crate) type ConnectionTask = Box<dyn FnOnce(&mut ConnectionControl<'_>) + Send>;
pub(crate) type WorkerTask = Box<dyn FnOnce(&mut Worker) + Send>;

/// A connection's response to a request, addressed by pipeline sequence.
pub(crate) struct WriteEvent {
    pub(crate) key: ConnKey,
    pub(crate) seq: u64,
    pub(crate) header: Option<HeaderWriter>,
    pub(crate) body: BufferChain,
}

pub(crate) struct CloseEvent {
    pub(crate) key: ConnKey,
    pub(crate) cause: Option<io::Error>,
}

pub(crate) enum ExecuteEvent {
    Connection(ConnKey, ConnectionTask),
    Worker(WorkerTask),
}

pub(crate) struct AcceptedSocket {
    stream: TcpStream,
    peer: SocketAddr,
    binding: Arc<dyn ConnectionFactory>,
}

/// Operation raised on the owning worker's own thread.
pub(crate) enum LocalEvent {
    Write(WriteEvent),
    Execute(ConnKey, ConnectionTask),
    Close(CloseEvent),
    ImmediateData(ConnKey, BufferChain),
}

impl LocalEvent {
    fn key(&self) -> ConnKey {
        match self {
            LocalEvent::Write(event) => event.key,
            LocalEvent::Execute(key, _) => *key,
            LocalEvent::Close(event) => event.key,
            LocalEvent::ImmediateData(key, _) => *key,
        }
    }
}

fn push_local(event: LocalEvent) {
    LOCAL_EVENTS.with(|events| events.borrow_mut().push(event));
}

fn take_local() -> Vec<LocalEvent> {
    LOCAL_EVENTS.with(|events| std::mem::take(&mut *events.borrow_mut()))
}

fn take_local_for(key: ConnKey) -> Vec<LocalEvent> {
    LOCAL_EVENTS.with(|events| {
        let mut events = events.borrow_mut();
        let (mine, rest): (Vec<_>, Vec<_>) = events.drain(..).partition(|e| e.key() == key);
        *events = rest;
        mine
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Starting = 0,
    Running = 1,
    ShuttingDown = 2,
    Stopped = 3,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerState::Starting,
            1 => WorkerState::Running,
            2 => WorkerState::ShuttingDown,
            _ => WorkerState::Stopped,
        }
    }
}

pub(crate) struct WorkerShared {
    id: u64,
    pub(crate) index: usize,
    pub(crate) accept: SafeEventQueue<AcceptedSocket>,
    pub(crate) execute: SafeEventQueue<ExecuteEvent>,
    pub(crate) write: SafeEventQueue<WriteEvent>,
    pub(crate) flush: SafeEventQueue<ConnKey>,
    pub(crate) close: SafeEventQueue<CloseEvent>,
    shutdown: Notifier,
    shutdown_requested: AtomicBool,
    state: AtomicU8,
}

impl WorkerShared {
    pub(crate) fn new(index: usize) -> io::Result<Self> {
        Ok(Self {
            id: NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed),
            index,
            accept: SafeEventQueue::new()?,
            execute: SafeEventQueue::new()?,
            write: SafeEventQueue::new()?,
            flush: SafeEventQueue::new()?,
            close: SafeEventQueue::new()?,
            shutdown: Notifier::new()?,
            shutdown_requested: AtomicBool::new(false),
            state: AtomicU8::new(WorkerState::Starting as u8),
        })
    }

    pub(crate) fn register(&self, poll: &Poll) -> io::Result<()> {
        let registry = poll.registry();
        self.accept.register(registry, ACCEPT_TOKEN)?;
        self.execute.register(registry, EXECUTE_TOKEN)?;
        self.write.register(registry, WRITE_TOKEN)?;
        self.flush.register(registry, FLUSH_TOKEN)?;
        self.close.register(registry, CLOSE_TOKEN)?;
        self.shutdown.register(registry, SHUTDOWN_TOKEN)
    }

    pub(crate) fn is_owner_thread(&self) -> bool {
        CURRENT_WORKER.with(Cell::get) == self.id
    }

    pub(crate) fn request_shutdown(&self) {
        if !self.shutdown_requested.swap(true, Ordering::AcqRel) {
            self.shutdown.notify();
        }
    }

    pub(crate) fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Route a connection operation: straight to the local list on the owner
    /// thread, otherwise through the matching queue.
    pub(crate) fn dispatch(&self, event: LocalEvent) -> Result<()> {
        if self.is_owner_thread() {
            push_local(event);
            return Ok(());
        }
        let pushed = match event {
            LocalEvent::Write(event) => self.write.push(event).map_err(drop),
            LocalEvent::Execute(key, task) => self
                .execute
                .push(ExecuteEvent::Connection(key, task))
                .map_err(drop),
            LocalEvent::Close(event) => self.close.push(event).map_err(drop),
            LocalEvent::ImmediateData(..) => {
                return Err(Error::WrongThread {
                    operation: "send_immediate_data",
                });
            }
        };
        pushed.map_err(|()| Error::WorkerUnavailable)
    }

    fn close_queues(&self) -> usize {
        self.accept.close().len()
            + self.execute.close().len()
            + self.write.close().len()
            + self.flush.close().len()
            + self.close.close().len()
    }

    pub(crate) fn submit_task(&self, task: WorkerTask) -> Result<()> {
        self.execute
            .push(ExecuteEvent::Worker(task))
            .map_err(|_| Error::WorkerUnavailable)
    }
}

pub(crate) struct Balancer {
    workers: Vec<Arc<WorkerShared>>,
    next: AtomicUsize,
}

impl Balancer {
    pub(crate) fn new(workers: Vec<Arc<WorkerShared>>) -> Self {
        assert!(!workers.is_empty(), "balancer needs at least one worker");
        Self {
            workers,
            next: AtomicUsize::new(0),
        }
    }

    pub(crate) fn next_worker(&self) -> &Arc<WorkerShared> {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        &self.workers[n % self.workers.len()]
    }

    pub(crate) fn workers(&self) -> &[Arc<WorkerShared>] {
        &self.workers
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ListenerKey {
    slot: usize,
    generation: u64,
}

struct ListenerEntry {
    generation: u64,
    listener: TcpListener,
    local_addr: SocketAddr,
    binding: Arc<dyn ConnectionFactory>,
}

struct ConnectionEntry {
    generation: u64,
    /// Taken out while the connection is being serviced.
    conn: Option<Box<AcceptedConnection>>,
}

enum Registration {
    Listener(ListenerEntry),
    Connection(ConnectionEntry),
}

/// Readiness copied out of `Events` so handlers can borrow the worker.
#[derive(Debug, Clone, Copy)]
struct Readiness {
    token: Token,
    readable: bool,
    writable: bool,
    failed: bool,
}

impl From<&Event> for Readiness {
    fn from(event: &Event) -> Self {
        Self {
            token: event.token(),
            readable: event.is_readable() || event.is_read_closed(),
            writable: event.is_writable() || event.is_write_closed(),
            failed: event.is_error(),
        }
    }
}

/// Counts the latch down once the worker (and its multiplexer) is gone.
struct StopGuard {
    shared: Arc<WorkerShared>,
    latch: Arc<StopLatch>,
}

impl Drop for StopGuard {
    fn drop(&mut self) {
        // no-op after a normal teardown; after a panic, refuses handoffs
        let dropped = self.shared.close_queues();
        if dropped > 0 {
            warn!(worker = self.shared.index, dropped, "worker exited with queued events");
        }
        self.shared.set_state(WorkerState::Stopped);
        self.latch.count_down();
        info!(worker = self.shared.index, "socket worker stopped");
    }
}

pub(crate) struct Worker {
    shared: Arc<WorkerShared>,
    balancer: Arc<Balancer>,
    poll: Poll,
    events: Events,
    registrations: Slab<Registration>,
    next_generation: u64,
    pending_reads: Vec<ConnKey>,
    pool: SharedBufferPool,
    config: ServerConfig,
    latch: Arc<StopLatch>,
}

impl Worker {
    pub(crate) fn new(
        shared: Arc<WorkerShared>,
        poll: Poll,
        balancer: Arc<Balancer>,
        pool: SharedBufferPool,
        config: ServerConfig,
        latch: Arc<StopLatch>,
    ) -> Self {
        Self {
            shared,
            balancer,
            poll,
            events: Events::with_capacity(config.events_capacity),
            registrations: Slab::new(),
            next_generation: 0,
            pending_reads: Vec::new(),
            pool,
            config,
            latch,
        }
    }

    pub(crate) fn run(self) {
        CURRENT_WORKER.with(|current| current.set(self.shared.id));
        let _guard = StopGuard {
            shared: Arc::clone(&self.shared),
            latch: Arc::clone(&self.latch),
        };
        // consumes the worker so the multiplexer closes before the guard fires
        self.run_loop();
        CURRENT_WORKER.with(|current| current.set(0));
    }

    fn run_loop(mut self) {
        self.shared.set_state(WorkerState::Running);
        info!(worker = self.shared.index, "socket worker started");

        let mut ready: Vec<Readiness> = Vec::with_capacity(self.config.events_capacity);
        while !self.shared.shutdown_requested.load(Ordering::Acquire) {
            let timeout = if self.pending_reads.is_empty() {
                self.config.select_timeout
            } else {
                std::time::Duration::ZERO
            };
            if let Err(err) = self.poll.poll(&mut self.events, Some(timeout)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(worker = self.shared.index, error = %err, "readiness wait failed, stopping worker");
                break;
            }

            ready.extend(self.events.iter().map(Readiness::from));
            for readiness in ready.drain(..) {
                self.dispatch(readiness);
                self.drain_local();
            }
            self.service_pending_reads();
            self.drain_local();
        }

        self.shared.set_state(WorkerState::ShuttingDown);
        self.teardown();
    }

    fn dispatch(&mut self, readiness: Readiness) {
        match readiness.token {
            ACCEPT_TOKEN => {
                for socket in self.shared.accept.take() {
                    self.register_connection(socket);
                }
            }
            EXECUTE_TOKEN => {
                for event in self.shared.execute.take() {
                    match event {
                        ExecuteEvent::Connection(key, task) => {
                            self.with_connection(key, |worker, conn| {
                                conn.run_task(worker.poll.registry(), task);
                                Ok(())
                            });
                        }
                        ExecuteEvent::Worker(task) => task(self),
                    }
                }
            }
            WRITE_TOKEN => {
                for event in self.shared.write.take() {
                    self.apply_remote_write(event);
                }
            }
            FLUSH_TOKEN => {
                for key in self.shared.flush.take() {
                    self.with_connection(key, |worker, conn| {
                        conn.core.flush_scheduled = false;
                        conn.core.flush(worker.poll.registry())
                    });
                }
            }
            CLOSE_TOKEN => {
                for event in self.shared.close.take() {
                    self.with_connection(event.key, |_, conn| {
                        conn.core.request_close(event.cause);
                        Ok(())
                    });
                }
            }
            SHUTDOWN_TOKEN => {
                self.shared.shutdown.drain();
            }
            Token(token) => self.on_socket_ready(token - FIRST_SLOT_TOKEN, readiness),
        }
    }

    fn on_socket_ready(&mut self, slot: usize, readiness: Readiness) {
        let key = match self.registrations.get(slot) {
            Some(Registration::Listener(_)) => {
                self.accept_all(slot);
                return;
            }
            Some(Registration::Connection(entry)) => ConnKey {
                slot,
                generation: entry.generation,
            },
            None => return,
        };
        self.with_connection(key, |worker, conn| {
            if readiness.writable || readiness.failed {
                conn.core.on_writable(worker.poll.registry())?;
            }
            if readiness.readable || readiness.failed {
                worker.read_cycle(key, conn)?;
            }
            Ok(())
        });
    }

    /// Run `f` against the connection, then apply whatever it raised locally
    /// and settle the outcome: put the connection back or tear it down.
    fn with_connection<F>(&mut self, key: ConnKey, f: F)
    where
        F: FnOnce(&mut Self, &mut AcceptedConnection) -> io::Result<()>,
    {
        let Some(mut conn) = self.take_connection(key) else {
            trace!(slot = key.slot, "event for a closed connection");
            return;
        };
        let result = catch_servicer_panic(|| {
            f(self, &mut conn).and_then(|()| self.apply_local_for(key, &mut conn))
        });
        match result {
            Err(err) => self.terminate(key, conn, Some(err)),
            Ok(()) if conn.core.close_requested() => {
                let cause = conn.core.take_close_cause();
                self.terminate(key, conn, cause);
            }
            Ok(()) => self.put_back(key, conn),
        }
    }

    fn take_connection(&mut self, key: ConnKey) -> Option<Box<AcceptedConnection>> {
        match self.registrations.get_mut(key.slot) {
            Some(Registration::Connection(entry)) if entry.generation == key.generation => {
                entry.conn.take()
            }
            _ => None,
        }
    }

    fn put_back(&mut self, key: ConnKey, conn: Box<AcceptedConnection>) {
        if let Some(Registration::Connection(entry)) = self.registrations.get_mut(key.slot) {
            entry.conn = Some(conn);
        }
    }

    fn apply_local_for(&mut self, key: ConnKey, conn: &mut AcceptedConnection) -> io::Result<()> {
        loop {
            let events = take_local_for(key);
            if events.is_empty() {
                return Ok(());
            }
            for event in events {
                self.apply_local(conn, event)?;
            }
        }
    }

    fn apply_local(&mut self, conn: &mut AcceptedConnection, event: LocalEvent) -> io::Result<()> {
        let registry = self.poll.registry();
        match event {
            LocalEvent::Write(WriteEvent {
                seq, header, body, ..
            }) => {
                conn.core.attach_response(seq, header, body);
                conn.core.process_responses(registry)?;
                // a read in progress flushes once its cycle ends
                if !conn.core.in_read {
                    conn.core.flush(registry)?;
                }
                Ok(())
            }
            LocalEvent::Execute(_, task) => {
                conn.run_task(registry, task);
                Ok(())
            }
            LocalEvent::Close(CloseEvent { cause, .. }) => {
                conn.core.request_close(cause);
                Ok(())
            }
            LocalEvent::ImmediateData(_, data) => conn.core.send_immediate_data(registry, data),
        }
    }

    fn drain_local(&mut self) {
        loop {
            let events = take_local();
            if events.is_empty() {
                return;
            }
            for event in events {
                let key = event.key();
                self.with_connection(key, |worker, conn| worker.apply_local(conn, event));
            }
        }
    }

    /// Response written from another thread: compact it now, flush in bulk
    /// once the write queue has been drained.
    fn apply_remote_write(&mut self, event: WriteEvent) {
        let key = event.key;
        self.with_connection(key, |worker, conn| {
            let registry = worker.poll.registry();
            conn.core.attach_response(event.seq, event.header, event.body);
            conn.core.process_responses(registry)?;
            if conn.core.has_outbound() && !conn.core.flush_scheduled {
                conn.core.flush_scheduled = true;
                if worker.shared.flush.push(key).is_err() {
                    conn.core.flush_scheduled = false;
                    conn.core.flush(registry)?;
                }
            }
            Ok(())
        });
    }

    /// Read up to `max_reads_per_cycle` times, servicing each read. Writes
    /// raised during the cycle are compacted as they arrive and flushed once
    /// at the end.
    fn read_cycle(&mut self, key: ConnKey, conn: &mut AcceptedConnection) -> io::Result<()> {
        conn.core.in_read = true;
        let result = self.read_loop(key, conn);
        conn.core.in_read = false;
        result?;
        let registry = self.poll.registry();
        conn.core.process_responses(registry)?;
        conn.core.flush(registry)
    }

    fn read_loop(&mut self, key: ConnKey, conn: &mut AcceptedConnection) -> io::Result<()> {
        for _ in 0..self.config.max_reads_per_cycle {
            if !conn.core.is_reading() {
                return Ok(());
            }
            match conn.core.read_once()? {
                None => return Ok(()),
                Some((0, _)) => {
                    conn.core.request_close(None);
                    return Ok(());
                }
                Some((bytes_read, is_new_buffer)) => {
                    conn.service_read(self.poll.registry(), bytes_read, is_new_buffer)?;
                    self.apply_local_for(key, conn)?;
                }
            }
        }
        // budget spent with data possibly left; readiness will not re-fire
        if conn.core.is_reading() && !self.pending_reads.contains(&key) {
            self.pending_reads.push(key);
        }
        Ok(())
    }

    fn service_pending_reads(&mut self) {
        for key in std::mem::take(&mut self.pending_reads) {
            self.with_connection(key, |worker, conn| worker.read_cycle(key, conn));
        }
    }

    fn terminate(&mut self, key: ConnKey, mut conn: Box<AcceptedConnection>, cause: Option<io::Error>) {
        let peer = conn.core.handle().peer_addr();
        match &cause {
            None => debug!(worker = self.shared.index, %peer, "connection closed"),
            Some(err) if is_expected_disconnect(err) => {
                debug!(worker = self.shared.index, %peer, error = %err, "connection dropped")
            }
            Some(err) => {
                warn!(worker = self.shared.index, %peer, error = %err, "connection failed")
            }
        }
        self.release_connection(&mut conn);
        self.registrations.remove(key.slot);
        self.pending_reads.retain(|pending| *pending != key);
        metrics::inc_connections_closed();
    }

    fn release_connection(&self, conn: &mut AcceptedConnection) {
        let registry = self.poll.registry();
        if let Err(err) = catch_servicer_panic(|| {
            conn.release(registry);
            Ok(())
        }) {
            warn!(worker = self.shared.index, error = %err, "connection release failed");
        }
    }

    fn accept_all(&mut self, slot: usize) {
        loop {
            let Some(Registration::Listener(entry)) = self.registrations.get(slot) else {
                return;
            };
            match entry.listener.accept() {
                Ok((stream, peer)) => {
                    let binding = Arc::clone(&entry.binding);
                    if let Err(err) = catch_servicer_panic(|| {
                        configure_accepted(&stream, binding.accepted_options(), &self.config)
                    }) {
                        debug!(%peer, error = %err, "failed to configure accepted socket");
                        continue;
                    }
                    metrics::inc_connections_accepted();
                    let socket = AcceptedSocket {
                        stream,
                        peer,
                        binding,
                    };
                    let target = Arc::clone(self.balancer.next_worker());
                    if target.id == self.shared.id {
                        self.register_connection(socket);
                    } else if let Err(socket) = target.accept.push(socket) {
                        debug!(peer = %socket.peer, worker = target.index, "worker stopped, servicing connection here");
                        self.register_connection(socket);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                    ) => {}
                Err(e) => {
                    warn!(worker = self.shared.index, error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    fn register_connection(&mut self, socket: AcceptedSocket) {
        let AcceptedSocket {
            stream,
            peer,
            binding,
        } = socket;
        let entry = self.registrations.vacant_entry();
        let slot = entry.key();
        let generation = self.next_generation;
        self.next_generation += 1;
        let key = ConnKey { slot, generation };

        let handle = ConnectionHandle::new(Arc::clone(&self.shared), key, peer, Arc::clone(&self.pool));
        let mut servicer = match catch_servicer_panic(|| Ok(binding.create_servicer(&handle))) {
            Ok(servicer) => servicer,
            Err(err) => {
                warn!(%peer, error = %err, "failed to create connection servicer");
                handle.mark_closed();
                return;
            }
        };
        let mut core = ConnectionCore::new(
            stream,
            Token(slot + FIRST_SLOT_TOKEN),
            handle,
            Arc::clone(&self.pool),
            self.config.max_active_requests,
        );
        if let Err(err) = core.register(self.poll.registry()) {
            warn!(%peer, error = %err, "failed to register connection");
            servicer.release();
            core.release(self.poll.registry());
            return;
        }
        entry.insert(Registration::Connection(ConnectionEntry {
            generation,
            conn: Some(Box::new(AcceptedConnection::new(core, servicer))),
        }));
        debug!(worker = self.shared.index, %peer, slot, "connection accepted");
    }

    pub(crate) fn add_listener(
        &mut self,
        mut listener: TcpListener,
        binding: Arc<dyn ConnectionFactory>,
    ) -> io::Result<ListenerKey> {
        let local_addr = listener.local_addr()?;
        let entry = self.registrations.vacant_entry();
        let slot = entry.key();
        let generation = self.next_generation;
        self.next_generation += 1;
        self.poll.registry().register(
            &mut listener,
            Token(slot + FIRST_SLOT_TOKEN),
            Interest::READABLE,
        )?;
        entry.insert(Registration::Listener(ListenerEntry {
            generation,
            listener,
            local_addr,
            binding,
        }));
        info!(worker = self.shared.index, %local_addr, "listener registered");
        Ok(ListenerKey { slot, generation })
    }

    pub(crate) fn remove_listener(&mut self, key: ListenerKey) {
        let matches = matches!(
            self.registrations.get(key.slot),
            Some(Registration::Listener(entry)) if entry.generation == key.generation
        );
        if !matches {
            return;
        }
        if let Registration::Listener(mut entry) = self.registrations.remove(key.slot) {
            let _ = self.poll.registry().deregister(&mut entry.listener);
            info!(worker = self.shared.index, local_addr = %entry.local_addr, "listener closed");
        }
    }

    fn teardown(&mut self) {
        let dropped = self.shared.close_queues();
        if dropped > 0 {
            debug!(worker = self.shared.index, dropped, "discarded queued events on shutdown");
        }

        let registrations: Vec<Registration> = self.registrations.drain().collect();
        let mut connections = 0usize;
        for registration in registrations {
            match registration {
                Registration::Listener(mut entry) => {
                    let _ = self.poll.registry().deregister(&mut entry.listener);
                }
                Registration::Connection(entry) => {
                    if let Some(mut conn) = entry.conn {
                        self.release_connection(&mut conn);
                        connections += 1;
                        metrics::inc_connections_closed();
                    }
                }
            }
        }
        self.pending_reads.clear();
        drop(take_local());
        info!(worker = self.shared.index, connections, "socket worker shutting down");
    }
}

fn configure_accepted(
    stream: &TcpStream,
    options: &AcceptedSocketOptions,
    config: &ServerConfig,
) -> io::Result<()> {
    stream.set_nodelay(options.no_delay)?;
    let socket = SockRef::from(stream);
    if let Some(size) = options.receive_buffer_size.or(config.receive_buffer_size) {
        socket.set_recv_buffer_size(size)?;
    }
    if let Some(size) = options.send_buffer_size.or(config.send_buffer_size) {
        socket.set_send_buffer_size(size)?;
    }
    if let Some(decorator) = &options.decorator {
        decorator.decorate(SockRef::from(stream))?;
    }
    Ok(())
}
