//! Per-connection state: the request pipeline, response compaction, read
//! backpressure and the handles through which other threads reach a
//! connection.
//!
//! Everything in `ConnectionCore` is owned by one worker thread. Other
//! threads only ever hold a `ConnectionHandle` (or a `ResponseWriter`), whose
//! operations are turned into events for the owning worker.

use std::collections::VecDeque;
use std::io;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};

use crate::buffer_pool::{PooledBytes, SharedBufferPool};
use crate::config::AcceptedSocketOptions;
use crate::error::{Error, Result, catch_servicer_panic};
use crate::metrics;
use crate::servicer::{
    CancelHandle, HeaderWriter, RequestServicer, RequestServicerFactory, SocketServicer,
    SocketServicerFactory,
};
use crate::stream_buffer::{BufferChain, OutboundChain, StreamBuffer, WriteProgress, drain_to_wire};
use crate::worker::{CloseEvent, ConnectionTask, LocalEvent, WorkerShared, WriteEvent};

/// Slab slot plus the generation it was filled in, so events addressed to a
/// closed connection never reach a newer one reusing the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ConnKey {
    pub(crate) slot: usize,
    pub(crate) generation: u64,
}

struct HandleInner {
    worker: Arc<WorkerShared>,
    key: ConnKey,
    peer: SocketAddr,
    pool: SharedBufferPool,
    closed: AtomicBool,
    close_requested: AtomicBool,
}

/// Thread-safe reference to an accepted connection.
///
/// Operations invoked on the connection's own worker thread run right after
/// the current dispatch; from any other thread they are queued on the worker
/// and run in submission order.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

impl ConnectionHandle {
    pub(crate) fn new(
        worker: Arc<WorkerShared>,
        key: ConnKey,
        peer: SocketAddr,
        pool: SharedBufferPool,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                worker,
                key,
                peer,
                pool,
                closed: AtomicBool::new(false),
                close_requested: AtomicBool::new(false),
            }),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    pub fn worker_index(&self) -> usize {
        self.inner.worker.index
    }

    pub fn pool(&self) -> &SharedBufferPool {
        &self.inner.pool
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn is_owner_thread(&self) -> bool {
        self.inner.worker.is_owner_thread()
    }

    pub fn execute<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce(&mut ConnectionControl<'_>) + Send + 'static,
    {
        self.submit(LocalEvent::Execute(self.inner.key, Box::new(task) as ConnectionTask))
    }

    /// Terminate the connection. Only the first call has any effect.
    pub fn close(&self, cause: Option<io::Error>) {
        if self.is_closed() || self.inner.close_requested.swap(true, Ordering::AcqRel) {
            return;
        }
        let event = LocalEvent::Close(CloseEvent {
            key: self.inner.key,
            cause,
        });
        // a stopped worker has already torn the connection down
        let _ = self.submit(event);
    }

    /// Write `data` ahead of any not-yet-compacted responses.
    ///
    /// Owner thread only; elsewhere use `execute` and
    /// `ConnectionControl::send_immediate_data`.
    pub fn send_immediate_data(&self, data: BufferChain) -> Result<()> {
        if !self.is_owner_thread() {
            return Err(Error::WrongThread {
                operation: "send_immediate_data",
            });
        }
        self.submit(LocalEvent::ImmediateData(self.inner.key, data))
    }

    pub(crate) fn submit_write(
        &self,
        seq: u64,
        header: Option<HeaderWriter>,
        body: BufferChain,
    ) -> Result<()> {
        self.submit(LocalEvent::Write(WriteEvent {
            key: self.inner.key,
            seq,
            header,
            body,
        }))
    }

    fn submit(&self, event: LocalEvent) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        self.inner.worker.dispatch(event)
    }

    pub(crate) fn mark_closed(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("worker", &self.inner.worker.index)
            .field("slot", &self.inner.key.slot)
            .field("peer", &self.inner.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Answers exactly one request.
///
/// May be moved to and written from any thread. Dropping it without writing
/// closes the connection, since later responses could never be sent.
pub struct ResponseWriter {
    handle: ConnectionHandle,
    seq: u64,
    written: bool,
}

impl ResponseWriter {
    fn new(handle: ConnectionHandle, seq: u64) -> Self {
        Self {
            handle,
            seq,
            written: false,
        }
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// Complete the request. `header` runs on the worker, writing into the
    /// outbound chain just before `body` is appended.
    ///
    /// Fails with `ConnectionClosed` if the connection is gone; the body is
    /// released either way.
    pub fn write(mut self, header: Option<HeaderWriter>, body: BufferChain) -> Result<()> {
        self.written = true;
        self.handle.submit_write(self.seq, header, body)
    }

    pub fn write_bytes(self, body: &[u8]) -> Result<()> {
        let chain = BufferChain::copy_from(self.handle.pool(), body);
        self.write(None, chain)
    }
}

impl Drop for ResponseWriter {
    fn drop(&mut self) {
        if !self.written {
            self.handle.close(Some(io::Error::other(
                "request dropped without a response",
            )));
        }
    }
}

struct SocketRequest {
    seq: u64,
    request_buffers: BufferChain,
    cancel: Option<CancelHandle>,
    response: Option<(Option<HeaderWriter>, BufferChain)>,
}

#[derive(Debug, Clone, Copy)]
struct WantedInterest {
    read: bool,
    write: bool,
}

impl WantedInterest {
    fn as_interest(self) -> Option<Interest> {
        match (self.read, self.write) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

/// Connection state touched only by the owning worker.
pub(crate) struct ConnectionCore {
    stream: TcpStream,
    token: Token,
    handle: ConnectionHandle,
    pool: SharedBufferPool,
    read_buffer: Option<PooledBytes>,
    pipeline: VecDeque<SocketRequest>,
    next_seq: u64,
    active_requests: usize,
    max_active_requests: usize,
    outbound: OutboundChain,
    write_queue: VecDeque<StreamBuffer>,
    wanted: WantedInterest,
    registered: Option<Interest>,
    pub(crate) in_read: bool,
    pub(crate) flush_scheduled: bool,
    close_request: Option<Option<io::Error>>,
}

impl ConnectionCore {
    pub(crate) fn new(
        stream: TcpStream,
        token: Token,
        handle: ConnectionHandle,
        pool: SharedBufferPool,
        max_active_requests: usize,
    ) -> Self {
        Self {
            stream,
            token,
            handle,
            outbound: OutboundChain::new(Arc::clone(&pool)),
            pool,
            read_buffer: None,
            pipeline: VecDeque::new(),
            next_seq: 0,
            active_requests: 0,
            max_active_requests: max_active_requests.max(1),
            write_queue: VecDeque::new(),
            wanted: WantedInterest {
                read: true,
                write: false,
            },
            registered: None,
            in_read: false,
            flush_scheduled: false,
            close_request: None,
        }
    }

    fn assert_owner(&self, operation: &'static str) {
        debug_assert!(
            self.handle.is_owner_thread(),
            "{operation} called off the connection's worker thread"
        );
    }

    pub(crate) fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub(crate) fn is_reading(&self) -> bool {
        self.wanted.read && self.close_request.is_none()
    }

    pub(crate) fn is_read_paused(&self) -> bool {
        !self.wanted.read
    }

    pub(crate) fn active_requests(&self) -> usize {
        self.active_requests
    }

    pub(crate) fn close_requested(&self) -> bool {
        self.close_request.is_some()
    }

    pub(crate) fn request_close(&mut self, cause: Option<io::Error>) {
        if self.close_request.is_none() {
            self.close_request = Some(cause);
        }
    }

    pub(crate) fn take_close_cause(&mut self) -> Option<io::Error> {
        self.close_request.take().flatten()
    }

    pub(crate) fn register(&mut self, registry: &Registry) -> io::Result<()> {
        self.update_registration(registry)
    }

    fn update_registration(&mut self, registry: &Registry) -> io::Result<()> {
        let wanted = self.wanted.as_interest();
        if wanted == self.registered {
            return Ok(());
        }
        match (self.registered, wanted) {
            (_, None) => registry.deregister(&mut self.stream)?,
            (None, Some(interest)) => registry.register(&mut self.stream, self.token, interest)?,
            (Some(_), Some(interest)) => {
                registry.reregister(&mut self.stream, self.token, interest)?
            }
        }
        self.registered = wanted;
        Ok(())
    }

    fn set_read_interest(&mut self, registry: &Registry, read: bool) -> io::Result<()> {
        if self.wanted.read == read {
            return Ok(());
        }
        self.wanted.read = read;
        self.update_registration(registry)
    }

    fn set_write_interest(&mut self, registry: &Registry, write: bool) -> io::Result<()> {
        if self.wanted.write == write {
            return Ok(());
        }
        self.wanted.write = write;
        self.update_registration(registry)
    }

    /// `Ok(None)` when nothing is readable right now; EOF is `Some((0, _))`.
    pub(crate) fn read_once(&mut self) -> io::Result<Option<(usize, bool)>> {
        use std::io::Read;

        if self.read_buffer.as_ref().is_none_or(PooledBytes::is_full) {
            self.read_buffer = Some(PooledBytes::acquire_or_detached(&self.pool));
        }
        let Some(buffer) = self.read_buffer.as_mut() else {
            return Ok(None);
        };
        let is_new_buffer = buffer.is_empty();
        loop {
            match self.stream.read(buffer.spare_mut()) {
                Ok(n) => {
                    buffer.commit(n);
                    return Ok(Some((n, is_new_buffer)));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    fn begin_request(&mut self, registry: &Registry, request_buffers: BufferChain) -> io::Result<u64> {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pipeline.push_back(SocketRequest {
            seq,
            request_buffers,
            cancel: None,
            response: None,
        });
        self.active_requests += 1;
        if self.active_requests >= self.max_active_requests && self.wanted.read {
            metrics::inc_read_paused();
            self.set_read_interest(registry, false)?;
        }
        Ok(seq)
    }

    fn set_cancel(&mut self, seq: u64, cancel: Option<CancelHandle>) {
        if let Some(request) = self.request_mut(seq) {
            // a response already on record makes cancellation moot
            if request.response.is_none() {
                request.cancel = cancel;
            }
        }
    }

    fn request_mut(&mut self, seq: u64) -> Option<&mut SocketRequest> {
        let head = self.pipeline.front()?.seq;
        let index = seq.checked_sub(head)? as usize;
        self.pipeline.get_mut(index)
    }

    pub(crate) fn attach_response(
        &mut self,
        seq: u64,
        header: Option<HeaderWriter>,
        body: BufferChain,
    ) {
        match self.request_mut(seq) {
            Some(request) if request.response.is_none() => {
                request.cancel = None;
                request.response = Some((header, body));
            }
            _ => tracing::debug!(seq, "discarding response for unknown request"),
        }
    }

    /// Compact every answered request at the head of the pipeline into the
    /// outbound chain, in request order.
    pub(crate) fn process_responses(&mut self, registry: &Registry) -> io::Result<()> {
        self.assert_owner("process_responses");
        while self
            .pipeline
            .front()
            .is_some_and(|request| request.response.is_some())
        {
            let Some(request) = self.pipeline.pop_front() else {
                break;
            };
            let SocketRequest {
                request_buffers,
                response,
                ..
            } = request;
            request_buffers.release();
            if let Some((header, body)) = response {
                if let Some(header) = header {
                    header(&mut self.outbound);
                }
                self.outbound.append_chain(body);
            }
            self.active_requests -= 1;
            metrics::inc_responses_written();
        }
        if !self.wanted.read && self.active_requests < self.max_active_requests {
            self.set_read_interest(registry, true)?;
        }
        Ok(())
    }

    pub(crate) fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    pub(crate) fn flush(&mut self, registry: &Registry) -> io::Result<()> {
        self.write_queue.extend(self.outbound.take());
        if self.wanted.write {
            return Ok(());
        }
        self.write_pending(registry)
    }

    pub(crate) fn on_writable(&mut self, registry: &Registry) -> io::Result<()> {
        self.write_queue.extend(self.outbound.take());
        self.write_pending(registry)
    }

    fn write_pending(&mut self, registry: &Registry) -> io::Result<()> {
        self.assert_owner("write");
        match drain_to_wire(&mut self.write_queue, &mut self.stream)? {
            WriteProgress::Complete => self.set_write_interest(registry, false),
            WriteProgress::Pending => self.set_write_interest(registry, true),
        }
    }

    /// Write `data` after already-compacted responses but ahead of any
    /// request still awaiting its response.
    pub(crate) fn send_immediate_data(
        &mut self,
        registry: &Registry,
        data: BufferChain,
    ) -> io::Result<()> {
        self.assert_owner("send_immediate_data");
        if self.close_request.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection is closing",
            ));
        }
        self.write_queue.extend(self.outbound.take());
        self.write_queue.extend(data);
        if self.wanted.write {
            return Ok(());
        }
        self.write_pending(registry)
    }

    pub(crate) fn release(&mut self, registry: &Registry) {
        self.handle.mark_closed();
        if self.registered.take().is_some() {
            let _ = registry.deregister(&mut self.stream);
        }
        for mut request in self.pipeline.drain(..) {
            if request.response.is_none() {
                if let Some(cancel) = request.cancel.take() {
                    let cancelled = catch_servicer_panic(|| {
                        cancel();
                        Ok(())
                    });
                    if let Err(err) = cancelled {
                        tracing::warn!(seq = request.seq, error = %err, "cancel handle failed");
                    }
                }
            }
        }
        self.read_buffer = None;
        self.write_queue.clear();
        drop(self.outbound.take());
    }
}

pub struct SocketContext<'a, R> {
    core: &'a mut ConnectionCore,
    registry: &'a Registry,
    requests: &'a mut dyn RequestServicer<R>,
}

impl<R> SocketContext<'_, R> {
    /// Register a framed request and hand it to the request servicer.
    ///
    /// `request_buffers` are held until the request's response is compacted.
    pub fn handle_request(&mut self, request: R, request_buffers: BufferChain) -> Result<()> {
        self.core.assert_owner("handle_request");
        if self.core.close_requested() {
            return Err(Error::ConnectionClosed);
        }
        let seq = self.core.begin_request(self.registry, request_buffers)?;
        let writer = ResponseWriter::new(self.core.handle.clone(), seq);
        let cancel = self.requests.service(request, writer);
        self.core.set_cancel(seq, cancel);
        metrics::inc_requests_serviced();
        Ok(())
    }

    pub fn send_immediate_data(&mut self, data: BufferChain) -> io::Result<()> {
        self.core.send_immediate_data(self.registry, data)
    }

    pub fn close_connection(&mut self, cause: Option<io::Error>) {
        self.core.request_close(cause);
    }

    pub fn handle(&self) -> &ConnectionHandle {
        self.core.handle()
    }

    pub fn pool(&self) -> &SharedBufferPool {
        &self.core.pool
    }

    pub fn active_requests(&self) -> usize {
        self.core.active_requests()
    }

    pub fn is_read_paused(&self) -> bool {
        self.core.is_read_paused()
    }
}

pub struct ConnectionControl<'a> {
    core: &'a mut ConnectionCore,
    registry: &'a Registry,
}

impl<'a> ConnectionControl<'a> {
    pub(crate) fn new(core: &'a mut ConnectionCore, registry: &'a Registry) -> Self {
        Self { core, registry }
    }

    pub fn send_immediate_data(&mut self, data: BufferChain) -> io::Result<()> {
        self.core.send_immediate_data(self.registry, data)
    }

    pub fn close_connection(&mut self, cause: Option<io::Error>) {
        self.core.request_close(cause);
    }

    pub fn handle(&self) -> &ConnectionHandle {
        self.core.handle()
    }

    pub fn active_requests(&self) -> usize {
        self.core.active_requests()
    }

    pub fn is_read_paused(&self) -> bool {
        self.core.is_read_paused()
    }
}

/// Servicers for one connection with the request type erased.
pub(crate) trait ConnectionServicer: Send {
    fn service_read(
        &mut self,
        core: &mut ConnectionCore,
        registry: &Registry,
        bytes_read: usize,
        is_new_buffer: bool,
    ) -> io::Result<()>;

    fn release(&mut self);
}

struct Servicers<R> {
    socket: Box<dyn SocketServicer<R>>,
    requests: Box<dyn RequestServicer<R>>,
}

impl<R: 'static> ConnectionServicer for Servicers<R> {
    fn service_read(
        &mut self,
        core: &mut ConnectionCore,
        registry: &Registry,
        bytes_read: usize,
        is_new_buffer: bool,
    ) -> io::Result<()> {
        let Some(buffer) = core.read_buffer.take() else {
            return Ok(());
        };
        let Servicers { socket, requests } = self;
        let result = {
            let mut ctx = SocketContext {
                core: &mut *core,
                registry,
                requests: requests.as_mut(),
            };
            socket.service_read(&mut ctx, &buffer, bytes_read, is_new_buffer)
        };
        core.read_buffer = Some(buffer);
        result
    }

    fn release(&mut self) {
        self.socket.release();
        self.requests.release();
    }
}

pub(crate) trait ConnectionFactory: Send + Sync {
    fn accepted_options(&self) -> &AcceptedSocketOptions;

    fn create_servicer(&self, handle: &ConnectionHandle) -> Box<dyn ConnectionServicer>;
}

pub(crate) struct Binding<R, S, Q> {
    socket_factory: S,
    request_factory: Q,
    accepted: AcceptedSocketOptions,
    _request: PhantomData<fn() -> R>,
}

impl<R, S, Q> Binding<R, S, Q> {
    pub(crate) fn new(socket_factory: S, request_factory: Q, accepted: AcceptedSocketOptions) -> Self {
        Self {
            socket_factory,
            request_factory,
            accepted,
            _request: PhantomData,
        }
    }
}

impl<R, S, Q> ConnectionFactory for Binding<R, S, Q>
where
    R: 'static,
    S: SocketServicerFactory<R>,
    Q: RequestServicerFactory<R>,
{
    fn accepted_options(&self) -> &AcceptedSocketOptions {
        &self.accepted
    }

    fn create_servicer(&self, handle: &ConnectionHandle) -> Box<dyn ConnectionServicer> {
        Box::new(Servicers {
            socket: self.socket_factory.create(handle),
            requests: self.request_factory.create(handle),
        })
    }
}

pub(crate) struct AcceptedConnection {
    pub(crate) core: ConnectionCore,
    servicer: Box<dyn ConnectionServicer>,
}

impl AcceptedConnection {
    pub(crate) fn new(core: ConnectionCore, servicer: Box<dyn ConnectionServicer>) -> Self {
        Self { core, servicer }
    }

    pub(crate) fn service_read(
        &mut self,
        registry: &Registry,
        bytes_read: usize,
        is_new_buffer: bool,
    ) -> io::Result<()> {
        self.servicer
            .service_read(&mut self.core, registry, bytes_read, is_new_buffer)
    }

    pub(crate) fn run_task(&mut self, registry: &Registry, task: ConnectionTask) {
        let mut control = ConnectionControl::new(&mut self.core, registry);
        task(&mut control);
    }

    pub(crate) fn release(&mut self, registry: &Registry) {
        self.core.release(registry);
        let released = catch_servicer_panic(|| {
            self.servicer.release();
            Ok(())
        });
        if let Err(err) = released {
            tracing::warn!(error = %err, "servicer release failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wanted_interest_maps_to_registration() {
        let none = WantedInterest {
            read: false,
            write: false,
        };
        assert_eq!(none.as_interest(), None);
        let both = WantedInterest {
            read: true,
            write: true,
        };
        let interest = both.as_interest().expect("interest");
        assert!(interest.is_readable() && interest.is_writable());
        let write_only = WantedInterest {
            read: false,
            write: true,
        };
        let interest = write_only.as_interest().expect("interest");
        assert!(interest.is_writable() && !interest.is_readable());
    }
}
