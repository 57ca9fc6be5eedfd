#![allow(dead_code)]

use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use sockloop::protocol;
use sockloop::{
    BufferChain, CancelHandle, ConnectionHandle, PooledBytes, RequestServicer,
    RequestServicerFactory, ResponseWriter, ServerConfig, ServerSocketOptions, SocketContext,
    SocketServicer, SocketServicerFactory,
};

pub const WAIT: Duration = Duration::from_secs(10);

pub fn test_config(workers: usize) -> ServerConfig {
    ServerConfig {
        workers,
        select_timeout: Duration::from_millis(50),
        shutdown_timeout: Duration::from_secs(5),
        ..ServerConfig::default()
    }
}

pub fn localhost() -> ServerSocketOptions {
    ServerSocketOptions {
        host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        ..Default::default()
    }
}

pub fn connect(port: u16) -> TcpStream {
    let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();
    stream.set_read_timeout(Some(WAIT)).unwrap();
    stream.set_nodelay(true).unwrap();
    stream
}

pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    protocol::encode_frame(&mut buf, payload);
    buf
}

pub fn send_frames<P: AsRef<[u8]>>(stream: &mut TcpStream, payloads: &[P]) {
    let mut buf = Vec::new();
    for payload in payloads {
        protocol::encode_frame(&mut buf, payload.as_ref());
    }
    stream.write_all(&buf).unwrap();
}

pub fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
    let mut header = [0u8; protocol::HEADER_LEN];
    stream.read_exact(&mut header).unwrap();
    let mut payload = vec![0u8; u32::from_le_bytes(header) as usize];
    stream.read_exact(&mut payload).unwrap();
    payload
}

/// True once the peer has closed: a read returns EOF or a reset.
pub fn reads_eof(stream: &mut TcpStream) -> bool {
    let mut byte = [0u8; 1];
    match stream.read(&mut byte) {
        Ok(0) => true,
        Ok(_) => false,
        Err(e) => matches!(
            e.kind(),
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
        ),
    }
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// What the framing servicer saw right after handing off a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub active_requests: usize,
    pub read_paused: bool,
}

/// Shared record of everything the test servicers did.
#[derive(Default)]
pub struct Recorder {
    pub observations: Mutex<Vec<Observation>>,
    pub pending: Mutex<Vec<(Vec<u8>, ResponseWriter)>>,
    pub handles: Mutex<Vec<ConnectionHandle>>,
    pub serviced: AtomicUsize,
    pub cancelled: AtomicUsize,
    pub socket_releases: AtomicUsize,
    pub request_releases: AtomicUsize,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn serviced(&self) -> usize {
        self.serviced.load(Ordering::SeqCst)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn take_pending(&self) -> Vec<(Vec<u8>, ResponseWriter)> {
        std::mem::take(&mut *self.pending.lock())
    }

    pub fn handle(&self) -> ConnectionHandle {
        assert!(wait_until(WAIT, || !self.handles.lock().is_empty()));
        self.handles.lock()[0].clone()
    }
}

/// Splits frames and hands each one off with a pooled copy as its request
/// buffers.
pub struct FramingServicer {
    partial: Vec<u8>,
    recorder: Arc<Recorder>,
}

impl SocketServicer<Vec<u8>> for FramingServicer {
    fn service_read(
        &mut self,
        ctx: &mut SocketContext<'_, Vec<u8>>,
        read_buffer: &PooledBytes,
        bytes_read: usize,
        _is_new_buffer: bool,
    ) -> io::Result<()> {
        let filled = read_buffer.filled();
        self.partial
            .extend_from_slice(&filled[filled.len() - bytes_read..]);
        let (frames, consumed) = protocol::split_frames(&self.partial)
            .map_err(|reason| io::Error::new(io::ErrorKind::InvalidData, reason))?;
        self.partial.drain(..consumed);

        for payload in frames {
            let request_buffers = BufferChain::copy_from(ctx.pool(), &payload);
            ctx.handle_request(payload, request_buffers)
                .map_err(io::Error::other)?;
            self.recorder.observations.lock().push(Observation {
                active_requests: ctx.active_requests(),
                read_paused: ctx.is_read_paused(),
            });
        }
        Ok(())
    }

    fn release(&mut self) {
        self.recorder.socket_releases.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn framing_factory(recorder: &Arc<Recorder>) -> impl SocketServicerFactory<Vec<u8>> {
    let recorder = Arc::clone(recorder);
    move |handle: &ConnectionHandle| -> Box<dyn SocketServicer<Vec<u8>>> {
        recorder.handles.lock().push(handle.clone());
        Box::new(FramingServicer {
            partial: Vec::new(),
            recorder: Arc::clone(&recorder),
        })
    }
}

/// Answer `writer` with a length-prefixed copy of `payload`.
pub fn answer(payload: &[u8], writer: ResponseWriter) {
    let body = BufferChain::copy_from(writer.connection().pool(), payload);
    writer
        .write(Some(protocol::length_header(payload.len())), body)
        .unwrap();
}

/// Answers every request immediately, on the worker thread.
pub struct EchoServicer {
    recorder: Arc<Recorder>,
}

impl EchoServicer {
    pub fn new(recorder: &Arc<Recorder>) -> Self {
        Self {
            recorder: Arc::clone(recorder),
        }
    }
}

impl RequestServicer<Vec<u8>> for EchoServicer {
    fn service(&mut self, request: Vec<u8>, response: ResponseWriter) -> Option<CancelHandle> {
        self.recorder.serviced.fetch_add(1, Ordering::SeqCst);
        answer(&request, response);
        None
    }

    fn release(&mut self) {
        self.recorder.request_releases.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn echo_factory(recorder: &Arc<Recorder>) -> impl RequestServicerFactory<Vec<u8>> {
    let recorder = Arc::clone(recorder);
    move |_: &ConnectionHandle| -> Box<dyn RequestServicer<Vec<u8>>> {
        Box::new(EchoServicer {
            recorder: Arc::clone(&recorder),
        })
    }
}

/// Parks every request in the recorder for the test to answer later.
pub struct DeferredServicer {
    recorder: Arc<Recorder>,
}

impl RequestServicer<Vec<u8>> for DeferredServicer {
    fn service(&mut self, request: Vec<u8>, response: ResponseWriter) -> Option<CancelHandle> {
        self.recorder.pending.lock().push((request, response));
        self.recorder.serviced.fetch_add(1, Ordering::SeqCst);
        let recorder = Arc::clone(&self.recorder);
        Some(Box::new(move || {
            recorder.cancelled.fetch_add(1, Ordering::SeqCst);
        }))
    }

    fn release(&mut self) {
        self.recorder.request_releases.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn deferred_factory(recorder: &Arc<Recorder>) -> impl RequestServicerFactory<Vec<u8>> {
    let recorder = Arc::clone(recorder);
    move |_: &ConnectionHandle| -> Box<dyn RequestServicer<Vec<u8>>> {
        Box::new(DeferredServicer {
            recorder: Arc::clone(&recorder),
        })
    }
}
