//! Servicers wiring the frame protocol to the socket core.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::buffer_pool::PooledBytes;
use crate::config::{AcceptedSocketOptions, ServerSocketOptions};
use crate::connection::{ConnectionHandle, ResponseWriter, SocketContext};
use crate::error::Result;
use crate::manager::{ListenerHandle, SocketManager};
use crate::processor::{self, FrameJob, FrameProducer};
use crate::protocol;
use crate::servicer::{
    CancelHandle, RequestServicer, RequestServicerFactory, SocketServicer, SocketServicerFactory,
};
use crate::stream_buffer::BufferChain;

/// Splits the byte stream into frames, carrying partial frames across reads.
#[derive(Debug, Default)]
pub struct FrameSocketServicer {
    partial: Vec<u8>,
}

impl SocketServicer<Vec<u8>> for FrameSocketServicer {
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
            if let Err(err) = ctx.handle_request(payload, BufferChain::new()) {
                return Err(io::Error::other(err));
            }
        }
        Ok(())
    }
}

pub struct FrameSocketServicerFactory;

impl SocketServicerFactory<Vec<u8>> for FrameSocketServicerFactory {
    fn create(&self, _connection: &ConnectionHandle) -> Box<dyn SocketServicer<Vec<u8>>> {
        Box::new(FrameSocketServicer::default())
    }
}

/// Hands frames to the processor ring; the processor writes the responses.
pub struct FrameRequestServicer {
    producer: FrameProducer,
}

impl RequestServicer<Vec<u8>> for FrameRequestServicer {
    fn service(&mut self, request: Vec<u8>, response: ResponseWriter) -> Option<CancelHandle> {
        let cancelled = Arc::new(AtomicBool::new(false));
        let job = FrameJob {
            payload: request,
            response,
            cancelled: Arc::clone(&cancelled),
        };
        processor::publish(&mut self.producer, job);
        Some(Box::new(move || cancelled.store(true, Ordering::Release)))
    }
}

pub struct FrameRequestServicerFactory {
    producer: Mutex<FrameProducer>,
}

impl FrameRequestServicerFactory {
    pub fn new(producer: FrameProducer) -> Self {
        Self {
            producer: Mutex::new(producer),
        }
    }
}

impl RequestServicerFactory<Vec<u8>> for FrameRequestServicerFactory {
    fn create(&self, _connection: &ConnectionHandle) -> Box<dyn RequestServicer<Vec<u8>>> {
        Box::new(FrameRequestServicer {
            producer: self.producer.lock().clone(),
        })
    }
}

/// Bind a frame server on `port`, feeding `producer`'s ring.
pub fn bind_frame_server(
    manager: &SocketManager,
    port: u16,
    server_options: ServerSocketOptions,
    accepted_options: AcceptedSocketOptions,
    producer: FrameProducer,
) -> Result<ListenerHandle> {
    manager.bind::<Vec<u8>, _, _>(
        port,
        server_options,
        accepted_options,
        FrameSocketServicerFactory,
        FrameRequestServicerFactory::new(producer),
    )
}
