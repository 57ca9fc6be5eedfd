//! Frame processor for the demo server: a disruptor ring fed by every
//! socket worker and drained by one processing thread, which answers each
//! frame from off the worker threads.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use disruptor::{
    BusySpin, EventPoller, MultiProducer, MultiProducerBarrier, Polling, Producer, RingBufferFull,
    SingleConsumerBarrier, build_multi_producer,
};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::connection::ResponseWriter;
use crate::metrics;
use crate::protocol;
use crate::stream_buffer::BufferChain;

pub type FrameProducer = MultiProducer<FrameEvent, SingleConsumerBarrier>;
pub type FramePoller = EventPoller<FrameEvent, MultiProducerBarrier>;

/// Empty polls tolerated before the processor starts sleeping between polls.
const IDLE_SPINS: u32 = 1024;
const IDLE_SLEEP: Duration = Duration::from_micros(50);
/// Retries on a full ring before the publishing worker starts yielding.
const FULL_SPINS: u32 = 64;

/// Work handed from a socket worker to the processor.
pub struct FrameJob {
    pub payload: Vec<u8>,
    pub response: ResponseWriter,
    pub cancelled: Arc<AtomicBool>,
}

/// Ring slot. Slots are read through shared references, so the job sits
/// behind a lock and is taken by the processor.
pub struct FrameEvent {
    job: Mutex<Option<FrameJob>>,
}

impl FrameEvent {
    /// Factory for disruptor - creates empty slots.
    pub fn factory() -> Self {
        Self {
            job: Mutex::new(None),
        }
    }

    fn fill(&mut self, job: FrameJob) {
        *self.job.get_mut() = Some(job);
    }

    fn take(&self) -> Option<FrameJob> {
        self.job.lock().take()
    }
}

/// Build the ring: the producer is cloned per connection, the processor
/// runs on its own thread until every producer is dropped.
pub fn build_frame_ring(size: usize) -> (FrameProducer, FrameProcessor) {
    let builder = build_multi_producer(size, FrameEvent::factory, BusySpin);
    let (poller, builder) = builder.event_poller();
    let producer = builder.build();
    (producer, FrameProcessor { poller })
}

/// Publish a job. While the ring is full the caller spins briefly, then
/// yields its CPU to the processor until a slot frees up.
pub fn publish(producer: &mut FrameProducer, job: FrameJob) {
    let mut job = Some(job);
    let mut full = 0u32;
    loop {
        let published = producer.try_publish(|slot| {
            if let Some(job) = job.take() {
                slot.fill(job);
            }
        });
        match published {
            Ok(_) => return,
            Err(RingBufferFull) => {
                full = full.saturating_add(1);
                if full < FULL_SPINS {
                    std::hint::spin_loop();
                } else {
                    std::thread::yield_now();
                }
            }
        }
    }
}

/// Answers each frame with its payload upper-cased.
pub struct FrameProcessor {
    poller: FramePoller,
}

impl FrameProcessor {
    pub fn run(mut self) {
        info!("frame processor started");
        let mut idle = 0u32;
        loop {
            match self.poller.poll() {
                Ok(mut guard) => {
                    idle = 0;
                    metrics::inc_poll_events();
                    for event in &mut guard {
                        if let Some(job) = event.take() {
                            process(job);
                        }
                    }
                }
                Err(Polling::NoEvents) => {
                    metrics::inc_poll_no_events();
                    idle = idle.saturating_add(1);
                    if idle < IDLE_SPINS {
                        std::hint::spin_loop();
                    } else {
                        std::thread::sleep(IDLE_SLEEP);
                    }
                }
                Err(Polling::Shutdown) => {
                    info!("frame processor stopped");
                    return;
                }
            }
        }
    }
}

fn process(job: FrameJob) {
    let FrameJob {
        mut payload,
        response,
        cancelled,
    } = job;
    if cancelled.load(Ordering::Acquire) {
        debug!("skipping frame for a closed connection");
        return;
    }
    payload.make_ascii_uppercase();
    let header = protocol::length_header(payload.len());
    let body = BufferChain::copy_from(response.connection().pool(), &payload);
    if let Err(err) = response.write(Some(header), body) {
        debug!(error = %err, "dropping frame response");
    }
}
