use std::time::Duration;

/// Bytes per pooled buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Idle buffers retained by a `FixedBufferPool` before extras are freed.
pub const DEFAULT_MAX_POOLED_BUFFERS: usize = 16 * 1024;

/// Reads attempted per connection per readiness cycle.
pub const DEFAULT_MAX_READS_PER_CYCLE: usize = 4;

/// Unanswered pipelined requests per connection before reads are paused.
pub const DEFAULT_MAX_ACTIVE_REQUESTS: usize = 100;

pub const DEFAULT_LISTEN_BACKLOG: i32 = 1024;

/// Upper bound on a single multiplexer wait so shutdown is noticed promptly.
pub const DEFAULT_SELECT_TIMEOUT: Duration = Duration::from_millis(500);

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_EVENTS_CAPACITY: usize = 1024;

/// Retries after a bind fails with "address in use".
pub const BIND_RETRIES: u32 = 3;

pub const BIND_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Buffers gathered into one vectored write.
pub const MAX_WRITE_SLICES: usize = 32;

/// Demo frame protocol: largest accepted payload.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const _: () = assert!(
    DEFAULT_MAX_ACTIVE_REQUESTS >= 1,
    "at least one request must be serviceable"
);

/// Slots in the demo frame processor's ring. Must be a power of two.
pub const FRAME_RING_SIZE: usize = 4096;

const _: () = assert!(
    FRAME_RING_SIZE.is_power_of_two(),
    "disruptor ring size must be a power of two"
);
