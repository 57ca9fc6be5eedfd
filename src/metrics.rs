#[cfg(feature = "metrics")]
mod imp {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    // Connections (cumulative)
    static CONNECTIONS_ACCEPTED: AtomicU64 = AtomicU64::new(0);
    static CONNECTIONS_CLOSED: AtomicU64 = AtomicU64::new(0);
    // Pipeline throughput (cumulative)
    static REQUESTS_SERVICED: AtomicU64 = AtomicU64::new(0);
    static RESPONSES_WRITTEN: AtomicU64 = AtomicU64::new(0);
    static BYTES_WRITTEN: AtomicU64 = AtomicU64::new(0);
    // Stall / backpressure (cumulative counts)
    static READ_PAUSED: AtomicU64 = AtomicU64::new(0);
    static PARTIAL_WRITES: AtomicU64 = AtomicU64::new(0);
    static POOL_EXHAUSTED: AtomicU64 = AtomicU64::new(0);
    // Frame processor: poll outcomes (stall = NoEvents)
    static POLL_EVENTS: AtomicU64 = AtomicU64::new(0);
    static POLL_NO_EVENTS: AtomicU64 = AtomicU64::new(0);

    #[derive(Debug, Clone, Copy, Default)]
    pub struct MetricsSnapshot {
        pub connections_accepted: u64,
        pub connections_closed: u64,
        pub requests_serviced: u64,
        pub responses_written: u64,
        pub bytes_written: u64,
        pub read_paused: u64,
        pub partial_writes: u64,
        pub pool_exhausted: u64,
        pub poll_events: u64,
        pub poll_no_events: u64,
    }

    pub fn inc_connections_accepted() {
        CONNECTIONS_ACCEPTED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_connections_closed() {
        CONNECTIONS_CLOSED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_requests_serviced() {
        REQUESTS_SERVICED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_responses_written() {
        RESPONSES_WRITTEN.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_written(n: usize) {
        BYTES_WRITTEN.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn inc_read_paused() {
        READ_PAUSED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_partial_writes() {
        PARTIAL_WRITES.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_pool_exhausted() {
        POOL_EXHAUSTED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_poll_events() {
        POLL_EVENTS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_poll_no_events() {
        POLL_NO_EVENTS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            connections_accepted: CONNECTIONS_ACCEPTED.load(Ordering::Relaxed),
            connections_closed: CONNECTIONS_CLOSED.load(Ordering::Relaxed),
            requests_serviced: REQUESTS_SERVICED.load(Ordering::Relaxed),
            responses_written: RESPONSES_WRITTEN.load(Ordering::Relaxed),
            bytes_written: BYTES_WRITTEN.load(Ordering::Relaxed),
            read_paused: READ_PAUSED.load(Ordering::Relaxed),
            partial_writes: PARTIAL_WRITES.load(Ordering::Relaxed),
            pool_exhausted: POOL_EXHAUSTED.load(Ordering::Relaxed),
            poll_events: POLL_EVENTS.load(Ordering::Relaxed),
            poll_no_events: POLL_NO_EVENTS.load(Ordering::Relaxed),
        }
    }

    pub fn spawn_reporter(interval: Duration) {
        let spawned = std::thread::Builder::new()
            .name("sockloop-metrics".into())
            .spawn(move || {
                let mut last = snapshot();
                loop {
                    std::thread::sleep(interval);
                    let snap = snapshot();
                    let poll_ev_d = snap.poll_events.saturating_sub(last.poll_events);
                    let poll_no_d = snap.poll_no_events.saturating_sub(last.poll_no_events);
                    let total_poll = poll_ev_d + poll_no_d;
                    let stall_pct = if total_poll > 0 {
                        100.0 * (poll_no_d as f64 / total_poll as f64)
                    } else {
                        0.0
                    };
                    tracing::info!(
                        interval_secs = interval.as_secs(),
                        accepted = snap.connections_accepted.saturating_sub(last.connections_accepted),
                        closed = snap.connections_closed.saturating_sub(last.connections_closed),
                        open = snap.connections_accepted.saturating_sub(snap.connections_closed),
                        requests = snap.requests_serviced.saturating_sub(last.requests_serviced),
                        responses = snap.responses_written.saturating_sub(last.responses_written),
                        bytes = snap.bytes_written.saturating_sub(last.bytes_written),
                        read_paused = snap.read_paused.saturating_sub(last.read_paused),
                        partial_writes = snap.partial_writes.saturating_sub(last.partial_writes),
                        pool_exhausted = snap.pool_exhausted.saturating_sub(last.pool_exhausted),
                        stall_pct = format_args!("{stall_pct:.1}"),
                        "metrics delta"
                    );
                    last = snap;
                }
            });
        if let Err(err) = spawned {
            tracing::warn!(error = %err, "failed to start metrics reporter");
        }
    }
}

#[cfg(not(feature = "metrics"))]
#[allow(dead_code)]
mod imp {
    use std::time::Duration;

    #[derive(Debug, Clone, Copy, Default)]
    pub struct MetricsSnapshot {
        pub connections_accepted: u64,
        pub connections_closed: u64,
        pub requests_serviced: u64,
        pub responses_written: u64,
        pub bytes_written: u64,
        pub read_paused: u64,
        pub partial_writes: u64,
        pub pool_exhausted: u64,
        pub poll_events: u64,
        pub poll_no_events: u64,
    }

    pub fn inc_connections_accepted() {}
    pub fn inc_connections_closed() {}
    pub fn inc_requests_serviced() {}
    pub fn inc_responses_written() {}
    pub fn add_bytes_written(_: usize) {}
    pub fn inc_read_paused() {}
    pub fn inc_partial_writes() {}
    pub fn inc_pool_exhausted() {}
    pub fn inc_poll_events() {}
    pub fn inc_poll_no_events() {}
    pub fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot::default()
    }
    pub fn spawn_reporter(_: Duration) {}
}

pub use imp::*;
