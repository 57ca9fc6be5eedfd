use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};

use sockloop::protocol::{self, HEADER_LEN};

#[derive(Parser)]
#[command(about = "Test client for the sockloop frame server")]
struct Args {
    /// Server port
    #[arg(short, long, default_value_t = 9900)]
    port: u16,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Send a few frames and verify the replies (default)
    Smoke,
    /// Send 1000 pipelined frames and verify replies arrive in order
    Pipeline,
    /// Benchmark throughput with concurrent pipelined connections
    Bench {
        /// Number of concurrent connections
        #[arg(short, long, default_value_t = 4)]
        connections: usize,
        /// Frames per connection
        #[arg(short, long, default_value_t = 100_000)]
        requests: usize,
        /// Payload bytes per frame
        #[arg(short = 's', long, default_value_t = 32)]
        payload_size: usize,
    },
    /// Sustained load with per-frame latency measurement
    Sustain {
        /// Number of concurrent connections
        #[arg(short, long, default_value_t = 4)]
        connections: usize,
        /// In-flight frames per connection (pipeline window)
        #[arg(short, long, default_value_t = 64)]
        window: usize,
        /// Payload bytes per frame
        #[arg(short = 's', long, default_value_t = 32)]
        payload_size: usize,
        /// Warmup duration in seconds (discarded from report)
        #[arg(short = 'W', long, default_value_t = 3)]
        warmup: u64,
        /// Measurement duration in seconds
        #[arg(short, long, default_value_t = 10)]
        duration: u64,
    },
}

/// Frame carrying `payload`, plus the reply the server should send back.
fn build_request(payload: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    protocol::encode_frame(&mut buf, payload);
    (buf, payload.to_ascii_uppercase())
}

fn sample_payload(i: usize, size: usize) -> Vec<u8> {
    let tag = format!("frame-{i}-");
    tag.bytes().cycle().take(size.max(1)).collect()
}

fn read_response(stream: &mut TcpStream) -> Vec<u8> {
    let mut header = [0u8; HEADER_LEN];
    stream
        .read_exact(&mut header)
        .expect("failed to read response header");
    let len = u32::from_le_bytes(header) as usize;
    let mut payload = vec![0u8; len];
    stream
        .read_exact(&mut payload)
        .expect("failed to read response body");
    payload
}

fn main() {
    let args = Args::parse();
    let addr = format!("127.0.0.1:{}", args.port);

    match args.command.unwrap_or(Command::Smoke) {
        Command::Smoke => smoke_test(&addr),
        Command::Pipeline => pipeline_test(&addr),
        Command::Bench {
            connections,
            requests,
            payload_size,
        } => bench_test(&addr, connections, requests, payload_size),
        Command::Sustain {
            connections,
            window,
            payload_size,
            warmup,
            duration,
        } => sustain_test(&addr, connections, window, payload_size, warmup, duration),
    }
}

fn smoke_test(addr: &str) {
    eprintln!("smoke test: connecting to {}", addr);
    let mut stream = TcpStream::connect(addr).expect("failed to connect");

    let (req, expected) = build_request(b"hello, sockloop");
    stream.write_all(&req).expect("failed to write");
    let reply = read_response(&mut stream);
    assert_eq!(reply, expected, "reply does not match");
    eprintln!("  small frame: OK ({:?})", String::from_utf8_lossy(&reply));

    let (req, expected) = build_request(&[]);
    stream.write_all(&req).expect("failed to write");
    assert_eq!(read_response(&mut stream), expected);
    eprintln!("  empty frame: OK");

    // spans several pool buffers
    let big = sample_payload(0, 100_000);
    let (req, expected) = build_request(&big);
    stream.write_all(&req).expect("failed to write");
    assert_eq!(read_response(&mut stream), expected);
    eprintln!("  {} byte frame: OK", big.len());

    eprintln!("smoke test: PASSED");
}

fn pipeline_test(addr: &str) {
    let num_requests = 1000;
    eprintln!(
        "pipeline test: sending {} pipelined frames to {}",
        num_requests, addr
    );
    let mut stream = TcpStream::connect(addr).expect("failed to connect");

    let mut all_expected = Vec::with_capacity(num_requests);
    for i in 0..num_requests {
        let (req, expected) = build_request(&sample_payload(i, 16 + i % 64));
        stream.write_all(&req).expect("failed to write");
        all_expected.push(expected);
    }

    for (i, expected) in all_expected.iter().enumerate() {
        let reply = read_response(&mut stream);
        assert_eq!(&reply, expected, "frame {}: reply out of order or corrupt", i);
    }

    eprintln!("pipeline test: PASSED ({} frames)", num_requests);
}

fn bench_test(addr: &str, num_connections: usize, requests_per_conn: usize, payload_size: usize) {
    eprintln!(
        "bench: {} connections x {} frames of {} bytes (pipelined) to {}",
        num_connections, requests_per_conn, payload_size, addr
    );

    let (req, _) = build_request(&sample_payload(0, payload_size));
    let response_size = req.len();

    let start = Instant::now();

    let handles: Vec<_> = (0..num_connections)
        .map(|_| {
            let addr = addr.to_string();
            let req = req.clone();
            std::thread::spawn(move || {
                let stream = TcpStream::connect(&addr).expect("failed to connect");
                stream.set_nodelay(true).expect("set_nodelay failed");

                let mut writer = stream.try_clone().expect("clone failed");
                let mut reader = stream;

                let write_handle = std::thread::spawn(move || {
                    for _ in 0..requests_per_conn {
                        writer.write_all(&req).expect("write failed");
                    }
                });

                let mut resp_buf = vec![0u8; response_size * 1024];
                let mut total_bytes_needed = requests_per_conn * response_size;
                while total_bytes_needed > 0 {
                    let to_read = total_bytes_needed.min(resp_buf.len());
                    let n = reader.read(&mut resp_buf[..to_read]).expect("read failed");
                    if n == 0 {
                        panic!(
                            "connection closed with {} bytes remaining",
                            total_bytes_needed
                        );
                    }
                    total_bytes_needed -= n;
                }

                write_handle.join().expect("writer panicked");
            })
        })
        .collect();

    for h in handles {
        h.join().expect("thread panicked");
    }

    let elapsed = start.elapsed();
    let total = num_connections * requests_per_conn;
    let qps = total as f64 / elapsed.as_secs_f64();
    eprintln!(
        "bench: {} frames in {:.2}s = {:.0} QPS",
        total,
        elapsed.as_secs_f64(),
        qps
    );
}

fn percentile(sorted: &[u64], p: f64) -> f64 {
    let i = ((p / 100.0) * sorted.len() as f64) as usize;
    sorted[i.min(sorted.len() - 1)] as f64 / 1_000.0
}

fn print_interval(samples: &mut [u64], elapsed: Duration) {
    samples.sort_unstable();
    let n = samples.len();
    let qps = n as f64 / elapsed.as_secs_f64();
    eprintln!(
        "{:>10.0}  {:>8.1}µs  {:>8.1}µs  {:>8.1}µs  {:>8.1}µs  {:>8}",
        qps,
        percentile(samples, 50.0),
        percentile(samples, 95.0),
        percentile(samples, 99.0),
        percentile(samples, 99.9),
        n,
    );
}

fn sustain_test(
    addr: &str,
    num_connections: usize,
    window: usize,
    payload_size: usize,
    warmup_secs: u64,
    duration_secs: u64,
) {
    eprintln!(
        "sustain: {} connections, window={}, {} byte frames, warmup={}s, duration={}s → {}",
        num_connections, window, payload_size, warmup_secs, duration_secs, addr
    );

    let (tx, rx) = mpsc::channel::<u64>();

    for c in 0..num_connections {
        let addr = addr.to_string();
        let tx = tx.clone();
        let (req, _) = build_request(&sample_payload(c, payload_size));
        std::thread::spawn(move || {
            let mut stream = TcpStream::connect(&addr).expect("failed to connect");
            stream.set_nodelay(true).expect("set_nodelay failed");
            let mut in_flight: VecDeque<Instant> = VecDeque::with_capacity(window);

            loop {
                while in_flight.len() < window {
                    stream.write_all(&req).expect("write failed");
                    in_flight.push_back(Instant::now());
                }
                read_response(&mut stream);
                let Some(sent_at) = in_flight.pop_front() else {
                    continue;
                };
                if tx.send(sent_at.elapsed().as_nanos() as u64).is_err() {
                    break;
                }
            }
        });
    }
    drop(tx);

    if warmup_secs > 0 {
        eprint!("warming up ({warmup_secs}s)");
        let warmup_end = Instant::now() + Duration::from_secs(warmup_secs);
        while Instant::now() < warmup_end {
            while rx.try_recv().is_ok() {}
            std::thread::sleep(Duration::from_millis(100));
            eprint!(".");
        }
        eprintln!(" ready");
    }

    eprintln!(
        "{:>10}  {:>9}  {:>9}  {:>9}  {:>9}  {:>8}",
        "qps", "p50", "p95", "p99", "p99.9", "n"
    );

    let measure_start = Instant::now();
    let measure_end = measure_start + Duration::from_secs(duration_secs);
    let mut all_samples: Vec<u64> = Vec::new();
    let mut interval_samples: Vec<u64> = Vec::new();
    let mut last_print = Instant::now();

    loop {
        let now = Instant::now();
        if now >= measure_end {
            break;
        }
        let timeout = (measure_end - now).min(Duration::from_millis(100));
        match rx.recv_timeout(timeout) {
            Ok(ns) => {
                interval_samples.push(ns);
                all_samples.push(ns);
                while let Ok(ns) = rx.try_recv() {
                    interval_samples.push(ns);
                    all_samples.push(ns);
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                eprintln!("error: all connections died, is the server running?");
                break;
            }
            Err(RecvTimeoutError::Timeout) => {}
        }

        if last_print.elapsed() >= Duration::from_secs(1) && !interval_samples.is_empty() {
            print_interval(&mut interval_samples, last_print.elapsed());
            interval_samples.clear();
            last_print = Instant::now();
        }
    }

    if !interval_samples.is_empty() {
        print_interval(&mut interval_samples, last_print.elapsed());
    }

    if all_samples.is_empty() {
        eprintln!("no samples collected");
        return;
    }
    all_samples.sort_unstable();
    let n = all_samples.len();
    let elapsed = measure_start.elapsed();
    eprintln!();
    eprintln!(
        "── summary ({:.1}s, {} frames) ──────────────────────────────────",
        elapsed.as_secs_f64(),
        n
    );
    eprintln!("  qps     {:.0}", n as f64 / elapsed.as_secs_f64());
    eprintln!("  p50     {:.1}µs", percentile(&all_samples, 50.0));
    eprintln!("  p95     {:.1}µs", percentile(&all_samples, 95.0));
    eprintln!("  p99     {:.1}µs", percentile(&all_samples, 99.0));
    eprintln!("  p99.9   {:.1}µs", percentile(&all_samples, 99.9));
    eprintln!("  max     {:.1}µs", all_samples[n - 1] as f64 / 1_000.0);
}
