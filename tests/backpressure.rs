//! Reads stop once a connection has `max_active_requests` unanswered requests
//! and resume when one of them is answered.

mod common;

use std::time::Duration;

use sockloop::{AcceptedSocketOptions, ServerConfig, SocketManager};

use common::{Observation, Recorder, WAIT};

fn config(max_active_requests: usize) -> ServerConfig {
    ServerConfig {
        max_active_requests,
        ..common::test_config(1)
    }
}

fn reads_pause_at_limit(max_active: usize) {
    let recorder = Recorder::new();
    let manager = SocketManager::with_default_pool(config(max_active)).unwrap();
    let listener = manager
        .bind(
            0,
            common::localhost(),
            AcceptedSocketOptions::default(),
            common::framing_factory(&recorder),
            common::deferred_factory(&recorder),
        )
        .unwrap();
    let mut client = common::connect(listener.port());

    // one frame per write so each lands in its own read
    for i in 0..max_active {
        common::send_frames(&mut client, &[format!("first-{i}")]);
        assert!(common::wait_until(WAIT, || recorder.serviced() == i + 1));
    }
    let observations = recorder.observations.lock().clone();
    assert_eq!(
        observations.last().copied(),
        Some(Observation {
            active_requests: max_active,
            read_paused: true,
        })
    );
    assert!(
        observations[..max_active - 1]
            .iter()
            .all(|o| !o.read_paused)
    );

    common::send_frames(&mut client, &[b"held back"]);
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(
        recorder.serviced(),
        max_active,
        "a request was read past the limit"
    );

    // answering the oldest request drops the count to max - 1
    let mut pending = recorder.take_pending();
    let (payload, writer) = pending.remove(0);
    common::answer(&payload, writer);
    assert_eq!(common::read_frame(&mut client), payload);
    assert!(common::wait_until(WAIT, || recorder.serviced() == max_active + 1));

    for (payload, writer) in pending.into_iter().chain(recorder.take_pending()) {
        common::answer(&payload, writer);
        assert_eq!(common::read_frame(&mut client), payload);
    }
    manager.shutdown().unwrap();
}

#[test]
fn reads_pause_at_one_active_request() {
    reads_pause_at_limit(1);
}

#[test]
fn reads_pause_at_two_active_requests() {
    reads_pause_at_limit(2);
}

#[test]
fn reads_pause_at_three_active_requests() {
    reads_pause_at_limit(3);
}

#[test]
fn active_requests_never_exceed_limit_under_pipelining() {
    const MAX_ACTIVE: usize = 4;
    const TOTAL: usize = 64;

    let recorder = Recorder::new();
    let manager = SocketManager::with_default_pool(config(MAX_ACTIVE)).unwrap();
    let listener = manager
        .bind(
            0,
            common::localhost(),
            AcceptedSocketOptions::default(),
            common::framing_factory(&recorder),
            common::deferred_factory(&recorder),
        )
        .unwrap();
    let mut client = common::connect(listener.port());

    let payloads: Vec<Vec<u8>> = (0..TOTAL).map(|i| format!("frame-{i}").into_bytes()).collect();
    let writer_payloads = payloads.clone();
    let mut writer_stream = client.try_clone().unwrap();
    let writer = std::thread::spawn(move || {
        for payload in &writer_payloads {
            common::send_frames(&mut writer_stream, &[payload]);
            std::thread::sleep(Duration::from_millis(1));
        }
    });

    let mut received = 0;
    while received < TOTAL {
        assert!(common::wait_until(WAIT, || recorder.pending_len() > 0));
        for (payload, writer) in recorder.take_pending() {
            common::answer(&payload, writer);
            assert_eq!(common::read_frame(&mut client), payloads[received]);
            received += 1;
        }
    }
    writer.join().unwrap();

    let observations = recorder.observations.lock().clone();
    assert_eq!(observations.len(), TOTAL);
    for observation in &observations {
        assert_eq!(
            observation.read_paused,
            observation.active_requests >= MAX_ACTIVE,
            "{observation:?}"
        );
    }
    manager.shutdown().unwrap();
}
