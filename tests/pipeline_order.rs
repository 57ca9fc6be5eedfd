//! Responses leave a connection in request order, whichever thread answers
//! them and in whatever order they are answered.

mod common;

use std::thread;

use sockloop::{AcceptedSocketOptions, FixedBufferPool, SocketManager};

use common::{Recorder, WAIT};

#[test]
fn responses_written_in_reverse_arrive_in_request_order() {
    let recorder = Recorder::new();
    let manager = SocketManager::with_default_pool(common::test_config(2)).unwrap();
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
    let payloads: Vec<Vec<u8>> = (0..5).map(|i| format!("request-{i}").into_bytes()).collect();
    common::send_frames(&mut client, &payloads);
    assert!(common::wait_until(WAIT, || recorder.pending_len() == 5));

    // answered last-first from a thread that does not own the connection
    let pending = recorder.take_pending();
    thread::spawn(move || {
        for (payload, writer) in pending.into_iter().rev() {
            common::answer(&payload, writer);
        }
    })
    .join()
    .unwrap();

    for expected in &payloads {
        assert_eq!(&common::read_frame(&mut client), expected);
    }
    manager.shutdown().unwrap();
}

#[test]
fn interleaved_inline_and_deferred_answers_keep_order() {
    let recorder = Recorder::new();
    let manager = SocketManager::with_default_pool(common::test_config(1)).unwrap();
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
    let payloads: Vec<Vec<u8>> = (0..10).map(|i| vec![b'a' + i as u8; i + 1]).collect();
    common::send_frames(&mut client, &payloads);
    assert!(common::wait_until(WAIT, || recorder.pending_len() == 10));

    let mut pending = recorder.take_pending();
    // odd requests first, each from its own thread
    let odd: Vec<_> = pending
        .iter()
        .enumerate()
        .filter(|(i, _)| i % 2 == 1)
        .map(|(i, _)| i)
        .collect();
    let mut odd_writers = Vec::new();
    for i in odd.into_iter().rev() {
        odd_writers.push(pending.remove(i));
    }
    let threads: Vec<_> = odd_writers
        .into_iter()
        .map(|(payload, writer)| thread::spawn(move || common::answer(&payload, writer)))
        .collect();
    for t in threads {
        t.join().unwrap();
    }
    for (payload, writer) in pending {
        common::answer(&payload, writer);
    }

    for expected in &payloads {
        assert_eq!(&common::read_frame(&mut client), expected);
    }
    manager.shutdown().unwrap();
}

#[test]
fn inline_answers_are_pipelined_in_order() {
    let recorder = Recorder::new();
    let pool = FixedBufferPool::new(64, 32).shared();
    let manager = SocketManager::new(common::test_config(2), pool).unwrap();
    let listener = manager
        .bind(
            0,
            common::localhost(),
            AcceptedSocketOptions::default(),
            common::framing_factory(&recorder),
            common::echo_factory(&recorder),
        )
        .unwrap();

    let mut client = common::connect(listener.port());
    // frames straddle read buffers and response packing buffers
    let payloads: Vec<Vec<u8>> = (0..200)
        .map(|i| format!("{i:04}-").repeat(1 + i % 40).into_bytes())
        .collect();
    common::send_frames(&mut client, &payloads);
    for expected in &payloads {
        assert_eq!(&common::read_frame(&mut client), expected);
    }
    assert_eq!(recorder.serviced(), 200);
    manager.shutdown().unwrap();
}

#[test]
fn connections_are_spread_across_workers() {
    let recorder = Recorder::new();
    let manager = SocketManager::with_default_pool(common::test_config(3)).unwrap();
    let listener = manager
        .bind(
            0,
            common::localhost(),
            AcceptedSocketOptions::default(),
            common::framing_factory(&recorder),
            common::echo_factory(&recorder),
        )
        .unwrap();

    let mut clients: Vec<_> = (0..6).map(|_| common::connect(listener.port())).collect();
    for (i, client) in clients.iter_mut().enumerate() {
        let payload = format!("client-{i}");
        common::send_frames(client, &[payload.as_bytes()]);
        assert_eq!(common::read_frame(client), payload.as_bytes());
    }

    let mut workers: Vec<usize> = recorder
        .handles
        .lock()
        .iter()
        .map(|h| h.worker_index())
        .collect();
    workers.sort_unstable();
    workers.dedup();
    assert_eq!(workers, vec![0, 1, 2]);
    manager.shutdown().unwrap();
}
