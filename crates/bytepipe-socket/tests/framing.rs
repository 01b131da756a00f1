#![cfg(unix)]

use std::io::Write;
use std::time::{Duration, Instant};

use bytepipe_socket::{Endpoint, FramedListener, FramedSocket, SocketError, MAX_PAYLOAD};
use bytepipe_transport::Deadline;

#[test]
fn large_message_round_trip_over_tcp() {
    let listener = FramedListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let payload: Vec<u8> = (0..(12 * 1024 * 1024 + 3)).map(|i| (i % 241) as u8).collect();

    let expected = payload.clone();
    let server = std::thread::spawn(move || {
        let mut socket = listener.accept().unwrap();
        let got = socket
            .receive_message(Some(Deadline::after(Duration::from_secs(30))))
            .unwrap()
            .unwrap();
        assert_eq!(got.len(), expected.len());
        assert!(got.as_ref() == expected.as_slice());
        socket.send_message(b"ACK").unwrap();
    });

    let mut client =
        FramedSocket::connect_with_deadline(addr, Deadline::after(Duration::from_secs(30))).unwrap();
    client.send_message(&payload).unwrap();
    let ack = client.receive_message(None).unwrap().unwrap();
    assert_eq!(ack.as_ref(), b"ACK");
    server.join().unwrap();
}

#[test]
fn many_messages_keep_their_boundaries() {
    let (mut left, mut right) = FramedSocket::pair().unwrap();
    let writer = std::thread::spawn(move || {
        for i in 0..200 {
            left.send_message(format!("message-{i}").as_bytes()).unwrap();
        }
        left
    });
    for i in 0..200 {
        let got = right.receive_message(None).unwrap().unwrap();
        assert_eq!(got.as_ref(), format!("message-{i}").as_bytes());
    }
    writer.join().unwrap();
}

#[test]
fn empty_socket_times_out_near_the_deadline() {
    let (_left, mut right) = FramedSocket::pair().unwrap();
    let start = Instant::now();
    let got = right
        .receive_exact(16, Some(Deadline::from_secs_f64(0.05)))
        .unwrap();
    let elapsed = start.elapsed();
    assert!(got.is_none());
    assert!(elapsed >= Duration::from_millis(45), "too early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1000), "too late: {elapsed:?}");
}

#[test]
fn absolute_deadline_in_the_past_returns_promptly() {
    let (_left, mut right) = FramedSocket::pair().unwrap();
    // a UNIX timestamp long gone
    let deadline = Deadline::from_secs_f64(1_000_000.0);
    let start = Instant::now();
    assert!(right.receive_message(Some(deadline)).unwrap().is_none());
    assert!(start.elapsed() < Duration::from_millis(500));
}

#[test]
fn timeout_is_not_fatal() {
    let (mut left, mut right) = FramedSocket::pair().unwrap();
    let short = Some(Deadline::after(Duration::from_millis(20)));
    assert!(right.receive_message(short).unwrap().is_none());

    left.send_message(b"later").unwrap();
    assert_eq!(
        right.receive_message(None).unwrap().unwrap().as_ref(),
        b"later"
    );
}

#[test]
fn closed_peer_is_distinct_from_timeout() {
    let (left, mut right) = FramedSocket::pair().unwrap();
    let mut raw = left.into_inner();
    raw.write_all(b"20      partial").unwrap();
    drop(raw);
    assert!(matches!(
        right.receive_message(None),
        Err(SocketError::Closed)
    ));
}

#[test]
fn oversized_send_is_rejected_before_writing() {
    let (mut left, _right) = FramedSocket::pair().unwrap();
    let payload = vec![0u8; MAX_PAYLOAD + 1];
    assert!(matches!(
        left.send_message(&payload),
        Err(SocketError::PayloadTooLarge { .. })
    ));
}

#[test]
fn unix_endpoint_round_trip() {
    let path = std::env::temp_dir().join(format!("bytepipe-framing-{}.sock", std::process::id()));
    let endpoint = Endpoint::Unix(path);
    let listener = FramedListener::bind_endpoint(&endpoint).unwrap();

    let client = std::thread::spawn({
        let endpoint = endpoint.clone();
        move || {
            let mut socket = FramedSocket::connect_endpoint(&endpoint, Deadline::default()).unwrap();
            socket.send_message(b"MYTH_PROTO_VERSION").unwrap();
            socket.receive_message(None).unwrap().unwrap()
        }
    });

    let mut server = listener.accept().unwrap();
    let got = server.receive_message(None).unwrap().unwrap();
    server.send_message(&got).unwrap();
    assert_eq!(client.join().unwrap().as_ref(), b"MYTH_PROTO_VERSION");
}
