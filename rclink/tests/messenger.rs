#![cfg(feature = "soft")]

use std::sync::mpsc;
use std::thread;

use rclink::{OobListener, RdmaMessenger};

const ROUNDS: usize = 4;

#[test]
fn alternating_round_trips() {
    let listener = OobListener::bind(0).unwrap();
    let port = listener.local_port();

    let server = thread::spawn(move || {
        let mut server = RdmaMessenger::init_server_on(listener).unwrap();
        assert!(server.is_server());
        let mut heard = Vec::new();
        for round in 0..ROUNDS {
            server.write(&format!("ping {}", round)).unwrap();
            heard.push(server.read().unwrap());
        }
        server.destroy();
        server.destroy();
        heard
    });

    let mut client = RdmaMessenger::init_client("127.0.0.1", port).unwrap();
    assert!(!client.is_server());
    for round in 0..ROUNDS {
        assert_eq!(client.read().unwrap(), format!("ping {}", round));
        client.write(&format!("pong {}", round)).unwrap();
    }

    let heard = server.join().unwrap();
    let expected: Vec<_> = (0..ROUNDS).map(|round| format!("pong {}", round)).collect();
    assert_eq!(heard, expected);

    client.destroy();
    assert!(client.endpoint().resources().is_torn_down());
}

#[test]
fn long_messages_are_truncated_to_the_buffer() {
    let listener = OobListener::bind(0).unwrap();
    let port = listener.local_port();
    let long = "x".repeat(200);

    let sent = long.clone();
    let (done_tx, done_rx) = mpsc::channel();
    let server = thread::spawn(move || {
        let mut server = RdmaMessenger::init_server_on(listener).unwrap();
        server.write(&sent).unwrap();
        // keep the buffer registered until the client has read it
        done_rx.recv().unwrap();
    });

    let mut client = RdmaMessenger::init_client("127.0.0.1", port).unwrap();
    let got = client.read().unwrap();
    done_tx.send(()).unwrap();
    server.join().unwrap();

    let capacity = client.endpoint().buffer().unwrap().capacity();
    assert_eq!(got.len(), capacity - 1);
    assert!(long.starts_with(&got));
}

#[test]
fn calls_after_destroy_fail() {
    let listener = OobListener::bind(0).unwrap();
    let port = listener.local_port();
    let server = thread::spawn(move || RdmaMessenger::init_server_on(listener).unwrap());

    let mut client = RdmaMessenger::init_client("127.0.0.1", port).unwrap();
    let _server = server.join().unwrap();
    client.destroy();
    assert!(client.write("late").is_err());
    assert!(client.read().is_err());
}
