//! Wire-format violations injected with a raw socket must tear down only
//! the offending connection, with error code 3.

mod common;

use std::io::Write;
use std::net::TcpStream;
use std::time::Duration;

use common::{Event, RecordingSink};
use qnet::{FRAME_FLAG, Net, TcpHandle};

const WAIT: Duration = Duration::from_secs(5);

fn listen(net: &Net) -> (TcpHandle, u16) {
    let listener = net.tcp_create("127.0.0.1", 0).unwrap();
    let port = net.tcp_local_addr(listener).unwrap().port();
    net.tcp_listen(listener).unwrap();
    (listener, port)
}

fn raw_header(flag: u32, size: u32) -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&flag.to_be_bytes());
    bytes.extend_from_slice(&size.to_be_bytes());
    bytes.extend_from_slice(&0u32.to_be_bytes());
    bytes
}

fn inject(net: &Net, sink: &RecordingSink, bytes: &[u8]) -> TcpHandle {
    let (listener, port) = listen(net);
    let mut raw = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let accepted = sink
        .wait_for(WAIT, |e| matches!(e, Event::Accepted { listener: l, .. } if *l == listener))
        .expect("no accept event");
    let Event::Accepted { child, .. } = accepted else { unreachable!() };
    raw.write_all(bytes).unwrap();
    child
}

#[test]
fn bad_flag_fails_the_connection() {
    let sink = RecordingSink::new();
    let net = Net::startup(&sink).unwrap();

    let mut bytes = raw_header(0, 5);
    bytes.extend_from_slice(b"abcde");
    let child = inject(&net, &sink, &bytes);

    let failed = sink
        .wait_for(WAIT, |e| matches!(e, Event::StreamFailed { handle, .. } if *handle == child))
        .expect("no error event");
    assert_eq!(failed, Event::StreamFailed { handle: child, code: 3 });
    assert_eq!(sink.count(|e| matches!(e, Event::Received { .. })), 0);

    net.shutdown();
}

#[test]
fn oversized_length_fails_the_connection() {
    let sink = RecordingSink::new();
    let net = Net::startup(&sink).unwrap();

    let child = inject(&net, &sink, &raw_header(FRAME_FLAG, 17 * 1024 * 1024));

    let failed = sink
        .wait_for(WAIT, |e| matches!(e, Event::StreamFailed { handle, .. } if *handle == child))
        .expect("no error event");
    assert_eq!(failed, Event::StreamFailed { handle: child, code: 3 });
    assert_eq!(sink.count(|e| matches!(e, Event::Received { .. })), 0);

    net.shutdown();
}

#[test]
fn other_connections_survive_a_faulty_peer() {
    let sink = RecordingSink::new();
    let net = Net::startup(&sink).unwrap();

    let (listener, port) = listen(&net);

    // Healthy connection first.
    let good = net.tcp_create("127.0.0.1", 0).unwrap();
    net.tcp_connect(good, "127.0.0.1", port, 2_000).unwrap();
    let good_child = {
        let event = sink
            .wait_for(WAIT, |e| matches!(e, Event::Accepted { .. }))
            .expect("no accept event");
        let Event::Accepted { child, .. } = event else { unreachable!() };
        child
    };

    // Faulty peer on the same listener.
    let mut raw = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let bad_child = {
        let event = sink
            .wait_for(WAIT, |e| {
                matches!(e, Event::Accepted { child, .. } if *child != good_child)
            })
            .expect("no second accept event");
        let Event::Accepted { child, .. } = event else { unreachable!() };
        child
    };
    raw.write_all(&raw_header(0, 1)).unwrap();
    sink.wait_for(WAIT, |e| matches!(e, Event::StreamFailed { handle, .. } if *handle == bad_child))
        .expect("no error event");

    // The listener kept accepting and the good connection still works.
    net.tcp_send(good, b"still alive").unwrap();
    let received = sink
        .wait_for(WAIT, |e| matches!(e, Event::Received { handle, .. } if *handle == good_child))
        .expect("good connection broke");
    assert_eq!(
        received,
        Event::Received { handle: good_child, payload: b"still alive".to_vec() }
    );

    net.shutdown();
}
