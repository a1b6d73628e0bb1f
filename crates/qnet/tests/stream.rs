mod common;

use std::time::Duration;

use common::{Event, RecordingSink, mentions_stream};
use qnet::{Net, NetError, TcpHandle};

const WAIT: Duration = Duration::from_secs(5);

/// Listener on an ephemeral localhost port, already armed for accepts.
fn listen(net: &Net) -> (TcpHandle, u16) {
    let listener = net.tcp_create("127.0.0.1", 0).unwrap();
    let port = net.tcp_local_addr(listener).unwrap().port();
    net.tcp_listen(listener).unwrap();
    (listener, port)
}

fn connect(net: &Net, port: u16) -> TcpHandle {
    let client = net.tcp_create("127.0.0.1", 0).unwrap();
    net.tcp_connect(client, "127.0.0.1", port, 2_000).unwrap();
    client
}

fn accepted_child(sink: &RecordingSink, listener: TcpHandle) -> TcpHandle {
    let event = sink
        .wait_for(WAIT, |e| matches!(e, Event::Accepted { listener: l, .. } if *l == listener))
        .expect("no accept event");
    match event {
        Event::Accepted { child, .. } => child,
        _ => unreachable!(),
    }
}

#[test]
fn echo_then_disconnect() {
    let sink = RecordingSink::new();
    let net = Net::startup(&sink).unwrap();

    let (listener, port) = listen(&net);
    let client = connect(&net, port);
    let child = accepted_child(&sink, listener);

    // The child is the server-side view of the client connection.
    assert_eq!(
        net.tcp_remote_addr(child).unwrap(),
        net.tcp_local_addr(client).unwrap()
    );

    net.tcp_send(client, b"hello").unwrap();
    let received = sink
        .wait_for(WAIT, |e| matches!(e, Event::Received { handle, .. } if *handle == child))
        .expect("no receive event");
    assert_eq!(received, Event::Received { handle: child, payload: b"hello".to_vec() });

    net.tcp_destroy(client).unwrap();
    sink.wait_for(WAIT, |e| matches!(e, Event::Disconnected { handle } if *handle == child))
        .expect("no disconnect event");

    let events = sink.snapshot();
    assert_eq!(events.iter().filter(|e| matches!(e, Event::Received { .. })).count(), 1);
    assert_eq!(events.iter().filter(|e| matches!(e, Event::Disconnected { .. })).count(), 1);
    // The destroyed client handle appears in no callback.
    assert!(events.iter().all(|e| !mentions_stream(e, client)));

    net.shutdown();
}

#[test]
fn four_mebibyte_message_arrives_whole() {
    let sink = RecordingSink::new();
    let net = Net::startup(&sink).unwrap();

    let (listener, port) = listen(&net);
    let client = connect(&net, port);
    let child = accepted_child(&sink, listener);

    let payload: Vec<u8> = (0..4 * 1024 * 1024u32).map(|i| i as u8).collect();
    net.tcp_send(client, &payload).unwrap();

    let received = sink
        .wait_for(Duration::from_secs(30), |e| {
            matches!(e, Event::Received { handle, .. } if *handle == child)
        })
        .expect("large message never arrived");
    match received {
        Event::Received { payload: got, .. } => assert!(got == payload, "payload corrupted"),
        _ => unreachable!(),
    }
    assert_eq!(sink.count(|e| matches!(e, Event::Received { .. })), 1);

    net.shutdown();
}

#[test]
fn messages_survive_kernel_chunking() {
    let sink = RecordingSink::new();
    let net = Net::startup(&sink).unwrap();

    let (listener, port) = listen(&net);
    let client = connect(&net, port);
    let child = accepted_child(&sink, listener);

    let payloads = [vec![1u8; 10], vec![2u8; 1], vec![3u8; 2000]];
    for payload in &payloads {
        net.tcp_send(client, payload).unwrap();
    }

    assert!(
        sink.wait_for_count(WAIT, 3, |e| matches!(e, Event::Received { handle, .. } if *handle == child)),
        "expected three messages"
    );
    let received: Vec<Vec<u8>> = sink
        .snapshot()
        .into_iter()
        .filter_map(|e| match e {
            Event::Received { payload, .. } => Some(payload),
            _ => None,
        })
        .collect();
    // However the kernel chunked the stream, framing restores the
    // original message boundaries in order.
    assert_eq!(received, payloads);

    net.shutdown();
}

#[test]
fn connect_to_dead_port_is_refused() {
    let sink = RecordingSink::new();
    let net = Net::startup(&sink).unwrap();

    // Grab an ephemeral port that nothing is listening on anymore.
    let dead_port = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };

    let client = net.tcp_create("127.0.0.1", 0).unwrap();
    let err = net.tcp_connect(client, "127.0.0.1", dead_port, 2_000).unwrap_err();
    assert!(matches!(err, NetError::Refused), "got {err:?}");

    net.shutdown();
}

#[test]
fn calls_after_shutdown_fail_not_started() {
    let sink = RecordingSink::new();
    let net = Net::startup(&sink).unwrap();
    let handle = net.tcp_create("127.0.0.1", 0).unwrap();

    net.shutdown();
    net.shutdown(); // idempotent

    assert!(matches!(net.tcp_create("", 0), Err(NetError::NotStarted)));
    assert!(matches!(net.tcp_send(handle, b"x"), Err(NetError::NotStarted)));
    assert!(matches!(net.udp_create("", 0), Err(NetError::NotStarted)));
}

#[test]
fn send_size_limits_are_enforced() {
    let sink = RecordingSink::new();
    let net = Net::startup(&sink).unwrap();

    let (listener, port) = listen(&net);
    let client = connect(&net, port);
    let _child = accepted_child(&sink, listener);

    assert!(matches!(net.tcp_send(client, &[]), Err(NetError::Argument(_))));
    let oversized = vec![0u8; qnet::MAX_STREAM_PAYLOAD + 1];
    assert!(matches!(net.tcp_send(client, &oversized), Err(NetError::Argument(_))));

    net.shutdown();
}
