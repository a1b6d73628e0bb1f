#![allow(dead_code)]

use std::net::SocketAddrV4;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use qnet::{DatagramError, NetSink, StreamError, TcpHandle, UdpHandle};

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Accepted { listener: TcpHandle, child: TcpHandle },
    Received { handle: TcpHandle, payload: Vec<u8> },
    Disconnected { handle: TcpHandle },
    StreamFailed { handle: TcpHandle, code: u32 },
    Datagram { handle: UdpHandle, payload: Vec<u8>, peer: SocketAddrV4 },
    DatagramFailed { handle: UdpHandle, code: u32 },
}

/// Sink that records every callback for later assertions.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Event>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    pub fn snapshot(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn count<F>(&self, pred: F) -> usize
    where
        F: Fn(&Event) -> bool,
    {
        self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
    }

    /// Polls until an event matches or the deadline passes.
    pub fn wait_for<F>(&self, timeout: Duration, pred: F) -> Option<Event>
    where
        F: Fn(&Event) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(event) = self.events.lock().unwrap().iter().find(|e| pred(e)).cloned() {
                return Some(event);
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Polls until at least `want` events match or the deadline passes.
    pub fn wait_for_count<F>(&self, timeout: Duration, want: usize, pred: F) -> bool
    where
        F: Fn(&Event) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if self.count(&pred) >= want {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }
}

impl NetSink for RecordingSink {
    fn on_stream_accepted(&self, listener: TcpHandle, child: TcpHandle) {
        self.push(Event::Accepted { listener, child });
    }

    fn on_stream_received(&self, handle: TcpHandle, packet: &[u8]) {
        self.push(Event::Received { handle, payload: packet.to_vec() });
    }

    fn on_stream_disconnected(&self, handle: TcpHandle) {
        self.push(Event::Disconnected { handle });
    }

    fn on_stream_error(&self, handle: TcpHandle, error: StreamError) {
        self.push(Event::StreamFailed { handle, code: error.code() });
    }

    fn on_datagram(&self, handle: UdpHandle, packet: &[u8], peer: SocketAddrV4) {
        self.push(Event::Datagram { handle, payload: packet.to_vec(), peer });
    }

    fn on_datagram_error(&self, handle: UdpHandle, error: DatagramError) {
        self.push(Event::DatagramFailed { handle, code: error.code() });
    }
}

/// True when `event` references the given stream handle anywhere.
pub fn mentions_stream(event: &Event, handle: TcpHandle) -> bool {
    match *event {
        Event::Accepted { listener, child } => listener == handle || child == handle,
        Event::Received { handle: h, .. }
        | Event::Disconnected { handle: h }
        | Event::StreamFailed { handle: h, .. } => h == handle,
        Event::Datagram { .. } | Event::DatagramFailed { .. } => false,
    }
}
