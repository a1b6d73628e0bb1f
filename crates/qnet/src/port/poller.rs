//! Poller thread: turns edge-triggered readiness into per-operation
//! completions.
//!
//! Every submission is attempted once immediately; only a WouldBlock parks
//! it. That first attempt is what makes edge triggering safe: an edge that
//! fired before the operation existed cannot be lost, because the
//! operation starts by trying the socket anyway.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::mem;
use std::sync::Arc;

use mio::{Events, Poll, Token};
use tracing::{debug, error};

use super::op::{Op, Progress};
use super::{Command, PortShared, WAKER};
use crate::lock;

#[derive(Default)]
struct SocketOps {
    readers: VecDeque<Op>,
    writers: VecDeque<Op>,
}

pub(super) fn run(mut poll: Poll, shared: &Arc<PortShared>) {
    let mut events = Events::with_capacity(256);
    let mut sockets: HashMap<Token, SocketOps> = HashMap::new();

    'outer: loop {
        if let Err(err) = poll.poll(&mut events, None) {
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!(?err, "completion poll failed, stopping poller");
            break;
        }
        for event in events.iter() {
            if event.token() == WAKER {
                if drain_commands(shared, &mut sockets) {
                    break 'outer;
                }
            } else {
                service(shared, &mut sockets, event);
            }
        }
    }

    // Nothing survives the poller: hand every parked buffer back as
    // aborted so no operation ever goes unanswered.
    for (_, ops) in sockets.drain() {
        abort(shared, ops);
    }
    debug!("poller stopped");
}

/// Returns true when a shutdown command was seen.
fn drain_commands(shared: &Arc<PortShared>, sockets: &mut HashMap<Token, SocketOps>) -> bool {
    let mut stop = false;
    let commands = mem::take(&mut *lock(&shared.commands));
    for command in commands {
        match command {
            Command::Submit { token, op } => submit(shared, sockets, token, op),
            Command::Cancel(token) => {
                if let Some(ops) = sockets.remove(&token) {
                    abort(shared, ops);
                }
            }
            Command::Shutdown => stop = true,
        }
    }
    stop
}

fn submit(shared: &Arc<PortShared>, sockets: &mut HashMap<Token, SocketOps>, token: Token, op: Op) {
    let entry = sockets.entry(token).or_default();
    let queue = if op.is_reader() { &mut entry.readers } else { &mut entry.writers };
    // Joining a non-empty queue means the socket already blocked in this
    // direction; attempting now would also reorder the queue.
    if queue.is_empty() {
        attempt(shared, queue, op);
    } else {
        queue.push_back(op);
    }
}

fn attempt(shared: &Arc<PortShared>, queue: &mut VecDeque<Op>, mut op: Op) {
    match op.advance() {
        Progress::Pending => queue.push_back(op),
        Progress::Done(result) => shared.complete(op, result),
    }
}

fn service(shared: &Arc<PortShared>, sockets: &mut HashMap<Token, SocketOps>, event: &mio::event::Event) {
    // Unknown tokens are fine: a cancelled socket can have one last edge
    // in flight.
    let Some(ops) = sockets.get_mut(&event.token()) else {
        return;
    };
    if event.is_readable() {
        drive(shared, &mut ops.readers);
    }
    if event.is_writable() {
        drive(shared, &mut ops.writers);
    }
}

/// Retries parked operations front to back until one would block again.
fn drive(shared: &Arc<PortShared>, queue: &mut VecDeque<Op>) {
    while let Some(mut op) = queue.pop_front() {
        match op.advance() {
            Progress::Pending => {
                queue.push_front(op);
                break;
            }
            Progress::Done(result) => shared.complete(op, result),
        }
    }
}

fn abort(shared: &Arc<PortShared>, ops: SocketOps) {
    for op in ops.readers.into_iter().chain(ops.writers) {
        let err = io::Error::new(io::ErrorKind::ConnectionAborted, "operation cancelled");
        shared.complete(op, Err(err));
    }
}
