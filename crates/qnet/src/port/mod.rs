//! Completion port: the boundary between synchronous submissions and the
//! readiness engine.
//!
//! Sockets are registered once, edge-triggered, for both directions. All
//! socket I/O runs on the single poller thread; submissions and
//! cancellations cross over via an injected command list plus a waker.
//! Each finished operation is pushed onto an MPMC channel that the
//! dispatcher workers block on, which preserves the completion-queue
//! contract: one submission, one completion, buffer ownership handed back.

mod op;
mod poller;

use std::io;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, unbounded};
use mio::unix::SourceFd;
use mio::{Interest, Poll, Registry, Token, Waker};

pub(crate) use op::{AcceptOp, Op, RecvFromOp, RecvOp, SendOp, SendToOp};

use crate::lock;
use crate::sock::Socket;

/// Token reserved for the submission waker.
const WAKER: Token = Token(0);

pub(crate) enum Completion {
    Io { op: Op, result: io::Result<usize> },
    /// Sentinel making one dispatcher worker exit.
    Shutdown,
}

enum Command {
    Submit { token: Token, op: Op },
    Cancel(Token),
    Shutdown,
}

struct PortShared {
    registry: Registry,
    waker: Waker,
    commands: Mutex<Vec<Command>>,
    completions_tx: Sender<Completion>,
}

impl PortShared {
    fn complete(&self, op: Op, result: io::Result<usize>) {
        // A closed channel means shutdown already ran; buffers just drop.
        let _ = self.completions_tx.send(Completion::Io { op, result });
    }
}

pub(crate) struct CompletionPort {
    shared: Arc<PortShared>,
    completions_rx: Receiver<Completion>,
    poll: Mutex<Option<Poll>>,
    poller: Mutex<Option<JoinHandle<()>>>,
    next_token: AtomicUsize,
}

impl CompletionPort {
    pub(crate) fn open() -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER)?;
        let (completions_tx, completions_rx) = unbounded();
        Ok(Self {
            shared: Arc::new(PortShared {
                registry,
                waker,
                commands: Mutex::new(Vec::new()),
                completions_tx,
            }),
            completions_rx,
            poll: Mutex::new(Some(poll)),
            poller: Mutex::new(None),
            next_token: AtomicUsize::new(1),
        })
    }

    pub(crate) fn start(&self) -> io::Result<()> {
        let Some(poll) = lock(&self.poll).take() else {
            return Ok(());
        };
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("qnet-poller".into())
            .spawn(move || poller::run(poll, &shared))?;
        *lock(&self.poller) = Some(handle);
        Ok(())
    }

    /// Associates a socket with the port. One registration for the life of
    /// the fd; edges for both directions, matched against parked
    /// operations by the poller.
    pub(crate) fn register(&self, sock: &Socket) -> io::Result<Token> {
        let token = Token(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.shared.registry.register(
            &mut SourceFd(&sock.as_raw_fd()),
            token,
            Interest::READABLE | Interest::WRITABLE,
        )?;
        Ok(token)
    }

    /// Hands an operation buffer to the port. Ownership returns through
    /// the completion channel.
    pub(crate) fn submit(&self, token: Token, op: Op) -> io::Result<()> {
        self.push(Command::Submit { token, op })
    }

    /// Aborts every operation parked on `token`. The operations still
    /// complete (with a tolerated error code), mirroring close-triggered
    /// cancellation.
    pub(crate) fn cancel(&self, token: Token) {
        let _ = self.push(Command::Cancel(token));
    }

    fn push(&self, cmd: Command) -> io::Result<()> {
        lock(&self.shared.commands).push(cmd);
        self.shared.waker.wake()
    }

    pub(crate) fn completions(&self) -> Receiver<Completion> {
        self.completions_rx.clone()
    }

    pub(crate) fn post(&self, completion: Completion) {
        let _ = self.shared.completions_tx.send(completion);
    }

    /// Stops the poller thread, aborting every parked operation out first.
    pub(crate) fn shutdown(&self) {
        let _ = self.push(Command::Shutdown);
        if let Some(handle) = lock(&self.poller).take() {
            let _ = handle.join();
        }
    }
}
