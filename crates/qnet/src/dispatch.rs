//! Worker pool draining the completion queue.
//!
//! Workers do no socket I/O themselves. Each one blocks on the channel,
//! classifies the completion result, and hands the operation buffer to the
//! resource manager for routing. One `Shutdown` sentinel per worker ends
//! the pool, after which all threads are joined.

use std::io;
use std::mem;
use std::sync::{Mutex, Weak};
use std::thread::{self, JoinHandle};

use crossbeam_channel::Receiver;
use tracing::{debug, error};

use crate::lock;
use crate::mgr::NetCore;
use crate::port::{Completion, CompletionPort};

pub(crate) struct Dispatcher {
    count: usize,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    pub(crate) fn new(count: usize) -> Self {
        Self { count, workers: Mutex::new(Vec::new()) }
    }

    pub(crate) fn start(
        &self,
        completions: &Receiver<Completion>,
        core: &Weak<NetCore>,
    ) -> io::Result<()> {
        let mut workers = lock(&self.workers);
        for i in 0..self.count {
            let rx = completions.clone();
            let core = Weak::clone(core);
            let handle = thread::Builder::new()
                .name(format!("qnet-worker-{i}"))
                .spawn(move || worker(&rx, &core))?;
            workers.push(handle);
        }
        Ok(())
    }

    /// Posts one sentinel per worker and joins them all.
    pub(crate) fn shutdown(&self, port: &CompletionPort) {
        let workers = mem::take(&mut *lock(&self.workers));
        for _ in &workers {
            port.post(Completion::Shutdown);
        }
        let me = thread::current().id();
        for handle in workers {
            // Teardown may itself run on a worker (last reference dropped
            // inside a callback); that thread exits on its own sentinel.
            if handle.thread().id() == me {
                continue;
            }
            let _ = handle.join();
        }
    }
}

fn worker(rx: &Receiver<Completion>, core: &Weak<NetCore>) {
    while let Ok(completion) = rx.recv() {
        match completion {
            Completion::Shutdown => break,
            Completion::Io { op, result } => {
                let size = match result {
                    Ok(n) => n,
                    Err(err) => {
                        // Reset/abort/refused/timeout arrive whenever a
                        // socket dies with I/O in flight; the handler sees
                        // them as a zero-byte transfer.
                        if tolerated(err.kind()) {
                            debug!(kind = op.kind(), ?err, "tolerated completion error");
                        } else {
                            error!(kind = op.kind(), ?err, "completion error");
                        }
                        0
                    }
                };
                let Some(core) = core.upgrade() else {
                    continue;
                };
                core.route(op, size);
            }
        }
    }
}

fn tolerated(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::TimedOut
    )
}
