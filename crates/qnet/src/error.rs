use std::io;

use thiserror::Error;

pub type NetResult<T> = Result<T, NetError>;

/// Failure surfaced by the public API.
///
/// Transient socket errors observed on the completion path never show up
/// here; those are routed to the sink (or silently dropped) per handle.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("network core not started")]
    NotStarted,
    #[error("invalid argument: {0}")]
    Argument(&'static str),
    #[error("unknown handle {0}")]
    UnknownHandle(u32),
    #[error("handle space exhausted")]
    HandleSpace,
    #[error("invalid endpoint state: {0}")]
    State(&'static str),
    #[error("connect timed out")]
    Timeout,
    #[error("connection refused")]
    Refused,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Stream-side error taxonomy delivered through
/// [`NetSink::on_stream_error`](crate::NetSink::on_stream_error).
///
/// The integer values are part of the external contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum StreamError {
    /// A listener could not re-arm its accept operation.
    RearmAccept = 1,
    /// A freshly accepted connection could not arm its first receive.
    ArmChildRecv = 2,
    /// The peer violated the wire format.
    Malformed = 3,
    /// A connection could not re-arm its receive after a completion.
    RearmRecv = 4,
}

impl StreamError {
    pub const fn code(self) -> u32 {
        self as u32
    }
}

/// Datagram-side error taxonomy delivered through
/// [`NetSink::on_datagram_error`](crate::NetSink::on_datagram_error).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DatagramError {
    /// A datagram endpoint could not re-arm one of its receives.
    RearmRecv = 1,
}

impl DatagramError {
    pub const fn code(self) -> u32 {
        self as u32
    }
}
