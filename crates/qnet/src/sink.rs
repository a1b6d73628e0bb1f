use std::net::SocketAddrV4;

use crate::error::{DatagramError, StreamError};
use crate::handle::{TcpHandle, UdpHandle};

/// Application-supplied event sink.
///
/// Callbacks run on dispatcher worker threads. They may call back into
/// [`Net`](crate::Net) freely (including destroying the handle they were
/// invoked for), but must not block on work that depends on *another*
/// callback for the same endpoint, since that callback may be queued
/// behind the current one.
///
/// The core keeps only a weak reference to the sink; once the application
/// drops its last strong reference, pending events are silently skipped.
pub trait NetSink: Send + Sync {
    /// A listener produced a new connection. `child` is already armed for
    /// receiving when this fires.
    fn on_stream_accepted(&self, listener: TcpHandle, child: TcpHandle);

    /// One complete framed message arrived on `handle`. The payload slice
    /// is only valid for the duration of the call.
    fn on_stream_received(&self, handle: TcpHandle, packet: &[u8]);

    /// The peer closed the connection. Delivered at most once per handle,
    /// after every preceding `on_stream_received` for that handle. The
    /// handle is already gone from the table when this fires.
    fn on_stream_disconnected(&self, handle: TcpHandle);

    /// The connection failed and was torn down.
    fn on_stream_error(&self, handle: TcpHandle, error: StreamError);

    /// One datagram arrived on `handle`. The payload slice is only valid
    /// for the duration of the call.
    fn on_datagram(&self, handle: UdpHandle, packet: &[u8], peer: SocketAddrV4);

    /// The datagram endpoint failed and was torn down.
    fn on_datagram_error(&self, handle: UdpHandle, error: DatagramError);
}
