use bytes::Bytes;

use crate::session::ConnectionId;

/// What the server needs from the transport carrying its connections.
///
/// Reliable delivery, retransmission and congestion control all live behind this trait. Every
/// method must return immediately: the server runs them from its event loop.
pub trait Transport {
    /// Hands `payload` to the transport, returning how many bytes it accepted. Zero means the
    /// send buffer is full; the transport signals later when capacity frees up.
    fn send(&mut self, id: &ConnectionId, payload: Bytes) -> usize;

    /// Bytes the transport can currently accept for `id`.
    fn available_send_capacity(&self, id: &ConnectionId) -> usize;

    /// Closes the connection. No further events are delivered for it.
    fn close(&mut self, id: &ConnectionId);
}
