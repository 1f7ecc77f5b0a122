use bytes::Bytes;
use tracing::{debug, info, trace};

use crate::session::{ClientSession, ConnectionId, ProtocolViolation};
use crate::transport::Transport;

/// Result of a single transmitter invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transmit {
    /// No request is outstanding, nothing was done.
    Idle,
    /// The transport accepted `amount` bytes of the current segment.
    Sent { amount: usize },
    /// The transport could not take any bytes; wait for the next capacity event.
    Backpressure,
    /// Every byte of segment `segment_index` had been sent and the session is idle again.
    Completed { segment_index: u64 },
}

impl Transmit {
    /// Whether the connection needs another capacity event to make progress.
    pub fn wants_capacity(&self) -> bool {
        matches!(self, Transmit::Sent { .. } | Transmit::Backpressure)
    }
}

/// Filler byte for segment payloads: the low byte of the segment index.
///
/// Only meant to make segments distinguishable in packet captures. It wraps every 256 segments and
/// carries no meaning for the protocol; `ClientSession::segment_index` is the real counter.
pub fn diagnostic_marker(segment_index: u64) -> u8 {
    segment_index as u8
}

/// Sends as much of the current segment as `capacity` allows.
///
/// Invoked once when a request arrives and then on every capacity event for the connection. The
/// invocation that finds the segment fully sent is the one that completes it; later ones are
/// no-ops until the next request.
pub fn transmit<T: Transport>(
    id: &ConnectionId,
    session: &mut ClientSession,
    capacity: usize,
    transport: &mut T,
) -> Result<Transmit, ProtocolViolation> {
    if session.sent_bytes > session.requested_size {
        return Err(session.overrun(*id, 0));
    }

    if !session.active {
        trace!(
            "Nothing to send, segment {} already completed",
            session.segment_index
        );
        return Ok(Transmit::Idle);
    }

    if session.sent_bytes == session.requested_size {
        let segment_index = session.complete();
        info!("Segment {} completed", segment_index);
        return Ok(Transmit::Completed { segment_index });
    }

    if capacity == 0 {
        debug!("Send buffer full, waiting for capacity");
        return Ok(Transmit::Backpressure);
    }

    // `remaining` is non-zero here, so the payload is never empty.
    let to_send = session.remaining().min(capacity as u64) as usize;
    let payload = Bytes::from(vec![diagnostic_marker(session.segment_index); to_send]);

    debug!(
        "Attempting to send {} bytes, capacity is {}",
        to_send, capacity
    );

    let amount = transport.send(id, payload);
    if amount == 0 {
        debug!("Send rejected, send buffer full");
        return Ok(Transmit::Backpressure);
    }

    if amount > to_send {
        return Err(session.overrun(*id, amount as u64));
    }

    session.sent_bytes += amount as u64;
    debug!(
        "Sent {} bytes, {}/{} of segment {}",
        amount, session.sent_bytes, session.requested_size, session.segment_index
    );

    Ok(Transmit::Sent { amount })
}
