use std::net::SocketAddr;
use thiserror::Error as ThisError;

/// Connections are identified by the remote peer address.
pub type ConnectionId = SocketAddr;

/// Transfer state of a single client connection.
///
/// A session is either idle, waiting for the next request, or active, serving `requested_size`
/// bytes of the segment at `segment_index`. `sent_bytes` never exceeds `requested_size`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ClientSession {
    /// Index of the segment being served, or the next one to be served when idle.
    pub segment_index: u64,
    pub requested_size: u64,
    pub sent_bytes: u64,
    pub active: bool,
}

impl ClientSession {
    pub fn new() -> ClientSession {
        ClientSession::default()
    }

    /// Starts serving a new segment of `size` bytes.
    ///
    /// Clients must wait for the previous segment to be fully served before requesting another
    /// one, so this fails if a request is still outstanding.
    pub fn begin(&mut self, connection: ConnectionId, size: u64) -> Result<(), ProtocolViolation> {
        if self.active || self.sent_bytes > 0 {
            return Err(ProtocolViolation::OutstandingRequest {
                connection,
                segment_index: self.segment_index,
                requested_size: self.requested_size,
                sent_bytes: self.sent_bytes,
                new_request: size,
            });
        }

        self.requested_size = size;
        self.sent_bytes = 0;
        self.active = true;

        Ok(())
    }

    /// Bytes of the current segment still to be sent.
    pub fn remaining(&self) -> u64 {
        self.requested_size.saturating_sub(self.sent_bytes)
    }

    /// Marks the current segment as served and moves on to the next index.
    pub(crate) fn complete(&mut self) -> u64 {
        let completed = self.segment_index;

        self.requested_size = 0;
        self.sent_bytes = 0;
        self.active = false;
        self.segment_index += 1;

        completed
    }

    pub(crate) fn overrun(&self, connection: ConnectionId, attempted: u64) -> ProtocolViolation {
        ProtocolViolation::Overrun {
            connection,
            segment_index: self.segment_index,
            requested_size: self.requested_size,
            sent_bytes: self.sent_bytes,
            attempted,
        }
    }
}

/// The client and the server disagree about the state of the transfer.
///
/// These are never recovered from: they point at a bug in whoever produced the requests, so the
/// run is aborted with enough context to find it.
#[derive(Debug, ThisError, PartialEq, Eq, Clone)]
pub enum ProtocolViolation {
    #[error(
        "protocol violation; {connection} requested {new_request} bytes before segment \
         {segment_index} completed ({sent_bytes}/{requested_size} bytes sent)"
    )]
    OutstandingRequest {
        connection: ConnectionId,
        segment_index: u64,
        requested_size: u64,
        sent_bytes: u64,
        new_request: u64,
    },
    #[error(
        "protocol violation; segment {segment_index} for {connection} overran its size \
         ({sent_bytes} + {attempted} bytes sent of {requested_size})"
    )]
    Overrun {
        connection: ConnectionId,
        segment_index: u64,
        requested_size: u64,
        sent_bytes: u64,
        attempted: u64,
    },
}
