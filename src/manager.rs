use std::io;
use thiserror::Error as ThisError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::command;
use crate::session::{ConnectionId, ProtocolViolation};
use crate::store::{self, Store};
use crate::transmit::{transmit, Transmit};
use crate::transport::Transport;

#[derive(Debug, ThisError, PartialEq, Eq, Clone)]
pub enum Error {
    #[error(transparent)]
    Protocol(#[from] ProtocolViolation),
    #[error(transparent)]
    Store(#[from] store::Error),
}

/// Reacts to the transport events of every connection and drives their segment transfers.
///
/// The manager performs no I/O of its own: it is handed events one at a time, in the order they
/// happened, and talks back to the connections through its [`Transport`]. Once the last
/// connection closes it cancels its shutdown token to end the run.
pub struct ConnectionManager<T> {
    store: Store,
    transport: T,
    shutdown: CancellationToken,
    stopped: bool,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(transport: T, shutdown: CancellationToken) -> ConnectionManager<T> {
        ConnectionManager {
            store: Store::new(),
            transport,
            shutdown,
            stopped: false,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Admission control. Every connection is accepted until the manager is stopped.
    pub fn on_connection_request(&self, id: &ConnectionId) -> bool {
        debug!("Connection request from {}", id);
        !self.stopped
    }

    pub fn on_accepted(&mut self, id: ConnectionId) -> Result<(), Error> {
        if self.stopped {
            return Ok(());
        }

        self.store.register(id)?;
        info!("Accepted connection from {}", id);
        Ok(())
    }

    /// Handles a request payload: starts serving the requested segment and makes a first send
    /// attempt right away.
    ///
    /// Malformed requests are dropped with a warning and leave the session untouched.
    pub fn on_readable(&mut self, id: &ConnectionId, payload: &[u8]) -> Result<Transmit, Error> {
        if self.stopped {
            return Ok(Transmit::Idle);
        }

        let session = self.store.get_mut(id)?;

        let size = match command::decode(payload) {
            Ok(size) => size,
            Err(e) => {
                warn!("Rejected request from {}: {}", id, e);
                return Ok(Transmit::Idle);
            }
        };

        info!(
            "Received request for segment {} of size {}",
            session.segment_index, size
        );

        session.begin(*id, size)?;

        let capacity = self.transport.available_send_capacity(id);
        Ok(transmit(id, session, capacity, &mut self.transport)?)
    }

    pub fn on_capacity_available(
        &mut self,
        id: &ConnectionId,
        capacity: usize,
    ) -> Result<Transmit, Error> {
        if self.stopped {
            return Ok(Transmit::Idle);
        }

        let session = self.store.get_mut(id)?;
        Ok(transmit(id, session, capacity, &mut self.transport)?)
    }

    /// Forgets the connection. Returns `true` if it was the last one and the shutdown was
    /// requested as a result.
    pub fn on_peer_closed(&mut self, id: &ConnectionId) -> bool {
        if self.stopped {
            return false;
        }

        let empty = match self.store.remove(id) {
            Ok(empty) => empty,
            Err(e) => {
                warn!("Ignoring close: {}", e);
                return false;
            }
        };

        self.transport.close(id);
        info!("Connection from {} closed", id);

        if empty && !self.shutdown.is_cancelled() {
            info!("No remaining client connections, shutting down");
            self.shutdown.cancel();
            return true;
        }

        false
    }

    /// Only logged. The session stays registered until the connection closes or the manager stops.
    pub fn on_peer_error(&self, id: &ConnectionId, error: &io::Error) {
        warn!("Connection error from {}: {}", id, error);
    }

    /// Closes every connection. Handlers are no-ops from then on.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        for (id, session) in self.store.drain() {
            trace!("Closing {} at segment {}", id, session.segment_index);
            self.transport.close(&id);
        }

        info!("Connection manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::collections::{HashMap, HashSet};

    #[derive(Default)]
    struct MockTransport {
        capacity: usize,
        sent: HashMap<ConnectionId, u64>,
        closed: HashSet<ConnectionId>,
    }

    impl Transport for MockTransport {
        fn send(&mut self, id: &ConnectionId, payload: Bytes) -> usize {
            *self.sent.entry(*id).or_default() += payload.len() as u64;
            payload.len()
        }

        fn available_send_capacity(&self, _id: &ConnectionId) -> usize {
            self.capacity
        }

        fn close(&mut self, id: &ConnectionId) {
            self.closed.insert(*id);
        }
    }

    fn peer(port: u16) -> ConnectionId {
        ConnectionId::from(([10, 1, 1, 1], port))
    }

    fn setup(capacity: usize) -> (ConnectionManager<MockTransport>, CancellationToken) {
        let shutdown = CancellationToken::new();
        let transport = MockTransport {
            capacity,
            ..MockTransport::default()
        };
        (ConnectionManager::new(transport, shutdown.clone()), shutdown)
    }

    #[test]
    fn accepts_every_connection() {
        let (manager, _) = setup(0);

        assert!(manager.on_connection_request(&peer(1)));
        assert!(manager.on_connection_request(&peer(2)));
    }

    #[test]
    fn accepted_connection_gets_idle_session() {
        let (mut manager, _) = setup(0);

        manager.on_accepted(peer(1)).unwrap();

        let session = manager.store().get(&peer(1)).unwrap();
        assert_eq!(session.segment_index, 0);
        assert!(!session.active);
    }

    #[test]
    fn duplicate_accept() {
        let (mut manager, _) = setup(0);
        manager.on_accepted(peer(1)).unwrap();

        let err = manager.on_accepted(peer(1)).unwrap_err();

        assert_eq!(err, Error::Store(store::Error::DuplicateConnection(peer(1))));
    }

    #[test]
    fn segment_streamed_in_capacity_sized_chunks() {
        let (mut manager, _) = setup(1000);
        manager.on_accepted(peer(1)).unwrap();

        let first = manager.on_readable(&peer(1), b"500000\n").unwrap();
        assert_eq!(first, Transmit::Sent { amount: 1000 });

        let mut events = 0;
        let completed = loop {
            events += 1;
            match manager.on_capacity_available(&peer(1), 1000).unwrap() {
                Transmit::Sent { amount } => assert_eq!(amount, 1000),
                Transmit::Completed { segment_index } => break segment_index,
                other => panic!("unexpected {:?}", other),
            }
        };

        assert_eq!(events, 500);
        assert_eq!(completed, 0);
        assert_eq!(manager.transport().sent[&peer(1)], 500000);

        let session = manager.store().get(&peer(1)).unwrap();
        assert_eq!(session.segment_index, 1);
        assert!(!session.active);
    }

    #[test]
    fn empty_segment_completes_on_request() {
        let (mut manager, _) = setup(1000);
        manager.on_accepted(peer(1)).unwrap();

        let res = manager.on_readable(&peer(1), b"0").unwrap();

        assert_eq!(res, Transmit::Completed { segment_index: 0 });
        assert!(manager.transport().sent.is_empty());
        assert_eq!(manager.store().get(&peer(1)).unwrap().segment_index, 1);
    }

    #[test]
    fn eager_attempt_without_capacity() {
        let (mut manager, _) = setup(0);
        manager.on_accepted(peer(1)).unwrap();

        let res = manager.on_readable(&peer(1), b"100").unwrap();

        assert_eq!(res, Transmit::Backpressure);
        let session = manager.store().get(&peer(1)).unwrap();
        assert!(session.active);
        assert_eq!(session.sent_bytes, 0);
    }

    #[test]
    fn zero_capacity_mid_transfer() {
        let (mut manager, _) = setup(1000);
        manager.on_accepted(peer(1)).unwrap();
        manager.on_readable(&peer(1), b"5000").unwrap();

        let res = manager.on_capacity_available(&peer(1), 0).unwrap();

        assert_eq!(res, Transmit::Backpressure);
        let session = manager.store().get(&peer(1)).unwrap();
        assert_eq!(session.sent_bytes, 1000);
        assert!(session.active);
    }

    #[test]
    fn request_before_previous_completed() {
        for size in [0u64, 1, 1000, u64::MAX] {
            let (mut manager, _) = setup(10);
            manager.on_accepted(peer(1)).unwrap();
            manager.on_readable(&peer(1), b"1000").unwrap();

            let err = manager
                .on_readable(&peer(1), size.to_string().as_bytes())
                .unwrap_err();

            assert!(matches!(
                err,
                Error::Protocol(ProtocolViolation::OutstandingRequest { new_request, .. })
                    if new_request == size
            ));
        }
    }

    #[test]
    fn request_after_bytes_sent_but_not_completed() {
        let (mut manager, _) = setup(10);
        manager.on_accepted(peer(1)).unwrap();
        manager.on_readable(&peer(1), b"10").unwrap();

        // All bytes are out, but the completion has not been observed yet.
        let err = manager.on_readable(&peer(1), b"10").unwrap_err();

        assert!(matches!(
            err,
            Error::Protocol(ProtocolViolation::OutstandingRequest { sent_bytes: 10, .. })
        ));
    }

    #[test]
    fn next_request_after_completion() {
        let (mut manager, _) = setup(10);
        manager.on_accepted(peer(1)).unwrap();
        manager.on_readable(&peer(1), b"10").unwrap();
        manager.on_capacity_available(&peer(1), 10).unwrap();

        let res = manager.on_readable(&peer(1), b"5").unwrap();

        assert_eq!(res, Transmit::Sent { amount: 5 });
        assert_eq!(manager.store().get(&peer(1)).unwrap().segment_index, 1);
    }

    #[test]
    fn malformed_request_is_rejected() {
        let (mut manager, _) = setup(10);
        manager.on_accepted(peer(1)).unwrap();

        let res = manager.on_readable(&peer(1), b"ten").unwrap();

        assert_eq!(res, Transmit::Idle);
        assert!(!manager.store().get(&peer(1)).unwrap().active);

        // The connection is still usable.
        let res = manager.on_readable(&peer(1), b"10").unwrap();
        assert_eq!(res, Transmit::Sent { amount: 10 });
    }

    #[test]
    fn events_for_unknown_connection() {
        let (mut manager, _) = setup(10);

        assert_eq!(
            manager.on_readable(&peer(1), b"10"),
            Err(Error::Store(store::Error::UnknownConnection(peer(1))))
        );
        assert_eq!(
            manager.on_capacity_available(&peer(1), 10),
            Err(Error::Store(store::Error::UnknownConnection(peer(1))))
        );
    }

    #[test]
    fn shutdown_after_last_connection_closes() {
        let (mut manager, shutdown) = setup(10);
        manager.on_accepted(peer(1)).unwrap();
        manager.on_accepted(peer(2)).unwrap();

        assert!(!manager.on_peer_closed(&peer(1)));
        assert!(!shutdown.is_cancelled());

        assert!(manager.on_peer_closed(&peer(2)));
        assert!(shutdown.is_cancelled());

        // Spurious events afterwards must not fire it again.
        assert!(!manager.on_peer_closed(&peer(2)));
        assert!(!manager.on_peer_closed(&peer(3)));
        assert!(manager.transport().closed.contains(&peer(1)));
        assert!(manager.transport().closed.contains(&peer(2)));
    }

    #[test]
    fn closing_unknown_connection_does_not_shut_down() {
        let (mut manager, shutdown) = setup(10);

        assert!(!manager.on_peer_closed(&peer(1)));
        assert!(!shutdown.is_cancelled());
    }

    #[test]
    fn peer_error_keeps_session() {
        let (mut manager, shutdown) = setup(10);
        manager.on_accepted(peer(1)).unwrap();

        let error = io::Error::from(io::ErrorKind::ConnectionReset);
        manager.on_peer_error(&peer(1), &error);

        assert!(manager.store().contains(&peer(1)));
        assert!(!shutdown.is_cancelled());
    }

    #[test]
    fn stop_closes_everything() {
        let (mut manager, shutdown) = setup(10);
        manager.on_accepted(peer(1)).unwrap();
        manager.on_accepted(peer(2)).unwrap();
        manager.on_readable(&peer(1), b"100").unwrap();

        manager.stop();

        assert!(manager.is_stopped());
        assert!(manager.store().is_empty());
        assert_eq!(manager.transport().closed.len(), 2);

        // Nothing reacts after a stop.
        assert!(!manager.on_connection_request(&peer(3)));
        assert_eq!(manager.on_accepted(peer(3)), Ok(()));
        assert_eq!(
            manager.on_capacity_available(&peer(1), 10),
            Ok(Transmit::Idle)
        );
        assert_eq!(manager.on_readable(&peer(1), b"10"), Ok(Transmit::Idle));
        assert!(!manager.on_peer_closed(&peer(1)));
        assert!(manager.store().is_empty());
        assert_eq!(manager.transport().sent[&peer(1)], 10);
        assert!(!shutdown.is_cancelled());
    }
}
