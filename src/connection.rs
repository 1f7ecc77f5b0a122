use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tracing::{debug, instrument, warn};

use crate::codec::RequestCodec;
use crate::config::Config;
use crate::server::Event;
use crate::session::ConnectionId;
use crate::transport::Transport;

/// A connected client, as seen by the transport.
///
/// Reading happens in a dedicated task that turns requests into events. Writing is done in place
/// with non-blocking writes; a second task waits for the socket to become writable again whenever
/// the server asks for more capacity.
struct Connection {
    writer: Arc<OwnedWriteHalf>,
    wants_capacity: Arc<Notify>,
    // Set after a write fails for any reason other than a full send buffer.
    broken: bool,
    reader: JoinHandle<()>,
    watcher: JoinHandle<()>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Both halves of the socket are owned by these tasks, aborting them closes it.
        self.reader.abort();
        self.watcher.abort();
    }
}

/// [`Transport`] over tokio TCP streams.
pub struct TcpTransport {
    connections: HashMap<ConnectionId, Connection>,
    send_window: usize,
    max_request_len: usize,
    events: UnboundedSender<Event>,
}

impl TcpTransport {
    pub(crate) fn new(config: &Config, events: UnboundedSender<Event>) -> TcpTransport {
        TcpTransport {
            connections: HashMap::new(),
            send_window: config.send_window,
            max_request_len: config.max_request_len,
            events,
        }
    }

    /// Starts delivering the events of a freshly accepted stream.
    pub(crate) fn open(&mut self, id: ConnectionId, stream: TcpStream) {
        let (reader, writer) = stream.into_split();
        let writer = Arc::new(writer);
        let wants_capacity = Arc::new(Notify::new());

        let reader = tokio::spawn(read_requests(
            id,
            reader,
            self.max_request_len,
            self.events.clone(),
        ));
        let watcher = tokio::spawn(watch_capacity(
            id,
            writer.clone(),
            wants_capacity.clone(),
            self.send_window,
            self.events.clone(),
        ));

        self.connections.insert(
            id,
            Connection {
                writer,
                wants_capacity,
                broken: false,
                reader,
                watcher,
            },
        );
    }

    /// Requests a single capacity event for `id`, delivered once the socket can take more data.
    pub(crate) fn wait_for_capacity(&self, id: &ConnectionId) {
        match self.connections.get(id) {
            Some(conn) if !conn.broken => conn.wants_capacity.notify_one(),
            _ => debug!("Not waiting for capacity of {}", id),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, id: &ConnectionId, payload: Bytes) -> usize {
        let Some(conn) = self.connections.get_mut(id) else {
            return 0;
        };
        if conn.broken {
            return 0;
        }

        match conn.writer.try_write(&payload) {
            Ok(amount) => amount,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
            Err(e) => {
                warn!("Failed to write to {}: {}", id, e);
                conn.broken = true;
                0
            }
        }
    }

    fn available_send_capacity(&self, id: &ConnectionId) -> usize {
        match self.connections.get(id) {
            Some(conn) if !conn.broken => self.send_window,
            _ => 0,
        }
    }

    fn close(&mut self, id: &ConnectionId) {
        self.connections.remove(id);
    }
}

#[instrument(name = "reader", skip(reader, max_request_len, events))]
async fn read_requests(
    peer: ConnectionId,
    reader: OwnedReadHalf,
    max_request_len: usize,
    events: UnboundedSender<Event>,
) {
    let mut requests = FramedRead::new(reader, RequestCodec::new(max_request_len));

    while let Some(request) = requests.next().await {
        let event = match request {
            Ok(Ok(payload)) => Event::Readable { id: peer, payload },
            Ok(Err(e)) => {
                warn!("Rejected request: {}", e);
                continue;
            }
            Err(error) => {
                // Nothing more can be read from this stream, it is as good as closed.
                let _ = events.send(Event::PeerError { id: peer, error });
                break;
            }
        };

        // The receiver is only dropped once the server stopped.
        if events.send(event).is_err() {
            return;
        }
    }

    let _ = events.send(Event::PeerClosed { id: peer });
}

#[instrument(name = "watcher", skip(writer, wants_capacity, send_window, events))]
async fn watch_capacity(
    peer: ConnectionId,
    writer: Arc<OwnedWriteHalf>,
    wants_capacity: Arc<Notify>,
    send_window: usize,
    events: UnboundedSender<Event>,
) {
    loop {
        wants_capacity.notified().await;

        if let Err(error) = writer.writable().await {
            let _ = events.send(Event::PeerError { id: peer, error });
            return;
        }

        let event = Event::CapacityAvailable {
            id: peer,
            capacity: send_window,
        };
        if events.send(event).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc::{self, UnboundedReceiver};
    use tokio::time::{timeout, Duration};

    async fn open() -> (TcpTransport, UnboundedReceiver<Event>, ConnectionId, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (stream, id) = listener.accept().await.unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let config = Config::default().send_window(1000).max_request_len(8);
        let mut transport = TcpTransport::new(&config, tx);
        transport.open(id, stream);

        (transport, rx, id, client)
    }

    async fn next(rx: &mut UnboundedReceiver<Event>) -> Event {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn requests_become_readable_events() {
        let (_transport, mut rx, id, mut client) = open().await;

        client.write_all(b"1000\n20").await.unwrap();
        client.shutdown().await.unwrap();

        match next(&mut rx).await {
            Event::Readable { id: peer, payload } => {
                assert_eq!(peer, id);
                assert_eq!(payload, Bytes::from("1000"));
            }
            event => panic!("unexpected event {:?}", event),
        }
        // The unterminated "20" is never served.
        assert!(matches!(next(&mut rx).await, Event::PeerClosed { id: peer } if peer == id));
    }

    #[tokio::test]
    async fn oversized_request_is_skipped() {
        let (_transport, mut rx, id, mut client) = open().await;

        client.write_all(b"1234567890\n42\n").await.unwrap();
        client.shutdown().await.unwrap();

        assert!(matches!(
            next(&mut rx).await,
            Event::Readable { payload, .. } if payload == Bytes::from("42")
        ));
        assert!(matches!(next(&mut rx).await, Event::PeerClosed { id: peer } if peer == id));
    }

    #[tokio::test]
    async fn capacity_events_only_when_asked() {
        let (transport, mut rx, id, _client) = open().await;

        transport.wait_for_capacity(&id);

        assert!(matches!(
            next(&mut rx).await,
            Event::CapacityAvailable { capacity: 1000, .. }
        ));
        // Not re-armed, nothing else must show up.
        assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn send_writes_to_socket() {
        let (mut transport, _rx, id, mut client) = open().await;

        assert_eq!(transport.available_send_capacity(&id), 1000);
        // Writes are non-blocking, wait until the reactor saw the socket writable.
        transport.connections[&id].writer.writable().await.unwrap();
        let sent = transport.send(&id, Bytes::from(vec![7u8; 100]));
        assert_eq!(sent, 100);

        let mut buf = [0u8; 100];
        client.read_exact(&mut buf).await.unwrap();
        assert!(buf.iter().all(|&b| b == 7));
    }

    #[tokio::test]
    async fn close_forgets_connection() {
        let (mut transport, _rx, id, mut client) = open().await;

        transport.close(&id);

        assert!(transport.is_empty());
        assert_eq!(transport.available_send_capacity(&id), 0);
        assert_eq!(transport.send(&id, Bytes::from("x")), 0);

        // The server side of the socket goes away.
        let mut buf = [0u8; 1];
        let read = timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
    }
}
