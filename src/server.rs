use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use strum_macros::IntoStaticStr;
use thiserror::Error as ThisError;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinSet;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::Config;
use crate::connection::TcpTransport;
use crate::manager::{self, ConnectionManager};
use crate::session::{ConnectionId, ProtocolViolation};
use crate::transmit::Transmit;
use crate::transport::Transport;
use crate::Error;

const LISTEN_BACKLOG: i32 = 1024;

#[derive(Debug, ThisError)]
#[error("bind error; failed to listen on {addr}: {source}")]
pub struct BindError {
    pub addr: SocketAddr,
    #[source]
    pub source: io::Error,
}

/// Everything that can happen to a connection, in the order the dispatcher has to see it.
#[derive(Debug, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub(crate) enum Event {
    Incoming { id: ConnectionId, stream: TcpStream },
    Readable { id: ConnectionId, payload: Bytes },
    CapacityAvailable { id: ConnectionId, capacity: usize },
    PeerClosed { id: ConnectionId },
    PeerError { id: ConnectionId, error: io::Error },
}

impl Event {
    fn id(&self) -> ConnectionId {
        match self {
            Event::Incoming { id, .. }
            | Event::Readable { id, .. }
            | Event::CapacityAvailable { id, .. }
            | Event::PeerClosed { id }
            | Event::PeerError { id, .. } => *id,
        }
    }
}

/// The streaming server: a set of listeners and the event loop serving their connections.
///
/// Connections are accepted and read concurrently, but their events are funneled into a single
/// dispatcher that owns all session state, so handlers never run in parallel. The run ends when the
/// last client disconnects or when the shutdown token is cancelled.
pub struct Server {
    config: Config,
    listeners: Vec<TcpListener>,
    shutdown: CancellationToken,
}

impl Server {
    /// Listens on every configured address, all on the same port.
    pub async fn bind(config: Config) -> Result<Server, BindError> {
        let mut listeners = Vec::with_capacity(config.bind.len());

        for ip in &config.bind {
            let addr = SocketAddr::new(*ip, config.port);
            let listener = listen(addr).map_err(|source| BindError { addr, source })?;
            info!("Listening on {}", listener.local_addr().unwrap_or(addr));
            listeners.push(listener);
        }

        Ok(Server {
            config,
            listeners,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|listener| listener.local_addr().ok())
            .collect()
    }

    /// Cancelling the token stops the server. It is also cancelled by the server itself once no
    /// clients remain.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serves connections until shutdown.
    ///
    /// A protocol violation by any client ends the run and is returned.
    pub async fn run(self) -> Result<(), ProtocolViolation> {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut accepting = JoinSet::new();
        for listener in self.listeners {
            accepting.spawn(accept(listener, tx.clone()));
        }

        let transport = TcpTransport::new(&self.config, tx);
        let mut manager = ConnectionManager::new(transport, self.shutdown.clone());

        let res = loop {
            let event = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break Ok(()),
                event = rx.recv() => event,
            };

            // The transport keeps a sender alive for as long as the manager exists.
            let Some(event) = event else {
                break Ok(());
            };

            if let Err(e) = dispatch(&mut manager, event) {
                error!("{}", e);
                break Err(e);
            }
        };

        // Listeners are owned by the accept tasks, wait for them to be dropped.
        accepting.shutdown().await;
        manager.stop();
        info!("Server stopped");

        res
    }
}

/// Entry point used by the binary: sets up logging, binds, and serves until the last client
/// leaves or the process is interrupted.
pub async fn run(config: Config) -> Result<(), Error> {
    let _ = tracing_subscriber::fmt()
        .try_init()
        .map_err(|e| debug!("Failed to initialize global tracing: {}", e));

    let config = config.validate()?;
    let server = Server::bind(config).await?;

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            shutdown.cancel();
        }
    });

    server.run().await?;
    Ok(())
}

fn listen(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    // Let the IPv6 wildcard listener coexist with the IPv4 one on the same port.
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;

    TcpListener::from_std(socket.into())
}

async fn accept(listener: TcpListener, events: UnboundedSender<Event>) {
    loop {
        match listener.accept().await {
            Ok((stream, id)) => {
                if events.send(Event::Incoming { id, stream }).is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
                // Typically out of file descriptors, give in-flight connections time to close.
                sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

#[instrument(name = "event", skip_all, fields(kind, peer))]
fn dispatch(
    manager: &mut ConnectionManager<TcpTransport>,
    event: Event,
) -> Result<(), ProtocolViolation> {
    let id = event.id();
    let kind: &'static str = (&event).into();

    tracing::Span::current()
        .record("kind", kind)
        .record("peer", tracing::field::display(id));

    let res = match event {
        Event::Incoming { id, stream } => {
            if !manager.on_connection_request(&id) {
                return Ok(());
            }
            match manager.on_accepted(id) {
                Ok(()) => {
                    manager.transport_mut().open(id, stream);
                    Ok(Transmit::Idle)
                }
                Err(e) => Err(e),
            }
        }
        Event::Readable { id, payload } => manager.on_readable(&id, &payload),
        Event::CapacityAvailable { id, capacity } => manager.on_capacity_available(&id, capacity),
        Event::PeerClosed { id } => {
            manager.on_peer_closed(&id);
            Ok(Transmit::Idle)
        }
        Event::PeerError { id, error } => {
            manager.on_peer_error(&id, &error);
            Ok(Transmit::Idle)
        }
    };

    // Once the socket took the last byte, complete the segment right away: the client may
    // already have its next request on the way, ahead of any capacity event.
    let res = res.and_then(|transmit| match transmit {
        Transmit::Sent { .. }
            if manager.store().get(&id).is_ok_and(|s| s.remaining() == 0) =>
        {
            let capacity = manager.transport().available_send_capacity(&id);
            manager.on_capacity_available(&id, capacity)
        }
        transmit => Ok(transmit),
    });

    match res {
        Ok(transmit) => {
            if transmit.wants_capacity() {
                manager.transport().wait_for_capacity(&id);
            }
            Ok(())
        }
        Err(manager::Error::Protocol(e)) => Err(e),
        // Events still queued for a connection that is gone.
        Err(manager::Error::Store(e)) => {
            debug!("Dropping event: {}", e);
            Ok(())
        }
    }
}
