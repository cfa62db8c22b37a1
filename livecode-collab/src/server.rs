//! WebSocket relay server.
//!
//! ```text
//! Peer A ──┐                          ┌── outbox ──► Peer B
//!          ├── SessionRegistry ── Session ── BroadcastGroup
//! Peer B ──┘          │               └── outbox ──► Peer A
//!                     │
//!          discovery API (axum)      ExecutionRelay ── Executor
//! ```
//!
//! Each connection runs two tasks. The reader decodes frames into a channel;
//! the dispatch loop owns the socket's write half and waits on that channel,
//! the peer's outbox and a heartbeat tick. Frame handlers never suspend.
//!
//! The relay keeps no document state. It routes opaque payloads, picks a
//! snapshot provider for late joiners and runs shared executions.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use livecode_core::SiteId;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;

use crate::config::ServerConfig;
use crate::discovery;
use crate::execution::{ExecutionRelay, ExecutionRequest, Executor, ProcessExecutor};
use crate::protocol::{
    Envelope, ErrorCode, JoinAck, JoinRequest, PeerInfo, ProtocolError, Relayed, SessionId,
    SnapshotPayload, WireFormat,
};
use crate::registry::{Session, SessionRegistry};

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_sessions: usize,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
}

struct Shared {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    execution: ExecutionRelay,
    stats: AtomicServerStats,
}

pub struct SyncServer {
    shared: Arc<Shared>,
}

impl SyncServer {
    pub fn new(config: ServerConfig, executor: Arc<dyn Executor>) -> Self {
        let registry = Arc::new(SessionRegistry::new(
            config.max_peers_per_session,
            config.outbox_capacity,
        ));
        let execution = ExecutionRelay::new(executor, config.execution.timeout());
        Self {
            shared: Arc::new(Shared {
                config,
                registry,
                execution,
                stats: AtomicServerStats::default(),
            }),
        }
    }

    /// Server that runs code through local interpreters.
    pub fn with_process_executor(config: ServerConfig) -> Self {
        let executor = Arc::new(ProcessExecutor::new(&config.execution));
        Self::new(config, executor)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.shared.registry
    }

    pub fn stats(&self) -> ServerStats {
        let stats = &self.shared.stats;
        ServerStats {
            total_connections: stats.total_connections.load(Ordering::Relaxed),
            active_connections: stats.active_connections.load(Ordering::Relaxed),
            total_messages: stats.total_messages.load(Ordering::Relaxed),
            total_bytes: stats.total_bytes.load(Ordering::Relaxed),
            active_sessions: self.shared.registry.session_count(),
        }
    }

    /// Bind the configured addresses and serve until an accept error.
    pub async fn run(&self) -> io::Result<()> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        log::info!("Relay listening on {}", listener.local_addr()?);

        let discovery = match &self.shared.config.http_addr {
            Some(addr) => {
                let http = TcpListener::bind(addr).await?;
                log::info!("Discovery API listening on {}", http.local_addr()?);
                Some(self.spawn_discovery(http))
            }
            None => None,
        };

        let result = self.serve(listener).await;
        if let Some(handle) = discovery {
            handle.abort();
        }
        result
    }

    /// Serve the discovery API on an already bound listener.
    pub fn spawn_discovery(&self, listener: TcpListener) -> JoinHandle<()> {
        let app = discovery::router(self.shared.registry.clone());
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                log::error!("Discovery API stopped: {e}");
            }
        })
    }

    /// Accept realtime connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> io::Result<()> {
        let sweeper = self.spawn_sweeper();
        let result = loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => break Err(e),
            };
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        };
        sweeper.abort();
        result
    }

    fn spawn_sweeper(&self) -> JoinHandle<()> {
        let registry = self.shared.registry.clone();
        let ttl = self.shared.config.session_idle_ttl();
        let period = (ttl / 4).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let removed = registry.sweep_idle(Instant::now(), ttl);
                if removed > 0 {
                    log::info!("Swept {removed} idle sessions");
                }
            }
        })
    }
}

enum ReaderEvent {
    Frame {
        envelope: Envelope,
        format: WireFormat,
        size: usize,
    },
    /// Control or undecodable frame: proof of life only
    Heard,
}

struct Membership {
    session: Arc<Session>,
    site: SiteId,
    token: u64,
}

impl Membership {
    fn session_id(&self) -> SessionId {
        self.session.id()
    }
}

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Arc<Shared>,
) -> Result<(), tungstenite::Error> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (sink, mut source) = ws_stream.split();
    log::info!("WebSocket connection established from {addr}");

    shared.stats.total_connections.fetch_add(1, Ordering::Relaxed);
    shared.stats.active_connections.fetch_add(1, Ordering::Relaxed);

    let (inbound_tx, inbound_rx) = mpsc::channel(64);
    let reader = tokio::spawn(async move {
        while let Some(message) = source.next().await {
            let message = match message {
                Ok(message) => message,
                Err(e) => {
                    log::debug!("Read error from {addr}: {e}");
                    break;
                }
            };
            let size = message.len();
            let event = match Envelope::from_message(message) {
                Ok(Some((envelope, format))) => ReaderEvent::Frame {
                    envelope,
                    format,
                    size,
                },
                Ok(None) => ReaderEvent::Heard,
                Err(ProtocolError::ConnectionClosed) => break,
                Err(e) => {
                    log::warn!("Dropping undecodable frame from {addr}: {e}");
                    ReaderEvent::Heard
                }
            };
            if inbound_tx.send(event).await.is_err() {
                break;
            }
        }
    });

    let mut connection = Connection {
        shared: shared.clone(),
        addr,
        sink,
        format: WireFormat::Binary,
        membership: None,
        outbox: None,
        last_heard: Instant::now(),
    };
    let result = connection.dispatch(inbound_rx).await;

    reader.abort();
    connection.leave();
    let _ = connection.sink.close().await;
    shared.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
    log::info!("Connection closed from {addr}");
    result
}

struct Connection {
    shared: Arc<Shared>,
    addr: SocketAddr,
    sink: WsSink,
    /// Format of the last frame the peer sent; replies follow it
    format: WireFormat,
    membership: Option<Membership>,
    outbox: Option<mpsc::Receiver<Arc<Envelope>>>,
    last_heard: Instant,
}

async fn next_outgoing(outbox: &mut Option<mpsc::Receiver<Arc<Envelope>>>) -> Option<Arc<Envelope>> {
    match outbox {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl Connection {
    async fn dispatch(
        &mut self,
        mut inbound: mpsc::Receiver<ReaderEvent>,
    ) -> Result<(), tungstenite::Error> {
        let period = self.shared.config.heartbeat_interval();
        let peer_timeout = self.shared.config.peer_timeout();
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = inbound.recv() => {
                    let Some(event) = event else { break };
                    self.last_heard = Instant::now();
                    if let ReaderEvent::Frame { envelope, format, size } = event {
                        self.shared.stats.total_messages.fetch_add(1, Ordering::Relaxed);
                        self.shared.stats.total_bytes.fetch_add(size as u64, Ordering::Relaxed);
                        self.format = format;
                        for reply in self.handle(envelope) {
                            self.send(&reply).await?;
                        }
                    }
                }

                outgoing = next_outgoing(&mut self.outbox) => {
                    match outgoing {
                        Some(envelope) => self.send(&envelope).await?,
                        None => {
                            // Replaced by a newer connection for the same site
                            log::info!("Outbox of {} closed, dropping connection", self.addr);
                            self.membership = None;
                            break;
                        }
                    }
                }

                _ = heartbeat.tick() => {
                    if self.last_heard.elapsed() > peer_timeout {
                        log::info!("Peer at {} silent for {peer_timeout:?}, dropping", self.addr);
                        break;
                    }
                    self.send(&Envelope::Ping).await?;
                }
            }
        }
        Ok(())
    }

    async fn send(&mut self, envelope: &Envelope) -> Result<(), tungstenite::Error> {
        match envelope.to_message(self.format) {
            Ok(message) => self.sink.send(message).await,
            Err(e) => {
                log::error!("Failed to encode {}: {e}", envelope.kind());
                Ok(())
            }
        }
    }

    /// Handle one frame; returns replies for this connection only.
    fn handle(&mut self, envelope: Envelope) -> Vec<Envelope> {
        log::trace!("{} from {}", envelope.kind(), self.addr);
        match envelope {
            Envelope::Join(request) => self.join(request),
            Envelope::Ping => vec![Envelope::Pong],
            Envelope::Pong => Vec::new(),
            Envelope::SyncUpdate(_)
            | Envelope::AwarenessUpdate(_)
            | Envelope::SnapshotRequest { .. }
            | Envelope::Snapshot(_)
            | Envelope::ExecutionSubmit { .. }
                if self.membership.is_none() =>
            {
                vec![Envelope::error(
                    ErrorCode::NotJoined,
                    format!("join a session before sending {}", envelope.kind()),
                )]
            }
            Envelope::SyncUpdate(Relayed { data, .. }) => {
                self.relay(|from| Envelope::SyncUpdate(Relayed { from, data }))
            }
            Envelope::AwarenessUpdate(Relayed { data, .. }) => {
                self.relay(|from| Envelope::AwarenessUpdate(Relayed { from, data }))
            }
            Envelope::SnapshotRequest { .. } => self.request_snapshot(),
            Envelope::Snapshot(payload) => self.forward_snapshot(payload),
            Envelope::ExecutionSubmit { code, language } => self.submit(code, language),
            other => {
                log::debug!("Ignoring {} from {}", other.kind(), self.addr);
                Vec::new()
            }
        }
    }

    fn join(&mut self, request: JoinRequest) -> Vec<Envelope> {
        if let Some(membership) = &self.membership {
            return vec![Envelope::error(
                ErrorCode::AlreadyJoined,
                format!("already joined session {}", membership.session_id()),
            )];
        }

        let info = PeerInfo::new(request.site_id, request.display_name);
        match self
            .shared
            .registry
            .register_peer(request.session_id, info, request.create)
        {
            Ok(registration) => {
                let ack = JoinAck {
                    session_id: request.session_id,
                    site_id: request.site_id,
                    peers: registration.peers,
                    first: registration.first,
                };
                self.outbox = Some(registration.outbox);
                self.membership = Some(Membership {
                    session: registration.session,
                    site: request.site_id,
                    token: registration.token,
                });
                vec![Envelope::Joined(ack)]
            }
            Err(e) => {
                log::warn!("Join from {} refused: {e}", self.addr);
                vec![e.to_envelope()]
            }
        }
    }

    fn relay(&self, stamp: impl FnOnce(SiteId) -> Envelope) -> Vec<Envelope> {
        let Some(membership) = &self.membership else {
            return Vec::new();
        };
        let envelope = stamp(membership.site);
        if let Err(e) = self
            .shared
            .registry
            .relay(&membership.session_id(), &membership.site, envelope)
        {
            log::warn!("Relay from {} failed: {e}", membership.site);
        }
        Vec::new()
    }

    fn request_snapshot(&self) -> Vec<Envelope> {
        let Some(membership) = &self.membership else {
            return Vec::new();
        };
        let site = membership.site;
        match membership.session.group().longest_joined(&site) {
            Some(provider) => {
                log::debug!("Asking {provider} for a snapshot on behalf of {site}");
                membership
                    .session
                    .group()
                    .send_to(&provider, Envelope::SnapshotRequest { requester: site });
                Vec::new()
            }
            // Nobody else holds the document
            None => vec![Envelope::Snapshot(SnapshotPayload {
                from: site,
                to: site,
                data: Vec::new(),
            })],
        }
    }

    fn forward_snapshot(&self, payload: SnapshotPayload) -> Vec<Envelope> {
        let Some(membership) = &self.membership else {
            return Vec::new();
        };
        let to = payload.to;
        let snapshot = Envelope::Snapshot(SnapshotPayload {
            from: membership.site,
            to,
            data: payload.data,
        });
        match self
            .shared
            .registry
            .send_to(&membership.session_id(), &to, snapshot)
        {
            Ok(true) => log::debug!("Snapshot {} → {to}", membership.site),
            Ok(false) => log::warn!("Snapshot for {to} undeliverable"),
            Err(e) => log::warn!("Snapshot for {to} dropped: {e}"),
        }
        Vec::new()
    }

    fn submit(&self, code: String, language: Option<String>) -> Vec<Envelope> {
        let Some(membership) = &self.membership else {
            return Vec::new();
        };
        let request = ExecutionRequest { code, language };
        match self
            .shared
            .execution
            .submit(membership.session.clone(), membership.site, request)
        {
            // Runs detached; the result reaches everyone through the outboxes
            Ok(_handle) => Vec::new(),
            Err(e) => vec![e.to_envelope()],
        }
    }

    fn leave(&mut self) {
        self.outbox = None;
        if let Some(membership) = self.membership.take() {
            self.shared.registry.unregister_peer(
                &membership.session_id(),
                &membership.site,
                membership.token,
            );
        }
    }
}
