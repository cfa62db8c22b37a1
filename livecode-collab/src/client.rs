//! WebSocket sync client.
//!
//! Drives a [`SyncSession`] over one relay connection:
//! - a writer task forwarding outgoing envelopes to the socket
//! - a reader task feeding incoming envelopes to the session
//! - a ticker for awareness broadcast, expiry and periodic resync
//!
//! [`SyncClient::connect`] resolves once the join is acknowledged and,
//! for a late joiner, the first snapshot has arrived (or timed out).

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use livecode_core::awareness::{DEFAULT_BROADCAST_INTERVAL, DEFAULT_TIMEOUT};
use livecode_core::SiteId;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::protocol::{Envelope, PeerInfo, ProtocolError, SessionId, WireFormat};
use crate::session::{EditOp, SessionError, SessionState, SyncEvent, SyncSession};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay address, e.g. `ws://127.0.0.1:9090`
    pub server_url: String,
    pub join_timeout: Duration,
    pub snapshot_timeout: Duration,
    /// Fail `connect` instead of proceeding when no snapshot arrives
    pub require_snapshot: bool,
    pub awareness_interval: Duration,
    pub awareness_timeout: Duration,
    /// Full-snapshot resync period; `None` disables it
    pub resync_interval: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            join_timeout: Duration::from_secs(5),
            snapshot_timeout: Duration::from_secs(5),
            require_snapshot: false,
            awareness_interval: DEFAULT_BROADCAST_INTERVAL,
            awareness_timeout: DEFAULT_TIMEOUT,
            resync_interval: Some(Duration::from_secs(60)),
        }
    }
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }
}

/// How far the current connection got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    Pending,
    /// Joined, still waiting for the document
    Joined,
    Ready,
    Unavailable,
    Closed,
}

pub struct SyncClient {
    config: ClientConfig,
    session: Arc<Mutex<SyncSession>>,
    outgoing_tx: Option<mpsc::Sender<Envelope>>,
    event_tx: mpsc::Sender<SyncEvent>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncClient {
    /// `create` asks the relay to create the session if it does not exist.
    pub fn new(
        config: ClientConfig,
        session_id: SessionId,
        site: SiteId,
        display_name: impl Into<String>,
        create: bool,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let session = SyncSession::new(session_id, site, display_name, create)
            .with_awareness_interval(config.awareness_interval);
        Self {
            config,
            session: Arc::new(Mutex::new(session)),
            outgoing_tx: None,
            event_tx,
            event_rx: Some(event_rx),
            tasks: Vec::new(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect and join. Calling it again after a disconnect rejoins with
    /// the retained document and replays offline edits.
    pub async fn connect(&mut self) -> Result<(), SessionError> {
        self.shutdown_tasks();

        let (ws_stream, _) = tokio_tungstenite::connect_async(self.config.server_url.as_str())
            .await
            .map_err(|e| {
                log::warn!("Failed to connect to {}: {e}", self.config.server_url);
                SessionError::ConnectionClosed
            })?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Envelope>(256);
        let (progress_tx, mut progress_rx) = watch::channel(Progress::Pending);

        // Writer task: forward outgoing envelopes to the socket
        self.tasks.push(tokio::spawn(async move {
            while let Some(envelope) = out_rx.recv().await {
                let message = match envelope.to_message(WireFormat::Binary) {
                    Ok(message) => message,
                    Err(e) => {
                        log::warn!("Dropping unencodable {}: {e}", envelope.kind());
                        continue;
                    }
                };
                if ws_writer.send(message).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        }));

        // Reader task: feed the session
        let session = self.session.clone();
        let event_tx = self.event_tx.clone();
        let replies = out_tx.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                let message = match frame {
                    Ok(message) => message,
                    Err(e) => {
                        log::debug!("Relay connection error: {e}");
                        break;
                    }
                };
                let envelope = match Envelope::from_message(message) {
                    Ok(Some((envelope, _))) => envelope,
                    Ok(None) => continue,
                    Err(ProtocolError::ConnectionClosed) => break,
                    Err(e) => {
                        log::warn!("Ignoring bad frame from relay: {e}");
                        continue;
                    }
                };

                let mut session = session.lock().await;
                match session.handle(envelope, Instant::now()) {
                    Ok(step) => {
                        for reply in step.replies {
                            if replies.try_send(reply).is_err() {
                                log::warn!("Outgoing queue full, dropping reply");
                            }
                        }
                        for event in step.events {
                            emit(&event_tx, event);
                        }
                        let progress = match (session.is_joined(), session.has_document()) {
                            (true, true) => Progress::Ready,
                            (true, false) => Progress::Joined,
                            _ => Progress::Pending,
                        };
                        progress_tx.send_if_modified(|current| {
                            let changed = *current != progress;
                            *current = progress;
                            changed
                        });
                    }
                    Err(SessionError::SessionUnavailable(id)) => {
                        log::warn!("Session {id} is unavailable");
                        let _ = progress_tx.send(Progress::Unavailable);
                        return;
                    }
                    Err(e) => log::warn!("Failed to handle relay message: {e}"),
                }
            }

            let event = session.lock().await.on_disconnect();
            emit(&event_tx, event);
            let _ = progress_tx.send(Progress::Closed);
        }));

        let ticker = self.spawn_ticker(out_tx.clone());
        self.tasks.push(ticker);

        let join = self.session.lock().await.join();
        out_tx
            .send(join)
            .await
            .map_err(|_| SessionError::ConnectionClosed)?;
        self.outgoing_tx = Some(out_tx);

        let joined = tokio::time::timeout(
            self.config.join_timeout,
            progress_rx.wait_for(|p| *p != Progress::Pending),
        )
        .await
        .map(|r| r.map(|p| *p));
        let progress = match joined {
            Ok(Ok(progress)) => progress,
            Ok(Err(_)) => Progress::Closed,
            Err(_) => {
                self.disconnect().await;
                return Err(ProtocolError::Timeout.into());
            }
        };

        match progress {
            Progress::Ready => Ok(()),
            Progress::Joined => self.await_snapshot(progress_rx).await,
            Progress::Unavailable => {
                let id = self.session_id().await;
                self.disconnect().await;
                Err(SessionError::SessionUnavailable(id))
            }
            Progress::Pending | Progress::Closed => {
                self.disconnect().await;
                Err(SessionError::ConnectionClosed)
            }
        }
    }

    async fn await_snapshot(
        &mut self,
        mut progress_rx: watch::Receiver<Progress>,
    ) -> Result<(), SessionError> {
        let synced = tokio::time::timeout(
            self.config.snapshot_timeout,
            progress_rx.wait_for(|p| *p != Progress::Joined),
        )
        .await
        .map(|r| r.map(|p| *p));
        match synced {
            Ok(Ok(Progress::Ready)) => Ok(()),
            Ok(_) => {
                self.disconnect().await;
                Err(SessionError::ConnectionClosed)
            }
            Err(_) if self.config.require_snapshot => {
                self.disconnect().await;
                Err(SessionError::SnapshotTimeout)
            }
            Err(_) => {
                log::warn!(
                    "No snapshot after {:?}; continuing, resync will retry",
                    self.config.snapshot_timeout
                );
                Ok(())
            }
        }
    }

    fn spawn_ticker(&self, out_tx: mpsc::Sender<Envelope>) -> JoinHandle<()> {
        let session = self.session.clone();
        let event_tx = self.event_tx.clone();
        let awareness_timeout = self.config.awareness_timeout;
        let resync_interval = self.config.resync_interval;
        let mut tick = tokio::time::interval(self.config.awareness_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tokio::spawn(async move {
            let mut last_resync = Instant::now();
            loop {
                tick.tick().await;
                let now = Instant::now();
                let mut outgoing = Vec::new();
                {
                    let mut session = session.lock().await;
                    match session.poll_awareness(now, awareness_timeout) {
                        Ok(Some(envelope)) => outgoing.push(envelope),
                        Ok(None) => {}
                        Err(e) => log::warn!("Failed to encode awareness: {e}"),
                    }
                    for site in session.expire_awareness(now, awareness_timeout) {
                        log::debug!("Awareness of {site} expired");
                        emit(&event_tx, SyncEvent::AwarenessChanged(site));
                    }
                    if let Some(period) = resync_interval {
                        if now.saturating_duration_since(last_resync) >= period {
                            last_resync = now;
                            if let Ok(request) = session.request_snapshot() {
                                outgoing.push(request);
                            }
                        }
                    }
                }
                for envelope in outgoing {
                    if out_tx.send(envelope).await.is_err() {
                        return;
                    }
                }
            }
        })
    }

    /// Apply a local edit and send it (or queue it while offline).
    ///
    /// The edit stays in the document even if sending fails; the next
    /// `connect` pushes it with the rest of the retained state.
    pub async fn edit(&self, op: EditOp) -> Result<(), SessionError> {
        let envelopes = self.session.lock().await.on_local_edit(op)?;
        self.send_all(envelopes).await
    }

    /// Move the local cursor; it goes out with the next awareness tick.
    pub async fn set_cursor(&self, anchor: usize, head: usize) -> Result<(), SessionError> {
        self.session.lock().await.set_cursor_at(anchor, head)
    }

    pub async fn submit_code(
        &self,
        code: impl Into<String>,
        language: Option<String>,
    ) -> Result<(), SessionError> {
        let envelope = self.session.lock().await.submit_code(code, language)?;
        self.send_all(vec![envelope]).await
    }

    /// Ask a peer for a full snapshot.
    pub async fn resync(&self) -> Result<(), SessionError> {
        let envelope = self.session.lock().await.request_snapshot()?;
        self.send_all(vec![envelope]).await
    }

    async fn send_all(&self, envelopes: Vec<Envelope>) -> Result<(), SessionError> {
        if envelopes.is_empty() {
            return Ok(());
        }
        let tx = self
            .outgoing_tx
            .as_ref()
            .ok_or(SessionError::ConnectionClosed)?;
        for envelope in envelopes {
            tx.send(envelope)
                .await
                .map_err(|_| SessionError::ConnectionClosed)?;
        }
        Ok(())
    }

    /// Drop the connection. The document is kept for a later `connect`.
    pub async fn disconnect(&mut self) {
        self.shutdown_tasks();
        let event = self.session.lock().await.on_disconnect();
        emit(&self.event_tx, event);
    }

    fn shutdown_tasks(&mut self) {
        self.outgoing_tx = None;
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    pub async fn text(&self) -> String {
        self.session.lock().await.materialize()
    }

    pub async fn state(&self) -> SessionState {
        self.session.lock().await.state()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.session.lock().await.peers().cloned().collect()
    }

    pub async fn remote_cursor(&self, site: &SiteId) -> Option<(usize, usize)> {
        self.session.lock().await.remote_cursor(site)
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.session.lock().await.offline_len()
    }

    pub async fn session_id(&self) -> SessionId {
        self.session.lock().await.session_id()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.shutdown_tasks();
    }
}

fn emit(event_tx: &mpsc::Sender<SyncEvent>, event: SyncEvent) {
    if let Err(mpsc::error::TrySendError::Full(event)) = event_tx.try_send(event) {
        log::debug!("Event queue full, dropping {event:?}");
    }
}
