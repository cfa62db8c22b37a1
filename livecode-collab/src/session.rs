//! Peer-side sync session: one document, one relay connection.
//!
//! [`SyncSession`] is a plain state machine. It turns local edits into
//! envelopes and incoming envelopes into document changes and
//! [`SyncEvent`]s; the [`client`](crate::client) moves the bytes.
//!
//! ```text
//!   join() ──► Connecting ── joined ──► Joined ── on_disconnect() ──► Disconnected
//!                  │                      ▲                               │
//!                  └─ error: unavailable  └───────── join() ──────────────┘
//! ```
//!
//! The document survives disconnects. Edits made while offline are queued;
//! after the next `joined` a session that kept its document pushes its
//! whole state, so edits lost on a dead link reach peers as well.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use livecode_core::awareness::{AwarenessRecord, AwarenessStore, Selection};
use livecode_core::{ApplyReport, CodecError, Op, ReplicatedText, SiteId, TextError, Update};
use thiserror::Error;

use crate::protocol::{
    Envelope, ErrorCode, JoinAck, JoinRequest, PeerInfo, ProtocolError, Relayed, SessionId,
    SnapshotPayload,
};

/// Offline updates kept before new edits are merged into the last one.
pub const DEFAULT_OFFLINE_CAPACITY: usize = 10_000;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session {0} is unavailable")]
    SessionUnavailable(SessionId),
    #[error("not joined to a session")]
    NotJoined,
    #[error("timed out waiting for a document snapshot")]
    SnapshotTimeout,
    #[error("connection closed")]
    ConnectionClosed,
    #[error(transparent)]
    Text(#[from] TextError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Joined,
    Disconnected,
}

/// A local edit in visible offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOp {
    Insert { index: usize, text: String },
    Delete { index: usize, len: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Joined { first: bool, peers: Vec<PeerInfo> },
    RemoteUpdate { from: SiteId, report: ApplyReport },
    SnapshotApplied { from: SiteId },
    PeerJoined(PeerInfo),
    PeerLeft(SiteId),
    AwarenessChanged(SiteId),
    ExecutionStarted { requester: SiteId },
    ExecutionFinished { requester: SiteId, output: String, success: bool },
    /// The relay refused something we sent
    Rejected { code: ErrorCode, message: String },
    Disconnected,
}

/// What handling one envelope produced.
#[derive(Debug, Default)]
pub struct Step {
    /// Envelopes to send back to the relay
    pub replies: Vec<Envelope>,
    pub events: Vec<SyncEvent>,
}

impl Step {
    fn reply(envelope: Envelope) -> Self {
        Self {
            replies: vec![envelope],
            events: Vec::new(),
        }
    }

    fn event(event: SyncEvent) -> Self {
        Self {
            replies: Vec::new(),
            events: vec![event],
        }
    }
}

/// Updates produced while disconnected, replayed on reconnect.
#[derive(Debug)]
pub struct OfflineQueue {
    queue: VecDeque<Update>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an update. Once the queue is full the update is merged into
    /// the newest entry, so no operation is ever dropped.
    pub fn enqueue(&mut self, update: Update) {
        let full = self.queue.len() >= self.max_size;
        match self.queue.back_mut() {
            Some(last) if full => last.append(update),
            _ => self.queue.push_back(update),
        }
    }

    pub fn is_full(&self) -> bool {
        self.queue.len() >= self.max_size
    }

    /// Everything queued, merged into one update in queue order.
    pub fn drain_merged(&mut self) -> Option<Update> {
        let mut merged = self.queue.pop_front()?;
        for update in self.queue.drain(..) {
            merged.append(update);
        }
        Some(merged)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Operations across all queued updates.
    pub fn op_count(&self) -> usize {
        self.queue.iter().map(Update::len).sum()
    }
}

pub struct SyncSession {
    session_id: SessionId,
    site: SiteId,
    display_name: String,
    create: bool,
    state: SessionState,
    text: ReplicatedText,
    awareness: AwarenessStore,
    peers: HashMap<SiteId, PeerInfo>,
    offline: OfflineQueue,
    /// We hold the session's document (fresh, snapshotted or retained)
    has_document: bool,
    awaiting_snapshot: bool,
}

impl SyncSession {
    pub fn new(
        session_id: SessionId,
        site: SiteId,
        display_name: impl Into<String>,
        create: bool,
    ) -> Self {
        let display_name = display_name.into();
        Self {
            session_id,
            site,
            awareness: AwarenessStore::new(site, display_name.clone()),
            display_name,
            create,
            state: SessionState::Disconnected,
            text: ReplicatedText::new(site),
            peers: HashMap::new(),
            offline: OfflineQueue::new(DEFAULT_OFFLINE_CAPACITY),
            has_document: false,
            awaiting_snapshot: false,
        }
    }

    /// Custom awareness broadcast throttle.
    pub fn with_awareness_interval(mut self, interval: Duration) -> Self {
        self.awareness = AwarenessStore::with_interval(self.site, self.display_name.clone(), interval);
        self
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn site(&self) -> SiteId {
        self.site
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_joined(&self) -> bool {
        self.state == SessionState::Joined
    }

    pub fn text(&self) -> &ReplicatedText {
        &self.text
    }

    pub fn materialize(&self) -> String {
        self.text.materialize()
    }

    pub fn awareness(&self) -> &AwarenessStore {
        &self.awareness
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerInfo> + '_ {
        self.peers.values()
    }

    pub fn has_document(&self) -> bool {
        self.has_document
    }

    pub fn awaiting_snapshot(&self) -> bool {
        self.awaiting_snapshot
    }

    pub fn offline_len(&self) -> usize {
        self.offline.len()
    }

    /// Start (or restart) joining. Send the returned envelope to the relay.
    pub fn join(&mut self) -> Envelope {
        self.state = SessionState::Connecting;
        Envelope::Join(JoinRequest {
            session_id: self.session_id,
            site_id: self.site,
            display_name: self.display_name.clone(),
            create: self.create,
        })
    }

    /// Handle one envelope from the relay.
    ///
    /// Only a refused join is an error; anything malformed is logged and
    /// dropped.
    pub fn handle(&mut self, envelope: Envelope, now: Instant) -> Result<Step, SessionError> {
        let step = match envelope {
            Envelope::Joined(ack) => self.on_joined(ack, now)?,
            Envelope::Error { code, message } => return self.on_error(code, message),
            Envelope::SyncUpdate(Relayed { from, data }) => self.on_remote_update(from, &data),
            Envelope::SnapshotRequest { requester } => self.on_snapshot_request(requester)?,
            Envelope::Snapshot(payload) => self.on_snapshot(payload)?,
            Envelope::AwarenessUpdate(Relayed { from, data }) => {
                self.on_remote_awareness(from, &data, now)
            }
            Envelope::PeerJoined(info) => {
                let mut step = Step::event(SyncEvent::PeerJoined(info.clone()));
                self.peers.insert(info.site_id, info);
                // Let the newcomer see our cursor right away
                if self.is_joined() {
                    let record = self.awareness.force_broadcast(now);
                    step.replies.push(self.awareness_envelope(&record)?);
                }
                step
            }
            Envelope::PeerLeft { site_id } => {
                self.peers.remove(&site_id);
                self.awareness.remove(&site_id);
                Step::event(SyncEvent::PeerLeft(site_id))
            }
            Envelope::ExecutionStatus { requester, .. } => {
                Step::event(SyncEvent::ExecutionStarted { requester })
            }
            Envelope::ExecutionResult {
                requester,
                output,
                success,
            } => Step::event(SyncEvent::ExecutionFinished {
                requester,
                output,
                success,
            }),
            Envelope::Ping => Step::reply(Envelope::Pong),
            Envelope::Pong => Step::default(),
            other => {
                log::debug!("Ignoring unexpected {} from relay", other.kind());
                Step::default()
            }
        };
        Ok(step)
    }

    fn on_joined(&mut self, ack: JoinAck, now: Instant) -> Result<Step, SessionError> {
        if ack.session_id != self.session_id {
            log::warn!("Joined ack for foreign session {}", ack.session_id);
            return Ok(Step::default());
        }
        self.state = SessionState::Joined;
        self.peers = ack
            .peers
            .iter()
            .map(|p| (p.site_id, p.clone()))
            .collect();

        let mut step = Step::event(SyncEvent::Joined {
            first: ack.first,
            peers: ack.peers,
        });

        if ack.first {
            // Empty session: whatever we hold is the document
            self.has_document = true;
        } else if self.has_document {
            // Retained document: push all of it. This carries the offline
            // queue and anything the relay never delivered.
            let state = self.text.snapshot();
            log::info!("Pushing retained document ({} operations)", state.len());
            step.replies.push(self.update_envelope(&state)?);
            self.offline.clear();
        } else {
            self.awaiting_snapshot = true;
            step.replies.push(Envelope::SnapshotRequest {
                requester: self.site,
            });
        }

        if let Some(queued) = self.offline.drain_merged() {
            log::info!("Replaying {} queued operations", queued.len());
            step.replies.push(self.update_envelope(&queued)?);
        }

        let record = self.awareness.force_broadcast(now);
        step.replies.push(self.awareness_envelope(&record)?);
        log::info!(
            "Joined session {} as {} ({} peers)",
            self.session_id,
            self.site,
            self.peers.len()
        );
        Ok(step)
    }

    fn on_error(&mut self, code: ErrorCode, message: String) -> Result<Step, SessionError> {
        if code == ErrorCode::SessionUnavailable && self.state == SessionState::Connecting {
            self.state = SessionState::Disconnected;
            return Err(SessionError::SessionUnavailable(self.session_id));
        }
        log::warn!("Relay refused a request: {message}");
        Ok(Step::event(SyncEvent::Rejected { code, message }))
    }

    fn on_remote_update(&mut self, from: SiteId, data: &[u8]) -> Step {
        let update = match Update::decode(data) {
            Ok(update) => update,
            Err(e) => {
                log::warn!("Dropping undecodable update from {from}: {e}");
                return Step::default();
            }
        };
        let report = self.text.apply_update(&update);
        if report.changed() || report.deferred > 0 {
            Step::event(SyncEvent::RemoteUpdate { from, report })
        } else {
            Step::default()
        }
    }

    fn on_snapshot_request(&mut self, requester: SiteId) -> Result<Step, SessionError> {
        if !self.has_document {
            log::debug!("Snapshot requested by {requester} but we hold no document yet");
            return Ok(Step::default());
        }
        let data = self.text.snapshot().encode_compressed()?;
        Ok(Step::reply(Envelope::Snapshot(SnapshotPayload {
            from: self.site,
            to: requester,
            data,
        })))
    }

    fn on_snapshot(&mut self, payload: SnapshotPayload) -> Result<Step, SessionError> {
        let mut step = Step::event(SyncEvent::SnapshotApplied { from: payload.from });
        // Empty payload: nobody else holds the document
        if !payload.data.is_empty() {
            match Update::decode_compressed(&payload.data) {
                Ok(snapshot) => {
                    let report = self.text.apply_update(&snapshot);
                    log::debug!(
                        "Snapshot from {} applied ({} new elements)",
                        payload.from,
                        report.applied
                    );
                    if self.has_document && self.holds_more_than(&snapshot) {
                        log::info!("Snapshot from {} is behind us, pushing our state", payload.from);
                        let state = self.text.snapshot();
                        step.replies.push(self.update_envelope(&state)?);
                    }
                }
                Err(e) => {
                    log::warn!("Dropping undecodable snapshot from {}: {e}", payload.from);
                    return Ok(Step::default());
                }
            }
        }
        self.has_document = true;
        self.awaiting_snapshot = false;
        Ok(step)
    }

    /// Whether we hold elements or tombstones a full snapshot lacks.
    fn holds_more_than(&self, snapshot: &Update) -> bool {
        let inserts = snapshot
            .ops
            .iter()
            .filter(|op| matches!(op, Op::Insert { .. }))
            .count();
        let deletes = snapshot.len() - inserts;
        self.text.element_count() > inserts || self.text.tombstone_count() > deletes
    }

    fn on_remote_awareness(&mut self, from: SiteId, data: &[u8], now: Instant) -> Step {
        match AwarenessRecord::decode(data) {
            Ok(record) if record.site_id == from => {
                if self.awareness.apply_remote(record, now) {
                    Step::event(SyncEvent::AwarenessChanged(from))
                } else {
                    Step::default()
                }
            }
            Ok(record) => {
                log::warn!("Awareness for {} relayed from {from}, dropping", record.site_id);
                Step::default()
            }
            Err(e) => {
                log::warn!("Dropping undecodable awareness from {from}: {e}");
                Step::default()
            }
        }
    }

    /// Apply a local edit. Returns envelopes to send now; while not joined
    /// the edit is queued instead.
    pub fn on_local_edit(&mut self, op: EditOp) -> Result<Vec<Envelope>, SessionError> {
        match op {
            EditOp::Insert { index, text } => {
                self.text.insert_str_at(index, &text)?;
            }
            EditOp::Delete { index, len } => {
                self.text.delete_range(index, len)?;
            }
        }
        self.flush_local()
    }

    /// Package pending local operations.
    pub fn flush_local(&mut self) -> Result<Vec<Envelope>, SessionError> {
        let Some(update) = self.text.take_update() else {
            return Ok(Vec::new());
        };
        if self.is_joined() {
            return Ok(vec![self.update_envelope(&update)?]);
        }
        if self.offline.is_full() {
            log::debug!("Offline queue full, merging into its newest update");
        }
        self.offline.enqueue(update);
        Ok(Vec::new())
    }

    /// Move the local cursor to visible offsets (`anchor` == `head` for a
    /// caret).
    pub fn set_cursor_at(&mut self, anchor: usize, head: usize) -> Result<(), SessionError> {
        let selection = Selection {
            anchor: self.text.anchor_at(anchor)?,
            head: self.text.anchor_at(head)?,
        };
        self.awareness.set_cursor(Some(selection));
        Ok(())
    }

    pub fn set_cursor(&mut self, selection: Option<Selection>) {
        self.awareness.set_cursor(selection);
    }

    /// Visible offsets of a peer's cursor, resolved against our document.
    pub fn remote_cursor(&self, site: &SiteId) -> Option<(usize, usize)> {
        let selection = self.awareness.get(site)?.cursor?;
        Some((
            self.text.resolve_anchor(selection.anchor)?,
            self.text.resolve_anchor(selection.head)?,
        ))
    }

    /// Awareness to broadcast now, if any: a throttled change, or a renewal
    /// so peers do not expire us.
    pub fn poll_awareness(
        &mut self,
        now: Instant,
        timeout: Duration,
    ) -> Result<Option<Envelope>, SessionError> {
        if !self.is_joined() {
            return Ok(None);
        }
        let record = match self.awareness.take_dirty(now) {
            Some(record) => Some(record),
            None => self.awareness.renew_if_stale(now, timeout),
        };
        record.map(|r| self.awareness_envelope(&r)).transpose()
    }

    pub fn expire_awareness(&mut self, now: Instant, timeout: Duration) -> Vec<SiteId> {
        self.awareness.expire(now, timeout)
    }

    pub fn submit_code(
        &self,
        code: impl Into<String>,
        language: Option<String>,
    ) -> Result<Envelope, SessionError> {
        if !self.is_joined() {
            return Err(SessionError::NotJoined);
        }
        Ok(Envelope::ExecutionSubmit {
            code: code.into(),
            language,
        })
    }

    /// Ask for a full snapshot, e.g. as a periodic resync.
    pub fn request_snapshot(&mut self) -> Result<Envelope, SessionError> {
        if !self.is_joined() {
            return Err(SessionError::NotJoined);
        }
        self.awaiting_snapshot = true;
        Ok(Envelope::SnapshotRequest {
            requester: self.site,
        })
    }

    /// The link is gone. The document stays; presence is forgotten.
    pub fn on_disconnect(&mut self) -> SyncEvent {
        if self.state != SessionState::Disconnected {
            log::info!("Disconnected from session {}", self.session_id);
        }
        self.state = SessionState::Disconnected;
        self.awaiting_snapshot = false;
        self.peers.clear();
        self.awareness.clear_remote();
        SyncEvent::Disconnected
    }

    fn update_envelope(&self, update: &Update) -> Result<Envelope, SessionError> {
        Ok(Envelope::SyncUpdate(Relayed {
            from: self.site,
            data: update.encode()?,
        }))
    }

    fn awareness_envelope(&self, record: &AwarenessRecord) -> Result<Envelope, SessionError> {
        Ok(Envelope::AwarenessUpdate(Relayed {
            from: self.site,
            data: record.encode()?,
        }))
    }
}
