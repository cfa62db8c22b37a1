//! Session lifecycle and routing.
//!
//! The registry maps session ids to [`Session`]s. Each session owns its own
//! broadcast group and execution slot, so traffic in one session never
//! takes a lock another session needs; the registry map itself is only
//! write-locked while peers join or leave.
//!
//! The relay never looks inside document or awareness payloads.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use livecode_core::SiteId;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, BroadcastStats};
use crate::protocol::{Envelope, ErrorCode, PeerInfo, SessionId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("session {0} does not exist")]
    SessionUnavailable(SessionId),
    #[error("session {session} is full ({max} peers)")]
    SessionFull { session: SessionId, max: usize },
    #[error("an execution is already running in session {0}")]
    ExecutionBusy(SessionId),
}

impl RelayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::SessionUnavailable(_) => ErrorCode::SessionUnavailable,
            Self::SessionFull { .. } => ErrorCode::SessionFull,
            Self::ExecutionBusy(_) => ErrorCode::ExecutionBusy,
        }
    }

    pub fn to_envelope(&self) -> Envelope {
        Envelope::error(self.code(), self.to_string())
    }
}

/// One live session.
pub struct Session {
    id: SessionId,
    group: BroadcastGroup,
    /// Requester of the running execution, if any
    execution: Mutex<Option<SiteId>>,
    last_active: Mutex<Instant>,
}

impl Session {
    fn new(id: SessionId, outbox_capacity: usize) -> Self {
        Self {
            id,
            group: BroadcastGroup::new(outbox_capacity),
            execution: Mutex::new(None),
            last_active: Mutex::new(Instant::now()),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn group(&self) -> &BroadcastGroup {
        &self.group
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.group.peers()
    }

    pub fn peer_count(&self) -> usize {
        self.group.peer_count()
    }

    pub fn stats(&self) -> BroadcastStats {
        self.group.stats()
    }

    /// Claim the execution slot. `false` if one is already running.
    pub fn try_begin_execution(&self, requester: SiteId) -> bool {
        let mut slot = self.execution.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(requester);
        true
    }

    pub fn finish_execution(&self) -> Option<SiteId> {
        self.execution.lock().take()
    }

    fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_active.lock())
    }
}

/// A successful `register_peer`.
pub struct Registration {
    pub session: Arc<Session>,
    /// Membership token for `unregister_peer`
    pub token: u64,
    pub outbox: mpsc::Receiver<Arc<Envelope>>,
    /// Peers present before this one
    pub peers: Vec<PeerInfo>,
    pub first: bool,
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    max_peers: usize,
    outbox_capacity: usize,
}

impl SessionRegistry {
    pub fn new(max_peers: usize, outbox_capacity: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_peers: max_peers.max(1),
            outbox_capacity,
        }
    }

    /// Mint a fresh session with no peers.
    pub fn create_session(&self) -> SessionId {
        let id = Uuid::new_v4();
        self.sessions
            .write()
            .insert(id, Arc::new(Session::new(id, self.outbox_capacity)));
        log::info!("Created session {id}");
        id
    }

    pub fn lookup_session(&self, id: &SessionId) -> bool {
        self.sessions.read().contains_key(id)
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    /// Add a peer to a session and announce it to the others.
    ///
    /// A site that is already registered is replaced; its old connection
    /// loses its outbox.
    pub fn register_peer(
        &self,
        session_id: SessionId,
        info: PeerInfo,
        create: bool,
    ) -> Result<Registration, RelayError> {
        let mut sessions = self.sessions.write();
        let session = match sessions.get(&session_id).cloned() {
            Some(session) => session,
            None if create => {
                let session = Arc::new(Session::new(session_id, self.outbox_capacity));
                sessions.insert(session_id, session.clone());
                log::info!("Created session {session_id} on join");
                session
            }
            None => return Err(RelayError::SessionUnavailable(session_id)),
        };

        let rejoin = session.group.has_peer(&info.site_id);
        if !rejoin && session.group.peer_count() >= self.max_peers {
            return Err(RelayError::SessionFull {
                session: session_id,
                max: self.max_peers,
            });
        }

        let peers: Vec<PeerInfo> = session
            .group
            .peers()
            .into_iter()
            .filter(|p| p.site_id != info.site_id)
            .collect();
        let site = info.site_id;
        let (token, outbox) = session.group.join(info.clone());
        drop(sessions);

        session.touch();
        if rejoin {
            log::info!("Peer {site} rejoined session {session_id}, replacing old link");
        } else {
            log::info!(
                "Peer {} ({site}) joined session {session_id} ({} peers)",
                info.display_name,
                peers.len() + 1
            );
        }
        session
            .group
            .broadcast_except(Some(&site), Envelope::PeerJoined(info));

        Ok(Registration {
            first: peers.is_empty(),
            session,
            token,
            outbox,
            peers,
        })
    }

    /// Forward `envelope` to every other peer of the session. Unreachable
    /// peers are skipped.
    pub fn relay(
        &self,
        session_id: &SessionId,
        sender: &SiteId,
        envelope: Envelope,
    ) -> Result<usize, RelayError> {
        let session = self
            .get(session_id)
            .ok_or(RelayError::SessionUnavailable(*session_id))?;
        session.touch();
        log::trace!("Relaying {} from {sender} in {session_id}", envelope.kind());
        Ok(session.group.broadcast_except(Some(sender), envelope))
    }

    pub fn send_to(
        &self,
        session_id: &SessionId,
        target: &SiteId,
        envelope: Envelope,
    ) -> Result<bool, RelayError> {
        let session = self
            .get(session_id)
            .ok_or(RelayError::SessionUnavailable(*session_id))?;
        Ok(session.group.send_to(target, envelope))
    }

    /// Remove a peer, announce its departure and destroy the session once
    /// nobody is left. Returns `false` if `token` no longer owns the site.
    pub fn unregister_peer(&self, session_id: &SessionId, site: &SiteId, token: u64) -> bool {
        let mut sessions = self.sessions.write();
        let Some(session) = sessions.get(session_id).cloned() else {
            return false;
        };
        if session.group.remove_member(site, token).is_none() {
            return false;
        }

        if session.group.is_empty() {
            sessions.remove(session_id);
            log::info!("Peer {site} left, session {session_id} destroyed");
        } else {
            drop(sessions);
            log::info!("Peer {site} left session {session_id}");
            session
                .group
                .broadcast(Envelope::PeerLeft { site_id: *site });
        }
        true
    }

    /// Drop empty sessions idle for longer than `ttl`.
    pub fn sweep_idle(&self, now: Instant, ttl: Duration) -> usize {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|id, session| {
            let keep = !session.group.is_empty() || session.idle_for(now) < ttl;
            if !keep {
                log::info!("Session {id} expired unused");
            }
            keep
        });
        before - sessions.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.read().keys().copied().collect()
    }
}
