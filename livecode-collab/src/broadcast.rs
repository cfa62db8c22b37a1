//! Fan-out to the peers of one session with backpressure.
//!
//! Every peer owns a bounded outbox drained by its connection task. Sending
//! never waits: a full or closed outbox drops the envelope for that peer only
//! and bumps the `dropped` counter. Peers recover lost updates through the
//! CRDT's tolerance for gaps (the next update or a resync fills them in).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use livecode_core::SiteId;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::protocol::{Envelope, PeerInfo};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

struct Member {
    info: PeerInfo,
    outbox: mpsc::Sender<Arc<Envelope>>,
    /// Join order, lower = joined earlier
    joined_seq: u64,
}

pub struct BroadcastGroup {
    members: RwLock<HashMap<SiteId, Member>>,
    capacity: usize,
    next_seq: AtomicU64,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl BroadcastGroup {
    /// `capacity` is the outbox depth per peer.
    pub fn new(capacity: usize) -> Self {
        Self {
            members: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            next_seq: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }

    /// Add (or replace) a peer. Returns its membership token and outbox.
    pub fn join(&self, info: PeerInfo) -> (u64, mpsc::Receiver<Arc<Envelope>>) {
        let (tx, rx) = mpsc::channel(self.capacity);
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let member = Member {
            joined_seq: seq,
            outbox: tx,
            info: info.clone(),
        };
        self.members.write().insert(info.site_id, member);
        (seq, rx)
    }

    /// Remove `site` only if it is still the membership `token` created.
    /// A reconnect replaces the member, and the stale connection must not
    /// evict its successor.
    pub fn remove_member(&self, site: &SiteId, token: u64) -> Option<PeerInfo> {
        let mut members = self.members.write();
        match members.get(site) {
            Some(member) if member.joined_seq == token => members.remove(site).map(|m| m.info),
            _ => None,
        }
    }

    /// Deliver to every peer except `sender`. Returns how many outboxes
    /// accepted it.
    pub fn broadcast_except(&self, sender: Option<&SiteId>, envelope: Envelope) -> usize {
        let envelope = Arc::new(envelope);
        let members = self.members.read();
        let mut delivered = 0;
        for (site, member) in members.iter() {
            if Some(site) == sender {
                continue;
            }
            if self.push(site, member, envelope.clone()) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Deliver to every peer.
    pub fn broadcast(&self, envelope: Envelope) -> usize {
        self.broadcast_except(None, envelope)
    }

    /// Deliver to a single peer. `false` if it is unknown or lagging.
    pub fn send_to(&self, site: &SiteId, envelope: Envelope) -> bool {
        let members = self.members.read();
        match members.get(site) {
            Some(member) => self.push(site, member, Arc::new(envelope)),
            None => {
                log::warn!("No peer {site} to deliver {} to", envelope.kind());
                false
            }
        }
    }

    fn push(&self, site: &SiteId, member: &Member, envelope: Arc<Envelope>) -> bool {
        match member.outbox.try_send(envelope) {
            Ok(()) => {
                self.messages_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(envelope)) => {
                self.messages_dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("Outbox of {site} full, dropping {}", envelope.kind());
                false
            }
            Err(mpsc::error::TrySendError::Closed(envelope)) => {
                self.messages_dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("Outbox of {site} closed, dropping {}", envelope.kind());
                false
            }
        }
    }

    /// The peer (other than `except`) that has been here the longest.
    pub fn longest_joined(&self, except: &SiteId) -> Option<SiteId> {
        self.members
            .read()
            .iter()
            .filter(|(site, _)| *site != except)
            .min_by_key(|(_, member)| member.joined_seq)
            .map(|(site, _)| *site)
    }

    pub fn peer_count(&self) -> usize {
        self.members.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }

    /// Peers in join order.
    pub fn peers(&self) -> Vec<PeerInfo> {
        let members = self.members.read();
        let mut ordered: Vec<&Member> = members.values().collect();
        ordered.sort_by_key(|m| m.joined_seq);
        ordered.into_iter().map(|m| m.info.clone()).collect()
    }

    pub fn has_peer(&self, site: &SiteId) -> bool {
        self.members.read().contains_key(site)
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.peer_count(),
        }
    }
}
