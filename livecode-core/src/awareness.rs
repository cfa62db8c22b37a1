//! Awareness: ephemeral presence for everyone in a session.
//!
//! Who is here, what they are called and where their cursor sits. None of
//! this is part of the document; records are last-write-wins by a per-site
//! logical clock and simply disappear when their owner goes quiet.
//!
//! ```text
//! set_local() ──► dirty ──► take_dirty(now)   (throttled, 33ms)
//!                                │
//!                                ▼  awareness-update
//!                     remote AwarenessStore::apply_remote()
//!                                │
//!                     expire(now, timeout) drops silent peers
//! ```

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec::{self, CodecError};
use crate::text::{ElementId, SiteId};

/// Minimum spacing between two local broadcasts.
pub const DEFAULT_BROADCAST_INTERVAL: Duration = Duration::from_millis(33);

/// Silence after which a remote record is dropped.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// RGBA color for a peer's cursor and selection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Stable, vivid color derived from a site id.
    pub fn from_site(site: SiteId) -> Self {
        let hue = ((site.as_u128() % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    /// `#rrggbb`, for UIs.
    pub fn to_hex(&self) -> String {
        let channel = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!(
            "#{:02x}{:02x}{:02x}",
            channel(self.r),
            channel(self.g),
            channel(self.b)
        )
    }
}

impl Default for CursorColor {
    fn default() -> Self {
        Self { r: 0.26, g: 0.52, b: 0.96, a: 1.0 }
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// A cursor or selection in element-relative positions.
///
/// Each end means "just after this element" (`None` = document start), so it
/// keeps pointing at the same text while others edit around it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub anchor: Option<ElementId>,
    pub head: Option<ElementId>,
}

impl Selection {
    /// A collapsed selection.
    pub fn caret(at: Option<ElementId>) -> Self {
        Self { anchor: at, head: at }
    }

    pub fn is_caret(&self) -> bool {
        self.anchor == self.head
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwarenessRecord {
    pub site_id: SiteId,
    pub display_name: String,
    pub cursor: Option<Selection>,
    pub color: CursorColor,
    /// Logical clock of the owning site; newer wins
    pub clock: u64,
}

impl AwarenessRecord {
    pub fn new(site_id: SiteId, display_name: impl Into<String>) -> Self {
        Self {
            site_id,
            display_name: display_name.into(),
            cursor: None,
            color: CursorColor::from_site(site_id),
            clock: 0,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        codec::encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        codec::decode(bytes)
    }
}

#[derive(Debug, Clone)]
struct RemoteEntry {
    record: AwarenessRecord,
    last_seen: Instant,
}

/// Awareness for one site: its own record plus everything heard from peers.
#[derive(Debug, Clone)]
pub struct AwarenessStore {
    local: AwarenessRecord,
    remote: HashMap<SiteId, RemoteEntry>,
    dirty: bool,
    broadcast_interval: Duration,
    last_broadcast: Option<Instant>,
}

impl AwarenessStore {
    pub fn new(site: SiteId, display_name: impl Into<String>) -> Self {
        Self::with_interval(site, display_name, DEFAULT_BROADCAST_INTERVAL)
    }

    /// Custom broadcast throttle (zero disables it).
    pub fn with_interval(site: SiteId, display_name: impl Into<String>, interval: Duration) -> Self {
        Self {
            local: AwarenessRecord::new(site, display_name),
            remote: HashMap::new(),
            dirty: true,
            broadcast_interval: interval,
            last_broadcast: None,
        }
    }

    pub fn site(&self) -> SiteId {
        self.local.site_id
    }

    pub fn local(&self) -> &AwarenessRecord {
        &self.local
    }

    /// Replace the local cursor and name; marks the record for broadcast.
    pub fn set_local(&mut self, cursor: Option<Selection>, display_name: impl Into<String>) {
        self.local.cursor = cursor;
        self.local.display_name = display_name.into();
        self.bump();
    }

    pub fn set_cursor(&mut self, cursor: Option<Selection>) {
        self.local.cursor = cursor;
        self.bump();
    }

    fn bump(&mut self) {
        self.local.clock += 1;
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// The local record if it changed and the throttle allows sending now.
    pub fn take_dirty(&mut self, now: Instant) -> Option<AwarenessRecord> {
        if !self.dirty {
            return None;
        }
        if let Some(last) = self.last_broadcast {
            if now.saturating_duration_since(last) < self.broadcast_interval {
                return None;
            }
        }
        self.dirty = false;
        self.last_broadcast = Some(now);
        Some(self.local.clone())
    }

    /// Re-announce the local record once half of `timeout` has passed since
    /// the last broadcast, so peers never expire a live site.
    pub fn renew_if_stale(&mut self, now: Instant, timeout: Duration) -> Option<AwarenessRecord> {
        let stale = match self.last_broadcast {
            Some(last) => now.saturating_duration_since(last) >= timeout / 2,
            None => true,
        };
        if !stale {
            return None;
        }
        self.bump();
        self.take_dirty(now)
    }

    /// Broadcast regardless of throttling, e.g. right after joining.
    pub fn force_broadcast(&mut self, now: Instant) -> AwarenessRecord {
        self.dirty = false;
        self.last_broadcast = Some(now);
        self.local.clone()
    }

    /// Merge a remote record. Returns `true` if it replaced what we had.
    ///
    /// Older clocks are ignored. An equal clock keeps the existing record but
    /// still counts as a sign of life.
    pub fn apply_remote(&mut self, record: AwarenessRecord, now: Instant) -> bool {
        if record.site_id == self.local.site_id {
            return false;
        }

        match self.remote.get_mut(&record.site_id) {
            Some(entry) if record.clock < entry.record.clock => false,
            Some(entry) if record.clock == entry.record.clock => {
                entry.last_seen = now;
                false
            }
            _ => {
                log::trace!("awareness {} @{}", record.site_id, record.clock);
                self.remote.insert(
                    record.site_id,
                    RemoteEntry {
                        record,
                        last_seen: now,
                    },
                );
                true
            }
        }
    }

    pub fn remove(&mut self, site: &SiteId) -> Option<AwarenessRecord> {
        self.remote.remove(site).map(|entry| entry.record)
    }

    /// Drop every remote record not heard from within `timeout`.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<SiteId> {
        let expired: Vec<Uuid> = self
            .remote
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.last_seen) > timeout)
            .map(|(site, _)| *site)
            .collect();
        for site in &expired {
            self.remote.remove(site);
            log::debug!("awareness for {site} expired");
        }
        expired
    }

    pub fn get(&self, site: &SiteId) -> Option<&AwarenessRecord> {
        self.remote.get(site).map(|entry| &entry.record)
    }

    pub fn remote_records(&self) -> impl Iterator<Item = &AwarenessRecord> + '_ {
        self.remote.values().map(|entry| &entry.record)
    }

    /// Number of remote records.
    pub fn len(&self) -> usize {
        self.remote.len()
    }

    pub fn is_empty(&self) -> bool {
        self.remote.is_empty()
    }

    pub fn clear_remote(&mut self) {
        self.remote.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(n: u128) -> SiteId {
        Uuid::from_u128(n)
    }

    fn record(n: u128, clock: u64) -> AwarenessRecord {
        let mut record = AwarenessRecord::new(site(n), format!("peer-{n}"));
        record.clock = clock;
        record
    }

    #[test]
    fn test_color_is_stable() {
        let id = Uuid::new_v4();
        assert_eq!(CursorColor::from_site(id), CursorColor::from_site(id));
        let hex = CursorColor::from_site(id).to_hex();
        assert_eq!(hex.len(), 7);
        assert!(hex.starts_with('#'));
    }

    #[test]
    fn test_set_local_bumps_clock() {
        let mut store = AwarenessStore::new(site(1), "ada");
        let before = store.local().clock;
        store.set_local(Some(Selection::caret(None)), "ada l.");

        assert_eq!(store.local().clock, before + 1);
        assert_eq!(store.local().display_name, "ada l.");
        assert!(store.is_dirty());
    }

    #[test]
    fn test_take_dirty_is_throttled() {
        let start = Instant::now();
        let mut store = AwarenessStore::with_interval(site(1), "ada", Duration::from_millis(50));

        assert!(store.take_dirty(start).is_some());
        store.set_cursor(Some(Selection::caret(None)));
        assert!(store.take_dirty(start + Duration::from_millis(10)).is_none());
        // Still dirty, goes out once the interval passes
        let sent = store.take_dirty(start + Duration::from_millis(60)).unwrap();
        assert!(sent.cursor.is_some());
        assert!(store.take_dirty(start + Duration::from_millis(200)).is_none());
    }

    #[test]
    fn test_renew_if_stale() {
        let start = Instant::now();
        let timeout = Duration::from_secs(10);
        let mut store = AwarenessStore::new(site(1), "ada");
        store.force_broadcast(start);

        assert!(store.renew_if_stale(start + Duration::from_secs(2), timeout).is_none());
        let renewed = store.renew_if_stale(start + Duration::from_secs(6), timeout).unwrap();
        assert_eq!(renewed.clock, 1);
    }

    #[test]
    fn test_last_write_wins() {
        let now = Instant::now();
        let mut store = AwarenessStore::new(site(1), "ada");

        assert!(store.apply_remote(record(2, 5), now));
        assert!(!store.apply_remote(record(2, 3), now));
        assert_eq!(store.get(&site(2)).unwrap().clock, 5);

        let mut renamed = record(2, 5);
        renamed.display_name = "other".into();
        assert!(!store.apply_remote(renamed, now));
        assert_eq!(store.get(&site(2)).unwrap().display_name, "peer-2");

        assert!(store.apply_remote(record(2, 6), now));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_own_record_ignored() {
        let mut store = AwarenessStore::new(site(1), "ada");
        assert!(!store.apply_remote(record(1, 99), Instant::now()));
        assert!(store.is_empty());
    }

    #[test]
    fn test_expire_drops_silent_peers() {
        let start = Instant::now();
        let timeout = Duration::from_secs(30);
        let mut store = AwarenessStore::new(site(1), "ada");
        store.apply_remote(record(2, 1), start);
        store.apply_remote(record(3, 1), start + Duration::from_secs(20));

        let expired = store.expire(start + Duration::from_secs(40), timeout);
        assert_eq!(expired, vec![site(2)]);
        assert!(store.get(&site(2)).is_none());
        assert!(store.get(&site(3)).is_some());
    }

    #[test]
    fn test_equal_clock_refreshes_liveness() {
        let start = Instant::now();
        let timeout = Duration::from_secs(30);
        let mut store = AwarenessStore::new(site(1), "ada");
        store.apply_remote(record(2, 4), start);
        store.apply_remote(record(2, 4), start + Duration::from_secs(25));

        assert!(store.expire(start + Duration::from_secs(40), timeout).is_empty());
    }

    #[test]
    fn test_record_encoding() {
        let mut original = record(7, 3);
        original.cursor = Some(Selection {
            anchor: None,
            head: Some(ElementId::new(2, site(7))),
        });
        let bytes = original.encode().unwrap();
        assert_eq!(AwarenessRecord::decode(&bytes).unwrap(), original);
    }
}
