//! Replicated text: a sequence CRDT over characters.
//!
//! Every character is an [`Element`] with a Lamport [`ElementId`], a left
//! anchor (`origin`) and a tombstone flag. An element is placed immediately
//! after its origin, skipping every following element whose id is greater;
//! the rule only depends on ids, so all replicas that integrated the same
//! elements agree on the order regardless of delivery order.
//!
//! ```text
//! site 1: insert 'a' at start      site 2: insert 'x' at start
//!          a(1,s1)                           x(1,s2)
//!                 \                         /
//!                  merge ── ids (1,s2) > (1,s1)
//!                         │
//!                  "xa" on both sites
//! ```
//!
//! Remote operations whose anchor (or delete target) has not arrived yet are
//! deferred and released once it does.

mod id;
mod index;
mod update;

use std::collections::{HashMap, HashSet};
use std::mem;

use thiserror::Error;

use crate::codec::CodecError;
use index::BlockList;

pub use id::{ElementId, LamportClock, SiteId};
pub use index::{Element, BLOCK_CAPACITY};
pub use update::{ApplyReport, Op, RejectedOp, Update};

/// Upper bound on remote operations held while waiting for their anchor.
pub const MAX_DEFERRED_OPS: usize = 10_000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TextError {
    #[error("invalid anchor {0}")]
    InvalidAnchor(ElementId),
    #[error("unknown element {0}")]
    UnknownElement(ElementId),
    #[error("index {index} out of bounds (len {len})")]
    IndexOutOfBounds { index: usize, len: usize },
    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(Debug, Clone, Copy)]
struct DeferredInsert {
    id: ElementId,
    ch: char,
}

/// One site's replica of a shared text document.
#[derive(Debug, Clone)]
pub struct ReplicatedText {
    site: SiteId,
    clock: LamportClock,
    elements: BlockList,
    /// Remote inserts keyed by the anchor they are waiting for
    waiting_inserts: HashMap<ElementId, Vec<DeferredInsert>>,
    waiting_ids: HashSet<ElementId>,
    /// Remote deletes of elements not yet integrated
    waiting_deletes: HashSet<ElementId>,
    /// Local operations since the last `take_update`
    outgoing: Vec<Op>,
}

impl ReplicatedText {
    pub fn new(site: SiteId) -> Self {
        Self {
            site,
            clock: LamportClock::new(),
            elements: BlockList::new(),
            waiting_inserts: HashMap::new(),
            waiting_ids: HashSet::new(),
            waiting_deletes: HashSet::new(),
            outgoing: Vec::new(),
        }
    }

    pub fn site(&self) -> SiteId {
        self.site
    }

    pub fn clock(&self) -> u64 {
        self.clock.current()
    }

    // ── Local editing ─────────────────────────────────────────────

    /// Insert `ch` right after `after` (`None` = start of document).
    pub fn insert(&mut self, after: Option<ElementId>, ch: char) -> Result<ElementId, TextError> {
        if let Some(anchor) = after {
            if !self.elements.contains(&anchor) {
                return Err(TextError::InvalidAnchor(anchor));
            }
        }

        let id = ElementId::new(self.clock.tick(), self.site);
        self.elements.integrate(Element {
            id,
            origin: after,
            ch,
            deleted: false,
        });
        self.outgoing.push(Op::Insert {
            id,
            origin: after,
            ch,
        });
        Ok(id)
    }

    /// Tombstone an element. Returns `false` if it was already deleted.
    pub fn delete(&mut self, id: ElementId) -> Result<bool, TextError> {
        match self.elements.mark_deleted(&id) {
            None => Err(TextError::UnknownElement(id)),
            Some(changed) => {
                if changed {
                    self.outgoing.push(Op::Delete { id });
                }
                Ok(changed)
            }
        }
    }

    /// Insert a string at a visible offset.
    pub fn insert_str_at(&mut self, index: usize, text: &str) -> Result<Vec<ElementId>, TextError> {
        let mut after = self.anchor_at(index)?;
        let mut ids = Vec::with_capacity(text.len());
        for ch in text.chars() {
            let id = self.insert(after, ch)?;
            after = Some(id);
            ids.push(id);
        }
        Ok(ids)
    }

    /// Delete `len` visible characters starting at `index`. Returns how many
    /// were deleted.
    pub fn delete_range(&mut self, index: usize, len: usize) -> Result<usize, TextError> {
        let visible = self.len();
        let end = index.saturating_add(len);
        if end > visible {
            return Err(TextError::IndexOutOfBounds {
                index: end,
                len: visible,
            });
        }

        let ids: Vec<ElementId> = (index..end)
            .filter_map(|i| self.elements.visible_at(i).map(|e| e.id))
            .collect();
        for id in &ids {
            self.delete(*id)?;
        }
        Ok(ids.len())
    }

    /// Drain local operations into an update for broadcast.
    pub fn take_update(&mut self) -> Option<Update> {
        if self.outgoing.is_empty() {
            return None;
        }
        Some(Update {
            site: self.site,
            ops: mem::take(&mut self.outgoing),
        })
    }

    pub fn has_local_changes(&self) -> bool {
        !self.outgoing.is_empty()
    }

    // ── Positions ─────────────────────────────────────────────────

    /// Element-relative position of visible offset `index`: the element
    /// immediately to its left, or `None` at the start.
    pub fn anchor_at(&self, index: usize) -> Result<Option<ElementId>, TextError> {
        let len = self.len();
        if index > len {
            return Err(TextError::IndexOutOfBounds { index, len });
        }
        if index == 0 {
            return Ok(None);
        }
        Ok(self.elements.visible_at(index - 1).map(|e| e.id))
    }

    /// Visible offset of an element-relative position. Positions anchored
    /// to a tombstone collapse onto the nearest visible offset.
    pub fn resolve_anchor(&self, anchor: Option<ElementId>) -> Option<usize> {
        let Some(id) = anchor else {
            return Some(0);
        };
        let before = self.elements.visible_before(&id)?;
        let element = self.elements.get(&id)?;
        Some(if element.deleted { before } else { before + 1 })
    }

    /// Id of the visible character at `index`.
    pub fn id_at(&self, index: usize) -> Option<ElementId> {
        self.elements.visible_at(index).map(|e| e.id)
    }

    /// Visible offset of a live element.
    pub fn index_of(&self, id: &ElementId) -> Option<usize> {
        match self.elements.get(id) {
            Some(element) if !element.deleted => self.elements.visible_before(id),
            _ => None,
        }
    }

    // ── Merging ───────────────────────────────────────────────────

    /// Merge a remote update. Each operation is accepted or rejected on its
    /// own; a rejected operation leaves no trace in local state.
    pub fn apply_update(&mut self, update: &Update) -> ApplyReport {
        let mut report = ApplyReport::default();
        for op in &update.ops {
            let result = match *op {
                Op::Insert { id, origin, ch } => self.apply_insert(id, origin, ch, &mut report),
                Op::Delete { id } => self.apply_delete(id, &mut report),
            };
            if let Err(error) = result {
                log::warn!("Dropping {:?} from site {}: {error}", op, update.site);
                report.rejected.push(RejectedOp {
                    op: op.clone(),
                    error,
                });
            }
        }
        report
    }

    fn apply_insert(
        &mut self,
        id: ElementId,
        origin: Option<ElementId>,
        ch: char,
        report: &mut ApplyReport,
    ) -> Result<(), TextError> {
        if self.elements.contains(&id) || self.waiting_ids.contains(&id) {
            report.duplicates += 1;
            return Ok(());
        }

        if let Some(anchor) = origin {
            // An anchor is always seen before its dependents, so its clock is lower
            if anchor.clock >= id.clock {
                return Err(TextError::InvalidAnchor(anchor));
            }
            if !self.elements.contains(&anchor) {
                if self.deferred_count() >= MAX_DEFERRED_OPS {
                    return Err(TextError::InvalidAnchor(anchor));
                }
                self.waiting_ids.insert(id);
                self.waiting_inserts
                    .entry(anchor)
                    .or_default()
                    .push(DeferredInsert { id, ch });
                report.deferred += 1;
                return Ok(());
            }
        }

        self.integrate_remote(id, origin, ch, report);
        Ok(())
    }

    fn integrate_remote(
        &mut self,
        id: ElementId,
        origin: Option<ElementId>,
        ch: char,
        report: &mut ApplyReport,
    ) {
        let mut ready = vec![(id, origin, ch)];
        while let Some((id, origin, ch)) = ready.pop() {
            self.clock.observe(id.clock);
            self.waiting_ids.remove(&id);
            let deleted = self.waiting_deletes.remove(&id);
            let integrated = self.elements.integrate(Element {
                id,
                origin,
                ch,
                deleted,
            });
            debug_assert!(integrated, "origin of {id} must be present");
            report.applied += 1;

            if let Some(dependents) = self.waiting_inserts.remove(&id) {
                ready.extend(dependents.into_iter().map(|d| (d.id, Some(id), d.ch)));
            }
        }
    }

    fn apply_delete(&mut self, id: ElementId, report: &mut ApplyReport) -> Result<(), TextError> {
        match self.elements.mark_deleted(&id) {
            Some(true) => report.applied += 1,
            Some(false) => report.duplicates += 1,
            None if self.waiting_deletes.contains(&id) => report.duplicates += 1,
            None => {
                if self.deferred_count() >= MAX_DEFERRED_OPS {
                    return Err(TextError::UnknownElement(id));
                }
                self.waiting_deletes.insert(id);
                report.deferred += 1;
            }
        }
        Ok(())
    }

    // ── State ─────────────────────────────────────────────────────

    /// Full state as an update: every element in document order, then a
    /// delete for each tombstone. Anchors always precede their dependents,
    /// so applying it never defers.
    pub fn snapshot(&self) -> Update {
        let mut update = Update::new(self.site);
        for element in self.elements.iter() {
            update.push(Op::Insert {
                id: element.id,
                origin: element.origin,
                ch: element.ch,
            });
        }
        for element in self.elements.iter().filter(|e| e.deleted) {
            update.push(Op::Delete { id: element.id });
        }
        update
    }

    /// The visible text.
    pub fn materialize(&self) -> String {
        let mut text = String::with_capacity(self.len());
        text.extend(self.elements.visible_chars());
        text
    }

    /// Visible character count.
    pub fn len(&self) -> usize {
        self.elements.visible_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Integrated elements, tombstones included.
    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    pub fn tombstone_count(&self) -> usize {
        self.elements.len() - self.elements.visible_len()
    }

    /// Remote operations waiting for an anchor or target.
    pub fn deferred_count(&self) -> usize {
        self.waiting_ids.len() + self.waiting_deletes.len()
    }

    pub fn contains(&self, id: &ElementId) -> bool {
        self.elements.contains(id)
    }

    pub fn is_deleted(&self, id: &ElementId) -> Option<bool> {
        self.elements.get(id).map(|e| e.deleted)
    }

    pub fn elements(&self) -> impl Iterator<Item = &Element> + '_ {
        self.elements.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn site(n: u128) -> SiteId {
        Uuid::from_u128(n)
    }

    #[test]
    fn test_insert_and_materialize() {
        let mut text = ReplicatedText::new(site(1));
        let h = text.insert(None, 'h').unwrap();
        let i = text.insert(Some(h), 'i').unwrap();
        text.insert(Some(i), '!').unwrap();

        assert_eq!(text.materialize(), "hi!");
        assert_eq!(text.len(), 3);
        assert!(h < i);
    }

    #[test]
    fn test_insert_unknown_anchor_fails() {
        let mut text = ReplicatedText::new(site(1));
        let ghost = ElementId::new(4, site(2));
        assert_eq!(text.insert(Some(ghost), 'x'), Err(TextError::InvalidAnchor(ghost)));
        assert!(text.is_empty());
        assert!(text.take_update().is_none());
    }

    #[test]
    fn test_delete_is_idempotent() {
        let mut text = ReplicatedText::new(site(1));
        let ids = text.insert_str_at(0, "abc").unwrap();

        assert!(text.delete(ids[1]).unwrap());
        assert!(!text.delete(ids[1]).unwrap());
        assert_eq!(text.materialize(), "ac");
        assert_eq!(text.tombstone_count(), 1);

        // Only one delete op goes out
        let update = text.take_update().unwrap();
        let deletes = update.ops.iter().filter(|op| matches!(op, Op::Delete { .. })).count();
        assert_eq!(deletes, 1);
    }

    #[test]
    fn test_delete_unknown_fails() {
        let mut text = ReplicatedText::new(site(1));
        let ghost = ElementId::new(1, site(3));
        assert_eq!(text.delete(ghost), Err(TextError::UnknownElement(ghost)));
    }

    #[test]
    fn test_index_editing() {
        let mut text = ReplicatedText::new(site(1));
        text.insert_str_at(0, "helo").unwrap();
        text.insert_str_at(3, "l").unwrap();
        assert_eq!(text.materialize(), "hello");

        text.insert_str_at(5, " world").unwrap();
        assert_eq!(text.delete_range(0, 6).unwrap(), 6);
        assert_eq!(text.materialize(), "world");

        assert!(matches!(
            text.insert_str_at(42, "x"),
            Err(TextError::IndexOutOfBounds { index: 42, len: 5 })
        ));
        assert!(text.delete_range(3, 10).is_err());
        assert_eq!(text.materialize(), "world");
    }

    #[test]
    fn test_take_update_drains() {
        let mut text = ReplicatedText::new(site(1));
        text.insert_str_at(0, "ab").unwrap();
        assert!(text.has_local_changes());

        let update = text.take_update().unwrap();
        assert_eq!(update.len(), 2);
        assert_eq!(update.site, site(1));
        assert!(text.take_update().is_none());
    }

    #[test]
    fn test_concurrent_start_inserts_converge() {
        let mut one = ReplicatedText::new(site(1));
        let mut two = ReplicatedText::new(site(2));
        one.insert_str_at(0, "ab").unwrap();
        two.insert_str_at(0, "xy").unwrap();

        let from_one = one.take_update().unwrap();
        let from_two = two.take_update().unwrap();
        one.apply_update(&from_two);
        two.apply_update(&from_one);

        assert_eq!(one.materialize(), two.materialize());
        assert_eq!(one.len(), 4);
        // Equal clocks: the greater site id orders first
        assert_eq!(one.materialize(), "xyab");
    }

    #[test]
    fn test_duplicate_update_is_noop() {
        let mut author = ReplicatedText::new(site(1));
        author.insert_str_at(0, "dup").unwrap();
        let update = author.take_update().unwrap();

        let mut replica = ReplicatedText::new(site(2));
        let first = replica.apply_update(&update);
        let second = replica.apply_update(&update);

        assert_eq!(first.applied, 3);
        assert_eq!(second.applied, 0);
        assert_eq!(second.duplicates, 3);
        assert_eq!(replica.materialize(), "dup");
    }

    #[test]
    fn test_out_of_order_insert_is_deferred() {
        let mut author = ReplicatedText::new(site(1));
        author.insert_str_at(0, "a").unwrap();
        let first = author.take_update().unwrap();
        author.insert_str_at(1, "b").unwrap();
        let second = author.take_update().unwrap();

        let mut replica = ReplicatedText::new(site(2));
        let report = replica.apply_update(&second);
        assert_eq!(report.deferred, 1);
        assert_eq!(replica.materialize(), "");
        assert_eq!(replica.deferred_count(), 1);

        let report = replica.apply_update(&first);
        assert_eq!(report.applied, 2);
        assert_eq!(replica.materialize(), "ab");
        assert_eq!(replica.deferred_count(), 0);
    }

    #[test]
    fn test_delete_before_insert_is_deferred() {
        let mut author = ReplicatedText::new(site(1));
        author.insert_str_at(0, "q").unwrap();
        let insert = author.take_update().unwrap();
        author.delete_range(0, 1).unwrap();
        let delete = author.take_update().unwrap();

        let mut replica = ReplicatedText::new(site(2));
        assert_eq!(replica.apply_update(&delete).deferred, 1);
        replica.apply_update(&insert);

        assert_eq!(replica.materialize(), "");
        assert_eq!(replica.element_count(), 1);
        assert_eq!(replica.deferred_count(), 0);
    }

    #[test]
    fn test_malformed_anchor_rejected_alone() {
        let remote = site(9);
        let good = ElementId::new(1, remote);
        let bad = ElementId::new(2, remote);
        let mut update = Update::new(remote);
        update.push(Op::Insert { id: good, origin: None, ch: 'g' });
        // Anchor clock is not below the element's own clock
        update.push(Op::Insert {
            id: bad,
            origin: Some(ElementId::new(5, remote)),
            ch: 'b',
        });

        let mut replica = ReplicatedText::new(site(1));
        let report = replica.apply_update(&update);

        assert_eq!(report.applied, 1);
        assert_eq!(report.rejected.len(), 1);
        assert!(matches!(report.rejected[0].error, TextError::InvalidAnchor(_)));
        assert_eq!(replica.materialize(), "g");
        assert!(!replica.contains(&bad));
    }

    #[test]
    fn test_remote_clock_advances_local() {
        let mut author = ReplicatedText::new(site(1));
        for _ in 0..5 {
            author.insert(None, 'z').unwrap();
        }
        let update = author.take_update().unwrap();

        let mut replica = ReplicatedText::new(site(2));
        replica.apply_update(&update);
        let id = replica.insert(None, 'n').unwrap();
        assert!(id.clock > 5);
        // Newest insert at the start goes first
        assert_eq!(replica.materialize(), "nzzzzz");
    }

    #[test]
    fn test_snapshot_rebuilds_state() {
        let mut text = ReplicatedText::new(site(1));
        text.insert_str_at(0, "snapshot").unwrap();
        text.delete_range(4, 4).unwrap();

        let snapshot = text.snapshot();
        let mut fresh = ReplicatedText::new(site(2));
        let report = fresh.apply_update(&snapshot);

        assert_eq!(report.deferred, 0);
        assert_eq!(fresh.materialize(), "snap");
        assert_eq!(fresh.tombstone_count(), 4);
    }

    #[test]
    fn test_anchor_positions_follow_edits() {
        let mut one = ReplicatedText::new(site(1));
        one.insert_str_at(0, "hello").unwrap();
        let cursor = one.anchor_at(3).unwrap();
        assert_eq!(one.resolve_anchor(cursor), Some(3));

        one.insert_str_at(0, ">> ").unwrap();
        assert_eq!(one.resolve_anchor(cursor), Some(6));

        // Deleting the anchor element collapses onto its neighbour
        one.delete_range(5, 1).unwrap();
        assert_eq!(one.resolve_anchor(cursor), Some(5));

        assert_eq!(one.resolve_anchor(None), Some(0));
        assert_eq!(one.resolve_anchor(Some(ElementId::new(99, site(4)))), None);
    }

    #[test]
    fn test_index_of_and_id_at() {
        let mut text = ReplicatedText::new(site(1));
        let ids = text.insert_str_at(0, "abc").unwrap();
        assert_eq!(text.id_at(1), Some(ids[1]));
        assert_eq!(text.index_of(&ids[2]), Some(2));

        text.delete(ids[1]).unwrap();
        assert_eq!(text.index_of(&ids[1]), None);
        assert_eq!(text.index_of(&ids[2]), Some(1));
        assert_eq!(text.is_deleted(&ids[1]), Some(true));
    }
}
