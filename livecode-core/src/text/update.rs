//! Updates: the deltas peers exchange.

use serde::{Deserialize, Serialize};

use super::id::{ElementId, SiteId};
use super::TextError;
use crate::codec;

/// A single replicated operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    Insert {
        id: ElementId,
        origin: Option<ElementId>,
        ch: char,
    },
    Delete {
        id: ElementId,
    },
}

impl Op {
    /// The element this operation creates or tombstones.
    pub fn target(&self) -> ElementId {
        match self {
            Op::Insert { id, .. } | Op::Delete { id } => *id,
        }
    }
}

/// Immutable, appendable batch of operations produced by one site.
///
/// Applying an update is idempotent and commutes with every other update,
/// so peers may receive them duplicated or in any order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    pub site: SiteId,
    pub ops: Vec<Op>,
}

impl Update {
    pub fn new(site: SiteId) -> Self {
        Self {
            site,
            ops: Vec::new(),
        }
    }

    pub fn push(&mut self, op: Op) {
        self.ops.push(op);
    }

    /// Append another update's operations after this one's.
    pub fn append(&mut self, other: Update) {
        self.ops.extend(other.ops);
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn encode(&self) -> Result<Vec<u8>, TextError> {
        Ok(codec::encode(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TextError> {
        Ok(codec::decode(bytes)?)
    }

    /// LZ4-compressed encoding, used for full-state snapshots.
    pub fn encode_compressed(&self) -> Result<Vec<u8>, TextError> {
        Ok(codec::encode_compressed(self)?)
    }

    pub fn decode_compressed(bytes: &[u8]) -> Result<Self, TextError> {
        Ok(codec::decode_compressed(bytes)?)
    }
}

/// An operation that was dropped while applying an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedOp {
    pub op: Op,
    pub error: TextError,
}

/// Outcome of [`ReplicatedText::apply_update`](super::ReplicatedText::apply_update).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Operations that changed local state (including deferred inserts
    /// released by this update)
    pub applied: usize,
    /// Operations already known
    pub duplicates: usize,
    /// Operations buffered until their anchor or target arrives
    pub deferred: usize,
    pub rejected: Vec<RejectedOp>,
}

impl ApplyReport {
    pub fn changed(&self) -> bool {
        self.applied > 0
    }

    pub fn merge(&mut self, other: ApplyReport) {
        self.applied += other.applied;
        self.duplicates += other.duplicates;
        self.deferred += other.deferred;
        self.rejected.extend(other.rejected);
    }
}
