//! Ordered block index over character elements.
//!
//! Elements are kept in document order inside fixed-capacity blocks. Each
//! block caches its visible (non-tombstoned) count so that translating a
//! visible offset to an element skips whole blocks, and an id → block map
//! finds any element without scanning the document.
//!
//! ```text
//! order:   [ b0 ]──[ b3 ]──[ b1 ]──[ b2 ]      (block ids in document order)
//!            │       │       │       │
//! visible:   41      0       64      17        (tombstoned blocks are skipped)
//! ```
//!
//! Lookup by id: O(blocks + BLOCK_CAPACITY). Lookup by visible offset:
//! O(blocks + BLOCK_CAPACITY).

use std::collections::HashMap;

use super::id::ElementId;

/// Maximum elements per block before it splits in half.
pub const BLOCK_CAPACITY: usize = 64;

/// A single inserted character. Never physically removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub id: ElementId,
    /// Left anchor at insertion time (`None` = start of document).
    pub origin: Option<ElementId>,
    pub ch: char,
    pub deleted: bool,
}

#[derive(Debug, Clone, Default)]
struct Block {
    elements: Vec<Element>,
    visible: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot {
    /// Position of the block in `order`
    ordinal: usize,
    /// Position inside the block
    offset: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct BlockList {
    /// Block storage, addressed by stable block id
    blocks: Vec<Block>,
    /// Block ids in document order
    order: Vec<usize>,
    /// Element id → block id
    index: HashMap<ElementId, usize>,
    visible: usize,
}

impl Default for BlockList {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockList {
    pub fn new() -> Self {
        Self {
            blocks: vec![Block::default()],
            order: vec![0],
            index: HashMap::new(),
            visible: 0,
        }
    }

    /// Total elements, tombstones included.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn visible_len(&self) -> usize {
        self.visible
    }

    pub fn block_count(&self) -> usize {
        self.order.len()
    }

    pub fn contains(&self, id: &ElementId) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &ElementId) -> Option<&Element> {
        let block = &self.blocks[*self.index.get(id)?];
        block.elements.iter().find(|e| e.id == *id)
    }

    fn locate(&self, id: &ElementId) -> Option<Slot> {
        let block_id = *self.index.get(id)?;
        let ordinal = self.order.iter().position(|b| *b == block_id)?;
        let offset = self.blocks[block_id]
            .elements
            .iter()
            .position(|e| e.id == *id)?;
        Some(Slot { ordinal, offset })
    }

    /// Place `element` right after its origin, skipping every following
    /// element with a greater id. Returns `false` if the origin is absent.
    pub fn integrate(&mut self, element: Element) -> bool {
        match self.integration_slot(element.origin, element.id) {
            Some(slot) => {
                self.insert_at(slot, element);
                true
            }
            None => false,
        }
    }

    fn integration_slot(&self, origin: Option<ElementId>, id: ElementId) -> Option<Slot> {
        let mut slot = match origin {
            None => Slot { ordinal: 0, offset: 0 },
            Some(origin) => {
                let at = self.locate(&origin)?;
                Slot {
                    ordinal: at.ordinal,
                    offset: at.offset + 1,
                }
            }
        };

        loop {
            let block = &self.blocks[self.order[slot.ordinal]];
            match block.elements.get(slot.offset) {
                Some(next) if next.id > id => slot.offset += 1,
                Some(_) => return Some(slot),
                None if slot.ordinal + 1 < self.order.len() => {
                    slot = Slot {
                        ordinal: slot.ordinal + 1,
                        offset: 0,
                    };
                }
                None => return Some(slot),
            }
        }
    }

    fn insert_at(&mut self, slot: Slot, element: Element) {
        let block_id = self.order[slot.ordinal];
        let visible = !element.deleted;
        self.index.insert(element.id, block_id);

        let block = &mut self.blocks[block_id];
        block.elements.insert(slot.offset, element);
        if visible {
            block.visible += 1;
            self.visible += 1;
        }

        if block.elements.len() > BLOCK_CAPACITY {
            self.split(slot.ordinal);
        }
    }

    fn split(&mut self, ordinal: usize) {
        let block_id = self.order[ordinal];
        let new_id = self.blocks.len();

        let block = &mut self.blocks[block_id];
        let tail = block.elements.split_off(block.elements.len() / 2);
        let tail_visible = tail.iter().filter(|e| !e.deleted).count();
        block.visible -= tail_visible;

        for element in &tail {
            self.index.insert(element.id, new_id);
        }
        self.blocks.push(Block {
            elements: tail,
            visible: tail_visible,
        });
        self.order.insert(ordinal + 1, new_id);
    }

    /// Tombstone an element. `None` if unknown, `Some(false)` if it was
    /// already deleted.
    pub fn mark_deleted(&mut self, id: &ElementId) -> Option<bool> {
        let block = &mut self.blocks[*self.index.get(id)?];
        let element = block.elements.iter_mut().find(|e| e.id == *id)?;
        if element.deleted {
            return Some(false);
        }
        element.deleted = true;
        block.visible -= 1;
        self.visible -= 1;
        Some(true)
    }

    /// All elements in document order, tombstones included.
    pub fn iter(&self) -> impl Iterator<Item = &Element> + '_ {
        self.order
            .iter()
            .flat_map(move |b| self.blocks[*b].elements.iter())
    }

    /// Visible characters in document order.
    pub fn visible_chars(&self) -> impl Iterator<Item = char> + '_ {
        self.order
            .iter()
            .map(move |b| &self.blocks[*b])
            .filter(|block| block.visible > 0)
            .flat_map(|block| block.elements.iter())
            .filter(|e| !e.deleted)
            .map(|e| e.ch)
    }

    /// The visible element at `index`.
    pub fn visible_at(&self, mut index: usize) -> Option<&Element> {
        for block_id in &self.order {
            let block = &self.blocks[*block_id];
            if index >= block.visible {
                index -= block.visible;
                continue;
            }
            return block.elements.iter().filter(|e| !e.deleted).nth(index);
        }
        None
    }

    /// Number of visible elements strictly before `id`.
    pub fn visible_before(&self, id: &ElementId) -> Option<usize> {
        let slot = self.locate(id)?;
        let preceding: usize = self.order[..slot.ordinal]
            .iter()
            .map(|b| self.blocks[*b].visible)
            .sum();
        let block = &self.blocks[self.order[slot.ordinal]];
        let within = block.elements[..slot.offset]
            .iter()
            .filter(|e| !e.deleted)
            .count();
        Some(preceding + within)
    }
}
