//! Page table node.

use super::entry::PageEntry;

/// A single slot of a page table node.
#[derive(Debug, Default)]
pub enum Slot {
    /// Nothing has been created for this index yet.
    #[default]
    Empty,
    /// A table for the next level down.
    Node(Box<TableNode>),
    /// A leaf entry. Only found in tables at level 0.
    Leaf(PageEntry),
}

/// A page table node.
///
/// Each node owns a fixed number of slots, set by the configured entries-per-table.
/// Nodes own their children exclusively, so dropping the root drops the whole tree.
#[derive(Debug)]
pub struct TableNode {
    slots: Box<[Slot]>,
}

impl TableNode {
    /// Creates a new node with every slot empty.
    pub fn new(entries: usize) -> Self {
        Self {
            slots: (0..entries).map(|_| Slot::Empty).collect(),
        }
    }

    /// Returns the slot at the given index, or None if it is out of range.
    pub fn slot(&self, index: usize) -> Option<&Slot> {
        self.slots.get(index)
    }

    /// Returns the slot at the given index for modification.
    pub fn slot_mut(&mut self, index: usize) -> Option<&mut Slot> {
        self.slots.get_mut(index)
    }

    /// Returns the number of slots in this node.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|slot| matches!(slot, Slot::Empty))
    }

    /// Visits every leaf entry in this subtree.
    pub fn for_each_leaf(&self, visit: &mut impl FnMut(&PageEntry)) {
        for slot in self.slots.iter() {
            match slot {
                Slot::Empty => {}
                Slot::Node(child) => child.for_each_leaf(visit),
                Slot::Leaf(entry) => visit(entry),
            }
        }
    }
}
