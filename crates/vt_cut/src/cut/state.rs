//! CutState - one buffer of a cut.
//!
//! Holds the cut set, the per-depth index arrays the renderer samples, and
//! the slot maps. Index levels are shared copy-on-write between the front and
//! back buffers, so publishing only copies the levels a dispatch touched.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::quadtree::{tiles_at_depth, NodeId};
use crate::slots::{IndexEntry, SlotPosition, EMPTY_ENTRY};

/// Most levels a cut indexes. The finest level alone holds `4^(levels - 1)`
/// entries.
pub const MAX_INDEXED_LEVELS: u32 = 14;

/// Node id -> slot position.
pub type SlotMap = BTreeMap<NodeId, SlotPosition>;

/// One buffer of a double-buffered cut.
#[derive(Clone, Debug)]
pub struct CutState {
  /// Node ids forming the drawn partition.
  cut: BTreeSet<NodeId>,
  /// One array per depth, row-major over that level's tile grid.
  index: Vec<Arc<Vec<IndexEntry>>>,
  /// Slots held by this cut.
  locked: SlotMap,
  /// Slots whose index entry changed in the last indexing pass.
  updated: SlotMap,
  /// Slots released in the last indexing pass.
  cleared: SlotMap,
}

impl CutState {
  /// Create an empty state with index arrays for `depth` levels.
  pub fn new(depth: u32) -> Self {
    let index = (0..depth)
      .map(|d| Arc::new(vec![EMPTY_ENTRY; tiles_at_depth(d) as usize]))
      .collect();
    Self {
      cut: BTreeSet::new(),
      index,
      locked: SlotMap::new(),
      updated: SlotMap::new(),
      cleared: SlotMap::new(),
    }
  }

  pub fn cut(&self) -> &BTreeSet<NodeId> {
    &self.cut
  }

  pub fn cut_mut(&mut self) -> &mut BTreeSet<NodeId> {
    &mut self.cut
  }

  /// Replace the cut set, returning the previous one.
  pub fn replace_cut(&mut self, cut: BTreeSet<NodeId>) -> BTreeSet<NodeId> {
    std::mem::replace(&mut self.cut, cut)
  }

  /// Number of levels with an index array.
  pub fn depth(&self) -> u32 {
    self.index.len() as u32
  }

  /// Index array of one level.
  pub fn index(&self, depth: u32) -> Option<&[IndexEntry]> {
    self.index.get(depth as usize).map(|level| level.as_slice())
  }

  /// Index entry at `node`'s own level.
  pub fn index_entry(&self, node: NodeId) -> Option<IndexEntry> {
    let (level, offset) = self.locate(node)?;
    self.index[level].get(offset).copied()
  }

  /// Write the index entry of `node`.
  ///
  /// Returns true if the entry changed. Nodes below the last level are
  /// ignored.
  pub fn set_index_entry(&mut self, node: NodeId, entry: IndexEntry) -> bool {
    let Some((level, offset)) = self.locate(node) else {
      return false;
    };
    if self.index[level][offset] == entry {
      return false;
    }
    Arc::make_mut(&mut self.index[level])[offset] = entry;
    true
  }

  fn locate(&self, node: NodeId) -> Option<(usize, usize)> {
    let depth = node.depth();
    if depth >= self.depth() {
      return None;
    }
    let pos = node.position();
    let row = 1usize << depth;
    Some((depth as usize, pos.y as usize * row + pos.x as usize))
  }

  pub fn locked(&self) -> &SlotMap {
    &self.locked
  }

  pub fn locked_mut(&mut self) -> &mut SlotMap {
    &mut self.locked
  }

  pub fn updated(&self) -> &SlotMap {
    &self.updated
  }

  pub fn updated_mut(&mut self) -> &mut SlotMap {
    &mut self.updated
  }

  pub fn cleared(&self) -> &SlotMap {
    &self.cleared
  }

  pub fn cleared_mut(&mut self) -> &mut SlotMap {
    &mut self.cleared
  }

  /// Forget the per-pass deltas.
  pub fn reset_deltas(&mut self) {
    self.updated.clear();
    self.cleared.clear();
  }

  /// Check that no node of the cut is an ancestor of another.
  pub fn is_valid_partition(&self) -> bool {
    self.cut.iter().all(|node| {
      let mut current = node.parent();
      while let Some(ancestor) = current {
        if self.cut.contains(&ancestor) {
          return false;
        }
        current = ancestor.parent();
      }
      true
    })
  }

  /// Check that the cut covers the whole atlas area (when non-empty).
  pub fn covers_atlas(&self) -> bool {
    if self.cut.is_empty() {
      return true;
    }
    // each node at depth d covers 4^-d of the area; sum in units of 4^-max
    let max = self.cut.iter().map(|n| n.depth()).max().unwrap_or(0);
    let covered: u128 = self
      .cut
      .iter()
      .map(|n| 1u128 << (2 * (max - n.depth())))
      .sum();
    covered == 1u128 << (2 * max)
  }

  /// Check that every node of the cut holds exactly one locked slot.
  pub fn is_fully_bound(&self) -> bool {
    self.cut.len() == self.locked.len() && self.cut.iter().all(|n| self.locked.contains_key(n))
  }
}
