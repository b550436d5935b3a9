//! NodeId - immutable value type representing a position in the atlas
//! quadtree.
//!
//! Nodes are numbered breadth-first: the root is 0 and the children of `n`
//! are `4n + 1 ..= 4n + 4`. Depth and grid position are recovered from the id
//! alone, so no tree structure is ever stored.

use std::fmt;

use glam::UVec2;

/// Deepest level whose whole id range fits in a `u64`.
pub const MAX_DEPTH: u32 = 31;

/// Quadtree node identifier.
///
/// Child index `i` (0-3) of a node contributes `i & 1` to the x coordinate
/// and `i >> 1` to the y coordinate at the child's level.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
pub struct NodeId(pub u64);

impl NodeId {
  /// The single node at depth 0.
  pub const ROOT: Self = Self(0);

  /// Raw id value.
  #[inline]
  pub fn raw(self) -> u64 {
    self.0
  }

  /// Depth of this node (root = 0).
  pub fn depth(self) -> u32 {
    let mut depth = 0;
    let mut first = 0u64;
    // first id at depth d+1 is 4 * first(d) + 1
    while let Some(next) = first.checked_mul(4).and_then(|v| v.checked_add(1)) {
      if next > self.0 {
        break;
      }
      first = next;
      depth += 1;
    }
    depth
  }

  /// Grid position at this node's own depth.
  pub fn position(self) -> UVec2 {
    let mut id = self.0;
    let mut pos = UVec2::ZERO;
    let mut bit = 0;
    while id > 0 {
      let index = ((id - 1) % 4) as u32;
      pos.x |= (index & 1) << bit;
      pos.y |= (index >> 1) << bit;
      bit += 1;
      id = (id - 1) / 4;
    }
    pos
  }

  /// Build the id of the node at `(x, y)` on level `depth`.
  ///
  /// Returns None if the position lies outside the level or the depth is not
  /// addressable.
  pub fn from_position(depth: u32, x: u32, y: u32) -> Option<Self> {
    if depth > MAX_DEPTH {
      return None;
    }
    let row = tiles_per_row(depth);
    if u64::from(x) >= row || u64::from(y) >= row {
      return None;
    }
    let mut local = 0u64;
    for bit in 0..depth {
      local |= u64::from((x >> bit) & 1) << (2 * bit);
      local |= u64::from((y >> bit) & 1) << (2 * bit + 1);
    }
    Some(Self(first_id_at_depth(depth) + local))
  }

  /// Parent node (coarser). Returns None for the root.
  #[inline]
  pub fn parent(self) -> Option<Self> {
    if self.0 == 0 {
      return None;
    }
    Some(Self((self.0 - 1) / 4))
  }

  /// Child `index` (0-3) of this node (finer).
  ///
  /// Returns None when the child id would overflow the id space.
  #[inline]
  pub fn child(self, index: u8) -> Option<Self> {
    debug_assert!(index < 4, "child index out of range: {index}");
    self
      .0
      .checked_mul(4)
      .and_then(|v| v.checked_add(1 + u64::from(index & 3)))
      .map(Self)
  }

  /// All four children, ordered by child index.
  pub fn children(self) -> Option<[Self; 4]> {
    Some([self.child(0)?, self.child(1)?, self.child(2)?, self.child(3)?])
  }

  /// Index of this node among its siblings (0-3). The root reports 0.
  #[inline]
  pub fn sibling_index(self) -> u8 {
    if self.0 == 0 {
      0
    } else {
      ((self.0 - 1) % 4) as u8
    }
  }

  /// The four siblings of this node, itself included. None for the root.
  pub fn siblings(self) -> Option<[Self; 4]> {
    self.parent()?.children()
  }

  /// Check whether `self` is a strict ancestor of `other`.
  pub fn is_ancestor_of(self, other: Self) -> bool {
    let mut current = other.parent();
    while let Some(node) = current {
      if node == self {
        return true;
      }
      if node.0 < self.0 {
        return false;
      }
      current = node.parent();
    }
    false
  }
}

impl fmt::Display for NodeId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "#{}", self.0)
  }
}

impl From<u64> for NodeId {
  fn from(raw: u64) -> Self {
    Self(raw)
  }
}

/// Number of tiles along one edge of the grid at `depth` (2^depth).
#[inline]
pub fn tiles_per_row(depth: u32) -> u64 {
  1u64 << depth.min(63)
}

/// Number of tiles on level `depth` (4^depth).
#[inline]
pub fn tiles_at_depth(depth: u32) -> u64 {
  tiles_per_row(depth).saturating_mul(tiles_per_row(depth))
}

/// Id of the first (top-left) node on level `depth`: (4^depth - 1) / 3.
#[inline]
pub fn first_id_at_depth(depth: u32) -> u64 {
  (0..depth.min(MAX_DEPTH + 1)).fold(0u64, |first, _| first * 4 + 1)
}

/// Depth of `id`.
#[inline]
pub fn depth_of(id: NodeId) -> u32 {
  id.depth()
}

/// Grid position of `id` at its own depth.
#[inline]
pub fn position_of(id: NodeId) -> UVec2 {
  id.position()
}

/// Parent of `id`; the root is its own parent.
#[inline]
pub fn parent_of(id: NodeId) -> NodeId {
  id.parent().unwrap_or(NodeId::ROOT)
}

/// Child `index` of `id`, saturating at the last addressable id.
#[inline]
pub fn child_of(id: NodeId, index: u8) -> NodeId {
  id.child(index).unwrap_or(NodeId(u64::MAX))
}

#[cfg(test)]
#[path = "node_test.rs"]
mod node_test;
