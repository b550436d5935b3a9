//! Atlas - description of one tiled texture dataset.
//!
//! Only what the cut update needs is kept here: the quadtree depth, a name for
//! diagnostics and the per-tile perceptual weight used to rank split
//! candidates. Decoding the atlas file is the tile cache's business.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::quadtree::{NodeId, MAX_DEPTH};

/// Atomic counter for generating unique AtlasIds.
static ATLAS_ID_COUNTER: AtomicU32 = AtomicU32::new(1);

/// Opaque atlas identifier, unique within the process lifetime.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct AtlasId(u32);

impl AtlasId {
  /// Bounds for range queries over ids.
  pub const MIN: Self = Self(0);
  pub const MAX: Self = Self(u32::MAX);

  /// Generate a new unique AtlasId.
  pub fn new() -> Self {
    Self(ATLAS_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
  }

  /// Get the raw ID value.
  pub fn raw(&self) -> u32 {
    self.0
  }
}

impl Default for AtlasId {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Display for AtlasId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "atlas{}", self.0)
  }
}

/// One tiled texture dataset addressed by a quadtree.
#[derive(Clone, Debug)]
pub struct Atlas {
  id: AtlasId,
  name: String,
  /// Number of quadtree levels (root level included).
  depth: u32,
  /// Perceptual significance per tile (CIELAB variance). Missing = 1.0.
  weights: HashMap<NodeId, f32>,
}

impl Atlas {
  /// Create an atlas with `depth` levels; clamped to `1..=MAX_DEPTH + 1`.
  pub fn new(name: impl Into<String>, depth: u32) -> Self {
    Self {
      id: AtlasId::new(),
      name: name.into(),
      depth: depth.clamp(1, MAX_DEPTH + 1),
      weights: HashMap::new(),
    }
  }

  /// Attach perceptual weights, replacing any existing ones.
  pub fn with_weights(mut self, weights: impl IntoIterator<Item = (NodeId, f32)>) -> Self {
    self.weights = weights.into_iter().collect();
    self
  }

  pub fn id(&self) -> AtlasId {
    self.id
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// Number of levels.
  pub fn depth(&self) -> u32 {
    self.depth
  }

  /// Deepest level a tile can live on; tiles there are never split.
  pub fn max_depth(&self) -> u32 {
    self.depth - 1
  }

  /// Check if `node` lies inside this atlas.
  pub fn contains(&self, node: NodeId) -> bool {
    node.depth() < self.depth
  }

  /// Perceptual significance of `node`, used to scale split priority.
  pub fn perceptual_weight(&self, node: NodeId) -> f32 {
    self.weights.get(&node).copied().unwrap_or(1.0)
  }

  /// Set the perceptual weight of a single tile.
  pub fn set_weight(&mut self, node: NodeId, weight: f32) {
    self.weights.insert(node, weight);
  }
}
