//! Memory slots - physical residency units of one rendering context.
//!
//! A context owns a fixed arena of slots, one per tile the physical texture
//! can hold. Slots are addressed by a stable position; free positions live on
//! a free list. Binding a tile and taking a slot off the free list happen in
//! one step so a position is never half-allocated.

use crate::config::VtConfig;
use crate::quadtree::NodeId;
use crate::tile_cache::TileBuffer;

/// Stable index of a slot in the physical texture.
pub type SlotPosition = usize;

/// Index array entry: `[x_tile, y_tile, layer, valid]`.
pub type IndexEntry = [u8; 4];

/// Entry of a tile that is not resident at its own level.
pub const EMPTY_ENTRY: IndexEntry = [0; 4];

/// One physical residency unit.
#[derive(Debug)]
pub struct MemSlot {
  pub position: SlotPosition,
  /// Node bound to this slot; None while free.
  pub node: Option<NodeId>,
  /// Tile data handed out by the tile cache.
  pub tile: Option<TileBuffer>,
  /// Held by a cut.
  pub locked: bool,
  /// Index entry changed during the current indexing pass.
  pub updated: bool,
}

impl MemSlot {
  fn new(position: SlotPosition) -> Self {
    Self {
      position,
      node: None,
      tile: None,
      locked: false,
      updated: false,
    }
  }

  /// Check if this slot is free.
  #[inline]
  pub fn is_free(&self) -> bool {
    self.node.is_none()
  }

  fn clear(&mut self) {
    self.node = None;
    self.tile = None;
    self.locked = false;
    self.updated = false;
  }
}

/// Fixed-size slot arena with a free list.
#[derive(Debug)]
pub struct SlotPool {
  slots: Vec<MemSlot>,
  /// Free positions; the lowest position is popped first.
  free: Vec<SlotPosition>,
}

impl SlotPool {
  /// Create a pool of `size` free slots.
  pub fn new(size: usize) -> Self {
    Self {
      slots: (0..size).map(MemSlot::new).collect(),
      free: (0..size).rev().collect(),
    }
  }

  /// Take a free slot and bind `node` to it.
  ///
  /// Returns None when the pool is exhausted; the caller must release slots
  /// before allocating again.
  pub fn acquire_free_slot(&mut self, node: NodeId, tile: TileBuffer) -> Option<&mut MemSlot> {
    let position = self.free.pop()?;
    let slot = &mut self.slots[position];
    debug_assert!(slot.is_free(), "free list held occupied slot {position}");
    slot.node = Some(node);
    slot.tile = Some(tile);
    Some(slot)
  }

  /// Return a slot to the free list.
  ///
  /// Returns the node that was bound, or None if the slot was already free
  /// or out of range.
  pub fn release(&mut self, position: SlotPosition) -> Option<NodeId> {
    let slot = self.slots.get_mut(position)?;
    let node = slot.node?;
    slot.clear();
    self.free.push(position);
    Some(node)
  }

  pub fn slot(&self, position: SlotPosition) -> Option<&MemSlot> {
    self.slots.get(position)
  }

  pub fn slot_mut(&mut self, position: SlotPosition) -> Option<&mut MemSlot> {
    self.slots.get_mut(position)
  }

  /// Total number of slots.
  pub fn capacity(&self) -> usize {
    self.slots.len()
  }

  /// Number of free slots.
  pub fn available(&self) -> usize {
    self.free.len()
  }

  /// Number of bound slots.
  pub fn occupied(&self) -> usize {
    self.slots.len() - self.free.len()
  }

  /// Iterate over bound slots.
  pub fn iter_occupied(&self) -> impl Iterator<Item = &MemSlot> {
    self.slots.iter().filter(|slot| !slot.is_free())
  }
}

/// Mapping from slot positions to physical texture coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhysicalLayout {
  /// Tiles per row of one layer.
  pub tile_width: u32,
  pub layers: u32,
}

impl PhysicalLayout {
  pub fn from_config(config: &VtConfig) -> Self {
    Self {
      tile_width: config.phys_tex_tile_width,
      layers: config.phys_tex_layers,
    }
  }

  /// Slots per layer.
  #[inline]
  pub fn tiles_per_layer(&self) -> usize {
    (self.tile_width * self.tile_width) as usize
  }

  /// Index entry pointing at `position`.
  pub fn index_entry(&self, position: SlotPosition) -> IndexEntry {
    let per_layer = self.tiles_per_layer();
    let layer = position / per_layer;
    let rel = position - layer * per_layer;
    let width = self.tile_width as usize;
    [(rel % width) as u8, (rel / width) as u8, layer as u8, 1]
  }
}

#[cfg(test)]
#[path = "slots_test.rs"]
mod slots_test;
