//! Indexing pass: apply a cut decision to the back state.
//!
//! Binds and releases memory slots, rewrites index entries and builds the new
//! cut set. A tile the cache cannot deliver demotes its action to keep; a
//! tile that vanishes where residency was already established is fatal.

use std::collections::BTreeSet;
use std::time::Duration;

use smallvec::SmallVec;
use tracing::{trace, warn};

use super::decision::CutDecision;
use super::DispatchStats;
use crate::atlas::Atlas;
use crate::config::ROOT_TILE_PRIORITY;
use crate::cut::{ContextId, CutId, CutState};
use crate::error::{CutError, Result};
use crate::quadtree::NodeId;
use crate::slots::{PhysicalLayout, SlotPool, SlotPosition, EMPTY_ENTRY};
use crate::tile_cache::{TileBuffer, TileCache};

/// Result of a split attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SplitOutcome {
	/// Children bound, parent released.
	Committed,
	/// At least one child is not resident yet.
	ChildrenMissing,
	/// The context has fewer than four free slots.
	NoSlots,
}

/// Slot and index bookkeeping for one cut during one dispatch.
pub struct Indexer<'a> {
	pub cut: CutId,
	pub atlas: &'a Atlas,
	pub tile_cache: &'a dyn TileCache,
	pub layout: PhysicalLayout,
	pub pool: &'a mut SlotPool,
}

impl Indexer<'_> {
	fn context(&self) -> ContextId {
		self.cut.context
	}

	/// Bind `node` to a slot and point its index entry at it.
	///
	/// Reuses the slot the node already holds; otherwise takes a free one.
	pub fn add_to_indexed_memory(
		&mut self,
		state: &mut CutState,
		node: NodeId,
		tile: TileBuffer,
	) -> Result<SlotPosition> {
		let context = self.context();
		let position = match state.locked().get(&node) {
			Some(&position) => position,
			None => {
				self
					.pool
					.acquire_free_slot(node, tile)
					.ok_or(CutError::OutOfSlots { context, node })?
					.position
			}
		};
		let slot = self
			.pool
			.slot_mut(position)
			.ok_or(CutError::MissingSlot { cut: self.cut, node })?;
		slot.locked = true;
		slot.updated = false;
		state.locked_mut().insert(node, position);

		if state.set_index_entry(node, self.layout.index_entry(position)) {
			slot.updated = true;
			state.updated_mut().insert(node, position);
		}
		Ok(position)
	}

	/// Unbind `node`: clear its index entry, return its tile and free its slot.
	pub fn remove_from_indexed_memory(&mut self, state: &mut CutState, node: NodeId) -> Result<()> {
		let position = state
			.locked_mut()
			.remove(&node)
			.ok_or(CutError::MissingSlot { cut: self.cut, node })?;
		state.set_index_entry(node, EMPTY_ENTRY);
		self.tile_cache.unget_tile(self.atlas, node, self.context());
		self.pool.release(position);
		state.cleared_mut().insert(node, position);
		Ok(())
	}

	/// Replace the four children of `parent` by `parent`.
	///
	/// Returns false, leaving the children untouched, when the parent tile is
	/// not resident.
	pub fn collapse_to_id(&mut self, state: &mut CutState, parent: NodeId) -> Result<bool> {
		let Some(tile) = self.tile_cache.get_tile(self.atlas, parent, 0.0, self.context()) else {
			return Ok(false);
		};
		let Some(children) = parent.children() else {
			return Ok(false);
		};
		// children first, so the parent always finds a free slot
		for child in children {
			self.remove_from_indexed_memory(state, child)?;
		}
		self.add_to_indexed_memory(state, parent, tile)?;
		Ok(true)
	}

	/// Replace `node` by its four children, all or nothing.
	pub fn split_id(&mut self, state: &mut CutState, node: NodeId, priority: f32) -> Result<SplitOutcome> {
		let context = self.context();
		let Some(children) = node.children() else {
			return Ok(SplitOutcome::ChildrenMissing);
		};

		// request every child so misses are all queued in one dispatch
		let resident: SmallVec<[NodeId; 4]> = children
			.into_iter()
			.filter(|&child| self.tile_cache.get_tile(self.atlas, child, priority, context).is_some())
			.collect();

		let outcome = if resident.len() < children.len() {
			SplitOutcome::ChildrenMissing
		} else if self.pool.available() < children.len() {
			SplitOutcome::NoSlots
		} else {
			SplitOutcome::Committed
		};
		if outcome != SplitOutcome::Committed {
			for child in resident {
				self.tile_cache.unget_tile(self.atlas, child, context);
			}
			return Ok(outcome);
		}

		for child in children {
			let tile = self
				.tile_cache
				.get_tile(self.atlas, child, priority, context)
				.ok_or(CutError::ChildEvicted { cut: self.cut, node: child })?;
			self.add_to_indexed_memory(state, child, tile)?;
		}
		self.remove_from_indexed_memory(state, node)?;
		Ok(SplitOutcome::Committed)
	}

	/// Re-affirm the residency of a node that stays in the cut.
	pub fn keep_id(&mut self, state: &mut CutState, node: NodeId) -> Result<()> {
		let tile = self
			.tile_cache
			.get_tile(self.atlas, node, 0.0, self.context())
			.ok_or(CutError::KeptTileLost { cut: self.cut, node })?;
		self.add_to_indexed_memory(state, node, tile)?;
		Ok(())
	}

	/// Make the root the whole cut of an undrawn cut.
	///
	/// A resident root is bound at once. Otherwise blocks up to `timeout` for
	/// it to arrive, and fails with `RootTileUnavailable` if it never does.
	pub fn bootstrap_root(&mut self, state: &mut CutState, timeout: Duration) -> Result<()> {
		let context = self.context();
		let request = || {
			self
				.tile_cache
				.get_tile(self.atlas, NodeId::ROOT, ROOT_TILE_PRIORITY, context)
		};

		let tile = match request() {
			Some(tile) => tile,
			None => {
				// residency decides, not the result of the wait
				self.tile_cache.wait(timeout);
				request().ok_or_else(|| CutError::RootTileUnavailable {
					atlas: self.atlas.name().to_owned(),
					timeout_ms: timeout.as_millis() as u64,
				})?
			}
		};

		state.reset_deltas();
		state.cut_mut().insert(NodeId::ROOT);
		self.add_to_indexed_memory(state, NodeId::ROOT, tile)?;
		Ok(())
	}

	/// Apply `decision` and replace the cut set with the result.
	///
	/// Collapses run first so their released slots are available to splits.
	/// Failed collapses and splits are folded into `decision.keep`.
	pub fn apply(
		&mut self,
		state: &mut CutState,
		decision: &mut CutDecision,
		stats: &mut DispatchStats,
	) -> Result<()> {
		state.reset_deltas();
		let mut desired = BTreeSet::new();

		for &parent in &decision.collapse_to {
			if self.collapse_to_id(state, parent)? {
				trace!(cut = %self.cut, %parent, "collapsed");
				desired.insert(parent);
				stats.collapses += 1;
			} else if let Some(children) = parent.children() {
				decision.keep.extend(children);
				stats.deferred += 1;
			}
		}

		for (&node, &priority) in &decision.split {
			match self.split_id(state, node, priority)? {
				SplitOutcome::Committed => {
					trace!(cut = %self.cut, %node, priority, "split");
					if let Some(children) = node.children() {
						desired.extend(children);
					}
					stats.splits += 1;
				}
				SplitOutcome::ChildrenMissing => {
					decision.keep.insert(node);
					stats.deferred += 1;
				}
				SplitOutcome::NoSlots => {
					warn!(cut = %self.cut, %node, "no free slots for split, keeping node");
					decision.keep.insert(node);
					stats.deferred += 1;
				}
			}
		}

		for &node in &decision.keep {
			self.keep_id(state, node)?;
			desired.insert(node);
		}
		stats.keeps += decision.keep.len();

		state.replace_cut(desired);
		debug_assert!(state.is_valid_partition(), "cut {} is not a partition", self.cut);
		Ok(())
	}
}

#[cfg(test)]
#[path = "indexing_test.rs"]
mod indexing_test;
