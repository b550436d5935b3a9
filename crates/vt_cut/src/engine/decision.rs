//! Decision pass: classify every node of a cut as collapse, split candidate
//! or keep, then grant splits to the highest-priority candidates within the
//! dispatch budget.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};

use tracing::trace;

use crate::atlas::Atlas;
use crate::cut::{CutId, CutState};
use crate::error::{CutError, Result};
use crate::feedback::FeedbackBuffers;
use crate::quadtree::NodeId;

/// Split limits of one dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SplitBudget {
	/// Splits the upload throughput allows.
	pub throughput: usize,
	/// Free slots of the context when the dispatch started.
	pub available_slots: usize,
}

impl SplitBudget {
	/// Splits granted this dispatch. Every split binds four children.
	#[inline]
	pub fn allowed(&self) -> usize {
		self.throughput.min(self.available_slots / 4)
	}
}

/// Transient action sets of one cut for one dispatch.
///
/// The three sets are disjoint: `collapse_to` holds parents, the others hold
/// nodes of the current cut.
#[derive(Clone, Debug, Default)]
pub struct CutDecision {
	/// Parents whose four children collapse into them.
	pub collapse_to: BTreeSet<NodeId>,
	/// Nodes to split, with their priority.
	pub split: BTreeMap<NodeId, f32>,
	/// Nodes that stay in the cut.
	pub keep: BTreeSet<NodeId>,
}

impl CutDecision {
	pub fn clear(&mut self) {
		self.collapse_to.clear();
		self.split.clear();
		self.keep.clear();
	}

	pub fn is_empty(&self) -> bool {
		self.collapse_to.is_empty() && self.split.is_empty() && self.keep.is_empty()
	}
}

/// Entry of the split queue.
///
/// Max-heap order on priority; equal priorities pop in ascending
/// (cut, node) order.
#[derive(Clone, Copy, Debug)]
pub struct SplitCandidate {
	pub priority: f32,
	pub cut: CutId,
	pub node: NodeId,
}

impl PartialEq for SplitCandidate {
	fn eq(&self, other: &Self) -> bool {
		self.cmp(other) == Ordering::Equal
	}
}

impl Eq for SplitCandidate {}

impl PartialOrd for SplitCandidate {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for SplitCandidate {
	fn cmp(&self, other: &Self) -> Ordering {
		self
			.priority
			.total_cmp(&other.priority)
			.then_with(|| (other.cut, other.node).cmp(&(self.cut, self.node)))
	}
}

/// Desired depth reported for the slot of `node`.
fn desired_depth(cut: CutId, state: &CutState, feedback: &FeedbackBuffers, node: NodeId) -> Result<i32> {
	let position = state
		.locked()
		.get(&node)
		.ok_or(CutError::MissingSlot { cut, node })?;
	Ok(feedback.desired_depth(*position))
}

/// Check if all four siblings of `node` are in the cut.
fn all_siblings_in_cut(node: NodeId, cut: &BTreeSet<NodeId>) -> bool {
	node
		.siblings()
		.is_some_and(|siblings| siblings.iter().all(|s| cut.contains(s)))
}

/// Classify the nodes of one cut.
///
/// Collapses and keeps go straight into `decision`; split candidates are
/// pushed onto `queue` to compete with the other cuts of the context.
pub fn decide_cut(
	cut: CutId,
	atlas: &Atlas,
	state: &CutState,
	feedback: &FeedbackBuffers,
	decision: &mut CutDecision,
	queue: &mut BinaryHeap<SplitCandidate>,
) -> Result<()> {
	let max_depth = atlas.max_depth();
	let mut nodes = state.cut().iter().copied();

	while let Some(node) = nodes.next() {
		let depth = node.depth();

		// siblings are consecutive ids, so the first one leads the group
		if node.sibling_index() == 0 && all_siblings_in_cut(node, state.cut()) {
			let mut collapse = true;
			if let Some(siblings) = node.siblings() {
				for sibling in siblings {
					if desired_depth(cut, state, feedback, sibling)? >= depth as i32 {
						collapse = false;
						break;
					}
				}
			}
			if collapse {
				if let Some(parent) = node.parent() {
					trace!(%cut, %parent, "collapse");
					decision.collapse_to.insert(parent);
					nodes.nth(2);
					continue;
				}
			}
		}

		let desired = desired_depth(cut, state, feedback, node)?;
		if desired > depth as i32 && depth < max_depth {
			let priority = (desired - depth as i32) as f32 * atlas.perceptual_weight(node);
			queue.push(SplitCandidate {
				priority,
				cut,
				node,
			});
		} else {
			decision.keep.insert(node);
		}
	}
	Ok(())
}

/// Drain the split queue: the first `allowed` candidates split, the rest
/// are kept.
///
/// Returns the number of candidates demoted to keep.
pub fn grant_splits(
	queue: &mut BinaryHeap<SplitCandidate>,
	allowed: usize,
	decisions: &mut BTreeMap<CutId, CutDecision>,
) -> usize {
	let mut granted = 0;
	let mut demoted = 0;
	while let Some(candidate) = queue.pop() {
		let decision = decisions.entry(candidate.cut).or_default();
		if granted < allowed {
			decision.split.insert(candidate.node, candidate.priority);
			granted += 1;
		} else {
			decision.keep.insert(candidate.node);
			demoted += 1;
		}
	}
	demoted
}

#[cfg(test)]
#[path = "decision_test.rs"]
mod decision_test;
