//! Dispatcher - one context's dispatch: decision pass, split budget,
//! indexing pass and publication.

use std::collections::{BTreeMap, BinaryHeap};
use std::sync::Arc;

use tracing::{debug, info};
use web_time::Instant;

use super::decision::{decide_cut, grant_splits, CutDecision, SplitBudget, SplitCandidate};
use super::indexing::Indexer;
use super::{DispatchStats, EngineShared};
use crate::cut::{ContextId, CutId};
use crate::error::{CutError, Result};
use crate::feedback::FeedbackChannel;

/// Runs dispatches for a single context.
///
/// Owned by the context's thread while the engine runs. Decision sets and
/// the split queue are reused across dispatches.
pub struct Dispatcher {
	context: ContextId,
	shared: Arc<EngineShared>,
	channel: Arc<FeedbackChannel>,
	decisions: BTreeMap<CutId, CutDecision>,
	queue: BinaryHeap<SplitCandidate>,
	/// Driven by a caller thread rather than an engine thread.
	synchronous: bool,
}

impl Dispatcher {
	pub(crate) fn new(
		context: ContextId,
		shared: Arc<EngineShared>,
		channel: Arc<FeedbackChannel>,
		synchronous: bool,
	) -> Self {
		Self {
			context,
			shared,
			channel,
			decisions: BTreeMap::new(),
			queue: BinaryHeap::new(),
			synchronous,
		}
	}

	pub fn context(&self) -> ContextId {
		self.context
	}

	pub(crate) fn shared(&self) -> &Arc<EngineShared> {
		&self.shared
	}

	pub(crate) fn channel(&self) -> &Arc<FeedbackChannel> {
		&self.channel
	}

	/// Decision of a cut from the last dispatch.
	pub fn decision(&self, cut: CutId) -> Option<&CutDecision> {
		self.decisions.get(&cut)
	}

	/// Run one dispatch over every cut of the context.
	///
	/// Consumes the pending feedback snapshot, if any. Errors are fatal for
	/// the context.
	#[tracing::instrument(skip_all, name = "cut_update::dispatch", fields(context = %self.context))]
	pub fn dispatch(&mut self) -> Result<DispatchStats> {
		if self.synchronous && self.shared.is_running() {
			return Err(CutError::AlreadyRunning);
		}

		let start = Instant::now();
		let mut stats = DispatchStats::default();
		let result = if self.shared.is_frozen() {
			self.dispatch_frozen(&mut stats)
		} else {
			self
				.decision_pass(&mut stats)
				.and_then(|()| self.indexing_pass(&mut stats))
		};
		result?;

		let elapsed = start.elapsed();
		stats.dispatch_us = elapsed.as_micros() as u64;
		self.shared.record_dispatch(&stats, elapsed);
		self.channel.set_last_stats(stats);

		debug!(
			splits = stats.splits,
			collapses = stats.collapses,
			keeps = stats.keeps,
			candidates = stats.candidates,
			budget = stats.budget,
			demoted = stats.demoted,
			deferred = stats.deferred,
			dispatch_us = stats.dispatch_us,
			"dispatch complete"
		);
		Ok(stats)
	}

	/// Frozen dispatch: drop the pending feedback, forget the updated delta
	/// and republish, nothing else.
	fn dispatch_frozen(&mut self, stats: &mut DispatchStats) -> Result<()> {
		stats.frozen = true;
		drop(self.channel.consume_feedback());
		for cut in self.shared.registry.cuts_for_context(self.context) {
			let mut writer = cut.start_writing();
			writer.updated_mut().clear();
			writer.publish();
		}
		Ok(())
	}

	/// Classify every drawn cut against the feedback and grant splits.
	fn decision_pass(&mut self, stats: &mut DispatchStats) -> Result<()> {
		let _span = tracing::info_span!("decision_pass").entered();
		let registry = &self.shared.registry;

		let budget = SplitBudget {
			throughput: self.shared.throughput_budget,
			available_slots: registry.available_memory(self.context)?,
		};

		// submits are dropped while the snapshot is read
		let feedback = self.channel.consume_feedback();
		self.queue.clear();
		for cut in registry.cuts_for_context(self.context) {
			let decision = self.decisions.entry(cut.id()).or_default();
			decision.clear();
			if !cut.is_drawn() {
				continue;
			}
			let state = cut.start_writing();
			decide_cut(cut.id(), cut.atlas(), &state, &feedback, decision, &mut self.queue)?;
		}
		drop(feedback);

		stats.candidates = self.queue.len();
		stats.budget = budget.allowed();
		stats.demoted = grant_splits(&mut self.queue, stats.budget, &mut self.decisions);
		if stats.demoted > 0 {
			debug!(
				demoted = stats.demoted,
				budget = stats.budget,
				available_slots = budget.available_slots,
				"split candidates over budget"
			);
		}
		Ok(())
	}

	/// Apply the decisions, bootstrap undrawn cuts and publish every cut.
	fn indexing_pass(&mut self, stats: &mut DispatchStats) -> Result<()> {
		let _span = tracing::info_span!("indexing_pass").entered();
		let registry = &self.shared.registry;
		let root_timeout = registry.config().root_tile_timeout();

		for cut in registry.cuts_for_context(self.context) {
			let mut writer = cut.start_writing();
			let mut pool = registry.lock_slots(self.context)?;
			let mut indexer = Indexer {
				cut: cut.id(),
				atlas: cut.atlas(),
				tile_cache: registry.tile_cache().as_ref(),
				layout: registry.layout(),
				pool: &mut pool,
			};

			if cut.is_drawn() {
				let decision = self.decisions.entry(cut.id()).or_default();
				indexer.apply(&mut writer, decision, stats)?;
			} else {
				indexer.bootstrap_root(&mut writer, root_timeout)?;
				writer.set_drawn();
				stats.bootstraps += 1;
				info!(cut = %cut.id(), atlas = cut.atlas().name(), "root tile bound");
			}
			drop(pool);

			writer.publish();
			self.channel.update_allocated(writer.locked(), writer.cleared());
			stats.cuts += 1;
		}
		Ok(())
	}
}
