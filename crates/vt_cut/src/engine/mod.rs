//! Cut Update Engine.
//!
//! One dispatch thread per rendering context turns feedback into cut
//! changes:
//!
//! ```text
//! renderer ── feedback() ──▶ FeedbackChannel ── wake ──▶ dispatch thread
//!                                                          │
//!                        ┌─────────────────────────────────┘
//!                        ▼
//!              decision pass (per cut, under the feedback lock)
//!                        │  collapse_to / split queue / keep
//!                        ▼
//!              split budget: min(throughput, free slots / 4)
//!                        │
//!                        ▼
//!              indexing pass (per cut, under the cut write lock)
//!                        │  bind / release slots, rewrite index
//!                        ▼
//!              publish back state to front
//! ```
//!
//! Contexts dispatch in parallel and never share slots. A fatal error stops
//! the thread of its context and is reported by [`CutUpdate::stop`] and
//! [`CutUpdate::fatal_error`].

pub mod decision;
mod dispatch;
pub mod indexing;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{error, info};

pub use dispatch::Dispatcher;

use crate::cut::ContextId;
use crate::error::{CutError, Result};
use crate::feedback::FeedbackChannel;
use crate::metrics::DispatchMetrics;
use crate::registry::CutRegistry;
use crate::slots::SlotPosition;

/// Statistics of one dispatch of one context.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchStats {
	/// Cuts indexed (bootstraps included).
	pub cuts: usize,
	/// Root bootstraps performed.
	pub bootstraps: usize,
	/// Split candidates found by the decision pass.
	pub candidates: usize,
	/// Splits the budget allowed.
	pub budget: usize,
	/// Splits committed.
	pub splits: usize,
	/// Collapses committed.
	pub collapses: usize,
	/// Nodes kept, demotions and deferrals included.
	pub keeps: usize,
	/// Candidates demoted to keep by the budget.
	pub demoted: usize,
	/// Collapses and splits deferred because a tile or slot was missing.
	pub deferred: usize,
	/// The dispatch ran while frozen.
	pub frozen: bool,
	/// Wall time in microseconds.
	pub dispatch_us: u64,
}

/// State shared by the engine handle, its threads and synchronous dispatchers.
pub(crate) struct EngineShared {
	registry: Arc<CutRegistry>,
	channels: BTreeMap<ContextId, Arc<FeedbackChannel>>,
	freeze: AtomicBool,
	should_stop: AtomicBool,
	running: AtomicBool,
	/// Last dispatch duration in milliseconds, as `f32` bits.
	dispatch_time_bits: AtomicU32,
	metrics: Mutex<DispatchMetrics>,
	/// Splits per dispatch the upload throughput allows.
	throughput_budget: usize,
}

impl EngineShared {
	fn channel(&self, context: ContextId) -> Result<&Arc<FeedbackChannel>> {
		self
			.channels
			.get(&context)
			.ok_or(CutError::UnknownContext(context))
	}

	fn is_frozen(&self) -> bool {
		self.freeze.load(Ordering::Acquire)
	}

	fn is_running(&self) -> bool {
		self.running.load(Ordering::Acquire)
	}

	fn record_dispatch(&self, stats: &DispatchStats, elapsed: Duration) {
		let ms = elapsed.as_secs_f32() * 1000.0;
		self.dispatch_time_bits.store(ms.to_bits(), Ordering::Release);
		self
			.metrics
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.record(stats);
	}
}

/// Cut update engine handle.
///
/// Dropping the handle stops and joins every dispatch thread.
pub struct CutUpdate {
	shared: Arc<EngineShared>,
	workers: Vec<(ContextId, JoinHandle<()>)>,
}

impl CutUpdate {
	/// Create an engine over `registry` with one feedback channel per context.
	pub fn new(registry: Arc<CutRegistry>) -> Self {
		let channels = registry
			.contexts()
			.map(|ctx| (ctx, Arc::new(FeedbackChannel::new(ctx))))
			.collect();
		let throughput_budget = registry.config().throughput_split_budget();
		Self {
			shared: Arc::new(EngineShared {
				registry,
				channels,
				freeze: AtomicBool::new(false),
				should_stop: AtomicBool::new(false),
				running: AtomicBool::new(false),
				dispatch_time_bits: AtomicU32::new(0),
				metrics: Mutex::new(DispatchMetrics::default()),
				throughput_budget,
			}),
			workers: Vec::new(),
		}
	}

	pub fn registry(&self) -> &Arc<CutRegistry> {
		&self.shared.registry
	}

	/// Warm the tile cache and spawn one dispatch thread per context.
	pub fn start(&mut self) -> Result<()> {
		if self.shared.is_running() {
			return Err(CutError::AlreadyRunning);
		}
		let shared = Arc::clone(&self.shared);
		shared.should_stop.store(false, Ordering::Release);
		shared.running.store(true, Ordering::Release);
		shared.registry.warm_up_cache();

		for (&context, channel) in &shared.channels {
			channel.reopen();
			let dispatcher = Dispatcher::new(context, Arc::clone(&shared), Arc::clone(channel), false);
			let spawned = thread::Builder::new()
				.name(format!("cut-update-{}", context.0))
				.spawn(move || run(dispatcher));
			match spawned {
				Ok(handle) => self.workers.push((context, handle)),
				Err(err) => {
					let _ = self.stop();
					return Err(CutError::Spawn {
						context,
						reason: err.to_string(),
					});
				}
			}
		}

		info!(contexts = self.workers.len(), "cut update started");
		Ok(())
	}

	/// Stop and join every dispatch thread.
	///
	/// Returns the first fatal error any context reported.
	pub fn stop(&mut self) -> Result<()> {
		self.shared.should_stop.store(true, Ordering::Release);
		for channel in self.shared.channels.values() {
			channel.shutdown();
		}

		let mut first_error = None;
		let stopped = self.workers.len();
		for (context, handle) in self.workers.drain(..) {
			if handle.join().is_err() {
				error!(%context, "dispatch thread panicked");
				first_error.get_or_insert(CutError::WorkerPanicked(context));
			}
		}
		self.shared.running.store(false, Ordering::Release);
		if stopped > 0 {
			info!(contexts = stopped, "cut update stopped");
		}

		let fatal = self
			.shared
			.channels
			.values()
			.find_map(|channel| channel.fatal_error());
		match first_error.or(fatal) {
			Some(err) => Err(err),
			None => Ok(()),
		}
	}

	pub fn is_running(&self) -> bool {
		self.shared.is_running()
	}

	/// Hand a feedback snapshot to a context.
	///
	/// Returns false when the snapshot was dropped: a previous one is still
	/// pending, the dispatch thread is reading it, the engine is stopping or
	/// the context is unknown.
	pub fn feedback(&self, context: ContextId, lod: &[i32], count: Option<&[u32]>) -> bool {
		self
			.shared
			.channel(context)
			.is_ok_and(|channel| channel.submit_feedback(lod, count))
	}

	pub fn can_accept_feedback(&self, context: ContextId) -> bool {
		self
			.shared
			.channel(context)
			.is_ok_and(|channel| channel.can_accept_feedback())
	}

	/// Pause or resume structural changes. Returns the new state.
	pub fn toggle_freeze_dispatch(&self) -> bool {
		let frozen = !self.shared.freeze.fetch_xor(true, Ordering::AcqRel);
		info!(frozen, "dispatch freeze toggled");
		frozen
	}

	pub fn is_dispatch_frozen(&self) -> bool {
		self.shared.is_frozen()
	}

	/// Duration of the last dispatch of any context, in milliseconds.
	pub fn get_dispatch_time(&self) -> f32 {
		f32::from_bits(self.shared.dispatch_time_bits.load(Ordering::Acquire))
	}

	/// Snapshot of the engine-wide dispatch metrics.
	pub fn metrics(&self) -> DispatchMetrics {
		self
			.shared
			.metrics
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.clone()
	}

	/// Fatal error that stopped a context, if any.
	pub fn fatal_error(&self, context: ContextId) -> Option<CutError> {
		self.shared.channel(context).ok()?.fatal_error()
	}

	pub fn last_dispatch_stats(&self, context: ContextId) -> Option<DispatchStats> {
		self.shared.channel(context).ok()?.last_dispatch_stats()
	}

	/// Slot positions currently locked by the cuts of a context.
	pub fn allocated_slots(&self, context: ContextId) -> Vec<SlotPosition> {
		self
			.shared
			.channel(context)
			.map(|channel| channel.allocated_slots())
			.unwrap_or_default()
	}

	/// Dispatcher driving `context` from the calling thread.
	///
	/// Refused while the engine's own threads are running.
	pub fn dispatcher(&self, context: ContextId) -> Result<Dispatcher> {
		if self.shared.is_running() {
			return Err(CutError::AlreadyRunning);
		}
		let channel = Arc::clone(self.shared.channel(context)?);
		Ok(Dispatcher::new(context, Arc::clone(&self.shared), channel, true))
	}
}

impl Drop for CutUpdate {
	fn drop(&mut self) {
		if !self.workers.is_empty() {
			let _ = self.stop();
		}
	}
}

/// Feedback loop of one context.
fn run(mut dispatcher: Dispatcher) {
	let context = dispatcher.context();
	let shared = Arc::clone(dispatcher.shared());
	let channel = Arc::clone(dispatcher.channel());
	let timeout = shared.registry.config().feedback_timeout();
	info!(%context, "dispatch thread started");

	while !shared.should_stop.load(Ordering::Acquire) {
		if channel.has_new_feedback() {
			if let Err(err) = dispatcher.dispatch() {
				error!(%context, %err, "dispatch failed, stopping context");
				channel.set_fatal(err);
				channel.shutdown();
				break;
			}
		}
		channel.wait_for_wake(timeout);
	}

	info!(%context, "dispatch thread exiting");
}

#[cfg(test)]
#[path = "engine_test.rs"]
mod engine_test;
