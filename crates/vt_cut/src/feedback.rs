//! Feedback Channel - hand-off of GPU feedback from a renderer to the
//! dispatch thread of its context.
//!
//! # Flow
//!
//! ```text
//! Renderer thread                   Dispatch thread (one per context)
//! ┌──────────────────┐
//! │ submit_feedback()│  claim flag and copy under try_lock
//! └────────┬─────────┘
//!          │ wake (bounded(1) channel)
//!          ▼
//!                                   ┌────────────────────┐
//!                                   │ wait_for_wake()    │ recv_timeout
//!                                   │ consume_feedback() │ decision pass
//!                                   └────────────────────┘
//! ```
//!
//! At most one snapshot is pending: a submit while the previous one is still
//! unconsumed, or while the dispatch thread is reading it, is dropped.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::Duration;

use crossbeam_channel::{self as channel, Receiver, RecvTimeoutError, Sender};

use crate::cut::{ContextId, SlotMap};
use crate::engine::DispatchStats;
use crate::error::CutError;
use crate::slots::SlotPosition;

/// Latest feedback snapshot of one context.
#[derive(Debug, Default)]
pub struct FeedbackBuffers {
	/// Desired depth per compact slot position.
	pub lod: Vec<i32>,
	/// Optional usage count per compact slot position; empty when not reported.
	pub count: Vec<u32>,
}

impl FeedbackBuffers {
	/// Desired depth reported for a slot. Positions outside the buffer
	/// report no demand.
	#[inline]
	pub fn desired_depth(&self, position: SlotPosition) -> i32 {
		self.lod.get(compact_position(position)).copied().unwrap_or(0)
	}
}

/// Feedback index of a slot position.
///
/// Slots are laid out densely, so the mapping is the identity.
#[inline]
pub fn compact_position(position: SlotPosition) -> usize {
	position
}

/// Per-context feedback hand-off and dispatch status.
pub struct FeedbackChannel {
	context: ContextId,
	buffers: Mutex<FeedbackBuffers>,
	feedback_new: AtomicBool,
	shutting_down: AtomicBool,
	wake_tx: Sender<()>,
	wake_rx: Receiver<()>,
	/// Slot positions locked by any cut of this context.
	allocated_slots: Mutex<BTreeSet<SlotPosition>>,
	fatal: Mutex<Option<CutError>>,
	last_stats: Mutex<Option<DispatchStats>>,
}

impl FeedbackChannel {
	pub fn new(context: ContextId) -> Self {
		let (wake_tx, wake_rx) = channel::bounded(1);
		Self {
			context,
			buffers: Mutex::new(FeedbackBuffers::default()),
			feedback_new: AtomicBool::new(false),
			shutting_down: AtomicBool::new(false),
			wake_tx,
			wake_rx,
			allocated_slots: Mutex::new(BTreeSet::new()),
			fatal: Mutex::new(None),
			last_stats: Mutex::new(None),
		}
	}

	pub fn context(&self) -> ContextId {
		self.context
	}

	/// True when no snapshot is pending and the channel is not shutting down.
	pub fn can_accept_feedback(&self) -> bool {
		!self.feedback_new.load(Ordering::Acquire) && !self.shutting_down.load(Ordering::Acquire)
	}

	/// Copy a feedback snapshot in and wake the dispatch thread.
	///
	/// Returns false when the snapshot was dropped.
	pub fn submit_feedback(&self, lod: &[i32], count: Option<&[u32]>) -> bool {
		if !self.can_accept_feedback() {
			return false;
		}
		let mut buffers = match self.buffers.try_lock() {
			Ok(guard) => guard,
			Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
			Err(TryLockError::WouldBlock) => return false,
		};
		// another submitter may have won between the check and the lock
		if self.shutting_down.load(Ordering::Acquire)
			|| self
				.feedback_new
				.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
				.is_err()
		{
			return false;
		}

		buffers.lod.clear();
		buffers.lod.extend_from_slice(lod);
		buffers.count.clear();
		if let Some(count) = count {
			buffers.count.extend_from_slice(count);
		}
		drop(buffers);

		// a full channel already holds a pending wake
		let _ = self.wake_tx.try_send(());
		true
	}

	/// Block until woken or `timeout` elapses.
	///
	/// Returns true when a wake signal was received.
	pub fn wait_for_wake(&self, timeout: Duration) -> bool {
		match self.wake_rx.recv_timeout(timeout) {
			Ok(()) => true,
			Err(RecvTimeoutError::Timeout) => false,
			// the channel owns both ends, so this cannot happen while self lives
			Err(RecvTimeoutError::Disconnected) => false,
		}
	}

	pub fn has_new_feedback(&self) -> bool {
		self.feedback_new.load(Ordering::Acquire)
	}

	/// Lock the snapshot for reading without consuming it; submits are
	/// dropped meanwhile.
	pub fn lock_feedback(&self) -> MutexGuard<'_, FeedbackBuffers> {
		self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// Lock the pending snapshot for reading and mark it consumed.
	///
	/// Submits are dropped while the guard is held. The first submit after it
	/// is released becomes the next pending snapshot.
	pub fn consume_feedback(&self) -> MutexGuard<'_, FeedbackBuffers> {
		let buffers = self.lock_feedback();
		self.feedback_new.store(false, Ordering::Release);
		buffers
	}

	/// Refuse further feedback and wake the dispatch thread.
	pub fn shutdown(&self) {
		self.shutting_down.store(true, Ordering::Release);
		let _ = self.wake_tx.try_send(());
	}

	pub fn is_shutting_down(&self) -> bool {
		self.shutting_down.load(Ordering::Acquire)
	}

	/// Allow feedback again after a stop.
	pub(crate) fn reopen(&self) {
		self.shutting_down.store(false, Ordering::Release);
		self.feedback_new.store(false, Ordering::Release);
		while self.wake_rx.try_recv().is_ok() {}
	}

	/// Slot positions locked by any cut of this context, ascending.
	pub fn allocated_slots(&self) -> Vec<SlotPosition> {
		self
			.allocated_slots
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.iter()
			.copied()
			.collect()
	}

	/// Apply one cut's indexing result to the allocated-slot index.
	pub(crate) fn update_allocated(&self, locked: &SlotMap, cleared: &SlotMap) {
		let mut allocated = self.allocated_slots.lock().unwrap_or_else(PoisonError::into_inner);
		for position in cleared.values() {
			allocated.remove(position);
		}
		allocated.extend(locked.values().copied());
	}

	/// Fatal error that stopped this context, if any.
	pub fn fatal_error(&self) -> Option<CutError> {
		self.fatal.lock().unwrap_or_else(PoisonError::into_inner).clone()
	}

	pub(crate) fn set_fatal(&self, error: CutError) {
		let mut fatal = self.fatal.lock().unwrap_or_else(PoisonError::into_inner);
		// keep the first error
		fatal.get_or_insert(error);
	}

	/// Statistics of the last completed dispatch.
	pub fn last_dispatch_stats(&self) -> Option<DispatchStats> {
		*self.last_stats.lock().unwrap_or_else(PoisonError::into_inner)
	}

	pub(crate) fn set_last_stats(&self, stats: DispatchStats) {
		*self.last_stats.lock().unwrap_or_else(PoisonError::into_inner) = Some(stats);
	}
}

#[cfg(test)]
#[path = "feedback_test.rs"]
mod feedback_test;
