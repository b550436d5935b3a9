use std::sync::atomic::AtomicBool;
use std::thread;

use super::*;
use crate::atlas::Atlas;
use crate::cut::CutId;
use crate::quadtree::NodeId;
use crate::registry::CutRegistryBuilder;
use crate::slots::EMPTY_ENTRY;
use crate::test_utils::{feedback_for, test_config, wait_until, TestEngine, CTX};
use crate::tile_cache::{LoadMode, MemoryTileCache};

const FIRST_LEVEL: [u64; 4] = [1, 2, 3, 4];

/// Bootstrap the root, then split it with uniform demand for depth 2.
fn split_root(t: &TestEngine, dispatcher: &mut Dispatcher) {
	dispatcher.dispatch().unwrap();
	assert!(t.submit(|_| 2));
	let stats = dispatcher.dispatch().unwrap();
	assert_eq!(stats.splits, 1);
	assert_eq!(t.cut_ids(), FIRST_LEVEL);
}

fn occupied(t: &TestEngine) -> usize {
	t.registry().lock_slots(CTX).unwrap().occupied()
}

// =============================================================================
// Synchronous dispatch
// =============================================================================

#[test]
fn test_first_dispatch_bootstraps_root() {
	let t = TestEngine::roomy(3);
	let mut dispatcher = t.engine.dispatcher(CTX).unwrap();
	let cut = t.registry().cut(t.cut).unwrap();
	assert!(!cut.is_drawn());

	let stats = dispatcher.dispatch().unwrap();
	assert_eq!(stats.bootstraps, 1);
	assert_eq!(stats.cuts, 1);
	assert!(cut.is_drawn());
	assert_eq!(cut.generation(), 1);

	let front = t.front();
	assert_eq!(t.cut_ids(), [0]);
	assert_eq!(front.index_entry(NodeId::ROOT), Some([0, 0, 0, 1]));
	assert_eq!(t.engine.allocated_slots(CTX), vec![0]);
	assert_eq!(t.engine.last_dispatch_stats(CTX), Some(stats));
}

#[test]
fn test_root_splits_into_first_level() {
	let t = TestEngine::roomy(3);
	let mut dispatcher = t.engine.dispatcher(CTX).unwrap();
	split_root(&t, &mut dispatcher);

	let front = t.front();
	assert_eq!(front.index_entry(NodeId::ROOT), Some(EMPTY_ENTRY));
	for child in NodeId::ROOT.children().unwrap() {
		assert!(front.index_entry(child).is_some_and(|entry| entry[3] == 1));
		assert!(front.updated().contains_key(&child));
	}
	assert!(front.cleared().contains_key(&NodeId::ROOT));
	assert_eq!(occupied(&t), 4);
	assert_eq!(t.engine.allocated_slots(CTX).len(), 4);
	assert!(front.is_valid_partition() && front.covers_atlas() && front.is_fully_bound());
}

#[test]
fn test_split_waits_for_throughput_budget() {
	let t = TestEngine::new(3, test_config(8, 0), LoadMode::Immediate);
	let mut dispatcher = t.engine.dispatcher(CTX).unwrap();
	dispatcher.dispatch().unwrap();

	t.submit(|_| 2);
	let stats = dispatcher.dispatch().unwrap();
	assert_eq!(stats.budget, 0);
	assert_eq!(stats.candidates, 1);
	assert_eq!(stats.demoted, 1);
	assert_eq!(stats.splits, 0);
	assert_eq!(t.cut_ids(), [0]);
	let decision = dispatcher.decision(t.cut).unwrap();
	assert!(decision.split.is_empty());
	assert!(decision.keep.contains(&NodeId::ROOT));
}

#[test]
fn test_split_waits_for_free_slots() {
	// four slots, one held by the root: three free is less than one split
	let t = TestEngine::new(3, test_config(2, 8), LoadMode::Immediate);
	let mut dispatcher = t.engine.dispatcher(CTX).unwrap();
	dispatcher.dispatch().unwrap();

	t.submit(|_| 2);
	let stats = dispatcher.dispatch().unwrap();
	assert_eq!(stats.budget, 0);
	assert_eq!(t.cut_ids(), [0]);
}

#[test]
fn test_feedback_without_increase_yields_no_split() {
	let t = TestEngine::roomy(4);
	let mut dispatcher = t.engine.dispatcher(CTX).unwrap();
	split_root(&t, &mut dispatcher);

	t.submit(|node| node.depth() as i32);
	let stats = dispatcher.dispatch().unwrap();
	let decision = dispatcher.decision(t.cut).unwrap();
	assert!(decision.split.is_empty());
	assert!(decision.collapse_to.is_empty());
	assert_eq!(stats.candidates, 0);
	assert_eq!(t.cut_ids(), FIRST_LEVEL);
	// re-affirmed bindings are not updates
	assert!(t.front().updated().is_empty());
}

#[test]
fn test_siblings_collapse_and_slots_are_reused() {
	let t = TestEngine::roomy(3);
	let mut dispatcher = t.engine.dispatcher(CTX).unwrap();
	split_root(&t, &mut dispatcher);

	t.submit(|_| 0);
	let stats = dispatcher.dispatch().unwrap();
	assert_eq!(stats.collapses, 1);
	assert_eq!(t.cut_ids(), [0]);
	assert_eq!(occupied(&t), 1);

	let front = t.front();
	assert_eq!(front.cleared().len(), 4);
	let root_slot = front.locked()[&NodeId::ROOT];
	assert_eq!(t.engine.allocated_slots(CTX), vec![root_slot]);

	// released slots serve the next split
	t.submit(|_| 2);
	dispatcher.dispatch().unwrap();
	assert_eq!(t.cut_ids(), FIRST_LEVEL);
	assert_eq!(occupied(&t), 4);
}

#[test]
fn test_splits_are_capped_by_budget() {
	let t = TestEngine::new(4, test_config(8, 2), LoadMode::Immediate);
	let mut dispatcher = t.engine.dispatcher(CTX).unwrap();
	split_root(&t, &mut dispatcher);

	t.submit(|_| 3);
	let stats = dispatcher.dispatch().unwrap();
	assert_eq!(stats.candidates, 4);
	assert_eq!(stats.budget, 2);
	assert_eq!(stats.splits, 2);
	assert_eq!(stats.demoted, 2);
	// equal priorities: lowest ids split first
	assert_eq!(t.cut_ids(), [3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);
	assert!(t.front().is_valid_partition());
}

#[test]
fn test_split_with_missing_child_is_all_or_nothing() {
	let t = TestEngine::roomy(3);
	let mut dispatcher = t.engine.dispatcher(CTX).unwrap();
	dispatcher.dispatch().unwrap();
	t.cache.withhold(t.atlas, NodeId(3));

	t.submit(|_| 2);
	let stats = dispatcher.dispatch().unwrap();
	assert_eq!(stats.splits, 0);
	assert_eq!(stats.deferred, 1);
	assert_eq!(t.cut_ids(), [0]);
	assert_eq!(occupied(&t), 1);

	t.cache.release_withheld(t.atlas, NodeId(3));
	t.submit(|_| 2);
	dispatcher.dispatch().unwrap();
	assert_eq!(t.cut_ids(), FIRST_LEVEL);
}

#[test]
fn test_collapse_miss_keeps_children() {
	let t = TestEngine::roomy(3);
	let mut dispatcher = t.engine.dispatcher(CTX).unwrap();
	split_root(&t, &mut dispatcher);
	t.cache.evict(t.atlas, NodeId::ROOT);
	t.cache.withhold(t.atlas, NodeId::ROOT);

	t.submit(|_| 0);
	let stats = dispatcher.dispatch().unwrap();
	assert_eq!(stats.collapses, 0);
	assert_eq!(stats.deferred, 1);
	assert_eq!(t.cut_ids(), FIRST_LEVEL);
	assert_eq!(occupied(&t), 4);
}

#[test]
fn test_lost_kept_tile_is_fatal() {
	let t = TestEngine::roomy(3);
	let mut dispatcher = t.engine.dispatcher(CTX).unwrap();
	split_root(&t, &mut dispatcher);
	t.cache.evict(t.atlas, NodeId(2));
	t.cache.withhold(t.atlas, NodeId(2));

	t.submit(|node| node.depth() as i32);
	let err = dispatcher.dispatch().unwrap_err();
	assert_eq!(
		err,
		CutError::KeptTileLost {
			cut: t.cut,
			node: NodeId(2)
		}
	);
}

#[test]
fn test_frozen_dispatch_only_clears_updates() {
	let t = TestEngine::roomy(3);
	let mut dispatcher = t.engine.dispatcher(CTX).unwrap();
	split_root(&t, &mut dispatcher);
	assert!(!t.front().updated().is_empty());

	assert!(t.engine.toggle_freeze_dispatch());
	assert!(t.engine.is_dispatch_frozen());
	t.submit(|_| 0);
	let stats = dispatcher.dispatch().unwrap();
	assert!(stats.frozen);
	assert_eq!(t.cut_ids(), FIRST_LEVEL);
	assert!(t.front().updated().is_empty());
	assert!(t.engine.can_accept_feedback(CTX), "frozen dispatch consumes feedback");

	assert!(!t.engine.toggle_freeze_dispatch());
	t.submit(|_| 0);
	dispatcher.dispatch().unwrap();
	assert_eq!(t.cut_ids(), [0]);
}

#[test]
fn test_unavailable_root_is_fatal() {
	let t = TestEngine::new(3, test_config(8, 8), LoadMode::Deferred);
	let mut dispatcher = t.engine.dispatcher(CTX).unwrap();

	let err = dispatcher.dispatch().unwrap_err();
	assert!(matches!(err, CutError::RootTileUnavailable { timeout_ms: 50, .. }));
	assert!(!t.registry().cut(t.cut).unwrap().is_drawn());
	assert!(t.cut_ids().is_empty());
}

#[test]
fn test_second_feedback_before_dispatch_is_dropped() {
	let t = TestEngine::roomy(3);
	let mut dispatcher = t.engine.dispatcher(CTX).unwrap();

	assert!(t.engine.can_accept_feedback(CTX));
	assert!(t.engine.feedback(CTX, &t.uniform_feedback(1), None));
	assert!(!t.engine.can_accept_feedback(CTX));
	assert!(!t.engine.feedback(CTX, &t.uniform_feedback(2), None));

	dispatcher.dispatch().unwrap();
	assert!(t.engine.can_accept_feedback(CTX));
}

#[test]
fn test_unknown_context_is_rejected() {
	let t = TestEngine::roomy(3);
	let other = ContextId(9);
	assert_eq!(t.engine.dispatcher(other).err(), Some(CutError::UnknownContext(other)));
	assert!(!t.engine.feedback(other, &[1], None));
	assert!(!t.engine.can_accept_feedback(other));
	assert!(t.engine.fatal_error(other).is_none());
}

#[test]
fn test_cuts_of_a_context_share_the_budget() {
	let cache = Arc::new(MemoryTileCache::new(16, 4096, LoadMode::Immediate));
	let mut builder = CutRegistryBuilder::new(test_config(8, 1), cache);
	let plain = builder.register_atlas(Atlas::new("plain", 3));
	let busy = builder.register_atlas(Atlas::new("busy", 3).with_weights([(NodeId::ROOT, 5.0)]));
	let plain_cut = builder.register_cut(plain, CTX).unwrap();
	let busy_cut = builder.register_cut(busy, CTX).unwrap();
	let engine = CutUpdate::new(Arc::new(builder.build()));
	let registry = engine.registry();
	let mut dispatcher = engine.dispatcher(CTX).unwrap();

	assert_eq!(dispatcher.dispatch().unwrap().bootstraps, 2);
	engine.feedback(CTX, &feedback_for(registry, CTX, |_| 2), None);
	let stats = dispatcher.dispatch().unwrap();

	assert_eq!(stats.candidates, 2);
	assert_eq!(stats.splits, 1);
	assert_eq!(stats.demoted, 1);
	let ids = |cut: CutId| -> Vec<u64> {
		registry.cut(cut).unwrap().front().cut().iter().map(|n| n.raw()).collect()
	};
	assert_eq!(ids(busy_cut), FIRST_LEVEL);
	assert_eq!(ids(plain_cut), [0]);
}

#[test]
fn test_contexts_have_separate_slot_pools() {
	let cache = Arc::new(MemoryTileCache::new(16, 4096, LoadMode::Immediate));
	let mut builder = CutRegistryBuilder::new(test_config(3, 8), cache);
	let atlas = builder.register_atlas(Atlas::new("shared", 3));
	let left = builder.register_cut(atlas, ContextId(0)).unwrap();
	let right = builder.register_cut(atlas, ContextId(1)).unwrap();
	let engine = CutUpdate::new(Arc::new(builder.build()));
	let registry = engine.registry();

	let mut left_dispatcher = engine.dispatcher(ContextId(0)).unwrap();
	let mut right_dispatcher = engine.dispatcher(ContextId(1)).unwrap();
	left_dispatcher.dispatch().unwrap();
	right_dispatcher.dispatch().unwrap();

	engine.feedback(ContextId(0), &feedback_for(registry, ContextId(0), |_| 2), None);
	left_dispatcher.dispatch().unwrap();

	assert_eq!(registry.cut(left).unwrap().front().cut().len(), 4);
	assert_eq!(registry.cut(right).unwrap().front().cut().len(), 1);
	assert_eq!(registry.lock_slots(ContextId(0)).unwrap().occupied(), 4);
	assert_eq!(registry.lock_slots(ContextId(1)).unwrap().occupied(), 1);
	assert_eq!(engine.allocated_slots(ContextId(1)), vec![0]);
}

#[test]
fn test_dispatch_metrics_are_recorded() {
	let t = TestEngine::roomy(3);
	let mut dispatcher = t.engine.dispatcher(CTX).unwrap();
	split_root(&t, &mut dispatcher);

	let metrics = t.engine.metrics();
	assert_eq!(metrics.dispatches, 2);
	assert_eq!(metrics.splits, 1);
	assert_eq!(metrics.dispatch_us.len(), 2);
	assert!(t.engine.get_dispatch_time() >= 0.0);
}

// =============================================================================
// Threaded engine
// =============================================================================

#[test]
fn test_threads_refine_from_feedback() {
	let mut t = TestEngine::roomy(3);
	t.engine.start().unwrap();
	assert!(t.engine.is_running());

	let reached = wait_until(Duration::from_secs(10), || {
		t.submit(|_| 2);
		t.cut_ids() == FIRST_LEVEL
	});
	assert!(reached, "cut never reached the first level");

	t.engine.stop().unwrap();
	assert!(!t.engine.is_running());
	assert!(!t.engine.can_accept_feedback(CTX));
	assert!(t.engine.fatal_error(CTX).is_none());
}

#[test]
fn test_dispatcher_refused_while_running() {
	let mut t = TestEngine::roomy(3);
	let mut early = t.engine.dispatcher(CTX).unwrap();
	t.engine.start().unwrap();

	assert_eq!(t.engine.dispatcher(CTX).err(), Some(CutError::AlreadyRunning));
	assert_eq!(early.dispatch().err(), Some(CutError::AlreadyRunning));
	assert_eq!(t.engine.start().err(), Some(CutError::AlreadyRunning));
	t.engine.stop().unwrap();
}

#[test]
fn test_fatal_error_stops_context_and_surfaces_from_stop() {
	let mut t = TestEngine::new(3, test_config(8, 8), LoadMode::Deferred);
	t.engine.start().unwrap();
	t.engine.feedback(CTX, &t.uniform_feedback(0), None);

	assert!(wait_until(Duration::from_secs(10), || t.engine.fatal_error(CTX).is_some()));
	assert!(!t.engine.can_accept_feedback(CTX));
	let err = t.engine.stop().unwrap_err();
	assert!(matches!(err, CutError::RootTileUnavailable { .. }));
}

#[test]
fn test_readers_only_see_published_states() {
	let mut t = TestEngine::roomy(4);
	t.engine.start().unwrap();

	let done = Arc::new(AtomicBool::new(false));
	let reader = {
		let registry = Arc::clone(t.registry());
		let cut = t.cut;
		let done = Arc::clone(&done);
		thread::spawn(move || {
			let mut checks = 0u32;
			while !done.load(Ordering::Acquire) {
				let front = registry.cut(cut).unwrap().front();
				assert!(front.is_valid_partition());
				assert!(front.covers_atlas());
				assert!(front.is_fully_bound());
				checks += 1;
			}
			checks
		})
	};

	for frame in 0..200 {
		let target = if (frame / 25) % 2 == 0 { 3 } else { 0 };
		t.submit(|_| target);
		thread::sleep(Duration::from_millis(1));
	}
	done.store(true, Ordering::Release);

	assert!(reader.join().unwrap() > 0);
	t.engine.stop().unwrap();
}
