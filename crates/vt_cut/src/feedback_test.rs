use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::thread;

use super::*;
use crate::quadtree::NodeId;

fn channel() -> FeedbackChannel {
	FeedbackChannel::new(ContextId(0))
}

#[test]
fn test_second_submit_before_consumption_is_dropped() {
	let channel = channel();
	assert!(channel.can_accept_feedback());

	assert!(channel.submit_feedback(&[1, 2, 3], None));
	assert!(!channel.can_accept_feedback());
	assert!(!channel.submit_feedback(&[9, 9, 9], None));

	assert_eq!(channel.consume_feedback().lod, vec![1, 2, 3]);
	assert!(channel.can_accept_feedback());
	assert!(channel.submit_feedback(&[4], None));
	assert_eq!(channel.lock_feedback().lod, vec![4]);
}

#[test]
fn test_submit_while_consumer_reads_is_dropped() {
	let channel = channel();
	let guard = channel.lock_feedback();
	assert!(!channel.submit_feedback(&[1], None));
	drop(guard);
	assert!(!channel.has_new_feedback());
}

#[test]
fn test_submit_after_consumption_is_kept_for_next_dispatch() {
	let channel = channel();
	assert!(channel.submit_feedback(&[1], None));

	let snapshot = channel.consume_feedback();
	assert!(!channel.has_new_feedback());
	assert!(!channel.submit_feedback(&[2], None), "guard held by the consumer");
	assert_eq!(snapshot.lod, vec![1]);
	drop(snapshot);

	// arrives after the read: pending until the next consumption
	assert!(channel.submit_feedback(&[3], None));
	assert!(channel.has_new_feedback());
	assert!(!channel.submit_feedback(&[4], None));
	assert_eq!(channel.consume_feedback().lod, vec![3]);
}

#[test]
fn test_every_accepted_submit_is_consumed_once() {
	let channel = Arc::new(channel());
	let done = Arc::new(AtomicBool::new(false));
	let accepted = Arc::new(Mutex::new(Vec::new()));

	let consumer = {
		let channel = Arc::clone(&channel);
		let done = Arc::clone(&done);
		thread::spawn(move || {
			let mut seen = Vec::new();
			loop {
				if channel.has_new_feedback() {
					seen.push(channel.consume_feedback().lod[0]);
					continue;
				}
				if done.load(Ordering::Acquire) && !channel.has_new_feedback() {
					break;
				}
				thread::yield_now();
			}
			seen
		})
	};

	let producers: Vec<_> = (0..4)
		.map(|producer| {
			let channel = Arc::clone(&channel);
			let accepted = Arc::clone(&accepted);
			thread::spawn(move || {
				for frame in 0..2000 {
					let value = producer * 10_000 + frame;
					if channel.submit_feedback(&[value], None) {
						accepted.lock().unwrap().push(value);
					}
				}
			})
		})
		.collect();
	for producer in producers {
		producer.join().unwrap();
	}
	done.store(true, Ordering::Release);

	let mut seen = consumer.join().unwrap();
	let mut accepted = accepted.lock().unwrap().clone();
	seen.sort_unstable();
	accepted.sort_unstable();
	assert!(!accepted.is_empty());
	assert_eq!(seen, accepted);
}

#[test]
fn test_count_buffer_is_optional() {
	let channel = channel();
	channel.submit_feedback(&[1, 2], Some(&[10, 20]));
	assert_eq!(channel.consume_feedback().count, vec![10, 20]);

	channel.submit_feedback(&[1, 2], None);
	assert!(channel.lock_feedback().count.is_empty());
}

#[test]
fn test_desired_depth_outside_buffer_is_zero() {
	let buffers = FeedbackBuffers {
		lod: vec![3, 5],
		count: Vec::new(),
	};
	assert_eq!(buffers.desired_depth(1), 5);
	assert_eq!(buffers.desired_depth(7), 0);
}

#[test]
fn test_submit_wakes_waiting_thread() {
	let channel = Arc::new(channel());
	let waiter = {
		let channel = Arc::clone(&channel);
		thread::spawn(move || channel.wait_for_wake(Duration::from_secs(5)))
	};
	thread::sleep(Duration::from_millis(10));
	channel.submit_feedback(&[1], None);
	assert!(waiter.join().unwrap());
}

#[test]
fn test_wait_times_out_without_feedback() {
	let channel = channel();
	assert!(!channel.wait_for_wake(Duration::from_millis(5)));
}

#[test]
fn test_shutdown_refuses_feedback_and_wakes() {
	let channel = channel();
	channel.shutdown();
	assert!(!channel.can_accept_feedback());
	assert!(!channel.submit_feedback(&[1], None));
	assert!(channel.wait_for_wake(Duration::from_millis(5)));

	channel.reopen();
	assert!(channel.can_accept_feedback());
}

#[test]
fn test_allocated_slots_track_locked_and_cleared() {
	let channel = channel();
	let mut locked = SlotMap::new();
	locked.insert(NodeId(1), 0);
	locked.insert(NodeId(2), 3);
	channel.update_allocated(&locked, &SlotMap::new());
	assert_eq!(channel.allocated_slots(), vec![0, 3]);

	let mut cleared = SlotMap::new();
	cleared.insert(NodeId(2), 3);
	cleared.insert(NodeId(1), 0);
	let mut locked = SlotMap::new();
	locked.insert(NodeId(0), 0);
	channel.update_allocated(&locked, &cleared);
	assert_eq!(channel.allocated_slots(), vec![0]);
}

#[test]
fn test_first_fatal_error_is_kept() {
	let channel = channel();
	assert!(channel.fatal_error().is_none());
	channel.set_fatal(CutError::AlreadyRunning);
	channel.set_fatal(CutError::WorkerPanicked(ContextId(0)));
	assert_eq!(channel.fatal_error(), Some(CutError::AlreadyRunning));
}
