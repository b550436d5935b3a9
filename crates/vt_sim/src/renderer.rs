//! Synthetic renderer: turns a moving focus point into per-slot feedback.
//!
//! A real renderer rasterizes the scene and reads back, for every resident
//! tile, the depth the sampled texels asked for. Here the desired depth of a
//! tile falls off with its distance to a focus point that wanders over the
//! atlas.

use glam::Vec2;
use rand::Rng;
use vt_cut::{compact_position, ContextId, CutRegistry, CutUpdate, NodeId};

/// Wandering focus point in atlas UV space.
pub struct Focus {
	pub center: Vec2,
	velocity: Vec2,
}

impl Focus {
	pub fn new(rng: &mut impl Rng) -> Self {
		Self {
			center: Vec2::new(rng.random_range(0.2..0.8), rng.random_range(0.2..0.8)),
			velocity: Vec2::new(rng.random_range(-0.01..0.01), rng.random_range(-0.01..0.01)),
		}
	}

	/// Advance one frame, bouncing off the atlas border.
	pub fn step(&mut self, rng: &mut impl Rng) {
		self.velocity += Vec2::new(rng.random_range(-0.002..0.002), rng.random_range(-0.002..0.002));
		self.velocity = self.velocity.clamp_length_max(0.02);
		self.center += self.velocity;
		if !(0.0..=1.0).contains(&self.center.x) {
			self.velocity.x = -self.velocity.x;
		}
		if !(0.0..=1.0).contains(&self.center.y) {
			self.velocity.y = -self.velocity.y;
		}
		self.center = self.center.clamp(Vec2::ZERO, Vec2::ONE);
	}
}

/// Per-context feedback producer.
pub struct SimRenderer {
	context: ContextId,
	target_depth: u32,
	lod: Vec<i32>,
	count: Vec<u32>,
	pub submitted: u64,
	pub dropped: u64,
}

impl SimRenderer {
	pub fn new(context: ContextId, target_depth: u32, slots: usize) -> Self {
		Self {
			context,
			target_depth,
			lod: vec![0; slots],
			count: vec![0; slots],
			submitted: 0,
			dropped: 0,
		}
	}

	/// Depth wanted for `node` given the focus point.
	fn desired_depth(&self, node: NodeId, focus: Vec2) -> i32 {
		let depth = node.depth();
		let size = 1.0 / (1u64 << depth) as f32;
		let pos = node.position();
		let center = Vec2::new(pos.x as f32 + 0.5, pos.y as f32 + 0.5) * size;
		// one level lost per 1/8 of the atlas away from the focus
		let falloff = (center.distance(focus) * 8.0) as i32;
		(self.target_depth as i32 - falloff).max(0)
	}

	/// Read the front states of this context and submit one feedback frame.
	pub fn render(&mut self, registry: &CutRegistry, engine: &CutUpdate, focus: Vec2) {
		if !engine.can_accept_feedback(self.context) {
			self.dropped += 1;
			return;
		}

		self.lod.fill(0);
		self.count.fill(0);
		for cut in registry.cuts_for_context(self.context) {
			let front = cut.front();
			for (&node, &position) in front.locked() {
				let desired = self.desired_depth(node, focus);
				let index = compact_position(position);
				if let (Some(lod), Some(count)) = (self.lod.get_mut(index), self.count.get_mut(index)) {
					*lod = desired;
					*count += 1;
				}
			}
		}

		if engine.feedback(self.context, &self.lod, Some(&self.count)) {
			self.submitted += 1;
		} else {
			self.dropped += 1;
		}
	}
}
