//! Test utilities for engine tests.
//!
//! Builds small registries over a [`MemoryTileCache`] and renders feedback
//! the way a renderer would: one desired depth per locked slot.

use std::sync::Arc;
use std::time::Duration;

use web_time::Instant;

use crate::atlas::{Atlas, AtlasId};
use crate::config::VtConfig;
use crate::cut::{ContextId, CutId, CutState};
use crate::engine::CutUpdate;
use crate::quadtree::NodeId;
use crate::registry::{CutRegistry, CutRegistryBuilder};
use crate::tile_cache::{LoadMode, MemoryTileCache};

pub const CTX: ContextId = ContextId(0);

/// Config whose split budget equals `throughput_splits` and whose contexts
/// hold `slot_width * slot_width` slots.
///
/// 256px RGBA tiles make one MiB of throughput exactly one split.
pub fn test_config(slot_width: u32, throughput_splits: u32) -> VtConfig {
  VtConfig {
    tile_size: 256,
    byte_stride: 4,
    phys_tex_tile_width: slot_width,
    phys_tex_layers: 1,
    update_throughput_mb: throughput_splits,
    feedback_timeout_ms: 2,
    root_tile_timeout_ms: 50,
  }
}

/// An engine over a single atlas with one cut in context 0.
pub struct TestEngine {
  pub engine: CutUpdate,
  pub cache: Arc<MemoryTileCache>,
  pub atlas: AtlasId,
  pub cut: CutId,
}

impl TestEngine {
  pub fn new(depth: u32, config: VtConfig, mode: LoadMode) -> Self {
    let cache = Arc::new(MemoryTileCache::new(16, 4096, mode));
    let mut builder = CutRegistryBuilder::new(config, cache.clone());
    let atlas = builder.register_atlas(Atlas::new("test", depth));
    let cut = builder.register_cut(atlas, CTX).unwrap();
    Self {
      engine: CutUpdate::new(Arc::new(builder.build())),
      cache,
      atlas,
      cut,
    }
  }

  /// Depth-`depth` atlas with plenty of slots and budget, immediate loads.
  pub fn roomy(depth: u32) -> Self {
    Self::new(depth, test_config(8, 8), LoadMode::Immediate)
  }

  pub fn registry(&self) -> &Arc<CutRegistry> {
    self.engine.registry()
  }

  pub fn front(&self) -> Arc<CutState> {
    self.registry().cut(self.cut).unwrap().front()
  }

  /// Raw ids of the published cut.
  pub fn cut_ids(&self) -> Vec<u64> {
    self.front().cut().iter().map(|n| n.raw()).collect()
  }

  /// Feedback asking every resident tile for `depth`.
  pub fn uniform_feedback(&self, depth: i32) -> Vec<i32> {
    feedback_for(self.registry(), CTX, |_| depth)
  }

  /// Submit feedback computed from the current front states.
  pub fn submit(&self, desired: impl Fn(NodeId) -> i32) -> bool {
    let lod = feedback_for(self.registry(), CTX, desired);
    self.engine.feedback(CTX, &lod, None)
  }
}

/// Feedback of one context: `desired(node)` at the slot of every node in
/// the front states of its cuts.
pub fn feedback_for(
  registry: &CutRegistry,
  context: ContextId,
  desired: impl Fn(NodeId) -> i32,
) -> Vec<i32> {
  let mut lod = vec![0; registry.config().slots_per_context()];
  for cut in registry.cuts_for_context(context) {
    let front = cut.front();
    for (&node, &position) in front.locked() {
      if let Some(entry) = lod.get_mut(position) {
        *entry = desired(node);
      }
    }
  }
  lod
}

/// Poll `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
  let deadline = Instant::now() + timeout;
  while Instant::now() < deadline {
    if condition() {
      return true;
    }
    std::thread::sleep(Duration::from_millis(1));
  }
  condition()
}
