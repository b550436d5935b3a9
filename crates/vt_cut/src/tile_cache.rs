//! Tile cache contract and an in-memory implementation.
//!
//! The cut update never loads pixels itself. It asks a [`TileCache`] for the
//! buffer of a tile and gets `None` while the tile is still on its way. The
//! cache is shared by every context thread, so implementations must be
//! internally synchronized.
//!
//! [`MemoryTileCache`] generates tile contents procedurally. It backs the
//! tests, the benchmark and the simulator, and can hold back individual tiles
//! to model cache misses.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;

use web_time::Instant;

use crate::atlas::{Atlas, AtlasId};
use crate::cut::ContextId;
use crate::quadtree::NodeId;

/// Shared, immutable pixel data of one resident tile.
#[derive(Clone)]
pub struct TileBuffer(Arc<[u8]>);

impl TileBuffer {
  pub fn new(data: impl Into<Arc<[u8]>>) -> Self {
    Self(data.into())
  }

  /// Check if both handles point at the same allocation.
  pub fn ptr_eq(&self, other: &Self) -> bool {
    Arc::ptr_eq(&self.0, &other.0)
  }
}

impl Deref for TileBuffer {
  type Target = [u8];

  fn deref(&self) -> &[u8] {
    &self.0
  }
}

impl fmt::Debug for TileBuffer {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TileBuffer").field("len", &self.0.len()).finish()
  }
}

/// Demand-loading tile cache consumed by the cut update.
pub trait TileCache: Send + Sync {
  /// Non-blocking lookup. Marks the tile as used by `context` when resident;
  /// otherwise schedules a load with `priority` and returns None.
  fn get_tile(
    &self,
    atlas: &Atlas,
    node: NodeId,
    priority: f32,
    context: ContextId,
  ) -> Option<TileBuffer>;

  /// Block up to `timeout` for the tile the calling thread requested last.
  ///
  /// Requests made by other threads in the meantime do not change what is
  /// waited for.
  fn wait(&self, timeout: Duration) -> bool;

  /// Release the use of a tile by `context`.
  fn unget_tile(&self, atlas: &Atlas, node: NodeId, context: ContextId);
}

/// How [`MemoryTileCache`] satisfies a miss.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadMode {
  /// Tiles load synchronously inside `get_tile`.
  Immediate,
  /// Misses queue a request; [`MemoryTileCache::load_pending`] serves them.
  Deferred,
}

type TileKey = (AtlasId, NodeId);

struct ResidentTile {
  buffer: TileBuffer,
  users: HashSet<ContextId>,
  last_used: u64,
}

#[derive(Default)]
struct CacheState {
  resident: HashMap<TileKey, ResidentTile>,
  pending: VecDeque<(TileKey, f32)>,
  withheld: HashSet<TileKey>,
  /// Last request of each calling thread.
  last_requested: HashMap<ThreadId, TileKey>,
  tick: u64,
  loads: u64,
  evictions: u64,
}

/// In-memory tile cache with procedural tile contents.
pub struct MemoryTileCache {
  tile_bytes: usize,
  capacity: usize,
  mode: LoadMode,
  state: Mutex<CacheState>,
  loaded: Condvar,
}

impl MemoryTileCache {
  /// Create a cache holding at most `capacity` tiles of `tile_bytes` each.
  ///
  /// Tiles in use by any context are never evicted, so the capacity is a
  /// soft limit.
  pub fn new(tile_bytes: usize, capacity: usize, mode: LoadMode) -> Self {
    Self {
      tile_bytes,
      capacity,
      mode,
      state: Mutex::new(CacheState::default()),
      loaded: Condvar::new(),
    }
  }

  fn lock(&self) -> MutexGuard<'_, CacheState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Hold back a tile: requests for it miss until released again.
  pub fn withhold(&self, atlas: AtlasId, node: NodeId) {
    self.lock().withheld.insert((atlas, node));
  }

  /// Stop holding back a tile.
  pub fn release_withheld(&self, atlas: AtlasId, node: NodeId) {
    self.lock().withheld.remove(&(atlas, node));
  }

  /// Drop a tile immediately, in use or not. Models external eviction.
  pub fn evict(&self, atlas: AtlasId, node: NodeId) -> bool {
    let mut state = self.lock();
    let removed = state.resident.remove(&(atlas, node)).is_some();
    if removed {
      state.evictions += 1;
    }
    removed
  }

  /// Check if a tile is resident.
  pub fn is_resident(&self, atlas: AtlasId, node: NodeId) -> bool {
    self.lock().resident.contains_key(&(atlas, node))
  }

  /// Check if `context` currently uses a tile.
  pub fn is_in_use(&self, atlas: AtlasId, node: NodeId, context: ContextId) -> bool {
    self
      .lock()
      .resident
      .get(&(atlas, node))
      .is_some_and(|tile| tile.users.contains(&context))
  }

  /// Number of resident tiles.
  pub fn resident_count(&self) -> usize {
    self.lock().resident.len()
  }

  /// Number of queued load requests.
  pub fn pending_count(&self) -> usize {
    self.lock().pending.len()
  }

  /// Total tiles loaded since creation.
  pub fn load_count(&self) -> u64 {
    self.lock().loads
  }

  /// Total tiles evicted since creation.
  pub fn eviction_count(&self) -> u64 {
    self.lock().evictions
  }

  /// Serve up to `max` queued requests, highest priority first.
  ///
  /// Returns the number of tiles loaded.
  pub fn load_pending(&self, max: usize) -> usize {
    let mut state = self.lock();
    if state.pending.is_empty() {
      return 0;
    }

    let mut requests: Vec<_> = state.pending.drain(..).collect();
    requests.sort_by(|a, b| b.1.total_cmp(&a.1));

    let mut loaded = 0;
    for (key, priority) in requests {
      if loaded >= max || state.withheld.contains(&key) {
        state.pending.push_back((key, priority));
        continue;
      }
      if !state.resident.contains_key(&key) {
        self.insert_tile(&mut state, key, None);
        loaded += 1;
      }
    }
    drop(state);

    if loaded > 0 {
      self.loaded.notify_all();
    }
    loaded
  }

  /// Serve queued requests in batches until `stop` is raised.
  pub fn run_loader(&self, batch: usize, interval: Duration, stop: &AtomicBool) {
    while !stop.load(Ordering::Acquire) {
      self.load_pending(batch);
      thread::sleep(interval);
    }
  }

  fn insert_tile(
    &self,
    state: &mut CacheState,
    key: TileKey,
    user: Option<ContextId>,
  ) -> TileBuffer {
    state.tick += 1;
    let fill = (key.1.raw() % 251) as u8;
    let buffer = TileBuffer::new(vec![fill; self.tile_bytes]);
    let tile = ResidentTile {
      buffer: buffer.clone(),
      users: user.into_iter().collect(),
      last_used: state.tick,
    };
    state.resident.insert(key, tile);
    state.loads += 1;
    self.evict_unused(state);
    buffer
  }

  fn evict_unused(&self, state: &mut CacheState) {
    while state.resident.len() > self.capacity {
      let victim = state
        .resident
        .iter()
        .filter(|(_, tile)| tile.users.is_empty())
        .min_by_key(|(_, tile)| tile.last_used)
        .map(|(key, _)| *key);
      let Some(key) = victim else {
        break;
      };
      state.resident.remove(&key);
      state.evictions += 1;
    }
  }
}

impl TileCache for MemoryTileCache {
  fn get_tile(
    &self,
    atlas: &Atlas,
    node: NodeId,
    priority: f32,
    context: ContextId,
  ) -> Option<TileBuffer> {
    let key = (atlas.id(), node);
    let mut state = self.lock();
    state.last_requested.insert(thread::current().id(), key);
    state.tick += 1;
    let tick = state.tick;

    if let Some(tile) = state.resident.get_mut(&key) {
      tile.users.insert(context);
      tile.last_used = tick;
      return Some(tile.buffer.clone());
    }

    if state.withheld.contains(&key) || !atlas.contains(node) {
      return None;
    }

    match self.mode {
      LoadMode::Immediate => Some(self.insert_tile(&mut state, key, Some(context))),
      LoadMode::Deferred => {
        if let Some(request) = state.pending.iter_mut().find(|(k, _)| *k == key) {
          request.1 = request.1.max(priority);
        } else {
          state.pending.push_back((key, priority));
        }
        None
      }
    }
  }

  fn wait(&self, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    let caller = thread::current().id();
    let mut state = self.lock();
    loop {
      let Some(&key) = state.last_requested.get(&caller) else {
        return true;
      };
      if state.resident.contains_key(&key) {
        return true;
      }
      let now = Instant::now();
      if now >= deadline {
        return false;
      }
      state = self
        .loaded
        .wait_timeout(state, deadline - now)
        .unwrap_or_else(PoisonError::into_inner)
        .0;
    }
  }

  fn unget_tile(&self, atlas: &Atlas, node: NodeId, context: ContextId) {
    let mut state = self.lock();
    if let Some(tile) = state.resident.get_mut(&(atlas.id(), node)) {
      tile.users.remove(&context);
    }
    self.evict_unused(&mut state);
  }
}

#[cfg(test)]
#[path = "tile_cache_test.rs"]
mod tile_cache_test;
