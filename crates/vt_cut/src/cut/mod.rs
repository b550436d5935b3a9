//! Cut - the double-buffered drawn partition of one atlas for one context.
//!
//! The update thread of the owning context writes the back buffer under a
//! lock; readers clone an `Arc` of the front buffer and never wait on the
//! writer for longer than the pointer swap at the end of a dispatch.

mod state;

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

pub use state::{CutState, SlotMap, MAX_INDEXED_LEVELS};

use crate::atlas::{Atlas, AtlasId};

/// Rendering context identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
pub struct ContextId(pub u16);

impl fmt::Display for ContextId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "ctx{}", self.0)
  }
}

/// Cut identifier: the (context, atlas) pair.
///
/// Ordered by context first so the cuts of one context are contiguous.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct CutId {
  pub context: ContextId,
  pub atlas: AtlasId,
}

impl CutId {
  pub fn new(context: ContextId, atlas: AtlasId) -> Self {
    Self { context, atlas }
  }
}

impl fmt::Display for CutId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.context, self.atlas)
  }
}

/// Double-buffered cut of one atlas.
pub struct Cut {
  id: CutId,
  atlas: Arc<Atlas>,
  front: RwLock<Arc<CutState>>,
  back: Mutex<CutState>,
  /// Set once the root bootstrap bound the root tile.
  drawn: AtomicBool,
  /// Bumped on every publish.
  generation: AtomicU64,
}

impl Cut {
  pub fn new(id: CutId, atlas: Arc<Atlas>) -> Self {
    let state = CutState::new(atlas.depth());
    Self {
      id,
      atlas,
      front: RwLock::new(Arc::new(state.clone())),
      back: Mutex::new(state),
      drawn: AtomicBool::new(false),
      generation: AtomicU64::new(0),
    }
  }

  pub fn id(&self) -> CutId {
    self.id
  }

  pub fn atlas(&self) -> &Arc<Atlas> {
    &self.atlas
  }

  /// Snapshot of the last published state.
  pub fn front(&self) -> Arc<CutState> {
    Arc::clone(&self.front.read().unwrap_or_else(PoisonError::into_inner))
  }

  /// Check if the root bootstrap has completed.
  pub fn is_drawn(&self) -> bool {
    self.drawn.load(Ordering::Acquire)
  }

  /// Number of publishes so far.
  pub fn generation(&self) -> u64 {
    self.generation.load(Ordering::Acquire)
  }

  /// Lock the back buffer for writing.
  ///
  /// Blocks while another writer holds it; the lock is released when the
  /// returned writer is dropped or [`CutWriter::stop_writing`] is called.
  pub fn start_writing(&self) -> CutWriter<'_> {
    CutWriter {
      cut: self,
      back: self.back.lock().unwrap_or_else(PoisonError::into_inner),
    }
  }
}

impl fmt::Debug for Cut {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Cut")
      .field("id", &self.id)
      .field("atlas", &self.atlas.name())
      .field("drawn", &self.is_drawn())
      .field("generation", &self.generation())
      .finish()
  }
}

/// Exclusive write access to a cut's back buffer.
pub struct CutWriter<'a> {
  cut: &'a Cut,
  back: MutexGuard<'a, CutState>,
}

impl CutWriter<'_> {
  pub fn cut(&self) -> &Cut {
    self.cut
  }

  /// Copy the back buffer into the front buffer.
  ///
  /// Unchanged index levels are shared, not copied.
  pub fn publish(&mut self) {
    let snapshot = Arc::new(self.back.clone());
    *self
      .cut
      .front
      .write()
      .unwrap_or_else(PoisonError::into_inner) = snapshot;
    self.cut.generation.fetch_add(1, Ordering::AcqRel);
  }

  pub fn set_drawn(&mut self) {
    self.cut.drawn.store(true, Ordering::Release);
  }

  /// Release the back buffer lock.
  pub fn stop_writing(self) {}
}

impl Deref for CutWriter<'_> {
  type Target = CutState;

  fn deref(&self) -> &CutState {
    &self.back
  }
}

impl DerefMut for CutWriter<'_> {
  fn deref_mut(&mut self) -> &mut CutState {
    &mut self.back
  }
}
