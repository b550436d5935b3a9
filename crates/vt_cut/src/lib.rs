//! vt_cut - Feedback-driven quadtree cut maintenance for virtual texturing
//!
//! A virtual texture atlas is a quadtree of fixed-size tiles, far larger than
//! the physical texture that holds the resident subset. For every (rendering
//! context, atlas) pair this crate maintains a *cut*: a partition of the atlas
//! into tiles at varying depths, each bound to a physical memory slot, plus
//! the per-depth index arrays a shader uses to find them.
//!
//! # Features
//!
//! - **Quadtree addressing**: depth, position, parent and children computed
//!   from a 64-bit node id alone
//! - **Double-buffered cuts**: renderers read an immutable front snapshot
//!   while the dispatch thread rewrites the back state
//! - **Budgeted refinement**: splits are ranked by demand and perceptual
//!   weight, limited by upload throughput and free slots
//! - **One thread per context**: feedback wakes the context's dispatch thread
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use vt_cut::{Atlas, ContextId, CutRegistryBuilder, CutUpdate, MemoryTileCache, LoadMode, VtConfig};
//!
//! let config = VtConfig::default();
//! let cache = Arc::new(MemoryTileCache::new(config.tile_bytes(), 4096, LoadMode::Immediate));
//! let mut builder = CutRegistryBuilder::new(config, cache);
//! let atlas = builder.register_atlas(Atlas::new("terrain", 8));
//! let cut = builder.register_cut(atlas, ContextId(0))?;
//!
//! let mut engine = CutUpdate::new(Arc::new(builder.build()));
//! engine.start()?;
//!
//! // each frame: read the front state, report desired depths per slot
//! let front = engine.registry().cut(cut)?.front();
//! engine.feedback(ContextId(0), &desired_depths, None);
//!
//! engine.stop()?;
//! ```

pub mod atlas;
pub mod config;
pub mod cut;
pub mod engine;
pub mod error;
pub mod feedback;
pub mod metrics;
pub mod quadtree;
pub mod registry;
pub mod slots;
pub mod tile_cache;

#[cfg(test)]
pub(crate) mod test_utils;

// Re-export commonly used items
pub use atlas::{Atlas, AtlasId};
pub use config::{VtConfig, ROOT_TILE_PRIORITY};
pub use cut::{ContextId, Cut, CutId, CutState, CutWriter, MAX_INDEXED_LEVELS};
pub use engine::{CutUpdate, DispatchStats, Dispatcher};
pub use error::{ConfigError, CutError};
pub use feedback::{compact_position, FeedbackChannel};
pub use metrics::{DispatchMetrics, TimingWindow};
pub use quadtree::{NodeId, MAX_DEPTH};
pub use registry::{CutRegistry, CutRegistryBuilder};
pub use slots::{IndexEntry, PhysicalLayout, SlotPosition};
pub use tile_cache::{LoadMode, MemoryTileCache, TileBuffer, TileCache};
