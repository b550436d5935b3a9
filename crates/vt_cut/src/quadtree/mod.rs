//! Quadtree addressing for the texture atlas.
//!
//! The atlas is an implicit quadtree: node ids encode the path from the root,
//! so depth, grid position, parent and children are all computed on demand.
//!
//! # Depth Convention
//!
//! Depth 0 = the single root tile (coarsest), higher depth = finer detail.
//!
//! ```text
//! Tiles per row = 2^depth
//! First id      = (4^depth - 1) / 3
//! ```

pub mod node;

pub use node::{
  child_of, depth_of, first_id_at_depth, parent_of, position_of, tiles_at_depth, tiles_per_row,
  NodeId, MAX_DEPTH,
};
