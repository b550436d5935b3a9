//! Error types.
//!
//! A tile that is not resident yet is not an error: the tile cache returns
//! `None` and the engine demotes the action to keep. Everything here means
//! the bookkeeping of a cut can no longer be trusted, so a dispatch that hits
//! one of these stops and its context stops with it.

use thiserror::Error;

use crate::atlas::AtlasId;
use crate::cut::{ContextId, CutId};
use crate::quadtree::NodeId;

/// Fatal dispatch error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CutError {
    /// The root tile did not become resident within the bootstrap wait.
    #[error("root tile of atlas `{atlas}` not resident after {timeout_ms} ms")]
    RootTileUnavailable { atlas: String, timeout_ms: u64 },

    /// A node of the cut has no locked memory slot.
    #[error("node {node} of cut {cut} has no memory slot")]
    MissingSlot { cut: CutId, node: NodeId },

    /// A node that stays in the cut is no longer resident in the tile cache.
    #[error("kept node {node} of cut {cut} is not resident in the tile cache")]
    KeptTileLost { cut: CutId, node: NodeId },

    /// A child passed the availability check and vanished before binding.
    #[error("child {node} of cut {cut} was evicted while splitting")]
    ChildEvicted { cut: CutId, node: NodeId },

    /// The slot pool of a context ran dry while binding a tile.
    #[error("context {context} has no free memory slot for node {node}")]
    OutOfSlots { context: ContextId, node: NodeId },

    #[error("unknown context {0}")]
    UnknownContext(ContextId),

    #[error("unknown cut {0}")]
    UnknownCut(CutId),

    #[error("unknown atlas {0}")]
    UnknownAtlas(AtlasId),

    /// The per-level index arrays of a cut over this atlas would not fit.
    #[error("atlas `{atlas}` has {depth} levels, cuts index at most {max}")]
    AtlasTooDeep { atlas: String, depth: u32, max: u32 },

    /// Synchronous dispatch was requested while worker threads own the contexts.
    #[error("cut update engine is already running")]
    AlreadyRunning,

    #[error("failed to spawn dispatch thread for context {context}: {reason}")]
    Spawn { context: ContextId, reason: String },

    #[error("dispatch thread of context {0} panicked")]
    WorkerPanicked(ContextId),
}

/// Configuration loading error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T, E = CutError> = std::result::Result<T, E>;
