//! CutRegistry - the set of cuts, atlases and slot pools shared by the
//! update engine and its readers.
//!
//! Built once through [`CutRegistryBuilder`]; the topology (atlases, contexts,
//! cuts) is fixed afterwards. Cut contents and slot pools change behind their
//! own locks.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::atlas::{Atlas, AtlasId};
use crate::config::{VtConfig, ROOT_TILE_PRIORITY};
use crate::cut::{ContextId, Cut, CutId, CutWriter, MAX_INDEXED_LEVELS};
use crate::error::{CutError, Result};
use crate::quadtree::NodeId;
use crate::slots::{PhysicalLayout, SlotPool};
use crate::tile_cache::TileCache;

// =============================================================================
// CutRegistryBuilder
// =============================================================================

/// Collects atlases, contexts and cuts before the registry is frozen.
pub struct CutRegistryBuilder {
    config: VtConfig,
    tile_cache: Arc<dyn TileCache>,
    atlases: BTreeMap<AtlasId, Arc<Atlas>>,
    contexts: Vec<ContextId>,
    cuts: Vec<CutId>,
}

impl CutRegistryBuilder {
    pub fn new(config: VtConfig, tile_cache: Arc<dyn TileCache>) -> Self {
        Self {
            config,
            tile_cache,
            atlases: BTreeMap::new(),
            contexts: Vec::new(),
            cuts: Vec::new(),
        }
    }

    /// Register an atlas and return its id.
    pub fn register_atlas(&mut self, atlas: Atlas) -> AtlasId {
        let id = atlas.id();
        self.atlases.insert(id, Arc::new(atlas));
        id
    }

    /// Register a rendering context. Registering twice is a no-op.
    pub fn register_context(&mut self, context: ContextId) {
        if !self.contexts.contains(&context) {
            self.contexts.push(context);
        }
    }

    /// Register the cut of `atlas` for `context`.
    ///
    /// The context is registered on demand. Registering the same pair twice
    /// returns the existing id. Atlases deeper than [`MAX_INDEXED_LEVELS`]
    /// are refused.
    pub fn register_cut(&mut self, atlas: AtlasId, context: ContextId) -> Result<CutId> {
        let entry = self
            .atlases
            .get(&atlas)
            .ok_or(CutError::UnknownAtlas(atlas))?;
        if entry.depth() > MAX_INDEXED_LEVELS {
            return Err(CutError::AtlasTooDeep {
                atlas: entry.name().to_owned(),
                depth: entry.depth(),
                max: MAX_INDEXED_LEVELS,
            });
        }
        self.register_context(context);
        let id = CutId::new(context, atlas);
        if !self.cuts.contains(&id) {
            self.cuts.push(id);
        }
        Ok(id)
    }

    /// Freeze the topology and allocate one slot pool per context.
    pub fn build(self) -> CutRegistry {
        let slots = self.config.slots_per_context();
        let pools = self
            .contexts
            .iter()
            .map(|&ctx| (ctx, Mutex::new(SlotPool::new(slots))))
            .collect();
        let cuts = self
            .cuts
            .iter()
            .map(|&id| {
                let atlas = Arc::clone(&self.atlases[&id.atlas]);
                (id, Cut::new(id, atlas))
            })
            .collect();

        debug!(
            contexts = self.contexts.len(),
            cuts = self.cuts.len(),
            slots_per_context = slots,
            "cut registry built"
        );

        CutRegistry {
            layout: PhysicalLayout::from_config(&self.config),
            config: self.config,
            tile_cache: self.tile_cache,
            atlases: self.atlases,
            cuts,
            pools,
        }
    }
}

// =============================================================================
// CutRegistry
// =============================================================================

/// Shared registry of cuts and per-context slot pools.
pub struct CutRegistry {
    config: VtConfig,
    layout: PhysicalLayout,
    tile_cache: Arc<dyn TileCache>,
    atlases: BTreeMap<AtlasId, Arc<Atlas>>,
    cuts: BTreeMap<CutId, Cut>,
    pools: BTreeMap<ContextId, Mutex<SlotPool>>,
}

impl CutRegistry {
    pub fn config(&self) -> &VtConfig {
        &self.config
    }

    pub fn layout(&self) -> PhysicalLayout {
        self.layout
    }

    pub fn tile_cache(&self) -> &Arc<dyn TileCache> {
        &self.tile_cache
    }

    /// Registered contexts in ascending order.
    pub fn contexts(&self) -> impl Iterator<Item = ContextId> + '_ {
        self.pools.keys().copied()
    }

    /// Registered cut ids in ascending order.
    pub fn cuts(&self) -> impl Iterator<Item = CutId> + '_ {
        self.cuts.keys().copied()
    }

    /// Cuts belonging to one context, in ascending atlas order.
    pub fn cuts_for_context(&self, context: ContextId) -> impl Iterator<Item = &Cut> + '_ {
        self.cuts
            .range(CutId::new(context, AtlasId::MIN)..=CutId::new(context, AtlasId::MAX))
            .map(|(_, cut)| cut)
    }

    pub fn cut(&self, id: CutId) -> Result<&Cut> {
        self.cuts.get(&id).ok_or(CutError::UnknownCut(id))
    }

    pub fn atlas(&self, id: AtlasId) -> Option<&Arc<Atlas>> {
        self.atlases.get(&id)
    }

    pub fn has_context(&self, context: ContextId) -> bool {
        self.pools.contains_key(&context)
    }

    /// Lock the back buffer of a cut.
    pub fn start_writing_cut(&self, id: CutId) -> Result<CutWriter<'_>> {
        Ok(self.cut(id)?.start_writing())
    }

    /// Lock the slot pool of a context.
    pub fn lock_slots(&self, context: ContextId) -> Result<MutexGuard<'_, SlotPool>> {
        let pool = self
            .pools
            .get(&context)
            .ok_or(CutError::UnknownContext(context))?;
        Ok(pool.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Free slots of a context.
    pub fn available_memory(&self, context: ContextId) -> Result<usize> {
        Ok(self.lock_slots(context)?.available())
    }

    /// Total slots of every context combined.
    pub fn size_mem_interleaved(&self) -> usize {
        self.config.slots_per_context() * self.pools.len()
    }

    /// Request every cut's root tile so the bootstrap finds it resident.
    pub fn warm_up_cache(&self) {
        for cut in self.cuts.values() {
            let ctx = cut.id().context;
            // the result is irrelevant; the request alone schedules the load
            let _ = self
                .tile_cache
                .get_tile(cut.atlas(), NodeId::ROOT, ROOT_TILE_PRIORITY, ctx);
        }
    }
}
