//! Virtual texture streaming simulator.
//!
//! Drives the cut update engine with synthetic renderers: every frame each
//! context reads its published cuts, asks for detail around a wandering focus
//! point and submits the result as feedback. A loader thread serves tile
//! requests in batches, so splits have to wait for their children the way
//! they would behind a disk or network cache.
//!
//! ```text
//! vt_sim --contexts 2 --atlas-depth 8 --target-depth 6 --frames 600
//! RUST_LOG=vt_cut=debug vt_sim --config vt.toml
//! ```

mod renderer;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, warn};
use vt_cut::{
	Atlas, ContextId, CutId, CutRegistryBuilder, CutUpdate, LoadMode, MemoryTileCache, VtConfig,
};
use web_time::Instant;

use renderer::{Focus, SimRenderer};

const SIM_TILE_BYTES: usize = 64;

/// Synthetic renderer for the virtual texture cut update.
#[derive(Parser, Debug)]
#[command(name = "vt_sim")]
#[command(about = "Drives the cut update engine with synthetic feedback")]
struct Args {
	/// Engine configuration TOML file (defaults apply when omitted).
	#[arg(short, long)]
	config: Option<PathBuf>,

	/// Number of rendering contexts.
	#[arg(long, default_value_t = 1)]
	contexts: u16,

	/// Quadtree levels of the simulated atlas.
	#[arg(long, default_value_t = 8)]
	atlas_depth: u32,

	/// Frames to simulate.
	#[arg(long, default_value_t = 300)]
	frames: u32,

	/// Frame interval in milliseconds.
	#[arg(long, default_value_t = 16)]
	frame_ms: u64,

	/// Depth requested at the focus point.
	#[arg(long, default_value_t = 6)]
	target_depth: u32,

	/// Tiles the loader serves per batch.
	#[arg(long, default_value_t = 32)]
	loader_batch: usize,
}

fn main() -> Result<()> {
	env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
	let args = Args::parse();

	let config = match &args.config {
		Some(path) => VtConfig::load(path)
			.with_context(|| format!("Failed to load config: {}", path.display()))?,
		None => VtConfig::default(),
	};
	config.validate().context("Invalid configuration")?;
	if args.contexts == 0 {
		bail!("at least one context is required");
	}

	info!(
		"{} context(s), atlas depth {}, {} slots per context, {} splits per dispatch",
		args.contexts,
		args.atlas_depth,
		config.slots_per_context(),
		config.throughput_split_budget()
	);

	// synthetic payloads; capacity covers every context's slots twice over
	let capacity = config.slots_per_context() * usize::from(args.contexts) * 2;
	let cache = Arc::new(MemoryTileCache::new(SIM_TILE_BYTES, capacity, LoadMode::Deferred));
	let mut builder = CutRegistryBuilder::new(config.clone(), cache.clone());
	let atlas = builder.register_atlas(Atlas::new("sim", args.atlas_depth));
	let cuts = (0..args.contexts)
		.map(|ctx| builder.register_cut(atlas, ContextId(ctx)))
		.collect::<Result<Vec<CutId>, _>>()?;
	let registry = Arc::new(builder.build());

	let loader_stop = Arc::new(AtomicBool::new(false));
	let loader = {
		let cache = Arc::clone(&cache);
		let stop = Arc::clone(&loader_stop);
		let batch = args.loader_batch.max(1);
		thread::Builder::new()
			.name("tile-loader".into())
			.spawn(move || cache.run_loader(batch, Duration::from_millis(2), &stop))
			.context("Failed to spawn loader thread")?
	};

	let mut engine = CutUpdate::new(Arc::clone(&registry));
	engine.start()?;

	let mut rng = rand::rng();
	let mut focus = Focus::new(&mut rng);
	let mut renderers: Vec<_> = registry
		.contexts()
		.map(|ctx| SimRenderer::new(ctx, args.target_depth, config.slots_per_context()))
		.collect();

	let frame = Duration::from_millis(args.frame_ms);
	let started = Instant::now();
	for index in 0..args.frames {
		let frame_start = Instant::now();
		focus.step(&mut rng);
		for renderer in &mut renderers {
			renderer.render(&registry, &engine, focus.center);
		}

		if let Some((ctx, err)) = registry
			.contexts()
			.find_map(|ctx| engine.fatal_error(ctx).map(|err| (ctx, err)))
		{
			warn!("context {ctx} failed at frame {index}: {err}");
			break;
		}

		if let Some(rest) = frame.checked_sub(frame_start.elapsed()) {
			thread::sleep(rest);
		}
	}
	let elapsed = started.elapsed();

	let stopped = engine.stop();
	loader_stop.store(true, Ordering::Release);
	if loader.join().is_err() {
		warn!("tile loader panicked");
	}

	report(&registry, &engine, &cuts, &renderers, &cache);
	info!("simulated {} frames in {:.2}s", args.frames, elapsed.as_secs_f32());

	stopped.context("Cut update reported a fatal error")?;
	Ok(())
}

fn report(
	registry: &vt_cut::CutRegistry,
	engine: &CutUpdate,
	cuts: &[CutId],
	renderers: &[SimRenderer],
	cache: &MemoryTileCache,
) {
	for &id in cuts {
		let Ok(cut) = registry.cut(id) else {
			continue;
		};
		let front = cut.front();
		let mut per_depth = vec![0usize; cut.atlas().depth() as usize];
		for node in front.cut() {
			if let Some(count) = per_depth.get_mut(node.depth() as usize) {
				*count += 1;
			}
		}
		info!(
			"cut {id}: {} tiles, generation {}, per depth {:?}, {} slots allocated",
			front.cut().len(),
			cut.generation(),
			per_depth,
			engine.allocated_slots(id.context).len()
		);
		if let Some(stats) = engine.last_dispatch_stats(id.context) {
			info!("cut {id}: last dispatch {stats:?}");
		}
	}

	for renderer in renderers {
		info!(
			"feedback: {} submitted, {} dropped",
			renderer.submitted, renderer.dropped
		);
	}

	let metrics = engine.metrics();
	let (min, max) = metrics.dispatch_us.min_max().unwrap_or_default();
	info!(
		"dispatches: {} ({} frozen), {} splits, {} collapses, {} demoted, {} deferred",
		metrics.dispatches,
		metrics.frozen_dispatches,
		metrics.splits,
		metrics.collapses,
		metrics.demoted,
		metrics.deferred
	);
	info!(
		"dispatch time: last {:.3}ms, avg {:.1}us, min {min}us, max {max}us",
		engine.get_dispatch_time(),
		metrics.dispatch_us.average()
	);
	info!(
		"tile cache: {} resident, {} loads, {} evictions, {} pending",
		cache.resident_count(),
		cache.load_count(),
		cache.eviction_count(),
		cache.pending_count()
	);
}
