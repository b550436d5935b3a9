//! VtConfig - shared configuration for the cut registry and update engine.
//!
//! Loaded from TOML; every field has a default so partial files are valid.
//!
//! ```toml
//! tile_size = 256
//! byte_stride = 4
//! phys_tex_tile_width = 32
//! phys_tex_layers = 2
//! update_throughput_mb = 8
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Priority used when requesting a cut's root tile.
pub const ROOT_TILE_PRIORITY: f32 = 100.0;

/// Configuration for physical tile residency and dispatch timing.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VtConfig {
	/// Tile edge length in texels.
	pub tile_size: u32,
	/// Bytes per texel.
	pub byte_stride: u32,
	/// Tiles per row (and column) of one physical texture layer.
	/// Index entries store the slot coordinates as bytes, so at most 256.
	pub phys_tex_tile_width: u32,
	/// Number of physical texture layers.
	pub phys_tex_layers: u32,
	/// Upload throughput per dispatch in MiB; bounds splits per dispatch.
	pub update_throughput_mb: u32,
	/// Bounded wait of the feedback loop before re-checking the stop flag.
	pub feedback_timeout_ms: u64,
	/// Bounded wait for a cut's root tile during bootstrap.
	pub root_tile_timeout_ms: u64,
}

impl VtConfig {
	/// Default configuration: 256px RGBA tiles, one 32x32 layer, 8 MiB/dispatch.
	pub const DEFAULT: Self = Self {
		tile_size: 256,
		byte_stride: 4,
		phys_tex_tile_width: 32,
		phys_tex_layers: 1,
		update_throughput_mb: 8,
		feedback_timeout_ms: 16,
		root_tile_timeout_ms: 2000,
	};

	/// Parse and validate a TOML document.
	pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
		let config: Self = toml::from_str(source)?;
		config.validate()?;
		Ok(config)
	}

	/// Load and validate a TOML file.
	pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let source = std::fs::read_to_string(path)?;
		Self::from_toml_str(&source)
	}

	/// Reject configurations the index layout cannot represent.
	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.tile_size == 0 || self.byte_stride == 0 {
			return Err(ConfigError::Invalid(
				"tile_size and byte_stride must be non-zero".into(),
			));
		}
		if self.phys_tex_tile_width == 0 || self.phys_tex_tile_width > 256 {
			return Err(ConfigError::Invalid(format!(
				"phys_tex_tile_width must be in 1..=256, got {}",
				self.phys_tex_tile_width
			)));
		}
		if self.phys_tex_layers == 0 || self.phys_tex_layers > 256 {
			return Err(ConfigError::Invalid(format!(
				"phys_tex_layers must be in 1..=256, got {}",
				self.phys_tex_layers
			)));
		}
		Ok(())
	}

	/// Physical slots available to each rendering context.
	#[inline]
	pub fn slots_per_context(&self) -> usize {
		let width = self.phys_tex_tile_width as usize;
		width * width * self.phys_tex_layers as usize
	}

	/// Bytes of one tile.
	#[inline]
	pub fn tile_bytes(&self) -> usize {
		let size = self.tile_size as usize;
		size * size * self.byte_stride as usize
	}

	/// Splits per dispatch the upload throughput allows.
	///
	/// Each split uploads four child tiles.
	pub fn throughput_split_budget(&self) -> usize {
		let texels_per_tile = u64::from(self.tile_size) * u64::from(self.tile_size);
		let bytes = u64::from(self.update_throughput_mb) * 1024 * 1024;
		(bytes / texels_per_tile / u64::from(self.byte_stride) / 4) as usize
	}

	pub fn feedback_timeout(&self) -> Duration {
		Duration::from_millis(self.feedback_timeout_ms)
	}

	pub fn root_tile_timeout(&self) -> Duration {
		Duration::from_millis(self.root_tile_timeout_ms)
	}
}

impl Default for VtConfig {
	fn default() -> Self {
		Self::DEFAULT
	}
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;
