//! Lowering configuration and runtime library resolution.
//!
//! A `treebeard.toml` selects the representation and the packing widths:
//!
//! ```toml
//! [lowering]
//! representation = "gpu_array"
//! tile_size = 1
//! threshold_type = "f64"
//! feature_index_type = "i32"
//! tile_shape_type = "i16"
//! child_index_type = "i32"
//! insert_debug_helpers = false
//! verify_async_chains = true
//!
//! [runtime]
//! library_dir = "/opt/llvm/lib"
//! ```
//!
//! Every key is optional. Code-generation toggles live here rather than
//! in process-wide state and are handed to the lowering session.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::diagnostic::Diagnostic;
use crate::lower::Target;
use crate::model::tiling::MAX_TILE_SIZE;
use crate::model::{ScalarType, TreeType};
use crate::span::Span;


/// Settings of one lowering.
#[derive(Clone, Debug, PartialEq)]
pub struct LoweringConfig {
    /// One of `array`, `sparse`, `gpu_array`, `gpu_sparse`.
    pub representation: String,
    pub tile_size: u32,
    pub threshold_type: ScalarType,
    pub feature_index_type: ScalarType,
    pub tile_shape_type: ScalarType,
    pub child_index_type: ScalarType,
    /// Print tree index, offset and length at every tree access.
    pub insert_debug_helpers: bool,
    /// Reject modules whose async chains are not joined before returning.
    pub verify_async_chains: bool,
    /// Directory holding the runtime support libraries.
    pub library_dir: Option<PathBuf>,
}

impl Default for LoweringConfig {
    fn default() -> Self {
        Self {
            representation: "gpu_array".to_string(),
            tile_size: 1,
            threshold_type: ScalarType::F64,
            feature_index_type: ScalarType::I32,
            tile_shape_type: ScalarType::I16,
            child_index_type: ScalarType::I32,
            insert_debug_helpers: false,
            verify_async_chains: true,
            library_dir: None,
        }
    }
}

// ── Raw TOML shape ──

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    lowering: RawLowering,
    #[serde(default)]
    runtime: RawRuntime,
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RawLowering {
    representation: Option<String>,
    tile_size: Option<u32>,
    threshold_type: Option<String>,
    feature_index_type: Option<String>,
    tile_shape_type: Option<String>,
    child_index_type: Option<String>,
    insert_debug_helpers: Option<bool>,
    verify_async_chains: Option<bool>,
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RawRuntime {
    library_dir: Option<PathBuf>,
}

fn scalar(name: Option<String>, default: ScalarType) -> Result<ScalarType, Diagnostic> {
    match name {
        Some(name) => ScalarType::parse(&name),
        None => Ok(default),
    }
}

impl LoweringConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, Diagnostic> {
        let raw: RawConfig = toml::from_str(source).map_err(|e| {
            let span = e
                .span()
                .map(|r| Span::new(r.start as u32, r.end as u32))
                .unwrap_or_else(Span::dummy);
            Diagnostic::error(format!("invalid lowering config: {}", e.message()), span)
        })?;
        let defaults = Self::default();
        let lowering = raw.lowering;
        let config = Self {
            representation: lowering.representation.unwrap_or(defaults.representation),
            tile_size: lowering.tile_size.unwrap_or(defaults.tile_size),
            threshold_type: scalar(lowering.threshold_type, defaults.threshold_type)?,
            feature_index_type: scalar(lowering.feature_index_type, defaults.feature_index_type)?,
            tile_shape_type: scalar(lowering.tile_shape_type, defaults.tile_shape_type)?,
            child_index_type: scalar(lowering.child_index_type, defaults.child_index_type)?,
            insert_debug_helpers: lowering
                .insert_debug_helpers
                .unwrap_or(defaults.insert_debug_helpers),
            verify_async_chains: lowering
                .verify_async_chains
                .unwrap_or(defaults.verify_async_chains),
            library_dir: raw.runtime.library_dir,
        };
        config.check()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, Diagnostic> {
        let source = std::fs::read_to_string(path).map_err(|e| {
            Diagnostic::error(
                format!("cannot read '{}': {}", path.display(), e),
                Span::dummy(),
            )
        })?;
        Self::from_toml_str(&source)
    }

    /// Reject tile sizes outside `1..=MAX_TILE_SIZE` and non-float thresholds.
    pub fn check(&self) -> Result<(), Diagnostic> {
        if self.tile_size == 0 || self.tile_size > MAX_TILE_SIZE {
            return Err(Diagnostic::fatal(format!(
                "tile size must be between 1 and {}, got {}",
                MAX_TILE_SIZE, self.tile_size
            )));
        }
        if !self.threshold_type.is_float() {
            return Err(Diagnostic::fatal(format!(
                "threshold type must be a float type, got {}",
                self.threshold_type
            )));
        }
        Ok(())
    }

    /// Packing widths every tree is lowered with.
    pub fn tree_type(&self) -> TreeType {
        TreeType {
            result: self.threshold_type,
            threshold: self.threshold_type,
            feature_index: self.feature_index_type,
            tile_size: self.tile_size,
            tile_shape: self.tile_shape_type,
            child_index: self.child_index_type,
        }
    }

    /// Target of the configured representation.
    pub fn target(&self) -> Target {
        if self.representation.starts_with("gpu_") {
            Target::Device
        } else {
            Target::Host
        }
    }
}

// ─── Runtime libraries ────────────────────────────────────────────

pub const RUNNER_UTILS: &str = "libmlir_runner_utils.so";
pub const CUDA_RUNTIME: &str = "libmlir_cuda_runtime.so";

/// Resolved paths of the runtime support libraries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeLibraries {
    pub runner_utils: PathBuf,
    /// Device targets only.
    pub device_runtime: Option<PathBuf>,
}

impl RuntimeLibraries {
    pub fn locate(dir: &Path, target: Target) -> Result<Self, Diagnostic> {
        let find = |file: &str| {
            let path = dir.join(file);
            if path.is_file() {
                Ok(path)
            } else {
                Err(Diagnostic::fatal(format!(
                    "runtime library '{}' not found in '{}'",
                    file,
                    dir.display()
                ))
                .with_help("set [runtime] library_dir to the directory holding the MLIR runtime libraries".to_string()))
            }
        };
        let runner_utils = find(RUNNER_UTILS)?;
        let device_runtime = match target {
            Target::Device => Some(find(CUDA_RUNTIME)?),
            Target::Host => None,
        };
        log::debug!("runtime libraries found in '{}'", dir.display());
        Ok(Self {
            runner_utils,
            device_runtime,
        })
    }
}
