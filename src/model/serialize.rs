//! Host-side model serialization.
//!
//! `persist` flattens a forest into the per-field arrays the synthesized
//! initializers copy from. The arrays can be written to disk as an rkyv
//! archive so an execution harness can load them without the model file.

use std::path::Path;

use rayon::prelude::*;
use rkyv::{Archive, Deserialize, Serialize};

use super::tiling::{number_of_outcomes, number_of_tile_shapes, PackedTree, Packing, ShapeTable};
use super::types::{EnsembleType, ScalarType, TreeType};
use super::Forest;
use crate::diagnostic::Diagnostic;
use crate::lower::layout::LayoutPlan;

/// Element type of lookup-table entries.
pub const LUT_ENTRY_TYPE: ScalarType = ScalarType::I8;

/// Flat host arrays for one persisted ensemble.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[rkyv(derive(Debug))]
pub struct SerializedModel {
    /// BLAKE3 fingerprint of the forest these arrays came from.
    pub fingerprint: [u8; 32],
    pub tile_size: u32,
    /// `tile_size` entries per tile.
    pub thresholds: Vec<f64>,
    /// `tile_size` entries per tile.
    pub feature_indices: Vec<i32>,
    pub tile_shape_ids: Vec<i32>,
    /// Sparse packing only; empty otherwise.
    pub child_indices: Vec<i32>,
    pub offsets: Vec<i64>,
    pub lengths: Vec<i64>,
    pub class_ids: Vec<i8>,
    /// Row-major `[shape][outcome]`.
    pub lookup_table: Vec<i8>,
}

impl SerializedModel {
    pub fn num_tiles(&self) -> usize {
        self.tile_shape_ids.len()
    }

    pub fn write_to(&self, path: &Path) -> Result<(), Diagnostic> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map_err(|e| Diagnostic::fatal(format!("cannot archive model: {}", e)))?;
        std::fs::write(path, &bytes)
            .map_err(|e| Diagnostic::fatal(format!("cannot write '{}': {}", path.display(), e)))
    }

    pub fn read_from(path: &Path) -> Result<Self, Diagnostic> {
        let raw = std::fs::read(path)
            .map_err(|e| Diagnostic::fatal(format!("cannot read '{}': {}", path.display(), e)))?;
        let mut bytes = rkyv::util::AlignedVec::<16>::with_capacity(raw.len());
        bytes.extend_from_slice(&raw);
        rkyv::from_bytes::<SerializedModel, rkyv::rancor::Error>(&bytes).map_err(|e| {
            Diagnostic::fatal(format!("'{}' is not a packed model: {}", path.display(), e))
        })
    }
}

// ─── Collaborator traits ──────────────────────────────────────────

/// Supplies the host arrays and layout of a persisted ensemble.
pub trait ModelSerializer: Send {
    /// Flatten `forest` for `ensemble_type`. Must precede buffer synthesis.
    fn persist(
        &mut self,
        forest: &Forest,
        ensemble_type: &EnsembleType,
        packing: Packing,
    ) -> Result<(), Diagnostic>;

    fn layout(&self) -> Result<&LayoutPlan, Diagnostic>;

    fn model(&self) -> Result<&SerializedModel, Diagnostic>;
}

/// Per-tree lengths and the tile-shape lookup table.
pub trait TableProvider {
    fn initialize_length_buffer(
        &self,
        out: &mut [i64],
        tile_size: u32,
        threshold_bits: u32,
        feature_index_bits: u32,
    ) -> Result<(), Diagnostic>;

    fn initialize_lookup_table(
        &self,
        out: &mut [i8],
        tile_size: u32,
        outcome_bits: u32,
    ) -> Result<(), Diagnostic>;
}

// ─── Host implementation ──────────────────────────────────────────

struct Persisted {
    tree_type: TreeType,
    packing: Packing,
    plan: LayoutPlan,
    model: SerializedModel,
}

/// In-process serializer: tiles every tree in parallel and keeps the
/// arrays in memory.
#[derive(Default)]
pub struct HostSerializer {
    persisted: Option<Persisted>,
}

impl HostSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    fn persisted(&self) -> Result<&Persisted, Diagnostic> {
        self.persisted
            .as_ref()
            .ok_or_else(|| Diagnostic::fatal("model tables requested before the forest was persisted"))
    }
}

impl ModelSerializer for HostSerializer {
    fn persist(
        &mut self,
        forest: &Forest,
        ensemble_type: &EnsembleType,
        packing: Packing,
    ) -> Result<(), Diagnostic> {
        let tree_type = ensemble_type.uniform_tree_type()?;
        if ensemble_type.num_trees() != forest.num_trees() {
            return Err(Diagnostic::fatal(format!(
                "ensemble type lists {} trees but the forest has {}",
                ensemble_type.num_trees(),
                forest.num_trees()
            )));
        }
        let fingerprint = forest.fingerprint();
        if let Some(p) = &self.persisted {
            if p.model.fingerprint == fingerprint && p.tree_type == tree_type && p.packing == packing {
                log::debug!("forest already persisted, reusing host arrays");
                return Ok(());
            }
        }

        let tile_size = tree_type.tile_size;
        let shapes = ShapeTable::new(tile_size)?;
        let (plan, tiled) = LayoutPlan::compute_tiled(forest, ensemble_type, packing)?;
        let packed: Vec<PackedTree> = forest
            .trees()
            .par_iter()
            .zip(tiled.par_iter())
            .map(|(tree, tiled)| tiled.pack(tree, packing))
            .collect();

        let mut model = SerializedModel {
            fingerprint,
            tile_size,
            thresholds: Vec::with_capacity(plan.model_buffer_size * tile_size as usize),
            feature_indices: Vec::with_capacity(plan.model_buffer_size * tile_size as usize),
            tile_shape_ids: Vec::with_capacity(plan.model_buffer_size),
            child_indices: Vec::new(),
            offsets: plan.tree_offsets.clone(),
            lengths: plan.tree_lengths.clone(),
            class_ids: if forest.is_multi_class_classifier() {
                forest.class_ids()
            } else {
                Vec::new()
            },
            lookup_table: shapes.lookup_table(),
        };
        for tree in packed {
            model.thresholds.extend(tree.thresholds);
            model.feature_indices.extend(tree.feature_indices);
            model.tile_shape_ids.extend(tree.tile_shape_ids);
            model.child_indices.extend(tree.child_indices);
        }

        log::info!(
            "persisted {} trees into {} tiles of width {} ({:?} packing)",
            forest.num_trees(),
            plan.model_buffer_size,
            tile_size,
            packing
        );
        self.persisted = Some(Persisted {
            tree_type,
            packing,
            plan,
            model,
        });
        Ok(())
    }

    fn layout(&self) -> Result<&LayoutPlan, Diagnostic> {
        Ok(&self.persisted()?.plan)
    }

    fn model(&self) -> Result<&SerializedModel, Diagnostic> {
        Ok(&self.persisted()?.model)
    }
}

impl TableProvider for HostSerializer {
    fn initialize_length_buffer(
        &self,
        out: &mut [i64],
        tile_size: u32,
        threshold_bits: u32,
        feature_index_bits: u32,
    ) -> Result<(), Diagnostic> {
        let p = self.persisted()?;
        let ty = &p.tree_type;
        if tile_size != ty.tile_size
            || threshold_bits != ty.threshold.bit_width()
            || feature_index_bits != ty.feature_index.bit_width()
        {
            return Err(Diagnostic::fatal(format!(
                "length table requested for tile size {} with {}/{}-bit fields, \
                 but the model was persisted with tile size {} and {}/{}",
                tile_size,
                threshold_bits,
                feature_index_bits,
                ty.tile_size,
                ty.threshold,
                ty.feature_index
            )));
        }
        if out.len() != p.plan.tree_lengths.len() {
            return Err(Diagnostic::fatal(format!(
                "length buffer holds {} entries for {} trees",
                out.len(),
                p.plan.tree_lengths.len()
            )));
        }
        out.copy_from_slice(&p.plan.tree_lengths);
        Ok(())
    }

    fn initialize_lookup_table(
        &self,
        out: &mut [i8],
        tile_size: u32,
        outcome_bits: u32,
    ) -> Result<(), Diagnostic> {
        let p = self.persisted()?;
        if tile_size != p.tree_type.tile_size || outcome_bits != LUT_ENTRY_TYPE.bit_width() {
            return Err(Diagnostic::fatal(format!(
                "lookup table requested for tile size {} with {}-bit entries, \
                 but the model was persisted with tile size {} and {}-bit entries",
                tile_size,
                outcome_bits,
                p.tree_type.tile_size,
                LUT_ENTRY_TYPE.bit_width()
            )));
        }
        let expected = number_of_tile_shapes(tile_size) * number_of_outcomes(tile_size);
        if out.len() != expected {
            return Err(Diagnostic::fatal(format!(
                "lookup table buffer holds {} entries, expected {}",
                out.len(),
                expected
            )));
        }
        out.copy_from_slice(&p.model.lookup_table);
        Ok(())
    }
}
