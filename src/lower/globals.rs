//! Model buffers shared by every representation.
//!
//! `generate_model_globals` persists the forest, appends the model,
//! offset, length, class-info and (tiled) lookup-table buffers to the
//! predict function, emits one initializer per buffer plus the combined
//! cleanup, and registers the result. Array and sparse packing differ
//! only in the model buffer's element type and its initializer.

use super::initializer::{
    make_cleanup, make_initializer, DEALLOC_BUFFERS, INIT_CLASS_IDS, INIT_LENGTHS, INIT_LUT,
    INIT_MODEL, INIT_OFFSETS,
};
use super::registry::{BufferSlot, EnsembleLoweringInfo};
use super::{CompilationUnit, EnsembleConstant, EnsembleId, Packing, RepresentationStrategy};
use crate::diagnostic::Diagnostic;
use crate::ir::builder::FnBuilder;
use crate::ir::{BufferType, ElemType, TileType, Type, Value};
use crate::model::serialize::LUT_ENTRY_TYPE;
use crate::model::tiling::{number_of_outcomes, number_of_tile_shapes};
use crate::model::{ScalarType, TreeType};

/// Element type of the class-info buffer.
pub const CLASS_ID_TYPE: ScalarType = ScalarType::I8;

/// Composite element of the model buffer for `tree_type` and `packing`.
pub fn tile_type(tree_type: &TreeType, packing: Packing) -> TileType {
    TileType {
        tile_size: tree_type.tile_size,
        threshold: tree_type.threshold,
        feature_index: tree_type.feature_index,
        tile_shape: tree_type.tile_shape,
        child_index: (packing == Packing::Sparse).then_some(tree_type.child_index),
    }
}

fn add_slot(func: &mut FnBuilder, ty: BufferType) -> BufferSlot {
    let value = func.add_param(Type::Buffer(ty.clone()));
    BufferSlot {
        value,
        ty,
        arg_index: func.params().len() - 1,
    }
}

pub(crate) fn generate_model_globals(
    strategy: &dyn RepresentationStrategy,
    unit: &mut CompilationUnit,
    func: &mut FnBuilder,
    ensemble: &EnsembleConstant,
) -> Result<EnsembleLoweringInfo, Diagnostic> {
    if unit.registry.contains(ensemble.id) {
        return Err(Diagnostic::fatal(format!(
            "ensemble {} already has model buffers",
            ensemble.id
        )));
    }
    let tree_type = ensemble.ty.uniform_tree_type()?;
    let packing = strategy.packing();
    let target = strategy.target();
    let space = target.space();

    unit.serializer.persist(&ensemble.forest, &ensemble.ty, packing)?;
    let plan = unit.serializer.layout()?.clone();
    let num_trees = plan.num_trees();

    let mut lengths = vec![0i64; num_trees];
    unit.serializer.initialize_length_buffer(
        &mut lengths,
        tree_type.tile_size,
        tree_type.threshold.bit_width(),
        tree_type.feature_index.bit_width(),
    )?;
    let max_tree_length = lengths.iter().copied().max().unwrap_or(0);

    // ── Buffers, in parameter order ──
    let model_ty = BufferType::new(
        vec![plan.model_buffer_size as i64],
        ElemType::Tile(tile_type(&tree_type, packing)),
        space,
    );
    let model = add_slot(func, model_ty);
    let offsets = add_slot(func, BufferType::vector(num_trees, ScalarType::Index, space));
    let lengths_slot = add_slot(func, BufferType::vector(num_trees, ScalarType::Index, space));
    let class_info = add_slot(func, BufferType::vector(plan.class_info_size, CLASS_ID_TYPE, space));
    let lookup_table = if tree_type.tile_size != 1 {
        let shapes = number_of_tile_shapes(tree_type.tile_size);
        let outcomes = number_of_outcomes(tree_type.tile_size);
        let mut table = vec![0i8; shapes * outcomes];
        unit.serializer.initialize_lookup_table(
            &mut table,
            tree_type.tile_size,
            LUT_ENTRY_TYPE.bit_width(),
        )?;
        log::debug!("lookup table: {} shapes x {} outcomes", shapes, outcomes);
        let ty = BufferType::new(
            vec![shapes as i64, outcomes as i64],
            ElemType::Scalar(LUT_ENTRY_TYPE),
            space,
        );
        Some(add_slot(func, ty))
    } else {
        None
    };

    // ── Buffer procedures ──
    strategy.generate_model_memref_initializer(unit, INIT_MODEL, &model.ty)?;
    make_initializer(&mut unit.module, INIT_OFFSETS, &offsets.ty, target)?;
    make_initializer(&mut unit.module, INIT_LENGTHS, &lengths_slot.ty, target)?;
    make_initializer(&mut unit.module, INIT_CLASS_IDS, &class_info.ty, target)?;
    if let Some(lut) = &lookup_table {
        make_initializer(&mut unit.module, INIT_LUT, &lut.ty, target)?;
    }

    let info = EnsembleLoweringInfo {
        model,
        offsets,
        lengths: lengths_slot,
        class_info,
        lookup_table,
        plan,
        max_tree_length,
        tree_type,
        packing,
    };
    let freed: Vec<BufferType> = info.slots().iter().map(|s| s.ty.clone()).collect();
    make_cleanup(&mut unit.module, DEALLOC_BUFFERS, &freed, target)?;

    log::info!(
        "ensemble {}: {} trees in {} tiles via '{}' (tile size {}, max tree length {})",
        ensemble.id,
        num_trees,
        info.plan.model_buffer_size,
        strategy.name(),
        tree_type.tile_size,
        max_tree_length
    );
    unit.registry.insert(ensemble.id, info.clone())?;
    Ok(info)
}

/// `subview model[offsets[tree]][lengths[tree]]`.
pub(crate) fn tree_memref(
    unit: &CompilationUnit,
    func: &mut FnBuilder,
    ensemble: EnsembleId,
    tree: Value,
) -> Result<Value, Diagnostic> {
    let info = unit.registry.get(ensemble)?;
    let offset = func.load(info.offsets.value, tree);
    let length = func.load(info.lengths.value, tree);
    let view = func.subview(info.model.value, offset, length);
    if unit.config.insert_debug_helpers {
        func.debug_print("tree", vec![tree, offset, length]);
    }
    Ok(view)
}
