//! Block-shared tree cache.
//!
//! A cache directive inside a launch stages the tiles of trees
//! `[start_tree, end_tree)` into a scratch buffer shared by the workers
//! of one block. Every worker copies at most one tile, then the block
//! synchronizes; workers past the scratch capacity copy nothing. Later
//! tree accesses through the directive read from the scratch buffer at
//! `offsets[tree] - offsets[start_tree]`.
//!
//! Only unit tiles in the array layout can be cached.

use super::registry::CacheEntry;
use super::{CacheTreesDirective, CompilationUnit, DirectiveId, Packing, ParallelContext};
use crate::diagnostic::Diagnostic;
use crate::ir::builder::FnBuilder;
use crate::ir::{BufferType, Global, MemorySpace, Type, Value};
use crate::model::tiling::SINGLE_NODE_SHAPE;
use crate::model::ScalarType;

/// Name of the module global backing a directive's scratch buffer.
pub fn cache_global_name(directive: DirectiveId) -> String {
    format!("treeCache_{}", directive)
}

pub(crate) fn lower_cache_trees(
    unit: &mut CompilationUnit,
    func: &mut FnBuilder,
    directive: &CacheTreesDirective,
    context: &ParallelContext,
) -> Result<(), Diagnostic> {
    let step = context.loop_step.ok_or_else(|| {
        Diagnostic::fatal(format!(
            "cache directive {} is not inside a parallel loop with a constant step",
            directive.id
        ))
    })?;
    let ids = context.launch.ok_or_else(|| {
        Diagnostic::fatal(format!(
            "cache directive {} is not inside a thread-block launch",
            directive.id
        ))
    })?;
    if step <= 0 {
        return Err(Diagnostic::fatal(format!(
            "cache directive {}: loop step must be positive, got {}",
            directive.id, step
        )));
    }

    let info = unit.registry.get(directive.ensemble)?.clone();
    if info.tree_type.tile_size != 1 {
        return Err(Diagnostic::fatal(format!(
            "cache directive {}: trees with tile size {} cannot be cached",
            directive.id, info.tree_type.tile_size
        ))
        .with_note("tree caching is defined for unit tiles only".to_string()));
    }
    if info.packing != Packing::Array {
        return Err(Diagnostic::fatal(format!(
            "cache directive {}: only array-packed trees can be cached",
            directive.id
        )));
    }

    // Each row of the step may touch a different tree.
    let capacity = (info.max_tree_length * step) as usize;
    let buffer_ty = BufferType::new(vec![capacity as i64], info.model.ty.elem, MemorySpace::Shared);
    let global = cache_global_name(directive.id);
    unit.module.add_global(Global {
        name: global.clone(),
        ty: buffer_ty.clone(),
    })?;
    let scratch = func.get_global(global.as_str(), buffer_ty.clone());

    // ── Tile range ──
    let offsets = info.offsets.value;
    let start_index = func.load(offsets, directive.start_tree);
    let num_trees = func.const_index(info.plan.num_trees() as i64);
    let has_next = func.cmp_lt(directive.end_tree, num_trees);
    let buffer_end = info.plan.model_buffer_size as i64;
    let end_index = func.if_else_value(
        has_next,
        Type::Scalar(ScalarType::Index),
        |b| b.load(offsets, directive.end_tree),
        |b| b.const_index(buffer_end),
    );

    // ── Cooperative copy ──
    let row = func.mul(ids.block[0], ids.thread_ids[1]);
    let worker = func.add(row, ids.thread_ids[0]);
    let live = func.sub(end_index, start_index);
    let active = func.cmp_lt(worker, live);
    // A range wider than the scratch buffer is truncated, not overrun.
    let scratch_size = func.const_index(capacity as i64);
    let in_scratch = func.cmp_lt(worker, scratch_size);
    let model = info.model.value;
    let shape_type = info.tree_type.tile_shape;
    func.if_then(active, |b| {
        b.if_then(in_scratch, |b| {
            let index = b.add(worker, start_index);
            let thresholds = b.load_tile_thresholds(model, index);
            let feature_indices = b.load_tile_feature_indices(model, index);
            let shape = b.const_int(i64::from(SINGLE_NODE_SHAPE), shape_type);
            b.init_tile(scratch, worker, thresholds, feature_indices, Some(shape), None);
        })
    });
    func.barrier();

    log::debug!(
        "cache directive {}: {} scratch tiles in @{} for ensemble {}",
        directive.id,
        capacity,
        global,
        directive.ensemble
    );
    unit.caches.insert(
        directive.id,
        CacheEntry {
            ensemble: directive.ensemble,
            global,
            buffer: scratch,
            buffer_ty,
            start_tree: directive.start_tree,
            start_index,
            end_index,
            capacity,
        },
    )
}

/// `subview scratch[offsets[tree] - offsets[start_tree]][lengths[tree]]`.
pub(crate) fn cached_tree_memref(
    unit: &CompilationUnit,
    func: &mut FnBuilder,
    directive: DirectiveId,
    tree: Value,
) -> Result<Value, Diagnostic> {
    let entry = unit.caches.get(directive)?;
    let info = unit.registry.get(entry.ensemble)?;
    let scratch = func.get_global(entry.global.as_str(), entry.buffer_ty.clone());
    let global_offset = func.load(info.offsets.value, tree);
    let range_start = func.load(info.offsets.value, entry.start_tree);
    let cache_index = func.sub(global_offset, range_start);
    let length = func.load(info.lengths.value, tree);
    let view = func.subview(scratch, cache_index, length);
    if unit.config.insert_debug_helpers {
        func.debug_print("tree", vec![tree, cache_index, length]);
    }
    Ok(view)
}
