//! Buffer-initializer synthesis.
//!
//! Each initializer takes host arrays, allocates the target buffer,
//! copies the data in and hands the buffer back. Device variants chain
//! every async op on the previous op's token and join the chain with a
//! blocking `wait` before returning.

use super::Target;
use crate::diagnostic::Diagnostic;
use crate::ir::builder::FnBuilder;
use crate::ir::{BufferType, MemorySpace, Module, TileType, Type, Value};
use crate::model::ScalarType;

pub const INIT_MODEL: &str = "Init_Model";
pub const INIT_OFFSETS: &str = "Init_Offsets";
pub const INIT_LENGTHS: &str = "Init_Lengths";
pub const INIT_CLASS_IDS: &str = "Init_ClassIds";
pub const INIT_LUT: &str = "Init_LUT";
pub const DEALLOC_BUFFERS: &str = "Dealloc_Buffers";

/// Workers per block of the model fill kernel.
pub const THREADS_PER_BLOCK: i64 = 32;

/// `name(host) -> buffer`: allocate, copy, join, return.
pub fn make_initializer(
    module: &mut Module,
    name: &str,
    ty: &BufferType,
    target: Target,
) -> Result<(), Diagnostic> {
    let ty = ty.with_space(target.space());
    let mut b = FnBuilder::new(name).with_results(vec![Type::Buffer(ty.clone())]);
    let input = b.add_param(Type::Buffer(ty.with_space(MemorySpace::Host)));
    let buffer = match target {
        Target::Device => {
            let start = b.wait_async(vec![]);
            let (buffer, allocated) = b.alloc_async(ty, vec![start]);
            let copied = b.memcpy_async(buffer, input, vec![allocated]);
            b.wait(vec![copied]);
            buffer
        }
        Target::Host => {
            let buffer = b.alloc(ty);
            b.memcpy(buffer, input);
            buffer
        }
    };
    b.ret(vec![buffer]);
    module.add_procedure(b.finish())
}

/// Host-side field arrays the model initializer takes, in parameter order:
/// thresholds, feature indices, tile-shape ids, and child indices (sparse).
pub fn model_field_types(model_ty: &BufferType, tile: &TileType) -> Vec<BufferType> {
    let tiles = model_ty.shape.first().copied().unwrap_or(0).max(0) as usize;
    let per_node = tiles * tile.tile_size as usize;
    let mut fields = vec![
        BufferType::vector(per_node, tile.threshold, MemorySpace::Host),
        BufferType::vector(per_node, tile.feature_index, MemorySpace::Host),
        BufferType::vector(tiles, tile.tile_shape, MemorySpace::Host),
    ];
    if let Some(child) = tile.child_index {
        fields.push(BufferType::vector(tiles, child, MemorySpace::Host));
    }
    fields
}

/// Field values of one tile, read from the field buffers at `index`.
struct TileFields {
    thresholds: Value,
    feature_indices: Value,
    tile_shape: Option<Value>,
    child_index: Option<Value>,
}

fn load_tile_fields(b: &mut FnBuilder, fields: &[Value], index: Value, tile: &TileType) -> TileFields {
    TileFields {
        thresholds: b.load_field(fields[0], index, tile.tile_size),
        feature_indices: b.load_field(fields[1], index, tile.tile_size),
        tile_shape: (tile.tile_size != 1).then(|| b.load(fields[2], index)),
        child_index: fields.get(3).map(|&c| b.load(c, index)),
    }
}

/// Composite model-buffer initializer.
///
/// Device: one async alloc+copy per field, a fill kernel of
/// `ceil(n/32)` blocks of 32 workers assembling tile `b*32+t` when it is
/// in range, then the staging buffers are freed and the chain joined.
/// Host: a sequential loop over the tiles.
pub fn make_model_initializer(
    module: &mut Module,
    name: &str,
    model_ty: &BufferType,
    target: Target,
) -> Result<(), Diagnostic> {
    let tile = *model_ty
        .tile_type()
        .ok_or_else(|| Diagnostic::fatal(format!("{} needs a tiled model buffer, got {}", name, model_ty)))?;
    let num_tiles = model_ty
        .num_elements()
        .ok_or_else(|| Diagnostic::fatal(format!("{} needs a statically sized model buffer", name)))?
        as i64;
    let model_ty = model_ty.with_space(target.space());

    let mut b = FnBuilder::new(name).with_results(vec![Type::Buffer(model_ty.clone())]);
    let field_types = model_field_types(&model_ty, &tile);
    let inputs: Vec<Value> = field_types
        .iter()
        .map(|ty| b.add_param(Type::Buffer(ty.clone())))
        .collect();

    let model = match target {
        Target::Device => {
            let start = b.wait_async(vec![]);
            let (model, mut token) = b.alloc_async(model_ty, vec![start]);

            // Tile-shape ids are only staged for tiled models.
            let mut staged = Vec::with_capacity(inputs.len());
            for (i, (&input, ty)) in inputs.iter().zip(&field_types).enumerate() {
                if i == 2 && tile.tile_size == 1 {
                    staged.push(input);
                    continue;
                }
                let (buffer, allocated) = b.alloc_async(ty.with_space(MemorySpace::Device), vec![token]);
                token = b.memcpy_async(buffer, input, vec![allocated]);
                staged.push(buffer);
            }

            let one = b.const_index(1);
            let blocks = b.const_index((num_tiles + THREADS_PER_BLOCK - 1) / THREADS_PER_BLOCK);
            let threads = b.const_index(THREADS_PER_BLOCK);
            let (launched, ()) = b.launch(vec![token], [blocks, one, one], [threads, one, one], |b, ids| {
                let len = b.const_index(num_tiles);
                let first = b.mul(ids.block[0], ids.block_ids[0]);
                let index = b.add(first, ids.thread_ids[0]);
                let in_bounds = b.cmp_lt(index, len);
                b.if_then(in_bounds, |b| {
                    let f = load_tile_fields(b, &staged, index, &tile);
                    b.init_tile(model, index, f.thresholds, f.feature_indices, f.tile_shape, f.child_index);
                });
            });

            let mut token = launched;
            for (i, &buffer) in staged.iter().enumerate() {
                if i == 2 && tile.tile_size == 1 {
                    continue;
                }
                token = b.dealloc_async(buffer, vec![token]);
            }
            b.wait(vec![token]);
            model
        }
        Target::Host => {
            let model = b.alloc(model_ty);
            let zero = b.const_index(0);
            let len = b.const_index(num_tiles);
            let one = b.const_index(1);
            b.for_loop(zero, len, one, |b, index| {
                let f = load_tile_fields(b, &inputs, index, &tile);
                b.init_tile(model, index, f.thresholds, f.feature_indices, f.tile_shape, f.child_index);
            });
            model
        }
    };
    b.ret(vec![model]);
    module.add_procedure(b.finish())
}

/// `name(buffers...) -> i32`: free every buffer in order, join, return 0.
pub fn make_cleanup(
    module: &mut Module,
    name: &str,
    buffers: &[BufferType],
    target: Target,
) -> Result<(), Diagnostic> {
    let mut b = FnBuilder::new(name).with_results(vec![Type::Scalar(ScalarType::I32)]);
    let params: Vec<Value> = buffers
        .iter()
        .map(|ty| b.add_param(Type::Buffer(ty.with_space(target.space()))))
        .collect();
    match target {
        Target::Device => {
            let mut token = b.wait_async(vec![]);
            for &buffer in &params {
                token = b.dealloc_async(buffer, vec![token]);
            }
            b.wait(vec![token]);
        }
        Target::Host => {
            for &buffer in &params {
                b.dealloc(buffer);
            }
        }
    }
    let status = b.const_int(0, ScalarType::I32);
    b.ret(vec![status]);
    module.add_procedure(b.finish())
}
