//! Array-based representation.
//!
//! Every tree occupies a contiguous run of tiles in one model buffer,
//! with the children of tile slot `i` at `i*(tile_size+1)+1+k`. On the
//! device this is also the only representation that can stage trees in
//! block-shared memory.

use super::cache;
use super::globals;
use super::initializer::make_model_initializer;
use super::{
    CacheTreesDirective, CompilationUnit, EnsembleConstant, EnsembleLoweringInfo, EnsembleRef,
    Packing, ParallelContext, RepresentationStrategy, Target,
};
use crate::diagnostic::Diagnostic;
use crate::ir::builder::FnBuilder;
use crate::ir::{BufferType, Value};

pub struct ArrayBased {
    target: Target,
}

impl ArrayBased {
    pub fn new(target: Target) -> Self {
        Self { target }
    }
}

impl RepresentationStrategy for ArrayBased {
    fn name(&self) -> &'static str {
        match self.target {
            Target::Host => "array",
            Target::Device => "gpu_array",
        }
    }

    fn target(&self) -> Target {
        self.target
    }

    fn packing(&self) -> Packing {
        Packing::Array
    }

    fn generate_model_globals(
        &self,
        unit: &mut CompilationUnit,
        func: &mut FnBuilder,
        ensemble: &EnsembleConstant,
    ) -> Result<EnsembleLoweringInfo, Diagnostic> {
        globals::generate_model_globals(self, unit, func, ensemble)
    }

    fn generate_model_memref_initializer(
        &self,
        unit: &mut CompilationUnit,
        name: &str,
        model_ty: &BufferType,
    ) -> Result<(), Diagnostic> {
        make_model_initializer(&mut unit.module, name, model_ty, self.target)
    }

    fn generate_tree_memref(
        &self,
        unit: &CompilationUnit,
        func: &mut FnBuilder,
        ensemble: EnsembleRef,
        tree_index: Value,
    ) -> Result<Value, Diagnostic> {
        match (ensemble, self.target) {
            (EnsembleRef::Constant(id), _) => globals::tree_memref(unit, func, id, tree_index),
            (EnsembleRef::Cached(directive), Target::Device) => {
                cache::cached_tree_memref(unit, func, directive, tree_index)
            }
            (EnsembleRef::Cached(directive), Target::Host) => Err(Diagnostic::fatal(format!(
                "tree access through cache directive {} on the host target",
                directive
            ))),
        }
    }

    fn lower_cache_trees(
        &self,
        unit: &mut CompilationUnit,
        func: &mut FnBuilder,
        directive: &CacheTreesDirective,
        context: &ParallelContext,
    ) -> Result<(), Diagnostic> {
        if self.target == Target::Host {
            return Err(Diagnostic::fatal(format!(
                "cache directive {}: tree caching needs a device target",
                directive.id
            ))
            .with_help("use the 'gpu_array' representation".to_string()));
        }
        cache::lower_cache_trees(unit, func, directive, context)
    }
}
