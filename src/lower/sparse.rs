//! Sparse representation.
//!
//! Tiles of a tree are laid out in BFS order and every tile carries the
//! tree-local index of its first child tile, so the model buffer holds
//! no holes. Tree views are the same offset/length slices as in the
//! array-based layout; child indices stay valid inside a view because
//! they are relative to the tree's first tile.

use super::globals;
use super::initializer::make_model_initializer;
use super::{
    CompilationUnit, EnsembleConstant, EnsembleLoweringInfo, EnsembleRef, Packing,
    RepresentationStrategy, Target,
};
use crate::diagnostic::Diagnostic;
use crate::ir::builder::FnBuilder;
use crate::ir::{BufferType, Value};

pub struct Sparse {
    target: Target,
}

impl Sparse {
    pub fn new(target: Target) -> Self {
        Self { target }
    }
}

impl RepresentationStrategy for Sparse {
    fn name(&self) -> &'static str {
        match self.target {
            Target::Host => "sparse",
            Target::Device => "gpu_sparse",
        }
    }

    fn target(&self) -> Target {
        self.target
    }

    fn packing(&self) -> Packing {
        Packing::Sparse
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
        match ensemble {
            EnsembleRef::Constant(id) => globals::tree_memref(unit, func, id, tree_index),
            EnsembleRef::Cached(directive) => Err(Diagnostic::fatal(format!(
                "tree access through cache directive {}, but '{}' trees cannot be cached",
                directive,
                self.name()
            ))),
        }
    }
}
