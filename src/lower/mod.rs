//! Representation lowering: from a forest constant to model buffers.
//!
//! A `RepresentationStrategy` decides how an ensemble's trees are packed
//! into buffers for one target, emits the procedures that build and free
//! those buffers, and turns a run-time tree index into a view of the
//! tree's tiles. Four strategies exist, selected once per compilation by
//! name:
//!
//! | name         | packing | target |
//! |--------------|---------|--------|
//! | `array`      | Array   | Host   |
//! | `sparse`     | Sparse  | Host   |
//! | `gpu_array`  | Array   | Device |
//! | `gpu_sparse` | Sparse  | Device |
//!
//! `Lowering` owns the compilation unit the strategy writes into: the
//! emitted module, the registration and cache tables, the configuration
//! and the model serializer.

pub mod array;
pub mod cache;
pub mod globals;
pub mod initializer;
pub mod layout;
pub mod registry;
pub mod sparse;


use std::fmt;

use crate::config::LoweringConfig;
use crate::diagnostic::Diagnostic;
use crate::ir::builder::{FnBuilder, LaunchIds};
use crate::ir::{BufferType, MemorySpace, Module, Procedure, Value};
use crate::model::serialize::{ModelSerializer, TableProvider};
use crate::model::{EnsembleType, Forest, TreeType};

pub use crate::model::tiling::Packing;
pub use registry::{CacheEntry, EnsembleLoweringInfo, RegistrationTable};

// ─── Identities ───────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Target {
    Host,
    Device,
}

impl Target {
    /// Memory space of the buffers a strategy for this target owns.
    pub fn space(self) -> MemorySpace {
        match self {
            Target::Host => MemorySpace::Host,
            Target::Device => MemorySpace::Device,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Host => write!(f, "host"),
            Target::Device => write!(f, "device"),
        }
    }
}

/// Identity of an ensemble constant within one compilation unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EnsembleId(pub u32);

impl fmt::Display for EnsembleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a cache-trees directive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DirectiveId(pub u32);

impl fmt::Display for DirectiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ─── Inputs ───────────────────────────────────────────────────────

/// A forest as it appears in one compilation unit, with its element types.
#[derive(Clone, Debug)]
pub struct EnsembleConstant {
    pub id: EnsembleId,
    pub forest: Forest,
    pub ty: EnsembleType,
}

impl EnsembleConstant {
    /// Every tree gets `tree_type`.
    pub fn new(id: EnsembleId, forest: Forest, tree_type: TreeType) -> Self {
        let ty = EnsembleType::uniform(&forest, tree_type);
        Self { id, forest, ty }
    }
}

/// Where a tree access reads from: the global model buffer of an
/// ensemble, or the scratch buffer a cache directive staged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnsembleRef {
    Constant(EnsembleId),
    Cached(DirectiveId),
}

/// "Stage trees `[start_tree, end_tree)` of `ensemble` into block-shared
/// memory."
#[derive(Clone, Debug)]
pub struct CacheTreesDirective {
    pub id: DirectiveId,
    pub ensemble: EnsembleId,
    pub start_tree: Value,
    pub end_tree: Value,
}

/// Enclosing structure of a cache directive: the constant step of the
/// parallel loop around it and the ids of the launch it runs in.
#[derive(Clone, Copy, Debug, Default)]
pub struct ParallelContext {
    pub loop_step: Option<i64>,
    pub launch: Option<LaunchIds>,
}

/// The serializer collaborator: host arrays, layout and tables.
pub trait Serializer: ModelSerializer + TableProvider {}

impl<T: ModelSerializer + TableProvider> Serializer for T {}

// ─── Compilation unit ─────────────────────────────────────────────

/// State one lowering writes into; dropped with the compilation.
pub struct CompilationUnit {
    pub module: Module,
    pub registry: RegistrationTable,
    pub caches: registry::CacheTable,
    pub config: LoweringConfig,
    pub serializer: Box<dyn Serializer>,
}

impl CompilationUnit {
    pub fn new(config: LoweringConfig, serializer: Box<dyn Serializer>) -> Self {
        Self {
            module: Module::new(),
            registry: RegistrationTable::default(),
            caches: registry::CacheTable::default(),
            config,
            serializer,
        }
    }
}

// ─── Strategy ─────────────────────────────────────────────────────

pub trait RepresentationStrategy {
    fn name(&self) -> &'static str;

    fn target(&self) -> Target;

    fn packing(&self) -> Packing;

    /// Persist the ensemble, append its buffers to `func`'s parameters,
    /// emit the buffer procedures, and register the result.
    fn generate_model_globals(
        &self,
        unit: &mut CompilationUnit,
        func: &mut FnBuilder,
        ensemble: &EnsembleConstant,
    ) -> Result<EnsembleLoweringInfo, Diagnostic>;

    /// Emit the procedure that assembles the composite model buffer from
    /// its per-field arrays.
    fn generate_model_memref_initializer(
        &self,
        unit: &mut CompilationUnit,
        name: &str,
        model_ty: &BufferType,
    ) -> Result<(), Diagnostic>;

    /// View of tree `tree_index`'s tiles.
    fn generate_tree_memref(
        &self,
        unit: &CompilationUnit,
        func: &mut FnBuilder,
        ensemble: EnsembleRef,
        tree_index: Value,
    ) -> Result<Value, Diagnostic>;

    fn lower_cache_trees(
        &self,
        _unit: &mut CompilationUnit,
        _func: &mut FnBuilder,
        directive: &CacheTreesDirective,
        _context: &ParallelContext,
    ) -> Result<(), Diagnostic> {
        Err(Diagnostic::fatal(format!(
            "cache directive {}: tree caching is not supported by the '{}' representation",
            directive.id,
            self.name()
        ))
        .with_help("tree caching needs the 'gpu_array' representation with tile size 1".to_string()))
    }
}

pub const REPRESENTATION_NAMES: [&str; 4] = ["array", "sparse", "gpu_array", "gpu_sparse"];

/// Create a representation strategy by name.
pub fn create_representation(name: &str) -> Option<Box<dyn RepresentationStrategy>> {
    match name {
        "array" => Some(Box::new(array::ArrayBased::new(Target::Host))),
        "sparse" => Some(Box::new(sparse::Sparse::new(Target::Host))),
        "gpu_array" => Some(Box::new(array::ArrayBased::new(Target::Device))),
        "gpu_sparse" => Some(Box::new(sparse::Sparse::new(Target::Device))),
        _ => None,
    }
}

// ─── Session ──────────────────────────────────────────────────────

/// One compilation: the configured strategy and the unit it writes into.
pub struct Lowering {
    representation: Box<dyn RepresentationStrategy>,
    unit: CompilationUnit,
}

impl Lowering {
    pub fn new(config: LoweringConfig, serializer: Box<dyn Serializer>) -> Result<Self, Diagnostic> {
        let representation = create_representation(&config.representation).ok_or_else(|| {
            Diagnostic::fatal(format!("unknown representation '{}'", config.representation))
                .with_help(format!("known representations: {}", REPRESENTATION_NAMES.join(", ")))
        })?;
        log::debug!(
            "lowering with '{}' ({} target, {:?} packing)",
            representation.name(),
            representation.target(),
            representation.packing()
        );
        Ok(Self {
            representation,
            unit: CompilationUnit::new(config, serializer),
        })
    }

    pub fn representation(&self) -> &dyn RepresentationStrategy {
        self.representation.as_ref()
    }

    pub fn unit(&self) -> &CompilationUnit {
        &self.unit
    }

    pub fn generate_model_globals(
        &mut self,
        func: &mut FnBuilder,
        ensemble: &EnsembleConstant,
    ) -> Result<EnsembleLoweringInfo, Diagnostic> {
        self.representation
            .generate_model_globals(&mut self.unit, func, ensemble)
    }

    pub fn generate_tree_memref(
        &self,
        func: &mut FnBuilder,
        ensemble: EnsembleRef,
        tree_index: Value,
    ) -> Result<Value, Diagnostic> {
        self.representation
            .generate_tree_memref(&self.unit, func, ensemble, tree_index)
    }

    pub fn lower_cache_trees(
        &mut self,
        func: &mut FnBuilder,
        directive: &CacheTreesDirective,
        context: &ParallelContext,
    ) -> Result<(), Diagnostic> {
        self.representation
            .lower_cache_trees(&mut self.unit, func, directive, context)
    }

    /// Add a procedure built against the registered buffers, typically
    /// the predict function itself.
    pub fn add_procedure(&mut self, procedure: Procedure) -> Result<(), Diagnostic> {
        self.unit.module.add_procedure(procedure)
    }

    pub fn finish(self) -> Result<Module, Diagnostic> {
        if self.unit.config.verify_async_chains {
            crate::ir::deps::verify_async_chains(&self.unit.module)?;
        }
        Ok(self.unit.module)
    }
}
