pub mod config;
pub mod diagnostic;
pub mod ir;
pub mod lower;
pub mod model;
pub mod sim;
pub mod span;

// Re-exports for the CLI and integration tests
pub use config::LoweringConfig;
pub use lower::layout::LayoutPlan;
pub use lower::{EnsembleConstant, EnsembleId, EnsembleRef, Lowering, Target};
pub use model::serialize::{HostSerializer, SerializedModel};
pub use model::Forest;

use diagnostic::Diagnostic;
use ir::builder::FnBuilder;
use ir::Module;
use lower::EnsembleLoweringInfo;

/// Name of the predict skeleton `lower_forest` emits.
pub const PREDICT: &str = "Predict";

/// Result of lowering one forest.
pub struct Lowered {
    pub module: Module,
    pub info: EnsembleLoweringInfo,
    /// Host arrays the initializers copy from.
    pub model: SerializedModel,
}

/// Lower `forest` with `config`: the buffer procedures plus a `Predict`
/// skeleton that owns the model buffers and visits every tree's view.
/// Host targets walk the trees with a loop, device targets launch one
/// block per tree. The walk itself belongs to the inference pipeline.
pub fn lower_forest(forest: &Forest, config: &LoweringConfig) -> Result<Lowered, Diagnostic> {
    forest.validate()?;
    let mut lowering = Lowering::new(config.clone(), Box::new(HostSerializer::new()))?;
    let ensemble = EnsembleConstant::new(EnsembleId(0), forest.clone(), config.tree_type());
    let target = lowering.representation().target();

    let mut func = FnBuilder::new(PREDICT);
    let info = lowering.generate_model_globals(&mut func, &ensemble)?;
    let tree_ref = EnsembleRef::Constant(ensemble.id);
    let zero = func.const_index(0);
    let one = func.const_index(1);
    let num_trees = func.const_index(forest.num_trees() as i64);
    match target {
        Target::Host => {
            func.for_loop(zero, num_trees, one, |b, tree| {
                lowering.generate_tree_memref(b, tree_ref, tree)?;
                b.comment("tree walk");
                Ok::<(), Diagnostic>(())
            })?;
        }
        Target::Device => {
            let start = func.wait_async(vec![]);
            let (done, walked) = func.launch(vec![start], [num_trees, one, one], [one, one, one], |b, ids| {
                lowering.generate_tree_memref(b, tree_ref, ids.block_ids[0])?;
                b.comment("tree walk");
                Ok::<(), Diagnostic>(())
            });
            walked?;
            func.wait(vec![done]);
        }
    }
    func.ret(vec![]);
    lowering.add_procedure(func.finish())?;

    let model = lowering.unit().serializer.model()?.clone();
    let module = lowering.finish()?;
    log::info!(
        "lowered {} trees into {} procedures",
        forest.num_trees(),
        module.procedures.len()
    );
    Ok(Lowered {
        module,
        info,
        model,
    })
}
