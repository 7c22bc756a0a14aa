use treebeard::config::LoweringConfig;
use treebeard::diagnostic::Diagnostic;
use treebeard::ir::builder::FnBuilder;
use treebeard::ir::{BufferType, MemorySpace, Type};
use treebeard::lower::cache::cache_global_name;
use treebeard::lower::initializer::{
    DEALLOC_BUFFERS, INIT_CLASS_IDS, INIT_LENGTHS, INIT_MODEL, INIT_OFFSETS,
};
use treebeard::lower::layout::LayoutPlan;
use treebeard::lower::{
    CacheTreesDirective, DirectiveId, EnsembleConstant, EnsembleId, EnsembleRef, Lowering,
    ParallelContext,
};
use treebeard::model::serialize::{
    HostSerializer, ModelSerializer, SerializedModel, TableProvider,
};
use treebeard::model::{EnsembleType, Forest, Packing, ScalarType, TreeType};
use treebeard::sim::{Elem, Machine, Val};
use treebeard::{lower_forest, PREDICT};

/// Serializer with a fixed layout of 2, 3 and 1 tiles; tile `i` has
/// threshold `10 + i` and feature index `i`.
struct FixedLayout {
    plan: Option<LayoutPlan>,
    model: Option<SerializedModel>,
}

impl FixedLayout {
    const COUNTS: [usize; 3] = [2, 3, 1];

    fn new() -> Self {
        Self {
            plan: None,
            model: None,
        }
    }
}

impl ModelSerializer for FixedLayout {
    fn persist(
        &mut self,
        forest: &Forest,
        _ensemble_type: &EnsembleType,
        _packing: Packing,
    ) -> Result<(), Diagnostic> {
        let plan = LayoutPlan::from_tile_counts(&Self::COUNTS, forest.is_multi_class_classifier());
        let tiles = plan.model_buffer_size;
        self.model = Some(SerializedModel {
            fingerprint: forest.fingerprint(),
            tile_size: 1,
            thresholds: (0..tiles).map(|i| 10.0 + i as f64).collect(),
            feature_indices: (0..tiles as i32).collect(),
            tile_shape_ids: vec![0; tiles],
            child_indices: Vec::new(),
            offsets: plan.tree_offsets.clone(),
            lengths: plan.tree_lengths.clone(),
            class_ids: if forest.is_multi_class_classifier() {
                forest.class_ids()
            } else {
                Vec::new()
            },
            lookup_table: Vec::new(),
        });
        self.plan = Some(plan);
        Ok(())
    }

    fn layout(&self) -> Result<&LayoutPlan, Diagnostic> {
        self.plan
            .as_ref()
            .ok_or_else(|| Diagnostic::fatal("not persisted"))
    }

    fn model(&self) -> Result<&SerializedModel, Diagnostic> {
        self.model
            .as_ref()
            .ok_or_else(|| Diagnostic::fatal("not persisted"))
    }
}

impl TableProvider for FixedLayout {
    fn initialize_length_buffer(
        &self,
        out: &mut [i64],
        _tile_size: u32,
        _threshold_bits: u32,
        _feature_index_bits: u32,
    ) -> Result<(), Diagnostic> {
        out.copy_from_slice(&self.layout()?.tree_lengths);
        Ok(())
    }

    fn initialize_lookup_table(
        &self,
        _out: &mut [i8],
        _tile_size: u32,
        _outcome_bits: u32,
    ) -> Result<(), Diagnostic> {
        Err(Diagnostic::fatal("untiled layout has no lookup table"))
    }
}

fn three_trees(num_classes: u32) -> Forest {
    let mut forest = Forest::new();
    forest.add_feature("x", "float");
    for class in 0..3i8 {
        let tree = forest.new_tree();
        tree.new_node(f64::from(class), -1);
        tree.set_class_id(class);
    }
    forest.set_num_classes(num_classes);
    forest
}

fn stub_lowering() -> Lowering {
    Lowering::new(LoweringConfig::default(), Box::new(FixedLayout::new())).unwrap()
}

fn ensemble(forest: Forest) -> EnsembleConstant {
    EnsembleConstant::new(EnsembleId(0), forest, TreeType::default())
}

/// Initialize the four untiled buffers from `model`.
fn initialize(machine: &Machine, model: &SerializedModel) -> Vec<Val> {
    let calls: [(&str, Vec<Val>); 4] = [
        (
            INIT_MODEL,
            vec![
                machine.host_floats(&model.thresholds),
                machine.host_ints(&model.feature_indices),
                machine.host_ints(&model.tile_shape_ids),
            ],
        ),
        (INIT_OFFSETS, vec![machine.host_ints(&model.offsets)]),
        (INIT_LENGTHS, vec![machine.host_ints(&model.lengths)]),
        (INIT_CLASS_IDS, vec![machine.host_ints(&model.class_ids)]),
    ];
    calls
        .into_iter()
        .map(|(name, args)| machine.call(name, args).unwrap().remove(0))
        .collect()
}

fn floats(machine: &Machine, buffer: &Val) -> Vec<f64> {
    machine
        .read(buffer)
        .unwrap()
        .iter()
        .filter_map(Elem::as_float)
        .collect()
}

#[test]
fn test_layout_boundaries() {
    let mut lowering = stub_lowering();
    let mut func = FnBuilder::new(PREDICT);
    let info = lowering
        .generate_model_globals(&mut func, &ensemble(three_trees(0)))
        .unwrap();
    assert_eq!(info.plan.model_buffer_size, 6);
    assert_eq!(info.plan.tree_offsets, vec![0, 2, 5]);
    assert_eq!(info.plan.tree_lengths, vec![2, 3, 1]);
    assert_eq!(info.max_tree_length, 3);
    assert_eq!(info.model.ty.to_string(), "buffer<6xtile<1xf64, i32, i16>, device>");
    assert_eq!(info.class_info.ty.to_string(), "buffer<0xi8, device>");
}

#[test]
fn test_multi_class_class_info() {
    let mut lowering = stub_lowering();
    let mut func = FnBuilder::new(PREDICT);
    let info = lowering
        .generate_model_globals(&mut func, &ensemble(three_trees(3)))
        .unwrap();
    assert_eq!(info.plan.class_info_size, 3);
    assert_eq!(info.class_info.ty.to_string(), "buffer<3xi8, device>");

    let model = lowering.unit().serializer.model().unwrap().clone();
    let module = lowering.finish().unwrap();
    let machine = Machine::new(&module);
    let buffers = initialize(&machine, &model);
    let class_ids: Vec<i64> = machine
        .read(&buffers[3])
        .unwrap()
        .iter()
        .filter_map(Elem::as_int)
        .collect();
    assert_eq!(class_ids, vec![0, 1, 2]);
}

#[test]
fn test_cache_partial_range_on_simulator() {
    let directive_id = DirectiveId(7);
    let scratch_name = cache_global_name(directive_id);
    let mut lowering = stub_lowering();
    let mut func = FnBuilder::new("Stage");
    lowering
        .generate_model_globals(&mut func, &ensemble(three_trees(0)))
        .unwrap();
    let out = func.add_param(Type::Buffer(BufferType::vector(9, ScalarType::F64, MemorySpace::Device)));
    let start_tree = func.const_index(1);
    let end_tree = func.const_index(3);
    let zero = func.const_index(0);
    let one = func.const_index(1);
    let two = func.const_index(2);
    let eight = func.const_index(8);
    let go = func.wait_async(vec![]);
    let directive = CacheTreesDirective {
        id: directive_id,
        ensemble: EnsembleId(0),
        start_tree,
        end_tree,
    };
    let (done, lowered) = func.launch(vec![go], [one, one, one], [eight, one, one], |b, ids| {
        let context = ParallelContext {
            loop_step: Some(4),
            launch: Some(*ids),
        };
        lowering.lower_cache_trees(b, &directive, &context)?;
        let t = ids.thread_ids[0];

        // Raw scratch contents, one slot per worker.
        let scratch_ty = lowering.unit().caches.get(directive_id)?.buffer_ty.clone();
        let scratch = b.get_global(scratch_name.clone(), scratch_ty);
        let staged = b.load_tile_thresholds(scratch, t);
        b.store(staged, out, t);

        // Tree 2 through the cached view lands in the last slot.
        let view = lowering.generate_tree_memref(b, EnsembleRef::Cached(directive_id), two)?;
        let first = b.cmp_lt(t, one);
        b.if_then(first, |b| {
            let root = b.load_tile_thresholds(view, zero);
            b.store(root, out, eight);
        });
        Ok::<(), Diagnostic>(())
    });
    lowered.unwrap();
    func.wait(vec![done]);
    func.ret(vec![out]);
    lowering.add_procedure(func.finish()).unwrap();

    let entry = lowering.unit().caches.get(directive_id).unwrap().clone();
    assert_eq!(entry.capacity, 12);
    assert_eq!(entry.global, scratch_name);
    let model = lowering.unit().serializer.model().unwrap().clone();
    let module = lowering.finish().unwrap();
    let text = module.to_string();
    assert!(text.contains("global @treeCache_7 : buffer<12xtile<1xf64, i32, i16>, shared>"));
    assert!(text.contains("barrier"));
    // end of the last tree falls back to the model size
    assert!(text.contains("const 6 : index"));

    let machine = Machine::new(&module);
    let mut args = initialize(&machine, &model);
    args.push(machine.host_floats(&[0.0; 9]));
    let result = machine.call("Stage", args).unwrap().remove(0);
    // Workers 0..3 stage tiles 2..5; workers 4..7 have nothing to copy.
    assert_eq!(
        floats(&machine, &result),
        vec![12.0, 13.0, 14.0, 15.0, 0.0, 0.0, 0.0, 0.0, 15.0]
    );
}

/// Cache trees `[start, end)` of the fixed layout in one block of shape
/// `block` and return the scratch capacity with the first eight scratch
/// slots, each read back by the worker that owns it.
fn stage(start: i64, end: i64, block: [i64; 3], step: i64) -> (usize, Vec<f64>) {
    let directive_id = DirectiveId(1);
    let mut lowering = stub_lowering();
    let mut func = FnBuilder::new("Stage");
    lowering
        .generate_model_globals(&mut func, &ensemble(three_trees(0)))
        .unwrap();
    let out = func.add_param(Type::Buffer(BufferType::vector(8, ScalarType::F64, MemorySpace::Device)));
    let start_tree = func.const_index(start);
    let end_tree = func.const_index(end);
    let one = func.const_index(1);
    let dims = block.map(|d| func.const_index(d));
    let go = func.wait_async(vec![]);
    let directive = CacheTreesDirective {
        id: directive_id,
        ensemble: EnsembleId(0),
        start_tree,
        end_tree,
    };
    let (done, lowered) = func.launch(vec![go], [one, one, one], dims, |b, ids| {
        let context = ParallelContext {
            loop_step: Some(step),
            launch: Some(*ids),
        };
        lowering.lower_cache_trees(b, &directive, &context)?;
        let entry = lowering.unit().caches.get(directive_id)?;
        let capacity = b.const_index(entry.capacity as i64);
        let scratch = b.get_global(entry.global.clone(), entry.buffer_ty.clone());
        let row = b.mul(ids.block[0], ids.thread_ids[1]);
        let worker = b.add(row, ids.thread_ids[0]);
        let readable = b.cmp_lt(worker, capacity);
        b.if_then(readable, |b| {
            let staged = b.load_tile_thresholds(scratch, worker);
            b.store(staged, out, worker);
        });
        Ok::<(), Diagnostic>(())
    });
    lowered.unwrap();
    func.wait(vec![done]);
    func.ret(vec![out]);
    lowering.add_procedure(func.finish()).unwrap();

    let capacity = lowering.unit().caches.get(directive_id).unwrap().capacity;
    let model = lowering.unit().serializer.model().unwrap().clone();
    let module = lowering.finish().unwrap();
    let machine = Machine::new(&module);
    let mut args = initialize(&machine, &model);
    args.push(machine.host_floats(&[0.0; 8]));
    let result = machine.call("Stage", args).unwrap().remove(0);
    (capacity, floats(&machine, &result))
}

#[test]
fn test_cache_two_dimensional_block() {
    // worker = 2 * thread_y + thread_x covers 0..8 exactly once
    let (capacity, staged) = stage(1, 3, [2, 4, 1], 4);
    assert_eq!(capacity, 12);
    assert_eq!(staged, vec![12.0, 13.0, 14.0, 15.0, 0.0, 0.0, 0.0, 0.0]);
}

#[test]
fn test_cache_range_ending_mid_buffer() {
    // end_tree 2 has a successor, so the range ends at offsets[2] = 5
    let (capacity, staged) = stage(0, 2, [8, 1, 1], 4);
    assert_eq!(capacity, 12);
    assert_eq!(staged, vec![10.0, 11.0, 12.0, 13.0, 14.0, 0.0, 0.0, 0.0]);
}

#[test]
fn test_cache_range_wider_than_scratch_is_truncated() {
    // six live tiles, room for max_tree_length * step = 3
    let (capacity, staged) = stage(0, 3, [8, 1, 1], 1);
    assert_eq!(capacity, 3);
    assert_eq!(staged, vec![10.0, 11.0, 12.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
}

#[test]
fn test_cache_outside_launch_is_fatal() {
    let mut lowering = stub_lowering();
    let mut func = FnBuilder::new("Stage");
    lowering
        .generate_model_globals(&mut func, &ensemble(three_trees(0)))
        .unwrap();
    let start_tree = func.const_index(0);
    let end_tree = func.const_index(1);
    let directive = CacheTreesDirective {
        id: DirectiveId(0),
        ensemble: EnsembleId(0),
        start_tree,
        end_tree,
    };
    let context = ParallelContext {
        loop_step: Some(4),
        launch: None,
    };
    let err = lowering
        .lower_cache_trees(&mut func, &directive, &context)
        .unwrap_err();
    assert!(err.message.contains("launch"));
    assert!(lowering.unit().caches.is_empty());
}

// ─── Whole forests ────────────────────────────────────────────────

fn stumps(count: usize) -> Forest {
    let mut forest = Forest::new();
    forest.add_feature("x", "float");
    forest.add_feature("y", "float");
    for i in 0..count {
        let t = i as f64 + 0.5;
        let tree = forest.new_tree();
        let root = tree.new_node(t, (i % 2) as i32);
        let l = tree.new_node(t + 1.0, -1);
        let r = tree.new_node(t - 1.0, -1);
        tree.set_children(root, l, r);
    }
    forest
}

fn run_predict(representation: &str) {
    let config = LoweringConfig {
        representation: representation.to_string(),
        ..LoweringConfig::default()
    };
    let lowered = lower_forest(&stumps(4), &config).unwrap();
    assert_eq!(lowered.info.plan.tree_offsets, vec![0, 3, 6, 9]);

    let machine = Machine::new(&lowered.module);
    let buffers = initialize(&machine, &lowered.model);
    assert!(machine.call(PREDICT, buffers.clone()).unwrap().is_empty());
    assert_eq!(
        machine.call(DEALLOC_BUFFERS, buffers).unwrap(),
        vec![Val::Int(0)]
    );
}

#[test]
fn test_host_predict_skeleton_runs() {
    run_predict("array");
}

#[test]
fn test_device_predict_skeleton_runs() {
    run_predict("gpu_array");
}

#[test]
fn test_invalid_forest_is_rejected() {
    let mut forest = Forest::new();
    forest.add_feature("x", "float");
    let tree = forest.new_tree();
    let root = tree.new_node(0.5, 3);
    let l = tree.new_node(1.0, -1);
    let r = tree.new_node(2.0, -1);
    tree.set_children(root, l, r);
    let err = lower_forest(&forest, &LoweringConfig::default()).err().unwrap();
    assert!(err.message.contains("feature 3"));
}

#[test]
fn test_packed_model_round_trips_through_disk() {
    let config = LoweringConfig {
        representation: "gpu_sparse".to_string(),
        tile_size: 2,
        ..LoweringConfig::default()
    };
    let lowered = lower_forest(&stumps(3), &config).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.bin");
    lowered.model.write_to(&path).unwrap();
    let loaded = SerializedModel::read_from(&path).unwrap();
    assert_eq!(loaded, lowered.model);
    assert_eq!(loaded.lookup_table.len(), 3 * 4);
}

#[test]
fn test_host_serializer_matches_layout_plan() {
    let forest = stumps(5);
    let ty = EnsembleType::uniform(&forest, TreeType::default());
    let mut serializer = HostSerializer::new();
    serializer.persist(&forest, &ty, Packing::Array).unwrap();
    let plan = LayoutPlan::compute(&forest, &ty, Packing::Array).unwrap();
    assert_eq!(serializer.layout().unwrap(), &plan);
    assert_eq!(serializer.model().unwrap().num_tiles(), plan.model_buffer_size);
}
