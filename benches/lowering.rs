//! Lowering throughput on synthetic forests.
//!
//! Measures:
//! 1. Host serialization (tiling + packing, parallel over trees)
//! 2. Full lowering per representation, tile size 1 and 4

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use treebeard::model::serialize::{HostSerializer, ModelSerializer};
use treebeard::model::{EnsembleType, Packing, TreeType};
use treebeard::{lower_forest, Forest, LoweringConfig};

/// Forest of complete trees of `depth` levels over 8 features.
fn synthetic_forest(trees: usize, depth: u32) -> Forest {
    let mut forest = Forest::new();
    for f in 0..8 {
        forest.add_feature(format!("f{}", f), "float");
    }
    for t in 0..trees {
        let tree = forest.new_tree();
        let root = tree.new_node(0.5, (t % 8) as i32);
        let mut level = vec![root];
        for d in 1..depth {
            let leaf = d + 1 == depth;
            let mut next = Vec::with_capacity(level.len() * 2);
            for (i, &node) in level.iter().enumerate() {
                let feature = if leaf { -1 } else { ((i + d as usize) % 8) as i32 };
                let l = tree.new_node(i as f64 * 0.25, feature);
                let r = tree.new_node(i as f64 * 0.25 + 0.125, feature);
                tree.set_children(node, l, r);
                next.push(l);
                next.push(r);
            }
            level = next;
        }
    }
    forest
}

fn bench_serialize(c: &mut Criterion) {
    let forest = synthetic_forest(500, 7);
    let mut group = c.benchmark_group("serialize");
    for (packing, tile_size) in [(Packing::Array, 1), (Packing::Sparse, 4)] {
        let ty = EnsembleType::uniform(
            &forest,
            TreeType {
                tile_size,
                ..TreeType::default()
            },
        );
        group.bench_function(format!("{:?}_ts{}", packing, tile_size), |b| {
            b.iter(|| {
                let mut serializer = HostSerializer::new();
                serializer
                    .persist(black_box(&forest), &ty, packing)
                    .map(|_| serializer.model().map(|m| m.num_tiles()).unwrap_or(0))
            })
        });
    }
    group.finish();
}

fn bench_lower(c: &mut Criterion) {
    let forest = synthetic_forest(500, 7);
    let mut group = c.benchmark_group("lower");
    for representation in ["array", "gpu_array", "gpu_sparse"] {
        for tile_size in [1, 4] {
            let config = LoweringConfig {
                representation: representation.to_string(),
                tile_size,
                ..LoweringConfig::default()
            };
            group.bench_function(format!("{}_ts{}", representation, tile_size), |b| {
                b.iter(|| lower_forest(black_box(&forest), &config).map(|l| l.module.procedures.len()))
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_serialize, bench_lower);
criterion_main!(benches);
