//! Layout planning: buffer sizes and per-tree placement.

use std::fmt;

use rayon::prelude::*;

use crate::diagnostic::Diagnostic;
use crate::model::tiling::{Packing, ShapeTable, TiledTree};
use crate::model::{EnsembleType, Forest};

/// Sizes of the buffers one ensemble lowers to. Offsets are prefix sums
/// of the per-tree tile counts in forest order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayoutPlan {
    pub model_buffer_size: usize,
    pub tree_offsets: Vec<i64>,
    pub tree_lengths: Vec<i64>,
    /// One entry per tree for multi-class classifiers, zero otherwise.
    pub class_info_size: usize,
}

impl LayoutPlan {
    pub fn compute(forest: &Forest, ty: &EnsembleType, packing: Packing) -> Result<Self, Diagnostic> {
        Self::compute_tiled(forest, ty, packing).map(|(plan, _)| plan)
    }

    /// Plan the layout and keep the tiled trees the counts came from, so
    /// the serializer packs exactly what was planned.
    pub fn compute_tiled(
        forest: &Forest,
        ty: &EnsembleType,
        packing: Packing,
    ) -> Result<(Self, Vec<TiledTree>), Diagnostic> {
        let tree_type = ty.uniform_tree_type()?;
        let shapes = ShapeTable::new(tree_type.tile_size)?;
        let tiled = forest
            .trees()
            .par_iter()
            .map(|tree| TiledTree::for_tree(tree, tree_type.tile_size, &shapes))
            .collect::<Result<Vec<_>, _>>()?;
        let counts: Vec<usize> = tiled.iter().map(|t| t.tile_count(packing)).collect();
        let plan = Self::from_tile_counts(&counts, forest.is_multi_class_classifier());
        Ok((plan, tiled))
    }

    pub fn from_tile_counts(counts: &[usize], multi_class: bool) -> Self {
        let mut tree_offsets = Vec::with_capacity(counts.len());
        let mut total = 0usize;
        for &count in counts {
            tree_offsets.push(total as i64);
            total += count;
        }
        Self {
            model_buffer_size: total,
            tree_offsets,
            tree_lengths: counts.iter().map(|&c| c as i64).collect(),
            class_info_size: if multi_class { counts.len() } else { 0 },
        }
    }

    pub fn num_trees(&self) -> usize {
        self.tree_lengths.len()
    }

    /// Largest tile count of any tree; sizes the block-shared tree cache.
    pub fn max_tree_length(&self) -> i64 {
        self.tree_lengths.iter().copied().max().unwrap_or(0)
    }
}

impl fmt::Display for LayoutPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "model buffer: {} tiles", self.model_buffer_size)?;
        writeln!(f, "class info:   {} entries", self.class_info_size)?;
        for (i, (offset, length)) in self.tree_offsets.iter().zip(&self.tree_lengths).enumerate() {
            writeln!(f, "tree {:>4}: offset {:>6}, length {:>4}", i, offset, length)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TreeType;

    fn chain_tree(forest: &mut Forest, depth: usize) {
        let tree = forest.new_tree();
        let mut node = tree.new_node(0.0, 0);
        for d in 0..depth {
            let leaf = tree.new_node(d as f64, -1);
            let next = tree.new_node(1.0, 0);
            tree.set_children(node, leaf, next);
            node = next;
        }
    }

    #[test]
    fn test_boundary_plan() {
        let plan = LayoutPlan::from_tile_counts(&[2, 3, 1], false);
        assert_eq!(plan.tree_offsets, vec![0, 2, 5]);
        assert_eq!(plan.model_buffer_size, 6);
        assert_eq!(plan.class_info_size, 0);
        assert_eq!(plan.max_tree_length(), 3);
    }

    #[test]
    fn test_multi_class_sizes_class_info() {
        let plan = LayoutPlan::from_tile_counts(&[1; 5], true);
        assert_eq!(plan.class_info_size, 5);
    }

    #[test]
    fn test_lengths_sum_to_buffer_size() {
        let mut forest = Forest::new();
        forest.add_feature("x", "float");
        for depth in [0, 1, 3, 2] {
            chain_tree(&mut forest, depth);
        }
        for packing in [Packing::Array, Packing::Sparse] {
            for tile_size in [1, 2, 3] {
                let ty = EnsembleType::uniform(
                    &forest,
                    TreeType {
                        tile_size,
                        ..TreeType::default()
                    },
                );
                let plan = LayoutPlan::compute(&forest, &ty, packing).unwrap();
                let total: i64 = plan.tree_lengths.iter().sum();
                assert_eq!(total as usize, plan.model_buffer_size);
                let mut running = 0;
                for (offset, length) in plan.tree_offsets.iter().zip(&plan.tree_lengths) {
                    assert_eq!(*offset, running);
                    running += length;
                }
            }
        }
    }

    #[test]
    fn test_sparse_chain_counts() {
        let mut forest = Forest::new();
        forest.add_feature("x", "float");
        chain_tree(&mut forest, 2);
        let ty = EnsembleType::uniform(&forest, TreeType::default());
        let plan = LayoutPlan::compute(&forest, &ty, Packing::Sparse).unwrap();
        assert_eq!(plan.tree_lengths, vec![5]);
    }

    #[test]
    fn test_tiled_trees_match_plan() {
        let mut forest = Forest::new();
        forest.add_feature("x", "float");
        for depth in [2, 0, 1] {
            chain_tree(&mut forest, depth);
        }
        let ty = EnsembleType::uniform(&forest, TreeType::default());
        let (plan, tiled) = LayoutPlan::compute_tiled(&forest, &ty, Packing::Sparse).unwrap();
        assert_eq!(tiled.len(), plan.num_trees());
        let counts: Vec<i64> = tiled
            .iter()
            .map(|t| t.tile_count(Packing::Sparse) as i64)
            .collect();
        assert_eq!(counts, plan.tree_lengths);
        assert_eq!(plan, LayoutPlan::compute(&forest, &ty, Packing::Sparse).unwrap());
    }

    #[test]
    fn test_display() {
        let text = LayoutPlan::from_tile_counts(&[2, 3], false).to_string();
        assert!(text.contains("model buffer: 5 tiles"));
        assert!(text.contains("tree    1: offset      2, length    3"));
    }
}
