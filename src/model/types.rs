//! Element types of a lowered ensemble.
//!
//! `TreeType` records the scalar widths a tree's tiles are packed with;
//! `EnsembleType` is the per-tree list plus the row/result types of the
//! ensemble as it appears in a compilation unit.

use std::fmt;

use super::ReductionType;
use crate::diagnostic::Diagnostic;

// ─── Scalars ──────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScalarType {
    I1,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    /// Target-sized integer used for offsets and lengths.
    Index,
}

impl ScalarType {
    pub fn bit_width(self) -> u32 {
        match self {
            ScalarType::I1 => 1,
            ScalarType::I8 => 8,
            ScalarType::I16 => 16,
            ScalarType::I32 => 32,
            ScalarType::I64 | ScalarType::Index => 64,
            ScalarType::F32 => 32,
            ScalarType::F64 => 64,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, ScalarType::F32 | ScalarType::F64)
    }

    pub fn parse(name: &str) -> Result<Self, Diagnostic> {
        match name {
            "i1" => Ok(ScalarType::I1),
            "i8" => Ok(ScalarType::I8),
            "i16" => Ok(ScalarType::I16),
            "i32" => Ok(ScalarType::I32),
            "i64" => Ok(ScalarType::I64),
            "f32" => Ok(ScalarType::F32),
            "f64" => Ok(ScalarType::F64),
            "index" => Ok(ScalarType::Index),
            _ => Err(Diagnostic::fatal(format!("unknown scalar type '{}'", name))
                .with_help("expected one of: i1, i8, i16, i32, i64, f32, f64, index".to_string())),
        }
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScalarType::I1 => "i1",
            ScalarType::I8 => "i8",
            ScalarType::I16 => "i16",
            ScalarType::I32 => "i32",
            ScalarType::I64 => "i64",
            ScalarType::F32 => "f32",
            ScalarType::F64 => "f64",
            ScalarType::Index => "index",
        };
        write!(f, "{}", name)
    }
}

// ─── Tree / ensemble types ────────────────────────────────────────

/// Packing widths of one tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TreeType {
    pub result: ScalarType,
    pub threshold: ScalarType,
    pub feature_index: ScalarType,
    pub tile_size: u32,
    pub tile_shape: ScalarType,
    pub child_index: ScalarType,
}

impl TreeType {
    /// Same element types, ignoring tile size.
    pub fn same_elements(&self, other: &TreeType) -> bool {
        self.result == other.result
            && self.threshold == other.threshold
            && self.feature_index == other.feature_index
            && self.tile_shape == other.tile_shape
            && self.child_index == other.child_index
    }
}

impl Default for TreeType {
    fn default() -> Self {
        Self {
            result: ScalarType::F64,
            threshold: ScalarType::F64,
            feature_index: ScalarType::I32,
            tile_size: 1,
            tile_shape: ScalarType::I16,
            child_index: ScalarType::I32,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct EnsembleType {
    pub trees: Vec<TreeType>,
    pub num_features: usize,
    pub row_type: ScalarType,
    pub return_type: ScalarType,
    pub reduction: ReductionType,
}

impl EnsembleType {
    /// Every tree gets the same `tree_type`.
    pub fn uniform(forest: &super::Forest, tree_type: TreeType) -> Self {
        Self {
            trees: vec![tree_type; forest.num_trees()],
            num_features: forest.num_features(),
            row_type: tree_type.threshold,
            return_type: tree_type.result,
            reduction: forest.reduction,
        }
    }

    pub fn num_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn tree_type(&self, index: usize) -> Option<&TreeType> {
        self.trees.get(index)
    }

    pub fn all_trees_same_tile_size(&self) -> bool {
        self.trees
            .windows(2)
            .all(|pair| pair[0].tile_size == pair[1].tile_size)
    }

    pub fn all_trees_same_type(&self) -> bool {
        self.trees
            .windows(2)
            .all(|pair| pair[0].same_elements(&pair[1]))
    }

    /// The shared tree type, or a fatal diagnostic if trees disagree.
    pub fn uniform_tree_type(&self) -> Result<TreeType, Diagnostic> {
        let first = self
            .trees
            .first()
            .copied()
            .ok_or_else(|| Diagnostic::fatal("ensemble has no trees"))?;
        if !self.all_trees_same_tile_size() {
            return Err(Diagnostic::fatal(
                "trees of the ensemble have different tile sizes",
            )
            .with_note("array and sparse packing need one tile size per ensemble".to_string()));
        }
        if !self.all_trees_same_type() {
            return Err(Diagnostic::fatal(
                "trees of the ensemble have different element types",
            ));
        }
        Ok(first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_parse_and_display() {
        for name in ["i1", "i8", "i16", "i32", "i64", "f32", "f64", "index"] {
            let ty = ScalarType::parse(name).unwrap();
            assert_eq!(ty.to_string(), name);
        }
        assert!(ScalarType::parse("u32").is_err());
    }

    #[test]
    fn test_bit_widths() {
        assert_eq!(ScalarType::F32.bit_width(), 32);
        assert_eq!(ScalarType::Index.bit_width(), 64);
        assert!(ScalarType::F64.is_float());
        assert!(!ScalarType::I16.is_float());
    }

    #[test]
    fn test_uniform_tree_type_detects_mismatch() {
        let base = TreeType::default();
        let mut ty = EnsembleType {
            trees: vec![base, base],
            num_features: 4,
            row_type: ScalarType::F64,
            return_type: ScalarType::F64,
            reduction: ReductionType::Add,
        };
        assert_eq!(ty.uniform_tree_type().unwrap(), base);

        ty.trees[1].tile_size = 4;
        let err = ty.uniform_tree_type().unwrap_err();
        assert!(err.message.contains("tile sizes"));

        ty.trees[1] = TreeType {
            threshold: ScalarType::F32,
            ..base
        };
        let err = ty.uniform_tree_type().unwrap_err();
        assert!(err.message.contains("element types"));
    }
}
